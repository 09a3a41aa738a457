//! Session protocol handler
//!
//! Serves one connection: reads command lines strictly in arrival order and
//! answers each before reading the next. Failures become error envelopes; only
//! a broken connection or QUIT ends the session.

use std::io;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use uuid::Uuid;

use crate::inference::backend::InferenceBackend;
use crate::inference::error::EngineError;
use crate::inference::service::InferenceService;
use crate::inference::streaming::StreamToken;
use crate::server::protocol::{encode_line, Command, Response, TokenMessage};

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Peer closed its side
    Disconnected,
    /// Peer sent QUIT
    Quit,
}

/// Writes one protocol line and flushes it
async fn send<W, T>(writer: &mut W, value: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let line = encode_line(value).map_err(io::Error::other)?;
    writer.write_all(&line).await?;
    writer.flush().await
}

/// Runs the request loop for one connection until disconnect or QUIT
///
/// # Returns
/// * `Ok(SessionEnd)` - How the session finished
/// * `Err(io::Error)` - Reading or writing the connection failed
pub async fn run_session<S, B>(
    stream: S,
    service: &InferenceService<B>,
    id: Uuid,
) -> io::Result<SessionEnd>
where
    S: AsyncRead + AsyncWrite + Unpin,
    B: InferenceBackend,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            tracing::debug!("[{}] client disconnected", id);
            return Ok(SessionEnd::Disconnected);
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
        }
        if buf.iter().all(|b| matches!(b, b' ' | b'\t' | b'\r')) {
            continue;
        }

        let command = match Command::parse_bytes(&buf) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!("[{}] {}", id, e);
                send(&mut writer, &Response::error(e.to_string())).await?;
                continue;
            }
        };

        tracing::info!("[{}] {}", id, command.verb());
        service
            .log()
            .record(format!("Connection {}: {}", id, command.verb()));

        match command {
            Command::Ping => send(&mut writer, &Response::ok("pong")).await?,
            Command::Status => {
                let status = service.status().await;
                send(&mut writer, &Response::ok(status.describe())).await?;
            }
            Command::Load(path) => {
                let response = load(service, path).await;
                send(&mut writer, &response).await?;
            }
            Command::Infer(prompt) => {
                let response = match service.infer(prompt).await {
                    Ok(text) => Response::ok("Inference completed").with_data(text),
                    Err(e) => {
                        tracing::warn!("[{}] inference failed: {}", id, e);
                        Response::error(e.to_string())
                    }
                };
                send(&mut writer, &response).await?;
            }
            Command::InferStream(prompt) => stream_tokens(&mut writer, service, prompt, id).await?,
            Command::Free => {
                service.unload().await;
                send(&mut writer, &Response::ok("Resources freed")).await?;
            }
            Command::Quit => {
                send(&mut writer, &Response::ok("Goodbye")).await?;
                writer.shutdown().await?;
                return Ok(SessionEnd::Quit);
            }
        }
    }
}

async fn load<B: InferenceBackend>(service: &InferenceService<B>, path: String) -> Response {
    match service.load(path).await {
        Ok(_) => Response::ok("Model loaded successfully"),
        Err(EngineError::EmptyPath) => Response::error(EngineError::EmptyPath.to_string()),
        Err(e) => {
            tracing::error!("{}", e);
            Response::error("Failed to load model")
        }
    }
}

/// Relays a streamed generation
///
/// Each token is held back until the next one (or the end) arrives, so the
/// last token message can carry `final`. A generation that produced no text
/// still ends with one empty final token.
async fn stream_tokens<W, B>(
    writer: &mut W,
    service: &InferenceService<B>,
    prompt: String,
    id: Uuid,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    B: InferenceBackend,
{
    let mut rx = service.infer_stream(prompt);
    let mut held: Option<String> = None;

    while let Some(message) = rx.recv().await {
        match message {
            StreamToken::Started { .. } => {
                send(writer, &Response::ok("Starting token generation")).await?;
            }
            StreamToken::Token(piece) => {
                if let Some(previous) = held.replace(piece) {
                    send(writer, &TokenMessage::new(previous, false)).await?;
                }
            }
            StreamToken::Done(summary) => {
                tracing::info!(
                    "[{}] streamed {} tokens ({:?})",
                    id,
                    summary.generated_tokens,
                    summary.stop
                );
                let last = held.take().unwrap_or_default();
                send(writer, &TokenMessage::new(last, true)).await?;
            }
            StreamToken::Error(e) => {
                tracing::warn!("[{}] streaming failed: {}", id, e);
                send(writer, &Response::error(e)).await?;
            }
        }
    }
    Ok(())
}
