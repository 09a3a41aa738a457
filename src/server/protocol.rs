//! Wire protocol
//!
//! Requests are single newline-terminated lines `COMMAND [ARGS]`. Responses
//! are single newline-terminated JSON objects: a status envelope
//! `{"status","message","data"?}` for ordinary commands, and a run of
//! `{"type":"token","token","final"?}` objects for streamed generations.

use std::io;

use serde::{Deserialize, Serialize};
use serde_json::ser::{CharEscape, CompactFormatter, Formatter, Serializer};
use thiserror::Error;

/// Errors raised while parsing a command line
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Malformed command line")]
    Malformed,
}

/// A parsed request line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Load(String),
    Infer(String),
    InferStream(String),
    Status,
    Free,
    Ping,
    Quit,
}

fn is_blank(c: char) -> bool {
    c == ' ' || c == '\t'
}

impl Command {
    /// Parses one line (without its trailing newline)
    ///
    /// The leading word is the verb; for LOAD, INFER and INFER_STREAM the rest
    /// of the line, with leading blanks removed, is the argument. Arguments
    /// may be empty; callers decide how to reject that.
    pub fn parse(line: &str) -> Result<Command, ProtocolError> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let line = line.trim_start_matches(is_blank);

        let (verb, rest) = match line.find(is_blank) {
            Some(i) => (&line[..i], &line[i..]),
            None => (line, ""),
        };
        let argument = rest.trim_start_matches(is_blank).to_string();

        match verb {
            "PING" => Ok(Command::Ping),
            "STATUS" => Ok(Command::Status),
            "LOAD" => Ok(Command::Load(argument)),
            "INFER" => Ok(Command::Infer(argument)),
            "INFER_STREAM" => Ok(Command::InferStream(argument)),
            "FREE" => Ok(Command::Free),
            "QUIT" => Ok(Command::Quit),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }

    /// Parses a raw line that may not be valid UTF-8
    pub fn parse_bytes(line: &[u8]) -> Result<Command, ProtocolError> {
        let line = std::str::from_utf8(line).map_err(|_| ProtocolError::Malformed)?;
        Command::parse(line)
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Command::Load(_) => "LOAD",
            Command::Infer(_) => "INFER",
            Command::InferStream(_) => "INFER_STREAM",
            Command::Status => "STATUS",
            Command::Free => "FREE",
            Command::Ping => "PING",
            Command::Quit => "QUIT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

/// Status envelope sent for every non-streamed reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl Response {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: Status::Ok,
            message: message.into(),
            data: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// One streamed token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub token: String,
    #[serde(rename = "final", default, skip_serializing_if = "is_false")]
    pub is_final: bool,
}

impl TokenMessage {
    pub fn new(token: impl Into<String>, is_final: bool) -> Self {
        Self {
            kind: "token".to_string(),
            token: token.into(),
            is_final,
        }
    }
}

/// Compact JSON, but every control character other than `\n`, `\r` and `\t`
/// goes out as `\u00XX`
#[derive(Debug, Default, Clone, Copy)]
pub struct WireFormatter;

impl Formatter for WireFormatter {
    fn write_char_escape<W>(&mut self, writer: &mut W, char_escape: CharEscape) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        match char_escape {
            CharEscape::Backspace => writer.write_all(b"\\u0008"),
            CharEscape::FormFeed => writer.write_all(b"\\u000c"),
            other => CompactFormatter.write_char_escape(writer, other),
        }
    }
}

/// Serializes `value` as one protocol line, newline included
pub fn encode_line<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = Vec::with_capacity(128);
    let mut serializer = Serializer::with_formatter(&mut buf, WireFormatter);
    value.serialize(&mut serializer)?;
    buf.push(b'\n');
    Ok(buf)
}
