//! Connection acceptor
//!
//! Listens on a Unix domain socket and serves one connection at a time: a
//! session runs to completion before the next connection is accepted.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use tokio::net::UnixListener;
use uuid::Uuid;

use crate::inference::backend::InferenceBackend;
use crate::inference::service::InferenceService;
use crate::server::session::run_session;
use crate::server::ServerError;

pub struct BridgeServer<B: InferenceBackend> {
    listener: UnixListener,
    socket_path: PathBuf,
    service: InferenceService<B>,
}

impl<B: InferenceBackend> BridgeServer<B> {
    /// Binds the socket, replacing a stale socket file left by a previous run
    pub fn bind(socket_path: impl Into<PathBuf>, service: InferenceService<B>) -> Result<Self, ServerError> {
        let socket_path = socket_path.into();

        if socket_path.exists() {
            tracing::debug!("Removing stale socket {}", socket_path.display());
            std::fs::remove_file(&socket_path).map_err(|source| ServerError::Bind {
                path: socket_path.clone(),
                source,
            })?;
        }

        let listener = UnixListener::bind(&socket_path).map_err(|source| ServerError::Bind {
            path: socket_path.clone(),
            source,
        })?;

        tracing::info!("Server listening on {}", socket_path.display());
        service
            .log()
            .record(format!("Server listening on {}", socket_path.display()));

        Ok(Self {
            listener,
            socket_path,
            service,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Serves connections until `shutdown` resolves
    ///
    /// A shutdown during an active session ends that session. On exit the
    /// model is freed and the socket file removed.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let stream = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        tracing::error!("Accept failed: {}", e);
                        continue;
                    }
                },
            };

            let id = Uuid::new_v4();
            tracing::info!("[{}] client connected", id);
            self.service.log().record(format!("Connection {} opened", id));

            tokio::select! {
                _ = &mut shutdown => break,
                result = run_session(stream, &self.service, id) => match result {
                    Ok(end) => tracing::info!("[{}] session ended ({:?})", id, end),
                    Err(e) => tracing::warn!("[{}] session aborted: {}", id, e),
                },
            }
            self.service.log().record(format!("Connection {} closed", id));
        }

        tracing::info!("Shutting down");
        self.service.unload().await;
        self.service.log().record("Server stopped");

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove socket {}: {}", self.socket_path.display(), e);
            }
        }
    }
}
