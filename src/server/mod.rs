//! Unix socket server
//!
//! Line protocol codec, per-connection session handler and the acceptor loop.

pub mod acceptor;
pub mod protocol;
pub mod session;

pub use acceptor::BridgeServer;
pub use protocol::{Command, ProtocolError, Response, TokenMessage};
pub use session::{run_session, SessionEnd};

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind socket {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
