//! llama-bridge library
//!
//! Local inference bridge around llama.cpp: a single lock-guarded model,
//! greedy text generation, and a line-oriented JSON protocol served over a
//! Unix domain socket.

pub mod inference;
pub mod server;
pub mod storage;
pub mod types;
