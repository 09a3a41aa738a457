//! Streaming output types
//!
//! Messages passed from a background generation to the connection writing
//! them out, and the decoder that turns raw token pieces into UTF-8 text.

use crate::inference::engine::GenerationSummary;

/// Event emitted by a streaming generation
#[derive(Debug, Clone, PartialEq)]
pub enum StreamToken {
    /// Prefill and the first decode step succeeded; tokens follow
    Started { prompt_tokens: usize },
    /// Text of one generated piece
    Token(String),
    /// Generation finished (possibly early after a backend failure)
    Done(GenerationSummary),
    /// Generation failed before any token was produced
    Error(String),
}

/// Accumulates token bytes until they form valid UTF-8
///
/// Multi-byte characters are often split over several tokens; emitting each
/// piece on its own would produce replacement characters on the client side.
#[derive(Debug, Default)]
pub struct Utf8PieceDecoder {
    pending: Vec<u8>,
}

impl Utf8PieceDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the bytes of one token, returning whatever text became complete
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);

        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // Invalid sequence: it will never complete, replace it
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        // Incomplete suffix: keep it for the next token
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }

        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    /// Flush bytes still buffered when generation stops
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let s = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(s)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}
