//! Diagnostic session log
//!
//! Append-only text file recording lifecycle transitions and generation
//! milestones, one timestamped line per event. It is never read back for
//! recovery. Failing to write it must not disturb request handling, so every
//! I/O error is downgraded to a `tracing` warning.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::storage::StorageError;

const SESSION_BANNER: &str = "==== New Session Started ====";

/// Timestamp prefix used on every log line
pub fn timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Append-only, timestamped event log shared by the service and its sessions
#[derive(Debug)]
pub struct SessionLog {
    path: Option<PathBuf>,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl SessionLog {
    /// Opens (or creates) the log file in append mode and writes a session banner
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "\n\n{} - {}\n", timestamp(), SESSION_BANNER)?;
        writer.flush()?;

        tracing::debug!("Session log opened at {:?}", path);
        Ok(Self {
            path: Some(path),
            writer: Mutex::new(Some(writer)),
        })
    }

    /// A log that records nothing
    pub fn disabled() -> Self {
        Self {
            path: None,
            writer: Mutex::new(None),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Appends one event line and flushes it
    pub fn record(&self, message: impl AsRef<str>) {
        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(writer) = guard.as_mut() else {
            return;
        };

        let result = writeln!(writer, "{} - {}", timestamp(), message.as_ref())
            .and_then(|_| writer.flush());
        if let Err(e) = result {
            tracing::warn!("Failed to write session log: {}", e);
        }
    }

    pub fn flush(&self) {
        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(writer) = guard.as_mut() {
            if let Err(e) = writer.flush() {
                tracing::warn!("Failed to flush session log: {}", e);
            }
        }
    }

    /// Flushes and releases the file; later records are dropped
    pub fn close(&self) {
        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut writer) = guard.take() {
            if let Err(e) = writer.flush() {
                tracing::warn!("Failed to flush session log on close: {}", e);
            }
        }
    }

    /// Whole accumulated log text
    pub fn contents(&self) -> String {
        self.flush();
        match self.path.as_ref().map(fs::read_to_string) {
            Some(Ok(content)) => content,
            _ => "Unable to open log file".to_string(),
        }
    }
}

impl Drop for SessionLog {
    fn drop(&mut self) {
        self.close();
    }
}
