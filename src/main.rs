//! llama-bridge
//!
//! Serves a local llama.cpp model over a Unix domain socket.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use llama_bridge::inference::{InferenceService, LlamaCppBackend};
use llama_bridge::server::BridgeServer;
use llama_bridge::storage::session_log::SessionLog;
use llama_bridge::storage::settings::{get_settings_path, load_settings, BridgeSettings};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the settings file
    #[arg(short, long, value_name = "FILE", env = "LLAMA_BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Unix socket to listen on
    #[arg(short, long, value_name = "PATH", env = "LLAMA_BRIDGE_SOCKET")]
    socket: Option<PathBuf>,

    /// Diagnostic session log file
    #[arg(long, value_name = "FILE", env = "LLAMA_BRIDGE_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Maximum tokens generated per request
    #[arg(long, env = "LLAMA_BRIDGE_MAX_NEW_TOKENS")]
    max_new_tokens: Option<u32>,

    /// Decoding threads
    #[arg(short, long, env = "LLAMA_BRIDGE_THREADS")]
    threads: Option<u32>,

    /// Context window size
    #[arg(long, env = "LLAMA_BRIDGE_CONTEXT_SIZE")]
    context_size: Option<u32>,

    /// Model to load before accepting connections
    #[arg(short, long, value_name = "FILE", env = "LLAMA_BRIDGE_MODEL")]
    model: Option<PathBuf>,
}

impl Cli {
    fn settings(&self) -> BridgeSettings {
        let config = self.config.clone().or_else(|| get_settings_path().ok());
        let mut settings = load_settings(config.as_deref());

        if let Some(socket) = &self.socket {
            settings.socket_path = socket.clone();
        }
        if let Some(log_file) = &self.log_file {
            settings.log_file = log_file.clone();
        }
        if let Some(n) = self.max_new_tokens {
            settings.max_new_tokens = n;
        }
        if let Some(n) = self.threads {
            settings.threads = n;
        }
        if let Some(n) = self.context_size {
            settings.context_size = n;
        }

        settings.validate();
        settings
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("Failed to register SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let settings = cli.settings();
    tracing::debug!("Settings: {:?}", settings);

    let log = match SessionLog::open(&settings.log_file) {
        Ok(log) => Arc::new(log),
        Err(e) => {
            tracing::warn!(
                "Cannot open session log {}: {}, continuing without it",
                settings.log_file.display(),
                e
            );
            Arc::new(SessionLog::disabled())
        }
    };

    let service = InferenceService::new(LlamaCppBackend::new(), &settings, log.clone());

    if let Some(model) = &cli.model {
        match service.load(model.clone()).await {
            Ok(info) => tracing::info!(
                "Preloaded {} ({} vocab, {} ctx)",
                info.path.display(),
                info.vocab_size,
                info.context_size
            ),
            Err(e) => tracing::error!("Failed to preload {}: {}", model.display(), e),
        }
    }

    let server = match BridgeServer::bind(&settings.socket_path, service) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("{}", e);
            log.record(format!("ERROR: {}", e));
            log.close();
            return ExitCode::FAILURE;
        }
    };

    server.run_until(shutdown_signal()).await;
    log.close();
    ExitCode::SUCCESS
}
