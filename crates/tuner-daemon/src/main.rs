mod http;
mod mpv;
mod output;
mod tap;

use std::sync::Arc;

use tuner_core::{ControlCommand, CoreEvent, HttpTransport, TunerCore};

use crate::output::MpvOutput;
use crate::tap::FftTap;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let data_dir = tuner_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;

    let log_path = data_dir.join("tuner.log");
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    // RUST_LOG overrides; keep HTTP client internals quiet by default.
    let log_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info,hyper_util=warn,reqwest=warn,hyper=warn".to_string());
    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_env_filter(log_filter.as_str())
        .with_ansi(false)
        .init();

    eprintln!("sw-tuner log: {}", log_path.display());
    tracing::info!("sw-tuner starting…");

    let config = match tuner_proto::config::Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("config: {}, using defaults", e);
            tuner_proto::config::Config::default()
        }
    };
    tracing::info!("registry node: {}", config.server.base_url);

    // ── Collaborators ────────────────────────────────────────────────────────
    let tap = Arc::new(FftTap::new(config.spectrum.fft_size));
    let output = MpvOutput::new(config.playback.default_volume, tap);
    let transport = Arc::new(HttpTransport::default());

    // ── Core ─────────────────────────────────────────────────────────────────
    let (core, event_rx) = TunerCore::new(config.clone(), transport, output);
    let event_tx = core.sender();

    if config.http.enabled {
        http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            core.subscribe(),
            event_tx.clone(),
        );
    }

    let core_task = tokio::spawn(core.run(event_rx));

    // ── Shutdown on Ctrl-C ───────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    tracing::info!("sw-tuner: interrupt received, shutting down");
    if event_tx
        .send(CoreEvent::Command(ControlCommand::Shutdown))
        .await
        .is_err()
    {
        tracing::warn!("core loop already gone");
    }
    core_task.await?;

    tracing::info!("sw-tuner stopped");
    Ok(())
}
