//! `AudioOutput` backed by a single mpv process.
//!
//! mpv is spawned lazily on the first `play` and respawned if it has died.
//! `play` resolves once mpv reports `file-loaded` for the requested url, or
//! fails on an `end-file` with reason `error`/`network`.  The same end-file
//! arriving after a successful start is reported through the failure hook.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use tuner_core::{AudioOutput, FailureHook, PlaybackError, SpectrumTap};

use crate::mpv::{MpvDriver, MpvEvent, MpvHandle};
use crate::tap::FftTap;

const START_TIMEOUT: Duration = Duration::from_secs(10);

/// What mpv is supposed to be doing right now.
#[derive(Default)]
struct Session {
    url: Option<String>,
    starting: Option<oneshot::Sender<Result<(), PlaybackError>>>,
}

impl Session {
    fn clear(&mut self) {
        self.url = None;
        self.starting = None;
    }
}

pub struct MpvOutput {
    driver: MpvDriver,
    handle: Option<MpvHandle>,
    session: Arc<Mutex<Session>>,
    tap: Arc<FftTap>,
    hook: Option<FailureHook>,
    volume: f32,
    watcher: Option<AbortHandle>,
}

impl MpvOutput {
    pub fn new(volume: f32, tap: Arc<FftTap>) -> Self {
        Self {
            driver: MpvDriver::new(volume),
            handle: None,
            session: Arc::new(Mutex::new(Session::default())),
            tap,
            hook: None,
            volume,
            watcher: None,
        }
    }

    async fn connect(&mut self) -> Result<MpvHandle, PlaybackError> {
        if let Some(handle) = self.handle.clone() {
            if self.driver.process_alive() {
                return Ok(handle);
            }
            warn!("mpv: process gone, respawning");
        }
        self.handle = None;
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }

        let (event_tx, event_rx) = mpsc::channel(256);
        self.driver.last_volume = self.volume;
        let handle = self
            .driver
            .spawn_and_connect(event_tx)
            .await
            .map_err(|e| PlaybackError::Unavailable(e.to_string()))?;

        let watcher = tokio::spawn(watch_events(
            event_rx,
            Arc::clone(&self.session),
            self.hook.clone(),
        ));
        self.watcher = Some(watcher.abort_handle());
        self.handle = Some(handle.clone());
        Ok(handle)
    }

    fn reset_session(&self) {
        if let Ok(mut session) = self.session.lock() {
            session.clear();
        }
    }
}

impl AudioOutput for MpvOutput {
    async fn play(&mut self, url: &str) -> Result<(), PlaybackError> {
        let handle = self.connect().await?;

        let (started_tx, started_rx) = oneshot::channel();
        if let Ok(mut session) = self.session.lock() {
            session.url = Some(url.to_string());
            session.starting = Some(started_tx);
        }

        if let Err(e) = handle.load_stream(url, self.volume).await {
            self.reset_session();
            return Err(PlaybackError::Device(e.to_string()));
        }

        let outcome = match tokio::time::timeout(START_TIMEOUT, started_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(PlaybackError::Device("mpv event stream closed".into())),
            Err(_) => Err(PlaybackError::Device(format!(
                "no audio after {}s",
                START_TIMEOUT.as_secs()
            ))),
        };
        match outcome {
            Ok(()) => {
                info!("mpv: playing {}", url);
                self.tap.attach(url);
                Ok(())
            }
            Err(e) => {
                self.reset_session();
                let _ = handle.stop().await;
                Err(e)
            }
        }
    }

    async fn stop(&mut self) {
        self.tap.detach();
        self.reset_session();
        if let Some(handle) = self.handle.as_ref() {
            if let Err(e) = handle.stop().await {
                debug!("mpv: stop failed: {}", e);
            }
        }
    }

    async fn set_volume(&mut self, volume: f32) -> Result<(), PlaybackError> {
        self.volume = volume;
        self.driver.last_volume = volume;
        match self.handle.as_ref() {
            Some(handle) => handle
                .set_volume(volume)
                .await
                .map_err(|e| PlaybackError::Device(e.to_string())),
            // applied on the next spawn
            None => Ok(()),
        }
    }

    fn tap(&self) -> Arc<dyn SpectrumTap> {
        self.tap.clone()
    }

    fn on_failure(&mut self, hook: FailureHook) {
        self.hook = Some(hook);
    }
}

impl Drop for MpvOutput {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

/// Route mpv events into the current session.
async fn watch_events(
    mut events: mpsc::Receiver<MpvEvent>,
    session: Arc<Mutex<Session>>,
    hook: Option<FailureHook>,
) {
    while let Some(evt) = events.recv().await {
        match evt.event_name() {
            Some("file-loaded") => {
                let starting = session.lock().ok().and_then(|mut s| s.starting.take());
                if let Some(tx) = starting {
                    let _ = tx.send(Ok(()));
                }
            }
            Some("end-file") => {
                let reason = evt.end_file_reason().unwrap_or("unknown");
                if !matches!(reason, "error" | "network") {
                    debug!("mpv: end-file ({})", reason);
                    continue;
                }
                let error = PlaybackError::Device(format!(
                    "end-file {}: {}",
                    reason,
                    evt.file_error().unwrap_or("no detail")
                ));

                let (starting, lost) = match session.lock() {
                    Ok(mut s) => match s.starting.take() {
                        Some(tx) => (Some(tx), None),
                        None => (None, s.url.take()),
                    },
                    Err(_) => (None, None),
                };
                if let Some(tx) = starting {
                    let _ = tx.send(Err(error));
                } else if let (Some(url), Some(hook)) = (lost, hook.as_ref()) {
                    warn!("mpv: lost {}: {}", url, error);
                    hook(url, error);
                }
            }
            _ => {}
        }
    }
    debug!("mpv: event watcher exiting");
}
