//! Playback Controller: play/stop state, volume, and the single attached
//! audio source.
//!
//! The output device is owned by a driver task; the controller only sends it
//! commands, so a slow start never holds up the caller.  Each play request
//! carries a generation, and its outcome comes back as a `PlayOutcome` that
//! the owner feeds into `on_outcome`.  Outcomes for a request that has since
//! been stopped or replaced are dropped.
//!
//! ```text
//!   Stopped ──toggle──► Starting ──outcome Ok──► Playing
//!      ▲                   │ outcome Err              │
//!      └───────────────────┴──── stop / fail ─────────┘
//! ```
//!
//! The source is re-requested only when the `(active, stream_url)` pair
//! changes.  Volume changes go straight to the device and never reload.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tuner_proto::protocol::PlaybackState;

use crate::error::PlaybackError;
use crate::spectrum::SpectrumTap;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Called by an output when an already-started source dies on its own
/// (stream ended, network drop).  Carries the url that failed.
pub type FailureHook = Arc<dyn Fn(String, PlaybackError) + Send + Sync>;

/// The audio device.  `play` resolves once the source has started (or
/// failed to); `stop` releases whatever is attached.
pub trait AudioOutput: Send + 'static {
    fn play(&mut self, url: &str) -> impl Future<Output = Result<(), PlaybackError>> + Send;

    fn stop(&mut self) -> impl Future<Output = ()> + Send;

    fn set_volume(&mut self, volume: f32) -> impl Future<Output = Result<(), PlaybackError>> + Send;

    /// Frequency-domain view of whatever is currently playing.
    fn tap(&self) -> Arc<dyn SpectrumTap>;

    /// Register the hook for autonomous failures.  Outputs that cannot fail
    /// after `play` returns may ignore it.
    fn on_failure(&mut self, _hook: FailureHook) {}
}

#[derive(Debug)]
enum OutputCommand {
    Play { url: String, generation: u64 },
    Stop,
    SetVolume(f32),
    Close,
}

/// Result of one play request, posted back by the driver task.
#[derive(Debug)]
pub struct PlayOutcome {
    pub generation: u64,
    pub url: String,
    pub result: Result<(), PlaybackError>,
}

/// What a controller call did to the source.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceChange {
    Unchanged,
    /// Play request sent; the outcome arrives later.
    Requested(String),
    Attached(String),
    Released,
    Failed(PlaybackError),
}

pub struct PlaybackController {
    commands: mpsc::UnboundedSender<OutputCommand>,
    driver: Option<JoinHandle<()>>,
    state: PlaybackState,
    volume: f32,
    attached: Option<String>,
    pending: Option<(u64, String)>,
    generation: u64,
    last_key: (bool, Option<String>),
}

impl PlaybackController {
    /// Move `output` onto its own driver task.  Play outcomes are posted to
    /// `sink` through `wrap`.  Must be called inside a tokio runtime.
    pub fn spawn<O, M>(
        output: O,
        volume: f32,
        sink: mpsc::Sender<M>,
        wrap: fn(PlayOutcome) -> M,
    ) -> Self
    where
        O: AudioOutput,
        M: Send + 'static,
    {
        let (commands, rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive_output(output, rx, sink, wrap));
        Self {
            commands,
            driver: Some(driver),
            state: PlaybackState::Stopped,
            volume: clamp_volume(volume, 1.0),
            attached: None,
            pending: None,
            generation: 0,
            last_key: (false, None),
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn attached(&self) -> Option<&str> {
        self.attached.as_deref()
    }

    /// Stop when active; start when stopped and there is anything to play.
    pub fn toggle_play(&mut self, has_stations: bool) -> PlaybackState {
        match self.state {
            PlaybackState::Playing | PlaybackState::Starting => self.stop(),
            PlaybackState::Stopped if has_stations => {
                info!("playback: play requested");
                self.state = PlaybackState::Starting;
            }
            PlaybackState::Stopped => debug!("playback: nothing to play"),
        }
        self.state
    }

    /// Bring the source in line with the current station.  Acts at most once
    /// per distinct `(active, url)` pair.
    pub fn sync(&mut self, url: Option<&str>) -> SourceChange {
        let key = (self.state.is_active(), url.map(str::to_string));
        if key == self.last_key {
            return SourceChange::Unchanged;
        }

        let change = match (self.state.is_active(), url) {
            (true, Some(url)) if self.attached() == Some(url) || self.pending_url() == Some(url) => {
                SourceChange::Unchanged
            }
            (true, Some(url)) => self.set_source(url),
            (true, None) => {
                // list emptied underneath us
                self.stop();
                SourceChange::Released
            }
            (false, _) => {
                if self.release() {
                    SourceChange::Released
                } else {
                    SourceChange::Unchanged
                }
            }
        };

        self.last_key = (self.state.is_active(), url.map(str::to_string));
        change
    }

    /// Request `url`.  Only takes effect while active; whatever was attached
    /// or starting is released first.
    pub fn set_source(&mut self, url: &str) -> SourceChange {
        if !self.state.is_active() {
            debug!("playback: not playing, ignoring source {}", url);
            return SourceChange::Unchanged;
        }
        self.release();
        self.generation += 1;
        info!("playback: starting {}", url);
        self.pending = Some((self.generation, url.to_string()));
        self.state = PlaybackState::Starting;
        self.send(OutputCommand::Play {
            url: url.to_string(),
            generation: self.generation,
        });
        SourceChange::Requested(url.to_string())
    }

    /// Apply the outcome of a play request.  Outcomes for a request that is
    /// no longer pending are ignored.
    pub fn on_outcome(&mut self, outcome: PlayOutcome) -> SourceChange {
        match &self.pending {
            Some((generation, _)) if *generation == outcome.generation => {}
            _ => {
                debug!("playback: stale outcome for {} ignored", outcome.url);
                return SourceChange::Unchanged;
            }
        }
        self.pending = None;
        match outcome.result {
            Ok(()) => {
                info!("playback: playing {}", outcome.url);
                self.state = PlaybackState::Playing;
                self.attached = Some(outcome.url.clone());
                SourceChange::Attached(outcome.url)
            }
            Err(e) => {
                warn!("playback: {} failed to start: {}", outcome.url, e);
                self.stop();
                SourceChange::Failed(e)
            }
        }
    }

    /// Clamp to [0, 1] and apply.  Never touches the source.
    pub fn set_volume(&mut self, volume: f32) -> f32 {
        self.volume = clamp_volume(volume, self.volume);
        self.send(OutputCommand::SetVolume(self.volume));
        self.volume
    }

    pub fn stop(&mut self) {
        if self.state.is_active() {
            info!("playback: stopped");
        }
        self.state = PlaybackState::Stopped;
        self.release();
    }

    /// Autonomous failure reported by the output.  Ignored unless it names
    /// the source that is attached right now.
    pub fn fail(&mut self, url: &str, error: &PlaybackError) -> bool {
        if self.attached() != Some(url) {
            debug!("playback: stale failure for {} ignored", url);
            return false;
        }
        warn!("playback: {} failed: {}", url, error);
        self.stop();
        true
    }

    /// Stop, then wait for the driver task to drop the output.  Idempotent.
    pub async fn close(&mut self) {
        self.stop();
        let Some(driver) = self.driver.take() else {
            return;
        };
        self.send(OutputCommand::Close);
        if tokio::time::timeout(CLOSE_TIMEOUT, driver).await.is_err() {
            warn!("playback: output driver did not exit in time");
        }
    }

    fn pending_url(&self) -> Option<&str> {
        self.pending.as_ref().map(|(_, url)| url.as_str())
    }

    fn release(&mut self) -> bool {
        let attached = self.attached.take();
        let pending = self.pending.take().map(|(_, url)| url);
        match attached.or(pending) {
            Some(url) => {
                debug!("playback: releasing {}", url);
                self.send(OutputCommand::Stop);
                true
            }
            None => false,
        }
    }

    fn send(&self, cmd: OutputCommand) {
        if self.commands.send(cmd).is_err() {
            debug!("playback: output driver gone");
        }
    }
}

/// Own the output and run its commands in order.  A pending `play` is
/// abandoned as soon as any command other than a volume change arrives.
async fn drive_output<O, M>(
    mut output: O,
    mut commands: mpsc::UnboundedReceiver<OutputCommand>,
    sink: mpsc::Sender<M>,
    wrap: fn(PlayOutcome) -> M,
) where
    O: AudioOutput,
    M: Send + 'static,
{
    let mut next = None;
    loop {
        let cmd = match next.take() {
            Some(cmd) => cmd,
            None => match commands.recv().await {
                Some(cmd) => cmd,
                None => break,
            },
        };
        match cmd {
            OutputCommand::Play { url, generation } => {
                let mut volume = None;
                let result = {
                    let play = output.play(&url);
                    tokio::pin!(play);
                    loop {
                        tokio::select! {
                            result = &mut play => break Some(result),
                            cmd = commands.recv() => match cmd {
                                Some(OutputCommand::SetVolume(v)) => volume = Some(v),
                                Some(cmd) => {
                                    next = Some(cmd);
                                    break None;
                                }
                                None => {
                                    next = Some(OutputCommand::Close);
                                    break None;
                                }
                            },
                        }
                    }
                };
                if let Some(volume) = volume {
                    apply_volume(&mut output, volume).await;
                }
                match result {
                    Some(result) => {
                        let outcome = PlayOutcome {
                            generation,
                            url,
                            result,
                        };
                        if sink.send(wrap(outcome)).await.is_err() {
                            break;
                        }
                    }
                    None => debug!("playback: start of {} abandoned", url),
                }
            }
            OutputCommand::Stop => output.stop().await,
            OutputCommand::SetVolume(volume) => apply_volume(&mut output, volume).await,
            OutputCommand::Close => break,
        }
    }
    debug!("playback: output driver exiting");
}

async fn apply_volume<O: AudioOutput>(output: &mut O, volume: f32) {
    if let Err(e) = output.set_volume(volume).await {
        warn!("playback: failed to apply volume {:.2}: {}", volume, e);
    }
}

fn clamp_volume(volume: f32, fallback: f32) -> f32 {
    if volume.is_nan() {
        fallback
    } else {
        volume.clamp(0.0, 1.0)
    }
}
