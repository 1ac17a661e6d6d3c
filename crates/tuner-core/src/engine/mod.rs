//! `TunerCore`: the single owner of all tuner state.
//!
//! Every input (control commands, feed deliveries, frame ticks, timer
//! expiries, device failures) arrives as a `CoreEvent` on one mpsc channel
//! and is handled to completion before the next one, so none of the owned
//! components need locking.
//!
//! After any change to the station list, the selection or the play state,
//! `reconcile` recomputes the derived bindings in a fixed order:
//!
//! ```text
//!   store mutation ─► selection clamp ─► current station
//!        ├─► playback.sync(current.stream_url)      (request / release source)
//!        ├─► now feed bind(key) iff current && playing, NowPlaying cleared on change
//!        └─► sampler start / stop with the attached source
//! ```
//!
//! Play requests never block the loop: the outcome comes back later as
//! `CoreEvent::PlayOutcome` and runs through the same path.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use tuner_proto::config::Config;
use tuner_proto::protocol::{
    AudioLevels, NowPlaying, PlaybackState, RegistryEvent, Station, LEVEL_BANDS,
    NOW_EVENTS_PATH, REGISTRY_EVENTS_PATH, STATIONS_PATH,
};

use crate::error::{FeedError, PlaybackError};
use crate::feed::{FeedTarget, JsonDecoder, LiveFeed};
use crate::playback::{AudioOutput, PlayOutcome, PlaybackController, SourceChange};
use crate::spectrum::SpectrumSampler;
use crate::store::StationStore;
use crate::transport::RemoteTransport;
use crate::tuner::{step_down, step_up, Tuner};

/// User-facing operations.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    TuneUp,
    TuneDown,
    TogglePlay,
    /// Volume in [0, 1]; out-of-range values are clamped.
    SetVolume(f32),
    /// Volume as presented to the user, 0–100.
    SetVolumePercent(u8),
    Select(usize),
    Shutdown,
}

#[derive(Debug)]
pub enum CoreEvent {
    Command(ControlCommand),
    /// Result of the startup bulk fetch.
    Seeded(Result<Vec<Station>, FeedError>),
    Registry { generation: u64, event: RegistryEvent },
    NowPlaying { generation: u64, update: NowPlaying },
    Frame { epoch: u64 },
    TuningSettled { epoch: u64 },
    /// The output finished (or failed) starting a requested source.
    PlayOutcome(PlayOutcome),
    /// The output lost a source that had already started.
    OutputFailed { url: String, error: PlaybackError },
}

/// Snapshot published after every state change.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TunerView {
    pub stations: Vec<Station>,
    pub selection: Option<usize>,
    pub current: Option<Station>,
    pub playback: PlaybackState,
    pub volume: f32,
    pub tuning: bool,
    pub now_playing: Option<NowPlaying>,
    /// Display line: track summary while metadata is known, otherwise the
    /// station name while playing.
    pub now_playing_line: Option<String>,
    pub levels: AudioLevels,
}

impl Default for TunerView {
    fn default() -> Self {
        Self {
            stations: Vec::new(),
            selection: None,
            current: None,
            playback: PlaybackState::Stopped,
            volume: 0.0,
            tuning: false,
            now_playing: None,
            now_playing_line: None,
            levels: [0.0; LEVEL_BANDS],
        }
    }
}

type RegistryFeed = LiveFeed<JsonDecoder<RegistryEvent>, CoreEvent>;
type NowFeed = LiveFeed<JsonDecoder<NowPlaying>, CoreEvent>;

type FailureReport = (String, PlaybackError);

pub struct TunerCore {
    config: Config,
    transport: Arc<dyn RemoteTransport>,
    event_tx: mpsc::Sender<CoreEvent>,
    failures: Option<mpsc::UnboundedReceiver<FailureReport>>,
    store: StationStore,
    tuner: Tuner,
    registry: RegistryFeed,
    now_feed: NowFeed,
    playback: PlaybackController,
    sampler: SpectrumSampler,
    now_playing: Option<NowPlaying>,
    view_tx: watch::Sender<TunerView>,
    running: bool,
}

impl TunerCore {
    /// Build the core around `output`.  The output moves onto its own driver
    /// task, so this must run inside a tokio runtime.
    pub fn new<O: AudioOutput>(
        config: Config,
        transport: Arc<dyn RemoteTransport>,
        mut output: O,
    ) -> (Self, mpsc::Receiver<CoreEvent>) {
        let (event_tx, event_rx) = mpsc::channel(1024);

        // never blocks the output; `start` forwards these into the loop
        let (failure_tx, failures) = mpsc::unbounded_channel::<FailureReport>();
        output.on_failure(Arc::new(move |url, error| {
            if failure_tx.send((url, error)).is_err() {
                debug!("TunerCore: failure after shutdown ignored");
            }
        }));

        let sampler = SpectrumSampler::new(
            output.tap(),
            Duration::from_millis(config.spectrum.frame_interval_ms.max(1)),
        );
        let registry: RegistryFeed = LiveFeed::new(
            "registry",
            Arc::clone(&transport),
            JsonDecoder::new(),
            event_tx.clone(),
            |generation, event| CoreEvent::Registry { generation, event },
        );
        let now_feed: NowFeed = LiveFeed::new(
            "now",
            Arc::clone(&transport),
            JsonDecoder::new(),
            event_tx.clone(),
            |generation, update| CoreEvent::NowPlaying { generation, update },
        );
        let playback = PlaybackController::spawn(
            output,
            config.playback.default_volume,
            event_tx.clone(),
            CoreEvent::PlayOutcome,
        );
        let (view_tx, _) = watch::channel(TunerView {
            volume: playback.volume(),
            ..TunerView::default()
        });

        let core = Self {
            config,
            transport,
            event_tx,
            failures: Some(failures),
            store: StationStore::new(),
            tuner: Tuner::new(),
            registry,
            now_feed,
            playback,
            sampler,
            now_playing: None,
            view_tx,
            running: false,
        };
        (core, event_rx)
    }

    /// Handle for submitting events from other tasks.
    pub fn sender(&self) -> mpsc::Sender<CoreEvent> {
        self.event_tx.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TunerView> {
        self.view_tx.subscribe()
    }

    pub fn view(&self) -> TunerView {
        self.view_tx.borrow().clone()
    }

    pub fn store(&self) -> &StationStore {
        &self.store
    }

    pub fn playback(&self) -> &PlaybackController {
        &self.playback
    }

    pub fn now_feed_opens(&self) -> u64 {
        self.now_feed.opens()
    }

    /// Bind the registry feed, kick off the bulk seed and start forwarding
    /// output failures into the loop.  Idempotent.
    pub fn start(&mut self) {
        if self.running {
            return;
        }
        self.running = true;

        if let Some(mut failures) = self.failures.take() {
            let tx = self.event_tx.clone();
            tokio::spawn(async move {
                while let Some((url, error)) = failures.recv().await {
                    if tx.send(CoreEvent::OutputFailed { url, error }).await.is_err() {
                        break;
                    }
                }
            });
        }

        let base = self.config.server.base_url.trim_end_matches('/').to_string();
        info!("TunerCore: following registry at {}", base);
        self.registry.bind(Some(FeedTarget::new(
            "registry",
            format!("{}{}", base, REGISTRY_EVENTS_PATH),
        )));

        let transport = Arc::clone(&self.transport);
        let tx = self.event_tx.clone();
        let url = format!("{}{}", base, STATIONS_PATH);
        tokio::spawn(async move {
            let result = match transport.fetch(&url).await {
                Ok(body) => serde_json::from_str::<Vec<Station>>(&body).map_err(FeedError::from),
                Err(e) => Err(e),
            };
            let _ = tx.send(CoreEvent::Seeded(result)).await;
        });
        self.publish();
    }

    pub async fn run(mut self, mut event_rx: mpsc::Receiver<CoreEvent>) {
        info!("TunerCore: starting event loop");
        self.start();
        while let Some(event) = event_rx.recv().await {
            if !self.handle(event).await {
                break;
            }
        }
        self.shutdown().await;
        info!("TunerCore: event loop finished");
    }

    /// Apply one event.  Returns `false` once shutdown has been requested.
    pub async fn handle(&mut self, event: CoreEvent) -> bool {
        match event {
            CoreEvent::Command(cmd) => return self.handle_command(cmd).await,

            CoreEvent::Seeded(Ok(stations)) => {
                info!("TunerCore: seeded {} stations", stations.len());
                self.store.replace_all(stations);
            }
            CoreEvent::Seeded(Err(e)) => {
                warn!("TunerCore: initial station fetch failed: {}", e);
                return true;
            }

            CoreEvent::Registry { generation, event } => {
                if !self.registry.accepts(generation) {
                    debug!("TunerCore: stale registry event dropped");
                    return true;
                }
                match event {
                    RegistryEvent::Upsert(station) => {
                        debug!("TunerCore: upsert {}", station.station_id);
                        self.store.apply_upsert(station);
                    }
                    RegistryEvent::Delete(station) => {
                        debug!("TunerCore: delete {}", station.station_id);
                        if !self.store.apply_delete(&station.station_id) {
                            return true;
                        }
                    }
                }
            }

            CoreEvent::NowPlaying { generation, update } => {
                if self.now_feed.accepts(generation) {
                    self.now_playing = Some(update);
                    self.publish();
                }
                return true;
            }

            CoreEvent::Frame { epoch } => {
                if let Some(levels) = self.sampler.on_frame(epoch) {
                    self.view_tx.send_modify(|view| view.levels = levels);
                }
                return true;
            }

            CoreEvent::TuningSettled { epoch } => {
                if self.tuner.settle(epoch) {
                    self.view_tx.send_modify(|view| view.tuning = false);
                }
                return true;
            }

            CoreEvent::PlayOutcome(outcome) => match self.playback.on_outcome(outcome) {
                SourceChange::Unchanged => return true,
                SourceChange::Failed(e) => info!("TunerCore: no signal ({})", e),
                _ => {}
            },

            CoreEvent::OutputFailed { url, error } => {
                if !self.playback.fail(&url, &error) {
                    return true;
                }
            }
        }

        self.reconcile();
        self.publish();
        true
    }

    async fn handle_command(&mut self, cmd: ControlCommand) -> bool {
        debug!("TunerCore: command {:?}", cmd);
        match cmd {
            ControlCommand::TuneUp | ControlCommand::TuneDown => {
                let Some(idx) = self.store.selection() else {
                    return true;
                };
                let next = match cmd {
                    ControlCommand::TuneUp => step_up(idx, self.store.len()),
                    _ => step_down(idx, self.store.len()),
                };
                if let Some(next) = next {
                    self.store.select(next);
                    self.flash_tuning();
                }
            }
            ControlCommand::TogglePlay => {
                self.playback.toggle_play(!self.store.is_empty());
            }
            ControlCommand::SetVolume(volume) => {
                let volume = self.playback.set_volume(volume);
                self.view_tx.send_modify(|view| view.volume = volume);
                return true;
            }
            ControlCommand::SetVolumePercent(percent) => {
                let volume = f32::from(percent.min(100)) / 100.0;
                let volume = self.playback.set_volume(volume);
                self.view_tx.send_modify(|view| view.volume = volume);
                return true;
            }
            ControlCommand::Select(idx) => {
                if !self.store.select(idx) {
                    warn!(
                        "TunerCore: select {} out of range ({} stations)",
                        idx,
                        self.store.len()
                    );
                    return true;
                }
            }
            ControlCommand::Shutdown => {
                info!("TunerCore: shutdown requested");
                self.shutdown().await;
                return false;
            }
        }
        self.reconcile();
        self.publish();
        true
    }

    fn reconcile(&mut self) {
        let current = self.store.current().cloned();

        self.playback
            .sync(current.as_ref().map(|s| s.stream_url.as_str()));

        let playing = self.playback.state().is_playing();
        let target = match (&current, playing) {
            (Some(station), true) => now_playing_url(&station.stream_url)
                .map(|url| FeedTarget::new(station.station_id.clone(), url)),
            _ => None,
        };
        if self.now_feed.bind(target) {
            self.now_playing = None;
        }
        if !playing {
            self.now_playing = None;
        }

        let sampling = playing && self.playback.attached().is_some();
        if sampling && !self.sampler.is_active() {
            self.sampler
                .start(self.event_tx.clone(), |epoch| CoreEvent::Frame { epoch });
        } else if !sampling && self.sampler.is_active() {
            self.sampler.stop();
        }
    }

    fn flash_tuning(&mut self) {
        let epoch = self.tuner.begin();
        let tx = self.event_tx.clone();
        let flash = Duration::from_millis(self.config.tuning.flash_ms);
        tokio::spawn(async move {
            tokio::time::sleep(flash).await;
            let _ = tx.send(CoreEvent::TuningSettled { epoch }).await;
        });
    }

    fn publish(&self) {
        let current = self.store.current().cloned();
        let playback = self.playback.state();
        let now_playing_line = match (&self.now_playing, &current) {
            (Some(np), Some(station)) => Some(np.summary(&station.name)),
            (None, Some(station)) if playback.is_playing() => Some(station.name.clone()),
            _ => None,
        };
        self.view_tx.send_replace(TunerView {
            stations: self.store.snapshot().to_vec(),
            selection: self.store.selection(),
            current,
            playback,
            volume: self.playback.volume(),
            tuning: self.tuner.is_tuning(),
            now_playing: self.now_playing.clone(),
            now_playing_line,
            levels: self.sampler.levels(),
        });
    }

    /// Close both feeds, release the source, wait for the output to be
    /// dropped and zero the levels.  Safe to call more than once.
    pub async fn shutdown(&mut self) {
        self.registry.dispose();
        self.now_feed.dispose();
        self.playback.close().await;
        self.sampler.stop();
        self.now_playing = None;
        self.running = false;
        self.publish();
    }
}

/// `{origin of stream_url}/api/v1/now/events`, or `None` when the stream
/// url has no usable origin.
pub fn now_playing_url(stream_url: &str) -> Option<String> {
    let url = match Url::parse(stream_url) {
        Ok(url) => url,
        Err(e) => {
            warn!("TunerCore: bad stream url '{}': {}", stream_url, e);
            return None;
        }
    };
    let origin = url.origin();
    if !origin.is_tuple() {
        return None;
    }
    Some(format!("{}{}", origin.ascii_serialization(), NOW_EVENTS_PATH))
}
