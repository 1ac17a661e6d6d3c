//! In-memory doubles for the transport and the audio device.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream;
use futures_util::{FutureExt, StreamExt};
use tokio::sync::mpsc;

use crate::error::{FeedError, PlaybackError};
use crate::playback::{AudioOutput, FailureHook};
use crate::spectrum::SpectrumTap;
use crate::transport::{MessageStream, RemoteTransport};

type Connection = mpsc::UnboundedSender<Result<String, FeedError>>;

#[derive(Default)]
struct Script {
    bodies: HashMap<String, Result<String, u16>>,
    connections: HashMap<String, Connection>,
    subscribes: HashMap<String, usize>,
}

/// Transport whose live connections are driven by the test.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_body(&self, url: &str, body: &str) {
        let mut script = self.script.lock().unwrap();
        script.bodies.insert(url.to_string(), Ok(body.to_string()));
    }

    pub fn set_status(&self, url: &str, status: u16) {
        let mut script = self.script.lock().unwrap();
        script.bodies.insert(url.to_string(), Err(status));
    }

    /// Deliver one payload on the latest connection to `url`.
    pub fn push(&self, url: &str, payload: &str) {
        let script = self.script.lock().unwrap();
        if let Some(conn) = script.connections.get(url) {
            let _ = conn.send(Ok(payload.to_string()));
        }
    }

    /// Break the latest connection to `url`.
    pub fn drop_connection(&self, url: &str) {
        let mut script = self.script.lock().unwrap();
        if let Some(conn) = script.connections.remove(url) {
            let _ = conn.send(Err(FeedError::Ended));
        }
    }

    pub fn subscribe_count(&self, url: &str) -> usize {
        let script = self.script.lock().unwrap();
        script.subscribes.get(url).copied().unwrap_or(0)
    }

    pub fn is_connected(&self, url: &str) -> bool {
        let script = self.script.lock().unwrap();
        script
            .connections
            .get(url)
            .map(|conn| !conn.is_closed())
            .unwrap_or(false)
    }

    pub async fn wait_connected(&self, url: &str) {
        for _ in 0..200 {
            if self.is_connected(url) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no connection to {}", url);
    }
}

impl RemoteTransport for ScriptedTransport {
    fn fetch(&self, url: &str) -> BoxFuture<'static, Result<String, FeedError>> {
        let body = self.script.lock().unwrap().bodies.get(url).cloned();
        async move {
            match body {
                Some(Ok(body)) => Ok(body),
                Some(Err(status)) => Err(FeedError::Status(status)),
                None => Err(FeedError::Status(404)),
            }
        }
        .boxed()
    }

    fn subscribe(&self, url: &str) -> BoxFuture<'static, Result<MessageStream, FeedError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut script = self.script.lock().unwrap();
            *script.subscribes.entry(url.to_string()).or_default() += 1;
            script.connections.insert(url.to_string(), tx);
        }
        let messages = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });
        async move { Ok(messages.boxed()) }.boxed()
    }
}

/// Tap with fixed bins.
pub struct FixedTap {
    bins: Mutex<Vec<f32>>,
    max: f32,
}

impl FixedTap {
    pub fn new(bins: Vec<f32>, max: f32) -> Self {
        Self {
            bins: Mutex::new(bins),
            max,
        }
    }
}

impl SpectrumTap for FixedTap {
    fn read(&self, bins: &mut Vec<f32>) {
        bins.clear();
        bins.extend_from_slice(&self.bins.lock().unwrap());
    }

    fn max_value(&self) -> f32 {
        self.max
    }
}

#[derive(Default)]
struct OutputLog {
    plays: Vec<String>,
    stops: usize,
    volumes: Vec<f32>,
    failing: HashSet<String>,
    start_delay: Duration,
    hook: Option<FailureHook>,
}

/// Output that records every call and plays nothing.
#[derive(Clone)]
pub struct RecordingOutput {
    log: Arc<Mutex<OutputLog>>,
    tap: Arc<FixedTap>,
}

impl RecordingOutput {
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(OutputLog::default())),
            tap: Arc::new(FixedTap::new(vec![180.0; 128], 255.0)),
        }
    }

    pub fn fail_url(&self, url: &str) {
        self.log.lock().unwrap().failing.insert(url.to_string());
    }

    /// Make every `play` take `delay` before it reports success.
    pub fn set_start_delay(&self, delay: Duration) {
        self.log.lock().unwrap().start_delay = delay;
    }

    pub fn plays(&self) -> Vec<String> {
        self.log.lock().unwrap().plays.clone()
    }

    pub fn stops(&self) -> usize {
        self.log.lock().unwrap().stops
    }

    pub fn volumes(&self) -> Vec<f32> {
        self.log.lock().unwrap().volumes.clone()
    }

    /// Wait until the driver task has caught up with `done`.
    pub async fn settle(&self, done: impl Fn(&RecordingOutput) -> bool) {
        for _ in 0..200 {
            if done(self) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("recording output never reached the expected state");
    }

    /// Simulate the device losing `url` after it started.
    pub fn report_failure(&self, url: &str) {
        let hook = self.log.lock().unwrap().hook.clone();
        if let Some(hook) = hook {
            hook(url.to_string(), PlaybackError::Device("end of stream".into()));
        }
    }
}

impl AudioOutput for RecordingOutput {
    async fn play(&mut self, url: &str) -> Result<(), PlaybackError> {
        let delay = {
            let mut log = self.log.lock().unwrap();
            log.plays.push(url.to_string());
            if log.failing.contains(url) {
                return Err(PlaybackError::Rejected(url.to_string()));
            }
            log.start_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn stop(&mut self) {
        self.log.lock().unwrap().stops += 1;
    }

    async fn set_volume(&mut self, volume: f32) -> Result<(), PlaybackError> {
        self.log.lock().unwrap().volumes.push(volume);
        Ok(())
    }

    fn tap(&self) -> Arc<dyn SpectrumTap> {
        self.tap.clone()
    }

    fn on_failure(&mut self, hook: FailureHook) {
        self.log.lock().unwrap().hook = Some(hook);
    }
}
