//! Live Feed Subscriber: owns at most one live connection per logical feed.
//!
//! ```text
//!   LiveFeed::bind(target)
//!         │  same target as bound → no-op (no connection churn)
//!         │  otherwise: close old (generation += 1, token cancelled)
//!         └── connection task  ← transport.subscribe(url)
//!                 ├── payload → decoder → wrap(generation, event) → core channel
//!                 ├── undecodable payload → warn, dropped, connection kept
//!                 └── connection error / end → warn, task exits, no reconnect
//! ```
//!
//! A close is effective immediately for future messages: the generation is
//! bumped before the old task observes its cancellation, and the core checks
//! `accepts(generation)` before applying anything the task already queued.

use std::marker::PhantomData;
use std::sync::Arc;

use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::FeedError;
use crate::transport::RemoteTransport;

/// Turns one raw message payload into a typed event.
pub trait FeedDecoder: Send + Sync + 'static {
    type Event: Send + 'static;

    fn decode(&self, payload: &str) -> Result<Self::Event, FeedError>;
}

/// Decodes each payload as one JSON document of type `T`.
pub struct JsonDecoder<T>(PhantomData<fn() -> T>);

impl<T> JsonDecoder<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for JsonDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned + Send + 'static> FeedDecoder for JsonDecoder<T> {
    type Event = T;

    fn decode(&self, payload: &str) -> Result<T, FeedError> {
        Ok(serde_json::from_str(payload.trim())?)
    }
}

/// Dependency key of a feed.  Rebinding happens only when this changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedTarget {
    pub key: String,
    pub url: String,
}

impl FeedTarget {
    pub fn new(key: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            url: url.into(),
        }
    }
}

pub struct LiveFeed<D: FeedDecoder, M> {
    label: &'static str,
    transport: Arc<dyn RemoteTransport>,
    decoder: Arc<D>,
    sink: mpsc::Sender<M>,
    wrap: fn(u64, D::Event) -> M,
    bound: Option<FeedTarget>,
    generation: u64,
    cancel: Option<CancellationToken>,
    opens: u64,
}

impl<D, M> LiveFeed<D, M>
where
    D: FeedDecoder,
    M: Send + 'static,
{
    pub fn new(
        label: &'static str,
        transport: Arc<dyn RemoteTransport>,
        decoder: D,
        sink: mpsc::Sender<M>,
        wrap: fn(u64, D::Event) -> M,
    ) -> Self {
        Self {
            label,
            transport,
            decoder: Arc::new(decoder),
            sink,
            wrap,
            bound: None,
            generation: 0,
            cancel: None,
            opens: 0,
        }
    }

    /// Bind to `target` (or unbind with `None`).  Returns `true` when the
    /// connection set actually changed.
    pub fn bind(&mut self, target: Option<FeedTarget>) -> bool {
        if target == self.bound {
            return false;
        }
        self.close();
        if let Some(target) = target {
            self.open(target);
        }
        true
    }

    /// Close the connection, if any.  Safe to call repeatedly.
    pub fn dispose(&mut self) {
        self.close();
    }

    /// Whether a delivery stamped with `generation` belongs to the live
    /// connection.  Anything else arrived after a close and must be ignored.
    pub fn accepts(&self, generation: u64) -> bool {
        self.cancel.is_some() && generation == self.generation
    }

    pub fn bound(&self) -> Option<&FeedTarget> {
        self.bound.as_ref()
    }

    /// Connections opened over the lifetime of this subscriber.
    pub fn opens(&self) -> u64 {
        self.opens
    }

    fn close(&mut self) {
        if let Some(token) = self.cancel.take() {
            self.generation = self.generation.wrapping_add(1);
            token.cancel();
            if let Some(target) = self.bound.as_ref() {
                info!("feed[{}]: closed {}", self.label, target.url);
            }
        }
        self.bound = None;
    }

    fn open(&mut self, target: FeedTarget) {
        self.generation = self.generation.wrapping_add(1);
        self.opens += 1;
        let token = CancellationToken::new();
        info!(
            "feed[{}]: opening {} (key={}, generation={})",
            self.label, target.url, target.key, self.generation
        );

        tokio::spawn(run_connection(
            self.label,
            target.url.clone(),
            self.generation,
            Arc::clone(&self.transport),
            Arc::clone(&self.decoder),
            self.sink.clone(),
            self.wrap,
            token.clone(),
        ));

        self.cancel = Some(token);
        self.bound = Some(target);
    }
}

impl<D: FeedDecoder, M> Drop for LiveFeed<D, M> {
    fn drop(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_connection<D, M>(
    label: &'static str,
    url: String,
    generation: u64,
    transport: Arc<dyn RemoteTransport>,
    decoder: Arc<D>,
    sink: mpsc::Sender<M>,
    wrap: fn(u64, D::Event) -> M,
    cancel: CancellationToken,
) where
    D: FeedDecoder,
    M: Send + 'static,
{
    let mut messages = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        res = transport.subscribe(&url) => match res {
            Ok(stream) => stream,
            Err(e) => {
                warn!("feed[{}]: connect to {} failed: {}", label, url, e);
                return;
            }
        },
    };

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = messages.next() => next,
        };
        match next {
            Some(Ok(payload)) => match decoder.decode(&payload) {
                Ok(event) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    if sink.send(wrap(generation, event)).await.is_err() {
                        debug!("feed[{}]: core channel closed", label);
                        break;
                    }
                }
                Err(e) => warn!("feed[{}]: dropping message: {}", label, e),
            },
            Some(Err(e)) => {
                warn!("feed[{}]: connection to {} lost: {}", label, url, e);
                break;
            }
            None => {
                warn!("feed[{}]: connection to {} ended", label, url);
                break;
            }
        }
    }
    debug!("feed[{}]: connection task for generation {} exiting", label, generation);
}
