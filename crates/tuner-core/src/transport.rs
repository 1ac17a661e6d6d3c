//! Transport seam between the engine and the registry node.
//!
//! The engine only needs two primitives: a one-shot GET (bulk station list)
//! and a live connection that yields discrete message payloads (registry and
//! now-playing feeds).  `HttpTransport` provides both over `reqwest`, decoding
//! server-sent events; tests substitute an in-memory script.

use std::collections::VecDeque;

use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream};
use futures_util::{FutureExt, StreamExt};
use reqwest::header::{HeaderValue, ACCEPT};
use reqwest::Client;
use tracing::debug;

use crate::error::FeedError;

/// Payloads of one live connection, in delivery order.  An `Err` item means
/// the connection is gone; nothing follows it.
pub type MessageStream = BoxStream<'static, Result<String, FeedError>>;

pub trait RemoteTransport: Send + Sync + 'static {
    /// GET `url` and return the body on success.
    fn fetch(&self, url: &str) -> BoxFuture<'static, Result<String, FeedError>>;

    /// Open a live connection to `url`.
    fn subscribe(&self, url: &str) -> BoxFuture<'static, Result<MessageStream, FeedError>>;
}

#[derive(Clone, Default)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl RemoteTransport for HttpTransport {
    fn fetch(&self, url: &str) -> BoxFuture<'static, Result<String, FeedError>> {
        let request = self.client.get(url);
        async move {
            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(FeedError::Status(status.as_u16()));
            }
            Ok(response.text().await?)
        }
        .boxed()
    }

    fn subscribe(&self, url: &str) -> BoxFuture<'static, Result<MessageStream, FeedError>> {
        let request = self
            .client
            .get(url)
            .header(ACCEPT, HeaderValue::from_static("text/event-stream"));
        let url = url.to_string();
        async move {
            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(FeedError::Status(status.as_u16()));
            }
            debug!("sse: connected to {}", url);

            let state = (response.bytes_stream(), SseParser::new(), VecDeque::new(), false);
            let messages = stream::unfold(state, |(mut bytes, mut parser, mut pending, done)| async move {
                loop {
                    if let Some(msg) = pending.pop_front() {
                        return Some((Ok(msg), (bytes, parser, pending, done)));
                    }
                    if done {
                        return None;
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => pending.extend(parser.push(&chunk)),
                        Some(Err(e)) => {
                            return Some((Err(FeedError::Http(e)), (bytes, parser, pending, true)))
                        }
                        None => return Some((Err(FeedError::Ended), (bytes, parser, pending, true))),
                    }
                }
            });
            Ok(messages.boxed())
        }
        .boxed()
    }
}

// ── SSE framing ───────────────────────────────────────────────────────────────

/// Incremental server-sent-events decoder.  Feed it raw body chunks in any
/// split; it returns the `data` payload of every completed event.
#[derive(Debug, Default)]
pub struct SseParser {
    line: Vec<u8>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        for &b in chunk {
            if b != b'\n' {
                self.line.push(b);
                continue;
            }
            let mut raw = std::mem::take(&mut self.line);
            if raw.last() == Some(&b'\r') {
                raw.pop();
            }
            let line = String::from_utf8_lossy(&raw);
            if let Some(payload) = self.on_line(&line) {
                out.push(payload);
            }
        }
        out
    }

    fn on_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            if self.data.is_empty() {
                return None;
            }
            let payload = self.data.join("\n");
            self.data.clear();
            return Some(payload);
        }
        if line.starts_with(':') {
            return None;
        }
        if line == "data" {
            self.data.push(String::new());
        } else if let Some(rest) = line.strip_prefix("data:") {
            self.data.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        }
        // event:, id:, retry: carry nothing the feeds use
        None
    }
}
