//! Integration tests against a mock registry node on a local socket.
//!
//! The node serves:
//! 1. `GET /api/v1/stations` with a fixed JSON body
//! 2. `GET /api/v1/events` and `GET /api/v1/now/events` as close-delimited
//!    event streams whose raw frames are pushed by the test
//!
//! Run with: cargo test -p tuner-core --test registry_node

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tuner_core::{
    AudioOutput, ControlCommand, CoreEvent, FeedError, HttpTransport, PlaybackError,
    RemoteTransport, SilentTap, SpectrumTap, TunerCore,
};
use tuner_proto::config::Config;
use tuner_proto::protocol::{PlaybackState, RegistryEvent, Station};

/// Mock registry node.
struct MockNode {
    addr: SocketAddr,
    registry: broadcast::Sender<String>,
    now: broadcast::Sender<String>,
}

impl MockNode {
    async fn start(stations: String) -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (registry, _) = broadcast::channel::<String>(64);
        let (now, _) = broadcast::channel::<String>(64);

        let node_registry = registry.clone();
        let node_now = now.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(
                    stream,
                    stations.clone(),
                    node_registry.clone(),
                    node_now.clone(),
                ));
            }
        });

        Ok(Self { addr, registry, now })
    }

    fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn stream_url(&self) -> String {
        format!("http://{}/stream", self.addr)
    }

    /// Write raw bytes to every open registry stream.
    fn push_registry(&self, frame: &str) {
        let _ = self.registry.send(frame.to_string());
    }

    fn push_now(&self, frame: &str) {
        let _ = self.now.send(frame.to_string());
    }

    async fn wait_registry_listener(&self) {
        wait_for_receiver(&self.registry).await;
    }

    async fn wait_now_listener(&self) {
        wait_for_receiver(&self.now).await;
    }
}

async fn wait_for_receiver(tx: &broadcast::Sender<String>) {
    for _ in 0..400 {
        if tx.receiver_count() > 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no event stream connected");
}

async fn serve(
    mut stream: TcpStream,
    stations: String,
    registry: broadcast::Sender<String>,
    now: broadcast::Sender<String>,
) -> std::io::Result<()> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        head.extend_from_slice(&buf[..n]);
    }
    let head = String::from_utf8_lossy(&head);
    let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();

    match path.as_str() {
        "/api/v1/stations" => {
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                stations.len(),
                stations
            );
            stream.write_all(response.as_bytes()).await?;
        }
        "/api/v1/events" => event_stream(stream, registry.subscribe()).await?,
        "/api/v1/now/events" => event_stream(stream, now.subscribe()).await?,
        _ => {
            stream
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await?;
        }
    }
    Ok(())
}

async fn event_stream(
    mut stream: TcpStream,
    mut frames: broadcast::Receiver<String>,
) -> std::io::Result<()> {
    stream
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n: connected\n\n")
        .await?;
    stream.flush().await?;
    while let Ok(frame) = frames.recv().await {
        stream.write_all(frame.as_bytes()).await?;
        stream.flush().await?;
    }
    Ok(())
}

fn event(payload: &str) -> String {
    format!("data: {}\n\n", payload)
}

fn station(id: &str, stream_url: &str) -> Station {
    serde_json::from_value(serde_json::json!({
        "station_id": id,
        "name": format!("Station {}", id),
        "frequency": "98.70",
        "stream_url": stream_url,
        "owner_public_key": "ignored",
        "created_at": "2026-01-01T00:00:00Z",
    }))
    .unwrap()
}

/// Local sockets only; keep any proxy settings in the environment out of it.
fn transport() -> HttpTransport {
    HttpTransport::new(reqwest::Client::builder().no_proxy().build().unwrap())
}

/// Output that accepts every source and renders nothing.
struct NullOutput;

impl AudioOutput for NullOutput {
    async fn play(&mut self, _url: &str) -> Result<(), PlaybackError> {
        Ok(())
    }

    async fn stop(&mut self) {}

    async fn set_volume(&mut self, _volume: f32) -> Result<(), PlaybackError> {
        Ok(())
    }

    fn tap(&self) -> Arc<dyn SpectrumTap> {
        Arc::new(SilentTap)
    }
}

#[tokio::test]
async fn test_fetch_station_list_and_missing_path() {
    let node = MockNode::start(r#"[{"station_id":"a","name":"A","frequency":101.5,"stream_url":"http://x/s"}]"#.into())
        .await
        .unwrap();
    let transport = transport();

    let body = transport
        .fetch(&format!("{}/api/v1/stations", node.base_url()))
        .await
        .unwrap();
    let stations: Vec<Station> = serde_json::from_str(&body).unwrap();
    assert_eq!(stations.len(), 1);
    assert_eq!(stations[0].frequency.label(), "101.5");

    let err = transport
        .fetch(&format!("{}/nope", node.base_url()))
        .await
        .unwrap_err();
    assert!(matches!(err, FeedError::Status(404)));
}

#[tokio::test]
async fn test_event_stream_frames_split_across_writes() {
    let node = MockNode::start("[]".into()).await.unwrap();
    let transport = transport();
    let mut messages = transport
        .subscribe(&format!("{}/api/v1/events", node.base_url()))
        .await
        .unwrap();
    node.wait_registry_listener().await;

    node.push_registry("data: {\"event\":");
    tokio::time::sleep(Duration::from_millis(20)).await;
    node.push_registry("\"delete\"}\r\n\r\n: ping\n\ndata: second\n\n");

    let first = tokio::time::timeout(Duration::from_secs(2), messages.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(first, r#"{"event":"delete"}"#);
    let second = tokio::time::timeout(Duration::from_secs(2), messages.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(second, "second");
}

#[tokio::test]
async fn test_core_follows_live_node() {
    // station "a" streams from the node itself, so its now-playing feed lands there too
    let node = MockNode::start(String::new()).await.unwrap();
    let stream_url = node.stream_url();

    let mut config = Config::default();
    config.server.base_url = node.base_url();
    config.tuning.flash_ms = 10;

    let (core, rx) = TunerCore::new(config, Arc::new(transport()), NullOutput);
    let commands = core.sender();
    let mut view = core.subscribe();
    let handle = tokio::spawn(core.run(rx));
    node.wait_registry_listener().await;

    // the seed body is empty, so the list starts empty and the feed fills it
    let upsert = RegistryEvent::Upsert(station("a", &stream_url));
    node.push_registry(&event(&serde_json::to_string(&upsert).unwrap()));
    node.push_registry(&event("{\"event\":\"rename\",\"assignment\":{}}"));
    let upsert_b = RegistryEvent::Upsert(station("b", "http://127.0.0.1:9/stream"));
    node.push_registry(&event(&serde_json::to_string(&upsert_b).unwrap()));

    tokio::time::timeout(Duration::from_secs(2), view.wait_for(|v| v.stations.len() == 2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(view.borrow().selection, Some(0));

    commands
        .send(CoreEvent::Command(ControlCommand::TogglePlay))
        .await
        .unwrap();
    node.wait_now_listener().await;
    node.push_now(&event(r#"{"artist":"Stereolab","title":"Cybele's Reverie","updated_at":"2026-03-01T12:00:00Z"}"#));

    let line = tokio::time::timeout(
        Duration::from_secs(2),
        view.wait_for(|v| v.now_playing.is_some()),
    )
    .await
    .unwrap()
    .unwrap()
    .now_playing_line
    .clone();
    assert_eq!(line.as_deref(), Some("Stereolab - Cybele's Reverie"));
    assert_eq!(view.borrow().playback, PlaybackState::Playing);

    let delete = RegistryEvent::Delete(station("a", &stream_url));
    node.push_registry(&event(&serde_json::to_string(&delete).unwrap()));
    tokio::time::timeout(Duration::from_secs(2), view.wait_for(|v| v.stations.len() == 1))
        .await
        .unwrap()
        .unwrap();
    {
        let v = view.borrow();
        assert_eq!(v.current.as_ref().map(|s| s.station_id.as_str()), Some("b"));
        assert_eq!(v.now_playing, None);
    }

    commands
        .send(CoreEvent::Command(ControlCommand::Shutdown))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(view.borrow().playback, PlaybackState::Stopped);
}
