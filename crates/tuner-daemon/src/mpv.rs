//! mpv IPC driver with separated reader/writer tasks.
//!
//! ```text
//!   MpvDriver::spawn_and_connect()
//!         │
//!         ├── writer_task   ← receives PendingRequest via mpsc, serialises → socket
//!         └── reader_task   ← reads JSON lines from socket
//!                                ├── response (has request_id) → matched oneshot::Sender
//!                                └── event (end-file, file-loaded, …) → event_tx channel
//! ```
//!
//! Platform notes:
//! - Unix:   Unix domain sockets
//! - Windows: Named pipes  \\.\pipe\<name>

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line, '\n' terminated
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// An unsolicited mpv event (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// e.g. "end-file", "start-file", "file-loaded".
    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    /// `reason` of an end-file event: "eof", "stop", "quit", "error", "redirect", …
    pub fn end_file_reason(&self) -> Option<&str> {
        if self.event_name()? != "end-file" {
            return None;
        }
        self.raw.get("reason")?.as_str()
    }

    pub fn file_error(&self) -> Option<&str> {
        self.raw.get("file_error")?.as_str()
    }
}

/// Cloneable handle to the writer task.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(tokio::time::Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    pub async fn load_stream(&self, url: &str, volume: f32) -> anyhow::Result<()> {
        debug!("mpv: loadfile {}", url);
        self.send(json!(["loadfile", url])).await?;
        self.set_volume(volume).await
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.send(json!(["stop"])).await?;
        Ok(())
    }

    pub async fn set_volume(&self, volume: f32) -> anyhow::Result<()> {
        let vol_pct = (volume * 100.0).clamp(0.0, 100.0);
        self.send(json!(["set_property", "volume", vol_pct])).await?;
        Ok(())
    }
}

/// Owns the mpv child process.
pub struct MpvDriver {
    socket_name: String,
    process: Option<tokio::process::Child>,
    pub last_volume: f32,
}

impl MpvDriver {
    pub fn new(volume: f32) -> Self {
        Self {
            socket_name: tuner_proto::platform::mpv_socket_name(),
            process: None,
            last_volume: volume,
        }
    }

    pub fn process_alive(&mut self) -> bool {
        let Some(child) = self.process.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                match status.code() {
                    Some(code) => warn!("mpv: process exited with code {}", code),
                    None => warn!("mpv: process terminated by signal"),
                }
                false
            }
            Err(e) => {
                warn!("mpv: liveness check failed: {}", e);
                false
            }
        }
    }

    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
    }

    fn command(&self) -> anyhow::Result<tokio::process::Command> {
        let mpv_binary = tuner_proto::platform::find_mpv_binary()
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;
        let vol_arg = format!(
            "--volume={}",
            (self.last_volume * 100.0).clamp(0.0, 100.0).round() as i64
        );
        let mut cmd = tokio::process::Command::new(mpv_binary);
        cmd.arg("--no-video")
            .arg("--idle=yes")
            .arg(tuner_proto::platform::mpv_socket_arg())
            .arg("--quiet")
            .arg(vol_arg)
            .stdout(std::process::Stdio::null())
            .kill_on_drop(true);
        Ok(cmd)
    }

    #[cfg(unix)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.kill().await;

        let socket_path = std::path::PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;

        let stderr_path = tuner_proto::platform::data_dir().join("mpv-stderr.log");
        let stderr_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&stderr_path)?;
        info!("mpv: spawning, stderr → {:?}", stderr_path);

        let child = self.command()?.stderr(stderr_file).spawn()?;
        info!("mpv: spawned process with pid {:?}", child.id());
        self.process = Some(child);

        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            anyhow::bail!("mpv IPC socket did not appear");
        }

        let stream = UnixStream::connect(&socket_path).await?;
        info!("mpv: connected to IPC socket");
        let (read_half, write_half) = stream.into_split();
        Ok(start_io_tasks(read_half, write_half, event_tx))
    }

    #[cfg(windows)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.kill().await;

        info!("mpv: spawning");
        let child = self
            .command()?
            .stderr(std::process::Stdio::null())
            .spawn()?;
        self.process = Some(child);

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                info!("mpv: connected to named pipe");
                let (read_half, write_half) = tokio::io::split(client);
                return Ok(start_io_tasks(read_half, write_half, event_tx));
            }
        }
        anyhow::bail!("mpv named pipe did not appear")
    }
}

fn start_io_tasks<R, W>(read_half: R, write_half: W, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    // req_id → reply channel, shared between writer (inserts) and reader (resolves)
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(BufReader::new(read_half), pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

async fn fail_pending(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("mpv IPC {}", reason)));
    }
}

async fn reader_task<R>(mut reader: BufReader<R>, pending: PendingMap, event_tx: mpsc::Sender<MpvEvent>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_pending(&pending, "connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let mut map = pending.lock().await;
                    let Some(tx) = map.remove(&req_id) else {
                        debug!("mpv reader: response for unknown req={}", req_id);
                        continue;
                    };
                    let result = if val["error"].as_str() == Some("success") {
                        Ok(val)
                    } else {
                        let err = val["error"].as_str().unwrap_or("unknown error").to_string();
                        debug!("mpv reader: response req={} err={}", req_id, err);
                        Err(anyhow::anyhow!("mpv error: {}", err))
                    };
                    let _ = tx.send(result);
                } else {
                    debug!("mpv reader: event {}", trimmed);
                    let _ = event_tx.send(MpvEvent { raw: val }).await;
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_pending(&pending, "read error").await;
                break;
            }
        }
    }
}

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // register before writing so the reader can match the reply
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("mpv writer: req={} {}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_file_reason() {
        let evt = MpvEvent {
            raw: json!({"event":"end-file","reason":"error","file_error":"loading failed"}),
        };
        assert_eq!(evt.event_name(), Some("end-file"));
        assert_eq!(evt.end_file_reason(), Some("error"));
        assert_eq!(evt.file_error(), Some("loading failed"));

        let loaded = MpvEvent {
            raw: json!({"event":"file-loaded"}),
        };
        assert_eq!(loaded.end_file_reason(), None);
    }

    #[tokio::test]
    async fn test_reply_routed_by_request_id() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client);
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let handle = start_io_tasks(client_read, client_write, event_tx);

        let fake_mpv = tokio::spawn(async move {
            let (server_read, mut server_write) = tokio::io::split(server);
            let mut lines = BufReader::new(server_read).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            let req: Value = serde_json::from_str(&line).unwrap();
            let id = req["request_id"].as_u64().unwrap();
            let out = format!(
                "{}\n{}\n",
                json!({"event":"start-file"}),
                json!({"request_id": id, "error": "success", "data": null})
            );
            server_write.write_all(out.as_bytes()).await.unwrap();
            req
        });

        handle.send(json!(["stop"])).await.unwrap();
        let req = fake_mpv.await.unwrap();
        assert_eq!(req["command"], json!(["stop"]));
        let evt = event_rx.recv().await.unwrap();
        assert_eq!(evt.event_name(), Some("start-file"));
    }

    #[tokio::test]
    async fn test_error_reply_is_err() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client);
        let (event_tx, _event_rx) = mpsc::channel(8);
        let handle = start_io_tasks(client_read, client_write, event_tx);

        tokio::spawn(async move {
            let (server_read, mut server_write) = tokio::io::split(server);
            let mut lines = BufReader::new(server_read).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            let req: Value = serde_json::from_str(&line).unwrap();
            let reply = json!({"request_id": req["request_id"], "error": "property not found"});
            server_write
                .write_all(format!("{}\n", reply).as_bytes())
                .await
                .unwrap();
            // keep the pipe open until the client has read the reply
            let _ = lines.next_line().await;
        });

        let err = handle.set_volume(0.4).await.unwrap_err();
        assert!(err.to_string().contains("property not found"));
    }
}
