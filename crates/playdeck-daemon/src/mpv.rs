//! mpv-backed audio engine.
//!
//! Each bound track entry owns its own mpv process, spawned paused on the
//! resolved URI and driven over mpv's JSON IPC socket:
//!
//! ```text
//!   EngineHandle ── EngineCommand ──► instance task ── JSON IPC ──► mpv
//!                                          │
//!          property changes / events  ◄────┘
//!          (status cache + EngineEvent lifecycle)
//! ```
//!
//! IPC responses are matched to requests by `request_id`; everything without
//! one is an unsolicited event or property change.
//!
//! Platform notes:
//! - Unix:    Unix domain sockets
//! - Windows: Named pipes  \\.\pipe\<name>

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use playdeck_proto::platform;
use playdeck_proto::protocol::TrackEntry;

use crate::engine::{
    EngineCommand, EngineEvent, EngineEventKind, EngineFactory, EngineHandle, EngineStatus,
};

// ── global counters ───────────────────────────────────────────────────────────

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

// ── observation property IDs ──────────────────────────────────────────────────

/// Fixed observe_property IDs.  We match on these in property-change events.
const OBS_PAUSE: u64 = 1;
const OBS_CORE_IDLE: u64 = 2;
const OBS_TIME_POS: u64 = 3;
const OBS_DURATION: u64 = 4;
const OBS_SPEED: u64 = 5;
const OBS_EOF_REACHED: u64 = 6;

// ── internal channel types ────────────────────────────────────────────────────

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// An mpv event / property-change that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
struct IpcEvent {
    raw: Value,
}

impl IpcEvent {
    /// Returns `Some((obs_id, data))` if this is a property-change event.
    fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.raw.get("event")?.as_str()? == "property-change" {
            let id = self.raw.get("id")?.as_u64()?;
            let data = self.raw.get("data").unwrap_or(&Value::Null);
            Some((id, data))
        } else {
            None
        }
    }

    /// Returns the event name, e.g. "end-file", "start-file", "file-loaded".
    fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    /// For an "end-file" caused by an error, the error string.
    fn end_file_error(&self) -> Option<String> {
        if self.event_name()? != "end-file" {
            return None;
        }
        match self.raw.get("reason").and_then(|r| r.as_str()) {
            Some("error") => Some(
                self.raw
                    .get("file_error")
                    .and_then(|e| e.as_str())
                    .unwrap_or("unknown error")
                    .to_string(),
            ),
            _ => None,
        }
    }
}

// ── IPC handle ────────────────────────────────────────────────────────────────

/// Cheaply cloneable handle to the IPC writer task.  `send()` fires a command
/// and awaits the matched response.
#[derive(Clone)]
struct IpcHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl IpcHandle {
    async fn send(&self, command: Value) -> anyhow::Result<Value> {
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

    async fn set_property(&self, name: &str, value: Value) -> anyhow::Result<()> {
        self.send(json!(["set_property", name, value])).await?;
        Ok(())
    }

    /// Register observe_property for all properties we care about.  mpv will
    /// push property-change events whenever any of these change.
    async fn observe_all_properties(&self) {
        let props = [
            (OBS_PAUSE, "pause"),
            (OBS_CORE_IDLE, "core-idle"),
            (OBS_TIME_POS, "time-pos"),
            (OBS_DURATION, "duration"),
            (OBS_SPEED, "speed"),
            (OBS_EOF_REACHED, "eof-reached"),
        ];
        for (id, name) in &props {
            match self.send(json!(["observe_property", id, name])).await {
                Ok(_) => debug!("mpv: observe_property id={} name={}", id, name),
                Err(e) => warn!("mpv: observe_property {} failed: {}", name, e),
            }
        }
    }
}

// ── factory ───────────────────────────────────────────────────────────────────

pub struct MpvEngineFactory;

impl MpvEngineFactory {
    pub fn new() -> Self {
        Self
    }
}

impl EngineFactory for MpvEngineFactory {
    fn bind(
        &mut self,
        entry: &TrackEntry,
        uri: &str,
        volume: f32,
        muted: bool,
        events: mpsc::Sender<EngineEvent>,
    ) -> anyhow::Result<EngineHandle> {
        let (handle, cmd_rx, status) = EngineHandle::new();
        let instance = Instance {
            track_id: entry.id.clone(),
            uri: uri.to_string(),
            volume,
            muted,
        };
        tokio::spawn(instance.run(cmd_rx, status, events));
        Ok(handle)
    }
}

/// IPC socket tag unique to one bound instance.  Ids come from arbitrary
/// catalogues, so anything outside [A-Za-z0-9] is folded away.
fn instance_tag(track_id: &str) -> String {
    let seq = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
    let sanitized: String = track_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .take(24)
        .collect();
    format!("{}-{}", sanitized, seq)
}

// ── instance ──────────────────────────────────────────────────────────────────

struct Instance {
    track_id: String,
    uri: String,
    volume: f32,
    muted: bool,
}

impl Instance {
    async fn run(
        self,
        cmd_rx: mpsc::UnboundedReceiver<EngineCommand>,
        status: Arc<Mutex<EngineStatus>>,
        events: mpsc::Sender<EngineEvent>,
    ) {
        let tag = instance_tag(&self.track_id);
        let (ipc_event_tx, ipc_events) = mpsc::channel::<IpcEvent>(64);
        match self.spawn_and_connect(&tag, ipc_event_tx).await {
            Ok((child, ipc)) => {
                self.drive(child, ipc, ipc_events, cmd_rx, status, events)
                    .await
            }
            Err(e) => {
                warn!("mpv: failed to start engine for {}: {}", self.track_id, e);
                emit(&events, &self.track_id, EngineEventKind::LoadError(e.to_string())).await;
            }
        }
    }

    async fn spawn_and_connect(
        &self,
        tag: &str,
        ipc_event_tx: mpsc::Sender<IpcEvent>,
    ) -> anyhow::Result<(tokio::process::Child, IpcHandle)> {
        let mpv_binary = platform::find_mpv_binary()
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;

        #[cfg(unix)]
        {
            let socket_path = std::path::PathBuf::from(platform::engine_socket_name(tag));
            let _ = tokio::fs::remove_file(&socket_path).await;
        }

        let vol_arg = format!(
            "--volume={}",
            (self.volume * 100.0).clamp(0.0, 100.0).round() as i64
        );
        let mute_arg = format!("--mute={}", if self.muted { "yes" } else { "no" });
        let ipc_arg = platform::engine_socket_arg(tag);

        info!("mpv: spawning engine for {}", self.track_id);
        let child = tokio::process::Command::new(mpv_binary)
            .arg("--no-video")
            .arg("--pause=yes")
            .arg("--keep-open=yes")
            .arg(&ipc_arg)
            .arg("--quiet")
            .arg(vol_arg)
            .arg(mute_arg)
            .arg(&self.uri)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()?;

        let stream = connect(tag).await?;
        Ok((child, start_io_tasks(stream, ipc_event_tx)))
    }

    async fn drive(
        self,
        mut child: tokio::process::Child,
        ipc: IpcHandle,
        mut ipc_events: mpsc::Receiver<IpcEvent>,
        mut cmd_rx: mpsc::UnboundedReceiver<EngineCommand>,
        status: Arc<Mutex<EngineStatus>>,
        events: mpsc::Sender<EngineEvent>,
    ) {
        ipc.observe_all_properties().await;

        let mut paused = true;
        let mut idle = true;
        let mut loaded = false;
        let mut ended = false;
        let mut was_playing = false;
        let mut unloading = false;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(EngineCommand::Play) => {
                        if ended {
                            let _ = ipc.set_property("time-pos", json!(0.0)).await;
                            ended = false;
                        }
                        if let Err(e) = ipc.set_property("pause", json!(false)).await {
                            warn!("mpv: play failed for {}: {}", self.track_id, e);
                        }
                    }
                    Some(EngineCommand::Pause) => {
                        let _ = ipc.set_property("pause", json!(true)).await;
                        paused = true;
                        was_playing = false;
                        set_playing(&status, false);
                        emit(&events, &self.track_id, EngineEventKind::Paused).await;
                    }
                    Some(EngineCommand::Stop) => {
                        let _ = ipc.set_property("pause", json!(true)).await;
                        let _ = ipc.set_property("time-pos", json!(0.0)).await;
                        paused = true;
                        was_playing = false;
                        set_playing(&status, false);
                        emit(&events, &self.track_id, EngineEventKind::Stopped).await;
                    }
                    Some(EngineCommand::SeekTo(secs)) => {
                        let _ = ipc.set_property("time-pos", json!(secs)).await;
                    }
                    Some(EngineCommand::SetVolume(v)) => {
                        let vol_pct = (v * 100.0).clamp(0.0, 100.0);
                        let _ = ipc.set_property("volume", json!(vol_pct)).await;
                    }
                    Some(EngineCommand::SetMuted(m)) => {
                        let _ = ipc.set_property("mute", json!(m)).await;
                    }
                    Some(EngineCommand::Unload) | None => {
                        unloading = true;
                        let _ = ipc.send(json!(["quit"])).await;
                        break;
                    }
                },
                ev = ipc_events.recv() => match ev {
                    Some(ev) => {
                        if let Some((obs_id, data)) = ev.as_property_change() {
                            match obs_id {
                                OBS_PAUSE => paused = data.as_bool().unwrap_or(paused),
                                OBS_CORE_IDLE => idle = data.as_bool().unwrap_or(idle),
                                OBS_TIME_POS => {
                                    if let Some(v) = data.as_f64() {
                                        lock_status(&status).position = v;
                                    }
                                }
                                OBS_DURATION => {
                                    if let Some(v) = data.as_f64() {
                                        lock_status(&status).duration = v;
                                    }
                                }
                                OBS_SPEED => {
                                    if let Some(v) = data.as_f64() {
                                        lock_status(&status).rate = v;
                                    }
                                }
                                OBS_EOF_REACHED => {
                                    if data.as_bool() == Some(true) && !ended {
                                        ended = true;
                                        was_playing = false;
                                        set_playing(&status, false);
                                        emit(&events, &self.track_id, EngineEventKind::Ended).await;
                                    }
                                }
                                _ => {}
                            }
                            let playing = loaded && !paused && !idle && !ended;
                            set_playing(&status, playing);
                            if playing && !was_playing {
                                was_playing = true;
                                emit(&events, &self.track_id, EngineEventKind::Started).await;
                            } else if !playing {
                                was_playing = false;
                            }
                        } else {
                            match ev.event_name() {
                                Some("file-loaded") => {
                                    if !loaded {
                                        loaded = true;
                                        emit(&events, &self.track_id, EngineEventKind::Loaded).await;
                                    }
                                }
                                Some("end-file") => {
                                    if let Some(err) = ev.end_file_error() {
                                        was_playing = false;
                                        set_playing(&status, false);
                                        let kind = if loaded {
                                            EngineEventKind::PlayError(err)
                                        } else {
                                            EngineEventKind::LoadError(err)
                                        };
                                        emit(&events, &self.track_id, kind).await;
                                    }
                                }
                                _ => {}
                            }
                        }
                    }
                    None => {
                        if !unloading {
                            set_playing(&status, false);
                            let kind = if loaded {
                                EngineEventKind::PlayError("mpv exited unexpectedly".to_string())
                            } else {
                                EngineEventKind::LoadError("mpv exited during load".to_string())
                            };
                            emit(&events, &self.track_id, kind).await;
                        }
                        break;
                    }
                }
            }
        }

        let _ = child.kill().await;
        debug!("mpv: engine for {} shut down", self.track_id);
    }
}

#[cfg(unix)]
async fn connect(tag: &str) -> anyhow::Result<tokio::net::UnixStream> {
    let socket_path = std::path::PathBuf::from(platform::engine_socket_name(tag));
    for _ in 0..50 {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        if socket_path.exists() {
            if let Ok(stream) = tokio::net::UnixStream::connect(&socket_path).await {
                info!("mpv: connected to IPC socket");
                return Ok(stream);
            }
        }
    }
    anyhow::bail!("mpv IPC socket did not appear")
}

#[cfg(windows)]
async fn connect(tag: &str) -> anyhow::Result<tokio::net::windows::named_pipe::NamedPipeClient> {
    let pipe_path = format!(r"\\.\pipe\{}", platform::engine_socket_name(tag));
    for _ in 0..50 {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        if let Ok(client) = tokio::net::windows::named_pipe::ClientOptions::new().open(&pipe_path) {
            info!("mpv: connected to named pipe");
            return Ok(client);
        }
    }
    anyhow::bail!("mpv named pipe did not appear")
}

fn start_io_tasks<S>(stream: S, event_tx: mpsc::Sender<IpcEvent>) -> IpcHandle
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let reader = BufReader::new(read_half);

    // pending map: req_id → reply channel.  Shared between writer (inserts)
    // and reader (resolves).
    let pending: Arc<AsyncMutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>> =
        Arc::new(AsyncMutex::new(HashMap::new()));

    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(reader, pending, event_tx));

    IpcHandle { tx: cmd_tx }
}

fn lock_status(status: &Arc<Mutex<EngineStatus>>) -> std::sync::MutexGuard<'_, EngineStatus> {
    status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn set_playing(status: &Arc<Mutex<EngineStatus>>, playing: bool) {
    lock_status(status).playing = playing;
}

async fn emit(events: &mpsc::Sender<EngineEvent>, id: &str, kind: EngineEventKind) {
    let _ = events
        .send(EngineEvent {
            id: id.to_string(),
            kind,
        })
        .await;
}

// ── reader task ───────────────────────────────────────────────────────────────

async fn reader_task<R>(
    mut reader: BufReader<R>,
    pending: Arc<AsyncMutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>,
    event_tx: mpsc::Sender<IpcEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                let mut map = pending.lock().await;
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(anyhow::anyhow!("mpv IPC connection closed")));
                }
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
                    // This is a command response — route to pending request
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"]
                                .as_str()
                                .unwrap_or("unknown error")
                                .to_string();
                            Err(anyhow::anyhow!("mpv error: {}", err))
                        };
                        let _ = tx.send(result);
                    } else {
                        debug!("mpv reader: response for unknown req={}", req_id);
                    }
                } else {
                    // Unsolicited event / property-change
                    let _ = event_tx.send(IpcEvent { raw: val }).await;
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                let mut map = pending.lock().await;
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(anyhow::anyhow!("mpv IPC read error: {}", e)));
                }
                break;
            }
        }
    }
}

// ── writer task ───────────────────────────────────────────────────────────────

async fn writer_task<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<PendingRequest>,
    pending: Arc<AsyncMutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register reply channel before writing so reader can match it
        {
            let mut map = pending.lock().await;
            map.insert(req.req_id, req.reply);
        }
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            let mut map = pending.lock().await;
            if let Some(tx) = map.remove(&req.req_id) {
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
    fn test_instance_tag_sanitizes_ids() {
        let tag = instance_tag("netease|track/99:12");
        let (head, seq) = tag.rsplit_once('-').unwrap();
        assert_eq!(head, "netease-track-99-12");
        assert!(seq.parse::<u64>().is_ok());
    }

    #[test]
    fn test_instance_tags_are_unique_per_bind() {
        let a = instance_tag("same");
        let b = instance_tag("same");
        assert_ne!(a, b);
    }

    #[test]
    fn test_property_change_parsing() {
        let ev = IpcEvent {
            raw: json!({"event": "property-change", "id": 4, "data": 187.3}),
        };
        let (id, data) = ev.as_property_change().unwrap();
        assert_eq!(id, OBS_DURATION);
        assert_eq!(data.as_f64(), Some(187.3));
    }

    #[test]
    fn test_end_file_error_extraction() {
        let ev = IpcEvent {
            raw: json!({"event": "end-file", "reason": "error", "file_error": "loading failed"}),
        };
        assert_eq!(ev.end_file_error().as_deref(), Some("loading failed"));

        let eof = IpcEvent {
            raw: json!({"event": "end-file", "reason": "eof"}),
        };
        assert_eq!(eof.end_file_error(), None);

        let other = IpcEvent {
            raw: json!({"event": "file-loaded"}),
        };
        assert_eq!(other.end_file_error(), None);
        assert_eq!(other.event_name(), Some("file-loaded"));
    }
}
