/// mpv IPC adapter: attaches to a running mpv, turns its property changes into
/// playback commands, and draws captions on the OSD.
///
/// Architecture:
///
/// ```text
///   MpvPlayer::probe()  ── connects once, then pings
///         │
///         ├── writer_task   ← receives PendingRequest via mpsc, serialises → socket
///         ├── reader_task   ← reads JSON lines from socket
///         │                      ├── response (has request_id) → matched oneshot::Sender
///         │                      └── event / property-change   → bridge_task
///         └── bridge_task   ← MpvEvent → Command → engine channel
///
///   osd_task  ← watch<String> of the latest caption → `show-text`
/// ```
///
/// mpv is never spawned here; start it with `--input-ipc-server=<socket>`.
///
/// Platform notes:
/// - Unix:   Unix domain sockets
/// - Windows: Named pipes  \\.\pipe\<name>
use async_trait::async_trait;
use dubline_engine::{EngineEvent, PlayerProbe};
use dubline_proto::protocol::{Command, PlaybackEvent};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

// ── global request-id counter ─────────────────────────────────────────────────

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

// ── observation property IDs ──────────────────────────────────────────────────

/// Fixed observe_property IDs.  We match on these in property-change events.
pub const OBS_TIME_POS: u64 = 1;
pub const OBS_PAUSE: u64 = 2;
pub const OBS_SPEED: u64 = 3;
pub const OBS_PATH: u64 = 4;

// ── internal channel types ────────────────────────────────────────────────────

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// An mpv event / property-change that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// Returns `Some((obs_id, data))` if this is a property-change event.
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.raw.get("event")?.as_str()? == "property-change" {
            let id = self.raw.get("id")?.as_u64()?;
            let data = self.raw.get("data").unwrap_or(&Value::Null);
            Some((id, data))
        } else {
            None
        }
    }

    /// Returns the event name, e.g. "seek", "playback-restart", "end-file".
    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }
}

// ── public handle ─────────────────────────────────────────────────────────────

/// Cloneable handle to the mpv writer task.  Use `send()` to fire a command
/// and await the response.
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

    /// Register observe_property for the playback properties we translate.
    /// Must be called after every fresh connection.
    pub async fn observe_all_properties(&self) {
        let props = [
            (OBS_TIME_POS, "time-pos"),
            (OBS_PAUSE, "pause"),
            (OBS_SPEED, "speed"),
            (OBS_PATH, "path"),
        ];
        for (id, name) in &props {
            match self.send(json!(["observe_property", id, name])).await {
                Ok(_) => debug!("mpv: observe_property id={} name={}", id, name),
                Err(e) => warn!("mpv: observe_property {} failed: {}", name, e),
            }
        }
    }

    /// Show `text` on the OSD for `duration_ms`.  Empty text clears it.
    pub async fn show_text(&self, text: &str, duration_ms: u64) -> anyhow::Result<()> {
        let duration = if text.is_empty() { 1 } else { duration_ms };
        self.send(json!(["show-text", text, duration])).await?;
        Ok(())
    }

    /// Health-check: returns Ok(()) if mpv is responsive.
    pub async fn ping(&self) -> anyhow::Result<()> {
        self.send(json!(["get_property", "mpv-version"])).await?;
        Ok(())
    }
}

// ── player ────────────────────────────────────────────────────────────────────

/// The engine's view of mpv: probing attaches, and the shared handle is what
/// the OSD task writes through.
pub struct MpvPlayer {
    socket_name: String,
    handle: Arc<Mutex<Option<MpvHandle>>>,
    engine_tx: mpsc::Sender<EngineEvent>,
}

impl MpvPlayer {
    pub fn new(socket_name: String, engine_tx: mpsc::Sender<EngineEvent>) -> Self {
        Self {
            socket_name,
            handle: Arc::new(Mutex::new(None)),
            engine_tx,
        }
    }

    /// Start the task that draws the latest caption on the OSD.
    pub fn spawn_osd(&self, captions: watch::Receiver<String>, duration_ms: u64) {
        tokio::spawn(osd_task(self.handle.clone(), captions, duration_ms));
    }

    async fn connect(&self) -> Option<MpvHandle> {
        let (mpv_tx, mpv_rx) = mpsc::channel::<MpvEvent>(256);
        let handle = try_connect(&self.socket_name, mpv_tx).await?;
        tokio::spawn(bridge_task(mpv_rx, self.engine_tx.clone()));
        handle.observe_all_properties().await;
        Some(handle)
    }
}

#[async_trait]
impl PlayerProbe for MpvPlayer {
    async fn probe(&self) -> bool {
        let mut guard = self.handle.lock().await;
        if let Some(h) = guard.as_ref() {
            if h.ping().await.is_ok() {
                return true;
            }
            debug!("mpv: existing connection is dead, reconnecting");
            *guard = None;
        }
        match self.connect().await {
            Some(h) => {
                *guard = Some(h);
                true
            }
            None => false,
        }
    }
}

// ── connection ────────────────────────────────────────────────────────────────

/// Connect to an already-running mpv socket.
#[cfg(unix)]
async fn try_connect(socket_name: &str, event_tx: mpsc::Sender<MpvEvent>) -> Option<MpvHandle> {
    let socket_path = std::path::PathBuf::from(socket_name);
    if !socket_path.exists() {
        return None;
    }
    match UnixStream::connect(&socket_path).await {
        Ok(stream) => {
            info!("mpv: connected to IPC socket {:?}", socket_path);
            let (read_half, write_half) = stream.into_split();
            Some(start_io_tasks(BufReader::new(read_half), write_half, event_tx))
        }
        Err(e) => {
            debug!("mpv: failed to connect: {}", e);
            None
        }
    }
}

#[cfg(windows)]
async fn try_connect(socket_name: &str, event_tx: mpsc::Sender<MpvEvent>) -> Option<MpvHandle> {
    let pipe_path = format!(r"\\.\pipe\{}", socket_name);
    match ClientOptions::new().open(&pipe_path) {
        Ok(client) => {
            info!("mpv: connected to named pipe {}", pipe_path);
            let (read_half, write_half) = tokio::io::split(client);
            Some(start_io_tasks(BufReader::new(read_half), write_half, event_tx))
        }
        Err(e) => {
            debug!("mpv: failed to open named pipe: {}", e);
            None
        }
    }
}

fn start_io_tasks<R, W>(
    reader: BufReader<R>,
    writer: W,
    event_tx: mpsc::Sender<MpvEvent>,
) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    // pending map: req_id → reply channel.  Shared between writer (inserts) and reader (resolves).
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(writer, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(reader, pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

// ── reader task ───────────────────────────────────────────────────────────────

async fn reader_task<R>(
    mut reader: BufReader<R>,
    pending: PendingMap,
    event_tx: mpsc::Sender<MpvEvent>,
) where
    R: tokio::io::AsyncRead + Unpin,
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
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"]
                                .as_str()
                                .unwrap_or("unknown error")
                                .to_string();
                            debug!("mpv reader: response req={} err={}", req_id, err);
                            Err(anyhow::anyhow!("mpv error: {}", err))
                        };
                        let _ = tx.send(result);
                    } else {
                        debug!("mpv reader: response for unknown req={}", req_id);
                    }
                } else if event_tx.send(MpvEvent { raw: val }).await.is_err() {
                    break;
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

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
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

// ── event bridge ──────────────────────────────────────────────────────────────

/// Turns raw mpv events into playback commands.
#[derive(Debug, Default)]
pub struct SignalMapper {
    seek_pending: bool,
    paused: Option<bool>,
    speed: Option<f64>,
}

impl SignalMapper {
    pub fn map(&mut self, evt: &MpvEvent) -> Option<Command> {
        if let Some((id, data)) = evt.as_property_change() {
            return match id {
                OBS_TIME_POS => {
                    let t = data.as_f64()?;
                    let playback = if std::mem::take(&mut self.seek_pending) {
                        PlaybackEvent::Seek { t }
                    } else {
                        PlaybackEvent::TimeUpdate { t }
                    };
                    Some(Command::Playback(playback))
                }
                OBS_PAUSE => {
                    let paused = data.as_bool()?;
                    // The initial observation is a state report, not a transition.
                    let previous = self.paused.replace(paused)?;
                    if previous == paused {
                        return None;
                    }
                    let playback = if paused {
                        PlaybackEvent::Pause
                    } else {
                        PlaybackEvent::Play
                    };
                    Some(Command::Playback(playback))
                }
                OBS_SPEED => {
                    let speed = data.as_f64()?;
                    let previous = self.speed.replace(speed)?;
                    (previous != speed).then_some(Command::Playback(PlaybackEvent::RateChange))
                }
                OBS_PATH => {
                    let path = data.as_str()?;
                    Some(Command::ContextChanged {
                        media_id: path.to_string(),
                    })
                }
                _ => None,
            };
        }

        if evt.event_name() == Some("seek") {
            self.seek_pending = true;
        }
        None
    }
}

async fn bridge_task(mut rx: mpsc::Receiver<MpvEvent>, engine_tx: mpsc::Sender<EngineEvent>) {
    let mut mapper = SignalMapper::default();
    while let Some(evt) = rx.recv().await {
        let Some(cmd) = mapper.map(&evt) else {
            continue;
        };
        if engine_tx.send(EngineEvent::Command(cmd)).await.is_err() {
            break;
        }
    }
    debug!("mpv bridge: task exiting");
}

// ── OSD ───────────────────────────────────────────────────────────────────────

async fn osd_task(
    handle: Arc<Mutex<Option<MpvHandle>>>,
    mut captions: watch::Receiver<String>,
    duration_ms: u64,
) {
    while captions.changed().await.is_ok() {
        let text = captions.borrow_and_update().clone();
        let current = handle.lock().await.clone();
        let Some(h) = current else {
            continue;
        };
        if let Err(e) = h.show_text(&text, duration_ms).await {
            debug!("mpv: show-text failed: {}", e);
        }
    }
    debug!("mpv osd: task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prop(id: u64, data: Value) -> MpvEvent {
        MpvEvent {
            raw: json!({ "event": "property-change", "id": id, "data": data }),
        }
    }

    fn event(name: &str) -> MpvEvent {
        MpvEvent {
            raw: json!({ "event": name }),
        }
    }

    #[test]
    fn test_time_pos_becomes_time_update() {
        let mut m = SignalMapper::default();
        assert_eq!(
            m.map(&prop(OBS_TIME_POS, json!(12.5))),
            Some(Command::Playback(PlaybackEvent::TimeUpdate { t: 12.5 }))
        );
        assert_eq!(m.map(&prop(OBS_TIME_POS, Value::Null)), None);
    }

    #[test]
    fn test_seek_marks_next_position() {
        let mut m = SignalMapper::default();
        assert_eq!(m.map(&event("seek")), None);
        assert_eq!(
            m.map(&prop(OBS_TIME_POS, json!(40.0))),
            Some(Command::Playback(PlaybackEvent::Seek { t: 40.0 }))
        );
        assert_eq!(
            m.map(&prop(OBS_TIME_POS, json!(40.2))),
            Some(Command::Playback(PlaybackEvent::TimeUpdate { t: 40.2 }))
        );
    }

    #[test]
    fn test_pause_transitions_only() {
        let mut m = SignalMapper::default();
        assert_eq!(m.map(&prop(OBS_PAUSE, json!(false))), None);
        assert_eq!(
            m.map(&prop(OBS_PAUSE, json!(true))),
            Some(Command::Playback(PlaybackEvent::Pause))
        );
        assert_eq!(m.map(&prop(OBS_PAUSE, json!(true))), None);
        assert_eq!(
            m.map(&prop(OBS_PAUSE, json!(false))),
            Some(Command::Playback(PlaybackEvent::Play))
        );
    }

    #[test]
    fn test_speed_change_is_rate_change() {
        let mut m = SignalMapper::default();
        assert_eq!(m.map(&prop(OBS_SPEED, json!(1.0))), None);
        assert_eq!(
            m.map(&prop(OBS_SPEED, json!(1.5))),
            Some(Command::Playback(PlaybackEvent::RateChange))
        );
    }

    #[test]
    fn test_path_is_context() {
        let mut m = SignalMapper::default();
        assert_eq!(
            m.map(&prop(OBS_PATH, json!("https://example.com/watch?v=abc"))),
            Some(Command::ContextChanged {
                media_id: "https://example.com/watch?v=abc".to_string()
            })
        );
        assert_eq!(m.map(&prop(OBS_PATH, Value::Null)), None);
        assert_eq!(m.map(&event("end-file")), None);
    }

    #[tokio::test]
    async fn test_reader_routes_responses_and_events() {
        let (client, server) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(client);
        let (evt_tx, mut evt_rx) = mpsc::channel(8);
        let handle = start_io_tasks(BufReader::new(read_half), write_half, evt_tx);

        let pong = tokio::spawn(async move { handle.ping().await });

        let (server_read, mut server_write) = tokio::io::split(server);
        let mut server_reader = BufReader::new(server_read);
        let mut line = String::new();
        server_reader.read_line(&mut line).await.unwrap();
        let req: Value = serde_json::from_str(&line).unwrap();
        let req_id = req["request_id"].as_u64().unwrap();
        assert_eq!(req["command"], json!(["get_property", "mpv-version"]));

        let reply = format!(
            "{}\n{}\n",
            json!({ "event": "seek" }),
            json!({ "request_id": req_id, "error": "success", "data": "mpv 0.38" })
        );
        server_write.write_all(reply.as_bytes()).await.unwrap();

        assert!(pong.await.unwrap().is_ok());
        let evt = evt_rx.recv().await.unwrap();
        assert_eq!(evt.event_name(), Some("seek"));
    }
}
