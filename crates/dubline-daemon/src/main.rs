mod backend;
mod http;
mod mpv;
mod socket;

use std::sync::Arc;

use dubline_engine::{Collaborators, EngineEvent, HydrationEngine, Renderer};
use dubline_proto::config::Config;
use dubline_proto::protocol::{Command, Settings};
use tokio::sync::{broadcast, watch};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    /// Text handed to the renderer; empty means blank.
    Caption(String),
    Log(String),
}

/// A custom tracing layer that forwards log messages to the broadcast channel
struct BroadcastLayer {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        // Only forward WARN and ERROR so per-tick debug output stays in the file
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = String::new();
        let now = chrono::Local::now();
        message.push_str(&format!("{} ", now.format("%H:%M:%S")));
        message.push_str(&format!("[{}] ", level));

        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // No receivers is OK
        let _ = self.sender.send(BroadcastMessage::Log(message));
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

/// Fans each caption out to the mpv OSD task and to socket clients.
/// Both sends are non-blocking; the OSD only ever sees the latest text.
struct CaptionSink {
    osd: watch::Sender<String>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
}

impl Renderer for CaptionSink {
    fn render(&self, text: &str) {
        self.osd.send_replace(text.to_string());
        let _ = self
            .broadcast_tx
            .send(BroadcastMessage::Caption(text.to_string()));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Setup broadcast channel first so we can use it for logging
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);

    let data_dir = dubline_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    let broadcast_layer = BroadcastLayer::new(broadcast_tx.clone());

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(broadcast_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(
                    "info,dubline_daemon=debug,dubline_engine=debug",
                )
            }),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    // Event channel: all external inputs funnel into the engine
    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<EngineEvent>(256);

    let player = Arc::new(mpv::MpvPlayer::new(
        config.player.mpv_socket.clone(),
        event_tx.clone(),
    ));
    let (osd_tx, osd_rx) = watch::channel(String::new());
    player.spawn_osd(osd_rx, config.player.osd_duration_ms);

    let deps = Collaborators {
        backend: Arc::new(backend::HttpBackend::new(&config.backend)),
        probe: player,
        renderer: Arc::new(CaptionSink {
            osd: osd_tx,
            broadcast_tx: broadcast_tx.clone(),
        }),
    };

    let settings = Settings {
        language: config.defaults.language.clone(),
        hint: config.defaults.hint.clone(),
    };
    let engine = HydrationEngine::new(
        config.engine.clone(),
        settings.clone(),
        deps,
        event_tx.clone(),
    );
    let state_rx = engine.subscribe();

    let _socket_handle = socket::start_server(
        config.http.bind_address.clone(),
        dubline_proto::platform::DAEMON_TCP_PORT,
        state_rx.clone(),
        event_tx.clone(),
        broadcast_tx.clone(),
    );

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            state_rx.clone(),
            event_tx.clone(),
        );
    }

    if config.defaults.enable_on_start {
        event_tx
            .send(EngineEvent::Command(Command::Enable { settings }))
            .await?;
    }

    info!("Daemon initialised, running event loop");
    engine.run(event_rx).await?;

    Ok(())
}
