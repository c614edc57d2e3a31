//! HydrationEngine: single-owner event loop for the caption session.
//!
//! All inputs (client commands, playback signals, results of spawned work)
//! arrive as `EngineEvent`s on one channel.  The engine owns the session,
//! the cache, the coordinator and the mode machine exclusively; spawned tasks
//! never touch them and only report back with a generation/sequence/epoch
//! tag so stale reports can be dropped.
//!
//! After every event the engine publishes an `EngineState` snapshot on a
//! `watch` channel for the socket and HTTP servers.
use std::sync::Arc;

use dubline_proto::config::EngineConfig;
use dubline_proto::protocol::{Command, EngineState, Line, Mode, PlaybackEvent, Settings};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{Backend, PlayerProbe, Renderer};
use crate::cache::WindowCache;
use crate::coordinator::{
    HydrationOutcome, HydrationRequest, RequestCoordinator, WindowSpan,
};
use crate::error::EngineError;
use crate::mode::ModeMachine;
use crate::scheduler::TickScheduler;
use crate::selection::caption_at;

// ── EngineEvent ───────────────────────────────────────────────────────────────

/// All inputs into the engine loop.
#[derive(Debug)]
pub enum EngineEvent {
    /// A command from a client or the player adapter.
    Command(Command),
    /// A fetch-then-translate task finished.
    Hydrated(HydrationOutcome),
    /// The attach loop for `seq` finished.
    AttachFinished { seq: u64, attached: bool },
    /// The Error→Active timer for `epoch` fired.
    RecoveryElapsed { epoch: u64 },
    /// Shutdown requested.
    Shutdown,
}

/// Collaborators the engine drives.
#[derive(Clone)]
pub struct Collaborators {
    pub backend: Arc<dyn Backend>,
    pub probe: Arc<dyn PlayerProbe>,
    pub renderer: Arc<dyn Renderer>,
}

#[derive(Debug, Clone, PartialEq)]
struct Session {
    enabled: bool,
    language: String,
    hint: String,
    media_id: Option<String>,
}

// ── HydrationEngine ───────────────────────────────────────────────────────────

pub struct HydrationEngine {
    config: EngineConfig,
    session: Session,
    mode: ModeMachine,
    cache: WindowCache,
    coordinator: RequestCoordinator,
    scheduler: TickScheduler,
    deps: Collaborators,
    /// Channel spawned tasks report back on.
    event_tx: mpsc::Sender<EngineEvent>,
    state_tx: watch::Sender<EngineState>,
    /// Last known playback position, accepted or not.
    position: Option<f64>,
    ad_playing: bool,
    /// Last text handed to the renderer.
    caption: String,
    attach_seq: u64,
    recovery_epoch: u64,
}

impl HydrationEngine {
    pub fn new(
        config: EngineConfig,
        settings: Settings,
        deps: Collaborators,
        event_tx: mpsc::Sender<EngineEvent>,
    ) -> Self {
        let span = WindowSpan {
            back: config.lookback_secs,
            forward: config.lookforward_secs(),
            lookahead: config.lookahead_secs,
        };
        let session = Session {
            enabled: false,
            language: settings.language,
            hint: settings.hint,
            media_id: None,
        };
        let (state_tx, _) = watch::channel(EngineState::default());

        let engine = Self {
            cache: WindowCache::new(config.cache_ttl(), config.cache_capacity),
            coordinator: RequestCoordinator::new(span, config.request_timeout()),
            scheduler: TickScheduler::new(config.min_tick_interval()),
            config,
            session,
            mode: ModeMachine::new(),
            deps,
            event_tx,
            state_tx,
            position: None,
            ad_playing: false,
            caption: String::new(),
            attach_seq: 0,
            recovery_epoch: 0,
        };
        engine.publish();
        engine
    }

    /// Subscribe to state snapshots.
    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.state_tx.subscribe()
    }

    pub fn mode(&self) -> Mode {
        self.mode.mode()
    }

    pub fn caption(&self) -> &str {
        &self.caption
    }

    /// Whether a live window is cached for the bucket holding `t`.
    #[doc(hidden)]
    pub fn is_cached(&self, media_id: &str, language: &str, t: f64) -> bool {
        self.cache.contains(media_id, language, t)
    }

    /// Run the engine loop.  Returns when a `Shutdown` event is received or
    /// every sender is gone.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<EngineEvent>) -> Result<(), EngineError> {
        info!("HydrationEngine: starting event loop");
        while let Some(evt) = event_rx.recv().await {
            if !self.handle_event(evt) {
                info!("HydrationEngine: shutdown requested");
                self.shutdown();
                return Ok(());
            }
        }
        info!("HydrationEngine: event channel closed, shutting down");
        self.shutdown();
        Err(EngineError::ChannelClosed)
    }

    /// Apply one event.  Returns `false` on shutdown.
    pub fn handle_event(&mut self, evt: EngineEvent) -> bool {
        match evt {
            EngineEvent::Command(cmd) => self.handle_command(cmd),
            EngineEvent::Hydrated(outcome) => self.on_hydrated(outcome),
            EngineEvent::AttachFinished { seq, attached } => self.on_attach_finished(seq, attached),
            EngineEvent::RecoveryElapsed { epoch } => self.on_recovery_elapsed(epoch),
            EngineEvent::Shutdown => return false,
        }
        self.publish();
        true
    }

    // ── command handlers ──────────────────────────────────────────────────────

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Enable { settings } => self.enable(settings),
            Command::Disable => self.disable(),
            Command::SettingsChanged { enabled, settings } => {
                self.on_settings_changed(enabled, settings)
            }
            Command::ContextChanged { media_id } => self.on_context_changed(media_id),
            Command::Playback(evt) => self.on_playback(evt),
            Command::AdStateChanged { is_ad } => self.on_ad_state(is_ad),
            Command::GetState => {
                // State is published after every event
            }
        }
    }

    fn enable(&mut self, settings: Settings) {
        self.session.enabled = true;
        self.apply_settings(settings);

        match self.mode.mode() {
            Mode::Idle => self.start_attach(),
            Mode::Error => {
                // Explicit start skips the remaining recovery delay.
                self.recovery_epoch += 1;
                self.mode.activate();
                self.force_tick();
            }
            Mode::Active => self.force_tick(),
        }
    }

    fn disable(&mut self) {
        info!("HydrationEngine: disabling");
        self.session.enabled = false;
        self.coordinator.cancel();
        self.attach_seq += 1;
        self.recovery_epoch += 1;
        self.mode.stop();
        self.render("");
    }

    fn on_settings_changed(&mut self, enabled: bool, settings: Settings) {
        if enabled && !self.session.enabled {
            self.enable(settings);
            return;
        }
        if !enabled && self.session.enabled {
            self.apply_settings(settings);
            self.disable();
            return;
        }

        let language_changed = settings.language != self.session.language;
        let hint_changed = settings.hint != self.session.hint;
        self.apply_settings(settings);
        if (language_changed || hint_changed) && self.mode.is_active() {
            self.force_tick();
        }
    }

    fn apply_settings(&mut self, settings: Settings) {
        if settings.language != self.session.language || settings.hint != self.session.hint {
            info!(
                "HydrationEngine: settings language={} hint={:?}",
                settings.language, settings.hint
            );
        }
        self.session.language = settings.language;
        self.session.hint = settings.hint;
    }

    fn on_context_changed(&mut self, media_id: String) {
        info!(
            "HydrationEngine: context {:?} → {}",
            self.session.media_id, media_id
        );
        self.coordinator.cancel();

        if let Some(previous) = self.session.media_id.take() {
            if previous != media_id {
                self.cache.purge(&previous);
            }
        }
        self.session.media_id = Some(media_id);
        self.position = None;
        self.render("");

        if self.session.enabled {
            self.recovery_epoch += 1;
            self.mode.stop();
            self.start_attach();
        }
    }

    fn on_playback(&mut self, evt: PlaybackEvent) {
        match evt {
            PlaybackEvent::TimeUpdate { t } => {
                self.position = Some(t);
                if self.scheduler.accept(Instant::now()) {
                    self.tick(t);
                }
            }
            PlaybackEvent::Seek { t } => {
                self.position = Some(t);
                self.force_tick();
            }
            PlaybackEvent::RateChange => self.force_tick(),
            PlaybackEvent::Play | PlaybackEvent::Pause => self.render(""),
        }
    }

    fn on_ad_state(&mut self, is_ad: bool) {
        if is_ad == self.ad_playing {
            return;
        }
        info!("HydrationEngine: ad playing → {}", is_ad);
        self.ad_playing = is_ad;
        if is_ad {
            self.render("");
        } else {
            self.force_tick();
        }
    }

    // ── tick path ─────────────────────────────────────────────────────────────

    /// Reset throttling and tick at the last known position.
    fn force_tick(&mut self) {
        self.scheduler.force();
        if let Some(t) = self.position {
            if self.scheduler.accept(Instant::now()) {
                self.tick(t);
            }
        }
    }

    fn tick(&mut self, t: f64) {
        if !self.mode.is_active() {
            return;
        }
        if self.ad_playing {
            self.render("");
            return;
        }
        let Some(media_id) = self.session.media_id.clone() else {
            return;
        };
        let language = self.session.language.clone();

        if let Some(lines) = self.cache.get(&media_id, &language, t) {
            debug!("tick {:.2}s: cache hit", t);
            self.show(&lines, t);
            return;
        }

        if self
            .coordinator
            .covers(&media_id, &language, &self.session.hint, t)
        {
            debug!("tick {:.2}s: waiting on in-flight request", t);
            return;
        }

        debug!("tick {:.2}s: cache miss, hydrating", t);
        let request = HydrationRequest {
            media_id,
            language,
            hint: self.session.hint.clone(),
            t,
        };
        self.coordinator
            .start(request, Arc::clone(&self.deps.backend), self.event_tx.clone());
    }

    fn on_hydrated(&mut self, outcome: HydrationOutcome) {
        let Some(request) = self.coordinator.settle(outcome.generation) else {
            return;
        };

        match outcome.result {
            Ok(lines) => {
                debug!(
                    "HydrationEngine: generation {} produced {} lines",
                    outcome.generation,
                    lines.len()
                );
                let lines: Arc<[Line]> = lines.into();
                for bucket in self.coordinator.span().buckets(request.t) {
                    self.cache.put_bucket(
                        &request.media_id,
                        &request.language,
                        bucket,
                        Arc::clone(&lines),
                    );
                }

                let current = self.session.media_id.as_deref() == Some(request.media_id.as_str())
                    && self.session.language == request.language;
                if current && self.mode.is_active() && !self.ad_playing {
                    let t = self.position.unwrap_or(request.t);
                    self.show(&lines, t);
                }
            }
            Err(e) if e.is_canceled() => {}
            Err(e) => {
                warn!("HydrationEngine: {}", e);
                self.enter_error();
            }
        }
    }

    fn show(&mut self, lines: &[Line], t: f64) {
        let text = caption_at(lines, t, self.config.lookahead_secs);
        self.render(&text);
    }

    fn render(&mut self, text: &str) {
        if self.caption == text {
            return;
        }
        self.caption = text.to_string();
        self.deps.renderer.render(text);
    }

    // ── failure & recovery ────────────────────────────────────────────────────

    fn enter_error(&mut self) {
        if !self.mode.fail() {
            return;
        }
        self.coordinator.cancel();
        self.render("");

        self.recovery_epoch += 1;
        let epoch = self.recovery_epoch;
        let delay = self.config.recovery_delay();
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(EngineEvent::RecoveryElapsed { epoch }).await;
        });
    }

    fn on_recovery_elapsed(&mut self, epoch: u64) {
        if epoch != self.recovery_epoch || !self.session.enabled {
            debug!("HydrationEngine: stale recovery timer {}", epoch);
            return;
        }
        if self.mode.recover() {
            self.force_tick();
        }
    }

    // ── attach ────────────────────────────────────────────────────────────────

    fn start_attach(&mut self) {
        self.attach_seq += 1;
        let seq = self.attach_seq;
        let attempts = self.config.attach_attempts.max(1);
        let interval = self.config.attach_interval();
        let probe = Arc::clone(&self.deps.probe);
        let tx = self.event_tx.clone();

        debug!("HydrationEngine: attach {} ({} attempts)", seq, attempts);
        tokio::spawn(async move {
            let mut attached = false;
            for attempt in 1..=attempts {
                if probe.probe().await {
                    attached = true;
                    break;
                }
                if attempt < attempts {
                    tokio::time::sleep(interval).await;
                }
            }
            let _ = tx.send(EngineEvent::AttachFinished { seq, attached }).await;
        });
    }

    fn on_attach_finished(&mut self, seq: u64, attached: bool) {
        if seq != self.attach_seq || !self.session.enabled {
            debug!("HydrationEngine: stale attach {}", seq);
            return;
        }
        if attached {
            info!("HydrationEngine: player attached");
            self.mode.activate();
            self.force_tick();
        } else {
            let err = EngineError::AttachFailed {
                attempts: self.config.attach_attempts.max(1),
            };
            warn!("HydrationEngine: {}", err);
            self.mode.stop();
            self.render("");
        }
    }

    // ── helpers ───────────────────────────────────────────────────────────────

    fn shutdown(&mut self) {
        self.coordinator.cancel();
        self.attach_seq += 1;
        self.recovery_epoch += 1;
        self.render("");
        self.publish();
    }

    fn publish(&self) {
        let snapshot = EngineState {
            rev: 0,
            mode: self.mode.mode(),
            enabled: self.session.enabled,
            language: self.session.language.clone(),
            hint: self.session.hint.clone(),
            media_id: self.session.media_id.clone(),
            caption: self.caption.clone(),
            position_secs: self.position,
            ad_playing: self.ad_playing,
            in_flight: self.coordinator.info(),
            cached_buckets: self.cache.len(),
        };
        self.state_tx.send_if_modified(|state| {
            let rev = state.rev;
            let unchanged = EngineState { rev, ..snapshot.clone() } == *state;
            if unchanged {
                return false;
            }
            *state = EngineState {
                rev: rev + 1,
                ..snapshot
            };
            true
        });
    }
}
