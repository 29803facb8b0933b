//! Alert state machine
//!
//! Single-writer event loop that ties detection, countdown, location and
//! dispatch together. Capabilities, timers and background tasks only
//! enqueue [`MonitorEvent`]s; every state change happens in
//! [`AlertStateMachine::run`], one event at a time, in arrival order.
//!
//! ```text
//! Initializing -> Listening -> Detected -> CountdownActive -> Dispatching -> Resolved -> Listening
//!                                                       \-> Cancelled -> Listening
//! Initializing -> PermissionDenied | NotSupported   (until retry)
//! ```

use chrono::Local;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::composer::MessageComposer;
use crate::config::{ConfigError, MonitorConfig};
use crate::contacts::{Contact, ContactStore};
use crate::countdown::{CountdownController, CountdownEvent};
use crate::detection::{DetectionEngine, DistressEvent};
use crate::dispatch::{DispatchError, DispatchRecord, DispatchScheduler, NotificationSink};
use crate::location::{LocationCapability, LocationOutcome, LocationResolver};
use crate::session::{AlertSession, SessionId, SessionState};
use crate::speech::{SourceEvents, SourceSignal, SpeechError, SpeechErrorKind, SpeechSource};

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Externally visible monitor state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorState {
    Initializing,
    Listening,
    Detected,
    CountdownActive,
    Dispatching,
    Resolved,
    Cancelled,
    PermissionDenied,
    NotSupported,
}

impl MonitorState {
    /// States that only an explicit retry leaves
    pub fn is_halted(&self) -> bool {
        matches!(self, MonitorState::PermissionDenied | MonitorState::NotSupported)
    }
}

/// Broadcast to subscribers as the monitor runs
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorNotice {
    StateChanged(MonitorState),
    Detected { session: SessionId, event: DistressEvent },
    Tick { session: SessionId, remaining: u32 },
    Cancelled { session: SessionId },
    LocationResolved { session: SessionId, outcome: LocationOutcome },

    /// Countdown elapsed but there is nobody to notify
    NeedsConfiguration { session: SessionId },

    Dispatched { session: SessionId, record: DispatchRecord },
    SessionClosed(AlertSession),
    SourceRestarted { attempt: u64 },
}

/// Counters exposed through [`MonitorHandle::stats`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorStats {
    pub sessions_started: u64,
    pub sessions_cancelled: u64,
    pub sessions_resolved: u64,
    pub sessions_unconfigured: u64,
    pub alerts_sent: u64,
    pub source_starts: u64,
    pub source_restarts: u64,
}

/// Events consumed by the state machine loop
#[derive(Debug)]
pub(crate) enum MonitorEvent {
    Source { generation: u64, signal: SourceSignal },
    Countdown { session: SessionId, event: CountdownEvent },
    LocationResolved {
        session: SessionId,
        outcome: LocationOutcome,
        contacts: Vec<Contact>,
    },
    Dispatched { session: SessionId, record: DispatchRecord },
    DispatchFinished { session: SessionId },
    RestartDue { id: u64 },
    Cancel,
    Retry,
    Shutdown,
}

/// Capabilities supplied by the host
pub struct Capabilities {
    pub speech: Box<dyn SpeechSource>,
    pub location: Arc<dyn LocationCapability>,
    pub sink: Arc<dyn NotificationSink>,
    pub contacts: Arc<dyn ContactStore>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    PermissionDenied,
    NotSupported,
}

impl Halt {
    fn state(self) -> MonitorState {
        match self {
            Halt::PermissionDenied => MonitorState::PermissionDenied,
            Halt::NotSupported => MonitorState::NotSupported,
        }
    }
}

/// Cloneable control surface for a running monitor
#[derive(Clone)]
pub struct MonitorHandle {
    events: mpsc::UnboundedSender<MonitorEvent>,
    state: watch::Receiver<MonitorState>,
    notices: broadcast::Sender<MonitorNotice>,
    stats: Arc<RwLock<MonitorStats>>,
    resolver: LocationResolver,
}

impl MonitorHandle {
    /// Request cancellation of the active countdown
    pub fn cancel(&self) -> bool {
        self.events.send(MonitorEvent::Cancel).is_ok()
    }

    /// Retry initialization after a permission or support failure
    pub fn retry(&self) -> bool {
        self.events.send(MonitorEvent::Retry).is_ok()
    }

    pub fn shutdown(&self) -> bool {
        self.events.send(MonitorEvent::Shutdown).is_ok()
    }

    pub fn state(&self) -> MonitorState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<MonitorState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorNotice> {
        self.notices.subscribe()
    }

    pub fn stats(&self) -> MonitorStats {
        self.stats.read().clone()
    }

    /// User-initiated location lookup with the longer timeout
    pub async fn locate(&self) -> LocationOutcome {
        self.resolver.resolve_for_lookup().await
    }
}

/// The detection, countdown and dispatch state machine
pub struct AlertStateMachine {
    config: MonitorConfig,
    source: Box<dyn SpeechSource>,
    contacts: Arc<dyn ContactStore>,
    detector: DetectionEngine,
    resolver: LocationResolver,
    composer: MessageComposer,
    scheduler: DispatchScheduler,

    state: MonitorState,
    session: Option<AlertSession>,
    countdown: Option<CountdownController>,
    halted: Option<Halt>,
    next_session: u64,
    source_generation: u64,
    restart: Option<(u64, CancellationToken)>,
    next_restart: u64,

    events_tx: mpsc::UnboundedSender<MonitorEvent>,
    events_rx: mpsc::UnboundedReceiver<MonitorEvent>,
    state_tx: watch::Sender<MonitorState>,
    notices: broadcast::Sender<MonitorNotice>,
    stats: Arc<RwLock<MonitorStats>>,
}

impl AlertStateMachine {
    /// Build a monitor and its control handle
    pub fn new(
        mut config: MonitorConfig,
        capabilities: Capabilities,
    ) -> Result<(Self, MonitorHandle), MonitorError> {
        config.normalize();
        config.validate()?;

        info!("Initializing distress monitor");
        info!("Phrases: {:?}", config.phrases);
        info!(
            "Countdown: {}s, stagger: {}ms, restart delay: {}ms",
            config.countdown_secs, config.dispatch_stagger_ms, config.restart_delay_ms
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(MonitorState::Initializing);
        let (notices, _) = broadcast::channel(config.notice_capacity);
        let stats = Arc::new(RwLock::new(MonitorStats::default()));

        let resolver = LocationResolver::new(capabilities.location, &config);
        let scheduler = DispatchScheduler::new(capabilities.sink, config.stagger());

        let handle = MonitorHandle {
            events: events_tx.clone(),
            state: state_rx,
            notices: notices.clone(),
            stats: stats.clone(),
            resolver: resolver.clone(),
        };

        let machine = Self {
            detector: DetectionEngine::new(config.phrases.clone()),
            config,
            source: capabilities.speech,
            contacts: capabilities.contacts,
            resolver,
            composer: MessageComposer::new(),
            scheduler,
            state: MonitorState::Initializing,
            session: None,
            countdown: None,
            halted: None,
            next_session: 0,
            source_generation: 0,
            restart: None,
            next_restart: 0,
            events_tx,
            events_rx,
            state_tx,
            notices,
            stats,
        };

        Ok((machine, handle))
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    /// Run until shutdown is requested
    pub async fn run(mut self) {
        self.initialize().await;

        while let Some(event) = self.events_rx.recv().await {
            if matches!(event, MonitorEvent::Shutdown) {
                break;
            }
            self.handle(event).await;
        }

        self.teardown().await;
    }

    async fn initialize(&mut self) {
        self.set_state(MonitorState::Initializing);

        match self.start_source().await {
            Ok(()) => {
                info!("Monitoring started");
                self.set_state(MonitorState::Listening);
            }
            Err(e) => self.on_start_failure(e).await,
        }
    }

    async fn handle(&mut self, event: MonitorEvent) {
        match event {
            MonitorEvent::Source { generation, signal } => {
                if generation != self.source_generation {
                    debug!("Ignoring {:?} from stale source run {}", signal, generation);
                    return;
                }
                self.on_source_signal(signal).await;
            }
            MonitorEvent::Countdown { session, event } => {
                if !self.is_current(session) {
                    debug!("Ignoring countdown {:?} for closed {}", event, session);
                    return;
                }
                self.on_countdown(session, event);
            }
            MonitorEvent::LocationResolved {
                session,
                outcome,
                contacts,
            } => {
                if !self.is_current(session) {
                    return;
                }
                self.on_location_resolved(session, outcome, contacts);
            }
            MonitorEvent::Dispatched { session, record } => {
                if !self.is_current(session) {
                    return;
                }
                if let Some(live) = self.session.as_mut() {
                    live.recipients_notified += 1;
                }
                self.stats.write().alerts_sent += 1;
                self.notify(MonitorNotice::Dispatched { session, record });
            }
            MonitorEvent::DispatchFinished { session } => {
                if !self.is_current(session) {
                    return;
                }
                self.finish_session(SessionState::Resolved);
            }
            MonitorEvent::RestartDue { id } => self.on_restart_due(id).await,
            MonitorEvent::Cancel => self.on_cancel(),
            MonitorEvent::Retry => self.on_retry().await,
            MonitorEvent::Shutdown => {}
        }
    }

    async fn on_source_signal(&mut self, signal: SourceSignal) {
        match signal {
            SourceSignal::Started => {
                debug!("Speech source reported started");
                if self.state == MonitorState::Initializing {
                    self.set_state(MonitorState::Listening);
                }
            }
            SourceSignal::Transcript(text) => self.on_transcript(&text),
            SourceSignal::Ended => {
                if self.halted.is_some() {
                    debug!("Speech source ended while halted; not restarting");
                    return;
                }
                info!("Speech source ended, restarting...");
                self.schedule_restart();
            }
            SourceSignal::Error(SpeechErrorKind::PermissionDenied) => {
                error!("Speech recognition error: permission denied");
                self.halt(Halt::PermissionDenied).await;
            }
            SourceSignal::Error(kind) => {
                warn!("Speech recognition error: {:?}", kind);
                if self.halted.is_none() {
                    self.schedule_restart();
                }
            }
        }
    }

    fn on_transcript(&mut self, text: &str) {
        if self.halted.is_some() {
            return;
        }

        let Some(event) = self.detector.on_transcript(text) else {
            return;
        };

        if self.state != MonitorState::Listening || self.session.is_some() {
            warn!(
                "Ignoring \"{}\" while {:?}",
                event.matched_phrase, self.state
            );
            if self.session.is_none() {
                self.detector.rearm();
            }
            return;
        }

        self.start_session(event);
    }

    fn start_session(&mut self, event: DistressEvent) {
        self.next_session += 1;
        let id = SessionId(self.next_session);
        let mut session = AlertSession::new(id, event.matched_phrase.clone(), event.occurred_at);

        info!("Emergency detected: \"{}\" ({})", event.matched_phrase, id);
        self.stats.write().sessions_started += 1;
        self.notify(MonitorNotice::Detected { session: id, event });
        self.set_state(MonitorState::Detected);

        session.advance(SessionState::CountdownActive);
        self.session = Some(session);

        let tx = self.events_tx.clone();
        let mut countdown = CountdownController::new();
        countdown.start(self.config.countdown_secs, move |event| {
            let _ = tx.send(MonitorEvent::Countdown { session: id, event });
        });
        self.countdown = Some(countdown);

        self.set_state(MonitorState::CountdownActive);
    }

    fn on_countdown(&mut self, session: SessionId, event: CountdownEvent) {
        match event {
            CountdownEvent::Tick(remaining) => {
                debug!("{}: {}s remaining", session, remaining);
                self.notify(MonitorNotice::Tick { session, remaining });
            }
            CountdownEvent::Completed => self.begin_dispatch(session),
            CountdownEvent::Cancelled => {
                debug!("{}: countdown confirmed cancelled", session);
            }
        }
    }

    fn on_cancel(&mut self) {
        if self.state != MonitorState::CountdownActive {
            match self.state {
                MonitorState::Dispatching => warn!("Cancel ignored: dispatch already started"),
                _ => debug!("Cancel ignored in {:?}", self.state),
            }
            return;
        }

        let cancelled = self
            .countdown
            .as_ref()
            .map(|countdown| countdown.cancel())
            .unwrap_or(false);

        if !cancelled {
            // Completion already fired; its event is queued behind this one
            debug!("Cancel arrived after countdown completion");
            return;
        }

        let Some(id) = self.session.as_ref().map(|s| s.id) else {
            return;
        };

        info!("Emergency alert cancelled by user ({})", id);
        self.stats.write().sessions_cancelled += 1;
        self.notify(MonitorNotice::Cancelled { session: id });
        self.finish_session(SessionState::Cancelled);
    }

    fn begin_dispatch(&mut self, session: SessionId) {
        info!("Countdown completed, preparing alert ({})", session);

        self.countdown = None;
        if let Some(live) = self.session.as_mut() {
            live.advance(SessionState::Dispatching);
        }
        self.set_state(MonitorState::Dispatching);

        let resolver = self.resolver.clone();
        let store = self.contacts.clone();
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let outcome = resolver.resolve_for_alert().await;

            // Stores may hit the filesystem
            let contacts = match tokio::task::spawn_blocking(move || store.contacts()).await {
                Ok(contacts) => contacts,
                Err(e) => {
                    error!("Contact snapshot failed: {}", e);
                    Vec::new()
                }
            };

            let _ = tx.send(MonitorEvent::LocationResolved {
                session,
                outcome,
                contacts,
            });
        });
    }

    fn on_location_resolved(
        &mut self,
        session: SessionId,
        outcome: LocationOutcome,
        contacts: Vec<Contact>,
    ) {
        self.notify(MonitorNotice::LocationResolved { session, outcome });

        let message = self.composer.compose_message(
            self.config.user_name.as_deref(),
            outcome.fix(),
            &Local::now(),
        );
        if let Some(live) = self.session.as_mut() {
            live.message_composed_at = Some(message.generated_at);
        }

        match self.scheduler.dispatch(contacts, message.text) {
            Ok(mut run) => {
                let tx = self.events_tx.clone();
                tokio::spawn(async move {
                    while let Some(record) = run.next().await {
                        let _ = tx.send(MonitorEvent::Dispatched { session, record });
                    }
                    let _ = tx.send(MonitorEvent::DispatchFinished { session });
                });
            }
            Err(DispatchError::NoContactsConfigured) => {
                warn!("No emergency contacts configured; alert not sent ({})", session);
                self.stats.write().sessions_unconfigured += 1;
                self.notify(MonitorNotice::NeedsConfiguration { session });
                self.finish_session(SessionState::NeedsConfiguration);
            }
        }
    }

    /// Close the live session and return to listening (or the halt state)
    fn finish_session(&mut self, outcome: SessionState) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        session.advance(outcome);
        self.countdown = None;
        self.detector.rearm();

        match outcome {
            SessionState::Resolved => {
                info!(
                    "Alert dispatched to {} contact(s) ({})",
                    session.recipients_notified, session.id
                );
                self.stats.write().sessions_resolved += 1;
                self.set_state(MonitorState::Resolved);
            }
            SessionState::Cancelled => self.set_state(MonitorState::Cancelled),
            _ => {}
        }

        self.notify(MonitorNotice::SessionClosed(session));

        match self.halted {
            Some(halt) => self.set_state(halt.state()),
            None => self.set_state(MonitorState::Listening),
        }
    }

    async fn on_start_failure(&mut self, e: SpeechError) {
        match e {
            SpeechError::Unsupported => {
                error!("Speech recognition not supported");
                self.halt(Halt::NotSupported).await;
            }
            SpeechError::PermissionDenied => {
                error!("Microphone access denied");
                self.halt(Halt::PermissionDenied).await;
            }
            SpeechError::Failed(reason) => {
                warn!("Speech source failed to start: {}", reason);
                self.schedule_restart();
            }
        }
    }

    /// Stop restarts; settle in the halt state once no session is live
    async fn halt(&mut self, halt: Halt) {
        self.cancel_restart();
        self.halted = Some(halt);
        self.source.stop().await;

        if self.session.is_some() {
            warn!("Monitoring halted ({:?}); finishing the live alert first", halt);
        } else {
            self.set_state(halt.state());
        }
    }

    async fn on_retry(&mut self) {
        if self.halted.take().is_none() {
            debug!("Retry ignored in {:?}", self.state);
            return;
        }

        info!("Retrying speech recognition initialization");
        if self.session.is_some() {
            match self.start_source().await {
                Ok(()) => info!("Monitoring resumed"),
                Err(e) => self.on_start_failure(e).await,
            }
        } else {
            self.initialize().await;
        }
    }

    fn schedule_restart(&mut self) {
        if self.restart.is_some() {
            debug!("Restart already pending");
            return;
        }

        self.next_restart += 1;
        let id = self.next_restart;
        let token = CancellationToken::new();
        let task_token = token.clone();
        let delay = self.config.restart_delay();
        let tx = self.events_tx.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = task_token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(MonitorEvent::RestartDue { id });
                }
            }
        });

        debug!("Restart #{} scheduled in {}ms", id, delay.as_millis());
        self.restart = Some((id, token));
    }

    fn cancel_restart(&mut self) {
        if let Some((id, token)) = self.restart.take() {
            debug!("Cancelling pending restart #{}", id);
            token.cancel();
        }
    }

    async fn on_restart_due(&mut self, id: u64) {
        match &self.restart {
            Some((pending, _)) if *pending == id => {}
            _ => {
                debug!("Ignoring stale restart #{}", id);
                return;
            }
        }
        self.restart = None;

        if self.halted.is_some() {
            return;
        }

        // A source that is still running would keep reporting under the
        // previous generation
        self.source.stop().await;

        match self.start_source().await {
            Ok(()) => {
                let attempt = {
                    let mut stats = self.stats.write();
                    stats.source_restarts += 1;
                    stats.source_restarts
                };
                info!("Speech source restarted (attempt {})", attempt);
                self.notify(MonitorNotice::SourceRestarted { attempt });

                if self.state == MonitorState::Initializing {
                    self.set_state(MonitorState::Listening);
                }
            }
            Err(e) => self.on_start_failure(e).await,
        }
    }

    async fn start_source(&mut self) -> Result<(), SpeechError> {
        self.source_generation += 1;
        let generation = self.source_generation;
        let tx = self.events_tx.clone();
        let events = SourceEvents::new(move |signal| {
            tx.send(MonitorEvent::Source { generation, signal }).is_ok()
        });

        self.stats.write().source_starts += 1;
        self.source.start(events).await
    }

    async fn teardown(&mut self) {
        info!("Shutting down distress monitor");
        self.cancel_restart();

        if let Some(countdown) = self.countdown.take() {
            countdown.cancel();
        }

        self.source.stop().await;
    }

    fn is_current(&self, session: SessionId) -> bool {
        self.session.as_ref().map(|s| s.id == session).unwrap_or(false)
    }

    fn set_state(&mut self, next: MonitorState) {
        if self.state == next {
            return;
        }

        info!("State: {:?} -> {:?}", self.state, next);
        self.state = next;
        self.state_tx.send_replace(next);
        self.notify(MonitorNotice::StateChanged(next));
    }

    fn notify(&self, notice: MonitorNotice) {
        // No subscribers is fine
        let _ = self.notices.send(notice);
    }
}
