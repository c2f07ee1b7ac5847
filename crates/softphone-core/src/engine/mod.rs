//! Call-state reconciliation engine
//!
//! [`CallEngine`] owns the single tracked [`CallSession`] and is the only
//! place it is mutated. Everything that can change it funnels through here:
//!
//! - **`intents`** - canonical intents from the SDK, the push channel, the
//!   identity poller and the liveness check
//! - **`calls`** - user requests to answer, hang up and dial
//! - **`controls`** - mute and hold toggles
//!
//! All state lives behind one lock that is never held across an `.await`;
//! SDK calls run with the lock released and re-validate the session
//! generation when they come back.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use pbx_softphone_core::{SoftphoneBuilder, SoftphoneConfig, SoftphoneEvent, PushEvent};
//! # use pbx_softphone_core::sdk::SdkRef;
//! # async fn example(sdk: SdkRef) -> Result<(), Box<dyn std::error::Error>> {
//! let engine = SoftphoneBuilder::new()
//!     .config(SoftphoneConfig::default())
//!     .sdk(sdk)
//!     .build()
//!     .await?;
//!
//! let mut events = engine.subscribe_events();
//! engine.deliver_push(PushEvent::IncomingCall {
//!     server_call_id: Some("s1".into()),
//!     caller_number: Some("+15550100".into()),
//!     caller_name: None,
//! })?;
//!
//! if let Ok(SoftphoneEvent::Incoming { peer, .. }) = events.recv().await {
//!     println!("{} is calling", peer.number);
//!     engine.request_answer().await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod calls;
pub mod config;
pub mod controls;
pub mod intents;
pub mod recovery;

use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::call::{CallCapabilities, CallDirection, CallId, CallSession, CallState, CallStatus};
use crate::error::SoftphoneResult;
use crate::events::{CallEventHandler, EndReason, Notice, NoticeKind, SoftphoneEvent};
use crate::identity::{CallIdentity, IdentityResolver};
use crate::normalizer::{EventNormalizer, Subscription};
use crate::poller::{RecoveryPoller, RecoveryTarget};
use crate::probe::CapabilityProbe;
use crate::sdk::{same_object, RawSdkEvent, SdkRef};

pub use builder::SoftphoneBuilder;
pub use calls::{clean_number, HangupOutcome};
pub use config::SoftphoneConfig;
pub use recovery::{retry_with_backoff, with_timeout, RetryConfig};

const EVENT_CHANNEL_CAPACITY: usize = 256;

type SharedHandler = Arc<RwLock<Option<Arc<dyn CallEventHandler>>>>;

/// Mutable engine state, guarded by [`CallEngine::core`]
#[derive(Debug, Default)]
pub(crate) struct EngineCore {
    pub(crate) session: Option<CallSession>,
    next_generation: u64,
    /// The SDK lost its link; the next call attempt shows a reconnect notice
    pub(crate) link_lost: bool,
    pub(crate) dial_in_flight: bool,
    /// Session object already subscribed, with the generation it was subscribed for
    watched: Option<(u64, SdkRef)>,
    poller: Option<RecoveryPoller>,
    decay: Option<JoinHandle<()>>,
    liveness: Option<JoinHandle<()>>,
}

impl EngineCore {
    pub(crate) fn state(&self) -> CallState {
        self.session.as_ref().map(|s| s.state).unwrap_or(CallState::Idle)
    }

    /// The session, if it belongs to `generation`
    pub(crate) fn session_for(&mut self, generation: u64) -> Option<&mut CallSession> {
        self.session.as_mut().filter(|s| s.generation == generation)
    }

    fn allocate_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn cancel_timers(&mut self) {
        self.poller = None;
        if let Some(task) = self.liveness.take() {
            task.abort();
        }
        if let Some(task) = self.decay.take() {
            task.abort();
        }
    }
}

impl Drop for EngineCore {
    fn drop(&mut self) {
        self.cancel_timers();
    }
}

/// The reconciliation engine for one soft-phone
pub struct CallEngine {
    config: SoftphoneConfig,
    sdk: SdkRef,
    probe: CapabilityProbe,
    resolver: IdentityResolver,
    normalizer: EventNormalizer,
    pub(crate) core: Mutex<EngineCore>,
    handler: SharedHandler,
    event_tx: broadcast::Sender<SoftphoneEvent>,
    dispatch_tx: mpsc::UnboundedSender<SoftphoneEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
    /// Feeds the pump; set once SDK events are attached
    raw_tx: Mutex<Option<mpsc::UnboundedSender<RawSdkEvent>>>,
    self_ref: Weak<CallEngine>,
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl CallEngine {
    /// Create an engine bound to an SDK handle; must be called inside a Tokio runtime
    pub fn new(config: SoftphoneConfig, sdk: SdkRef) -> SoftphoneResult<Arc<Self>> {
        config.validate()?;

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let handler: SharedHandler = Arc::new(RwLock::new(None));
        spawn_dispatcher(handler.clone(), dispatch_rx);

        let probe = CapabilityProbe::new(config.invoke_timeout());
        let engine = Arc::new_cyclic(|self_ref| Self {
            resolver: IdentityResolver::new(probe.clone()),
            probe,
            normalizer: EventNormalizer::new(),
            sdk,
            config,
            core: Mutex::new(EngineCore::default()),
            handler,
            event_tx,
            dispatch_tx,
            pump: Mutex::new(None),
            raw_tx: Mutex::new(None),
            self_ref: self_ref.clone(),
        });

        info!(enabled = engine.config.enabled, "Call engine created");
        Ok(engine)
    }

    pub fn config(&self) -> &SoftphoneConfig {
        &self.config
    }

    pub fn sdk(&self) -> &SdkRef {
        &self.sdk
    }

    pub(crate) fn probe(&self) -> &CapabilityProbe {
        &self.probe
    }

    pub(crate) fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    pub fn state(&self) -> CallState {
        self.core.lock().state()
    }

    /// Snapshot of the tracked session, if any
    pub fn session(&self) -> Option<CallSession> {
        self.core.lock().session.clone()
    }

    /// Current state plus the operations that are valid in it
    pub fn status(&self) -> CallStatus {
        let core = self.core.lock();
        CallStatus {
            state: core.state(),
            session: core.session.clone(),
            capabilities: CallCapabilities::for_session(core.session.as_ref(), core.dial_in_flight),
        }
    }

    /// Subscribe to engine events
    pub fn subscribe_events(&self) -> broadcast::Receiver<SoftphoneEvent> {
        self.event_tx.subscribe()
    }

    /// Install the host UI handler, replacing any previous one
    pub fn set_event_handler(&self, handler: Arc<dyn CallEventHandler>) {
        *self.handler.write() = Some(handler);
    }

    /// Subscribe to every SDK observation surface and start feeding the engine
    ///
    /// Session objects adopted later are subscribed as they arrive.
    pub fn attach_sdk_events(&self) -> Subscription {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = self.normalizer.attach(&self.sdk, &tx);
        *self.raw_tx.lock() = Some(tx);
        let engine = self.self_ref.clone();

        let pump = tokio::spawn(async move {
            while let Some(raw) = rx.recv().await {
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.ingest_raw(&raw);
            }
            debug!("SDK event pump finished");
        });

        if let Some(previous) = self.pump.lock().replace(pump) {
            previous.abort();
        }
        let mut core = self.core.lock();
        core.watched = None;
        self.watch_session(&mut core);
        subscription
    }

    /// Subscribe to the tracked session's SDK object if it has not been yet
    pub(crate) fn watch_session(&self, core: &mut EngineCore) {
        let Some(session) = core.session.as_ref() else {
            return;
        };
        let Some(object) = session.identity.sdk_session.clone() else {
            return;
        };
        let generation = session.generation;
        if let Some((watched_generation, watched)) = core.watched.as_ref() {
            if *watched_generation == generation && same_object(watched, &object) {
                return;
            }
        }
        let Some(tx) = self.raw_tx.lock().clone() else {
            return;
        };

        let listeners = self.normalizer.watch_session(generation, &object, &tx);
        debug!(generation, listeners, "Watching SDK session events");
        core.watched = Some((generation, object));
    }

    pub(crate) fn normalizer(&self) -> &EventNormalizer {
        &self.normalizer
    }

    /// Publish an event; callers may hold the core lock
    pub(crate) fn emit(&self, event: SoftphoneEvent) {
        let _ = self.event_tx.send(event.clone());
        let _ = self.dispatch_tx.send(event);
    }

    pub(crate) fn notice(&self, kind: NoticeKind, message: impl Into<String>, call_id: Option<CallId>) {
        let notice = Notice::new(kind, message, call_id);
        debug!(kind = ?notice.kind, message = %notice.message, "Surfacing notice");
        self.emit(SoftphoneEvent::Notice(notice));
    }

    /// Show the reconnect notice once after a lost link; true if it was shown
    pub(crate) fn take_link_lost(&self, core: &mut EngineCore) -> bool {
        let lost = std::mem::take(&mut core.link_lost);
        if lost {
            self.notice(
                NoticeKind::ReconnectRequired,
                "The phone lost its connection to the PBX; reconnecting may be required",
                None,
            );
        }
        lost
    }

    /// Create a session in `Incoming` and start identity recovery
    pub(crate) fn open_incoming(&self, core: &mut EngineCore, identity: CallIdentity, peer: crate::call::PeerInfo) -> CallId {
        let generation = core.allocate_generation();
        let session = CallSession::new(generation, CallState::Incoming, CallDirection::Inbound, identity, peer);
        let call_id = session.call_id;
        let event = SoftphoneEvent::Incoming {
            call_id,
            peer: session.peer.clone(),
        };
        let complete = session.identity.is_complete();

        info!(
            %call_id,
            generation,
            server_call_id = ?session.identity.server_call_id,
            sdk_call_id = ?session.identity.sdk_call_id,
            "Call incoming"
        );
        core.session = Some(session);
        self.watch_session(core);
        if !complete {
            self.start_poller(core, generation);
        }
        self.emit(event);
        call_id
    }

    /// Create a session that is already `Active`, for a successful local dial
    pub(crate) fn open_outbound(&self, core: &mut EngineCore, identity: CallIdentity, peer: crate::call::PeerInfo) -> CallId {
        let generation = core.allocate_generation();
        let session = CallSession::new(generation, CallState::Incoming, CallDirection::Outbound, identity, peer);
        let call_id = session.call_id;
        core.session = Some(session);
        self.watch_session(core);
        self.activate(core);
        call_id
    }

    pub(crate) fn start_poller(&self, core: &mut EngineCore, generation: u64) {
        if core.poller.as_ref().is_some_and(|p| p.generation() == generation && !p.is_finished()) {
            return;
        }
        let target: Weak<dyn RecoveryTarget> = self.self_ref.clone();
        core.poller = Some(RecoveryPoller::start(
            target,
            generation,
            self.config.poller_max_attempts,
            self.config.poller_interval(),
        ));
    }

    /// Move the tracked session to `Active`
    pub(crate) fn activate(&self, core: &mut EngineCore) {
        core.poller = None;
        let Some(session) = core.session.as_mut() else {
            return;
        };
        if session.state == CallState::Active {
            return;
        }

        session.state = CallState::Active;
        session.started_at = Some(Utc::now());
        session.connect_pending = false;
        let event = SoftphoneEvent::Active {
            call_id: session.call_id,
            peer: session.peer.clone(),
            direction: session.direction,
        };
        let generation = session.generation;
        info!(call_id = %session.call_id, generation, direction = ?session.direction, "Call active");

        if let Some(period) = self.config.liveness_interval() {
            core.liveness = Some(self.spawn_liveness(generation, period));
        }
        self.emit(event);
    }

    /// Move the tracked session to `Ended` and schedule its removal
    pub(crate) fn end(&self, core: &mut EngineCore, reason: EndReason) {
        let Some(session) = core.session.as_mut() else {
            return;
        };
        if session.state == CallState::Ended {
            return;
        }

        session.state = CallState::Ended;
        session.ended_at = Some(Utc::now());
        session.in_flight = None;
        session.connect_pending = false;
        let call_id = session.call_id;
        let generation = session.generation;
        info!(%call_id, generation, ?reason, "Call ended");

        core.cancel_timers();
        core.decay = Some(self.spawn_decay(generation));
        self.emit(SoftphoneEvent::Ended { call_id, reason });
    }

    /// Drop an ended session before its grace period runs out
    pub(crate) fn discard_ended(&self, core: &mut EngineCore) {
        if core.state() == CallState::Ended {
            core.cancel_timers();
            if let Some(session) = core.session.take() {
                debug!(call_id = %session.call_id, generation = session.generation, "Discarding ended session early");
            }
        }
    }

    fn spawn_decay(&self, generation: u64) -> JoinHandle<()> {
        let engine = self.self_ref.clone();
        let grace = self.config.ended_grace();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(engine) = engine.upgrade() {
                engine.expire(generation);
            }
        })
    }

    fn expire(&self, generation: u64) {
        let mut core = self.core.lock();
        match core.session.as_ref() {
            Some(session) if session.generation == generation && session.state == CallState::Ended => {
                info!(call_id = %session.call_id, generation, "Ended call discarded");
                core.session = None;
                core.decay = None;
            }
            _ => debug!(generation, "Ignoring stale grace timer"),
        }
    }

    fn spawn_liveness(&self, generation: u64, period: std::time::Duration) -> JoinHandle<()> {
        let engine = self.self_ref.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let Some(engine) = engine.upgrade() else {
                    return;
                };
                if engine.check_liveness(generation).await == crate::poller::PollStep::Stop {
                    return;
                }
            }
        })
    }
}

impl Drop for CallEngine {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

fn spawn_dispatcher(handler: SharedHandler, mut rx: mpsc::UnboundedReceiver<SoftphoneEvent>) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let current = handler.read().clone();
            if let Some(handler) = current {
                handler.on_event(event).await;
            }
        }
    });
}
