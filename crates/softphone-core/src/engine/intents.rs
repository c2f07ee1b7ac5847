//! Applying canonical intents to the tracked session

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{CallEngine, EngineCore};
use crate::call::CallState;
use crate::error::{SoftphoneError, SoftphoneResult};
use crate::events::{EndReason, NoticeKind};
use crate::identity::{CallIdentity, Resolution};
use crate::intent::{CanonicalIntent, IntentKind, IntentOrigin};
use crate::normalizer::{session_generation, EventNormalizer};
use crate::poller::{PollStep, RecoveryTarget};
use crate::push::{parse_realtime, parse_webhook, PushEvent};
use crate::sdk::RawSdkEvent;

impl CallEngine {
    /// Apply a canonical intent from any channel
    ///
    /// Returns the state after the intent. Intents that refer to a call the
    /// engine no longer tracks return `StaleReference` and change nothing.
    pub fn note_peer_event(&self, intent: CanonicalIntent) -> SoftphoneResult<CallState> {
        self.apply(intent, None)
    }

    /// Apply one canonical push event
    pub fn deliver_push(&self, event: PushEvent) -> SoftphoneResult<CallState> {
        self.apply(event.into_intent(), None)
    }

    /// Parse and apply a relayed PBX webhook body
    ///
    /// Stale events inside the body are logged and skipped.
    pub fn deliver_webhook(&self, body: &str) -> SoftphoneResult<CallState> {
        let events = parse_webhook(body, self.config().extension.as_deref())?;
        for event in events {
            if let Err(e) = self.deliver_push(event) {
                if !e.is_stale() {
                    return Err(e);
                }
            }
        }
        Ok(self.state())
    }

    /// Parse and apply a realtime screen-pop message
    pub fn deliver_realtime(&self, topic: &str, message: &Value) -> SoftphoneResult<CallState> {
        match parse_realtime(topic, message) {
            Some(event) => self.deliver_push(event),
            None => {
                debug!(topic, "Ignoring realtime topic");
                Ok(self.state())
            }
        }
    }

    /// Normalize, dedup and apply one raw SDK event
    ///
    /// Events from a session object only apply to the call that session
    /// was adopted for.
    pub fn ingest_raw(&self, raw: &RawSdkEvent) -> Option<SoftphoneResult<CallState>> {
        let intent = self.normalizer().normalize(raw)?;
        let current = self.state();
        if !EventNormalizer::should_forward(&intent, current) {
            debug!(event = %raw.name, kind = %intent.kind, state = %current, "Dropping no-op SDK event");
            return None;
        }
        Some(self.apply(intent, session_generation(&raw.surface)))
    }

    /// Apply an intent, optionally only if the session still has `generation`
    pub(crate) fn apply(&self, intent: CanonicalIntent, generation: Option<u64>) -> SoftphoneResult<CallState> {
        let mut core = self.core.lock();

        if let Some(generation) = generation {
            if core.session.as_ref().map(|s| s.generation) != Some(generation) {
                debug!(generation, kind = %intent.kind, "Dropping intent for a replaced session");
                return Err(SoftphoneError::stale("session generation changed"));
            }
        }

        let result = match intent.kind {
            IntentKind::Error => {
                let call_id = core.session.as_ref().map(|s| s.call_id);
                let detail = intent.detail.clone().unwrap_or_else(|| "unspecified SDK error".to_string());
                warn!(origin = %intent.origin, detail = %detail, "SDK reported an error");
                self.notice(NoticeKind::SdkError, detail, call_id);
                Ok(core.state())
            }
            IntentKind::LinkLost => {
                core.link_lost = true;
                if core.state().is_live() {
                    self.end(&mut core, EndReason::LinkLost);
                }
                Ok(core.state())
            }
            IntentKind::Incoming => self.apply_incoming(&mut core, &intent),
            IntentKind::Connected => self.apply_connected(&mut core, &intent),
            IntentKind::Ended => self.apply_ended(&mut core, &intent),
        };

        if let Err(e) = &result {
            if e.is_stale() {
                warn!(kind = %intent.kind, origin = %intent.origin, source = ?intent.source_event, error = %e, "Dropping stale intent");
            }
        }
        result
    }

    fn apply_incoming(&self, core: &mut EngineCore, intent: &CanonicalIntent) -> SoftphoneResult<CallState> {
        match core.state() {
            CallState::Idle => {}
            CallState::Ended => {
                let Some(session) = core.session.as_ref() else {
                    return Err(SoftphoneError::internal_error("ended state without a session"));
                };
                if intent.identity.shares_identifier_with(&session.identity) {
                    return Err(SoftphoneError::stale("incoming for the call that just ended"));
                }
                if !intent.identity.has_any() {
                    debug!(origin = %intent.origin, "Unnamed incoming during grace, opening a new call");
                }
                self.discard_ended(core);
            }
            state @ (CallState::Incoming | CallState::Active) => {
                debug!(origin = %intent.origin, state = %state, "Ignoring second incoming call");
                return Ok(state);
            }
        }

        self.open_incoming(core, intent.identity.clone(), intent.peer());
        Ok(CallState::Incoming)
    }

    fn apply_connected(&self, core: &mut EngineCore, intent: &CanonicalIntent) -> SoftphoneResult<CallState> {
        let Some(session) = core.session.as_mut() else {
            debug!(origin = %intent.origin, "Connected with no tracked call");
            return Ok(CallState::Idle);
        };

        match session.state {
            CallState::Ended => Err(SoftphoneError::stale("connected for an ended call")),
            CallState::Active => Ok(CallState::Active),
            CallState::Idle | CallState::Incoming => {
                if intent.identity.conflicts_with(&session.identity) {
                    return Err(SoftphoneError::stale("connected for a different call"));
                }
                session.identity.merge(&intent.identity);
                session.peer.fill_from(&intent.peer());
                let generation = session.generation;
                let identified = session.identity.has_any();
                self.watch_session(core);

                if identified {
                    self.activate(core);
                    Ok(CallState::Active)
                } else {
                    if let Some(session) = core.session.as_mut() {
                        session.connect_pending = true;
                    }
                    info!(generation, "Connected before any call id is known, waiting for identity");
                    self.start_poller(core, generation);
                    Ok(CallState::Incoming)
                }
            }
        }
    }

    fn apply_ended(&self, core: &mut EngineCore, intent: &CanonicalIntent) -> SoftphoneResult<CallState> {
        let Some(session) = core.session.as_ref() else {
            debug!(origin = %intent.origin, "Ended with no tracked call");
            return Ok(CallState::Idle);
        };

        match session.state {
            CallState::Ended => {
                debug!(origin = %intent.origin, call_id = %session.call_id, "Call already ended");
                Ok(CallState::Ended)
            }
            CallState::Idle | CallState::Incoming | CallState::Active => {
                if intent.identity.conflicts_with(&session.identity) {
                    return Err(SoftphoneError::stale("ended for a different call"));
                }
                if intent.origin == IntentOrigin::Push && session.identity.has_sdk_reference() {
                    debug!(call_id = %session.call_id, "Push call-ended is advisory while the SDK tracks the call");
                    return Ok(session.state);
                }

                let reason = match intent.origin {
                    IntentOrigin::Liveness => EndReason::Vanished,
                    IntentOrigin::Local => EndReason::LocalHangup,
                    _ => EndReason::Remote,
                };
                self.end(core, reason);
                Ok(CallState::Ended)
            }
        }
    }

    /// One liveness check for an active call
    pub(crate) async fn check_liveness(&self, generation: u64) -> PollStep {
        let identity = {
            let mut core = self.core.lock();
            match core.session_for(generation) {
                Some(session) if session.state == CallState::Active => session.identity.clone(),
                _ => return PollStep::Stop,
            }
        };

        let calls = match self.resolver().enumerate(self.sdk()).await {
            Ok(calls) => calls,
            Err(e) => {
                debug!(generation, error = %e, "Liveness check cannot enumerate calls");
                return PollStep::Continue;
            }
        };

        if calls.iter().any(|call| call.matches(&identity)) {
            return PollStep::Continue;
        }

        info!(generation, listed = calls.len(), "Active call no longer listed by the SDK");
        let vanished = CanonicalIntent::new(IntentKind::Ended, IntentOrigin::Liveness)
            .with_source_event("liveness")
            .with_detail("call missing from SDK registry");
        let _ = self.apply(vanished, Some(generation));
        PollStep::Stop
    }

    /// Merge freshly resolved identifiers into the session of `generation`
    pub(crate) fn adopt_identity(&self, generation: u64, identity: &CallIdentity) -> Option<CallIdentity> {
        let mut core = self.core.lock();
        let session = core.session_for(generation)?;
        if session.state.is_terminal() || identity.conflicts_with(&session.identity) {
            return None;
        }
        session.identity.merge(identity);
        let merged = session.identity.clone();
        self.watch_session(&mut core);
        Some(merged)
    }
}

#[async_trait]
impl RecoveryTarget for CallEngine {
    async fn recover_identity(&self, generation: u64, attempt: u32) -> PollStep {
        let known = {
            let mut core = self.core.lock();
            match core.session_for(generation) {
                Some(session) if session.state == CallState::Incoming => {
                    if session.identity.is_complete() && !session.connect_pending {
                        return PollStep::Stop;
                    }
                    session.identity.clone()
                }
                _ => return PollStep::Stop,
            }
        };

        match self.resolver().resolve(&known, self.sdk()).await {
            Resolution::Resolved(found) => {
                let mut core = self.core.lock();
                let Some(session) = core.session_for(generation) else {
                    return PollStep::Stop;
                };
                if session.state != CallState::Incoming || found.conflicts_with(&session.identity) {
                    return PollStep::Stop;
                }
                session.identity.merge(&found);
                debug!(
                    generation,
                    attempt,
                    server_call_id = ?session.identity.server_call_id,
                    sdk_call_id = ?session.identity.sdk_call_id,
                    "Poller resolved call identity"
                );

                let activate = session.connect_pending && session.identity.has_any();
                let complete = session.identity.is_complete();
                self.watch_session(&mut core);

                if activate {
                    self.activate(&mut core);
                    return PollStep::Stop;
                }
                if complete {
                    PollStep::Stop
                } else {
                    PollStep::Continue
                }
            }
            Resolution::Unresolved(reason) => {
                debug!(generation, attempt, %reason, "Identity still unresolved");
                PollStep::Continue
            }
        }
    }
}
