//! SDK event normalization
//!
//! The SDK fires differently named events depending on release and on which
//! sub-object you listen to. [`EventNormalizer::attach`] subscribes to every
//! name in [`EVENT_TABLE`] on every observation surface, and
//! [`EventNormalizer::normalize`] reduces whatever arrives to a
//! [`CanonicalIntent`].
//!
//! Session objects only exist once a call does, so the engine subscribes
//! each one through [`EventNormalizer::watch_session`] as it adopts it. Their
//! surface name carries the session generation.

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::call::CallState;
use crate::identity::CallIdentity;
use crate::intent::{CanonicalIntent, IntentKind, IntentOrigin};
use crate::sdk::{RawEventSink, RawSdkEvent, SdkRef, SdkValue};

/// Sub-objects of the handle that may carry their own event surface
pub const OBSERVATION_SURFACES: &[&str] = &["ua", "phone", "client", "callManager", "events"];

/// Surface name used for listeners registered directly on the handle
pub const HANDLE_SURFACE: &str = "handle";

const SESSION_SURFACE_PREFIX: &str = "session#";

/// Surface name for the SDK session object of one call generation
pub fn session_surface(generation: u64) -> String {
    format!("{}{}", SESSION_SURFACE_PREFIX, generation)
}

/// Generation a session surface belongs to; `None` for shared surfaces
pub fn session_generation(surface: &str) -> Option<u64> {
    surface.strip_prefix(SESSION_SURFACE_PREFIX)?.parse().ok()
}

/// How a raw event name maps onto an intent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventMapping {
    Fixed(IntentKind),
    /// A new session object; incoming unless locally originated
    SessionCreated,
    /// Generic status change; the kind depends on the payload's status value
    Status,
}

use EventMapping::{Fixed, SessionCreated, Status};
use IntentKind::{Connected, Ended, Error, Incoming, LinkLost};

/// Every event name any supported SDK release is known to emit
pub const EVENT_TABLE: &[(&str, EventMapping)] = &[
    ("incoming", Fixed(Incoming)),
    ("incomingCall", Fixed(Incoming)),
    ("incoming_call", Fixed(Incoming)),
    ("ringing", Fixed(Incoming)),
    ("invite", Fixed(Incoming)),
    ("callReceived", Fixed(Incoming)),
    ("newRTCSession", SessionCreated),
    ("newSession", SessionCreated),
    ("sessionCreated", SessionCreated),
    ("newCall", SessionCreated),
    ("accepted", Fixed(Connected)),
    ("confirmed", Fixed(Connected)),
    ("answered", Fixed(Connected)),
    ("connected", Fixed(Connected)),
    ("callAnswered", Fixed(Connected)),
    ("callConnected", Fixed(Connected)),
    ("established", Fixed(Connected)),
    ("ended", Fixed(Ended)),
    ("failed", Fixed(Ended)),
    ("bye", Fixed(Ended)),
    ("hangup", Fixed(Ended)),
    ("terminated", Fixed(Ended)),
    ("callEnded", Fixed(Ended)),
    ("callTerminated", Fixed(Ended)),
    ("callFailed", Fixed(Ended)),
    ("disconnected", Fixed(LinkLost)),
    ("unregistered", Fixed(LinkLost)),
    ("registrationFailed", Fixed(LinkLost)),
    ("connectionLost", Fixed(LinkLost)),
    ("transportError", Fixed(LinkLost)),
    ("error", Fixed(Error)),
    ("callError", Fixed(Error)),
    ("mediaError", Fixed(Error)),
    ("callStatus", Status),
    ("statusChanged", Status),
    ("callStateChanged", Status),
];

const NUMBER_PATHS: &[&str] = &[
    "callerNumber",
    "caller_number",
    "number",
    "from",
    "caller",
    "remoteNumber",
    "session.remote_identity.uri.user",
    "remote_identity.uri.user",
    "request.from.uri.user",
    "data.callerNumber",
];

const NAME_PATHS: &[&str] = &[
    "callerName",
    "caller_name",
    "displayName",
    "display_name",
    "name",
    "session.remote_identity.display_name",
    "remote_identity.display_name",
    "request.from.display_name",
    "data.callerName",
];

const DETAIL_PATHS: &[&str] = &["cause", "reason", "message", "error.message", "error", "data.cause"];

const ORIGINATOR_PATHS: &[&str] = &["originator", "direction", "session.direction", "session.originator"];

const STATUS_PATHS: &[&str] = &["status", "state", "callStatus", "data.status"];

fn lookup(name: &str) -> Option<EventMapping> {
    EVENT_TABLE
        .iter()
        .find(|(event, _)| *event == name)
        .map(|(_, mapping)| *mapping)
}

fn status_kind(status: &str) -> Option<IntentKind> {
    match status.to_ascii_lowercase().as_str() {
        "ringing" | "incoming" | "alerting" | "ring" => Some(Incoming),
        "answered" | "connected" | "confirmed" | "accepted" | "active" | "talking" | "established" => {
            Some(Connected)
        }
        "ended" | "terminated" | "hangup" | "bye" | "failed" | "closed" | "idle" => Some(Ended),
        "disconnected" | "offline" | "unregistered" => Some(LinkLost),
        "error" => Some(Error),
        _ => None,
    }
}

fn is_local_origin(payload: &SdkValue) -> bool {
    payload
        .first_text(ORIGINATOR_PATHS)
        .map(|origin| matches!(origin.to_ascii_lowercase().as_str(), "local" | "outgoing" | "outbound"))
        .unwrap_or(false)
}

/// What [`EventNormalizer::attach`] managed to register
#[derive(Debug, Clone, Default)]
pub struct Subscription {
    /// Surfaces that accepted at least one listener
    pub surfaces: Vec<String>,
    /// Total listeners registered
    pub listeners: usize,
}

/// Maps raw SDK events onto canonical intents
#[derive(Debug, Clone, Default)]
pub struct EventNormalizer;

impl EventNormalizer {
    pub fn new() -> Self {
        Self
    }

    /// Subscribe to every known event name on the handle and its sub-objects
    pub fn attach(&self, handle: &SdkRef, tx: &mpsc::UnboundedSender<RawSdkEvent>) -> Subscription {
        let mut surfaces = vec![(HANDLE_SURFACE.to_string(), handle.clone())];
        for name in OBSERVATION_SURFACES {
            if let Some(object) = handle.property(name).and_then(|v| v.as_object().cloned()) {
                surfaces.push((name.to_string(), object));
            }
        }

        let mut subscription = Subscription::default();
        for (surface, object) in surfaces {
            let registered = self.subscribe_surface(&surface, &object, tx);
            if registered > 0 {
                subscription.surfaces.push(surface);
                subscription.listeners += registered;
            }
        }

        debug!(
            surfaces = ?subscription.surfaces,
            listeners = subscription.listeners,
            "SDK event normalizer attached"
        );
        subscription
    }

    /// Subscribe to every known event name on a call's SDK session object
    pub fn watch_session(&self, generation: u64, session: &SdkRef, tx: &mpsc::UnboundedSender<RawSdkEvent>) -> usize {
        self.subscribe_surface(&session_surface(generation), session, tx)
    }

    fn subscribe_surface(&self, surface: &str, object: &SdkRef, tx: &mpsc::UnboundedSender<RawSdkEvent>) -> usize {
        let sink = RawEventSink::new(surface, tx.clone());
        let registered = EVENT_TABLE
            .iter()
            .filter(|(event, _)| object.subscribe(event, sink.clone()))
            .count();
        if registered > 0 {
            trace!(surface, registered, "Subscribed to SDK events");
        }
        registered
    }

    /// Reduce a raw event to an intent; `None` for unknown or meaningless events
    pub fn normalize(&self, event: &RawSdkEvent) -> Option<CanonicalIntent> {
        let Some(mapping) = lookup(&event.name) else {
            debug!(surface = %event.surface, event = %event.name, "Dropping unmapped SDK event");
            return None;
        };

        let payload = &event.payload;
        let kind = match mapping {
            Fixed(kind) => kind,
            SessionCreated if is_local_origin(payload) => {
                debug!(event = %event.name, "Ignoring locally originated session");
                return None;
            }
            SessionCreated => Incoming,
            Status => match payload.first_text(STATUS_PATHS).and_then(|s| status_kind(&s)) {
                Some(kind) => kind,
                None => {
                    debug!(event = %event.name, "Dropping status event with unrecognized status");
                    return None;
                }
            },
        };

        let mut intent = CanonicalIntent::new(kind, IntentOrigin::Sdk)
            .with_identity(CallIdentity::from_sdk_value(payload))
            .with_peer(payload.first_text(NAME_PATHS), payload.first_text(NUMBER_PATHS))
            .with_source_event(event.name.clone());
        if let Some(detail) = payload.first_text(DETAIL_PATHS).or_else(|| payload.text()) {
            intent = intent.with_detail(detail);
        }
        Some(intent)
    }

    /// State the engine would reach if it applied `kind` from `current`
    pub fn project(current: CallState, kind: IntentKind) -> CallState {
        match (current, kind) {
            (CallState::Idle | CallState::Ended, Incoming) => CallState::Incoming,
            (CallState::Incoming, Connected) => CallState::Active,
            (CallState::Incoming | CallState::Active, Ended | LinkLost) => CallState::Ended,
            (state, _) => state,
        }
    }

    /// Dedup against the current state
    ///
    /// Terminal and error signals always pass. Link loss also passes so a
    /// reconnect notice can be armed while idle.
    pub fn should_forward(intent: &CanonicalIntent, current: CallState) -> bool {
        match intent.kind {
            Ended | Error | LinkLost => true,
            kind => Self::project(current, kind) != current,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedSdk;
    use serde_json::json;

    fn raw(name: &str, payload: serde_json::Value) -> RawSdkEvent {
        RawSdkEvent {
            surface: HANDLE_SURFACE.to_string(),
            name: name.to_string(),
            payload: SdkValue::from(payload),
        }
    }

    #[test]
    fn test_incoming_extracts_peer_and_ids() {
        let intent = EventNormalizer::new()
            .normalize(&raw(
                "newRTCSession",
                json!({
                    "originator": "remote",
                    "session": { "id": "a1", "remote_identity": { "display_name": "Front Desk", "uri": { "user": "1002" } } }
                }),
            ))
            .unwrap();

        assert_eq!(intent.kind, IntentKind::Incoming);
        assert_eq!(intent.identity.sdk_call_id.as_deref(), Some("a1"));
        assert_eq!(intent.peer().display_name, "Front Desk");
        assert_eq!(intent.peer().number, "1002");
    }

    #[test]
    fn test_local_sessions_and_unknown_events_are_dropped() {
        let normalizer = EventNormalizer::new();
        assert!(normalizer.normalize(&raw("newRTCSession", json!({ "originator": "local" }))).is_none());
        assert!(normalizer.normalize(&raw("iceCandidate", json!({}))).is_none());
    }

    #[test]
    fn test_status_events_map_by_value() {
        let normalizer = EventNormalizer::new();
        let talking = normalizer.normalize(&raw("callStatus", json!({ "status": "TALKING" }))).unwrap();
        assert_eq!(talking.kind, IntentKind::Connected);
        let gone = normalizer.normalize(&raw("statusChanged", json!({ "state": "hangup" }))).unwrap();
        assert_eq!(gone.kind, IntentKind::Ended);
        assert!(normalizer.normalize(&raw("callStatus", json!({ "status": "dialing-tone" }))).is_none());
    }

    #[test]
    fn test_dedup_by_projected_state() {
        let incoming = CanonicalIntent::new(IntentKind::Incoming, IntentOrigin::Sdk);
        let connected = CanonicalIntent::new(IntentKind::Connected, IntentOrigin::Sdk);
        let ended = CanonicalIntent::new(IntentKind::Ended, IntentOrigin::Sdk);

        assert!(EventNormalizer::should_forward(&incoming, CallState::Idle));
        assert!(!EventNormalizer::should_forward(&incoming, CallState::Active));
        assert!(!EventNormalizer::should_forward(&connected, CallState::Active));
        assert!(EventNormalizer::should_forward(&ended, CallState::Idle));
        assert!(EventNormalizer::should_forward(&ended, CallState::Ended));
    }

    #[tokio::test]
    async fn test_attach_covers_sub_surfaces() {
        let sdk = ScriptedSdk::new("handle");
        let ua = ScriptedSdk::new("ua");
        sdk.set_property("ua", SdkValue::Object(ua.handle()));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = EventNormalizer::new().attach(&sdk.handle(), &tx);
        assert_eq!(subscription.surfaces, vec!["handle".to_string(), "ua".to_string()]);
        assert_eq!(subscription.listeners, EVENT_TABLE.len() * 2);

        assert!(ua.emit("ended", SdkValue::Null));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.surface, "ua");
        assert_eq!(event.name, "ended");
    }

    #[tokio::test]
    async fn test_watch_session_tags_events_with_generation() {
        let session = ScriptedSdk::new("session");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let registered = EventNormalizer::new().watch_session(7, &session.handle(), &tx);
        assert_eq!(registered, EVENT_TABLE.len());
        assert_eq!(session.listener_count("bye"), 1);

        assert!(session.emit("bye", SdkValue::Null));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.surface, "session#7");
        assert_eq!(session_generation(&event.surface), Some(7));
        assert_eq!(session_generation(HANDLE_SURFACE), None);
        assert_eq!(session_generation("session#x"), None);
    }
}
