//! Call session model
//!
//! A [`CallSession`] is the single tracked call. It is owned by the
//! [`CallEngine`](crate::CallEngine); everything else sees clones.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::CallIdentity;

/// Unique identifier for a tracked call, local to this engine
pub type CallId = Uuid;

/// Placeholder used when the peer's name or number is not known
pub const UNKNOWN_PEER: &str = "Unknown";

/// Reconciled state of the soft-phone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    /// No call session exists
    Idle,
    /// A call is ringing and waiting for the user
    Incoming,
    /// The call is connected
    Active,
    /// The call is over; the session lingers for the grace period
    Ended,
}

impl CallState {
    /// Check if a call is ringing or connected
    pub fn is_live(&self) -> bool {
        matches!(self, CallState::Incoming | CallState::Active)
    }

    /// Check if the state is the per-session terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Idle => "idle",
            CallState::Incoming => "incoming",
            CallState::Active => "active",
            CallState::Ended => "ended",
        };
        f.write_str(name)
    }
}

/// Direction of a call (from the soft-phone's perspective)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    Inbound,
    Outbound,
}

/// User-initiated request currently awaiting the SDK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingRequest {
    Answer,
    Hangup,
}

impl PendingRequest {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingRequest::Answer => "answer",
            PendingRequest::Hangup => "hangup",
        }
    }
}

/// Best-effort display information about the remote party
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub display_name: String,
    pub number: String,
}

impl PeerInfo {
    /// Build peer info, substituting "Unknown" for missing or blank fields
    pub fn new(display_name: Option<String>, number: Option<String>) -> Self {
        fn or_unknown(value: Option<String>) -> String {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| UNKNOWN_PEER.to_string())
        }

        Self {
            display_name: or_unknown(display_name),
            number: or_unknown(number),
        }
    }

    pub fn unknown() -> Self {
        Self::new(None, None)
    }

    pub fn is_unknown(&self) -> bool {
        self.display_name == UNKNOWN_PEER && self.number == UNKNOWN_PEER
    }

    /// Fill unknown fields from another, better-informed source
    pub fn fill_from(&mut self, other: &PeerInfo) {
        if self.display_name == UNKNOWN_PEER {
            self.display_name = other.display_name.clone();
        }
        if self.number == UNKNOWN_PEER {
            self.number = other.number.clone();
        }
    }
}

impl Default for PeerInfo {
    fn default() -> Self {
        Self::unknown()
    }
}

/// The one live call tracked by the engine
#[derive(Debug, Clone)]
pub struct CallSession {
    /// Local identifier, stable for the lifetime of the session
    pub call_id: CallId,
    /// Engine-wide counter value; timers compare it before acting
    pub generation: u64,
    pub state: CallState,
    pub direction: CallDirection,
    /// Server-side and SDK-side identifiers known so far
    pub identity: CallIdentity,
    pub peer: PeerInfo,
    /// Intended mute state; not verified against the SDK
    pub muted: bool,
    /// Intended hold state; not verified against the SDK
    pub on_hold: bool,
    pub created_at: DateTime<Utc>,
    /// When the call entered `Active`
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub(crate) in_flight: Option<PendingRequest>,
    pub(crate) connect_pending: bool,
}

impl CallSession {
    pub(crate) fn new(
        generation: u64,
        state: CallState,
        direction: CallDirection,
        identity: CallIdentity,
        peer: PeerInfo,
    ) -> Self {
        Self {
            call_id: CallId::new_v4(),
            generation,
            state,
            direction,
            identity,
            peer,
            muted: false,
            on_hold: false,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            in_flight: None,
            connect_pending: false,
        }
    }

    pub fn server_call_id(&self) -> Option<&str> {
        self.identity.server_call_id.as_deref()
    }

    pub fn sdk_call_id(&self) -> Option<&str> {
        self.identity.sdk_call_id.as_deref()
    }

    /// Request currently awaiting the SDK, if any
    pub fn in_flight(&self) -> Option<PendingRequest> {
        self.in_flight
    }

    /// Whether the SDK reported the call connected before any id was known
    pub fn is_connect_pending(&self) -> bool {
        self.connect_pending
    }

    /// Talk time so far, or total talk time once ended
    pub fn duration(&self) -> Option<chrono::Duration> {
        let started = self.started_at?;
        let until = self.ended_at.unwrap_or_else(Utc::now);
        Some(until - started)
    }
}

/// Operations that are valid in the current state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallCapabilities {
    pub can_answer: bool,
    pub can_hangup: bool,
    pub can_mute: bool,
    pub can_hold: bool,
    pub can_dial: bool,
}

impl CallCapabilities {
    pub(crate) fn for_session(session: Option<&CallSession>, dial_in_flight: bool) -> Self {
        let Some(session) = session else {
            return Self {
                can_dial: !dial_in_flight,
                ..Default::default()
            };
        };

        let idle_request = session.in_flight.is_none();
        match session.state {
            CallState::Incoming => Self {
                can_answer: idle_request,
                can_hangup: idle_request,
                ..Default::default()
            },
            CallState::Active => Self {
                can_hangup: idle_request,
                can_mute: true,
                can_hold: true,
                ..Default::default()
            },
            CallState::Idle | CallState::Ended => Self::default(),
        }
    }
}

/// Snapshot of the engine for the host UI
#[derive(Debug, Clone)]
pub struct CallStatus {
    pub state: CallState,
    pub session: Option<CallSession>,
    pub capabilities: CallCapabilities,
}
