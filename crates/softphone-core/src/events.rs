//! Events surfaced to the host UI

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::call::{CallDirection, CallId, PeerInfo};

/// Why a call reached `Ended`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// The SDK or the push channel reported the call over
    Remote,
    /// The user hung up
    LocalHangup,
    /// The SDK lost its link to the PBX
    LinkLost,
    /// The SDK registry no longer lists the call
    Vanished,
}

/// Kind of transient, non-fatal notice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoticeKind {
    /// No SDK signature worked for an operation
    CapabilityUnavailable,
    /// The call was ended locally but the SDK never confirmed it
    HangupUnconfirmed,
    /// Mute or hold could not be applied; the local flag was flipped anyway
    ControlFailed,
    /// The SDK reported an error that does not end the call
    SdkError,
    /// The link to the PBX dropped earlier; reconnect before calling
    ReconnectRequired,
}

/// A transient message for the user
#[derive(Debug, Clone)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
    pub call_id: Option<CallId>,
    pub timestamp: DateTime<Utc>,
}

impl Notice {
    pub fn new(kind: NoticeKind, message: impl Into<String>, call_id: Option<CallId>) -> Self {
        Self {
            kind,
            message: message.into(),
            call_id,
            timestamp: Utc::now(),
        }
    }
}

/// Event priority levels for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventPriority {
    Low,
    Normal,
    High,
}

/// Everything the engine tells the host
#[derive(Debug, Clone)]
pub enum SoftphoneEvent {
    Incoming { call_id: CallId, peer: PeerInfo },
    Active {
        call_id: CallId,
        peer: PeerInfo,
        direction: CallDirection,
    },
    Ended { call_id: CallId, reason: EndReason },
    Notice(Notice),
}

impl SoftphoneEvent {
    pub fn priority(&self) -> EventPriority {
        match self {
            SoftphoneEvent::Incoming { .. } => EventPriority::High,
            SoftphoneEvent::Active { .. } | SoftphoneEvent::Ended { .. } => EventPriority::Normal,
            SoftphoneEvent::Notice(notice) => match notice.kind {
                NoticeKind::CapabilityUnavailable | NoticeKind::HangupUnconfirmed => EventPriority::High,
                _ => EventPriority::Low,
            },
        }
    }

    /// Get the call ID associated with this event (if any)
    pub fn call_id(&self) -> Option<CallId> {
        match self {
            SoftphoneEvent::Incoming { call_id, .. }
            | SoftphoneEvent::Active { call_id, .. }
            | SoftphoneEvent::Ended { call_id, .. } => Some(*call_id),
            SoftphoneEvent::Notice(notice) => notice.call_id,
        }
    }
}

/// Host UI callbacks
///
/// Each transition callback fires at most once per transition.
#[async_trait]
pub trait CallEventHandler: Send + Sync {
    /// A call started ringing
    async fn on_incoming(&self, call_id: CallId, peer: PeerInfo);

    /// A call became active
    async fn on_active(&self, call_id: CallId, peer: PeerInfo, direction: CallDirection);

    /// A call ended
    async fn on_ended(&self, call_id: CallId, reason: EndReason);

    /// Transient notice (optional - default implementation does nothing)
    async fn on_notice(&self, _notice: Notice) {}

    async fn on_event(&self, event: SoftphoneEvent) {
        match event {
            SoftphoneEvent::Incoming { call_id, peer } => self.on_incoming(call_id, peer).await,
            SoftphoneEvent::Active {
                call_id,
                peer,
                direction,
            } => self.on_active(call_id, peer, direction).await,
            SoftphoneEvent::Ended { call_id, reason } => self.on_ended(call_id, reason).await,
            SoftphoneEvent::Notice(notice) => self.on_notice(notice).await,
        }
    }
}
