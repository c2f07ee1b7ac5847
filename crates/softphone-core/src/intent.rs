//! Canonical intents fed into the engine
//!
//! Every channel (SDK events, push, poller, liveness checks, local requests)
//! is reduced to a [`CanonicalIntent`] before it touches call state.

use std::fmt;

use crate::call::PeerInfo;
use crate::identity::CallIdentity;

/// What a signal claims happened to the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntentKind {
    Incoming,
    Connected,
    Ended,
    /// The SDK lost its link to the PBX
    LinkLost,
    /// Something went wrong that does not end the call
    Error,
}

impl fmt::Display for IntentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IntentKind::Incoming => "incoming",
            IntentKind::Connected => "connected",
            IntentKind::Ended => "ended",
            IntentKind::LinkLost => "link-lost",
            IntentKind::Error => "error",
        };
        f.write_str(name)
    }
}

/// Channel an intent came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntentOrigin {
    Sdk,
    Push,
    Poller,
    Liveness,
    Local,
}

impl fmt::Display for IntentOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IntentOrigin::Sdk => "sdk",
            IntentOrigin::Push => "push",
            IntentOrigin::Poller => "poller",
            IntentOrigin::Liveness => "liveness",
            IntentOrigin::Local => "local",
        };
        f.write_str(name)
    }
}

/// A normalized signal about the tracked call
#[derive(Debug, Clone)]
pub struct CanonicalIntent {
    pub kind: IntentKind,
    pub origin: IntentOrigin,
    pub identity: CallIdentity,
    pub peer_name: Option<String>,
    pub peer_number: Option<String>,
    /// Human-readable detail (error text, end cause)
    pub detail: Option<String>,
    /// Raw event name this was derived from, for logs
    pub source_event: Option<String>,
}

impl CanonicalIntent {
    pub fn new(kind: IntentKind, origin: IntentOrigin) -> Self {
        Self {
            kind,
            origin,
            identity: CallIdentity::default(),
            peer_name: None,
            peer_number: None,
            detail: None,
            source_event: None,
        }
    }

    pub fn with_identity(mut self, identity: CallIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_peer(mut self, name: Option<String>, number: Option<String>) -> Self {
        self.peer_name = name;
        self.peer_number = number;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_source_event(mut self, name: impl Into<String>) -> Self {
        self.source_event = Some(name.into());
        self
    }

    /// Peer info with "Unknown" substituted for missing fields
    pub fn peer(&self) -> PeerInfo {
        PeerInfo::new(self.peer_name.clone(), self.peer_number.clone())
    }
}
