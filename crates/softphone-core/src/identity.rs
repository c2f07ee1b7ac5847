//! Identity resolution between the push channel and the SDK
//!
//! The push channel names a call by the PBX's server call id; the SDK names
//! the same call by its own session id or object. [`IdentityResolver`] fills
//! in whichever side is missing by enumerating the SDK's call registry. It
//! resolves once per invocation; callers own the retry cadence.

use std::fmt;

use tracing::debug;

use crate::error::SoftphoneResult;
use crate::probe::{CapabilityProbe, ProbeContext, Verb};
use crate::sdk::{same_object, SdkRef, SdkValue};

/// Field paths that may hold the SDK's own call id
pub(crate) const SDK_ID_PATHS: &[&str] = &[
    "callId",
    "call_id",
    "sessionId",
    "session_id",
    "id",
    "uuid",
    "session.id",
    "call.id",
    "data.callId",
];

/// Field paths that may hold the PBX server call id
pub(crate) const SERVER_ID_PATHS: &[&str] = &[
    "serverCallId",
    "server_call_id",
    "pbxCallId",
    "linkedid",
    "data.serverCallId",
];

/// Field paths that may hold the SDK session object
pub(crate) const SESSION_PATHS: &[&str] = &["session", "call", "data.session"];

const STATUS_PATHS: &[&str] = &["status", "state", "session.status"];

const FINISHED_STATUSES: &[&str] = &["ended", "terminated", "hangup", "bye", "closed", "failed"];

/// Identifiers known for one call
#[derive(Clone, Default)]
pub struct CallIdentity {
    pub server_call_id: Option<String>,
    pub sdk_call_id: Option<String>,
    pub sdk_session: Option<SdkRef>,
}

impl fmt::Debug for CallIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallIdentity")
            .field("server_call_id", &self.server_call_id)
            .field("sdk_call_id", &self.sdk_call_id)
            .field("sdk_session", &self.sdk_session.as_ref().map(|_| "<sdk session>"))
            .finish()
    }
}

impl CallIdentity {
    pub fn with_server_call_id(mut self, id: impl Into<String>) -> Self {
        self.server_call_id = Some(id.into());
        self
    }

    pub fn with_sdk_call_id(mut self, id: impl Into<String>) -> Self {
        self.sdk_call_id = Some(id.into());
        self
    }

    pub fn with_session(mut self, session: SdkRef) -> Self {
        self.sdk_session = Some(session);
        self
    }

    /// Both namespaces resolved
    pub fn is_complete(&self) -> bool {
        self.server_call_id.is_some() && self.sdk_call_id.is_some()
    }

    /// At least one identifier known
    pub fn has_any(&self) -> bool {
        self.server_call_id.is_some() || self.has_sdk_reference()
    }

    pub fn has_sdk_reference(&self) -> bool {
        self.sdk_call_id.is_some() || self.sdk_session.is_some()
    }

    /// Some identifier is present on both sides with different values
    pub fn conflicts_with(&self, other: &CallIdentity) -> bool {
        let differs = |a: &Option<String>, b: &Option<String>| matches!((a, b), (Some(a), Some(b)) if a != b);
        let session_differs = matches!(
            (&self.sdk_session, &other.sdk_session),
            (Some(a), Some(b)) if !same_object(a, b)
        );

        differs(&self.server_call_id, &other.server_call_id)
            || differs(&self.sdk_call_id, &other.sdk_call_id)
            || (session_differs && (self.sdk_call_id.is_none() || other.sdk_call_id.is_none()))
    }

    /// Some identifier is present on both sides with the same value
    pub fn shares_identifier_with(&self, other: &CallIdentity) -> bool {
        let same = |a: &Option<String>, b: &Option<String>| matches!((a, b), (Some(a), Some(b)) if a == b);
        let same_session = matches!(
            (&self.sdk_session, &other.sdk_session),
            (Some(a), Some(b)) if same_object(a, b)
        );

        same(&self.server_call_id, &other.server_call_id)
            || same(&self.sdk_call_id, &other.sdk_call_id)
            || same_session
    }

    /// Adopt identifiers from `other` that are not yet known; returns true if anything changed
    pub fn merge(&mut self, other: &CallIdentity) -> bool {
        let mut changed = false;
        if self.server_call_id.is_none() && other.server_call_id.is_some() {
            self.server_call_id = other.server_call_id.clone();
            changed = true;
        }
        if self.sdk_call_id.is_none() && other.sdk_call_id.is_some() {
            self.sdk_call_id = other.sdk_call_id.clone();
            changed = true;
        }
        if self.sdk_session.is_none() && other.sdk_session.is_some() {
            self.sdk_session = other.sdk_session.clone();
            changed = true;
        }
        changed
    }

    /// Extract whatever identifiers a raw SDK value carries
    pub fn from_sdk_value(value: &SdkValue) -> Self {
        let sdk_session = value
            .as_object()
            .cloned()
            .or_else(|| value.first_object(SESSION_PATHS));

        let mut sdk_call_id = value.first_text(SDK_ID_PATHS);
        if sdk_call_id.is_none() {
            if let Some(session) = &sdk_session {
                sdk_call_id = SdkValue::Object(session.clone()).first_text(&["id", "callId", "sessionId"]);
            }
        }

        Self {
            server_call_id: value.first_text(SERVER_ID_PATHS),
            sdk_call_id,
            sdk_session,
        }
    }

    /// Like [`CallIdentity::from_sdk_value`], but a bare scalar is taken as the SDK call id
    ///
    /// Some releases return just the id from dial or list calls as plain ids.
    pub fn from_returned_value(value: &SdkValue) -> Self {
        let mut identity = Self::from_sdk_value(value);
        if identity.sdk_call_id.is_none() {
            identity.sdk_call_id = value.text();
        }
        identity
    }
}

/// One call as listed by the SDK registry
#[derive(Debug, Clone)]
pub struct EnumeratedCall {
    pub identity: CallIdentity,
}

impl EnumeratedCall {
    /// Whether this registry entry is the call described by `known`
    pub fn matches(&self, known: &CallIdentity) -> bool {
        if known.has_sdk_reference() {
            self.identity.shares_identifier_with(known)
        } else {
            true
        }
    }
}

/// Why resolution did not produce identifiers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnresolvedReason {
    /// The registry is empty
    NoCalls,
    /// More than one candidate call; pairing would be a guess
    Ambiguous(usize),
    /// The only call contradicts what is already known
    Conflict,
    /// The registry entry carried no usable identifier
    NoIdentifiers,
    /// The SDK exposes no way to enumerate calls
    NoCapability,
}

impl fmt::Display for UnresolvedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnresolvedReason::NoCalls => write!(f, "no calls in SDK registry"),
            UnresolvedReason::Ambiguous(n) => write!(f, "{} calls in SDK registry, refusing to guess", n),
            UnresolvedReason::Conflict => write!(f, "SDK call contradicts known identifiers"),
            UnresolvedReason::NoIdentifiers => write!(f, "SDK call carries no identifiers"),
            UnresolvedReason::NoCapability => write!(f, "SDK cannot enumerate calls"),
        }
    }
}

/// Outcome of one resolution attempt
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Merged identity; at least one new identifier was adopted, or it was already complete
    Resolved(CallIdentity),
    Unresolved(UnresolvedReason),
}

/// Parse whatever shape the registry came back in
pub fn parse_registry(value: &SdkValue) -> Vec<EnumeratedCall> {
    let entries: Vec<SdkValue> = match value {
        SdkValue::Null => Vec::new(),
        SdkValue::List(items) => items.clone(),
        SdkValue::Object(_) => vec![value.clone()],
        SdkValue::Map(map) => {
            if value.first_text(SDK_ID_PATHS).is_some() || value.first_object(SESSION_PATHS).is_some() {
                vec![value.clone()]
            } else {
                // Registry keyed by call id
                map.iter()
                    .filter(|(_, entry)| !entry.is_null())
                    .map(|(key, entry)| match entry {
                        SdkValue::Map(inner) if entry.first_text(SDK_ID_PATHS).is_none() => {
                            let mut inner = inner.clone();
                            inner.insert("id".to_string(), SdkValue::String(key.clone()));
                            SdkValue::Map(inner)
                        }
                        _ => entry.clone(),
                    })
                    .collect()
            }
        }
        other => vec![other.clone()],
    };

    entries
        .iter()
        .filter(|entry| !is_finished(entry))
        .map(|entry| EnumeratedCall {
            identity: CallIdentity::from_returned_value(entry),
        })
        .collect()
}

fn is_finished(entry: &SdkValue) -> bool {
    entry
        .first_text(STATUS_PATHS)
        .map(|status| FINISHED_STATUSES.contains(&status.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Fills in missing call identifiers from the SDK registry
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    probe: CapabilityProbe,
}

impl IdentityResolver {
    pub fn new(probe: CapabilityProbe) -> Self {
        Self { probe }
    }

    /// List the calls the SDK currently knows about
    pub async fn enumerate(&self, handle: &SdkRef) -> SoftphoneResult<Vec<EnumeratedCall>> {
        let ctx = ProbeContext::new(handle.clone());
        let capability = self.probe.invoke(Verb::EnumerateCalls, &ctx).await?;
        let calls = parse_registry(&capability.value);
        debug!(
            signature = capability.signature,
            calls = calls.len(),
            "Enumerated SDK calls"
        );
        Ok(calls)
    }

    /// One resolution attempt for `known`
    pub async fn resolve(&self, known: &CallIdentity, handle: &SdkRef) -> Resolution {
        if known.is_complete() {
            return Resolution::Resolved(known.clone());
        }

        let calls = match self.enumerate(handle).await {
            Ok(calls) => calls,
            Err(_) => return Resolution::Unresolved(UnresolvedReason::NoCapability),
        };

        let found = match calls.as_slice() {
            [] => return Resolution::Unresolved(UnresolvedReason::NoCalls),
            [only] => &only.identity,
            many => return Resolution::Unresolved(UnresolvedReason::Ambiguous(many.len())),
        };

        if found.conflicts_with(known) {
            return Resolution::Unresolved(UnresolvedReason::Conflict);
        }

        let mut merged = known.clone();
        if merged.merge(found) {
            debug!(
                server_call_id = ?merged.server_call_id,
                sdk_call_id = ?merged.sdk_call_id,
                has_session = merged.sdk_session.is_some(),
                "Resolved call identity from SDK registry"
            );
            Resolution::Resolved(merged)
        } else {
            Resolution::Unresolved(UnresolvedReason::NoIdentifiers)
        }
    }
}
