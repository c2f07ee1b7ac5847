//! Boundary with the vendor real-time communication SDK
//!
//! The SDK is an opaque, dynamically shaped object graph. Objects expose
//! methods and properties that come and go between releases, so the engine
//! never assumes a fixed API: it asks [`SdkObject::has_method`] and invokes by
//! name. Host bindings implement [`SdkObject`] over the real SDK handle.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Shared, non-owning reference to an SDK object (handle, session, call)
pub type SdkRef = Arc<dyn SdkObject>;

/// Failure raised by a single SDK invocation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{method}: {message}")]
pub struct SdkFault {
    pub method: String,
    pub message: String,
}

impl SdkFault {
    pub fn new(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            message: message.into(),
        }
    }
}

/// An object living on the SDK side
#[async_trait]
pub trait SdkObject: Send + Sync + fmt::Debug {
    /// Whether the object exposes a callable member with this name
    fn has_method(&self, name: &str) -> bool;

    /// Invoke a method; rejected promises and thrown errors map to `Err`
    async fn invoke(&self, name: &str, args: Vec<SdkValue>) -> Result<SdkValue, SdkFault>;

    /// Read a data member
    fn property(&self, _name: &str) -> Option<SdkValue> {
        None
    }

    /// Register a listener for an event name; returns false if the object
    /// has no event surface
    fn subscribe(&self, _event: &str, _sink: RawEventSink) -> bool {
        false
    }
}

/// Dynamically typed value crossing the SDK boundary
#[derive(Debug, Clone, Default)]
pub enum SdkValue {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<SdkValue>),
    Map(BTreeMap<String, SdkValue>),
    Object(SdkRef),
}

impl SdkValue {
    /// Build a map value from key/value pairs
    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, SdkValue)>,
    {
        SdkValue::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SdkValue::Null)
    }

    pub fn as_object(&self) -> Option<&SdkRef> {
        match self {
            SdkValue::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SdkValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Non-empty textual form of a scalar; integral numbers render without a fraction
    pub fn text(&self) -> Option<String> {
        match self {
            SdkValue::String(s) => {
                let trimmed = s.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            SdkValue::Number(n) if n.is_finite() && n.fract() == 0.0 => Some(format!("{}", *n as i64)),
            SdkValue::Number(n) if n.is_finite() => Some(n.to_string()),
            _ => None,
        }
    }

    /// Member access on maps and objects; `Null` results are treated as absent
    pub fn get(&self, key: &str) -> Option<SdkValue> {
        let value = match self {
            SdkValue::Map(map) => map.get(key).cloned(),
            SdkValue::Object(obj) => obj.property(key),
            _ => None,
        };
        value.filter(|v| !v.is_null())
    }

    /// Follow a dotted path such as `session.remote_identity.uri.user`
    pub fn lookup(&self, path: &str) -> Option<SdkValue> {
        let mut current = self.clone();
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current)
    }

    /// First non-empty text found along the given paths
    pub fn first_text(&self, paths: &[&str]) -> Option<String> {
        paths.iter().find_map(|path| self.lookup(path).and_then(|v| v.text()))
    }

    /// First object reference found along the given paths
    pub fn first_object(&self, paths: &[&str]) -> Option<SdkRef> {
        paths
            .iter()
            .find_map(|path| self.lookup(path).and_then(|v| v.as_object().cloned()))
    }
}

impl From<&str> for SdkValue {
    fn from(value: &str) -> Self {
        SdkValue::String(value.to_string())
    }
}

impl From<String> for SdkValue {
    fn from(value: String) -> Self {
        SdkValue::String(value)
    }
}

impl From<bool> for SdkValue {
    fn from(value: bool) -> Self {
        SdkValue::Bool(value)
    }
}

impl From<SdkRef> for SdkValue {
    fn from(value: SdkRef) -> Self {
        SdkValue::Object(value)
    }
}

impl From<Vec<SdkValue>> for SdkValue {
    fn from(value: Vec<SdkValue>) -> Self {
        SdkValue::List(value)
    }
}

impl From<serde_json::Value> for SdkValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => SdkValue::Null,
            Value::Bool(b) => SdkValue::Bool(b),
            Value::Number(n) => n.as_f64().map(SdkValue::Number).unwrap_or(SdkValue::Null),
            Value::String(s) => SdkValue::String(s),
            Value::Array(items) => SdkValue::List(items.into_iter().map(SdkValue::from).collect()),
            Value::Object(map) => {
                SdkValue::Map(map.into_iter().map(|(k, v)| (k, SdkValue::from(v))).collect())
            }
        }
    }
}

/// Whether two references point at the same SDK object
pub fn same_object(a: &SdkRef, b: &SdkRef) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// An event exactly as the SDK emitted it
#[derive(Debug, Clone)]
pub struct RawSdkEvent {
    /// Observation surface the listener was registered on
    pub surface: String,
    pub name: String,
    pub payload: SdkValue,
}

/// Listener handed to [`SdkObject::subscribe`]
#[derive(Debug, Clone)]
pub struct RawEventSink {
    surface: Arc<str>,
    tx: mpsc::UnboundedSender<RawSdkEvent>,
}

impl RawEventSink {
    pub fn new(surface: impl Into<Arc<str>>, tx: mpsc::UnboundedSender<RawSdkEvent>) -> Self {
        Self {
            surface: surface.into(),
            tx,
        }
    }

    pub fn surface(&self) -> &str {
        &self.surface
    }

    /// Forward an event; returns false once the engine side is gone
    pub fn emit(&self, name: impl Into<String>, payload: SdkValue) -> bool {
        self.tx
            .send(RawSdkEvent {
                surface: self.surface.to_string(),
                name: name.into(),
                payload,
            })
            .is_ok()
    }
}
