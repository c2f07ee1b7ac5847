//! Scripted stand-ins for the vendor SDK and the host UI
//!
//! [`ScriptedSdk`] answers invocations from a per-method script, records
//! every call and lets tests fire SDK events. [`RecordingHandler`] collects
//! what the engine tells the host.
//!
//! Built for this crate's unit tests and behind the `testing` feature.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::call::{CallDirection, CallId, PeerInfo};
use crate::events::{CallEventHandler, EndReason, Notice, SoftphoneEvent};
use crate::sdk::{RawEventSink, SdkFault, SdkObject, SdkRef, SdkValue};

/// How a scripted method responds
#[derive(Debug, Clone)]
pub enum Scripted {
    Return(SdkValue),
    Fail(String),
    /// Never completes
    Hang,
    /// Waits, then behaves like the inner script
    Delayed(Duration, Box<Scripted>),
    /// One outcome per call; the last one repeats
    Sequence(Vec<Scripted>),
}

/// One recorded invocation
#[derive(Debug, Clone)]
pub struct Invocation {
    pub method: String,
    pub args: Vec<SdkValue>,
}

enum Outcome {
    Value(SdkValue),
    Fault(String),
    Hang,
    After(Duration, Box<Outcome>),
}

impl Outcome {
    fn from_step(step: Scripted) -> Self {
        match step {
            Scripted::Return(value) => Outcome::Value(value),
            Scripted::Fail(message) => Outcome::Fault(message),
            Scripted::Hang => Outcome::Hang,
            Scripted::Delayed(delay, inner) => Outcome::After(delay, Box::new(Outcome::from_step(*inner))),
            Scripted::Sequence(_) => Outcome::Fault("nested sequence".to_string()),
        }
    }
}

/// An SDK object whose behaviour is set by the test
#[derive(Debug, Default)]
pub struct ScriptedSdk {
    name: String,
    methods: Mutex<HashMap<String, VecDeque<Scripted>>>,
    properties: Mutex<HashMap<String, SdkValue>>,
    listeners: Mutex<HashMap<String, Vec<RawEventSink>>>,
    invocations: Mutex<Vec<Invocation>>,
}

impl ScriptedSdk {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            ..Default::default()
        })
    }

    pub fn handle(self: &Arc<Self>) -> SdkRef {
        self.clone()
    }

    /// Expose a method with the given behaviour, replacing any earlier script
    pub fn on(&self, method: impl Into<String>, script: Scripted) {
        let queue = match script {
            Scripted::Sequence(steps) => steps.into_iter().collect(),
            single => VecDeque::from([single]),
        };
        self.methods.lock().insert(method.into(), queue);
    }

    /// Stop exposing a method
    pub fn remove(&self, method: &str) {
        self.methods.lock().remove(method);
    }

    pub fn set_property(&self, name: impl Into<String>, value: SdkValue) {
        self.properties.lock().insert(name.into(), value);
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().clone()
    }

    /// How many times a method was invoked
    pub fn count(&self, method: &str) -> usize {
        self.invocations.lock().iter().filter(|i| i.method == method).count()
    }

    /// Fire an event to every listener registered for `event`
    pub fn emit(&self, event: &str, payload: SdkValue) -> bool {
        let sinks = self.listeners.lock().get(event).cloned().unwrap_or_default();
        sinks
            .iter()
            .fold(false, |delivered, sink| sink.emit(event, payload.clone()) || delivered)
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.lock().get(event).map(Vec::len).unwrap_or(0)
    }

    fn next_outcome(&self, method: &str) -> Option<Outcome> {
        let mut methods = self.methods.lock();
        let queue = methods.get_mut(method)?;
        let step = if queue.len() > 1 { queue.pop_front() } else { queue.front().cloned() }?;
        Some(Outcome::from_step(step))
    }
}

#[async_trait]
impl SdkObject for ScriptedSdk {
    fn has_method(&self, name: &str) -> bool {
        self.methods.lock().contains_key(name)
    }

    async fn invoke(&self, name: &str, args: Vec<SdkValue>) -> Result<SdkValue, SdkFault> {
        self.invocations.lock().push(Invocation {
            method: name.to_string(),
            args,
        });

        let mut outcome = self.next_outcome(name);
        loop {
            return match outcome {
                Some(Outcome::After(delay, inner)) => {
                    tokio::time::sleep(delay).await;
                    outcome = Some(*inner);
                    continue;
                }
                Some(Outcome::Value(value)) => Ok(value),
                Some(Outcome::Fault(message)) => Err(SdkFault::new(name, message)),
                Some(Outcome::Hang) => std::future::pending().await,
                None => Err(SdkFault::new(name, format!("{}.{} is not a function", self.name, name))),
            };
        }
    }

    fn property(&self, name: &str) -> Option<SdkValue> {
        self.properties.lock().get(name).cloned()
    }

    fn subscribe(&self, event: &str, sink: RawEventSink) -> bool {
        self.listeners.lock().entry(event.to_string()).or_default().push(sink);
        true
    }
}

/// Host handler that records every callback
#[derive(Debug, Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<SoftphoneEvent>>,
    notify: Notify,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<SoftphoneEvent> {
        self.events.lock().clone()
    }

    pub fn incoming_count(&self) -> usize {
        self.count(|e| matches!(e, SoftphoneEvent::Incoming { .. }))
    }

    pub fn active_count(&self) -> usize {
        self.count(|e| matches!(e, SoftphoneEvent::Active { .. }))
    }

    pub fn ended_count(&self) -> usize {
        self.count(|e| matches!(e, SoftphoneEvent::Ended { .. }))
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SoftphoneEvent::Notice(notice) => Some(notice.clone()),
                _ => None,
            })
            .collect()
    }

    fn count(&self, pred: impl Fn(&SoftphoneEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }

    /// Wait until `pred` holds for the recorded events or `timeout` elapses
    pub async fn wait_for(&self, pred: impl Fn(&[SoftphoneEvent]) -> bool, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // Snapshot first so `pred` may call back into the handler
            if pred(self.events().as_slice()) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return pred(self.events().as_slice());
            }
        }
    }

    fn record(&self, event: SoftphoneEvent) {
        self.events.lock().push(event);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl CallEventHandler for RecordingHandler {
    async fn on_incoming(&self, call_id: CallId, peer: PeerInfo) {
        self.record(SoftphoneEvent::Incoming { call_id, peer });
    }

    async fn on_active(&self, call_id: CallId, peer: PeerInfo, direction: CallDirection) {
        self.record(SoftphoneEvent::Active {
            call_id,
            peer,
            direction,
        });
    }

    async fn on_ended(&self, call_id: CallId, reason: EndReason) {
        self.record(SoftphoneEvent::Ended { call_id, reason });
    }

    async fn on_notice(&self, notice: Notice) {
        self.record(SoftphoneEvent::Notice(notice));
    }
}
