//! Capability probing against the SDK handle
//!
//! Each [`Verb`] has an ordered table of [`Candidate`] invocations gathered
//! from the SDK releases seen in the field. [`CapabilityProbe::invoke`] walks
//! the table and returns the first candidate that completes without error.
//! Nothing is cached: the handle may expose different members per session.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{SoftphoneError, SoftphoneResult};
use crate::sdk::{SdkRef, SdkValue};

/// Operation a capability is probed for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    AnswerById,
    Answer,
    HangupById,
    Hangup,
    TerminateSession,
    /// `end`/`reject`/`decline`/`cancel`; hanging up a ringing call is a rejection
    Reject,
    Mute { on: bool },
    Hold { on: bool },
    EnumerateCalls,
    Dial,
}

impl Verb {
    pub fn name(&self) -> &'static str {
        match self {
            Verb::AnswerById => "answer-by-id",
            Verb::Answer => "answer",
            Verb::HangupById => "hangup-by-id",
            Verb::Hangup => "hangup",
            Verb::TerminateSession => "terminate-session",
            Verb::Reject => "reject",
            Verb::Mute { on: true } => "mute",
            Verb::Mute { on: false } => "unmute",
            Verb::Hold { on: true } => "hold",
            Verb::Hold { on: false } => "unhold",
            Verb::EnumerateCalls => "enumerate-calls",
            Verb::Dial => "dial",
        }
    }

    /// Ordered candidates for this verb
    pub fn candidates(&self) -> &'static [Candidate] {
        match self {
            Verb::AnswerById => ANSWER_BY_ID,
            Verb::Answer => ANSWER,
            Verb::HangupById => HANGUP_BY_ID,
            Verb::Hangup => HANGUP,
            Verb::TerminateSession => TERMINATE_SESSION,
            Verb::Reject => REJECT,
            Verb::Mute { on: true } => MUTE,
            Verb::Mute { on: false } => UNMUTE,
            Verb::Hold { on: true } => HOLD,
            Verb::Hold { on: false } => UNHOLD,
            Verb::EnumerateCalls => ENUMERATE_CALLS,
            Verb::Dial => DIAL,
        }
    }
}

/// Object a candidate is invoked on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receiver {
    Handle,
    Session,
}

/// How a candidate reaches its member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Call(&'static str),
    Read(&'static str),
}

/// Argument shape a candidate expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Args {
    None,
    CallId,
    CallIdAndFlag,
    Flag,
    Number,
}

/// One way the SDK might expose a verb
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub signature: &'static str,
    pub receiver: Receiver,
    pub access: Access,
    pub args: Args,
}

const fn call(signature: &'static str, receiver: Receiver, method: &'static str, args: Args) -> Candidate {
    Candidate {
        signature,
        receiver,
        access: Access::Call(method),
        args,
    }
}

const fn read(signature: &'static str, property: &'static str) -> Candidate {
    Candidate {
        signature,
        receiver: Receiver::Handle,
        access: Access::Read(property),
        args: Args::None,
    }
}

use Args as A;
use Receiver::{Handle as H, Session as S};

const ANSWER_BY_ID: &[Candidate] = &[
    call("answer(callId)", H, "answer", A::CallId),
    call("answerCall(callId)", H, "answerCall", A::CallId),
    call("acceptCall(callId)", H, "acceptCall", A::CallId),
    call("accept(callId)", H, "accept", A::CallId),
];

const ANSWER: &[Candidate] = &[
    call("answer()", H, "answer", A::None),
    call("accept()", H, "accept", A::None),
    call("session.answer()", S, "answer", A::None),
    call("session.accept()", S, "accept", A::None),
];

const HANGUP_BY_ID: &[Candidate] = &[
    call("hangup(callId)", H, "hangup", A::CallId),
    call("hangupCall(callId)", H, "hangupCall", A::CallId),
    call("endCall(callId)", H, "endCall", A::CallId),
];

const HANGUP: &[Candidate] = &[
    call("hangup()", H, "hangup", A::None),
    call("hangupCall()", H, "hangupCall", A::None),
];

const TERMINATE_SESSION: &[Candidate] = &[
    call("session.terminate()", S, "terminate", A::None),
    call("session.hangup()", S, "hangup", A::None),
    call("session.bye()", S, "bye", A::None),
];

const REJECT: &[Candidate] = &[
    call("end(callId)", H, "end", A::CallId),
    call("reject(callId)", H, "reject", A::CallId),
    call("decline(callId)", H, "decline", A::CallId),
    call("cancel(callId)", H, "cancel", A::CallId),
    call("end()", H, "end", A::None),
    call("reject()", H, "reject", A::None),
    call("decline()", H, "decline", A::None),
    call("cancel()", H, "cancel", A::None),
    call("session.end()", S, "end", A::None),
    call("session.reject()", S, "reject", A::None),
    call("session.decline()", S, "decline", A::None),
    call("session.cancel()", S, "cancel", A::None),
];

const MUTE: &[Candidate] = &[
    call("mute(callId)", H, "mute", A::CallId),
    call("setMute(callId, true)", H, "setMute", A::CallIdAndFlag),
    call("mute()", H, "mute", A::None),
    call("setMute(true)", H, "setMute", A::Flag),
    call("session.mute()", S, "mute", A::None),
];

const UNMUTE: &[Candidate] = &[
    call("unmute(callId)", H, "unmute", A::CallId),
    call("setMute(callId, false)", H, "setMute", A::CallIdAndFlag),
    call("unmute()", H, "unmute", A::None),
    call("setMute(false)", H, "setMute", A::Flag),
    call("session.unmute()", S, "unmute", A::None),
];

const HOLD: &[Candidate] = &[
    call("hold(callId)", H, "hold", A::CallId),
    call("setHold(callId, true)", H, "setHold", A::CallIdAndFlag),
    call("hold()", H, "hold", A::None),
    call("setHold(true)", H, "setHold", A::Flag),
    call("session.hold()", S, "hold", A::None),
];

const UNHOLD: &[Candidate] = &[
    call("unhold(callId)", H, "unhold", A::CallId),
    call("resume(callId)", H, "resume", A::CallId),
    call("setHold(callId, false)", H, "setHold", A::CallIdAndFlag),
    call("unhold()", H, "unhold", A::None),
    call("resume()", H, "resume", A::None),
    call("setHold(false)", H, "setHold", A::Flag),
    call("session.unhold()", S, "unhold", A::None),
];

const ENUMERATE_CALLS: &[Candidate] = &[
    call("getActiveCalls()", H, "getActiveCalls", A::None),
    call("getCalls()", H, "getCalls", A::None),
    call("getCurrentCalls()", H, "getCurrentCalls", A::None),
    call("getRingingCalls()", H, "getRingingCalls", A::None),
    call("listCalls()", H, "listCalls", A::None),
    read("calls", "calls"),
    read("sessions", "sessions"),
    read("activeCalls", "activeCalls"),
    read("currentCall", "currentCall"),
];

const DIAL: &[Candidate] = &[
    call("call(number)", H, "call", A::Number),
    call("dial(number)", H, "dial", A::Number),
    call("makeCall(number)", H, "makeCall", A::Number),
    call("invite(number)", H, "invite", A::Number),
];

/// Values a candidate may need to build its arguments
#[derive(Debug, Clone)]
pub struct ProbeContext {
    pub handle: SdkRef,
    pub session: Option<SdkRef>,
    pub call_id: Option<String>,
    pub flag: bool,
    pub number: Option<String>,
}

impl ProbeContext {
    pub fn new(handle: SdkRef) -> Self {
        Self {
            handle,
            session: None,
            call_id: None,
            flag: false,
            number: None,
        }
    }

    pub fn with_session(mut self, session: Option<SdkRef>) -> Self {
        self.session = session;
        self
    }

    pub fn with_call_id(mut self, call_id: Option<String>) -> Self {
        self.call_id = call_id;
        self
    }

    pub fn with_flag(mut self, flag: bool) -> Self {
        self.flag = flag;
        self
    }

    pub fn with_number(mut self, number: impl Into<String>) -> Self {
        self.number = Some(number.into());
        self
    }

    fn receiver(&self, receiver: Receiver) -> Option<&SdkRef> {
        match receiver {
            Receiver::Handle => Some(&self.handle),
            Receiver::Session => self.session.as_ref(),
        }
    }

    fn build_args(&self, args: Args) -> Option<Vec<SdkValue>> {
        let call_id = || self.call_id.clone().map(SdkValue::String);
        match args {
            Args::None => Some(Vec::new()),
            Args::CallId => Some(vec![call_id()?]),
            Args::CallIdAndFlag => Some(vec![call_id()?, SdkValue::Bool(self.flag)]),
            Args::Flag => Some(vec![SdkValue::Bool(self.flag)]),
            Args::Number => Some(vec![SdkValue::String(self.number.clone()?)]),
        }
    }
}

/// A candidate that worked, with whatever it returned
#[derive(Debug, Clone)]
pub struct Capability {
    pub verb: Verb,
    pub signature: &'static str,
    pub value: SdkValue,
}

/// Why a candidate was passed over
#[derive(Debug, Clone, PartialEq, Eq)]
enum Skip {
    NoReceiver,
    NotExposed,
    MissingArgument,
    Failed(String),
}

/// Tries candidate invocations in order against the SDK
#[derive(Debug, Clone)]
pub struct CapabilityProbe {
    invoke_timeout: Duration,
}

impl CapabilityProbe {
    pub fn new(invoke_timeout: Duration) -> Self {
        Self { invoke_timeout }
    }

    /// Invoke the first working candidate for a single verb
    pub async fn invoke(&self, verb: Verb, ctx: &ProbeContext) -> SoftphoneResult<Capability> {
        self.invoke_chain(&[verb], ctx).await
    }

    /// Walk several verbs in order, e.g. answer-by-id then parameterless answer
    pub async fn invoke_chain(&self, verbs: &[Verb], ctx: &ProbeContext) -> SoftphoneResult<Capability> {
        let mut attempted = Vec::new();

        for verb in verbs {
            for candidate in verb.candidates() {
                match self.try_candidate(candidate, ctx).await {
                    Ok(value) => {
                        debug!(
                            verb = verb.name(),
                            signature = candidate.signature,
                            failed_before = attempted.len(),
                            "SDK capability succeeded"
                        );
                        return Ok(Capability {
                            verb: *verb,
                            signature: candidate.signature,
                            value,
                        });
                    }
                    Err(Skip::Failed(reason)) => {
                        debug!(
                            verb = verb.name(),
                            signature = candidate.signature,
                            reason = %reason,
                            "SDK candidate failed, falling through"
                        );
                        attempted.push(candidate.signature.to_string());
                    }
                    Err(skip) => {
                        tracing::trace!(signature = candidate.signature, ?skip, "SDK candidate skipped");
                    }
                }
            }
        }

        let operation = verbs
            .first()
            .map(|v| v.name())
            .unwrap_or("unknown");
        warn!(
            operation,
            attempted = attempted.len(),
            "No SDK capability available"
        );
        Err(SoftphoneError::capability_unavailable(operation, attempted))
    }

    async fn try_candidate(&self, candidate: &Candidate, ctx: &ProbeContext) -> Result<SdkValue, Skip> {
        let target = ctx.receiver(candidate.receiver).ok_or(Skip::NoReceiver)?;

        match candidate.access {
            Access::Read(property) => target
                .property(property)
                .filter(|v| !v.is_null())
                .ok_or(Skip::NotExposed),
            Access::Call(method) => {
                if !target.has_method(method) {
                    return Err(Skip::NotExposed);
                }
                let args = ctx.build_args(candidate.args).ok_or(Skip::MissingArgument)?;

                match tokio::time::timeout(self.invoke_timeout, target.invoke(method, args)).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(fault)) => Err(Skip::Failed(fault.to_string())),
                    Err(_) => Err(Skip::Failed(format!(
                        "timed out after {}ms",
                        self.invoke_timeout.as_millis()
                    ))),
                }
            }
        }
    }
}
