//! User call operations: answer, hang up, dial

use tracing::{debug, info, warn};

use super::recovery::{retry_with_backoff, with_timeout};
use super::CallEngine;
use crate::call::{CallId, CallState, PeerInfo, PendingRequest};
use crate::error::{SoftphoneError, SoftphoneResult};
use crate::events::{EndReason, NoticeKind};
use crate::identity::{CallIdentity, Resolution};
use crate::probe::{ProbeContext, Verb};

const ANSWER_CHAIN: &[Verb] = &[Verb::AnswerById, Verb::Answer];

const HANGUP_CHAIN: &[Verb] = &[Verb::HangupById, Verb::Hangup, Verb::TerminateSession, Verb::Reject];

/// Signatures that can only reach one specific call
const TARGETED_HANGUP_CHAIN: &[Verb] = &[Verb::HangupById, Verb::TerminateSession];

/// How a hangup concluded; the call is `Ended` locally either way
#[derive(Debug, Clone)]
pub enum HangupOutcome {
    /// The SDK accepted one of the hangup signatures
    Confirmed { signature: &'static str },
    /// No signature worked in time; the remote side may still be ringing
    ForcedLocal { cause: SoftphoneError },
}

impl HangupOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, HangupOutcome::Confirmed { .. })
    }
}

/// Keep only digits and `+`, as the PBX dial endpoint expects
pub fn clean_number(input: &str) -> SoftphoneResult<String> {
    let cleaned: String = input.chars().filter(|c| c.is_ascii_digit() || *c == '+').collect();
    if !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return Err(SoftphoneError::InvalidPhoneNumber {
            input: input.to_string(),
        });
    }
    Ok(cleaned)
}

/// What an [`InFlightGuard`] releases when its request future goes away
#[derive(Debug, Clone, Copy)]
enum Pending {
    Session { generation: u64, request: PendingRequest },
    Dial,
}

/// Releases a pending request marker even if the request future is dropped
/// before the SDK answers
struct InFlightGuard<'a> {
    engine: &'a CallEngine,
    pending: Pending,
    armed: bool,
}

impl<'a> InFlightGuard<'a> {
    fn new(engine: &'a CallEngine, pending: Pending) -> Self {
        Self {
            engine,
            pending,
            armed: true,
        }
    }

    /// The caller clears the marker itself from here on
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut core = self.engine.core.lock();
        match self.pending {
            Pending::Session { generation, request } => {
                if let Some(session) = core.session_for(generation) {
                    if session.in_flight == Some(request) {
                        debug!(generation, request = request.as_str(), "Request abandoned, releasing the call");
                        session.in_flight = None;
                    }
                }
            }
            Pending::Dial => {
                if core.dial_in_flight {
                    debug!("Dial abandoned");
                    core.dial_in_flight = false;
                }
            }
        }
    }
}

/// Failure of an SDK operation attempted right after the link was lost
fn transport_failure(operation: &str, cause: SoftphoneError) -> SoftphoneError {
    SoftphoneError::SdkTransportError {
        reason: format!("{} failed after the SDK lost its link: {}", operation, cause),
    }
}

impl CallEngine {
    /// Answer the ringing call
    ///
    /// Resolves the SDK call id first if it is missing, then tries the
    /// by-id signatures followed by the parameterless ones. On failure the
    /// call keeps ringing.
    pub async fn request_answer(&self) -> SoftphoneResult<()> {
        let (generation, call_id, known, link_was_lost) = {
            let mut core = self.core.lock();
            let state = core.state();
            let link_was_lost = self.take_link_lost(&mut core);
            let Some(session) = core.session.as_mut().filter(|s| s.state == CallState::Incoming) else {
                return Err(SoftphoneError::invalid_state("answer", state));
            };
            if let Some(pending) = session.in_flight {
                return Err(SoftphoneError::OperationInFlight {
                    operation: pending.as_str().to_string(),
                });
            }
            session.in_flight = Some(PendingRequest::Answer);
            (session.generation, session.call_id, session.identity.clone(), link_was_lost)
        };
        let mut guard = InFlightGuard::new(
            self,
            Pending::Session {
                generation,
                request: PendingRequest::Answer,
            },
        );

        let identity = if known.sdk_call_id.is_none() {
            match retry_with_backoff("resolve-identity", &self.config().answer_retry, |_| {
                self.resolve_for_answer(generation, known.clone())
            })
            .await
            {
                Ok(identity) => identity,
                Err(e) if e.is_stale() => return Err(e),
                Err(e) => {
                    debug!(generation, error = %e, "Answering without an SDK call id");
                    self.current_identity(generation).unwrap_or(known)
                }
            }
        } else {
            known
        };

        let ctx = ProbeContext::new(self.sdk().clone())
            .with_session(identity.sdk_session.clone())
            .with_call_id(identity.sdk_call_id.clone());
        let result = self.probe().invoke_chain(ANSWER_CHAIN, &ctx).await;
        guard.disarm();

        let mut core = self.core.lock();
        let Some(session) = core.session_for(generation) else {
            return Err(SoftphoneError::stale("call was replaced while answering"));
        };
        session.in_flight = None;

        match result {
            Ok(capability) => {
                if session.state != CallState::Incoming {
                    debug!(%call_id, state = %session.state, "Answer completed after the call moved on");
                    return match session.state {
                        CallState::Active => Ok(()),
                        _ => Err(SoftphoneError::stale("call ended while answering")),
                    };
                }
                let returned = CallIdentity::from_sdk_value(&capability.value);
                if !returned.conflicts_with(&session.identity) {
                    session.identity.merge(&returned);
                }
                info!(%call_id, signature = capability.signature, "Call answered");
                self.watch_session(&mut core);
                self.activate(&mut core);
                Ok(())
            }
            Err(e) => {
                warn!(%call_id, error = %e, "Answer failed, call keeps ringing");
                self.notice(NoticeKind::CapabilityUnavailable, format!("Could not answer the call: {}", e), Some(call_id));
                if link_was_lost {
                    return Err(transport_failure("answer", e));
                }
                Err(e)
            }
        }
    }

    async fn resolve_for_answer(&self, generation: u64, fallback: CallIdentity) -> SoftphoneResult<CallIdentity> {
        let known = self
            .current_identity(generation)
            .ok_or_else(|| SoftphoneError::stale("call is gone"))?;
        if known.sdk_call_id.is_some() {
            return Ok(known);
        }

        match self.resolver().resolve(&known, self.sdk()).await {
            Resolution::Resolved(found) => {
                let merged = self.adopt_identity(generation, &found).unwrap_or(fallback);
                if merged.has_sdk_reference() {
                    Ok(merged)
                } else {
                    Err(SoftphoneError::identity_unresolved("no SDK reference for the call"))
                }
            }
            Resolution::Unresolved(reason) => Err(SoftphoneError::identity_unresolved(reason.to_string())),
        }
    }

    fn current_identity(&self, generation: u64) -> Option<CallIdentity> {
        let mut core = self.core.lock();
        core.session_for(generation)
            .filter(|s| s.state.is_live())
            .map(|s| s.identity.clone())
    }

    /// Hang up or reject the current call
    ///
    /// The call always ends locally within the configured hangup deadline.
    /// When no SDK signature confirms it, the outcome says so and a notice
    /// warns that the remote side may still be ringing.
    pub async fn request_hangup(&self) -> SoftphoneResult<HangupOutcome> {
        let (generation, call_id, identity) = {
            let mut core = self.core.lock();
            let state = core.state();
            let Some(session) = core.session.as_mut().filter(|s| s.state.is_live()) else {
                return Err(SoftphoneError::invalid_state("hangup", state));
            };
            if let Some(pending) = session.in_flight {
                return Err(SoftphoneError::OperationInFlight {
                    operation: pending.as_str().to_string(),
                });
            }
            session.in_flight = Some(PendingRequest::Hangup);
            (session.generation, session.call_id, session.identity.clone())
        };
        let mut guard = InFlightGuard::new(
            self,
            Pending::Session {
                generation,
                request: PendingRequest::Hangup,
            },
        );

        let ctx = ProbeContext::new(self.sdk().clone())
            .with_session(identity.sdk_session.clone())
            .with_call_id(identity.sdk_call_id.clone());
        let result = with_timeout(
            "hangup",
            self.config().hangup_timeout(),
            self.probe().invoke_chain(HANGUP_CHAIN, &ctx),
        )
        .await;
        guard.disarm();

        let mut core = self.core.lock();
        if let Some(session) = core.session_for(generation) {
            session.in_flight = None;
            if session.state.is_live() {
                self.end(&mut core, EndReason::LocalHangup);
            }
        }

        match result {
            Ok(capability) => {
                info!(%call_id, signature = capability.signature, "Hangup confirmed by SDK");
                Ok(HangupOutcome::Confirmed {
                    signature: capability.signature,
                })
            }
            Err(cause) => {
                let kind = match cause {
                    SoftphoneError::CapabilityUnavailable { .. } => NoticeKind::CapabilityUnavailable,
                    _ => NoticeKind::HangupUnconfirmed,
                };
                warn!(%call_id, error = %cause, "Hangup not confirmed, ended locally");
                self.notice(
                    kind,
                    format!("Call ended here, but the remote side may still be ringing ({})", cause),
                    Some(call_id),
                );
                Ok(HangupOutcome::ForcedLocal { cause })
            }
        }
    }

    /// Dial a number from idle
    ///
    /// If another call shows up while the SDK is dialing, the new outbound
    /// call is hung up again and the dial returns `StaleReference`.
    pub async fn place_call(&self, number: &str) -> SoftphoneResult<CallId> {
        let number = clean_number(number)?;
        let link_was_lost = {
            let mut core = self.core.lock();
            let state = core.state();
            if state != CallState::Idle {
                return Err(SoftphoneError::invalid_state("dial", state));
            }
            if core.dial_in_flight {
                return Err(SoftphoneError::OperationInFlight {
                    operation: "dial".to_string(),
                });
            }
            core.dial_in_flight = true;
            self.take_link_lost(&mut core)
        };
        let mut guard = InFlightGuard::new(self, Pending::Dial);

        let ctx = ProbeContext::new(self.sdk().clone()).with_number(number.clone());
        let result = self.probe().invoke(Verb::Dial, &ctx).await;
        guard.disarm();

        let orphan = {
            let mut core = self.core.lock();
            core.dial_in_flight = false;

            match result {
                Ok(capability) => {
                    let identity = CallIdentity::from_returned_value(&capability.value);
                    if core.session.is_none() {
                        info!(number = %number, signature = capability.signature, "Outbound call placed");
                        return Ok(self.open_outbound(&mut core, identity, PeerInfo::new(None, Some(number))));
                    }
                    identity
                }
                Err(e) => {
                    self.notice(NoticeKind::CapabilityUnavailable, format!("Could not place the call: {}", e), None);
                    if link_was_lost {
                        return Err(transport_failure("dial", e));
                    }
                    return Err(e);
                }
            }
        };

        warn!(number = %number, sdk_call_id = ?orphan.sdk_call_id, "Another call appeared while dialing, hanging up the dial");
        self.hangup_orphan(&orphan).await;
        Err(SoftphoneError::stale("a call arrived while dialing"))
    }

    /// Hang up an SDK call the engine does not track
    ///
    /// Only signatures that name the call are used, so the tracked call is
    /// never hit by a parameterless hangup.
    async fn hangup_orphan(&self, identity: &CallIdentity) {
        if !identity.has_sdk_reference() {
            warn!("Dialed call has no SDK reference, it cannot be hung up");
            self.notice(
                NoticeKind::HangupUnconfirmed,
                "A call placed while another one arrived may still be ringing",
                None,
            );
            return;
        }

        let ctx = ProbeContext::new(self.sdk().clone())
            .with_session(identity.sdk_session.clone())
            .with_call_id(identity.sdk_call_id.clone());
        match with_timeout(
            "orphan-hangup",
            self.config().hangup_timeout(),
            self.probe().invoke_chain(TARGETED_HANGUP_CHAIN, &ctx),
        )
        .await
        {
            Ok(capability) => debug!(signature = capability.signature, "Dialed call hung up"),
            Err(e) => {
                warn!(error = %e, "Could not hang up the dialed call");
                self.notice(
                    NoticeKind::HangupUnconfirmed,
                    format!("A call placed while another one arrived may still be ringing ({})", e),
                    None,
                );
            }
        }
    }
}
