// Mute and hold toggles
//
// Both are optimistic: the local flag flips before the SDK is asked and
// stays flipped if the SDK refuses. The SDK is never queried for the real
// media state.

use tracing::{debug, warn};

use super::CallEngine;
use crate::call::{CallSession, CallState};
use crate::error::{SoftphoneError, SoftphoneResult};
use crate::events::NoticeKind;
use crate::probe::{ProbeContext, Verb};

#[derive(Debug, Clone, Copy)]
enum Control {
    Mute,
    Hold,
}

impl Control {
    fn name(self) -> &'static str {
        match self {
            Control::Mute => "mute",
            Control::Hold => "hold",
        }
    }

    fn flag(self, session: &mut CallSession) -> &mut bool {
        match self {
            Control::Mute => &mut session.muted,
            Control::Hold => &mut session.on_hold,
        }
    }

    fn verb(self, on: bool) -> Verb {
        match self {
            Control::Mute => Verb::Mute { on },
            Control::Hold => Verb::Hold { on },
        }
    }
}

impl CallEngine {
    /// Flip mute on the active call; returns the new intended state
    pub async fn toggle_mute(&self) -> SoftphoneResult<bool> {
        self.toggle(Control::Mute).await
    }

    /// Flip hold on the active call; returns the new intended state
    pub async fn toggle_hold(&self) -> SoftphoneResult<bool> {
        self.toggle(Control::Hold).await
    }

    async fn toggle(&self, control: Control) -> SoftphoneResult<bool> {
        let (call_id, on, identity) = {
            let mut core = self.core.lock();
            let state = core.state();
            let Some(session) = core.session.as_mut().filter(|s| s.state == CallState::Active) else {
                return Err(SoftphoneError::invalid_state(control.name(), state));
            };
            let flag = control.flag(session);
            *flag = !*flag;
            let on = *flag;
            (session.call_id, on, session.identity.clone())
        };

        let verb = control.verb(on);
        let ctx = ProbeContext::new(self.sdk().clone())
            .with_session(identity.sdk_session)
            .with_call_id(identity.sdk_call_id)
            .with_flag(on);

        match self.probe().invoke(verb, &ctx).await {
            Ok(capability) => {
                debug!(%call_id, verb = verb.name(), signature = capability.signature, "Control applied");
            }
            Err(e) => {
                warn!(%call_id, verb = verb.name(), error = %e, "Control failed, keeping local flag");
                self.notice(
                    NoticeKind::ControlFailed,
                    format!("Could not {} the call: {}", verb.name(), e),
                    Some(call_id),
                );
            }
        }
        Ok(on)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{CallDirection, PeerInfo};
    use crate::identity::CallIdentity;

    #[test]
    fn test_flag_points_at_the_session_field() {
        let mut session = CallSession::new(
            1,
            CallState::Active,
            CallDirection::Inbound,
            CallIdentity::default(),
            PeerInfo::unknown(),
        );

        let muted = Control::Mute.flag(&mut session);
        *muted = !*muted;
        assert!(session.muted);
        assert!(!session.on_hold);

        *Control::Hold.flag(&mut session) = true;
        assert!(session.on_hold);
        assert_eq!(Control::Hold.verb(false), Verb::Hold { on: false });
    }
}
