//! Server-pushed call notifications
//!
//! The server forwards three canonical events. It can also relay the PBX
//! webhook bodies it receives, and the realtime topics it publishes for
//! screen pops; both are parsed here into the same [`PushEvent`] set.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{SoftphoneError, SoftphoneResult};
use crate::identity::CallIdentity;
use crate::intent::{CanonicalIntent, IntentKind, IntentOrigin};

/// Yeastar call status update
pub const YEASTAR_CALL_STATUS: u64 = 30011;
/// Yeastar call detail record, sent once a call is over
pub const YEASTAR_CDR: u64 = 30012;

/// A call notification from the push channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum PushEvent {
    IncomingCall {
        #[serde(rename = "serverCallId", default)]
        server_call_id: Option<String>,
        #[serde(rename = "callerNumber", default)]
        caller_number: Option<String>,
        #[serde(rename = "callerName", default)]
        caller_name: Option<String>,
    },
    CallAnswered {
        #[serde(rename = "serverCallId", default)]
        server_call_id: Option<String>,
    },
    CallEnded {
        #[serde(rename = "serverCallId", default)]
        server_call_id: Option<String>,
    },
}

impl PushEvent {
    /// Parse one canonical push message
    pub fn from_json_str(json: &str) -> SoftphoneResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn server_call_id(&self) -> Option<&str> {
        match self {
            PushEvent::IncomingCall { server_call_id, .. }
            | PushEvent::CallAnswered { server_call_id }
            | PushEvent::CallEnded { server_call_id } => server_call_id.as_deref(),
        }
    }

    pub fn kind(&self) -> IntentKind {
        match self {
            PushEvent::IncomingCall { .. } => IntentKind::Incoming,
            PushEvent::CallAnswered { .. } => IntentKind::Connected,
            PushEvent::CallEnded { .. } => IntentKind::Ended,
        }
    }

    pub fn into_intent(self) -> CanonicalIntent {
        let kind = self.kind();
        let (server_call_id, name, number) = match self {
            PushEvent::IncomingCall {
                server_call_id,
                caller_number,
                caller_name,
            } => (server_call_id, caller_name, caller_number),
            PushEvent::CallAnswered { server_call_id } | PushEvent::CallEnded { server_call_id } => {
                (server_call_id, None, None)
            }
        };

        CanonicalIntent::new(kind, IntentOrigin::Push)
            .with_identity(CallIdentity {
                server_call_id,
                ..Default::default()
            })
            .with_peer(name, number)
            .with_source_event(kind.to_string())
    }
}

/// Text of the first present key; numbers are rendered as text
fn field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match value.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn incoming(server_call_id: Option<String>, caller_number: Option<String>, caller_name: Option<String>) -> PushEvent {
    PushEvent::IncomingCall {
        server_call_id,
        caller_number,
        caller_name,
    }
}

/// Parse a webhook body as relayed by the server
///
/// Accepts the canonical events, the Yeastar `{type, msg}` envelope and the
/// legacy named events. `extension`, when given, limits Yeastar member
/// updates to that extension. Unknown shapes yield no events.
pub fn parse_webhook(body: &str, extension: Option<&str>) -> SoftphoneResult<Vec<PushEvent>> {
    let value: Value = serde_json::from_str(body)?;
    if !value.is_object() {
        return Err(SoftphoneError::invalid_payload("webhook body is not an object"));
    }

    if let (Some(kind), Some(msg)) = (value.get("type"), value.get("msg")) {
        let kind = kind
            .as_u64()
            .or_else(|| kind.as_str().and_then(|s| s.trim().parse().ok()));
        let msg = match msg {
            Value::String(text) => serde_json::from_str(text)?,
            other => other.clone(),
        };
        return Ok(parse_yeastar(kind, &msg, extension));
    }

    let name = field(&value, &["event", "action"]).unwrap_or_default();
    if matches!(name.as_str(), "incoming-call" | "call-answered" | "call-ended") {
        return Ok(vec![serde_json::from_value(value)?]);
    }

    Ok(parse_legacy(&name, &value).into_iter().collect())
}

fn parse_yeastar(kind: Option<u64>, msg: &Value, extension: Option<&str>) -> Vec<PushEvent> {
    let call_id = field(msg, &["call_id", "callid"]);

    match kind {
        Some(YEASTAR_CDR) => vec![PushEvent::CallEnded { server_call_id: call_id }],
        Some(YEASTAR_CALL_STATUS) => {
            let members = msg.get("members").and_then(Value::as_array).cloned().unwrap_or_default();
            let mut events = Vec::new();

            for member in &members {
                let Some(ext) = member.get("extension") else { continue };
                if let Some(wanted) = extension {
                    if field(ext, &["number"]).as_deref() != Some(wanted) {
                        continue;
                    }
                }

                let event = match field(ext, &["member_status"]).as_deref() {
                    Some("RING") | Some("RINGING") => {
                        let caller = member
                            .get("inbound")
                            .and_then(|inbound| field(inbound, &["from"]))
                            .or_else(|| field(msg, &["call_from"]));
                        incoming(call_id.clone(), caller, None)
                    }
                    Some("ANSWERED") | Some("ANSWER") => PushEvent::CallAnswered {
                        server_call_id: call_id.clone(),
                    },
                    Some("BYE") => PushEvent::CallEnded {
                        server_call_id: call_id.clone(),
                    },
                    other => {
                        debug!(status = ?other, "Ignoring Yeastar member status");
                        continue;
                    }
                };
                if !events.contains(&event) {
                    events.push(event);
                }
            }
            events
        }
        other => {
            debug!(kind = ?other, "Ignoring Yeastar event type");
            Vec::new()
        }
    }
}

fn parse_legacy(name: &str, value: &Value) -> Option<PushEvent> {
    let data = value.get("data").filter(|d| d.is_object()).unwrap_or(value);
    let call_id = field(data, &["callid", "call_id", "linkedid"]);
    let caller = || field(data, &["caller", "src", "from"]);
    let caller_name = || field(data, &["callername", "caller_name", "srcname"]);

    let event = match name {
        "Ringing" => incoming(call_id, caller(), caller_name()),
        "answer" => PushEvent::CallAnswered { server_call_id: call_id },
        "hangup" | "HANGUP" | "NewCdr" => PushEvent::CallEnded { server_call_id: call_id },
        "CallStatus" => {
            let status = field(data, &["status", "state"]).unwrap_or_default();
            match status.to_ascii_lowercase().as_str() {
                "ringing" => incoming(call_id, caller(), caller_name()),
                "answered" | "answer" => PushEvent::CallAnswered { server_call_id: call_id },
                "hangup" | "bye" | "ended" => PushEvent::CallEnded { server_call_id: call_id },
                _ => {
                    debug!(status = %status, "Ignoring legacy call status");
                    return None;
                }
            }
        }
        _ => {
            debug!(event = %name, "Ignoring unknown PBX webhook event");
            return None;
        }
    };
    Some(event)
}

/// Parse a realtime message published by the server for screen pops
pub fn parse_realtime(topic: &str, message: &Value) -> Option<PushEvent> {
    match topic {
        "pbx_incoming_call" => Some(incoming(
            field(message, &["call_id", "id"]),
            field(message, &["phone", "from"]),
            field(message, &["caller_name", "name"]),
        )),
        "show_call_popup" => Some(incoming(
            field(message, &["id", "call_id"]),
            field(message, &["from", "phone"]),
            field(message, &["caller_name", "name"]),
        )),
        _ => {
            let id = topic.strip_prefix("call_")?.strip_suffix("_ended")?;
            let server_call_id = Some(id.to_string())
                .filter(|id| !id.is_empty())
                .or_else(|| field(message, &["id", "call_id"]));
            Some(PushEvent::CallEnded { server_call_id })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_events_parse() {
        let event = PushEvent::from_json_str(
            r#"{"event":"incoming-call","serverCallId":"s1","callerNumber":"+15550100","callerName":"Ada"}"#,
        )
        .unwrap();
        assert_eq!(event.server_call_id(), Some("s1"));

        let intent = event.into_intent();
        assert_eq!(intent.kind, IntentKind::Incoming);
        assert_eq!(intent.origin, IntentOrigin::Push);
        assert_eq!(intent.peer().display_name, "Ada");

        let ended = PushEvent::from_json_str(r#"{"event":"call-ended","serverCallId":"s1"}"#).unwrap();
        assert_eq!(ended.kind(), IntentKind::Ended);
    }

    #[test]
    fn test_yeastar_status_filters_by_extension() {
        let msg = json!({
            "call_id": "1700000000.42",
            "members": [
                { "inbound": { "from": "0123456789" }, "extension": { "number": "1001", "member_status": "RING" } },
                { "extension": { "number": "1002", "member_status": "RING" } }
            ]
        });
        let body = json!({ "type": 30011, "sn": "X", "msg": msg.to_string() }).to_string();

        let events = parse_webhook(&body, Some("1001")).unwrap();
        assert_eq!(
            events,
            vec![PushEvent::IncomingCall {
                server_call_id: Some("1700000000.42".into()),
                caller_number: Some("0123456789".into()),
                caller_name: None,
            }]
        );
    }

    #[test]
    fn test_yeastar_cdr_ends_call() {
        let body = json!({ "type": "30012", "msg": "{\"call_id\":\"c9\",\"status\":\"ANSWERED\"}" }).to_string();
        assert_eq!(
            parse_webhook(&body, None).unwrap(),
            vec![PushEvent::CallEnded { server_call_id: Some("c9".into()) }]
        );
    }

    #[test]
    fn test_legacy_events_use_fallback_fields() {
        let body = json!({ "event": "Ringing", "data": { "linkedid": 77, "src": "555", "srcname": "Bob" } }).to_string();
        assert_eq!(
            parse_webhook(&body, None).unwrap(),
            vec![PushEvent::IncomingCall {
                server_call_id: Some("77".into()),
                caller_number: Some("555".into()),
                caller_name: Some("Bob".into()),
            }]
        );

        let status = json!({ "action": "CallStatus", "callid": "c1", "state": "Answered" }).to_string();
        assert_eq!(
            parse_webhook(&status, None).unwrap(),
            vec![PushEvent::CallAnswered { server_call_id: Some("c1".into()) }]
        );

        assert!(parse_webhook(r#"{"event":"ExtensionStatus"}"#, None).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_bodies_are_rejected() {
        assert!(matches!(
            parse_webhook("{nope", None),
            Err(SoftphoneError::InvalidPayload { .. })
        ));
        assert!(parse_webhook(r#"{"type":30011,"msg":"{broken"}"#, None).is_err());
        assert!(parse_webhook("[1,2]", None).is_err());
    }

    #[test]
    fn test_realtime_topics() {
        let popup = parse_realtime("show_call_popup", &json!({ "id": "c1", "from": "+4930123" })).unwrap();
        assert_eq!(popup.server_call_id(), Some("c1"));

        let ended = parse_realtime("call_c1_ended", &json!({ "status": "Completed" })).unwrap();
        assert_eq!(ended, PushEvent::CallEnded { server_call_id: Some("c1".into()) });

        assert!(parse_realtime("pbx_debug", &json!({})).is_none());
    }
}
