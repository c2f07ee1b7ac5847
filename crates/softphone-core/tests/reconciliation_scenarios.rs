//! End-to-end reconciliation scenarios
//!
//! Each test drives the engine through the push channel, SDK events and user
//! operations against a scripted SDK. Time is paused so grace periods and
//! pollers run deterministically.

use std::sync::Arc;
use std::time::Duration;

use pbx_softphone_core::testing::{RecordingHandler, Scripted, ScriptedSdk};
use pbx_softphone_core::{
    CallEngine, CallState, CanonicalIntent, EndReason, IntentKind, IntentOrigin, NoticeKind, PushEvent,
    RetryConfig, SdkValue, SoftphoneBuilder, SoftphoneConfig, SoftphoneError, SoftphoneEvent,
};
use serde_json::json;

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("pbx_softphone_core=debug")
        .with_test_writer()
        .try_init();
}

fn test_config() -> SoftphoneConfig {
    SoftphoneConfig::default()
        .with_poller(3, Duration::from_millis(100))
        .with_ended_grace(Duration::from_secs(1))
        .with_liveness_interval(None)
        .with_answer_retry(RetryConfig::none())
}

async fn start(sdk: &Arc<ScriptedSdk>, config: SoftphoneConfig) -> (Arc<CallEngine>, Arc<RecordingHandler>) {
    init_tracing();
    let handler = RecordingHandler::new();
    let engine = SoftphoneBuilder::new()
        .config(config)
        .sdk(sdk.handle())
        .handler(handler.clone())
        .build()
        .await
        .expect("engine should build");
    (engine, handler)
}

fn incoming_push(server_call_id: &str) -> PushEvent {
    PushEvent::IncomingCall {
        server_call_id: Some(server_call_id.to_string()),
        caller_number: Some("+15550100".to_string()),
        caller_name: Some("Ada Lovelace".to_string()),
    }
}

/// Let spawned tasks run without crossing any engine timer
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn scenario_a_push_incoming_rings_once() {
    let sdk = ScriptedSdk::new("phone");
    let (engine, handler) = start(&sdk, test_config()).await;

    assert_eq!(engine.deliver_push(incoming_push("s1")).unwrap(), CallState::Incoming);
    assert_eq!(engine.state(), CallState::Incoming);

    assert!(handler.wait_for(|events| !events.is_empty(), WAIT).await);
    match &handler.events()[0] {
        SoftphoneEvent::Incoming { peer, .. } => {
            assert_eq!(peer.display_name, "Ada Lovelace");
            assert_eq!(peer.number, "+15550100");
        }
        other => panic!("expected incoming, got {:?}", other),
    }

    let status = engine.status();
    assert!(status.capabilities.can_answer);
    assert!(status.capabilities.can_hangup);
    assert!(!status.capabilities.can_mute);
    assert_eq!(status.session.unwrap().server_call_id(), Some("s1"));
}

#[tokio::test(start_paused = true)]
async fn scenario_b_answer_by_resolved_id() {
    let sdk = ScriptedSdk::new("phone");
    sdk.on(
        "getActiveCalls",
        Scripted::Return(SdkValue::from(json!([{ "callId": "a1", "status": "ringing" }]))),
    );
    sdk.on("answer", Scripted::Return(SdkValue::Null));
    let (engine, handler) = start(&sdk, test_config()).await;

    engine.deliver_push(incoming_push("s1")).unwrap();

    // First poller tick pairs the push call with the SDK call
    tokio::time::sleep(Duration::from_millis(150)).await;
    let session = engine.session().unwrap();
    assert_eq!(session.sdk_call_id(), Some("a1"));
    assert_eq!(session.state, CallState::Incoming);

    engine.request_answer().await.unwrap();
    assert_eq!(engine.state(), CallState::Active);

    let answers: Vec<_> = sdk.invocations().into_iter().filter(|i| i.method == "answer").collect();
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].args.len(), 1);
    assert_eq!(answers[0].args[0].text().as_deref(), Some("a1"));

    assert!(handler.wait_for(|events| events.len() >= 2, WAIT).await);
    settle().await;
    assert_eq!(handler.incoming_count(), 1);
    assert_eq!(handler.active_count(), 1);

    let status = engine.status();
    assert!(status.capabilities.can_mute && status.capabilities.can_hold);
    assert!(status.session.unwrap().started_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn scenario_c_sdk_ended_then_grace_to_idle() {
    let sdk = ScriptedSdk::new("phone");
    let (engine, handler) = start(&sdk, test_config()).await;

    engine.deliver_push(incoming_push("s1")).unwrap();
    assert!(sdk.emit("confirmed", SdkValue::from(json!({ "callId": "a1" }))));
    assert!(handler.wait_for(|_| handler.active_count() == 1, WAIT).await);
    assert_eq!(engine.state(), CallState::Active);

    assert!(sdk.emit("ended", SdkValue::from(json!({ "callId": "a1", "cause": "BYE" }))));
    assert!(handler.wait_for(|_| handler.ended_count() == 1, WAIT).await);
    assert_eq!(engine.state(), CallState::Ended);
    assert!(matches!(
        handler.events().last(),
        Some(SoftphoneEvent::Ended { reason: EndReason::Remote, .. })
    ));

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(engine.state(), CallState::Idle);
    assert!(engine.session().is_none());
}

#[tokio::test(start_paused = true)]
async fn scenario_d_hangup_forced_when_every_candidate_throws() {
    let sdk = ScriptedSdk::new("phone");
    for method in ["hangup", "hangupCall", "endCall", "end", "reject", "decline", "cancel"] {
        sdk.on(method, Scripted::Fail("InvalidStateError".into()));
    }
    let (engine, handler) = start(&sdk, test_config()).await;

    engine.deliver_push(incoming_push("s1")).unwrap();
    engine
        .note_peer_event(
            CanonicalIntent::new(IntentKind::Connected, IntentOrigin::Sdk)
                .with_identity(pbx_softphone_core::CallIdentity::default().with_sdk_call_id("a1")),
        )
        .unwrap();

    let outcome = engine.request_hangup().await.unwrap();
    assert!(!outcome.is_confirmed());
    assert_eq!(engine.state(), CallState::Ended);

    assert!(handler.wait_for(|_| !handler.notices().is_empty(), WAIT).await);
    let notice = &handler.notices()[0];
    assert_eq!(notice.kind, NoticeKind::CapabilityUnavailable);
    assert!(notice.message.contains("remote side may still be ringing"));
    assert!(sdk.count("hangup") >= 2);
}

#[tokio::test(start_paused = true)]
async fn scenario_e_second_incoming_is_dropped() {
    let sdk = ScriptedSdk::new("phone");
    let (engine, handler) = start(&sdk, test_config()).await;

    engine.deliver_push(incoming_push("s1")).unwrap();
    assert_eq!(engine.deliver_push(incoming_push("s2")).unwrap(), CallState::Incoming);

    assert!(handler.wait_for(|events| !events.is_empty(), WAIT).await);
    settle().await;
    assert_eq!(handler.incoming_count(), 1);
    assert_eq!(engine.session().unwrap().server_call_id(), Some("s1"));
}

#[tokio::test(start_paused = true)]
async fn push_ended_is_advisory_while_sdk_tracks_the_call() {
    let sdk = ScriptedSdk::new("phone");
    let (engine, handler) = start(&sdk, test_config()).await;

    assert!(sdk.emit(
        "newRTCSession",
        SdkValue::from(json!({ "originator": "remote", "session": { "id": "a1" } }))
    ));
    assert!(handler.wait_for(|_| handler.incoming_count() == 1, WAIT).await);

    let state = engine
        .deliver_push(PushEvent::CallEnded {
            server_call_id: Some("s1".into()),
        })
        .unwrap();
    assert_eq!(state, CallState::Incoming);
    assert_eq!(engine.state(), CallState::Incoming);
}

#[tokio::test(start_paused = true)]
async fn connected_without_identity_waits_for_poller() {
    let sdk = ScriptedSdk::new("phone");
    let (engine, handler) = start(&sdk, test_config()).await;

    engine
        .deliver_push(PushEvent::IncomingCall {
            server_call_id: None,
            caller_number: None,
            caller_name: None,
        })
        .unwrap();
    let state = engine
        .note_peer_event(CanonicalIntent::new(IntentKind::Connected, IntentOrigin::Sdk))
        .unwrap();
    assert_eq!(state, CallState::Incoming);
    assert!(engine.session().unwrap().is_connect_pending());

    sdk.on("getCalls", Scripted::Return(SdkValue::from(json!({ "a9": { "status": "talking" } }))));
    assert!(handler.wait_for(|_| handler.active_count() == 1, WAIT).await);

    let session = engine.session().unwrap();
    assert_eq!(session.state, CallState::Active);
    assert_eq!(session.sdk_call_id(), Some("a9"));
    assert!(!session.is_connect_pending());
}

#[tokio::test(start_paused = true)]
async fn duplicate_ended_equals_single_ended() {
    let sdk = ScriptedSdk::new("phone");
    let (engine, handler) = start(&sdk, test_config()).await;

    engine.deliver_push(incoming_push("s1")).unwrap();
    let ended = PushEvent::CallEnded {
        server_call_id: Some("s1".into()),
    };
    assert_eq!(engine.deliver_push(ended.clone()).unwrap(), CallState::Ended);
    let first = engine.session().unwrap();
    assert_eq!(engine.deliver_push(ended).unwrap(), CallState::Ended);
    let second = engine.session().unwrap();

    assert_eq!(first.ended_at, second.ended_at);
    assert!(handler.wait_for(|_| handler.ended_count() == 1, WAIT).await);
    settle().await;
    assert_eq!(handler.ended_count(), 1);

    // Later intents for the ended call are stale
    let late = engine.note_peer_event(CanonicalIntent::new(IntentKind::Connected, IntentOrigin::Sdk));
    assert!(matches!(late, Err(SoftphoneError::StaleReference { .. })));
}

#[tokio::test(start_paused = true)]
async fn new_call_during_grace_replaces_ended_session() {
    let sdk = ScriptedSdk::new("phone");
    let (engine, handler) = start(&sdk, test_config()).await;

    engine.deliver_push(incoming_push("s1")).unwrap();
    engine
        .deliver_push(PushEvent::CallEnded {
            server_call_id: Some("s1".into()),
        })
        .unwrap();

    // A repeat of the old call is stale
    assert!(engine.deliver_push(incoming_push("s1")).unwrap_err().is_stale());

    assert_eq!(engine.deliver_push(incoming_push("s2")).unwrap(), CallState::Incoming);
    assert_eq!(engine.session().unwrap().server_call_id(), Some("s2"));

    // The old grace timer must not discard the new call
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(engine.state(), CallState::Incoming);
    assert!(handler.wait_for(|_| handler.incoming_count() == 2, WAIT).await);
}

#[tokio::test(start_paused = true)]
async fn liveness_ends_call_missing_from_registry() {
    let sdk = ScriptedSdk::new("phone");
    sdk.on("getActiveCalls", Scripted::Return(SdkValue::from(json!([{ "callId": "a1" }]))));
    let config = test_config().with_liveness_interval(Some(Duration::from_secs(1)));
    let (engine, handler) = start(&sdk, config).await;

    engine.deliver_push(incoming_push("s1")).unwrap();
    engine
        .note_peer_event(
            CanonicalIntent::new(IntentKind::Connected, IntentOrigin::Sdk)
                .with_identity(pbx_softphone_core::CallIdentity::default().with_sdk_call_id("a1")),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(engine.state(), CallState::Active);

    sdk.on("getActiveCalls", Scripted::Return(SdkValue::List(vec![])));
    assert!(handler.wait_for(|_| handler.ended_count() == 1, WAIT).await);
    assert!(handler
        .events()
        .iter()
        .any(|e| matches!(e, SoftphoneEvent::Ended { reason: EndReason::Vanished, .. })));
}

#[tokio::test(start_paused = true)]
async fn second_request_while_answer_in_flight_is_rejected() {
    let sdk = ScriptedSdk::new("phone");
    sdk.on("answer", Scripted::Hang);
    let config = test_config().with_invoke_timeout(Duration::from_secs(2));
    let (engine, handler) = start(&sdk, config).await;

    engine.deliver_push(incoming_push("s1")).unwrap();

    let answering = engine.clone();
    let task = tokio::spawn(async move { answering.request_answer().await });
    settle().await;

    assert!(!engine.status().capabilities.can_hangup);
    match engine.request_hangup().await {
        Err(SoftphoneError::OperationInFlight { operation }) => assert_eq!(operation, "answer"),
        other => panic!("expected in-flight rejection, got {:?}", other),
    }

    let answered = task.await.unwrap();
    assert!(matches!(answered, Err(SoftphoneError::CapabilityUnavailable { .. })));
    assert_eq!(engine.state(), CallState::Incoming);
    assert!(engine.status().capabilities.can_answer);
    assert!(handler
        .wait_for(
            |events| events
                .iter()
                .any(|e| matches!(e, SoftphoneEvent::Notice(n) if n.kind == NoticeKind::CapabilityUnavailable)),
            WAIT
        )
        .await);
}

#[tokio::test(start_paused = true)]
async fn operations_validate_state() {
    let sdk = ScriptedSdk::new("phone");
    let (engine, _handler) = start(&sdk, test_config()).await;

    assert!(matches!(
        engine.request_answer().await,
        Err(SoftphoneError::InvalidCallState {
            current_state: CallState::Idle,
            ..
        })
    ));
    assert!(engine.request_hangup().await.is_err());
    assert!(engine.toggle_mute().await.is_err());

    engine.deliver_push(incoming_push("s1")).unwrap();
    assert!(matches!(
        engine.toggle_hold().await,
        Err(SoftphoneError::InvalidCallState {
            current_state: CallState::Incoming,
            ..
        })
    ));
    assert!(matches!(
        engine.place_call("+15550100").await,
        Err(SoftphoneError::InvalidCallState { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn caller_giving_up_before_answer_ends_through_session_events() {
    let sdk = ScriptedSdk::new("phone");
    let (engine, handler) = start(&sdk, test_config()).await;
    let session = ScriptedSdk::new("session");

    assert!(sdk.emit(
        "newRTCSession",
        SdkValue::map([
            ("originator", SdkValue::from("remote")),
            ("session", SdkValue::from(session.handle())),
        ])
    ));
    assert!(handler.wait_for(|_| handler.incoming_count() == 1, WAIT).await);
    assert!(engine.session().unwrap().identity.has_sdk_reference());
    assert!(session.listener_count("failed") > 0);

    // The push channel cannot end a call the SDK still holds
    let state = engine
        .deliver_push(PushEvent::CallEnded { server_call_id: None })
        .unwrap();
    assert_eq!(state, CallState::Incoming);

    assert!(session.emit("failed", SdkValue::from(json!({ "cause": "Canceled" }))));
    assert!(handler.wait_for(|_| handler.ended_count() == 1, WAIT).await);
    assert_eq!(engine.state(), CallState::Ended);
    assert!(matches!(
        handler.events().last(),
        Some(SoftphoneEvent::Ended { reason: EndReason::Remote, .. })
    ));

    // A late event from the old session leaves the next call alone
    engine.deliver_push(incoming_push("s2")).unwrap();
    assert!(session.emit("ended", SdkValue::Null));
    settle().await;
    assert_eq!(engine.state(), CallState::Incoming);
    assert_eq!(engine.session().unwrap().server_call_id(), Some("s2"));
}

#[tokio::test(start_paused = true)]
async fn abandoned_answer_releases_the_call() {
    let sdk = ScriptedSdk::new("phone");
    sdk.on("answer", Scripted::Hang);
    let config = test_config().with_invoke_timeout(Duration::from_secs(2));
    let (engine, handler) = start(&sdk, config).await;

    engine.deliver_push(incoming_push("s1")).unwrap();

    let answering = engine.clone();
    let task = tokio::spawn(async move { answering.request_answer().await });
    settle().await;
    assert!(!engine.status().capabilities.can_hangup);

    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());
    assert!(engine.status().capabilities.can_hangup);
    assert!(engine.status().capabilities.can_answer);

    // A host-side timeout drops the future the same way
    let timed_out = tokio::time::timeout(Duration::from_millis(50), engine.request_answer()).await;
    assert!(timed_out.is_err());
    assert!(engine.status().capabilities.can_hangup);

    let outcome = engine.request_hangup().await.unwrap();
    assert!(!outcome.is_confirmed());
    assert_eq!(engine.state(), CallState::Ended);
    assert!(handler.wait_for(|_| handler.ended_count() == 1, WAIT).await);
}

#[tokio::test(start_paused = true)]
async fn unnamed_incoming_during_grace_opens_a_new_call() {
    let sdk = ScriptedSdk::new("phone");
    let (engine, handler) = start(&sdk, test_config()).await;

    engine.deliver_push(incoming_push("s1")).unwrap();
    engine
        .deliver_push(PushEvent::CallEnded {
            server_call_id: Some("s1".into()),
        })
        .unwrap();
    assert_eq!(engine.state(), CallState::Ended);

    let state = engine
        .note_peer_event(CanonicalIntent::new(IntentKind::Incoming, IntentOrigin::Sdk).with_peer(None, Some("1002".into())))
        .unwrap();
    assert_eq!(state, CallState::Incoming);
    let session = engine.session().unwrap();
    assert_eq!(session.server_call_id(), None);
    assert_eq!(session.peer.number, "1002");

    // The poller names the new call
    sdk.on(
        "getActiveCalls",
        Scripted::Return(SdkValue::from(json!([{ "callId": "a2", "status": "ringing" }]))),
    );
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(engine.session().unwrap().sdk_call_id(), Some("a2"));
    assert_eq!(engine.state(), CallState::Incoming);
    assert!(handler.wait_for(|_| handler.incoming_count() == 2, WAIT).await);
}
