//! Walks one inbound call through the engine against a scripted SDK
//!
//! Run with `RUST_LOG=pbx_softphone_core=debug` to see every reconciliation step.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pbx_softphone_core::testing::{Scripted, ScriptedSdk};
use pbx_softphone_core::{
    CallDirection, CallEventHandler, CallId, EndReason, Notice, PeerInfo, PushEvent, SdkValue, SoftphoneBuilder,
    SoftphoneConfig,
};
use serde_json::json;
use tracing::info;

struct ConsoleHandler;

#[async_trait]
impl CallEventHandler for ConsoleHandler {
    async fn on_incoming(&self, call_id: CallId, peer: PeerInfo) {
        info!(%call_id, caller = %peer.display_name, number = %peer.number, "Ringing");
    }

    async fn on_active(&self, call_id: CallId, peer: PeerInfo, direction: CallDirection) {
        info!(%call_id, caller = %peer.display_name, ?direction, "Connected");
    }

    async fn on_ended(&self, call_id: CallId, reason: EndReason) {
        info!(%call_id, ?reason, "Call over");
    }

    async fn on_notice(&self, notice: Notice) {
        info!(kind = ?notice.kind, "{}", notice.message);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scripted_call=info,pbx_softphone_core=info".into()),
        )
        .init();

    // An SDK release that only lists calls and answers without arguments
    let sdk = ScriptedSdk::new("phone");
    sdk.on(
        "getActiveCalls",
        Scripted::Return(SdkValue::from(json!([{ "callId": "a1", "status": "ringing" }]))),
    );
    sdk.on("answer", Scripted::Return(SdkValue::Null));
    sdk.on("setMute", Scripted::Return(SdkValue::Null));

    let config = SoftphoneConfig::default()
        .with_extension("1001")
        .with_poller(5, Duration::from_millis(200))
        .with_ended_grace(Duration::from_millis(500));

    let engine = SoftphoneBuilder::new()
        .config(config)
        .sdk(sdk.handle())
        .handler(Arc::new(ConsoleHandler))
        .build()
        .await?;

    engine.deliver_push(PushEvent::IncomingCall {
        server_call_id: Some("1700000000.42".into()),
        caller_number: Some("+15550100".into()),
        caller_name: Some("Front Desk".into()),
    })?;

    tokio::time::sleep(Duration::from_millis(300)).await;
    engine.request_answer().await?;
    info!(capabilities = ?engine.status().capabilities, "After answer");

    let muted = engine.toggle_mute().await?;
    info!(muted, "Mute toggled");

    sdk.emit("ended", SdkValue::from(json!({ "callId": "a1", "cause": "BYE" })));
    tokio::time::sleep(Duration::from_millis(700)).await;
    info!(state = %engine.state(), "Done");

    Ok(())
}
