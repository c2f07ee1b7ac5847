//! Softphone-core: call-state reconciliation for browser soft-phones on a hosted PBX
//!
//! A soft-phone hears about the same call from three places that disagree:
//! the vendor real-time SDK (whose event names and method signatures drift
//! between releases), the server push channel (which knows the PBX call id
//! but not the SDK's), and the SDK's own call registry. This crate merges
//! them into one truthful answer to "is there a call, and what can I do with
//! it right now".
//!
//! ```text
//! SDK events ──► normalizer ──┐
//! push/webhook ──► push ──────┼──► engine ──► host UI (CallEventHandler, broadcast)
//! registry ◄── poller/identity┘      │
//!                                    └──► probe ──► SDK verbs
//! ```
//!
//! - [`probe`] tries ordered SDK call signatures until one works
//! - [`identity`] pairs the server call id with the SDK call
//! - [`normalizer`] maps any SDK event onto a canonical intent
//! - [`engine`] owns the single call state and the user operations
//! - [`poller`] retries identity resolution while a call rings
//!
//! # Quick Start
//!
//! The scripted SDK below comes from the `testing` feature.
//!
//! ```rust,no_run
//! use pbx_softphone_core::testing::{RecordingHandler, Scripted, ScriptedSdk};
//! use pbx_softphone_core::{PushEvent, SdkValue, SoftphoneBuilder};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let sdk = ScriptedSdk::new("phone");
//! sdk.on("answer", Scripted::Return(SdkValue::Null));
//!
//! let handler = RecordingHandler::new();
//! let engine = SoftphoneBuilder::new()
//!     .sdk(sdk.handle())
//!     .handler(handler.clone())
//!     .build()
//!     .await?;
//!
//! engine.deliver_push(PushEvent::IncomingCall {
//!     server_call_id: Some("s1".into()),
//!     caller_number: Some("+15550100".into()),
//!     caller_name: Some("Ada".into()),
//! })?;
//! engine.request_answer().await?;
//! println!("{:?}", engine.status().capabilities);
//! # Ok(())
//! # }
//! ```

pub mod call;
pub mod engine;
pub mod error;
pub mod events;
pub mod identity;
pub mod intent;
pub mod normalizer;
pub mod poller;
pub mod probe;
pub mod push;
pub mod sdk;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use call::{CallCapabilities, CallDirection, CallId, CallSession, CallState, CallStatus, PeerInfo};
pub use engine::{
    clean_number, retry_with_backoff, with_timeout, CallEngine, HangupOutcome, RetryConfig, SoftphoneBuilder,
    SoftphoneConfig,
};
pub use error::{SoftphoneError, SoftphoneResult};
pub use events::{CallEventHandler, EndReason, EventPriority, Notice, NoticeKind, SoftphoneEvent};
pub use identity::{CallIdentity, IdentityResolver, Resolution, UnresolvedReason};
pub use intent::{CanonicalIntent, IntentKind, IntentOrigin};
pub use push::PushEvent;
pub use sdk::{SdkObject, SdkRef, SdkValue};

/// Softphone-core version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
