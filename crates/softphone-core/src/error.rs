//! Error types and handling for the softphone core
//!
//! Every engine operation resolves to a [`SoftphoneResult`]; nothing is thrown
//! past the engine boundary.
//!
//! # Error Categories
//!
//! - **Capability errors** - no SDK verb candidate worked. Surfaced to the user,
//!   the operation is aborted (hangup is the exception, it still ends locally).
//! - **Identity errors** - the call could not yet be matched to an SDK session.
//!   Transient; they drive the recovery poller.
//! - **Stale references** - an intent or timer refers to a call that is gone.
//!   Dropped and logged, never surfaced.
//! - **Transport errors** - the SDK lost its link to the PBX. The call is forced
//!   to `Ended` and the next call attempt shows a reconnect notice. If that
//!   attempt fails too, it returns `SdkTransportError` instead of a capability
//!   error.
//! - **State errors** - the operation is not valid in the current call state.
//!
//! # Error Handling Guide
//!
//! ```rust,no_run
//! # use pbx_softphone_core::{CallEngine, SoftphoneError};
//! # use std::sync::Arc;
//! # async fn example(engine: Arc<CallEngine>) {
//! match engine.request_answer().await {
//!     Ok(()) => println!("answered"),
//!     Err(SoftphoneError::CapabilityUnavailable { operation, attempted }) => {
//!         eprintln!("{} failed after trying {:?}", operation, attempted);
//!     }
//!     Err(e) if e.is_recoverable() => eprintln!("try again: {}", e),
//!     Err(e) => eprintln!("answer rejected: {}", e),
//! }
//! # }
//! ```

use thiserror::Error;

use crate::call::CallState;

/// Result type alias for softphone operations
pub type SoftphoneResult<T> = Result<T, SoftphoneError>;

/// Error types for soft-phone call reconciliation
#[derive(Error, Debug, Clone)]
pub enum SoftphoneError {
    /// No candidate invocation for the operation succeeded
    #[error("No SDK capability available for {operation} (tried {})", attempted.join(", "))]
    CapabilityUnavailable {
        operation: String,
        attempted: Vec<String>,
    },

    #[error("Call identity unresolved: {reason}")]
    IdentityUnresolved { reason: String },

    #[error("Stale call reference: {reason}")]
    StaleReference { reason: String },

    #[error("SDK transport error: {reason}")]
    SdkTransportError { reason: String },

    #[error("Cannot {operation} while call is {current_state}")]
    InvalidCallState {
        operation: String,
        current_state: CallState,
    },

    #[error("Another {operation} request is already in flight")]
    OperationInFlight { operation: String },

    #[error("Invalid phone number: {input:?}")]
    InvalidPhoneNumber { input: String },

    #[error("Invalid push payload: {reason}")]
    InvalidPayload { reason: String },

    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfiguration { field: String, reason: String },

    #[error("Missing required configuration: {field}")]
    MissingConfiguration { field: String },

    #[error("PBX integration is not enabled")]
    Disabled,

    #[error("Operation timeout after {duration_ms}ms")]
    OperationTimeout { duration_ms: u64 },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl SoftphoneError {
    /// Create a capability unavailable error
    pub fn capability_unavailable(operation: impl Into<String>, attempted: Vec<String>) -> Self {
        Self::CapabilityUnavailable {
            operation: operation.into(),
            attempted,
        }
    }

    /// Create an identity unresolved error
    pub fn identity_unresolved(reason: impl Into<String>) -> Self {
        Self::IdentityUnresolved { reason: reason.into() }
    }

    /// Create a stale reference error
    pub fn stale(reason: impl Into<String>) -> Self {
        Self::StaleReference { reason: reason.into() }
    }

    /// Create an invalid call state error
    pub fn invalid_state(operation: impl Into<String>, current_state: CallState) -> Self {
        Self::InvalidCallState {
            operation: operation.into(),
            current_state,
        }
    }

    /// Create an invalid payload error
    pub fn invalid_payload(reason: impl Into<String>) -> Self {
        Self::InvalidPayload { reason: reason.into() }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Check if retrying the same operation can succeed without user action
    pub fn is_recoverable(&self) -> bool {
        match self {
            SoftphoneError::IdentityUnresolved { .. }
            | SoftphoneError::SdkTransportError { .. }
            | SoftphoneError::OperationTimeout { .. } => true,

            SoftphoneError::InvalidConfiguration { .. }
            | SoftphoneError::MissingConfiguration { .. }
            | SoftphoneError::Disabled
            | SoftphoneError::InvalidPhoneNumber { .. }
            | SoftphoneError::InvalidPayload { .. } => false,

            _ => false,
        }
    }

    /// Check if the error refers to a call that no longer exists
    pub fn is_stale(&self) -> bool {
        matches!(self, SoftphoneError::StaleReference { .. })
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            SoftphoneError::CapabilityUnavailable { .. } => "capability",
            SoftphoneError::IdentityUnresolved { .. } => "identity",
            SoftphoneError::StaleReference { .. } => "stale",
            SoftphoneError::SdkTransportError { .. } => "transport",

            SoftphoneError::InvalidCallState { .. } | SoftphoneError::OperationInFlight { .. } => {
                "state"
            }

            SoftphoneError::InvalidPhoneNumber { .. } | SoftphoneError::InvalidPayload { .. } => {
                "input"
            }

            SoftphoneError::InvalidConfiguration { .. }
            | SoftphoneError::MissingConfiguration { .. }
            | SoftphoneError::Disabled => "configuration",

            SoftphoneError::OperationTimeout { .. } | SoftphoneError::InternalError { .. } => {
                "system"
            }
        }
    }
}

impl From<serde_json::Error> for SoftphoneError {
    fn from(err: serde_json::Error) -> Self {
        SoftphoneError::InvalidPayload {
            reason: err.to_string(),
        }
    }
}
