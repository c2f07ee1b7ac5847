//! Integration tests for error recovery and retry mechanisms
//!
//! Tests retry logic, error categorization and engine construction failures.

use pbx_softphone_core::testing::ScriptedSdk;
use pbx_softphone_core::{
    retry_with_backoff, with_timeout, CallState, RetryConfig, SoftphoneBuilder, SoftphoneConfig, SoftphoneError,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Test basic retry with backoff
#[tokio::test(start_paused = true)]
async fn test_retry_with_backoff_basic() {
    let attempts = Arc::new(AtomicU32::new(0));

    let result = retry_with_backoff("test_operation", &RetryConfig::quick(), |_| {
        let attempts = attempts.clone();
        async move {
            let count = attempts.fetch_add(1, Ordering::SeqCst);
            if count < 2 {
                Err(SoftphoneError::identity_unresolved("registry empty"))
            } else {
                Ok("a1")
            }
        }
    })
    .await;

    assert_eq!(result.unwrap(), "a1");
    assert_eq!(attempts.load(Ordering::SeqCst), 3); // Failed twice, succeeded on third
}

/// Test retry with non-recoverable error
#[tokio::test]
async fn test_retry_non_recoverable() {
    let attempts = Arc::new(AtomicU32::new(0));

    let result: Result<(), _> = retry_with_backoff("test_operation", &RetryConfig::default(), |_| {
        let attempts = attempts.clone();
        async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(SoftphoneError::stale("call is gone"))
        }
    })
    .await;

    assert!(result.unwrap_err().is_stale());
    assert_eq!(attempts.load(Ordering::SeqCst), 1); // Should not retry
}

/// Test that retries stop at the configured attempt count
#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion() {
    let config = RetryConfig {
        max_attempts: 4,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
        backoff_multiplier: 2.0,
        use_jitter: false,
    };

    let result: Result<(), _> = retry_with_backoff("always_failing", &config, |attempt| async move {
        Err(SoftphoneError::identity_unresolved(format!("attempt {}", attempt)))
    })
    .await;

    match result {
        Err(SoftphoneError::IdentityUnresolved { reason }) => assert_eq!(reason, "attempt 4"),
        other => panic!("expected last identity error, got {:?}", other),
    }
}

/// Test retry configuration variations
#[test]
fn test_retry_configurations() {
    let quick_config = RetryConfig::quick();
    assert_eq!(quick_config.max_attempts, 5);
    assert!(quick_config.initial_delay < Duration::from_millis(100));
    assert!(quick_config.use_jitter);

    let single = RetryConfig::none();
    assert_eq!(single.max_attempts, 1);
    assert!(!single.use_jitter);

    let default_config = RetryConfig::default();
    assert_eq!(default_config.max_attempts, 3);
    assert!(default_config.initial_delay <= default_config.max_delay);
}

/// Test timeout wrapper
#[tokio::test(start_paused = true)]
async fn test_with_timeout() {
    let fast = with_timeout("fast_operation", Duration::from_millis(100), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok("done")
    })
    .await;
    assert_eq!(fast.unwrap(), "done");

    let slow: Result<(), _> = with_timeout("slow_operation", Duration::from_millis(100), async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(())
    })
    .await;
    match slow {
        Err(SoftphoneError::OperationTimeout { duration_ms }) => assert_eq!(duration_ms, 100),
        other => panic!("expected timeout, got {:?}", other),
    }

    // Errors from the inner future pass through untouched
    let failed: Result<(), _> = with_timeout("failing_operation", Duration::from_millis(100), async {
        Err(SoftphoneError::internal_error("boom"))
    })
    .await;
    assert_eq!(failed.unwrap_err().category(), "system");
}

/// Test error categorization
#[test]
fn test_error_categorization() {
    let cases = [
        (SoftphoneError::capability_unavailable("answer", vec!["answer()".into()]), "capability", false),
        (SoftphoneError::identity_unresolved("no calls"), "identity", true),
        (SoftphoneError::stale("replaced"), "stale", false),
        (SoftphoneError::SdkTransportError { reason: "socket closed".into() }, "transport", true),
        (SoftphoneError::invalid_state("answer", CallState::Idle), "state", false),
        (SoftphoneError::OperationInFlight { operation: "hangup".into() }, "state", false),
        (SoftphoneError::InvalidPhoneNumber { input: "abc".into() }, "input", false),
        (SoftphoneError::invalid_config("poller_interval_ms", "must be positive"), "configuration", false),
        (SoftphoneError::Disabled, "configuration", false),
        (SoftphoneError::OperationTimeout { duration_ms: 5000 }, "system", true),
    ];

    for (error, category, recoverable) in cases {
        assert_eq!(error.category(), category, "category of {}", error);
        assert_eq!(error.is_recoverable(), recoverable, "recoverability of {}", error);
    }
}

/// Test error messages carry the operation context
#[test]
fn test_error_display() {
    let error = SoftphoneError::capability_unavailable("hangup", vec!["hangup()".into(), "session.terminate()".into()]);
    assert_eq!(
        error.to_string(),
        "No SDK capability available for hangup (tried hangup(), session.terminate())"
    );

    let error = SoftphoneError::invalid_state("dial", CallState::Active);
    assert!(error.to_string().contains("dial"));
}

/// Test builder refuses disabled or incomplete setups
#[tokio::test]
async fn test_builder_configuration_errors() {
    let disabled = SoftphoneBuilder::new()
        .config(SoftphoneConfig::default().with_enabled(false))
        .sdk(ScriptedSdk::new("phone").handle())
        .build()
        .await;
    assert!(matches!(disabled, Err(SoftphoneError::Disabled)));

    let missing_sdk = SoftphoneBuilder::new().build().await;
    match missing_sdk {
        Err(SoftphoneError::MissingConfiguration { field }) => assert_eq!(field, "sdk"),
        other => panic!("expected missing sdk, got {:?}", other.map(|_| ())),
    }

    let invalid = SoftphoneBuilder::new()
        .config(SoftphoneConfig::default().with_poller(3, Duration::ZERO))
        .sdk(ScriptedSdk::new("phone").handle())
        .build()
        .await;
    assert!(matches!(
        invalid,
        Err(SoftphoneError::InvalidConfiguration { ref field, .. }) if field == "poller_interval_ms"
    ));
}

/// Test configuration loaded from JSON keeps defaults for omitted fields
#[test]
fn test_config_from_json() {
    let config = SoftphoneConfig::from_json_str(r#"{ "extension": "1001", "poller_max_attempts": 4 }"#).unwrap();
    assert_eq!(config.extension.as_deref(), Some("1001"));
    assert_eq!(config.poller_max_attempts, 4);
    assert_eq!(config.ended_grace(), SoftphoneConfig::default().ended_grace());

    let broken = SoftphoneConfig::from_json_str("{ not json");
    assert!(matches!(
        broken,
        Err(SoftphoneError::InvalidConfiguration { ref field, .. }) if field == "json"
    ));
}

/// Test a partial retry section keeps defaults for the rest
#[test]
fn test_config_from_json_with_partial_retry() {
    let config = SoftphoneConfig::from_json_str(
        r#"{ "answer_retry": { "max_attempts": 6, "initial_delay_ms": 40 } }"#,
    )
    .unwrap();
    assert_eq!(config.answer_retry.max_attempts, 6);
    assert_eq!(config.answer_retry.initial_delay, Duration::from_millis(40));
    assert_eq!(config.answer_retry.max_delay, RetryConfig::default().max_delay);
    assert!(config.answer_retry.use_jitter);

    let invalid = SoftphoneConfig::from_json_str(r#"{ "answer_retry": { "max_attempts": 0 } }"#);
    assert!(matches!(
        invalid,
        Err(SoftphoneError::InvalidConfiguration { ref field, .. }) if field == "answer_retry.max_attempts"
    ));
}

/// Test the scripted SDK is reachable from integration tests
#[test]
fn test_testing_feature_is_enabled_for_tests() {
    assert_eq!(ScriptedSdk::new("phone").listener_count("incoming"), 0);
}
