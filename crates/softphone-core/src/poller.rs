//! Bounded identity recovery while a call is ringing
//!
//! Events get lost and the SDK registry fills in late, so while a call sits
//! in `Incoming` without a complete identity the engine re-runs resolution on
//! a fixed interval. Running out of attempts is not an error; answering
//! falls back to the parameterless signatures.

use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

/// Whether the poller should keep going after a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStep {
    Continue,
    Stop,
}

/// Something that can retry identity resolution for one session generation
#[async_trait]
pub trait RecoveryTarget: Send + Sync {
    async fn recover_identity(&self, generation: u64, attempt: u32) -> PollStep;
}

/// Handle to a running poller; the task is aborted when this is dropped
#[derive(Debug)]
pub struct RecoveryPoller {
    generation: u64,
    handle: JoinHandle<()>,
}

impl RecoveryPoller {
    /// Spawn a poller that ticks every `period`, at most `max_attempts` times
    pub fn start(target: Weak<dyn RecoveryTarget>, generation: u64, max_attempts: u32, period: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            for attempt in 1..=max_attempts {
                ticker.tick().await;
                let Some(target) = target.upgrade() else {
                    return;
                };
                if target.recover_identity(generation, attempt).await == PollStep::Stop {
                    debug!(generation, attempt, "Identity poller stopped");
                    return;
                }
            }
            debug!(generation, max_attempts, "Identity poller exhausted its attempts");
        });

        Self { generation, handle }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for RecoveryPoller {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
