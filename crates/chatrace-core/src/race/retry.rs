use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RaceConfig;
use crate::error::RaceError;
use crate::provider::ProviderDescriptor;
use crate::types::ConversationPayload;

use super::{RaceCoordinator, RaceResult};

/// How many independent races to run before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RaceConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            delay: config.retry_delay(),
        }
    }
}

/// Run races until one wins, an error that retrying cannot fix occurs, or
/// the policy is used up.
///
/// Only [`RaceError::AllProvidersFailed`] and [`RaceError::Timeout`] are
/// retried. Running out of attempts yields [`RaceError::Exhausted`] carrying
/// the last race's error. The pause between races ends early on `signal`.
pub async fn race_with_retry(
    coordinator: &RaceCoordinator,
    policy: &RetryPolicy,
    providers: &[ProviderDescriptor],
    payload: Arc<ConversationPayload>,
    signal: &CancellationToken,
) -> Result<RaceResult, RaceError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let err = match coordinator.race(providers, payload.clone(), signal).await {
            Ok(result) => {
                if attempt > 1 {
                    info!("Race succeeded on attempt {}/{}", attempt, max_attempts);
                }
                return Ok(result);
            }
            Err(e) => e,
        };

        if !err.is_retryable() {
            return Err(err);
        }
        if attempt >= max_attempts {
            warn!("Giving up after {} race attempts: {}", attempt, err);
            return Err(RaceError::Exhausted {
                attempts: attempt,
                last: Box::new(err),
            });
        }

        warn!(
            "Race attempt {}/{} failed: {}; retrying in {:?}",
            attempt, max_attempts, err, policy.delay
        );
        tokio::select! {
            _ = signal.cancelled() => return Err(RaceError::Cancelled),
            _ = tokio::time::sleep(policy.delay) => {}
        }
        attempt += 1;
    }
}
