//! Retry with exponential backoff and jitter
//!
//! Wraps a single network call. Non-retryable errors (integrity, auth
//! configuration, not-found) propagate immediately; transient errors are
//! retried up to the configured attempt budget and only then surfaced as
//! [`DistributionError::NetworkExhausted`]. Every attempt is gated by the
//! host's circuit breaker, so an open breaker fails fast without touching
//! the network.

use crate::config::RetryConfig;
use crate::error::{DistributionError, Result};
use crate::resilience::breaker::BreakerRegistry;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::time::Duration;
use tracing::{debug, warn};

fn create_backoff(config: &RetryConfig) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(config.initial_backoff_ms))
        .with_max_interval(Duration::from_millis(config.max_backoff_ms))
        .with_multiplier(config.backoff_multiplier)
        .with_max_elapsed_time(None) // attempts are the budget, not time
        .build()
}

/// Retry `f` against `host` with exponential backoff, consulting the
/// breaker before every attempt and recording the outcome after it.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    breakers: &BreakerRegistry,
    host: &str,
    operation_name: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut backoff = create_backoff(config);
    let mut attempts = 0u32;

    loop {
        breakers.admit(host)?;
        attempts += 1;

        match f().await {
            Ok(result) => {
                breakers.record_success(host);
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        host, attempts, "operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) if !err.is_retryable() => {
                // A well-formed rejection is not a host failure.
                debug!(
                    operation = operation_name,
                    host,
                    error = %err,
                    "error is not retryable, failing immediately"
                );
                return Err(err);
            }
            Err(err) => {
                // A 401 is a well-formed response: the host is reachable,
                // only the credential is stale. Count it as transport
                // success so a pure auth problem can never open the
                // circuit (or strand a half-open probe).
                if matches!(err, DistributionError::AuthExpired { .. }) {
                    breakers.record_success(host);
                } else {
                    breakers.record_failure(host);
                }

                if attempts >= config.max_attempts {
                    warn!(
                        operation = operation_name,
                        host,
                        attempts,
                        error = %err,
                        "operation failed after maximum retries"
                    );
                    return Err(DistributionError::NetworkExhausted {
                        operation: operation_name.to_string(),
                        attempts,
                        last_error: err.to_string(),
                    });
                }

                match backoff.next_backoff() {
                    Some(duration) => {
                        warn!(
                            operation = operation_name,
                            host,
                            attempts,
                            error = %err,
                            retry_in_ms = duration.as_millis(),
                            "operation failed, retrying"
                        );
                        tokio::time::sleep(duration).await;
                    }
                    None => {
                        return Err(DistributionError::NetworkExhausted {
                            operation: operation_name.to_string(),
                            attempts,
                            last_error: err.to_string(),
                        });
                    }
                }
            }
        }
    }
}
