use super::helpers::{calculate_backoff_delay, millis_to_u64};
use super::types::{AttemptFailure, RetryError};
use crate::types::RetryConfig;
use log::{error, warn};
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Exponential-backoff wrapper around one model-streaming call.
///
/// Transient failures before any output are retried up to
/// `max_attempts`, then escalated to fatal. A transient failure after
/// partial output is handed back as [`RetryError::Partial`] so the caller
/// can discard its draft and re-issue the whole turn.
#[derive(Clone, Debug)]
pub(crate) struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub(crate) const fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `attempt` until it succeeds or the policy gives up. `attempt`
    /// receives the 1-based attempt number.
    pub(crate) async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AttemptFailure>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let failure = match attempt(attempts).await {
                Ok(value) => return Ok(value),
                Err(failure) => failure,
            };
            let AttemptFailure { error: err, partial } = failure;

            if !err.is_transient() {
                error!("Streaming error (non-recoverable): {err}");
                return Err(RetryError::Fatal(err));
            }
            if partial {
                warn!("Streaming error after partial output (attempt={attempts}, error={err})");
                return Err(RetryError::Partial(err));
            }
            if attempts >= max_attempts {
                error!("Streaming error after {attempts} attempts: {err}");
                return Err(RetryError::Fatal(err.into_fatal(attempts)));
            }

            let delay = err
                .retry_after
                .unwrap_or_else(|| calculate_backoff_delay(attempts, &self.config));
            warn!(
                "Streaming error, retrying (attempt={attempts}, delay_ms={}, error={err})",
                millis_to_u64(delay.as_millis())
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(RetryError::Interrupted),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}
