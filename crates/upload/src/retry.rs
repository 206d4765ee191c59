//! Bounded retries around API calls, with token refresh on auth failure.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use wedrive_drive_client::ApiError;
use wedrive_token_cache::{Token, TokenCache};

use crate::error::{Phase, UploadError};

/// Delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    Fixed {
        delay_ms: u64,
    },
    Exponential {
        initial_ms: u64,
        max_ms: u64,
        factor: f64,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Fixed { delay_ms: 1000 }
    }
}

impl Backoff {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Self::Exponential {
                initial_ms,
                max_ms,
                factor,
            } => {
                let exp = attempt.saturating_sub(1).min(63) as i32;
                let ms = initial_ms as f64 * factor.max(1.0).powi(exp);
                Duration::from_millis(ms.min(max_ms as f64) as u64)
            }
        }
    }
}

/// How often one call may be attempted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Forced token refreshes allowed within those attempts.
    pub max_auth_refreshes: u32,
    /// Whether transport errors and busy replies are retried or fatal.
    pub retry_transient: bool,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Initiate and Finish: three attempts, up to two forced refreshes.
    pub fn control() -> Self {
        Self::control_with_attempts(3)
    }

    /// Only auth failures are retried; any other error ends the call.
    pub fn control_with_attempts(attempts: u32) -> Self {
        Self {
            retry_transient: false,
            ..Self::with_attempts(attempts)
        }
    }

    /// Part uploads: five attempts per block.
    pub fn part() -> Self {
        Self::with_attempts(5)
    }

    /// `attempts` attempts; any retry may be preceded by a refresh.
    pub fn with_attempts(attempts: u32) -> Self {
        let max_attempts = attempts.max(1);
        Self {
            max_attempts,
            max_auth_refreshes: max_attempts - 1,
            retry_transient: true,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Resolves `fut`, or fails with [`UploadError::Cancelled`] first.
pub(crate) async fn cancellable<F: Future>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, UploadError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(UploadError::Cancelled),
        out = fut => Ok(out),
    }
}

/// Runs `call` with a current token until it succeeds or the policy gives up.
///
/// Auth failures replace the refused token before the next attempt; transient
/// failures just wait when the policy allows it. Anything else is returned
/// immediately.
pub(crate) async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    phase: Phase,
    tokens: &TokenCache,
    cancel: &CancellationToken,
    mut call: F,
) -> Result<T, UploadError>
where
    F: FnMut(Token) -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut attempt = 0;
    let mut refreshes = 0;
    let mut rejected: Option<Token> = None;

    loop {
        attempt += 1;
        let token = match rejected.take() {
            Some(refused) => cancellable(cancel, tokens.get_after_rejection(&refused)).await??,
            None => cancellable(cancel, tokens.get(false)).await??,
        };
        let used = token.clone();

        let err = match cancellable(cancel, call(token)).await? {
            Ok(value) => return Ok(value),
            Err(e) => UploadError::from_api(phase, e),
        };

        let retry = match &err {
            UploadError::AuthExpired { .. } if refreshes < policy.max_auth_refreshes => {
                refreshes += 1;
                rejected = Some(used);
                true
            }
            UploadError::TransientNetwork { .. } => policy.retry_transient,
            _ => false,
        };
        if !retry || attempt >= policy.max_attempts {
            return Err(err);
        }

        let delay = policy.backoff.delay_for_attempt(attempt);
        warn!(
            %phase,
            attempt,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying"
        );
        cancellable(cancel, tokio::time::sleep(delay)).await?;
    }
}
