use std::{future::Future, time::Duration};

use crate::error::{CoreError, ErrorCategory, ErrorCode, Result};

/// Exponential backoff schedule for retriable failures.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: f64,
    pub cap: Duration,
    pub max_attempts: u32,
    /// 0.0 = no jitter, 1.0 = delay may shrink to zero.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(200),
            factor: 2.0,
            cap: Duration::from_secs(8),
            max_attempts: 5,
            jitter: 0.3,
        }
    }
}

impl Backoff {
    /// Delay before retrying after `attempt` failures (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let raw = self.initial.as_millis() as f64 * self.factor.powi(attempt as i32);
        let capped = raw.min(self.cap.as_millis() as f64);
        let jittered = capped * (1.0 - self.jitter * rand::random::<f64>());
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

/// Runs `op` until it succeeds, the error is not retriable, or the attempt
/// budget is spent. The attempt number is handed to `op` so callers can
/// re-obtain per-attempt state such as a fresh auth callback.
///
/// Category policy: retriable errors back off and retry; user-actionable
/// errors return immediately; fatal errors surface, except that a single
/// filesystem error is given one extra attempt.
pub async fn retry_with_backoff<T, F, Fut>(label: &str, backoff: &Backoff, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut filesystem_retry_used = false;
    let mut attempt: u32 = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let eligible = match err.category() {
                    ErrorCategory::Retriable => true,
                    ErrorCategory::Fatal
                        if err.code == ErrorCode::Filesystem && !filesystem_retry_used =>
                    {
                        filesystem_retry_used = true;
                        true
                    }
                    _ => false,
                };
                if !eligible || attempt + 1 >= backoff.max_attempts {
                    return Err(err);
                }
                let delay = backoff.delay_for(attempt);
                tracing::debug!(
                    label,
                    attempt,
                    code = %err.code,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after backoff"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Folds the per-token failures of an authentication cascade into one
/// user-actionable error listing every attempt.
pub fn aggregate_auth_failures(host: &str, attempts: &[(String, CoreError)]) -> CoreError {
    let mut lines = Vec::with_capacity(attempts.len());
    for (label, err) in attempts {
        lines.push(format!("{label}: {err}"));
    }
    CoreError::new(
        ErrorCode::AuthRequired,
        format!(
            "all credentials for {host} were rejected ({} attempted): {}",
            attempts.len(),
            lines.join("; ")
        ),
    )
    .with_hint(format!(
        "authentication required: configure a token for host {host}"
    ))
}
