//! Generic retry-with-backoff helper shared by the ES and CA delivery paths
//! (§8). Both paths need "try, and if it didn't work, try again up to some
//! budget" but disagree on what "didn't work" looks like — ES classifies a
//! structured bulk response, CA just gets a `Result` back from an HTTP call —
//! so the caller supplies its own success predicate instead of this helper
//! inspecting the attempt's output itself.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How many total attempts a call site is willing to make.
///
/// `Bounded(n)` counts *total tries*, not retries after the first: a caller
/// that wants "try once, then retry up to two more times" passes
/// `Bounded(3)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryBudget {
    Unbounded,
    Bounded(u32),
}

/// The operation was abandoned because its `CancellationToken` fired while
/// waiting between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// Runs `action` until `is_success` accepts its output or the retry budget
/// is exhausted, sleeping `backoff(attempt)` between attempts. The last
/// attempt's output is returned even on exhaustion — callers decide what
/// "gave up" means for their own result type (e.g. an `EsResponse::Failure`
/// variant, or an `Err` that still carries the last transport error).
///
/// `action` and `backoff` both receive the 1-based attempt number just
/// completed; callers vary the backoff curve per pipeline (see
/// [`es_backoff`] and [`standard_backoff`]) rather than this helper picking
/// one growth rate for everyone.
pub async fn send_with_retries<T, Fut>(
    budget: RetryBudget,
    backoff: impl Fn(u32) -> Duration,
    cancellation: &CancellationToken,
    mut action: impl FnMut(u32) -> Fut,
    mut is_success: impl FnMut(&T) -> bool,
) -> Result<T, Cancelled>
where
    Fut: Future<Output = T>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let result = action(attempt).await;

        if is_success(&result) {
            return Ok(result);
        }

        let exhausted = match budget {
            RetryBudget::Unbounded => false,
            RetryBudget::Bounded(n) => attempt >= n,
        };
        if exhausted {
            return Ok(result);
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff(attempt)) => {}
            _ = cancellation.cancelled() => return Err(Cancelled),
        }
    }
}

const MAX_BACKOFF: Duration = Duration::from_millis(5000);

/// ES submitter backoff (§4.3): starts at 100 ms, doubles only every tenth
/// retry, capped at 5 seconds.
pub fn es_backoff(attempt: u32) -> Duration {
    let doublings = (attempt / 10).min(16);
    let ms = 100u64.checked_shl(doublings).unwrap_or(u64::MAX);
    Duration::from_millis(ms).min(MAX_BACKOFF)
}

/// CA blob upload / notification-callback backoff (§4.5): standard
/// exponential growth from 100 ms to 5 seconds.
pub fn standard_backoff(attempt: u32) -> Duration {
    let doublings = attempt.saturating_sub(1).min(16);
    let ms = 100u64.checked_shl(doublings).unwrap_or(u64::MAX);
    Duration::from_millis(ms).min(MAX_BACKOFF)
}
