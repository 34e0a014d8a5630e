//! Deadline and cancellation guard for external calls.
//!
//! Every call that leaves the process goes through [`run_guarded`], so a slow
//! provider can only ever cost one timeout and a cancelled query drops all of
//! its in-flight futures.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{ExternalSourceError, GatewayError};

/// Why a guarded call did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Cancelled,
    TimedOut { timeout_ms: u64 },
}

impl From<Interrupt> for GatewayError {
    fn from(value: Interrupt) -> Self {
        match value {
            Interrupt::Cancelled => GatewayError::Cancelled,
            Interrupt::TimedOut { timeout_ms } => GatewayError::Timeout { timeout_ms },
        }
    }
}

impl From<Interrupt> for ExternalSourceError {
    fn from(value: Interrupt) -> Self {
        match value {
            Interrupt::Cancelled => ExternalSourceError::unavailable("request cancelled"),
            Interrupt::TimedOut { timeout_ms } => {
                ExternalSourceError::unavailable(format!("request timed out after {timeout_ms}ms"))
            }
        }
    }
}

/// Run `fut` until it completes, the timeout elapses, or `cancel` fires.
///
/// Cancellation wins over a simultaneously ready result. The future is
/// dropped on timeout or cancellation.
pub async fn run_guarded<F>(
    timeout: Duration,
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, Interrupt>
where
    F: Future,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupt::Cancelled),
        res = tokio::time::timeout(timeout, fut) => res.map_err(|_| Interrupt::TimedOut {
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

/// Guard a gateway call and flatten the result.
pub async fn guarded_call<T, F>(
    timeout: Duration,
    cancel: &CancellationToken,
    fut: F,
) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, GatewayError>>,
{
    run_guarded(timeout, cancel, fut).await?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_completes_within_deadline() {
        let cancel = CancellationToken::new();
        let out = guarded_call(Duration::from_secs(1), &cancel, async {
            Ok::<_, GatewayError>(7)
        })
        .await;
        assert_eq!(out, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_maps_to_gateway_timeout() {
        let cancel = CancellationToken::new();
        let out = guarded_call(Duration::from_millis(50), &cancel, async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, GatewayError>(())
        })
        .await;
        assert_eq!(out, Err(GatewayError::Timeout { timeout_ms: 50 }));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let out = run_guarded(Duration::from_secs(1), &cancel, async { 1 }).await;
        assert_eq!(out, Err(Interrupt::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_in_flight_call() {
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            child.cancel();
        });
        let out = guarded_call(Duration::from_secs(60), &cancel, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, GatewayError>(())
        })
        .await;
        assert_eq!(out, Err(GatewayError::Cancelled));
    }

    #[test]
    fn test_interrupt_into_external_error() {
        let err: ExternalSourceError = Interrupt::TimedOut { timeout_ms: 200 }.into();
        assert!(matches!(err, ExternalSourceError::Unavailable { .. }));
    }
}
