use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use tracing::error;

use tollgate_common::{RelayError, RelayResult};

/// Outermost fault boundary: a panic anywhere in the relay pipeline becomes
/// a structured `InternalFault` instead of a crashed connection.
///
/// Reserved funds are safe across this boundary — the reservation guard
/// refunds on Drop when neither settle nor refund ran — so the only job
/// here is to capture the fault and keep serving.
pub async fn run_protected<F, T>(
    fut: F,
    trace_id: &str,
    request_excerpt: &str,
) -> RelayResult<T>
where
    F: Future<Output = RelayResult<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(
                event = "relay_panicked",
                trace_id = %trace_id,
                panic = %message,
                request = %request_excerpt
            );
            Err(RelayError::InternalFault(
                "unexpected fault while relaying".to_string(),
            ))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn panic_becomes_internal_fault() {
        let result: RelayResult<()> =
            run_protected(async { panic!("boom") }, "trace-1", "{}").await;
        assert!(matches!(result, Err(RelayError::InternalFault(_))));
    }

    #[tokio::test]
    async fn ok_and_err_pass_through() {
        let ok: RelayResult<i32> = run_protected(async { Ok(5) }, "t", "").await;
        assert_eq!(ok.unwrap(), 5);
        let err: RelayResult<i32> =
            run_protected(async { Err(RelayError::Unauthenticated) }, "t", "").await;
        assert!(matches!(err, Err(RelayError::Unauthenticated)));
    }
}
