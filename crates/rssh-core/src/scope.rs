//! Scoped acquisition: run an action against an opened resource, then
//! release the resource exactly once whatever the action did.

use crate::error::SshResult;
use futures::FutureExt;
use log::warn;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};

/// Drive `body` to completion, then `release`.
///
/// `release` runs exactly once, also when `body` returns an error or panics.
/// An error from `body` takes precedence over an error from `release`; a
/// panic in `body` is resumed after the release step.
pub async fn with_release<T, B, R>(body: B, release: R) -> SshResult<T>
where
    B: Future<Output = SshResult<T>>,
    R: Future<Output = SshResult<()>>,
{
    let outcome = AssertUnwindSafe(body).catch_unwind().await;
    let released = release.await;

    match outcome {
        Err(payload) => {
            if let Err(e) = released {
                warn!("release after panicked action failed: {}", e);
            }
            panic::resume_unwind(payload)
        }
        Ok(Ok(value)) => released.map(|_| value),
        Ok(Err(err)) => {
            if let Err(e) = released {
                warn!("release after failed action also failed: {}", e);
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SshError, SshErrorKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_release(counter: Arc<AtomicUsize>, fail: bool) -> impl Future<Output = SshResult<()>> {
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            if fail {
                Err(SshError::channel("close failed"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn releases_once_on_success() {
        let closes = Arc::new(AtomicUsize::new(0));
        let value = with_release(async { Ok(7) }, counting_release(closes.clone(), false))
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn releases_once_when_action_fails() {
        let closes = Arc::new(AtomicUsize::new(0));
        let result: SshResult<()> = with_release(
            async { Err(SshError::scp("boom")) },
            counting_release(closes.clone(), false),
        )
        .await;
        assert_eq!(result.unwrap_err().kind, SshErrorKind::Scp);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn action_error_wins_over_release_error() {
        let closes = Arc::new(AtomicUsize::new(0));
        let result: SshResult<()> = with_release(
            async { Err(SshError::scp("boom")) },
            counting_release(closes.clone(), true),
        )
        .await;
        assert_eq!(result.unwrap_err().kind, SshErrorKind::Scp);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn release_error_surfaces_after_success() {
        let closes = Arc::new(AtomicUsize::new(0));
        let result = with_release(async { Ok(1) }, counting_release(closes.clone(), true)).await;
        assert_eq!(result.unwrap_err().kind, SshErrorKind::Channel);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn releases_once_when_action_panics() {
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        let explode = true;
        let handle = tokio::spawn(async move {
            let _: SshResult<()> = with_release(
                async move {
                    if explode {
                        panic!("action blew up");
                    }
                    Ok(())
                },
                counting_release(counter, false),
            )
            .await;
        });
        assert!(handle.await.unwrap_err().is_panic());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
