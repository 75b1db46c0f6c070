use std::time::Duration;

use color_eyre::Result;
use credvault_core::CredentialError;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::debug;

/// Gap between lock-state probes while waiting for the platform prompt.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Poll `is_unlocked` until it reports true or `limit` elapses.
/// Returns whether the facility unlocked in time.
pub async fn wait_for_unlock<F>(
    mut is_unlocked: F,
    limit: Duration,
    every: Duration,
) -> Result<bool>
where
    F: FnMut() -> Result<bool, CredentialError>,
{
    let poll = async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if is_unlocked()? {
                return Ok::<_, CredentialError>(true);
            }
            debug!("keystore still locked");
        }
    };

    match timeout(limit, poll).await {
        Ok(result) => Ok(result?),
        Err(_) => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use credvault_storage::key_provider::{InMemoryKeyProvider, KeyError, SecureKeyProvider};

    fn unavailable(err: KeyError) -> CredentialError {
        CredentialError::KeyStoreUnavailable {
            reason: err.to_string(),
        }
    }

    #[tokio::test]
    async fn returns_true_once_unlock_completes() {
        let provider = InMemoryKeyProvider::default();
        provider.set_locked(true).expect("lock");
        provider.request_unlock().expect("request");

        let completer = provider.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            completer.complete_unlock().expect("complete")
        });

        let probe = provider.clone();
        let unlocked = wait_for_unlock(
            || probe.is_unlocked().map_err(unavailable),
            Duration::from_secs(5),
            Duration::from_millis(5),
        )
        .await
        .expect("poll");
        assert!(unlocked);
        assert!(handle.await.expect("join"));
    }

    #[tokio::test]
    async fn gives_up_after_limit() {
        let provider = InMemoryKeyProvider::default();
        provider.set_locked(true).expect("lock");

        let unlocked = wait_for_unlock(
            || provider.is_unlocked().map_err(unavailable),
            Duration::from_millis(40),
            Duration::from_millis(5),
        )
        .await
        .expect("poll");
        assert!(!unlocked);
    }

    #[tokio::test]
    async fn facility_errors_end_the_wait() {
        let err = wait_for_unlock(
            || {
                Err(CredentialError::KeyStoreUnavailable {
                    reason: "keyring daemon gone".into(),
                })
            },
            Duration::from_secs(5),
            Duration::from_millis(5),
        )
        .await
        .expect_err("facility failure");
        assert!(err.to_string().contains("unavailable"));
    }
}
