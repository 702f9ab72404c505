//! Deadline helpers for per-operation socket timeouts.

use std::future::Future;
use std::time::Duration;

use crate::error::{ProtocolError, Result};
use crate::transport::ConnTimeouts;

/// Default read deadline for connections
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Default write deadline for connections
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default grace window for a connection to authenticate
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on the final flush when a connection is closed
pub const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for flushing on close. Applies even when writes have no deadline,
/// so a peer that stopped reading cannot pin a closing connection forever.
pub fn close_deadline(timeouts: ConnTimeouts) -> Option<Duration> {
    Some(timeouts.write.map_or(CLOSE_FLUSH_TIMEOUT, |d| d.min(CLOSE_FLUSH_TIMEOUT)))
}

/// Run `fut` under an optional deadline. A zero or absent deadline waits forever.
pub async fn with_deadline<F, T>(deadline: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match deadline.filter(|d| !d.is_zero()) {
        Some(d) => tokio::time::timeout(d, fut)
            .await
            .map_err(|_| ProtocolError::Timeout)?,
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_elapsed_deadline_is_timeout() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        };
        let result = with_deadline(Some(Duration::from_millis(10)), slow).await;
        assert!(matches!(result, Err(ProtocolError::Timeout)));
    }

    #[test]
    fn test_close_deadline_is_always_bounded() {
        assert_eq!(close_deadline(ConnTimeouts::none()), Some(CLOSE_FLUSH_TIMEOUT));
        let short = ConnTimeouts::new(Duration::ZERO, Duration::from_secs(1));
        assert_eq!(close_deadline(short), Some(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_zero_deadline_disables_timeout() {
        let result = with_deadline(Some(Duration::ZERO), async { Ok(5) }).await;
        assert_eq!(result.unwrap(), 5);
    }
}
