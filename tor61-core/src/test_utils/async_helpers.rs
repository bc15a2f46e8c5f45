//! Channel receives that fail instead of hanging a test

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Duration;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RecvTimeoutError {
    #[error("nothing arrived in time")]
    Timeout,
    #[error("every sender is gone")]
    Closed,
}

/// Next message on `rx`, or an error once `wait` has passed.
pub async fn recv_unbounded_timeout<T>(
    rx: &mut mpsc::UnboundedReceiver<T>,
    wait: Duration,
) -> Result<T, RecvTimeoutError> {
    match tokio::time::timeout(wait, rx.recv()).await {
        Ok(Some(message)) => Ok(message),
        Ok(None) => Err(RecvTimeoutError::Closed),
        Err(_) => Err(RecvTimeoutError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_recv_outcomes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(7u16).unwrap();
        let wait = Duration::from_millis(10);

        assert_eq!(recv_unbounded_timeout(&mut rx, wait).await, Ok(7));
        assert_eq!(
            recv_unbounded_timeout(&mut rx, wait).await,
            Err(RecvTimeoutError::Timeout)
        );
        drop(tx);
        assert_eq!(
            recv_unbounded_timeout(&mut rx, wait).await,
            Err(RecvTimeoutError::Closed)
        );
    }
}
