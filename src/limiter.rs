// src/limiter.rs

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Result, TransferError};

/// Bound on simultaneous in-flight transfers, shared by every task that
/// holds a clone.
#[derive(Clone, Debug, Default)]
pub struct TransferLimiter {
    /// `None` when unbounded.
    permits: Option<Arc<Semaphore>>,
    max_in_flight: usize,
}

/// Slot held for the duration of one transfer.
#[derive(Debug)]
pub struct TransferPermit {
    _permit: Option<OwnedSemaphorePermit>,
}

impl TransferLimiter {
    /// Creates a limiter. A limit of 0 means unbounded.
    pub fn new(max_in_flight: usize) -> Self {
        let permits = if max_in_flight == 0 {
            None
        } else {
            Some(Arc::new(Semaphore::new(max_in_flight)))
        };
        Self {
            permits,
            max_in_flight,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(0)
    }

    pub fn max_in_flight(&self) -> Option<usize> {
        self.permits.as_ref().map(|_| self.max_in_flight)
    }

    /// Free slots, `None` when unbounded.
    pub fn available(&self) -> Option<usize> {
        self.permits.as_ref().map(|s| s.available_permits())
    }

    /// Waits for a free slot.
    pub async fn acquire(&self) -> Result<TransferPermit> {
        let Some(semaphore) = &self.permits else {
            return Ok(TransferPermit { _permit: None });
        };
        let permit = Arc::clone(semaphore)
            .acquire_owned()
            .await
            .map_err(|_| TransferError::Aborted("concurrency limiter closed".into()))?;
        Ok(TransferPermit {
            _permit: Some(permit),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn unbounded_never_waits() {
        let limiter = TransferLimiter::unbounded();
        assert_eq!(limiter.max_in_flight(), None);
        let _held: Vec<_> = futures_util::future::try_join_all((0..64).map(|_| limiter.acquire()))
            .await
            .unwrap();
        assert_eq!(limiter.available(), None);
    }

    #[tokio::test]
    async fn bounded_limiter_blocks_until_release() {
        let limiter = TransferLimiter::new(2);
        let first = limiter.acquire().await.unwrap();
        let _second = limiter.acquire().await.unwrap();
        assert_eq!(limiter.available(), Some(0));

        let waiting = tokio::time::timeout(Duration::from_millis(20), limiter.acquire()).await;
        assert!(waiting.is_err());

        drop(first);
        let third = tokio::time::timeout(Duration::from_millis(200), limiter.acquire()).await;
        assert!(third.is_ok());
    }
}
