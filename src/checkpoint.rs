//! C7 — Checkpoint Coordinator: rate-limits and linearizes checkpoint calls
//! for one partition (§4.7). Owned exclusively by that partition's
//! processor, so no internal locking is needed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// The Consumer Host's checkpoint callback for one partition, abstracted so
/// the coordinator can be unit-tested without a real host.
#[async_trait]
pub trait PartitionCheckpointer: Send + Sync {
    async fn checkpoint(&self) -> crate::errors::Result<()>;
}

pub struct CheckpointCoordinator<C: PartitionCheckpointer> {
    checkpointer: C,
    min_interval: Duration,
    last_checkpoint_at: Option<DateTime<Utc>>,
}

impl<C: PartitionCheckpointer> CheckpointCoordinator<C> {
    pub fn new(checkpointer: C, min_interval: Duration) -> Self {
        CheckpointCoordinator {
            checkpointer,
            min_interval,
            last_checkpoint_at: None,
        }
    }

    /// Checkpoints only if `minInterval` has elapsed since the last one.
    /// Returns whether a checkpoint was actually issued.
    pub async fn maybe_checkpoint(&mut self) -> crate::errors::Result<bool> {
        let now = Utc::now();
        let due = match self.last_checkpoint_at {
            None => true,
            Some(last) => {
                let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
                elapsed >= self.min_interval
            }
        };
        if due {
            self.checkpointer.checkpoint().await?;
            self.last_checkpoint_at = Some(now);
        }
        Ok(due)
    }

    /// Unconditional checkpoint, used on clean shutdown and, for CA, after
    /// any flush within a batch.
    pub async fn force_checkpoint(&mut self) -> crate::errors::Result<()> {
        self.checkpointer.checkpoint().await?;
        self.last_checkpoint_at = Some(Utc::now());
        Ok(())
    }

    /// Pure check, no I/O: whether `minInterval` has elapsed since the last
    /// checkpoint. Lets a caller combine this with its own conditions (e.g.
    /// CA's "anyFlushed or interval elapsed") before deciding to checkpoint.
    pub fn is_due(&self) -> bool {
        match self.last_checkpoint_at {
            None => true,
            Some(last) => {
                let elapsed = (Utc::now() - last).to_std().unwrap_or(Duration::ZERO);
                elapsed >= self.min_interval
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingCheckpointer(Arc<AtomicUsize>);

    #[async_trait]
    impl PartitionCheckpointer for CountingCheckpointer {
        async fn checkpoint(&self) -> crate::errors::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn first_call_always_checkpoints() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut coordinator =
            CheckpointCoordinator::new(CountingCheckpointer(count.clone()), Duration::from_secs(60));
        let did = coordinator.maybe_checkpoint().await.unwrap();
        assert!(did);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_call_within_interval_is_skipped() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut coordinator =
            CheckpointCoordinator::new(CountingCheckpointer(count.clone()), Duration::from_secs(60));
        coordinator.maybe_checkpoint().await.unwrap();
        let did = coordinator.maybe_checkpoint().await.unwrap();
        assert!(!did);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn force_checkpoint_ignores_interval() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut coordinator =
            CheckpointCoordinator::new(CountingCheckpointer(count.clone()), Duration::from_secs(60));
        coordinator.maybe_checkpoint().await.unwrap();
        coordinator.force_checkpoint().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
