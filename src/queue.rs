//! Serial per-channel work queue.
//!
//! One queue per channel processes jobs strictly in FIFO order, one at a
//! time. Enqueueing beyond the depth cap drops the new item with a warning;
//! job errors are the job's own problem and never stop the queue.

use crate::ChannelId;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

/// Maximum pending jobs per channel; new work beyond this is dropped.
pub const MAX_QUEUE_DEPTH: usize = 5;

/// A unit of channel work.
pub type Job = BoxFuture<'static, ()>;

/// Serial FIFO bound to a single channel.
pub struct ChannelQueue {
    channel_id: ChannelId,
    tx: mpsc::UnboundedSender<Job>,
    depth: Arc<AtomicUsize>,
}

impl ChannelQueue {
    pub fn new(channel_id: ChannelId) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let depth = Arc::new(AtomicUsize::new(0));

        let worker_depth = depth.clone();
        let worker_channel = channel_id.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
                worker_depth.fetch_sub(1, Ordering::SeqCst);
            }
            tracing::debug!(channel_id = %worker_channel, "channel queue stopped");
        });

        Arc::new(Self {
            channel_id,
            tx,
            depth,
        })
    }

    /// Append a job. Returns `false` (dropping the job) when the queue
    /// already holds [`MAX_QUEUE_DEPTH`] items.
    pub fn enqueue(&self, job: Job) -> bool {
        if self.depth.load(Ordering::SeqCst) >= MAX_QUEUE_DEPTH {
            tracing::warn!(
                channel_id = %self.channel_id,
                depth = MAX_QUEUE_DEPTH,
                "channel queue full, dropping work item"
            );
            return false;
        }
        self.depth.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(job).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!(channel_id = %self.channel_id, "channel queue closed, dropping work item");
            return false;
        }
        true
    }

    /// Pending work count, including the item currently running.
    pub fn size(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[tokio::test]
    async fn test_jobs_run_in_fifo_order() {
        let queue = ChannelQueue::new(StdArc::from("c1"));
        let order = StdArc::new(tokio::sync::Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            queue.enqueue(Box::pin(async move {
                order.lock().await.push(i);
            }));
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*order.lock().await, vec![0, 1, 2]);
        assert_eq!(queue.size(), 0);
    }

    #[tokio::test]
    async fn test_only_one_job_runs_at_a_time() {
        let queue = ChannelQueue::new(StdArc::from("c1"));
        let running = StdArc::new(AtomicU32::new(0));
        let peak = StdArc::new(AtomicU32::new(0));

        for _ in 0..4 {
            let running = running.clone();
            let peak = peak.clone();
            queue.enqueue(Box::pin(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_enqueue_drops_past_cap() {
        let queue = ChannelQueue::new(StdArc::from("c1"));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = StdArc::new(tokio::sync::Mutex::new(Some(release_rx)));

        // first job blocks the queue
        {
            let release_rx = release_rx.clone();
            assert!(queue.enqueue(Box::pin(async move {
                let rx = release_rx.lock().await.take().unwrap();
                let _ = rx.await;
            })));
        }
        for _ in 0..(MAX_QUEUE_DEPTH - 1) {
            assert!(queue.enqueue(Box::pin(async {})));
        }
        // queue is at the cap now
        assert!(!queue.enqueue(Box::pin(async {})));
        assert_eq!(queue.size(), MAX_QUEUE_DEPTH);

        let _ = release_tx.send(());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.size(), 0);
        assert!(queue.enqueue(Box::pin(async {})));
    }
}
