//! Cooperative writer/reader queues
//!
//! When enabled, store and read operations are funneled through one worker
//! task per lane, so a dataset sees at most one in-flight transaction at a
//! time and concurrent producers amortize transaction setup instead of
//! contending. Disabled, operations run directly on the caller.

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};

/// A queue that runs submitted operations one at a time, in submission order.
#[derive(Debug)]
pub(crate) struct SerialQueue {
    tx: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
}

impl SerialQueue {
    /// Spawns the worker task for one lane.
    pub fn new(lane: impl Into<String>) -> Self {
        let lane = lane.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
        tokio::spawn(async move {
            tracing::debug!(lane, "queue worker started");
            while let Some(op) = rx.recv().await {
                op.await;
            }
            tracing::debug!(lane, "queue worker stopped");
        });
        Self { tx }
    }

    /// Submits an operation and waits for its result.
    ///
    /// The operation runs on the lane's worker task, after every previously
    /// submitted operation has finished.
    pub async fn run<T, F>(&self, op: F) -> T
    where
        T: Send + 'static,
        F: std::future::Future<Output = T> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let wrapped = Box::pin(async move {
            // The receiver is only dropped on runtime shutdown.
            let _ = done_tx.send(op.await);
        });
        self.tx
            .send(wrapped)
            .expect("queue worker exited while the queue handle is alive");
        done_rx
            .await
            .expect("queue worker dropped an accepted operation")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    #[tokio::test]
    async fn operations_run_and_return_their_results() {
        let queue = SerialQueue::new("test");
        let result = queue.run(async { 2 + 2 }).await;
        assert_eq!(result, 4);
    }

    #[tokio::test]
    async fn operations_are_serialized_in_submission_order() {
        let queue = Arc::new(SerialQueue::new("test"));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let queue = Arc::clone(&queue);
            let in_flight = Arc::clone(&in_flight);
            let max_in_flight = Arc::clone(&max_in_flight);
            handles.push(tokio::spawn(async move {
                queue
                    .run(async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        max_in_flight.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
    }
}
