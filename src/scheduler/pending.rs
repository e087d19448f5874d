//! FIFO queue of admin operations deferred by a pending or busy state.
//!
//! An entry is a bound thunk that re-enters the very method that deferred
//! it (so a redrained `serve` that finds itself pending again just requeues
//! itself through the same path). It is drained one entry at a time, on a
//! freshly spawned task, from two trigger points: the scheduler's first
//! `READY` transition, and whenever the busy counter returns to zero.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::SchedulerResult;

pub type PendingThunk<S> =
    Box<dyn FnOnce(Arc<S>) -> Pin<Box<dyn Future<Output = SchedulerResult<()>> + Send>> + Send>;

struct PendingOp<S> {
    thunk: PendingThunk<S>,
    reply: oneshot::Sender<SchedulerResult<()>>,
}

pub struct PendingQueue<S> {
    queue: Mutex<VecDeque<PendingOp<S>>>,
}

impl<S: Send + Sync + 'static> PendingQueue<S> {
    pub fn new() -> Self {
        PendingQueue {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Enqueues `thunk` and returns a future that resolves once it has run.
    pub fn enqueue(&self, thunk: PendingThunk<S>) -> oneshot::Receiver<SchedulerResult<()>> {
        let (reply, rx) = oneshot::channel();
        self.queue.lock().push_back(PendingOp { thunk, reply });
        rx
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Pops the head, if any, and runs it on a new task.
    pub fn drain_one(&self, owner: Arc<S>) {
        let op = self.queue.lock().pop_front();
        if let Some(op) = op {
            tokio::spawn(async move {
                let result = (op.thunk)(owner).await;
                let _ = op.reply.send(result);
            });
        }
    }
}

impl<S: Send + Sync + 'static> Default for PendingQueue<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Dummy;

    #[tokio::test]
    async fn queued_entries_run_in_fifo_order() {
        let queue: Arc<PendingQueue<Dummy>> = Arc::new(PendingQueue::new());
        let owner = Arc::new(Dummy);
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut receivers = Vec::new();
        for i in 0..3 {
            let order = order.clone();
            let rx = queue.enqueue(Box::new(move |_owner| {
                Box::pin(async move {
                    order.lock().push(i);
                    Ok(())
                })
            }));
            receivers.push(rx);
        }

        for _ in 0..3 {
            queue.drain_one(owner.clone());
        }
        for rx in receivers {
            rx.await.unwrap().unwrap();
        }

        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn drain_on_empty_queue_is_a_no_op() {
        let queue: Arc<PendingQueue<Dummy>> = Arc::new(PendingQueue::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let _ = hits.load(Ordering::SeqCst);
        queue.drain_one(Arc::new(Dummy));
        assert!(queue.is_empty());
    }
}
