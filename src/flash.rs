//! A single-slot, lossy pub/sub channel.
//!
//! The producer side never blocks: values are handed to a relay task over
//! an unbounded queue, which then does a best-effort, non-blocking delivery
//! into a "latest value wins" slot. A slow or absent consumer only ever
//! loses intermediate values, never sees the producer stall. Delivery can
//! be atomically redirected to an external sink with `pipe`/`stop_pipe`,
//! used by the proxy to splice its request feed straight into a
//! `LightStats` input without an extra hop through a consumer loop.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

enum Target<T> {
    Internal,
    Redirected(mpsc::UnboundedSender<T>),
}

struct Shared<T> {
    target: Mutex<Target<T>>,
}

#[derive(Clone)]
pub struct FlashIn<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> FlashIn<T> {
    /// Hands a value to the relay task. Never blocks; silently accepted
    /// even if nobody is currently consuming `Out`.
    pub fn send(&self, val: T) {
        // An unbounded channel only errors if the relay task has shut
        // down (channel closed), which happens only after `Close` — at
        // that point dropping the value is correct.
        let _ = self.tx.send(val);
    }
}

#[derive(Clone)]
pub struct FlashOut<T> {
    rx: watch::Receiver<Option<T>>,
}

impl<T: Clone> FlashOut<T> {
    /// Waits for the next delivered value.
    pub async fn recv(&mut self) -> Option<T> {
        if self.rx.changed().await.is_err() {
            return None;
        }
        self.rx.borrow().clone()
    }

    /// Returns the most recently delivered value without waiting.
    pub fn latest(&self) -> Option<T> {
        self.rx.borrow().clone()
    }
}

pub struct FlashChannel<T> {
    shared: Arc<Shared<T>>,
    input: FlashIn<T>,
    output: FlashOut<T>,
}

impl<T> FlashChannel<T>
where
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        let (in_tx, mut in_rx) = mpsc::unbounded_channel::<T>();
        let (out_tx, out_rx) = watch::channel(None);
        let shared = Arc::new(Shared {
            target: Mutex::new(Target::Internal),
        });

        let relay_shared = shared.clone();
        tokio::spawn(async move {
            while let Some(val) = in_rx.recv().await {
                let redirected = {
                    let target = relay_shared.target.lock();
                    match &*target {
                        Target::Internal => None,
                        Target::Redirected(tx) => Some(tx.clone()),
                    }
                };
                match redirected {
                    Some(tx) => {
                        let _ = tx.send(val);
                    }
                    None => {
                        let _ = out_tx.send(Some(val));
                    }
                }
            }
        });

        FlashChannel {
            shared,
            input: FlashIn { tx: in_tx },
            output: FlashOut { rx: out_rx },
        }
    }

    pub fn input(&self) -> FlashIn<T> {
        self.input.clone()
    }

    pub fn output(&self) -> FlashOut<T> {
        self.output.clone()
    }

    /// Redirects future deliveries to `target` instead of this channel's
    /// own `Out`.
    pub fn pipe(&self, target: mpsc::UnboundedSender<T>) {
        *self.shared.target.lock() = Target::Redirected(target);
    }

    /// Cancels a redirect set up by `pipe`, restoring internal delivery.
    pub fn stop_pipe(&self) {
        *self.shared.target.lock() = Target::Internal;
    }

    /// Closes the producer side, which drains and then stops the relay
    /// task.
    pub fn close(self) {
        drop(self.input);
    }
}

impl<T> Default for FlashChannel<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test]
    async fn producer_never_blocks_without_a_consumer() {
        let ch: FlashChannel<i32> = FlashChannel::new();
        let input = ch.input();
        for i in 0..1000 {
            input.send(i);
        }
        sleep(Duration::from_millis(20)).await;
        // Only the latest value is visible; nothing queued up to replay.
        let mut out = ch.output();
        assert_eq!(out.latest(), Some(999));
        let _ = out.recv(); // still resolves to the same settled value
    }

    #[tokio::test]
    async fn consumer_sees_latest_delivered_value() {
        let ch: FlashChannel<&'static str> = FlashChannel::new();
        let input = ch.input();
        let mut out = ch.output();
        input.send("first");
        let got = out.recv().await;
        assert_eq!(got, Some("first"));
        input.send("second");
        input.send("third");
        let got = out.recv().await;
        assert_eq!(got, Some("third"));
    }

    #[tokio::test]
    async fn pipe_redirects_delivery_to_an_external_sink() {
        let ch: FlashChannel<i32> = FlashChannel::new();
        let (ext_tx, mut ext_rx) = mpsc::unbounded_channel();
        ch.pipe(ext_tx);

        let input = ch.input();
        input.send(42);
        let got = ext_rx.recv().await;
        assert_eq!(got, Some(42));

        ch.stop_pipe();
        let mut out = ch.output();
        input.send(7);
        let got = out.recv().await;
        assert_eq!(got, Some(7));
    }
}
