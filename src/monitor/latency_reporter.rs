//! Reports coarse request latency, fed directly from the proxy's request
//! feed rather than polled.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::debug;

use crate::flash::FlashOut;
use crate::stats::LightStats;

use super::analyser::{ResourceAnalyser, ResourceEvent};

const PRECISION_MS: f64 = 1.0;
const WINDOW: usize = 10;

pub struct LatencyReporter {
    stats: LightStats,
    paused: AtomicBool,
}

impl LatencyReporter {
    pub fn new() -> Self {
        LatencyReporter {
            stats: LightStats::windowed(PRECISION_MS, WINDOW),
            paused: AtomicBool::new(false),
        }
    }

    /// Pipes values from the proxy's request feed into the stats input
    /// until the returned task is dropped or the feed closes.
    pub fn pipe_from(self: &std::sync::Arc<Self>, mut feed: FlashOut<f64>) {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(val) = feed.recv().await {
                if !this.paused.load(Ordering::SeqCst) {
                    this.stats.add(val).await;
                }
            }
        });
    }
}

impl Default for LatencyReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceAnalyser for LatencyReporter {
    async fn start(&self) -> anyhow::Result<()> {
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn analyse(&self, _event: &ResourceEvent) -> anyhow::Result<()> {
        let (n, mean, var2) = self.stats.n_mean_var2();
        debug!(n, mean, stddev = var2.sqrt(), "latency report");
        Ok(())
    }

    async fn query(&self, _arg: f64) -> anyhow::Result<f64> {
        Ok(self.stats.mean())
    }
}
