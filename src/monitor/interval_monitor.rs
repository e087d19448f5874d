//! Periodic scheduler that fans out to every registered analyser in
//! parallel, reporting any that are unexpectedly slow.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time;
use tracing::warn;

use super::analyser::{ResourceAnalyser, ResourceEvent};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

pub struct IntervalMonitor {
    monitored: Mutex<HashMap<String, Arc<dyn ResourceAnalyser>>>,
    interval: Duration,
    stop_tx: mpsc::UnboundedSender<()>,
    stop_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    err_tx: mpsc::UnboundedSender<anyhow::Error>,
    err_rx: Mutex<Option<mpsc::UnboundedReceiver<anyhow::Error>>>,
}

impl IntervalMonitor {
    pub fn new(interval: Option<Duration>) -> Arc<Self> {
        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        Arc::new(IntervalMonitor {
            monitored: Mutex::new(HashMap::new()),
            interval: interval.unwrap_or(DEFAULT_INTERVAL),
            stop_tx,
            stop_rx: Mutex::new(Some(stop_rx)),
            err_tx,
            err_rx: Mutex::new(Some(err_rx)),
        })
    }

    /// Returns `false` if an analyser with this name is already registered.
    pub fn add_analyser(&self, name: impl Into<String>, analyser: Arc<dyn ResourceAnalyser>) -> bool {
        let mut monitored = self.monitored.lock();
        let name = name.into();
        if monitored.contains_key(&name) {
            return false;
        }
        monitored.insert(name, analyser);
        true
    }

    pub fn remove_analyser(&self, name: &str) {
        self.monitored.lock().remove(name);
    }

    pub fn get_analyser(&self, name: &str) -> Option<Arc<dyn ResourceAnalyser>> {
        self.monitored.lock().get(name).cloned()
    }

    /// Drains the error channel set up at construction.
    pub fn take_error_receiver(&self) -> Option<mpsc::UnboundedReceiver<anyhow::Error>> {
        self.err_rx.lock().take()
    }

    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        let mut stop_rx = self
            .stop_rx
            .lock()
            .take()
            .expect("start() called more than once");

        tokio::spawn(async move {
            {
                let analysers: Vec<_> = this.monitored.lock().values().cloned().collect();
                for a in analysers {
                    if let Err(e) = a.start().await {
                        let _ = this.err_tx.send(e);
                    }
                }
            }

            let slow_threshold = (this.interval / 10).min(Duration::from_millis(100));
            let mut ticker = time::interval(this.interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = ticker.tick() => {
                        let tick_start = Instant::now();
                        let analysers: Vec<(String, Arc<dyn ResourceAnalyser>)> = this
                            .monitored
                            .lock()
                            .iter()
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect();

                        let event_time = Instant::now();
                        let fanned_out = analysers.into_iter().map(|(name, analyser)| {
                            let err_tx = this.err_tx.clone();
                            async move {
                                let event = ResourceEvent {
                                    name: name.clone(),
                                    source: None,
                                    time: event_time,
                                };
                                let started = Instant::now();
                                if let Err(e) = analyser.analyse(&event).await {
                                    let _ = err_tx.send(e);
                                }
                                if started.elapsed() >= slow_threshold {
                                    warn!(analyser = %name, elapsed_ms = started.elapsed().as_millis() as u64, "slow analyser");
                                }
                            }
                        });
                        futures::future::join_all(fanned_out).await;

                        if tick_start.elapsed() >= this.interval {
                            warn!(elapsed_ms = tick_start.elapsed().as_millis() as u64, "interval monitor tick overran its own interval");
                        }
                    }
                }
            }
        });
    }

    pub async fn stop(&self) {
        let analysers: Vec<_> = self.monitored.lock().values().cloned().collect();
        for a in analysers {
            let _ = a.stop().await;
        }
        let _ = self.stop_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingAnalyser(Arc<AtomicUsize>);

    #[async_trait]
    impl ResourceAnalyser for CountingAnalyser {
        async fn start(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn stop(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn analyse(&self, _event: &ResourceEvent) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn query(&self, _arg: f64) -> anyhow::Result<f64> {
            Ok(0.0)
        }
    }

    #[tokio::test]
    async fn fans_out_to_every_registered_analyser_each_tick() {
        let monitor = IntervalMonitor::new(Some(Duration::from_millis(20)));
        let hits = Arc::new(AtomicUsize::new(0));
        monitor.add_analyser("a", Arc::new(CountingAnalyser(hits.clone())));
        monitor.add_analyser("b", Arc::new(CountingAnalyser(hits.clone())));
        monitor.start();
        time::sleep(Duration::from_millis(70)).await;
        monitor.stop().await;
        assert!(hits.load(Ordering::SeqCst) >= 4);
    }

    #[test]
    fn duplicate_name_registration_is_rejected() {
        let monitor = IntervalMonitor::new(None);
        let hits = Arc::new(AtomicUsize::new(0));
        assert!(monitor.add_analyser("x", Arc::new(CountingAnalyser(hits.clone()))));
        assert!(!monitor.add_analyser("x", Arc::new(CountingAnalyser(hits))));
    }
}
