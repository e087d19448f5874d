//! Owns the worker pool, drives the state machine, and serializes admin
//! operations against it.

pub mod pending;
pub mod status;
pub mod worker;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::config::WatchdogConfig;
use crate::error::{SchedulerError, SchedulerResult};
use crate::monitor::{IntervalMonitor, LatencyReporter, ResourceAnalyser};
use crate::profiler::Profiler;
use crate::proxy::{RequestResponseMatcher, Server as ProxyServer};

use pending::PendingQueue;
use status::{transition, Op, SchedulerStatus};
use worker::{specialize_worker, WorkerProcess};

pub struct Scheduler {
    config: Arc<WatchdogConfig>,
    proxy: Arc<ProxyServer>,
    client: reqwest::Client,
    monitor: Arc<IntervalMonitor>,
    latency: Arc<LatencyReporter>,
    profiler: Option<Arc<Profiler>>,

    status: RwLock<SchedulerStatus>,
    busying: std::sync::atomic::AtomicI64,
    pending: PendingQueue<Scheduler>,

    workers: Mutex<HashMap<u16, WorkerProcess>>,
    serving_port: Mutex<Option<u16>>,
    sharing_port: Mutex<Option<u16>>,
    serving_function: Mutex<Option<String>>,
    sharing_function: Mutex<Option<String>>,
    ready_once: std::sync::atomic::AtomicBool,
}

impl Scheduler {
    pub fn new(
        config: Arc<WatchdogConfig>,
        proxy: Arc<ProxyServer>,
        monitor: Arc<IntervalMonitor>,
        latency: Arc<LatencyReporter>,
        profiler: Option<Arc<Profiler>>,
    ) -> Arc<Self> {
        Arc::new(Scheduler {
            config,
            proxy,
            client: reqwest::Client::new(),
            monitor,
            latency,
            profiler,
            status: RwLock::new(SchedulerStatus::Launching),
            busying: std::sync::atomic::AtomicI64::new(0),
            pending: PendingQueue::new(),
            workers: Mutex::new(HashMap::new()),
            serving_port: Mutex::new(None),
            sharing_port: Mutex::new(None),
            serving_function: Mutex::new(None),
            sharing_function: Mutex::new(None),
            ready_once: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn status(&self) -> SchedulerStatus {
        *self.status.read()
    }

    pub fn serving_function(&self) -> Option<String> {
        self.serving_function.lock().clone()
    }

    pub fn sharing_function(&self) -> Option<String> {
        self.sharing_function.lock().clone()
    }

    /// Launches `instances` workers on `config.port + 1 ..= config.port +
    /// instances` and registers the latency reporter with the interval
    /// monitor. Called once at process start, before any admin traffic.
    pub fn launch_pool(self: &Arc<Self>) -> std::io::Result<()> {
        self.monitor.add_analyser("latency", self.latency.clone());
        let mut workers = self.workers.lock();
        for offset in 1..=self.config.instances {
            let port = self.config.port + offset;
            let worker = WorkerProcess::launch(&self.config.fprocess, port)?;
            info!(port, "launched worker");
            workers.insert(port, worker);
        }
        Ok(())
    }

    async fn profile(&self, action: &str) {
        if let Some(p) = &self.profiler {
            p.record(action).await;
        }
    }

    /// Exposed so the process entry point can record ambient events (admin
    /// server start) that don't correspond to a state transition.
    pub async fn record_profile(&self, action: &str) {
        self.profile(action).await;
    }

    fn begin_nonexclusive(&self) {
        self.busying.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    /// Decrements the busy counter; if it lands on zero, drains one pending
    /// operation.
    fn done(self: &Arc<Self>) {
        let prev = self.busying.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        if prev == 1 {
            self.pending.drain_one(self.clone());
        }
    }

    fn try_begin_exclusive(&self) -> bool {
        self.busying
            .compare_exchange(0, 1, std::sync::atomic::Ordering::SeqCst, std::sync::atomic::Ordering::SeqCst)
            .is_ok()
    }

    // --- worker registration -------------------------------------------

    /// A worker calls back here (via the admin `/_/ready/<port>` route)
    /// once it has come up. The very first worker to register becomes the
    /// proxy's initial primary and flips the scheduler from `LAUNCHING` to
    /// `READY`, spawning the listen-and-forward loop.
    pub fn register_fe(self: &Arc<Self>, port: u16) -> SchedulerResult<()> {
        let addr = {
            let workers = self.workers.lock();
            let worker = workers.get(&port).ok_or(SchedulerError::Unregistered(port))?;
            worker.mark_ready();
            worker.addr
        };

        let first = !self.ready_once.swap(true, std::sync::atomic::Ordering::SeqCst);
        if first {
            *self.serving_port.lock() = Some(port);
            self.proxy.swap(port, addr);

            let this = self.clone();
            let matcher = RequestResponseMatcher::new(self.proxy.clone());
            let proxy = self.proxy.clone();
            tokio::spawn(async move {
                let on_ready = {
                    let this = this.clone();
                    move || {
                        let status = transition(SchedulerStatus::Launching, Op::Ready)
                            .expect("Launching -> Ready is always legal");
                        *this.status.write() = status;
                        info!("scheduler ready");
                        this.pending.drain_one(this.clone());
                    }
                };
                if let Err(e) = proxy.listen_and_proxy(matcher, on_ready).await {
                    warn!(error = %e, "proxy accept loop exited");
                }
            });
        }

        Ok(())
    }

    // --- serve -----------------------------------------------------------

    pub fn serve(self: &Arc<Self>, function: String) -> EnqueueOrRun<SchedulerResult<()>> {
        match self.status() {
            SchedulerStatus::Launching => {
                let rx = self.pending.enqueue(Box::new(move |s| {
                    Box::pin(async move { s.do_serve(function).await })
                }));
                EnqueueOrRun::Queued(rx)
            }
            SchedulerStatus::Ready => EnqueueOrRun::spawn(self.clone(), move |s| s.do_serve(function)),
            _ => EnqueueOrRun::Immediate(Err(SchedulerError::StatusTransition)),
        }
    }

    async fn do_serve(self: Arc<Self>, function: String) -> SchedulerResult<()> {
        self.begin_nonexclusive();
        let port = *self.serving_port.lock();
        let Some(port) = port else {
            self.done();
            return Err(SchedulerError::NotAvailable);
        };
        let result = self.specialize_port(port, &function).await;
        if result.is_ok() {
            *self.serving_function.lock() = Some(function);
            *self.status.write() = transition(SchedulerStatus::Ready, Op::Serve)
                .expect("Ready -> Serve is always legal here");
            self.profile("serve").await;
        }
        self.done();
        result
    }

    // --- share -------------------------------------------------------------

    pub fn share(self: &Arc<Self>, function: String) -> EnqueueOrRun<SchedulerResult<()>> {
        if !self.try_begin_exclusive() {
            let rx = self.pending.enqueue(Box::new(move |s| {
                Box::pin(async move {
                    if !s.try_begin_exclusive() {
                        return Err(SchedulerError::Busying);
                    }
                    s.do_share(function).await
                })
            }));
            return EnqueueOrRun::Queued(rx);
        }
        EnqueueOrRun::spawn(self.clone(), move |s| s.do_share(function))
    }

    async fn do_share(self: Arc<Self>, function: String) -> SchedulerResult<()> {
        if self.status() != SchedulerStatus::Serving {
            self.done();
            return Err(SchedulerError::StatusTransition);
        }
        let serving = *self.serving_port.lock();
        let idle = {
            let workers = self.workers.lock();
            workers
                .values()
                .find(|w| w.is_ready() && Some(w.port) != serving)
                .map(|w| (w.port, w.addr))
        };
        let Some((port, addr)) = idle else {
            self.done();
            return Err(SchedulerError::NotAvailable);
        };

        let result = self.specialize_port(port, &function).await;
        if result.is_ok() {
            self.proxy.share(port, addr);
            *self.sharing_function.lock() = Some(function);
            *self.sharing_port.lock() = Some(port);
            *self.status.write() =
                transition(SchedulerStatus::Serving, Op::Share).expect("Serving -> Share is always legal");
        }
        self.done();
        result
    }

    // --- unshare -------------------------------------------------------------

    pub fn unshare(self: &Arc<Self>) -> EnqueueOrRun<SchedulerResult<()>> {
        if !self.try_begin_exclusive() {
            let rx = self.pending.enqueue(Box::new(move |s| {
                Box::pin(async move {
                    if !s.try_begin_exclusive() {
                        return Err(SchedulerError::Busying);
                    }
                    s.do_unshare().await
                })
            }));
            return EnqueueOrRun::Queued(rx);
        }
        EnqueueOrRun::spawn(self.clone(), |s| s.do_unshare())
    }

    async fn do_unshare(self: Arc<Self>) -> SchedulerResult<()> {
        if self.status() != SchedulerStatus::Sharing {
            self.done();
            return Err(SchedulerError::StatusTransition);
        }
        self.proxy.unshare();
        let old_port = self.sharing_port.lock().take();
        if let Some(port) = old_port {
            self.relaunch(port).await;
        }
        *self.sharing_function.lock() = None;
        *self.status.write() =
            transition(SchedulerStatus::Sharing, Op::Unshare).expect("Sharing -> Unshare is always legal");
        self.done();
        Ok(())
    }

    // --- promote -------------------------------------------------------------

    pub fn promote(self: &Arc<Self>) -> EnqueueOrRun<SchedulerResult<()>> {
        if !self.try_begin_exclusive() {
            let rx = self.pending.enqueue(Box::new(move |s| {
                Box::pin(async move {
                    if !s.try_begin_exclusive() {
                        return Err(SchedulerError::Busying);
                    }
                    s.do_promote().await
                })
            }));
            return EnqueueOrRun::Queued(rx);
        }
        EnqueueOrRun::spawn(self.clone(), |s| s.do_promote())
    }

    async fn do_promote(self: Arc<Self>) -> SchedulerResult<()> {
        if self.status() != SchedulerStatus::Sharing {
            self.done();
            return Err(SchedulerError::StatusTransition);
        }
        self.proxy.promote();

        let old_primary = self.serving_port.lock().take();
        let new_primary = self.sharing_port.lock().take();
        if let Some(port) = new_primary {
            *self.serving_port.lock() = Some(port);
        }
        *self.serving_function.lock() = self.sharing_function.lock().take();

        if let Some(port) = old_primary {
            self.relaunch(port).await;
        }

        *self.status.write() =
            transition(SchedulerStatus::Sharing, Op::Promote).expect("Sharing -> Promote is always legal");
        self.done();
        Ok(())
    }

    // --- swap -------------------------------------------------------------

    pub fn swap(self: &Arc<Self>, function: Option<String>) -> EnqueueOrRun<SchedulerResult<()>> {
        if !self.try_begin_exclusive() {
            let rx = self.pending.enqueue(Box::new(move |s| {
                Box::pin(async move {
                    if !s.try_begin_exclusive() {
                        return Err(SchedulerError::Busying);
                    }
                    s.do_swap(function).await
                })
            }));
            return EnqueueOrRun::Queued(rx);
        }
        EnqueueOrRun::spawn(self.clone(), move |s| s.do_swap(function))
    }

    async fn do_swap(self: Arc<Self>, function: Option<String>) -> SchedulerResult<()> {
        if self.status() != SchedulerStatus::Serving {
            self.done();
            return Err(SchedulerError::StatusTransition);
        }
        let serving = *self.serving_port.lock();
        let sharing = *self.sharing_port.lock();
        let idle = {
            let workers = self.workers.lock();
            workers
                .values()
                .find(|w| w.is_ready() && Some(w.port) != serving && Some(w.port) != sharing)
                .map(|w| (w.port, w.addr))
        };
        let Some((port, addr)) = idle else {
            self.done();
            return Err(SchedulerError::NotAvailable);
        };

        let function = function.unwrap_or_else(|| self.serving_function().unwrap_or_default());
        let result = self.specialize_port(port, &function).await;
        if result.is_ok() {
            self.proxy.swap(port, addr);
            let old_primary = self.serving_port.lock().replace(port);
            *self.serving_function.lock() = Some(function);
            self.profile("proxy").await;
            if let Some(old_port) = old_primary {
                self.relaunch(old_port).await;
            }
            *self.status.write() =
                transition(SchedulerStatus::Serving, Op::Swap).expect("Serving -> Swap is always legal");
        }
        self.done();
        result
    }

    // --- helpers -------------------------------------------------------------

    async fn specialize_port(&self, port: u16, function: &str) -> SchedulerResult<()> {
        let addr = {
            let workers = self.workers.lock();
            workers.get(&port).ok_or(SchedulerError::Unregistered(port))?.addr
        };
        specialize_worker(&self.client, addr, port, &self.config.faas_base_path, function).await
    }

    /// Terminates the worker on `port`, waits for reap, and launches a
    /// fresh one on the same port so the pool size is preserved.
    async fn relaunch(&self, port: u16) {
        let worker = self.workers.lock().remove(&port);
        if let Some(worker) = worker {
            worker.terminate().await;
        }
        match WorkerProcess::launch(&self.config.fprocess, port) {
            Ok(fresh) => {
                self.workers.lock().insert(port, fresh);
            }
            Err(e) => warn!(port, error = %e, "failed to relaunch worker"),
        }
    }
}

/// The outcome of calling one of the scheduler's admin operations: either
/// it ran immediately (possibly erroring synchronously), it started
/// running on a background task, or it was deferred and the caller must
/// await the pending queue's eventual reply.
pub enum EnqueueOrRun<T> {
    Immediate(T),
    Running(tokio::task::JoinHandle<T>),
    Queued(oneshot::Receiver<T>),
}

impl EnqueueOrRun<SchedulerResult<()>> {
    fn spawn<F, Fut>(scheduler: Arc<Scheduler>, f: F) -> Self
    where
        F: FnOnce(Arc<Scheduler>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = SchedulerResult<()>> + Send + 'static,
    {
        EnqueueOrRun::Running(tokio::spawn(f(scheduler)))
    }

    /// Awaits the operation to completion regardless of which path it took.
    pub async fn await_result(self) -> SchedulerResult<()> {
        match self {
            EnqueueOrRun::Immediate(r) => r,
            EnqueueOrRun::Running(handle) => handle.await.unwrap_or(Err(SchedulerError::StatusTransition)),
            EnqueueOrRun::Queued(rx) => rx.await.unwrap_or(Err(SchedulerError::StatusTransition)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::IntervalMonitor;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn test_config() -> Arc<WatchdogConfig> {
        Arc::new(WatchdogConfig {
            fprocess: "true".to_string(),
            instances: 0,
            port: 19000,
            admin_port: 19100,
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            exec_timeout: Duration::from_secs(0),
            write_debug: false,
            cgi_headers: true,
            debug_headers: false,
            marshal_request: false,
            suppress_lock: false,
            content_type: String::new(),
            combine_output: true,
            profile: None,
            faas_base_path: ".".to_string(),
            faas: None,
        })
    }

    fn test_scheduler() -> Arc<Scheduler> {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let proxy = ProxyServer::new(addr, false, true);
        let monitor = IntervalMonitor::new(None);
        let latency = LatencyReporter::new();
        Scheduler::new(test_config(), proxy, monitor, latency, None)
    }

    #[test]
    fn starts_in_launching() {
        let scheduler = test_scheduler();
        assert_eq!(scheduler.status(), SchedulerStatus::Launching);
    }

    #[tokio::test]
    async fn serve_while_launching_reports_pending_until_ready() {
        let scheduler = test_scheduler();
        let outcome = scheduler.serve("greet.Handler".to_string());
        assert!(matches!(outcome, EnqueueOrRun::Queued(_)));
    }

    #[test]
    fn register_unknown_port_is_rejected() {
        let scheduler = test_scheduler();
        assert!(matches!(
            scheduler.register_fe(65000),
            Err(SchedulerError::Unregistered(65000))
        ));
    }
}
