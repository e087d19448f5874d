//! TCP listener, dual-remote registry, and per-connection classification.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::error::ProxyError;
use crate::flash::{FlashChannel, FlashOut};
use crate::monitor::{RequestStats, RequestStatsSource};

use super::forward::{forward, ForwardConnection, Matcher};

/// Fixed two-slot remote registry: index 0 is whichever slot is currently
/// primary, index 1 secondary. Rearranging which physical slot holds which
/// role is a single write-locked, O(1) update.
#[derive(Default)]
struct RemoteSlots {
    ids: [Option<u16>; 2],
    addrs: [Option<SocketAddr>; 2],
    primary: usize,
    secondary: usize,
}

impl RemoteSlots {
    fn new() -> Self {
        RemoteSlots {
            ids: [None, None],
            addrs: [None, None],
            primary: 0,
            secondary: 1,
        }
    }

    fn live_addrs(&self) -> Vec<SocketAddr> {
        let mut out = Vec::with_capacity(2);
        if let Some(addr) = self.addrs[self.primary] {
            out.push(addr);
        }
        if let Some(addr) = self.addrs[self.secondary] {
            out.push(addr);
        }
        out
    }

    fn set_primary(&mut self, id: u16, addr: SocketAddr) {
        self.ids[self.primary] = Some(id);
        self.addrs[self.primary] = Some(addr);
    }

    fn set_secondary(&mut self, id: u16, addr: SocketAddr) {
        self.ids[self.secondary] = Some(id);
        self.addrs[self.secondary] = Some(addr);
    }

    fn unshare(&mut self) {
        self.ids[self.secondary] = None;
        self.addrs[self.secondary] = None;
    }

    fn promote(&mut self) {
        self.ids[self.primary] = None;
        self.addrs[self.primary] = None;
        std::mem::swap(&mut self.primary, &mut self.secondary);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Stats {
    pub requested: i64,
    pub served: i64,
    pub serving: i32,
    pub time: Instant,
}

/// TCP listener fronting one or two worker remotes. Classifies each
/// forwarded chunk's first bytes to maintain coarse request/response
/// counters and publish a per-request event.
pub struct Server {
    addr: SocketAddr,
    debug: bool,
    no_delay: bool,
    remotes: RwLock<RemoteSlots>,
    active: DashMap<u64, Arc<ForwardConnection>>,
    connid: AtomicU64,
    requested: AtomicI64,
    served: AtomicI64,
    serving: AtomicI32,
    listening: AtomicBool,
    done: Notify,
    serving_feed: FlashChannel<f64>,
    started: Instant,
}

impl Server {
    pub fn new(addr: SocketAddr, debug: bool, no_delay: bool) -> Arc<Self> {
        Arc::new(Server {
            addr,
            debug,
            no_delay,
            remotes: RwLock::new(RemoteSlots::new()),
            active: DashMap::new(),
            connid: AtomicU64::new(0),
            requested: AtomicI64::new(0),
            served: AtomicI64::new(0),
            serving: AtomicI32::new(0),
            listening: AtomicBool::new(false),
            done: Notify::new(),
            serving_feed: FlashChannel::new(),
            started: Instant::now(),
        })
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Publishes one value per served request; consumed by the latency
    /// reporter.
    pub fn serving_feed(&self) -> FlashOut<f64> {
        self.serving_feed.output()
    }

    pub fn primary_addr(&self) -> Option<SocketAddr> {
        let slots = self.remotes.read();
        slots.addrs[slots.primary]
    }

    pub fn secondary_addr(&self) -> Option<SocketAddr> {
        let slots = self.remotes.read();
        slots.addrs[slots.secondary]
    }

    pub fn swap(&self, id: u16, addr: SocketAddr) {
        self.remotes.write().set_primary(id, addr);
    }

    pub fn share(&self, id: u16, addr: SocketAddr) {
        self.remotes.write().set_secondary(id, addr);
    }

    pub fn unshare(&self) {
        self.remotes.write().unshare();
    }

    pub fn promote(&self) {
        self.remotes.write().promote();
    }

    /// Binds the listener and runs the accept loop until `close()` is
    /// called. `on_proxy` fires exactly once, right after the very first
    /// successful bind, so the scheduler can transition LAUNCHING -> READY.
    pub async fn listen_and_proxy(
        self: &Arc<Self>,
        matcher: Arc<dyn Matcher>,
        on_proxy: impl FnOnce() + Send + 'static,
    ) -> Result<(), ProxyError> {
        if self.listening.swap(true, Ordering::SeqCst) {
            return Err(ProxyError::AlreadyListening);
        }
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "proxy listening");
        on_proxy();

        loop {
            tokio::select! {
                _ = self.done.notified() => {
                    return Err(ProxyError::Closed);
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((sock, peer)) => self.spawn_forward(sock, peer, matcher.clone()),
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
            }
        }
    }

    fn spawn_forward(self: &Arc<Self>, sock: TcpStream, peer: SocketAddr, matcher: Arc<dyn Matcher>) {
        let remote_addrs = self.remotes.read().live_addrs();
        if remote_addrs.is_empty() {
            warn!(%peer, "no remote configured, dropping connection");
            return;
        }
        let connid = self.connid.fetch_add(1, Ordering::SeqCst);
        let server = self.clone();
        let no_delay = self.no_delay;
        let debug = self.debug;
        tokio::spawn(async move {
            match forward(sock, &remote_addrs, Some(matcher), None, no_delay, debug).await {
                Ok(fconn) => {
                    server.active.insert(connid, fconn.clone());
                    fconn.closed().await;
                    server.active.remove(&connid);
                }
                Err(e) => warn!(%peer, error = %e, "failed to establish forward connection"),
            }
        });
    }

    pub fn close(&self) {
        self.done.notify_waiters();
        for entry in self.active.iter() {
            entry.value().close();
        }
        self.active.clear();
    }

    pub fn request_stats(&self) -> Stats {
        Stats {
            requested: self.requested.load(Ordering::Relaxed),
            served: self.served.load(Ordering::Relaxed),
            serving: self.serving.load(Ordering::Relaxed),
            time: self.started + self.started.elapsed(),
        }
    }
}

impl RequestStatsSource for Arc<Server> {
    fn request_stats(&self) -> RequestStats {
        let stats = Server::request_stats(self);
        RequestStats {
            requested: stats.requested,
            served: stats.served,
            time: stats.time,
        }
    }
}

/// Classifies each chunk's first four bytes: an HTTP status line marks a
/// response (served), an HTTP verb marks a request (requested). Anything
/// else, or a chunk shorter than four bytes, is left unclassified.
pub struct RequestResponseMatcher {
    server: Arc<Server>,
}

impl RequestResponseMatcher {
    pub fn new(server: Arc<Server>) -> Arc<Self> {
        Arc::new(RequestResponseMatcher { server })
    }
}

impl Matcher for RequestResponseMatcher {
    fn classify(&self, _fconn: &ForwardConnection, islocal: bool, head: &[u8]) {
        if head.len() < 4 {
            return;
        }
        if !islocal {
            if &head[..4] == b"HTTP" {
                self.server.served.fetch_add(1, Ordering::Relaxed);
                self.server.serving.fetch_sub(1, Ordering::Relaxed);
            }
            return;
        }
        match &head[..4] {
            b"GET " | b"POST" | b"PUT " | b"DELE" => {
                let requested = self.server.requested.fetch_add(1, Ordering::Relaxed) + 1;
                self.server.serving.fetch_add(1, Ordering::Relaxed);
                self.server.serving_feed.input().send(requested as f64);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promote_swaps_primary_and_secondary_and_clears_old_primary() {
        let mut slots = RemoteSlots::new();
        let a: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:9002".parse().unwrap();
        slots.set_primary(1, a);
        slots.set_secondary(2, b);
        slots.promote();
        assert_eq!(slots.addrs[slots.primary], Some(b));
        assert_eq!(slots.addrs[slots.secondary], None);
    }

    #[test]
    fn unshare_clears_only_secondary() {
        let mut slots = RemoteSlots::new();
        let a: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:9002".parse().unwrap();
        slots.set_primary(1, a);
        slots.set_secondary(2, b);
        slots.unshare();
        assert_eq!(slots.live_addrs(), vec![a]);
    }

    #[tokio::test]
    async fn accepted_connections_use_the_live_remote_set_atomically() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = Server::new(addr, false, true);
        let a: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        server.swap(1, a);
        assert_eq!(server.primary_addr(), Some(a));
        let b: SocketAddr = "127.0.0.1:9002".parse().unwrap();
        server.share(2, b);
        assert_eq!(server.secondary_addr(), Some(b));
        server.promote();
        assert_eq!(server.primary_addr(), Some(b));
        assert_eq!(server.secondary_addr(), None);
    }
}
