//! Process-local admin context, shared by every handler.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::scheduler::Scheduler;

pub struct AdminState {
    pub scheduler: Arc<Scheduler>,
    accepting: AtomicBool,
    lock_path: PathBuf,
}

impl AdminState {
    pub fn new(scheduler: Arc<Scheduler>, lock_path: PathBuf) -> Arc<Self> {
        Arc::new(AdminState {
            scheduler,
            accepting: AtomicBool::new(true),
            lock_path,
        })
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn lock_path(&self) -> &std::path::Path {
        &self.lock_path
    }

    /// Health is 200 only while both accepting traffic and the lock file is
    /// still present; `SIGTERM` handling removes the lock file first so
    /// outer liveness probes fail before the server actually stops.
    pub fn is_healthy(&self) -> bool {
        self.is_accepting() && self.lock_path.exists()
    }
}
