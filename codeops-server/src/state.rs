//! Shared application state for the HTTP server.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use codeops::observability::Snapshot;
use codeops::runtime::Runtime;
use tokio::sync::broadcast;

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<Runtime>,
    /// Set while a pipeline run is in flight.
    busy: Arc<AtomicBool>,
    /// Tracker snapshots, sent whenever the snapshot changes.
    pub snapshot_tx: Arc<broadcast::Sender<Snapshot>>,
}

impl AppState {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        let (snapshot_tx, _) = broadcast::channel(64);
        Self {
            runtime,
            busy: Arc::new(AtomicBool::new(false)),
            snapshot_tx: Arc::new(snapshot_tx),
        }
    }

    /// Claim the single run slot. `None` if a run is already active.
    pub fn try_start_run(&self) -> Option<RunGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard {
                busy: Arc::clone(&self.busy),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Releases the run slot when dropped.
pub struct RunGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}
