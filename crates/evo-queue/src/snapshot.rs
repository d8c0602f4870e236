//! Time-based cache of the remote queue listing.
//!
//! Hundreds of structures poll against one or a few shared schedulers;
//! the cache bounds remote status queries to roughly one per refresh
//! interval per queue interface. A failed refresh is cached too, so a
//! burst of polls after a transport failure does not hammer the host.
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use evo_core::QueueError;

struct SnapshotState {
    lines: Vec<String>,
    taken_at: Option<Instant>,
    last_error: Option<String>,
}

pub struct SnapshotCache {
    state: RwLock<SnapshotState>,
    interval: Duration,
}

impl SnapshotCache {
    pub fn new(interval: Duration) -> Self {
        SnapshotCache {
            state: RwLock::new(SnapshotState {
                lines: Vec::new(),
                taken_at: None,
                last_error: None,
            }),
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn fresh(&self, state: &SnapshotState) -> bool {
        state
            .taken_at
            .map(|t| t.elapsed() <= self.interval)
            .unwrap_or(false)
    }

    fn cached(state: &SnapshotState) -> Result<Vec<String>, QueueError> {
        match &state.last_error {
            Some(msg) => Err(QueueError::Communication(msg.clone())),
            None => Ok(state.lines.clone()),
        }
    }

    /// Return the snapshot, refreshing through `refresh` when it is stale
    /// or `forced`. Lookups share a read lock; a refresh takes the write
    /// lock for the duration of the remote query. After acquiring the
    /// write lock the freshness is checked again, so two racing callers
    /// trigger a single query.
    pub async fn get<F, Fut>(&self, forced: bool, refresh: F) -> Result<Vec<String>, QueueError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<String>, QueueError>>,
    {
        if !forced {
            let state = self.state.read().await;
            if self.fresh(&state) {
                return Self::cached(&state);
            }
        }

        let mut state = self.state.write().await;
        if !forced && self.fresh(&state) {
            // Another caller refreshed while we waited for the lock.
            return Self::cached(&state);
        }
        match refresh().await {
            Ok(lines) => {
                state.lines = lines.clone();
                state.taken_at = Some(Instant::now());
                state.last_error = None;
                Ok(lines)
            }
            Err(e) => {
                // Keep the stale listing but remember the failure for one
                // interval so every poller sees it without a new query.
                state.taken_at = Some(Instant::now());
                state.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }
}
