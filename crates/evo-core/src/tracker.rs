//! Structure registry and the per-structure pass exclusion token.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use evo_domain::{JobState, Structure};

/// Shared handle to one tracked structure.
///
/// The `in_flight` token enforces the invariant that a structure is never
/// advanced by two scheduling passes concurrently: a pass must win
/// `try_begin_pass` before touching job-state fields and call `end_pass`
/// when done.
pub struct StructureHandle {
    id: Uuid,
    data: RwLock<Structure>,
    in_flight: AtomicBool,
}

impl StructureHandle {
    pub fn new(structure: Structure) -> Arc<Self> {
        Arc::new(StructureHandle {
            id: structure.id,
            data: RwLock::new(structure),
            in_flight: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, Structure> {
        self.data.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, Structure> {
        self.data.write().await
    }

    pub async fn state(&self) -> JobState {
        self.data.read().await.state
    }

    pub async fn tag(&self) -> String {
        self.data.read().await.tag()
    }

    /// Claim this structure for one scheduling pass. Returns false if
    /// another pass currently holds it.
    pub fn try_begin_pass(&self) -> bool {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_pass(&self) {
        self.in_flight.store(false, Ordering::Release);
    }
}

/// Registry of all structures currently under the scheduler's care.
#[derive(Default)]
pub struct Tracker {
    inner: DashMap<Uuid, Arc<StructureHandle>>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, structure: Structure) -> Arc<StructureHandle> {
        let handle = StructureHandle::new(structure);
        self.inner.insert(handle.id(), handle.clone());
        handle
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<StructureHandle>> {
        self.inner.get(&id).map(|e| e.value().clone())
    }

    pub fn remove(&self, id: Uuid) -> Option<Arc<StructureHandle>> {
        self.inner.remove(&id).map(|(_, h)| h)
    }

    pub fn handles(&self) -> Vec<Arc<StructureHandle>> {
        self.inner.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evo_domain::Composition;
    use std::path::PathBuf;

    fn handle() -> Arc<StructureHandle> {
        let s = Structure::new(
            0,
            1,
            Composition::from_pairs(&[("H", 2)]),
            vec!["H".into(), "H".into()],
            vec![[0.0; 3], [0.74, 0.0, 0.0]],
            None,
            PathBuf::from("/tmp/evoflow-test/0x1"),
        )
        .unwrap();
        StructureHandle::new(s)
    }

    #[test]
    fn pass_token_is_exclusive() {
        let h = handle();
        assert!(h.try_begin_pass());
        assert!(!h.try_begin_pass());
        h.end_pass();
        assert!(h.try_begin_pass());
    }

    #[tokio::test]
    async fn tracker_round_trip() {
        let tracker = Tracker::new();
        let h = handle();
        let id = h.id();
        tracker.inner.insert(id, h);
        assert_eq!(tracker.len(), 1);
        assert!(tracker.get(id).is_some());
        assert!(tracker.remove(id).is_some());
        assert!(tracker.is_empty());
    }
}
