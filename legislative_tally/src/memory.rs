//! In-memory collaborators, with failure injection.
//!
//! They back the unit tests and make it possible to embed the tally core
//! without a server.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::time::sleep;
use uuid::Uuid;

use crate::checkpoint::Checkpoint;
use crate::collaborators::*;
use crate::config::*;
use crate::store::SyncMutation;

/// Consumes one injected failure, if any is left.
fn take_failure(failures: &AtomicUsize, service: &str) -> Result<(), CollaboratorError> {
    let took = failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if took {
        debug!("{}: injected failure", service);
        Err(CollaboratorError::unavailable(service, "injected failure"))
    } else {
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
struct RemoteSession {
    descriptor: Option<SessionDescriptor>,
    counts: BTreeMap<SlotKey, u64>,
    applied: HashSet<Uuid>,
    log: Vec<SyncMutation>,
}

/// A remote tally store and status directory kept in memory.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    sessions: Mutex<HashMap<SessionId, RemoteSession>>,
    failures: AtomicUsize,
    latency_ms: AtomicU64,
    status_offline: AtomicBool,
}

impl MemoryRemote {
    pub fn new() -> MemoryRemote {
        MemoryRemote::default()
    }

    pub fn with_session(self, session_id: &SessionId, descriptor: SessionDescriptor) -> Self {
        self.with_sessions(|m| m.entry(session_id.clone()).or_default().descriptor = Some(descriptor));
        self
    }

    fn with_sessions<T>(&self, f: impl FnOnce(&mut HashMap<SessionId, RemoteSession>) -> T) -> T {
        let mut guard = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    /// The next `n` calls fail with `Unavailable`.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// While set, status updates fail with `Unavailable`. Reads still work.
    pub fn set_status_offline(&self, offline: bool) {
        self.status_offline.store(offline, Ordering::SeqCst);
    }

    /// Every count update takes this long.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_counts(&self, session_id: &SessionId, counts: BTreeMap<SlotKey, u64>) {
        self.with_sessions(|m| m.entry(session_id.clone()).or_default().counts = counts);
    }

    pub fn counts(&self, session_id: &SessionId) -> BTreeMap<SlotKey, u64> {
        self.with_sessions(|m| {
            m.get(session_id)
                .map(|s| s.counts.clone())
                .unwrap_or_default()
        })
    }

    /// The count updates applied so far, in application order.
    pub fn applied_log(&self, session_id: &SessionId) -> Vec<SyncMutation> {
        self.with_sessions(|m| m.get(session_id).map(|s| s.log.clone()).unwrap_or_default())
    }

    pub fn status(&self, session_id: &SessionId) -> Option<SessionStatus> {
        self.with_sessions(|m| {
            m.get(session_id)
                .and_then(|s| s.descriptor.as_ref())
                .map(|d| d.status)
        })
    }
}

#[async_trait]
impl RemoteTallyStore for MemoryRemote {
    async fn load_counts(
        &self,
        session_id: &SessionId,
    ) -> Result<BTreeMap<SlotKey, u64>, CollaboratorError> {
        take_failure(&self.failures, "remote tally store")?;
        Ok(self.counts(session_id))
    }

    async fn apply_delta(&self, mutation: &SyncMutation) -> Result<(), CollaboratorError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            sleep(Duration::from_millis(latency)).await;
        }
        take_failure(&self.failures, "remote tally store")?;
        self.with_sessions(|m| {
            let s = m.entry(mutation.session_id.clone()).or_default();
            if !s.applied.insert(mutation.id) {
                debug!("apply_delta: {} already applied", mutation.id);
                return;
            }
            let v = s.counts.entry(mutation.key.clone()).or_insert(0);
            *v = v.saturating_add_signed(mutation.delta);
            if *v == 0 {
                s.counts.remove(&mutation.key);
            }
            s.log.push(mutation.clone());
        });
        Ok(())
    }
}

#[async_trait]
impl StatusQuery for MemoryRemote {
    async fn get_status(
        &self,
        session_id: &SessionId,
    ) -> Result<SessionDescriptor, CollaboratorError> {
        take_failure(&self.failures, "status query")?;
        self.with_sessions(|m| m.get(session_id).and_then(|s| s.descriptor.clone()))
            .ok_or_else(|| {
                CollaboratorError::rejected("status query", format!("unknown session {}", session_id))
            })
    }

    async fn update_status(
        &self,
        session_id: &SessionId,
        status: SessionStatus,
    ) -> Result<(), CollaboratorError> {
        take_failure(&self.failures, "status query")?;
        if self.status_offline.load(Ordering::SeqCst) {
            return Err(CollaboratorError::unavailable("status query", "offline"));
        }
        self.with_sessions(|m| match m.get_mut(session_id).and_then(|s| s.descriptor.as_mut()) {
            Some(d) => {
                d.status = status;
                Ok(())
            }
            None => Err(CollaboratorError::rejected(
                "status query",
                format!("unknown session {}", session_id),
            )),
        })
    }
}

/// Keeps every submitted checkpoint.
#[derive(Debug, Default)]
pub struct MemoryCheckpointTransport {
    received: Mutex<Vec<(SessionId, Checkpoint)>>,
    failures: AtomicUsize,
}

impl MemoryCheckpointTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn received(&self) -> Vec<(SessionId, Checkpoint)> {
        self.received
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl CheckpointTransport for MemoryCheckpointTransport {
    async fn submit_checkpoint(
        &self,
        session_id: &SessionId,
        checkpoint: &Checkpoint,
    ) -> Result<(), CollaboratorError> {
        take_failure(&self.failures, "checkpoint transport")?;
        self.received
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((session_id.clone(), checkpoint.clone()));
        Ok(())
    }
}

/// Stores photos in memory under `mem://` references.
#[derive(Debug, Default)]
pub struct MemoryEvidenceStore {
    blobs: Mutex<Vec<Vec<u8>>>,
    failures: AtomicUsize,
}

impl MemoryEvidenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn stored(&self) -> usize {
        self.blobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[async_trait]
impl EvidenceStore for MemoryEvidenceStore {
    async fn upload(&self, session_id: &SessionId, blob: &[u8]) -> Result<String, CollaboratorError> {
        take_failure(&self.failures, "evidence store")?;
        let mut blobs = self
            .blobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        blobs.push(blob.to_vec());
        Ok(format!("mem://{}/evidence-{}", session_id, blobs.len()))
    }
}

#[derive(Debug, Default)]
pub struct MemorySubmitter {
    submitted: Mutex<Vec<FinalTally>>,
    failures: AtomicUsize,
}

impl MemorySubmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn submitted(&self) -> Vec<FinalTally> {
        self.submitted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl TallySubmitter for MemorySubmitter {
    async fn submit_final(&self, tally: &FinalTally) -> Result<(), CollaboratorError> {
        take_failure(&self.failures, "tally submitter")?;
        self.submitted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tally.clone());
        Ok(())
    }
}

/// Answers with a fixed position (or none) after an optional delay.
#[derive(Debug, Clone, Default)]
pub struct StaticGeolocator {
    pub fix: Option<GpsFix>,
    pub delay: Duration,
}

impl StaticGeolocator {
    pub fn at(fix: GpsFix) -> Self {
        StaticGeolocator {
            fix: Some(fix),
            delay: Duration::ZERO,
        }
    }

    pub fn unavailable() -> Self {
        StaticGeolocator::default()
    }
}

#[async_trait]
impl Geolocator for StaticGeolocator {
    async fn current_position(&self, _high_accuracy: bool) -> Result<GpsFix, CollaboratorError> {
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        self.fix
            .ok_or_else(|| CollaboratorError::unavailable("geolocation", "no position fix"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_delivery_is_applied_once() {
        let remote = MemoryRemote::new();
        let m = SyncMutation {
            id: Uuid::new_v4(),
            session_id: "esc-1".into(),
            key: SlotKey::new("pdc", 1),
            delta: 1,
        };
        remote.apply_delta(&m).await.unwrap();
        remote.apply_delta(&m).await.unwrap();
        assert_eq!(
            remote.counts(&"esc-1".into()).get(&SlotKey::new("pdc", 1)),
            Some(&1)
        );
    }

    #[tokio::test]
    async fn injected_failures_run_out() {
        let submitter = MemorySubmitter::new();
        submitter.fail_next(1);
        let tally = FinalTally {
            session_id: "esc-1".into(),
            counts: BTreeMap::new(),
            party_totals: BTreeMap::new(),
            papeletas_closed: 0,
            papeletas_annulled: 0,
            completed_ballots: 0,
            evidence_url: None,
            finalized_by: "ana".to_string(),
            finalized_at: chrono::Utc::now(),
        };
        assert!(submitter.submit_final(&tally).await.is_err());
        assert!(submitter.submit_final(&tally).await.is_ok());
        assert_eq!(submitter.submitted().len(), 1);
    }
}
