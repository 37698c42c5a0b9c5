//! The per-slot vote counters of one session.
//!
//! Every mutation is applied to memory first and then handed to a background
//! worker that replays it against the [`RemoteTallyStore`]. The worker drains a
//! single FIFO queue, so the remote observes the updates of a given slot in the
//! order in which they were issued. Pausing the sync only stops the worker; the
//! queue keeps accepting updates.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

use crate::collaborators::RemoteTallyStore;
use crate::config::*;
use crate::retry::RetryPolicy;

/// One count update, as sent to the remote store.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMutation {
    /// Idempotency key.
    pub id: Uuid,
    pub session_id: SessionId,
    pub key: SlotKey,
    /// +1 or -1
    pub delta: i64,
}

#[derive(Eq, PartialEq, Debug, Clone, Copy, Default)]
pub struct SyncStatus {
    pub paused: bool,
    pub in_flight: bool,
    /// Mutations not yet acknowledged by the remote, including the one in flight.
    pub queued: usize,
}

#[derive(Debug, Default)]
struct Counters {
    session_id: Option<SessionId>,
    counts: BTreeMap<SlotKey, u64>,
    // Issue order.
    unacked: Vec<SyncMutation>,
}

impl Counters {
    fn shift(&mut self, key: &SlotKey, delta: i64) -> Option<u64> {
        let current = self.counts.get(key).copied().unwrap_or(0);
        let next = current.checked_add_signed(delta)?;
        if next == 0 {
            self.counts.remove(key);
        } else {
            self.counts.insert(key.clone(), next);
        }
        Some(next)
    }
}

fn lock(counters: &Mutex<Counters>) -> MutexGuard<'_, Counters> {
    counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct VoteCountStore {
    counters: Arc<Mutex<Counters>>,
    remote: Arc<dyn RemoteTallyStore>,
    queue: mpsc::UnboundedSender<SyncMutation>,
    status: Arc<watch::Sender<SyncStatus>>,
    worker: Option<JoinHandle<()>>,
    retry: RetryPolicy,
    drain_delay: Duration,
}

impl VoteCountStore {
    /// Creates an empty store and starts its sync worker on the current tokio runtime.
    pub fn spawn(
        remote: Arc<dyn RemoteTallyStore>,
        retry: RetryPolicy,
        drain_delay: Duration,
    ) -> VoteCountStore {
        let counters = Arc::new(Mutex::new(Counters::default()));
        let (queue, rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(SyncStatus::default());
        let status = Arc::new(status_tx);
        let worker = tokio::spawn(run_sync_worker(
            rx,
            remote.clone(),
            counters.clone(),
            status.clone(),
            retry.clone(),
        ));
        VoteCountStore {
            counters,
            remote,
            queue,
            status,
            worker: Some(worker),
            retry,
            drain_delay,
        }
    }

    pub fn session_id(&self) -> Option<SessionId> {
        lock(&self.counters).session_id.clone()
    }

    /// Binds the store to a session. Counters are cleared when the session changes.
    pub fn bind(&self, session_id: &SessionId) {
        let mut c = lock(&self.counters);
        if c.session_id.as_ref() != Some(session_id) {
            if let Some(previous) = c.session_id.as_ref() {
                info!(
                    "bind: switching from session {} to {}, clearing {} counters",
                    previous,
                    session_id,
                    c.counts.len()
                );
            }
            c.counts.clear();
            c.session_id = Some(session_id.clone());
        }
    }

    /// Replaces the local counters with the remote ones.
    ///
    /// Updates that the remote has not acknowledged yet are applied again on top
    /// of the loaded values.
    pub async fn load_from_remote(&self, session_id: &SessionId) -> TallyResult<()> {
        self.bind(session_id);
        // Keep acknowledgements from racing with the fetch.
        let was_paused = self.status.borrow().paused;
        self.pause_sync();
        if !self.settle(self.drain_delay).await {
            warn!(
                "load_from_remote: an update is still in flight after {:?}",
                self.drain_delay
            );
        }
        let loaded = self
            .retry
            .call("load_counts", || self.remote.load_counts(session_id))
            .await;
        if !was_paused {
            self.resume_sync();
        }
        let remote_counts = loaded.context(CollaboratorSnafu {
            operation: "load_counts",
        })?;

        let mut c = lock(&self.counters);
        c.counts = remote_counts.into_iter().filter(|(_, v)| *v > 0).collect();
        let replay: Vec<(SlotKey, i64)> = c
            .unacked
            .iter()
            .filter(|m| &m.session_id == session_id)
            .map(|m| (m.key.clone(), m.delta))
            .collect();
        for (key, delta) in replay.iter() {
            if c.shift(key, *delta).is_none() {
                warn!("load_from_remote: pending {:+} on {} floored at 0", delta, key);
            }
        }
        info!(
            "load_from_remote: session {}: {} counters loaded, {} pending updates replayed",
            session_id,
            c.counts.len(),
            replay.len()
        );
        Ok(())
    }

    pub fn increment(&self, key: &SlotKey) -> TallyResult<u64> {
        self.apply_all(&[(key.clone(), 1)])
            .map(|v| v.first().copied().unwrap_or_default())
    }

    /// Decrements a counter. Decrementing a zero counter does nothing.
    pub fn decrement(&self, key: &SlotKey) -> TallyResult<u64> {
        self.apply_all(&[(key.clone(), -1)])
            .map(|v| v.first().copied().unwrap_or_default())
    }

    /// Decrements every key as one unit.
    pub fn revert_all(&self, keys: &[SlotKey]) -> TallyResult<()> {
        let changes: Vec<(SlotKey, i64)> = keys.iter().map(|k| (k.clone(), -1)).collect();
        self.apply_all(&changes).map(|_| ())
    }

    fn apply_all(&self, changes: &[(SlotKey, i64)]) -> TallyResult<Vec<u64>> {
        ensure!(!self.queue.is_closed(), SyncWorkerStoppedSnafu);
        let mut c = lock(&self.counters);
        let session_id = c.session_id.clone().context(StoreUnboundSnafu)?;
        let mut values: Vec<u64> = Vec::with_capacity(changes.len());
        for (key, delta) in changes.iter() {
            match c.shift(key, *delta) {
                None => {
                    debug!("apply: {} already at 0, ignoring {:+}", key, delta);
                    values.push(0);
                }
                Some(v) => {
                    let m = SyncMutation {
                        id: Uuid::new_v4(),
                        session_id: session_id.clone(),
                        key: key.clone(),
                        delta: *delta,
                    };
                    debug!("apply: {} {:+} -> {} ({})", key, delta, v, m.id);
                    c.unacked.push(m.clone());
                    self.status.send_modify(|s| s.queued += 1);
                    if self.queue.send(m).is_err() {
                        // The worker is gone: the update stays local and pending.
                        error!("apply: sync queue closed while sending {} {:+}", key, delta);
                    }
                    values.push(v);
                }
            }
        }
        Ok(values)
    }

    /// Re-enqueues updates restored from local persistence.
    ///
    /// The counters are not touched: the next [`load_from_remote`] accounts for them.
    ///
    /// [`load_from_remote`]: VoteCountStore::load_from_remote
    pub fn requeue(&self, mutations: Vec<SyncMutation>) -> TallyResult<()> {
        ensure!(!self.queue.is_closed(), SyncWorkerStoppedSnafu);
        let mut c = lock(&self.counters);
        for m in mutations {
            if c.unacked.iter().any(|u| u.id == m.id) {
                continue;
            }
            c.unacked.push(m.clone());
            self.status.send_modify(|s| s.queued += 1);
            if self.queue.send(m).is_err() {
                error!("requeue: sync queue closed");
            }
        }
        Ok(())
    }

    pub fn get_count(&self, key: &SlotKey) -> u64 {
        lock(&self.counters).counts.get(key).copied().unwrap_or(0)
    }

    pub fn get_party_total(&self, party: &PartyId) -> u64 {
        lock(&self.counters)
            .counts
            .iter()
            .filter(|(k, _)| &k.party == party)
            .map(|(_, v)| *v)
            .sum()
    }

    /// A copy of all non-zero counters.
    pub fn get_counts(&self) -> BTreeMap<SlotKey, u64> {
        lock(&self.counters).counts.clone()
    }

    /// The updates not acknowledged by the remote yet, in issue order.
    pub fn pending(&self) -> Vec<SyncMutation> {
        lock(&self.counters).unacked.clone()
    }

    pub fn sync_status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    pub fn pause_sync(&self) {
        self.status.send_modify(|s| s.paused = true);
    }

    pub fn resume_sync(&self) {
        self.status.send_modify(|s| s.paused = false);
    }

    /// Waits until no update is in flight. Returns false if `max_wait` elapsed first.
    pub async fn settle(&self, max_wait: Duration) -> bool {
        let mut rx = self.status.subscribe();
        let settled = matches!(
            timeout(max_wait, rx.wait_for(|s| !s.in_flight)).await,
            Ok(Ok(_))
        );
        settled
    }

    /// Waits until the remote has acknowledged every update.
    pub async fn flush(&self, max_wait: Duration) -> TallyResult<()> {
        let mut rx = self.status.subscribe();
        let flushed = matches!(
            timeout(max_wait, rx.wait_for(|s| s.queued == 0)).await,
            Ok(Ok(_))
        );
        ensure!(
            flushed,
            SyncFailureSnafu {
                pending: self.sync_status().queued,
                waited: max_wait,
            }
        );
        Ok(())
    }

    /// Stops the worker after letting it drain for up to `grace`.
    ///
    /// Returns the updates that were never acknowledged.
    pub async fn shutdown(mut self, grace: Duration) -> Vec<SyncMutation> {
        let worker = self.worker.take();
        let counters = self.counters.clone();
        // Dropping the store unpauses the worker and closes the queue.
        drop(self);
        if let Some(mut handle) = worker {
            if timeout(grace, &mut handle).await.is_err() {
                handle.abort();
            }
        }
        let left = lock(&counters).unacked.clone();
        if !left.is_empty() {
            warn!("shutdown: {} updates were not synchronized", left.len());
        }
        left
    }
}

impl Drop for VoteCountStore {
    fn drop(&mut self) {
        self.status.send_modify(|s| s.paused = false);
    }
}

async fn run_sync_worker(
    mut rx: mpsc::UnboundedReceiver<SyncMutation>,
    remote: Arc<dyn RemoteTallyStore>,
    counters: Arc<Mutex<Counters>>,
    status: Arc<watch::Sender<SyncStatus>>,
    retry: RetryPolicy,
) {
    let mut gate = status.subscribe();
    while let Some(m) = rx.recv().await {
        // Wait for the gate and mark the update in flight in one step, so that a
        // pause never observes a half-started update.
        loop {
            let open = gate.wait_for(|s| !s.paused).await.is_ok();
            if !open {
                return;
            }
            let entered = status.send_if_modified(|s| {
                if s.paused {
                    false
                } else {
                    s.in_flight = true;
                    true
                }
            });
            if entered {
                break;
            }
        }
        let what = format!("apply_delta {} {:+}", m.key, m.delta);
        retry
            .call_until_acknowledged(&what, || remote.apply_delta(&m))
            .await;
        lock(&counters).unacked.retain(|u| u.id != m.id);
        status.send_modify(|s| {
            s.in_flight = false;
            s.queued = s.queued.saturating_sub(1);
        });
        debug!("sync worker: acknowledged {} ({})", what, m.id);
    }
    debug!("sync worker: queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRemote;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            initial: Duration::from_millis(10),
            ceiling: Duration::from_millis(40),
            jitter: 0.0,
        }
    }

    fn store_with(remote: &Arc<MemoryRemote>) -> VoteCountStore {
        VoteCountStore::spawn(remote.clone(), policy(), Duration::from_millis(200))
    }

    fn sid(s: &str) -> SessionId {
        SessionId::new(s)
    }

    #[tokio::test]
    async fn counts_apply_locally_and_reach_the_remote() {
        let remote = Arc::new(MemoryRemote::new());
        let store = store_with(&remote);
        store.load_from_remote(&sid("esc-1")).await.unwrap();
        let pdc1 = SlotKey::new("pdc", 1);
        let pdc2 = SlotKey::new("pdc", 2);
        assert_eq!(store.increment(&pdc1).unwrap(), 1);
        assert_eq!(store.increment(&pdc1).unwrap(), 2);
        assert_eq!(store.increment(&pdc2).unwrap(), 1);
        assert_eq!(store.decrement(&pdc1).unwrap(), 1);
        assert_eq!(store.get_count(&pdc1), 1);
        assert_eq!(store.get_party_total(&"pdc".into()), 2);
        assert_eq!(store.get_party_total(&"libre".into()), 0);

        store.flush(Duration::from_secs(5)).await.unwrap();
        assert_eq!(remote.counts(&sid("esc-1")), store.get_counts());
        assert!(store.pending().is_empty());
    }

    #[tokio::test]
    async fn decrement_at_zero_is_a_no_op() {
        let remote = Arc::new(MemoryRemote::new());
        let store = store_with(&remote);
        store.bind(&sid("esc-1"));
        let k = SlotKey::new("libre", 9);
        assert_eq!(store.decrement(&k).unwrap(), 0);
        assert_eq!(store.get_count(&k), 0);
        assert!(store.pending().is_empty());
        assert_eq!(store.sync_status().queued, 0);
    }

    #[tokio::test]
    async fn unbound_store_rejects_updates() {
        let remote = Arc::new(MemoryRemote::new());
        let store = store_with(&remote);
        assert!(matches!(
            store.increment(&SlotKey::new("pdc", 1)),
            Err(TallyError::StoreUnbound {})
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_remote_is_retried_and_applied_once() {
        let remote = Arc::new(MemoryRemote::new());
        remote.fail_next(7);
        let store = store_with(&remote);
        store.bind(&sid("esc-1"));
        store.increment(&SlotKey::new("pdc", 1)).unwrap();
        store.flush(Duration::from_secs(60)).await.unwrap();
        assert_eq!(remote.counts(&sid("esc-1")).get(&SlotKey::new("pdc", 1)), Some(&1));
        assert_eq!(remote.applied_log(&sid("esc-1")).len(), 1);
    }

    #[tokio::test]
    async fn paused_sync_holds_updates_back() {
        let remote = Arc::new(MemoryRemote::new());
        let store = store_with(&remote);
        store.bind(&sid("esc-1"));
        store.pause_sync();
        store.increment(&SlotKey::new("pdc", 1)).unwrap();
        assert!(store.flush(Duration::from_millis(100)).await.is_err());
        assert!(remote.counts(&sid("esc-1")).is_empty());
        assert_eq!(store.get_count(&SlotKey::new("pdc", 1)), 1);

        store.resume_sync();
        store.flush(Duration::from_secs(5)).await.unwrap();
        assert_eq!(remote.counts(&sid("esc-1")), store.get_counts());
    }

    #[tokio::test]
    async fn per_key_order_is_preserved() {
        let remote = Arc::new(MemoryRemote::new());
        remote.set_latency(Duration::from_millis(5));
        let store = store_with(&remote);
        store.bind(&sid("esc-1"));
        let k = SlotKey::new("pdc", 3);
        store.increment(&k).unwrap();
        store.decrement(&k).unwrap();
        store.increment(&k).unwrap();
        store.flush(Duration::from_secs(5)).await.unwrap();
        let deltas: Vec<i64> = remote
            .applied_log(&sid("esc-1"))
            .iter()
            .filter(|m| m.key == k)
            .map(|m| m.delta)
            .collect();
        assert_eq!(deltas, vec![1, -1, 1]);
    }

    #[tokio::test]
    async fn session_switch_clears_but_reload_does_not() {
        let remote = Arc::new(MemoryRemote::new());
        let store = store_with(&remote);
        let k = SlotKey::new("pdc", 1);
        store.load_from_remote(&sid("esc-1")).await.unwrap();
        store.increment(&k).unwrap();
        store.flush(Duration::from_secs(5)).await.unwrap();

        store.load_from_remote(&sid("esc-1")).await.unwrap();
        assert_eq!(store.get_count(&k), 1);

        store.load_from_remote(&sid("esc-2")).await.unwrap();
        assert_eq!(store.get_count(&k), 0);
        assert_eq!(store.session_id(), Some(sid("esc-2")));
    }

    #[tokio::test]
    async fn remote_load_keeps_unacknowledged_updates() {
        let remote = Arc::new(MemoryRemote::new());
        let mut seeded = BTreeMap::new();
        seeded.insert(SlotKey::new("libre", 9), 4);
        remote.set_counts(&sid("esc-1"), seeded);
        let store = store_with(&remote);
        store.bind(&sid("esc-1"));
        store.pause_sync();
        store.increment(&SlotKey::new("pdc", 1)).unwrap();

        store.load_from_remote(&sid("esc-1")).await.unwrap();
        assert_eq!(store.get_count(&SlotKey::new("libre", 9)), 4);
        assert_eq!(store.get_count(&SlotKey::new("pdc", 1)), 1);
        // Still paused: the load restores the previous gate.
        assert!(store.sync_status().paused);
    }

    #[tokio::test]
    async fn shutdown_returns_what_never_reached_the_remote() {
        let remote = Arc::new(MemoryRemote::new());
        let store = store_with(&remote);
        store.bind(&sid("esc-1"));
        store.pause_sync();
        remote.fail_next(usize::MAX);
        store.increment(&SlotKey::new("pdc", 1)).unwrap();
        store.increment(&SlotKey::new("pdc", 2)).unwrap();
        let left = store.shutdown(Duration::from_millis(50)).await;
        assert_eq!(left.len(), 2);
        assert_eq!(left[0].key, SlotKey::new("pdc", 1));
        assert_eq!(left[1].delta, 1);
    }

    #[tokio::test]
    async fn requeued_updates_are_replayed_once() {
        let remote = Arc::new(MemoryRemote::new());
        let first = store_with(&remote);
        first.bind(&sid("esc-1"));
        first.pause_sync();
        first.increment(&SlotKey::new("pdc", 1)).unwrap();
        let pending = first.pending();
        drop(first.shutdown(Duration::from_millis(0)).await);

        let second = store_with(&remote);
        second.requeue(pending.clone()).unwrap();
        second.requeue(pending).unwrap();
        second.load_from_remote(&sid("esc-1")).await.unwrap();
        second.flush(Duration::from_secs(5)).await.unwrap();
        assert_eq!(second.get_count(&SlotKey::new("pdc", 1)), 1);
        assert_eq!(remote.counts(&sid("esc-1")).get(&SlotKey::new("pdc", 1)), Some(&1));
    }
}
