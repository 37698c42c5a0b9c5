//! The tally session of one polling station.
//!
//! [`EscrutinioSession`] owns the slot layout, the ballot buffer, the count
//! store and the checkpoint log of a session, and enforces its lifecycle:
//!
//! ```text
//! PENDING --first mark / start--> IN_PROGRESS --freeze--> CLOSED --finalize--> COMPLETED
//!                                      ^                    |  ^                   |
//!                                      +------unfreeze------+  +------reopen-------+
//! ```
//!
//! Local state is saved after every change so that a reload of the same
//! session resumes where it stopped.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use snafu::prelude::*;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::allocation::SlotLayout;
use crate::ballot::{BallotBuffer, Papeleta};
use crate::checkpoint::{Checkpoint, CheckpointRecorder};
use crate::collaborators::*;
use crate::config::*;
use crate::persistence::{LocalPersistence, SavedState};
use crate::retry::RetryPolicy;
use crate::store::{SyncMutation, SyncStatus, VoteCountStore};

/// Everything a session talks to.
pub(crate) struct Collaborators {
    pub(crate) remote: Arc<dyn RemoteTallyStore>,
    pub(crate) status: Arc<dyn StatusQuery>,
    pub(crate) checkpoints: Arc<dyn CheckpointTransport>,
    pub(crate) evidence: Arc<dyn EvidenceStore>,
    pub(crate) submitter: Arc<dyn TallySubmitter>,
    pub(crate) geolocator: Arc<dyn Geolocator>,
    pub(crate) persistence: Arc<dyn LocalPersistence>,
}

pub struct EscrutinioSession {
    session_id: SessionId,
    status: SessionStatus,
    layout: SlotLayout,
    store: VoteCountStore,
    buffer: BallotBuffer,
    recorder: CheckpointRecorder,
    expanded_party: Option<PartyId>,
    final_tally: Option<FinalTally>,
    evidence: Arc<dyn EvidenceStore>,
    submitter: Arc<dyn TallySubmitter>,
    persistence: Arc<dyn LocalPersistence>,
    settings: SessionSettings,
    // Latest status wanted remotely, and latest one acknowledged.
    desired: watch::Sender<SessionStatus>,
    published: Arc<watch::Sender<SessionStatus>>,
    publisher: JoinHandle<()>,
}

impl EscrutinioSession {
    pub(crate) async fn open(
        session_id: SessionId,
        collaborators: Collaborators,
        settings: SessionSettings,
    ) -> TallyResult<EscrutinioSession> {
        let Collaborators {
            remote,
            status,
            checkpoints,
            evidence,
            submitter,
            geolocator,
            persistence,
        } = collaborators;
        let descriptor = settings
            .retry
            .call("get_status", || status.get_status(&session_id))
            .await
            .context(CollaboratorSnafu {
                operation: "get_status",
            })?;
        let layout = SlotLayout::new(descriptor.seat_count, &descriptor.parties)?;

        let saved = match persistence.restore(&session_id) {
            Ok(saved) => saved,
            Err(e @ TallyError::PersistenceFormat { .. })
            | Err(e @ TallyError::UnsupportedRecordVersion { .. }) => {
                warn!(
                    "open: ignoring unreadable local state of session {}: {}",
                    session_id, e
                );
                None
            }
            Err(e) => return Err(e),
        };

        let saved_status = saved.as_ref().and_then(|s| s.status);
        let store = VoteCountStore::spawn(remote, settings.retry.clone(), settings.drain_delay);
        store.bind(&session_id);
        if let Some(s) = saved.as_ref() {
            store.requeue(s.pending_sync.clone())?;
        }
        store.load_from_remote(&session_id).await?;

        let mut recorder = CheckpointRecorder::new(
            session_id.clone(),
            checkpoints,
            geolocator,
            settings.geolocation_timeout,
            settings.retry.clone(),
        );
        let (buffer, expanded_party) = match saved {
            Some(s) => {
                let marks: Vec<SlotKey> = s
                    .buffer_marks
                    .into_iter()
                    .filter(|k| match layout.validate(k) {
                        Ok(()) => true,
                        Err(e) => {
                            warn!("open: dropping restored mark {}: {}", k, e);
                            false
                        }
                    })
                    .collect();
                info!(
                    "open: session {} resumes at papeleta {} with {} marks",
                    session_id,
                    s.current_papeleta,
                    marks.len()
                );
                recorder = recorder.with_log(s.checkpoints);
                let buffer = BallotBuffer::restore(
                    layout.seat_count(),
                    s.current_papeleta,
                    marks,
                    s.completed_count,
                    s.annulled_count,
                );
                (buffer, s.expanded_party)
            }
            None => (BallotBuffer::new(layout.seat_count()), None),
        };
        let resumed = resume_status(
            descriptor.status,
            saved_status,
            recorder.last().map(|cp| cp.action),
        );

        let (desired, desired_rx) = watch::channel(descriptor.status);
        let published = Arc::new(watch::channel(descriptor.status).0);
        let publisher = tokio::spawn(run_status_publisher(
            session_id.clone(),
            status,
            desired_rx,
            published.clone(),
            settings.retry.clone(),
        ));
        if resumed != descriptor.status {
            info!(
                "open: session {} resumes as {}, publishing over {}",
                session_id, resumed, descriptor.status
            );
            desired.send_replace(resumed);
        }

        info!(
            "open: session {} is {} ({} seats, {} parties)",
            session_id,
            resumed,
            layout.seat_count(),
            layout.ranges().len()
        );
        let session = EscrutinioSession {
            session_id,
            status: resumed,
            layout,
            store,
            buffer,
            recorder,
            expanded_party,
            final_tally: None,
            evidence,
            submitter,
            persistence,
            settings,
            desired,
            published,
            publisher,
        };
        session.autosave();
        Ok(session)
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn layout(&self) -> &SlotLayout {
        &self.layout
    }

    pub fn current_papeleta(&self) -> &Papeleta {
        self.buffer.current()
    }

    pub fn completed_count(&self) -> u32 {
        self.buffer.completed_count()
    }

    /// Papeletas closed so far, complete or not.
    pub fn closed_count(&self) -> u32 {
        self.buffer.closed_count()
    }

    pub fn annulled_count(&self) -> u32 {
        self.buffer.annulled_count()
    }

    pub fn get_count(&self, key: &SlotKey) -> u64 {
        self.store.get_count(key)
    }

    pub fn get_counts(&self) -> BTreeMap<SlotKey, u64> {
        self.store.get_counts()
    }

    /// Totals of every contesting party, including those without votes.
    pub fn party_totals(&self) -> BTreeMap<PartyId, u64> {
        self.layout
            .parties()
            .map(|p| (p.clone(), self.store.get_party_total(p)))
            .collect()
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        self.recorder.log()
    }

    pub fn expanded_party(&self) -> Option<&PartyId> {
        self.expanded_party.as_ref()
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.store.sync_status()
    }

    pub fn pending_sync(&self) -> Vec<SyncMutation> {
        self.store.pending()
    }

    /// The tally handed over by the last successful finalize.
    pub fn final_tally(&self) -> Option<&FinalTally> {
        self.final_tally.as_ref()
    }

    /// Remembers which party block the transcriber has open.
    pub fn set_expanded_party(&mut self, party: Option<PartyId>) -> TallyResult<()> {
        if let Some(p) = party.as_ref() {
            ensure!(
                self.layout.range_of(p).is_some(),
                UnknownPartySnafu { party: p.clone() }
            );
        }
        self.expanded_party = party;
        self.autosave();
        Ok(())
    }

    fn ensure_editable(&self, operation: &'static str) -> TallyResult<()> {
        if !self.status.is_editable() {
            error!(
                "session {}: cannot {} while {}",
                self.session_id, operation, self.status
            );
            return SessionLockedSnafu {
                status: self.status,
                operation,
            }
            .fail();
        }
        Ok(())
    }

    fn ensure_transition(&self, to: SessionStatus) -> TallyResult<()> {
        if !self.status.can_transition_to(to) {
            error!(
                "session {}: refusing transition {} -> {}",
                self.session_id, self.status, to
            );
            return InvalidTransitionSnafu {
                from: self.status,
                to,
            }
            .fail();
        }
        Ok(())
    }

    fn enter(&mut self, to: SessionStatus) -> TallyResult<()> {
        self.ensure_transition(to)?;
        info!("session {}: {} -> {}", self.session_id, self.status, to);
        self.status = to;
        self.desired.send_replace(to);
        Ok(())
    }

    /// Starts counting without waiting for the first mark.
    pub fn start(&mut self) -> TallyResult<()> {
        self.enter(SessionStatus::InProgress)?;
        self.autosave();
        Ok(())
    }

    /// Toggles a slot on the open papeleta.
    ///
    /// The first accepted mark of a PENDING session moves it to IN_PROGRESS.
    pub fn toggle_mark(&mut self, key: &SlotKey) -> TallyResult<MarkOutcome> {
        self.ensure_editable("mark a slot")?;
        self.layout.validate(key)?;
        let outcome = self.buffer.toggle_mark(key, &self.store)?;
        if self.status == SessionStatus::Pending {
            self.enter(SessionStatus::InProgress)?;
        }
        self.autosave();
        Ok(outcome)
    }

    /// Closes the open papeleta, returning it, and opens the next one.
    pub fn close_papeleta(&mut self) -> TallyResult<Papeleta> {
        self.ensure_editable("close a papeleta")?;
        let closed = self.buffer.close()?.clone();
        self.autosave();
        Ok(closed)
    }

    /// Voids the open papeleta and reverts its marks.
    pub fn annul_papeleta(&mut self, reason: &str) -> TallyResult<Papeleta> {
        self.ensure_editable("annul a papeleta")?;
        let voided = self.buffer.annul(reason, &self.store)?.clone();
        self.autosave();
        Ok(voided)
    }

    fn ensure_not_completed(&self, operation: &'static str) -> TallyResult<()> {
        if self.status == SessionStatus::Completed {
            error!("session {}: cannot {} a completed session", self.session_id, operation);
            return SessionLockedSnafu {
                status: self.status,
                operation,
            }
            .fail();
        }
        Ok(())
    }

    /// Blocks further edits behind a FREEZE checkpoint.
    ///
    /// Synchronization is paused while the snapshot is taken, so that the
    /// checkpoint matches the counters at that instant.
    pub async fn freeze(&mut self, acting_user: &str) -> TallyResult<Checkpoint> {
        self.ensure_not_completed("freeze")?;
        self.ensure_transition(SessionStatus::Closed)?;
        self.store.pause_sync();
        if !self.store.settle(self.settings.drain_delay).await {
            warn!(
                "freeze: an update is still in flight after {:?}",
                self.settings.drain_delay
            );
        }
        let snapshot = self.store.get_counts();
        let recorded = self
            .recorder
            .record(CheckpointAction::Freeze, snapshot, acting_user)
            .await;
        self.store.resume_sync();
        let checkpoint = recorded?.clone();
        self.enter(SessionStatus::Closed)?;
        self.autosave();
        Ok(checkpoint)
    }

    /// Re-opens a frozen session for edits behind an UNFREEZE checkpoint.
    pub async fn unfreeze(&mut self, acting_user: &str) -> TallyResult<Checkpoint> {
        self.ensure_not_completed("unfreeze")?;
        self.ensure_transition(SessionStatus::InProgress)?;
        let snapshot = self.store.get_counts();
        let checkpoint = self
            .recorder
            .record(CheckpointAction::Unfreeze, snapshot, acting_user)
            .await?
            .clone();
        self.enter(SessionStatus::InProgress)?;
        self.autosave();
        Ok(checkpoint)
    }

    /// Hands over the final tally of a frozen session.
    ///
    /// Nothing changes unless the evidence, the flush of the count updates
    /// and the submission all succeed.
    pub async fn finalize(&mut self, acting_user: &str, evidence: Evidence) -> TallyResult<FinalTally> {
        self.ensure_transition(SessionStatus::Completed)?;
        let evidence_url = match evidence {
            Evidence::Photo(blob) => {
                ensure!(!blob.is_empty(), EvidenceRequiredSnafu);
                let url = self
                    .settings
                    .retry
                    .call("upload", || self.evidence.upload(&self.session_id, &blob))
                    .await
                    .context(EvidenceUploadFailureSnafu)?;
                Some(url)
            }
            Evidence::Reference(url) => {
                ensure!(!url.trim().is_empty(), EvidenceRequiredSnafu);
                Some(url)
            }
            Evidence::Override => {
                warn!(
                    "finalize: session {} finalized by {} without evidence",
                    self.session_id, acting_user
                );
                None
            }
        };
        self.store.flush(self.settings.flush_timeout).await?;

        let tally = FinalTally {
            session_id: self.session_id.clone(),
            counts: self.store.get_counts(),
            party_totals: self.party_totals(),
            papeletas_closed: self.buffer.closed_count(),
            papeletas_annulled: self.buffer.annulled_count(),
            completed_ballots: self.buffer.completed_count(),
            evidence_url,
            finalized_by: acting_user.to_string(),
            finalized_at: Utc::now(),
        };
        self.settings
            .retry
            .call("submit_final", || self.submitter.submit_final(&tally))
            .await
            .context(CollaboratorSnafu {
                operation: "submit_final",
            })?;
        self.enter(SessionStatus::Completed)?;
        if let Err(e) = self.persistence.clear(&self.session_id) {
            warn!("finalize: could not clear local state: {}", e);
        }
        info!(
            "finalize: session {} completed by {} ({} votes)",
            self.session_id,
            acting_user,
            tally.counts.values().sum::<u64>()
        );
        self.final_tally = Some(tally.clone());
        Ok(tally)
    }

    /// Takes a completed session back to CLOSED.
    pub fn reopen(&mut self) -> TallyResult<()> {
        self.enter(SessionStatus::Closed)?;
        self.final_tally = None;
        self.autosave();
        Ok(())
    }

    /// Waits until the status collaborator has acknowledged the current status.
    pub async fn wait_status_published(&self, max_wait: Duration) -> bool {
        let target = self.status;
        let mut rx = self.published.subscribe();
        let published = matches!(
            timeout(max_wait, rx.wait_for(|s| *s == target)).await,
            Ok(Ok(_))
        );
        published
    }

    fn saved_state(&self, pending_sync: Vec<SyncMutation>) -> SavedState {
        let current = self.buffer.current();
        SavedState {
            current_papeleta: current.sequence,
            expanded_party: self.expanded_party.clone(),
            buffer_marks: current.marks.iter().cloned().collect(),
            completed_count: self.buffer.completed_count(),
            annulled_count: self.buffer.annulled_count(),
            status: Some(self.status),
            pending_sync,
            checkpoints: self.recorder.log().to_vec(),
        }
    }

    fn autosave(&self) {
        if self.status == SessionStatus::Completed {
            return;
        }
        let state = self.saved_state(self.store.pending());
        match self.persistence.save(&self.session_id, &state) {
            Ok(()) => debug!(
                "autosave: session {} at papeleta {}",
                self.session_id, state.current_papeleta
            ),
            Err(e) => error!("autosave: session {}: {}", self.session_id, e),
        }
    }

    /// Tears the session down.
    ///
    /// Count updates and status changes get up to `grace` to reach their
    /// collaborators. Count updates still unacknowledged after that are kept
    /// in the local state and replayed when the session is opened again.
    pub async fn close(self, grace: Duration) -> TallyResult<Vec<SyncMutation>> {
        if !self.wait_status_published(grace).await {
            warn!(
                "close: status {} of session {} was not published",
                self.status, self.session_id
            );
        }
        let EscrutinioSession {
            session_id,
            status,
            store,
            buffer,
            recorder,
            expanded_party,
            persistence,
            publisher,
            ..
        } = self;
        publisher.abort();
        let left = store.shutdown(grace).await;
        if status != SessionStatus::Completed {
            let current = buffer.current();
            let state = SavedState {
                current_papeleta: current.sequence,
                expanded_party,
                buffer_marks: current.marks.iter().cloned().collect(),
                completed_count: buffer.completed_count(),
                annulled_count: buffer.annulled_count(),
                status: Some(status),
                pending_sync: left.clone(),
                checkpoints: recorder.log().to_vec(),
            };
            persistence.save(&session_id, &state)?;
        }
        info!(
            "close: session {} closed with {} unsynchronized updates",
            session_id,
            left.len()
        );
        Ok(left)
    }
}

/// Publishes the latest wanted status, retrying until acknowledged.
/// The status a session is opened in.
///
/// The local record is newer than the status collaborator when a change
/// was never acknowledged. A log ending in FREEZE keeps edits locked.
fn resume_status(
    remote: SessionStatus,
    local: Option<SessionStatus>,
    last_action: Option<CheckpointAction>,
) -> SessionStatus {
    let status = match local {
        Some(SessionStatus::Pending) | None => remote,
        Some(local) => local,
    };
    if last_action == Some(CheckpointAction::Freeze) && status.is_editable() {
        return SessionStatus::Closed;
    }
    status
}

async fn run_status_publisher(
    session_id: SessionId,
    status_query: Arc<dyn StatusQuery>,
    mut desired: watch::Receiver<SessionStatus>,
    published: Arc<watch::Sender<SessionStatus>>,
    retry: RetryPolicy,
) {
    while desired.changed().await.is_ok() {
        let target = *desired.borrow_and_update();
        if *published.borrow() == target {
            continue;
        }
        let what = format!("update_status {} -> {}", session_id, target);
        retry
            .call_until_acknowledged(&what, || status_query.update_status(&session_id, target))
            .await;
        published.send_replace(target);
        debug!("status publisher: {} acknowledged", what);
    }
}
