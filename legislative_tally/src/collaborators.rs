//! The narrow interfaces through which the tally core reaches the rest of the
//! application.
//!
//! Every call may fail with a [`CollaboratorError`]; the core decides whether a
//! failure is retried, surfaced to the user or tolerated.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::checkpoint::Checkpoint;
use crate::config::*;
use crate::store::SyncMutation;

/// The remote copy of the per-slot counters.
#[async_trait]
pub trait RemoteTallyStore: Send + Sync {
    async fn load_counts(
        &self,
        session_id: &SessionId,
    ) -> Result<BTreeMap<SlotKey, u64>, CollaboratorError>;

    /// Applies one count update.
    ///
    /// Must be idempotent on `mutation.id`: the same mutation may be delivered
    /// more than once when an acknowledgement is lost.
    async fn apply_delta(&self, mutation: &SyncMutation) -> Result<(), CollaboratorError>;
}

/// Receives the audit checkpoints.
#[async_trait]
pub trait CheckpointTransport: Send + Sync {
    async fn submit_checkpoint(
        &self,
        session_id: &SessionId,
        checkpoint: &Checkpoint,
    ) -> Result<(), CollaboratorError>;
}

/// Stores the tally sheet photo and returns a durable reference to it.
#[async_trait]
pub trait EvidenceStore: Send + Sync {
    async fn upload(&self, session_id: &SessionId, blob: &[u8])
        -> Result<String, CollaboratorError>;
}

/// Takes over the final tally of a station.
#[async_trait]
pub trait TallySubmitter: Send + Sync {
    async fn submit_final(&self, tally: &FinalTally) -> Result<(), CollaboratorError>;
}

#[async_trait]
pub trait Geolocator: Send + Sync {
    async fn current_position(&self, high_accuracy: bool) -> Result<GpsFix, CollaboratorError>;
}

/// Where the session status and seat parameters live.
#[async_trait]
pub trait StatusQuery: Send + Sync {
    async fn get_status(&self, session_id: &SessionId)
        -> Result<SessionDescriptor, CollaboratorError>;

    async fn update_status(
        &self,
        session_id: &SessionId,
        status: SessionStatus,
    ) -> Result<(), CollaboratorError>;
}
