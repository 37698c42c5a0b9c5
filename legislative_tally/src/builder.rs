use std::sync::Arc;

use log::info;
use snafu::prelude::*;

use crate::collaborators::*;
pub use crate::config::*;
use crate::memory::StaticGeolocator;
use crate::persistence::{LocalPersistence, MemoryPersistence};
use crate::session::{Collaborators, EscrutinioSession};

/// A builder for opening a tally session.
///
/// The remote store, the status query, the checkpoint transport, the evidence
/// store and the submitter are required. Without a geolocator, checkpoints are
/// recorded without coordinates; without a persistence backend, local state
/// only lives as long as the process.
///
/// ```
/// use std::sync::Arc;
/// use legislative_tally::builder::SessionBuilder;
/// use legislative_tally::memory::*;
/// use legislative_tally::{SessionDescriptor, SessionSettings, SessionStatus, SlotKey};
/// # use legislative_tally::TallyError;
///
/// # let rt = tokio::runtime::Runtime::new().unwrap();
/// # rt.block_on(async {
/// let remote = Arc::new(MemoryRemote::new().with_session(
///     &"esc-1".into(),
///     SessionDescriptor {
///         status: SessionStatus::Pending,
///         seat_count: 3,
///         parties: vec!["pdc".into(), "libre".into()],
///     },
/// ));
/// let mut session = SessionBuilder::new(&SessionSettings::DEFAULT_SETTINGS)
///     .remote(remote.clone())
///     .status_query(remote.clone())
///     .checkpoint_transport(Arc::new(MemoryCheckpointTransport::new()))
///     .evidence_store(Arc::new(MemoryEvidenceStore::new()))
///     .submitter(Arc::new(MemorySubmitter::new()))
///     .open("esc-1".into())
///     .await?;
///
/// session.toggle_mark(&SlotKey::new("libre", 4))?;
/// session.close_papeleta()?;
/// assert_eq!(session.get_count(&SlotKey::new("libre", 4)), 1);
/// # Ok::<(), TallyError>(())
/// # }).unwrap();
/// ```
pub struct SessionBuilder {
    pub(crate) _settings: SessionSettings,
    pub(crate) _remote: Option<Arc<dyn RemoteTallyStore>>,
    pub(crate) _status: Option<Arc<dyn StatusQuery>>,
    pub(crate) _checkpoints: Option<Arc<dyn CheckpointTransport>>,
    pub(crate) _evidence: Option<Arc<dyn EvidenceStore>>,
    pub(crate) _submitter: Option<Arc<dyn TallySubmitter>>,
    pub(crate) _geolocator: Option<Arc<dyn Geolocator>>,
    pub(crate) _persistence: Option<Arc<dyn LocalPersistence>>,
}

impl SessionBuilder {
    pub fn new(settings: &SessionSettings) -> SessionBuilder {
        SessionBuilder {
            _settings: settings.clone(),
            _remote: None,
            _status: None,
            _checkpoints: None,
            _evidence: None,
            _submitter: None,
            _geolocator: None,
            _persistence: None,
        }
    }

    pub fn remote(self, remote: Arc<dyn RemoteTallyStore>) -> SessionBuilder {
        SessionBuilder {
            _remote: Some(remote),
            ..self
        }
    }

    pub fn status_query(self, status: Arc<dyn StatusQuery>) -> SessionBuilder {
        SessionBuilder {
            _status: Some(status),
            ..self
        }
    }

    pub fn checkpoint_transport(self, transport: Arc<dyn CheckpointTransport>) -> SessionBuilder {
        SessionBuilder {
            _checkpoints: Some(transport),
            ..self
        }
    }

    pub fn evidence_store(self, evidence: Arc<dyn EvidenceStore>) -> SessionBuilder {
        SessionBuilder {
            _evidence: Some(evidence),
            ..self
        }
    }

    pub fn submitter(self, submitter: Arc<dyn TallySubmitter>) -> SessionBuilder {
        SessionBuilder {
            _submitter: Some(submitter),
            ..self
        }
    }

    pub fn geolocator(self, geolocator: Arc<dyn Geolocator>) -> SessionBuilder {
        SessionBuilder {
            _geolocator: Some(geolocator),
            ..self
        }
    }

    pub fn persistence(self, persistence: Arc<dyn LocalPersistence>) -> SessionBuilder {
        SessionBuilder {
            _persistence: Some(persistence),
            ..self
        }
    }

    /// Opens the session: reads its status, restores the local state of the
    /// same session if any, and loads the counts from the remote store.
    ///
    /// Must be called within a tokio runtime.
    pub async fn open(self, session_id: SessionId) -> TallyResult<EscrutinioSession> {
        let geolocator = self._geolocator.unwrap_or_else(|| {
            info!("open: no geolocator, checkpoints carry no coordinates");
            Arc::new(StaticGeolocator::unavailable())
        });
        let collaborators = Collaborators {
            remote: self._remote.context(MissingCollaboratorSnafu {
                name: "remote tally store",
            })?,
            status: self._status.context(MissingCollaboratorSnafu {
                name: "status query",
            })?,
            checkpoints: self._checkpoints.context(MissingCollaboratorSnafu {
                name: "checkpoint transport",
            })?,
            evidence: self._evidence.context(MissingCollaboratorSnafu {
                name: "evidence store",
            })?,
            submitter: self._submitter.context(MissingCollaboratorSnafu {
                name: "tally submitter",
            })?,
            geolocator,
            persistence: self
                ._persistence
                .unwrap_or_else(|| Arc::new(MemoryPersistence::new())),
        };
        EscrutinioSession::open(session_id, collaborators, self._settings).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::*;

    #[tokio::test]
    async fn missing_collaborators_are_reported() {
        let remote = Arc::new(MemoryRemote::new());
        let res = SessionBuilder::new(&SessionSettings::DEFAULT_SETTINGS)
            .remote(remote.clone())
            .status_query(remote)
            .open("esc-1".into())
            .await;
        assert!(matches!(
            res,
            Err(TallyError::MissingCollaborator {
                name: "checkpoint transport"
            })
        ));
    }

    #[tokio::test]
    async fn unknown_sessions_cannot_be_opened() {
        let remote = Arc::new(MemoryRemote::new());
        let res = SessionBuilder::new(&SessionSettings::DEFAULT_SETTINGS)
            .remote(remote.clone())
            .status_query(remote)
            .checkpoint_transport(Arc::new(MemoryCheckpointTransport::new()))
            .evidence_store(Arc::new(MemoryEvidenceStore::new()))
            .submitter(Arc::new(MemorySubmitter::new()))
            .open("esc-9".into())
            .await;
        assert!(matches!(
            res,
            Err(TallyError::Collaborator {
                operation: "get_status",
                ..
            })
        ));
    }
}
