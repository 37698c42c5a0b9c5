//! File-based stand-ins for the remote services, kept in a state directory.
//!
//! ```text
//! <state>/remote/<session>.json       counts, status and applied update ids
//! <state>/checkpoints/<session>.jsonl one submitted checkpoint per line
//! <state>/evidence/<digest>.bin       uploaded photos
//! <state>/final/<session>.json        the submitted final tally
//! <state>/local/                      local session state
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use legislative_tally::collaborators::*;
use legislative_tally::*;
use serde::{Deserialize, Serialize};

use crate::escrutinio::io_common::session_file_stem;
use crate::escrutinio::*;

fn unavailable(service: &str, path: &Path, e: impl std::fmt::Display) -> CollaboratorError {
    CollaboratorError::unavailable(service, format!("{}: {}", path.display(), e))
}

/// Creates a sub-directory of the state directory.
pub fn state_subdir(state_dir: &Path, name: &str) -> EscResult<PathBuf> {
    let p = state_dir.join(name);
    fs::create_dir_all(&p).context(OpeningFileSnafu {
        path: p.display().to_string(),
    })?;
    Ok(p)
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteRecord {
    descriptor: Option<SessionDescriptor>,
    #[serde(default)]
    counts: BTreeMap<SlotKey, u64>,
    #[serde(default)]
    applied: BTreeSet<String>,
}

/// The remote tally store and the status directory, one JSON file per session.
pub struct FileRemote {
    dir: PathBuf,
    // Serializes read-modify-write cycles.
    lock: Mutex<()>,
}

impl FileRemote {
    pub fn new(dir: PathBuf) -> FileRemote {
        FileRemote {
            dir,
            lock: Mutex::new(()),
        }
    }

    fn path(&self, session_id: &SessionId) -> PathBuf {
        self.dir
            .join(format!("{}.json", session_file_stem(session_id)))
    }

    fn read(&self, session_id: &SessionId) -> Result<RemoteRecord, CollaboratorError> {
        let path = self.path(session_id);
        if !path.exists() {
            return Ok(RemoteRecord::default());
        }
        let contents =
            fs::read_to_string(&path).map_err(|e| unavailable("file remote", &path, e))?;
        serde_json::from_str(&contents).map_err(|e| unavailable("file remote", &path, e))
    }

    fn write(&self, session_id: &SessionId, rec: &RemoteRecord) -> Result<(), CollaboratorError> {
        let path = self.path(session_id);
        let contents =
            serde_json::to_string_pretty(rec).map_err(|e| unavailable("file remote", &path, e))?;
        fs::write(&path, contents).map_err(|e| unavailable("file remote", &path, e))
    }

    fn update<T>(
        &self,
        session_id: &SessionId,
        f: impl FnOnce(&mut RemoteRecord) -> Result<T, CollaboratorError>,
    ) -> Result<T, CollaboratorError> {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut rec = self.read(session_id)?;
        let res = f(&mut rec)?;
        self.write(session_id, &rec)?;
        Ok(res)
    }

    /// Registers the station on first use, and checks it against the stored one afterwards.
    pub fn register(&self, session_id: &SessionId, descriptor: &SessionDescriptor) -> EscResult<()> {
        let res = self.update(session_id, |rec| match rec.descriptor.as_ref() {
            None => {
                info!("register: new station session {}", session_id);
                rec.descriptor = Some(descriptor.clone());
                Ok(true)
            }
            Some(d) => Ok(d.seat_count == descriptor.seat_count && d.parties == descriptor.parties),
        });
        match res {
            Ok(true) => Ok(()),
            Ok(false) => whatever!(
                "Session {} is already registered with other seats or parties",
                session_id
            ),
            Err(e) => whatever!("Could not register session {}: {}", session_id, e),
        }
    }
}

#[async_trait]
impl RemoteTallyStore for FileRemote {
    async fn load_counts(
        &self,
        session_id: &SessionId,
    ) -> Result<BTreeMap<SlotKey, u64>, CollaboratorError> {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(self.read(session_id)?.counts)
    }

    async fn apply_delta(&self, mutation: &SyncMutation) -> Result<(), CollaboratorError> {
        self.update(&mutation.session_id, |rec| {
            if !rec.applied.insert(mutation.id.to_string()) {
                debug!("apply_delta: {} already applied", mutation.id);
                return Ok(());
            }
            let v = rec.counts.entry(mutation.key.clone()).or_insert(0);
            *v = v.saturating_add_signed(mutation.delta);
            if *v == 0 {
                rec.counts.remove(&mutation.key);
            }
            Ok(())
        })
    }
}

#[async_trait]
impl StatusQuery for FileRemote {
    async fn get_status(
        &self,
        session_id: &SessionId,
    ) -> Result<SessionDescriptor, CollaboratorError> {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.read(session_id)?.descriptor.ok_or_else(|| {
            CollaboratorError::rejected("file remote", format!("unknown session {}", session_id))
        })
    }

    async fn update_status(
        &self,
        session_id: &SessionId,
        status: SessionStatus,
    ) -> Result<(), CollaboratorError> {
        self.update(session_id, |rec| match rec.descriptor.as_mut() {
            Some(d) => {
                d.status = status;
                Ok(())
            }
            None => Err(CollaboratorError::rejected(
                "file remote",
                format!("unknown session {}", session_id),
            )),
        })
    }
}

/// Appends every checkpoint to a JSON lines file.
pub struct FileCheckpointTransport {
    dir: PathBuf,
}

impl FileCheckpointTransport {
    pub fn new(dir: PathBuf) -> FileCheckpointTransport {
        FileCheckpointTransport { dir }
    }
}

#[async_trait]
impl CheckpointTransport for FileCheckpointTransport {
    async fn submit_checkpoint(
        &self,
        session_id: &SessionId,
        checkpoint: &Checkpoint,
    ) -> Result<(), CollaboratorError> {
        let path = self
            .dir
            .join(format!("{}.jsonl", session_file_stem(session_id)));
        let line = serde_json::to_string(checkpoint)
            .map_err(|e| unavailable("checkpoint log", &path, e))?;
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| unavailable("checkpoint log", &path, e))?;
        writeln!(f, "{}", line).map_err(|e| unavailable("checkpoint log", &path, e))
    }
}

/// Stores photos under their SHA-256 digest.
pub struct FileEvidenceStore {
    dir: PathBuf,
}

impl FileEvidenceStore {
    pub fn new(dir: PathBuf) -> FileEvidenceStore {
        FileEvidenceStore { dir }
    }
}

#[async_trait]
impl EvidenceStore for FileEvidenceStore {
    async fn upload(&self, session_id: &SessionId, blob: &[u8]) -> Result<String, CollaboratorError> {
        let name = format!("{}.bin", sha256::digest(blob));
        let path = self.dir.join(&name);
        fs::write(&path, blob).map_err(|e| unavailable("evidence store", &path, e))?;
        info!(
            "upload: {} bytes of evidence for session {} stored as {}",
            blob.len(),
            session_id,
            name
        );
        Ok(format!("evidence/{}", name))
    }
}

/// Writes the final tally of each session to its own file.
pub struct FileSubmitter {
    dir: PathBuf,
}

impl FileSubmitter {
    pub fn new(dir: PathBuf) -> FileSubmitter {
        FileSubmitter { dir }
    }
}

#[async_trait]
impl TallySubmitter for FileSubmitter {
    async fn submit_final(&self, tally: &FinalTally) -> Result<(), CollaboratorError> {
        let path = self
            .dir
            .join(format!("{}.json", session_file_stem(&tally.session_id)));
        let contents = serde_json::to_string_pretty(tally)
            .map_err(|e| unavailable("tally submitter", &path, e))?;
        fs::write(&path, contents).map_err(|e| unavailable("tally submitter", &path, e))
    }
}
