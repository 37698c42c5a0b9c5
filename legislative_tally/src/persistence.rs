//! Save and restore of in-flight session state across reloads.
//!
//! A backend holds the record of the active session. Restoring the same
//! session returns its record. Saving or restoring a session drops the
//! records of the other sessions, except those still holding count updates
//! the remote store never acknowledged: they wait until their session is
//! opened again and replays them.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value as JSValue;
use snafu::prelude::*;

use crate::checkpoint::Checkpoint;
use crate::config::*;
use crate::store::SyncMutation;

/// The version written by this crate.
pub const RECORD_VERSION: u64 = 3;

#[derive(PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedState {
    pub current_papeleta: u32,
    pub expanded_party: Option<PartyId>,
    pub buffer_marks: Vec<SlotKey>,
    pub completed_count: u32,
    #[serde(default)]
    pub annulled_count: u32,
    /// Last status of the session on this device, published or not.
    #[serde(default)]
    pub status: Option<SessionStatus>,
    #[serde(default)]
    pub pending_sync: Vec<SyncMutation>,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedRecord {
    version: u64,
    session_id: SessionId,
    state: SavedState,
}

/// The first layout: flat, with marks keyed as `party_slot`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordV1 {
    session_id: SessionId,
    current_papeleta: u32,
    expanded_party: Option<PartyId>,
    #[serde(default)]
    buffer_marks: BTreeMap<String, u8>,
    #[serde(default)]
    completed_count: u32,
}

impl RecordV1 {
    fn migrate(self) -> (SessionId, SavedState) {
        let mut marks: Vec<SlotKey> = Vec::new();
        for (k, v) in self.buffer_marks.iter() {
            if *v == 0 {
                continue;
            }
            match k
                .rsplit_once('_')
                .and_then(|(p, s)| s.parse::<u32>().ok().map(|s| SlotKey::new(p, s)))
            {
                Some(key) => marks.push(key),
                None => warn!("migrate: dropping unreadable mark key {:?}", k),
            }
        }
        let state = SavedState {
            current_papeleta: self.current_papeleta,
            expanded_party: self.expanded_party,
            buffer_marks: marks,
            completed_count: self.completed_count,
            annulled_count: 0,
            status: None,
            pending_sync: Vec::new(),
            checkpoints: Vec::new(),
        };
        (self.session_id, state)
    }
}

pub fn encode_record(session_id: &SessionId, state: &SavedState) -> TallyResult<String> {
    let record = PersistedRecord {
        version: RECORD_VERSION,
        session_id: session_id.clone(),
        state: state.clone(),
    };
    serde_json::to_string_pretty(&record).context(PersistenceFormatSnafu)
}

/// Reads a record of any known version.
pub fn decode_record(contents: &str) -> TallyResult<(SessionId, SavedState)> {
    let js: JSValue = serde_json::from_str(contents).context(PersistenceFormatSnafu)?;
    // Version 1 records did not carry a version field.
    let version = js.get("version").and_then(|v| v.as_u64()).unwrap_or(1);
    match version {
        1 => {
            let v1: RecordV1 = serde_json::from_value(js).context(PersistenceFormatSnafu)?;
            debug!("decode_record: migrating version 1 record of {}", v1.session_id);
            Ok(v1.migrate())
        }
        // Version 2 records lack the status.
        2 | RECORD_VERSION => {
            let rec: PersistedRecord =
                serde_json::from_value(js).context(PersistenceFormatSnafu)?;
            Ok((rec.session_id, rec.state))
        }
        v => UnsupportedRecordVersionSnafu { version: v }.fail(),
    }
}

/// Whether a record still holds count updates the remote store never
/// acknowledged. Unreadable records hold nothing worth keeping.
fn carries_pending(contents: &str) -> bool {
    matches!(decode_record(contents), Ok((_, state)) if !state.pending_sync.is_empty())
}

pub trait LocalPersistence: Send + Sync {
    fn save(&self, session_id: &SessionId, state: &SavedState) -> TallyResult<()>;

    fn restore(&self, session_id: &SessionId) -> TallyResult<Option<SavedState>>;

    fn clear(&self, session_id: &SessionId) -> TallyResult<()>;
}

/// Keeps the encoded records in memory.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    records: Mutex<BTreeMap<SessionId, String>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores raw record text, as an older client would have left it.
    pub fn preload(&self, session_id: &SessionId, contents: &str) {
        self.lock().insert(session_id.clone(), contents.to_string());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<SessionId, String>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn prune_except(records: &mut BTreeMap<SessionId, String>, keep: &SessionId) {
        records.retain(|sid, contents| {
            if sid == keep {
                return true;
            }
            if carries_pending(contents) {
                debug!("prune: keeping state of session {} with unsynchronized updates", sid);
                return true;
            }
            info!("prune: dropping stale state of session {}", sid);
            false
        });
    }
}

impl LocalPersistence for MemoryPersistence {
    fn save(&self, session_id: &SessionId, state: &SavedState) -> TallyResult<()> {
        let contents = encode_record(session_id, state)?;
        let mut records = self.lock();
        records.insert(session_id.clone(), contents);
        Self::prune_except(&mut records, session_id);
        Ok(())
    }

    fn restore(&self, session_id: &SessionId) -> TallyResult<Option<SavedState>> {
        let mut records = self.lock();
        Self::prune_except(&mut records, session_id);
        match records.get(session_id) {
            Some(contents) => {
                let (_, state) = decode_record(contents)?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    fn clear(&self, session_id: &SessionId) -> TallyResult<()> {
        self.lock().remove(session_id);
        Ok(())
    }
}

const FILE_PREFIX: &str = "session-";

/// One JSON file per session, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    dir: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(dir: impl Into<PathBuf>) -> TallyResult<JsonFilePersistence> {
        let dir = dir.into();
        fs::create_dir_all(&dir).context(PersistenceIoSnafu {
            path: dir.display().to_string(),
        })?;
        Ok(JsonFilePersistence { dir })
    }

    pub fn path_for(&self, session_id: &SessionId) -> PathBuf {
        let safe: String = session_id
            .as_str()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}{}.json", FILE_PREFIX, safe))
    }

    /// Removes the records of every other session that holds no
    /// unsynchronized updates.
    fn prune_except(&self, keep: &Path) -> TallyResult<()> {
        let entries = fs::read_dir(&self.dir).context(PersistenceIoSnafu {
            path: self.dir.display().to_string(),
        })?;
        for entry in entries.flatten() {
            let path = entry.path();
            let is_record = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(FILE_PREFIX) && n.ends_with(".json"))
                .unwrap_or(false);
            if !is_record || path == keep {
                continue;
            }
            let pending = fs::read_to_string(&path)
                .map(|contents| carries_pending(&contents))
                .unwrap_or(false);
            if pending {
                debug!("prune: keeping {} with unsynchronized updates", path.display());
            } else {
                info!("prune: removing stale state {}", path.display());
                fs::remove_file(&path).context(PersistenceIoSnafu {
                    path: path.display().to_string(),
                })?;
            }
        }
        Ok(())
    }
}

impl LocalPersistence for JsonFilePersistence {
    fn save(&self, session_id: &SessionId, state: &SavedState) -> TallyResult<()> {
        let path = self.path_for(session_id);
        let tmp = path.with_extension("json.tmp");
        let contents = encode_record(session_id, state)?;
        fs::write(&tmp, contents).context(PersistenceIoSnafu {
            path: tmp.display().to_string(),
        })?;
        fs::rename(&tmp, &path).context(PersistenceIoSnafu {
            path: path.display().to_string(),
        })?;
        self.prune_except(&path)
    }

    fn restore(&self, session_id: &SessionId) -> TallyResult<Option<SavedState>> {
        let path = self.path_for(session_id);
        self.prune_except(&path)?;
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path).context(PersistenceIoSnafu {
            path: path.display().to_string(),
        })?;
        let (stored_id, state) = decode_record(&contents)?;
        if &stored_id != session_id {
            // Two ids mapped to the same file name.
            warn!(
                "restore: {} holds session {}, not {}",
                path.display(),
                stored_id,
                session_id
            );
            return Ok(None);
        }
        Ok(Some(state))
    }

    fn clear(&self, session_id: &SessionId) -> TallyResult<()> {
        let path = self.path_for(session_id);
        if path.exists() {
            fs::remove_file(&path).context(PersistenceIoSnafu {
                path: path.display().to_string(),
            })?;
        }
        Ok(())
    }
}
