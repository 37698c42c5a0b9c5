// ********* Identifiers ***********

use std::collections::BTreeMap;
use std::fmt::Display;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::retry::RetryPolicy;

/// The identifier of a contesting party, as used by the station's ballot.
#[derive(Eq, PartialEq, Debug, Clone, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartyId(String);

impl PartyId {
    pub fn new(id: impl Into<String>) -> PartyId {
        PartyId(id.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for PartyId {
    fn from(s: &str) -> Self {
        PartyId(s.to_string())
    }
}

impl Display for PartyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The identifier of one tally session (one station, one election level).
#[derive(Eq, PartialEq, Debug, Clone, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> SessionId {
        SessionId(id.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        SessionId(s.to_string())
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A vote target: one numbered slot inside the range owned by a party.
///
/// Serialized as `party/slot` so that it can be used as a JSON object key.
#[derive(Eq, PartialEq, Debug, Clone, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SlotKey {
    pub party: PartyId,
    pub slot: u32,
}

impl SlotKey {
    pub fn new(party: impl Into<PartyId>, slot: u32) -> SlotKey {
        SlotKey {
            party: party.into(),
            slot,
        }
    }
}

impl From<String> for PartyId {
    fn from(s: String) -> Self {
        PartyId(s)
    }
}

impl Display for SlotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.party, self.slot)
    }
}

impl From<SlotKey> for String {
    fn from(k: SlotKey) -> String {
        k.to_string()
    }
}

impl TryFrom<String> for SlotKey {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        // Party ids may contain a slash, slot numbers never do.
        let (party, slot) = s
            .rsplit_once('/')
            .ok_or_else(|| format!("missing '/' in slot key {:?}", s))?;
        if party.is_empty() {
            return Err(format!("empty party in slot key {:?}", s));
        }
        let slot = slot
            .parse::<u32>()
            .map_err(|e| format!("invalid slot number in {:?}: {}", s, e))?;
        Ok(SlotKey::new(party, slot))
    }
}

// ********* Allocation ***********

/// The contiguous block of slots owned by one party.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct SlotRange {
    pub start: u32,
    pub end: u32,
    pub slots: Vec<u32>,
}

impl SlotRange {
    pub fn contains(&self, slot: u32) -> bool {
        self.start <= slot && slot <= self.end
    }

    pub fn width(&self) -> u32 {
        self.end + 1 - self.start
    }
}

// ********* Ballot pages ***********

#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PapeletaStatus {
    Open,
    Closed,
    Anulada,
}

impl Display for PapeletaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PapeletaStatus::Open => "OPEN",
            PapeletaStatus::Closed => "CLOSED",
            PapeletaStatus::Anulada => "ANULADA",
        };
        f.write_str(s)
    }
}

/// The result of toggling one slot on the open papeleta.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum MarkOutcome {
    Marked { total_marks: u32 },
    Unmarked { total_marks: u32 },
}

// ********* Session ***********

#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Pending,
    InProgress,
    Closed,
    Completed,
}

impl SessionStatus {
    /// Whether marks and papeleta operations are accepted in this status.
    pub fn is_editable(self) -> bool {
        matches!(self, SessionStatus::Pending | SessionStatus::InProgress)
    }

    /// The lifecycle of a session. Anything not listed here is refused.
    pub fn can_transition_to(self, to: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, to) {
            (Pending, InProgress) => true,
            (InProgress, Closed) => true,
            (Closed, InProgress) => true,
            (Closed, Completed) => true,
            (Completed, Closed) => true,
            (Pending, _) | (InProgress, _) | (Closed, _) | (Completed, _) => false,
        }
    }
}

impl Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Pending => "PENDING",
            SessionStatus::InProgress => "IN_PROGRESS",
            SessionStatus::Closed => "CLOSED",
            SessionStatus::Completed => "COMPLETED",
        };
        f.write_str(s)
    }
}

/// What the status collaborator knows about a session when it is opened.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub status: SessionStatus,
    pub seat_count: u32,
    /// Parties in ballot order. The order drives the slot allocation.
    pub parties: Vec<PartyId>,
}

// ********* Checkpoints ***********

#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointAction {
    Freeze,
    Unfreeze,
}

impl Display for CheckpointAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointAction::Freeze => f.write_str("FREEZE"),
            CheckpointAction::Unfreeze => f.write_str("UNFREEZE"),
        }
    }
}

#[derive(PartialEq, Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Radius of uncertainty, in meters.
    pub accuracy: f64,
}

// ******** Output data structures *********

/// The immutable tally handed over when a session is finalized.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalTally {
    pub session_id: SessionId,
    pub counts: BTreeMap<SlotKey, u64>,
    pub party_totals: BTreeMap<PartyId, u64>,
    pub papeletas_closed: u32,
    pub papeletas_annulled: u32,
    pub completed_ballots: u32,
    pub evidence_url: Option<String>,
    pub finalized_by: String,
    pub finalized_at: DateTime<Utc>,
}

/// How the caller wants to satisfy the evidence requirement of finalize.
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum Evidence {
    /// A photo of the tally sheet, to be uploaded.
    Photo(Vec<u8>),
    /// A reference returned by an earlier upload.
    Reference(String),
    /// The user explicitly chose to continue without evidence.
    Override,
}

// ********* Errors **********

/// Errors returned by the external collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum CollaboratorError {
    #[snafu(display("{service} is unavailable: {message}"))]
    Unavailable { service: String, message: String },
    #[snafu(display("{service} rejected the request: {message}"))]
    Rejected { service: String, message: String },
}

impl CollaboratorError {
    pub fn unavailable(service: &str, message: impl Into<String>) -> CollaboratorError {
        CollaboratorError::Unavailable {
            service: service.to_string(),
            message: message.into(),
        }
    }

    pub fn rejected(service: &str, message: impl Into<String>) -> CollaboratorError {
        CollaboratorError::Rejected {
            service: service.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TallyError {
    #[snafu(display("Cannot allocate {seat_count} seats across {party_count} parties"))]
    InvalidAllocationInput { seat_count: u32, party_count: u32 },

    #[snafu(display("Papeleta {sequence} is {status}, only an OPEN papeleta can be modified"))]
    InvalidBallotState {
        sequence: u32,
        status: PapeletaStatus,
    },

    #[snafu(display("Papeleta {sequence} already carries {seat_count} marks: close or void it"))]
    SeatLimitReached { sequence: u32, seat_count: u32 },

    #[snafu(display("Party {party} does not contest this station"))]
    UnknownParty { party: PartyId },

    #[snafu(display("Party {party} is listed more than once"))]
    DuplicateParty { party: PartyId },

    #[snafu(display("Slot {key} is outside the range {start}-{end} of its party"))]
    SlotOutOfRange { key: SlotKey, start: u32, end: u32 },

    #[snafu(display("Cannot {operation} while the session is {status}"))]
    SessionLocked {
        status: SessionStatus,
        operation: &'static str,
    },

    #[snafu(display("Transition from {from} to {to} is not allowed"))]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    #[snafu(display("{pending} count updates still unsynchronized after {waited:?}"))]
    SyncFailure { pending: usize, waited: Duration },

    #[snafu(display("The synchronization worker is no longer running"))]
    SyncWorkerStopped {},

    #[snafu(display("The count store is not bound to a session"))]
    StoreUnbound {},

    #[snafu(display("Geolocation unavailable: {reason}"))]
    GeolocationUnavailable { reason: String },

    #[snafu(display("Evidence is required to finalize the session"))]
    EvidenceRequired {},

    #[snafu(display("Uploading the evidence failed"))]
    EvidenceUploadFailure { source: CollaboratorError },

    #[snafu(display("Submitting the {action} checkpoint failed"))]
    CheckpointSubmission {
        action: CheckpointAction,
        source: CollaboratorError,
    },

    #[snafu(display("Call to {operation} failed"))]
    Collaborator {
        operation: &'static str,
        source: CollaboratorError,
    },

    #[snafu(display("Error accessing local state at {path}"))]
    PersistenceIo {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("Malformed local state record"))]
    PersistenceFormat { source: serde_json::Error },

    #[snafu(display("Local state record version {version} is not supported"))]
    UnsupportedRecordVersion { version: u64 },

    #[snafu(display("No {name} was provided to the session builder"))]
    MissingCollaborator { name: &'static str },
}

pub type TallyResult<T> = Result<T, TallyError>;

// ********* Configuration **********

/// Timing knobs of a tally session.
#[derive(PartialEq, Debug, Clone)]
pub struct SessionSettings {
    /// Upper bound on the geolocation request of a FREEZE checkpoint.
    pub geolocation_timeout: Duration,
    /// How long a FREEZE waits for an in-flight update to settle.
    pub drain_delay: Duration,
    /// How long finalize waits for the sync queue to empty.
    pub flush_timeout: Duration,
    /// How long the store keeps draining when the session is torn down.
    pub shutdown_grace: Duration,
    pub retry: RetryPolicy,
}

impl SessionSettings {
    pub const DEFAULT_SETTINGS: SessionSettings = SessionSettings {
        geolocation_timeout: Duration::from_secs(10),
        drain_delay: Duration::from_millis(1500),
        flush_timeout: Duration::from_secs(30),
        shutdown_grace: Duration::from_secs(5),
        retry: RetryPolicy::NETWORK,
    };
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings::DEFAULT_SETTINGS
    }
}
