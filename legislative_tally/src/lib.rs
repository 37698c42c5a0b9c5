/*!
Ballot tally and audit checkpoint core for multi-seat legislative counts.

A polling station transcribes its paper ballots (*papeletas*) one page at a
time. Each party owns a block of numbered slots; a ballot marks up to one slot
per seat. This crate keeps the running totals of a station session, mirrors
them to a remote store in the background, and records tamper-evident
FREEZE/UNFREEZE checkpoints that bound when the count can be edited.

Most users only need [`builder::SessionBuilder`] and the resulting
[`session::EscrutinioSession`]. The [`manual`] module describes the session
lifecycle and the local state format in detail.
*/

mod config;

pub mod allocation;
pub mod ballot;
pub mod builder;
pub mod checkpoint;
pub mod collaborators;
pub mod manual;
pub mod memory;
pub mod persistence;
pub mod retry;
pub mod session;
pub mod store;

pub use crate::config::*;

pub use crate::allocation::{allocate, SlotLayout};
pub use crate::ballot::{BallotBuffer, Papeleta};
pub use crate::checkpoint::{verify_chain, Checkpoint, CheckpointRecorder};
pub use crate::session::EscrutinioSession;
pub use crate::store::{SyncMutation, SyncStatus, VoteCountStore};
