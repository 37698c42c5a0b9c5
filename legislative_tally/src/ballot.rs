use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::*;
use crate::store::VoteCountStore;

/// One physical ballot page being transcribed.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Papeleta {
    pub sequence: u32,
    pub status: PapeletaStatus,
    /// A slot is either marked or not within one ballot.
    pub marks: BTreeSet<SlotKey>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub annul_reason: Option<String>,
}

impl Papeleta {
    pub fn open(sequence: u32) -> Papeleta {
        Papeleta {
            sequence,
            status: PapeletaStatus::Open,
            marks: BTreeSet::new(),
            created_at: Utc::now(),
            finished_at: None,
            annul_reason: None,
        }
    }

    pub fn total_marks(&self) -> u32 {
        self.marks.len() as u32
    }

    pub fn is_marked(&self, key: &SlotKey) -> bool {
        self.marks.contains(key)
    }

    fn ensure_open(&self) -> TallyResult<()> {
        if self.status != PapeletaStatus::Open {
            error!(
                "papeleta {}: operation attempted while {}",
                self.sequence, self.status
            );
            return InvalidBallotStateSnafu {
                sequence: self.sequence,
                status: self.status,
            }
            .fail();
        }
        Ok(())
    }

    /// Toggles one slot, mirroring the change into the store.
    ///
    /// A marked slot is unmarked. An unmarked slot is marked only while fewer
    /// than `seat_count` slots are marked.
    pub fn toggle_mark(
        &mut self,
        key: &SlotKey,
        seat_count: u32,
        store: &VoteCountStore,
    ) -> TallyResult<MarkOutcome> {
        self.ensure_open()?;
        if self.marks.contains(key) {
            store.decrement(key)?;
            self.marks.remove(key);
            debug!("papeleta {}: unmarked {}", self.sequence, key);
            return Ok(MarkOutcome::Unmarked {
                total_marks: self.total_marks(),
            });
        }
        if self.total_marks() >= seat_count {
            warn!(
                "papeleta {}: seat limit {} reached, rejecting {}",
                self.sequence, seat_count, key
            );
            return SeatLimitReachedSnafu {
                sequence: self.sequence,
                seat_count,
            }
            .fail();
        }
        store.increment(key)?;
        self.marks.insert(key.clone());
        debug!("papeleta {}: marked {}", self.sequence, key);
        Ok(MarkOutcome::Marked {
            total_marks: self.total_marks(),
        })
    }

    /// Accepts the marks as final.
    pub fn close(&mut self) -> TallyResult<()> {
        self.ensure_open()?;
        self.status = PapeletaStatus::Closed;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Voids the ballot: every mark is removed from the store again.
    pub fn annul(&mut self, reason: &str, store: &VoteCountStore) -> TallyResult<()> {
        self.ensure_open()?;
        let keys: Vec<SlotKey> = self.marks.iter().cloned().collect();
        store.revert_all(&keys)?;
        self.status = PapeletaStatus::Anulada;
        self.finished_at = Some(Utc::now());
        self.annul_reason = Some(reason.to_string());
        Ok(())
    }
}

/// The open papeleta of a session and the counters of the finished ones.
#[derive(Debug, Clone)]
pub struct BallotBuffer {
    seat_count: u32,
    current: Papeleta,
    completed: u32,
    annulled: u32,
    history: Vec<Papeleta>,
}

impl BallotBuffer {
    pub fn new(seat_count: u32) -> BallotBuffer {
        BallotBuffer {
            seat_count,
            current: Papeleta::open(1),
            completed: 0,
            annulled: 0,
            history: Vec::new(),
        }
    }

    /// Rebuilds the buffer of a reloaded session.
    ///
    /// The store is not touched: the marks were mirrored into it before the reload.
    pub fn restore(
        seat_count: u32,
        sequence: u32,
        marks: impl IntoIterator<Item = SlotKey>,
        completed: u32,
        annulled: u32,
    ) -> BallotBuffer {
        let mut current = Papeleta::open(sequence.max(1));
        current.marks = marks.into_iter().collect();
        if current.total_marks() > seat_count {
            warn!(
                "restore: papeleta {} carries {} marks for {} seats",
                current.sequence,
                current.total_marks(),
                seat_count
            );
        }
        BallotBuffer {
            seat_count,
            current,
            completed,
            annulled,
            history: Vec::new(),
        }
    }

    pub fn seat_count(&self) -> u32 {
        self.seat_count
    }

    pub fn current(&self) -> &Papeleta {
        &self.current
    }

    /// Ballots closed with every seat marked.
    pub fn completed_count(&self) -> u32 {
        self.completed
    }

    pub fn annulled_count(&self) -> u32 {
        self.annulled
    }

    /// Papeletas closed (complete or partial) over the whole session.
    pub fn closed_count(&self) -> u32 {
        (self.current.sequence - 1).saturating_sub(self.annulled)
    }

    /// The papeletas finished since the buffer was created, oldest first.
    pub fn history(&self) -> &[Papeleta] {
        &self.history
    }

    pub fn count_with_status(&self, status: PapeletaStatus) -> u32 {
        self.history.iter().filter(|p| p.status == status).count() as u32
    }

    pub fn toggle_mark(&mut self, key: &SlotKey, store: &VoteCountStore) -> TallyResult<MarkOutcome> {
        self.current.toggle_mark(key, self.seat_count, store)
    }

    /// Closes the open papeleta and opens the next one.
    pub fn close(&mut self) -> TallyResult<&Papeleta> {
        self.current.close()?;
        let complete = self.current.total_marks() == self.seat_count;
        if complete {
            self.completed += 1;
        }
        info!(
            "papeleta {} closed with {}/{} marks (complete: {}, completed ballots: {})",
            self.current.sequence,
            self.current.total_marks(),
            self.seat_count,
            complete,
            self.completed
        );
        Ok(self.advance())
    }

    /// Voids the open papeleta and opens the next one.
    pub fn annul(&mut self, reason: &str, store: &VoteCountStore) -> TallyResult<&Papeleta> {
        self.current.annul(reason, store)?;
        self.annulled += 1;
        info!(
            "papeleta {} annulled ({} marks reverted): {}",
            self.current.sequence,
            self.current.total_marks(),
            reason
        );
        Ok(self.advance())
    }

    fn advance(&mut self) -> &Papeleta {
        let next = Papeleta::open(self.current.sequence + 1);
        let finished = std::mem::replace(&mut self.current, next);
        self.history.push(finished);
        // Just pushed.
        &self.history[self.history.len() - 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRemote;
    use crate::retry::RetryPolicy;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn bound_store() -> VoteCountStore {
        let store = VoteCountStore::spawn(
            Arc::new(MemoryRemote::new()),
            RetryPolicy::immediate(2, 1),
            Duration::from_millis(10),
        );
        store.bind(&SessionId::new("esc-1"));
        store
    }

    fn k(party: &str, slot: u32) -> SlotKey {
        SlotKey::new(party, slot)
    }

    #[tokio::test]
    async fn toggling_twice_restores_buffer_and_store() {
        let store = bound_store();
        let mut buffer = BallotBuffer::new(8);
        store.increment(&k("pdc", 1)).unwrap();
        let before = store.get_counts();

        let first = buffer.toggle_mark(&k("pdc", 1), &store).unwrap();
        assert_eq!(first, MarkOutcome::Marked { total_marks: 1 });
        assert_eq!(store.get_count(&k("pdc", 1)), 2);
        let second = buffer.toggle_mark(&k("pdc", 1), &store).unwrap();
        assert_eq!(second, MarkOutcome::Unmarked { total_marks: 0 });

        assert!(buffer.current().marks.is_empty());
        assert_eq!(store.get_counts(), before);
    }

    #[tokio::test]
    async fn seat_limit_blocks_the_extra_mark() {
        let store = bound_store();
        let mut buffer = BallotBuffer::new(3);
        for slot in 1..=3 {
            buffer.toggle_mark(&k("pn", slot), &store).unwrap();
        }
        let before = store.get_counts();
        let res = buffer.toggle_mark(&k("pn", 4), &store);
        assert!(matches!(
            res,
            Err(TallyError::SeatLimitReached { seat_count: 3, .. })
        ));
        assert_eq!(store.get_counts(), before);
        assert_eq!(buffer.current().total_marks(), 3);
        // Unmarking still works at the limit.
        buffer.toggle_mark(&k("pn", 2), &store).unwrap();
        buffer.toggle_mark(&k("pn", 4), &store).unwrap();
    }

    #[tokio::test]
    async fn close_partial_ballot_is_not_complete() {
        let store = bound_store();
        let mut buffer = BallotBuffer::new(8);
        buffer.toggle_mark(&k("pdc", 1), &store).unwrap();
        buffer.toggle_mark(&k("libre", 9), &store).unwrap();
        let closed = buffer.close().unwrap().clone();
        assert_eq!(closed.status, PapeletaStatus::Closed);
        assert_eq!(closed.sequence, 1);

        assert_eq!(store.get_count(&k("pdc", 1)), 1);
        assert_eq!(store.get_count(&k("libre", 9)), 1);
        assert_eq!(buffer.completed_count(), 0);
        assert_eq!(buffer.current().sequence, 2);
        assert_eq!(buffer.current().status, PapeletaStatus::Open);
        assert!(buffer.current().marks.is_empty());
    }

    #[tokio::test]
    async fn close_full_ballot_counts_once() {
        let store = bound_store();
        let mut buffer = BallotBuffer::new(2);
        buffer.toggle_mark(&k("pn", 1), &store).unwrap();
        buffer.toggle_mark(&k("pn", 2), &store).unwrap();
        buffer.close().unwrap();
        assert_eq!(buffer.completed_count(), 1);
        buffer.toggle_mark(&k("pn", 1), &store).unwrap();
        buffer.close().unwrap();
        assert_eq!(buffer.completed_count(), 1);
        assert_eq!(buffer.count_with_status(PapeletaStatus::Closed), 2);
    }

    #[tokio::test]
    async fn annul_restores_previous_totals() {
        let store = bound_store();
        let mut buffer = BallotBuffer::new(8);
        buffer.toggle_mark(&k("pdc", 1), &store).unwrap();
        buffer.close().unwrap();
        let before = store.get_counts();

        buffer.toggle_mark(&k("pdc", 1), &store).unwrap();
        buffer.toggle_mark(&k("libre", 9), &store).unwrap();
        let voided = buffer.annul("two marks in the same column", &store).unwrap().clone();

        assert_eq!(voided.status, PapeletaStatus::Anulada);
        assert_eq!(voided.annul_reason.as_deref(), Some("two marks in the same column"));
        assert_eq!(store.get_counts(), before);
        assert_eq!(store.get_count(&k("pdc", 1)), 1);
        assert_eq!(store.get_count(&k("libre", 9)), 0);
        assert_eq!(buffer.current().sequence, 3);
        assert_eq!(buffer.count_with_status(PapeletaStatus::Anulada), 1);
        assert_eq!(buffer.annulled_count(), 1);
        assert_eq!(buffer.closed_count(), 1);
    }

    #[tokio::test]
    async fn finished_papeletas_reject_every_operation() {
        let store = bound_store();
        let mut buffer = BallotBuffer::new(8);
        buffer.toggle_mark(&k("pdc", 1), &store).unwrap();
        let mut closed = buffer.close().unwrap().clone();
        assert!(matches!(
            closed.annul("late", &store),
            Err(TallyError::InvalidBallotState {
                status: PapeletaStatus::Closed,
                ..
            })
        ));
        assert!(matches!(closed.close(), Err(TallyError::InvalidBallotState { .. })));
        assert!(matches!(
            closed.toggle_mark(&k("pdc", 2), 8, &store),
            Err(TallyError::InvalidBallotState { .. })
        ));

        let mut voided = buffer.annul("blank", &store).unwrap().clone();
        assert!(matches!(
            voided.close(),
            Err(TallyError::InvalidBallotState {
                status: PapeletaStatus::Anulada,
                ..
            })
        ));
        // Nothing leaked into the store from the rejected calls.
        assert_eq!(store.get_count(&k("pdc", 1)), 1);
        assert_eq!(store.get_count(&k("pdc", 2)), 0);
    }

    #[tokio::test]
    async fn restore_keeps_sequence_marks_and_completed() {
        let buffer = BallotBuffer::restore(8, 7, vec![k("pdc", 1), k("libre", 9)], 4, 1);
        assert_eq!(buffer.current().sequence, 7);
        assert_eq!(buffer.current().total_marks(), 2);
        assert_eq!(buffer.completed_count(), 4);
        assert_eq!(buffer.annulled_count(), 1);
        assert_eq!(buffer.closed_count(), 5);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Whatever the toggles, the buffer never exceeds the seat count and
        /// the store mirrors exactly the marks of the open ballot.
        #[test]
        fn prop_buffer_and_store_agree(
            seats in 1u32..6,
            toggles in proptest::collection::vec(1u32..10, 0..40),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let _guard = rt.enter();
            let store = bound_store();
            let mut buffer = BallotBuffer::new(seats);
            for slot in toggles {
                let key = k("pdc", slot);
                let res = buffer.toggle_mark(&key, &store);
                if let Err(e) = res {
                    prop_assert!(
                        matches!(e, TallyError::SeatLimitReached { .. }),
                        "unexpected error {:?}",
                        e
                    );
                }
                prop_assert!(buffer.current().total_marks() <= seats);
            }
            let marked: u64 = buffer.current().total_marks() as u64;
            prop_assert_eq!(store.get_party_total(&"pdc".into()), marked);
            for key in buffer.current().marks.iter() {
                prop_assert_eq!(store.get_count(key), 1);
            }
        }
    }
}
