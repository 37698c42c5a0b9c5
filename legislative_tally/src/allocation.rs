use std::collections::BTreeSet;

use log::{debug, error};
use snafu::prelude::*;

use crate::config::*;

/// Partitions `seat_count * party_count` slots into one contiguous range per party.
///
/// Party `i` (0-based) owns `[i * seat_count + 1, (i + 1) * seat_count]`.
/// Both counts must be positive.
pub fn allocate(seat_count: u32, party_count: u32) -> TallyResult<Vec<SlotRange>> {
    let last = seat_count.checked_mul(party_count);
    if seat_count == 0 || party_count == 0 || last.is_none() {
        error!(
            "allocate: invalid input seat_count={} party_count={}",
            seat_count, party_count
        );
        return InvalidAllocationInputSnafu {
            seat_count,
            party_count,
        }
        .fail();
    }
    let ranges: Vec<SlotRange> = (0..party_count)
        .map(|i| {
            let start = i * seat_count + 1;
            let end = (i + 1) * seat_count;
            SlotRange {
                start,
                end,
                slots: (start..=end).collect(),
            }
        })
        .collect();
    debug!(
        "allocate: {} seats x {} parties -> slots 1..={}",
        seat_count,
        party_count,
        last.unwrap_or_default()
    );
    Ok(ranges)
}

/// The slot ranges of a station, bound to its parties in ballot order.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct SlotLayout {
    seat_count: u32,
    parties: Vec<(PartyId, SlotRange)>,
}

impl SlotLayout {
    /// Party ids must be distinct.
    pub fn new(seat_count: u32, parties: &[PartyId]) -> TallyResult<SlotLayout> {
        let party_count = match u32::try_from(parties.len()) {
            Ok(n) => n,
            Err(_) => {
                error!("layout: {} parties do not fit in a slot numbering", parties.len());
                return InvalidAllocationInputSnafu {
                    seat_count,
                    party_count: u32::MAX,
                }
                .fail();
            }
        };
        let mut seen = BTreeSet::new();
        if let Some(party) = parties.iter().find(|p| !seen.insert(*p)) {
            error!("layout: party {} is listed twice", party);
            return DuplicatePartySnafu {
                party: party.clone(),
            }
            .fail();
        }
        let ranges = allocate(seat_count, party_count)?;
        Ok(SlotLayout {
            seat_count,
            parties: parties.iter().cloned().zip(ranges).collect(),
        })
    }

    pub fn seat_count(&self) -> u32 {
        self.seat_count
    }

    pub fn parties(&self) -> impl Iterator<Item = &PartyId> {
        self.parties.iter().map(|(p, _)| p)
    }

    pub fn ranges(&self) -> &[(PartyId, SlotRange)] {
        &self.parties
    }

    pub fn range_of(&self, party: &PartyId) -> Option<&SlotRange> {
        self.parties
            .iter()
            .find(|(p, _)| p == party)
            .map(|(_, r)| r)
    }

    pub fn party_of_slot(&self, slot: u32) -> Option<&PartyId> {
        self.parties
            .iter()
            .find(|(_, r)| r.contains(slot))
            .map(|(p, _)| p)
    }

    /// Checks that the target is a slot of its own party.
    pub fn validate(&self, key: &SlotKey) -> TallyResult<()> {
        let range = self.range_of(&key.party).context(UnknownPartySnafu {
            party: key.party.clone(),
        })?;
        ensure!(
            range.contains(key.slot),
            SlotOutOfRangeSnafu {
                key: key.clone(),
                start: range.start,
                end: range.end,
            }
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn eight_seats_five_parties() {
        let ranges = allocate(8, 5).unwrap();
        let bounds: Vec<(u32, u32)> = ranges.iter().map(|r| (r.start, r.end)).collect();
        assert_eq!(bounds, vec![(1, 8), (9, 16), (17, 24), (25, 32), (33, 40)]);
        assert_eq!(ranges[1].slots, (9..=16).collect::<Vec<u32>>());
    }

    #[test]
    fn rejects_empty_inputs() {
        assert!(matches!(
            allocate(0, 5),
            Err(TallyError::InvalidAllocationInput { .. })
        ));
        assert!(matches!(
            allocate(8, 0),
            Err(TallyError::InvalidAllocationInput { .. })
        ));
        assert!(matches!(
            allocate(u32::MAX, 2),
            Err(TallyError::InvalidAllocationInput { .. })
        ));
    }

    #[test]
    fn layout_resolves_parties_and_slots() {
        let parties: Vec<PartyId> = ["pn", "pdc", "libre"].iter().map(|&p| p.into()).collect();
        let layout = SlotLayout::new(4, &parties).unwrap();
        assert_eq!(layout.range_of(&"pdc".into()).map(|r| r.start), Some(5));
        assert_eq!(layout.party_of_slot(9), Some(&PartyId::from("libre")));
        assert_eq!(layout.party_of_slot(13), None);
        assert!(layout.validate(&SlotKey::new("pdc", 8)).is_ok());
        assert!(matches!(
            layout.validate(&SlotKey::new("pdc", 9)),
            Err(TallyError::SlotOutOfRange { start: 5, end: 8, .. })
        ));
        assert!(matches!(
            layout.validate(&SlotKey::new("pl", 1)),
            Err(TallyError::UnknownParty { .. })
        ));
    }

    #[test]
    fn layout_rejects_repeated_parties() {
        let parties: Vec<PartyId> = ["pn", "pdc", "pn"].iter().map(|&p| p.into()).collect();
        assert!(matches!(
            SlotLayout::new(4, &parties),
            Err(TallyError::DuplicateParty { party }) if party == PartyId::from("pn")
        ));
        assert!(matches!(
            SlotLayout::new(4, &[]),
            Err(TallyError::InvalidAllocationInput { party_count: 0, .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_ranges_tile_the_slot_space(s in 1u32..60, p in 1u32..30) {
            let ranges = allocate(s, p).unwrap();
            prop_assert_eq!(ranges.len() as u32, p);
            let mut next = 1;
            for r in ranges.iter() {
                prop_assert_eq!(r.start, next);
                prop_assert_eq!(r.width(), s);
                prop_assert_eq!(r.slots.len() as u32, s);
                prop_assert_eq!(r.slots.first().copied(), Some(r.start));
                prop_assert_eq!(r.slots.last().copied(), Some(r.end));
                next = r.end + 1;
            }
            prop_assert_eq!(next - 1, s * p);
        }
    }
}
