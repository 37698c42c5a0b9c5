//! Freeze/unfreeze audit checkpoints.
//!
//! Each checkpoint commits to the digest of the previous one, so the log can be
//! checked for edits, deletions or reordering with [`verify_chain`].

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tokio::time::timeout;

use crate::collaborators::{CheckpointTransport, Geolocator};
use crate::config::*;
use crate::retry::RetryPolicy;

#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Position in the log, starting at 0.
    pub index: u32,
    pub action: CheckpointAction,
    pub votes_snapshot: BTreeMap<SlotKey, u64>,
    pub timestamp: DateTime<Utc>,
    pub acting_user: String,
    pub gps: Option<GpsFix>,
    pub previous_digest: Option<String>,
    pub digest: String,
}

impl Checkpoint {
    fn seal(
        index: u32,
        action: CheckpointAction,
        votes_snapshot: BTreeMap<SlotKey, u64>,
        acting_user: &str,
        gps: Option<GpsFix>,
        previous_digest: Option<String>,
    ) -> Checkpoint {
        let mut cp = Checkpoint {
            index,
            action,
            votes_snapshot,
            timestamp: Utc::now(),
            acting_user: acting_user.to_string(),
            gps,
            previous_digest,
            digest: String::new(),
        };
        cp.digest = cp.compute_digest();
        cp
    }

    /// SHA-256 of every field but the digest itself.
    ///
    /// Coordinates enter as their IEEE 754 bit patterns.
    pub fn compute_digest(&self) -> String {
        let mut content = format!(
            "{}|{}|{}|{}|",
            self.index,
            self.action,
            self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
            self.acting_user
        );
        match self.gps {
            Some(g) => {
                let _ = write!(
                    content,
                    "{:016x},{:016x},{:016x}|",
                    g.latitude.to_bits(),
                    g.longitude.to_bits(),
                    g.accuracy.to_bits()
                );
            }
            None => content.push_str("-|"),
        }
        content.push_str(self.previous_digest.as_deref().unwrap_or("-"));
        content.push('|');
        for (key, count) in self.votes_snapshot.iter() {
            let _ = write!(content, "{}={};", key, count);
        }
        sha256::digest(content.as_str())
    }

    pub fn total_votes(&self) -> u64 {
        self.votes_snapshot.values().sum()
    }
}

/// Checks positions, digests and links of a checkpoint log.
pub fn verify_chain(log: &[Checkpoint]) -> bool {
    let mut previous: Option<&str> = None;
    for (idx, cp) in log.iter().enumerate() {
        if cp.index as usize != idx
            || cp.previous_digest.as_deref() != previous
            || cp.compute_digest() != cp.digest
        {
            warn!("verify_chain: checkpoint {} does not verify", idx);
            return false;
        }
        previous = Some(cp.digest.as_str());
    }
    true
}

/// Records checkpoints for one session and keeps the ordered log.
pub struct CheckpointRecorder {
    session_id: SessionId,
    log: Vec<Checkpoint>,
    transport: Arc<dyn CheckpointTransport>,
    geolocator: Arc<dyn Geolocator>,
    geolocation_timeout: Duration,
    retry: RetryPolicy,
}

impl CheckpointRecorder {
    pub fn new(
        session_id: SessionId,
        transport: Arc<dyn CheckpointTransport>,
        geolocator: Arc<dyn Geolocator>,
        geolocation_timeout: Duration,
        retry: RetryPolicy,
    ) -> CheckpointRecorder {
        CheckpointRecorder {
            session_id,
            log: Vec::new(),
            transport,
            geolocator,
            geolocation_timeout,
            retry,
        }
    }

    /// Continues a log restored from local state.
    pub fn with_log(mut self, log: Vec<Checkpoint>) -> CheckpointRecorder {
        if !verify_chain(&log) {
            warn!(
                "with_log: restored checkpoint log of session {} does not verify",
                self.session_id
            );
        }
        self.log = log;
        self
    }

    pub fn log(&self) -> &[Checkpoint] {
        &self.log
    }

    pub fn last(&self) -> Option<&Checkpoint> {
        self.log.last()
    }

    /// A best-effort position fix, bounded by the geolocation timeout.
    pub async fn locate(&self) -> Option<GpsFix> {
        let res = timeout(
            self.geolocation_timeout,
            self.geolocator.current_position(true),
        )
        .await;
        let reason = match res {
            Ok(Ok(fix)) => return Some(fix),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("no fix within {:?}", self.geolocation_timeout),
        };
        let err = GeolocationUnavailableSnafu { reason }.build();
        warn!("locate: {}, recording without coordinates", err);
        None
    }

    /// Seals, submits and appends a checkpoint.
    ///
    /// FREEZE checkpoints try to carry the current position. Nothing is
    /// appended unless the transport acknowledged the checkpoint.
    pub async fn record(
        &mut self,
        action: CheckpointAction,
        votes_snapshot: BTreeMap<SlotKey, u64>,
        acting_user: &str,
    ) -> TallyResult<&Checkpoint> {
        let gps = match action {
            CheckpointAction::Freeze => self.locate().await,
            CheckpointAction::Unfreeze => None,
        };
        let checkpoint = Checkpoint::seal(
            self.log.len() as u32,
            action,
            votes_snapshot,
            acting_user,
            gps,
            self.log.last().map(|c| c.digest.clone()),
        );
        let submitted = self
            .retry
            .call("submit_checkpoint", || {
                self.transport
                    .submit_checkpoint(&self.session_id, &checkpoint)
            })
            .await;
        submitted.context(CheckpointSubmissionSnafu { action })?;
        info!(
            "record: session {}: {} checkpoint #{} by {} ({} votes, gps: {})",
            self.session_id,
            action,
            checkpoint.index,
            acting_user,
            checkpoint.total_votes(),
            checkpoint.gps.is_some()
        );
        self.log.push(checkpoint);
        let idx = self.log.len() - 1;
        Ok(&self.log[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryCheckpointTransport, StaticGeolocator};
    use crate::persistence::{decode_record, encode_record, SavedState};
    use proptest::prelude::*;

    const FIX: GpsFix = GpsFix {
        latitude: 14.0723,
        longitude: -87.1921,
        accuracy: 12.5,
    };

    fn recorder(
        transport: &Arc<MemoryCheckpointTransport>,
        geolocator: StaticGeolocator,
    ) -> CheckpointRecorder {
        CheckpointRecorder::new(
            "esc-1".into(),
            transport.clone(),
            Arc::new(geolocator),
            Duration::from_secs(10),
            RetryPolicy::immediate(2, 1),
        )
    }

    fn snapshot(pairs: &[(&str, u32, u64)]) -> BTreeMap<SlotKey, u64> {
        pairs
            .iter()
            .map(|(p, s, c)| (SlotKey::new(*p, *s), *c))
            .collect()
    }

    #[tokio::test]
    async fn freeze_carries_position_and_unfreeze_does_not() {
        let transport = Arc::new(MemoryCheckpointTransport::new());
        let mut rec = recorder(&transport, StaticGeolocator::at(FIX));
        let frozen = rec
            .record(CheckpointAction::Freeze, snapshot(&[("pdc", 1, 3)]), "ana")
            .await
            .unwrap()
            .clone();
        assert_eq!(frozen.gps, Some(FIX));
        assert_eq!(frozen.index, 0);
        assert_eq!(frozen.previous_digest, None);

        let thawed = rec
            .record(CheckpointAction::Unfreeze, snapshot(&[("pdc", 1, 3)]), "ana")
            .await
            .unwrap()
            .clone();
        assert_eq!(thawed.gps, None);
        assert_eq!(thawed.previous_digest.as_deref(), Some(frozen.digest.as_str()));
        assert_eq!(transport.received().len(), 2);
        assert!(verify_chain(rec.log()));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_geolocation_degrades_to_no_coordinates() {
        let transport = Arc::new(MemoryCheckpointTransport::new());
        let slow = StaticGeolocator {
            fix: Some(FIX),
            delay: Duration::from_secs(60),
        };
        let mut rec = recorder(&transport, slow);
        let cp = rec
            .record(CheckpointAction::Freeze, BTreeMap::new(), "ana")
            .await
            .unwrap();
        assert_eq!(cp.gps, None);
    }

    #[tokio::test]
    async fn missing_geolocation_still_records() {
        let transport = Arc::new(MemoryCheckpointTransport::new());
        let mut rec = recorder(&transport, StaticGeolocator::unavailable());
        let cp = rec
            .record(CheckpointAction::Freeze, snapshot(&[("libre", 9, 1)]), "ana")
            .await
            .unwrap();
        assert_eq!(cp.gps, None);
        assert_eq!(cp.total_votes(), 1);
    }

    #[tokio::test]
    async fn unacknowledged_checkpoint_is_not_appended() {
        let transport = Arc::new(MemoryCheckpointTransport::new());
        transport.fail_next(2);
        let mut rec = recorder(&transport, StaticGeolocator::at(FIX));
        let res = rec
            .record(CheckpointAction::Freeze, BTreeMap::new(), "ana")
            .await;
        assert!(matches!(
            res,
            Err(TallyError::CheckpointSubmission {
                action: CheckpointAction::Freeze,
                ..
            })
        ));
        assert!(rec.log().is_empty());

        // A later attempt goes through and starts the chain at 0.
        let cp = rec
            .record(CheckpointAction::Freeze, BTreeMap::new(), "ana")
            .await
            .unwrap();
        assert_eq!(cp.index, 0);
    }

    #[tokio::test]
    async fn tampering_breaks_the_chain() {
        let transport = Arc::new(MemoryCheckpointTransport::new());
        let mut rec = recorder(&transport, StaticGeolocator::unavailable());
        rec.record(CheckpointAction::Freeze, snapshot(&[("pdc", 1, 3)]), "ana")
            .await
            .unwrap();
        rec.record(CheckpointAction::Unfreeze, snapshot(&[("pdc", 1, 3)]), "ana")
            .await
            .unwrap();
        rec.record(CheckpointAction::Freeze, snapshot(&[("pdc", 1, 5)]), "luis")
            .await
            .unwrap();
        let log = rec.log().to_vec();
        assert!(verify_chain(&log));

        let mut edited = log.clone();
        edited[0].votes_snapshot.insert(SlotKey::new("pdc", 1), 4);
        assert!(!verify_chain(&edited));

        let mut dropped = log.clone();
        dropped.remove(1);
        assert!(!verify_chain(&dropped));

        let mut swapped = log;
        swapped.swap(1, 2);
        assert!(!verify_chain(&swapped));
    }

    #[test]
    fn digest_survives_json_round_trip() {
        let cp = Checkpoint::seal(
            0,
            CheckpointAction::Freeze,
            snapshot(&[("pdc", 1, 3), ("libre", 9, 1)]),
            "ana",
            Some(FIX),
            None,
        );
        let js = serde_json::to_string(&cp).unwrap();
        let back: Checkpoint = serde_json::from_str(&js).unwrap();
        assert_eq!(back.compute_digest(), cp.digest);
        assert!(verify_chain(&[back]));
    }

    fn located_log(fix: GpsFix) -> Vec<Checkpoint> {
        let first = Checkpoint::seal(
            0,
            CheckpointAction::Freeze,
            snapshot(&[("pdc", 1, 3)]),
            "ana",
            Some(fix),
            None,
        );
        let second = Checkpoint::seal(
            1,
            CheckpointAction::Unfreeze,
            snapshot(&[("pdc", 1, 3)]),
            "luis",
            None,
            Some(first.digest.clone()),
        );
        let third = Checkpoint::seal(
            2,
            CheckpointAction::Freeze,
            snapshot(&[("pdc", 1, 4)]),
            "ana",
            Some(fix),
            Some(second.digest.clone()),
        );
        vec![first, second, third]
    }

    fn through_local_state(log: &[Checkpoint]) -> Vec<Checkpoint> {
        let state = SavedState {
            checkpoints: log.to_vec(),
            ..SavedState::default()
        };
        let contents = encode_record(&"esc-1".into(), &state).unwrap();
        decode_record(&contents).unwrap().1.checkpoints
    }

    #[test]
    fn coordinates_come_back_bit_for_bit() {
        let fix = GpsFix {
            latitude: 14.081823456789012,
            longitude: -87.20681234567891,
            accuracy: 11.505477874380897,
        };
        let restored = through_local_state(&located_log(fix));
        assert_eq!(restored[0].gps, Some(fix));
        assert!(verify_chain(&restored));
    }

    proptest! {
        #[test]
        fn prop_located_chain_verifies_after_reload_and_transport(
            latitude in -90.0f64..90.0,
            longitude in -180.0f64..180.0,
            accuracy in 0.0f64..5000.0,
        ) {
            let log = located_log(GpsFix { latitude, longitude, accuracy });

            let restored = through_local_state(&log);
            prop_assert_eq!(&restored, &log);
            prop_assert!(verify_chain(&restored));

            // The checkpoint log collaborator stores one JSON line per checkpoint.
            let received: Vec<Checkpoint> = log
                .iter()
                .map(|c| serde_json::from_str(&serde_json::to_string(c).unwrap()).unwrap())
                .collect();
            prop_assert!(verify_chain(&received));
        }
    }
}
