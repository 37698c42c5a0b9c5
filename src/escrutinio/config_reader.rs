use std::time::Duration;

use legislative_tally::{GpsFix, PartyId, SessionDescriptor, SessionSettings, SessionStatus};
use serde::{Deserialize, Serialize};

use crate::escrutinio::*;

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct Station {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub municipality: Option<String>,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct ActionSource {
    pub provider: String,
    #[serde(rename = "filePath")]
    pub file_path: String,
}

/// Overrides of the default session timings, in milliseconds.
#[derive(Eq, PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
pub struct Timing {
    #[serde(rename = "geolocationTimeoutMs")]
    pub geolocation_timeout_ms: Option<u64>,
    #[serde(rename = "drainDelayMs")]
    pub drain_delay_ms: Option<u64>,
    #[serde(rename = "flushTimeoutMs")]
    pub flush_timeout_ms: Option<u64>,
    #[serde(rename = "shutdownGraceMs")]
    pub shutdown_grace_ms: Option<u64>,
}

#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub station: Station,
    #[serde(rename = "seatCount")]
    pub seat_count: u32,
    pub parties: Vec<String>,
    #[serde(rename = "actingUser")]
    pub acting_user: String,
    #[serde(rename = "actionSources", default)]
    pub action_sources: Vec<ActionSource>,
    pub gps: Option<GpsFix>,
    pub timing: Option<Timing>,
}

impl StationConfig {
    pub fn descriptor(&self) -> SessionDescriptor {
        SessionDescriptor {
            status: SessionStatus::Pending,
            seat_count: self.seat_count,
            parties: self.parties.iter().map(|p| PartyId::new(p.as_str())).collect(),
        }
    }

    pub fn settings(&self) -> SessionSettings {
        let mut settings = SessionSettings::DEFAULT_SETTINGS;
        let timing = self.timing.clone().unwrap_or_default();
        if let Some(ms) = timing.geolocation_timeout_ms {
            settings.geolocation_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = timing.drain_delay_ms {
            settings.drain_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = timing.flush_timeout_ms {
            settings.flush_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = timing.shutdown_grace_ms {
            settings.shutdown_grace = Duration::from_millis(ms);
        }
        settings
    }
}

pub fn read_config(path: &str) -> EscResult<StationConfig> {
    let contents = fs::read_to_string(path).context(OpeningFileSnafu { path })?;
    let config: StationConfig =
        serde_json::from_str(&contents).context(ParsingJsonSnafu { path })?;
    if config.parties.is_empty() || config.seat_count == 0 {
        whatever!(
            "Station {} needs at least one party and one seat",
            config.session_id
        );
    }
    Ok(config)
}

pub fn read_summary(path: &str) -> EscResult<JSValue> {
    let contents = fs::read_to_string(path).context(OpeningFileSnafu { path })?;
    let js: JSValue = serde_json::from_str(contents.as_str()).context(ParsingJsonSnafu { path })?;
    Ok(js)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_overrides_defaults() {
        let js = r#"{
            "sessionId": "hn-0142",
            "station": {"name": "JRV 0142"},
            "seatCount": 3,
            "parties": ["pdc", "libre"],
            "actingUser": "ana",
            "timing": {"drainDelayMs": 200}
        }"#;
        let config: StationConfig = serde_json::from_str(js).unwrap();
        let settings = config.settings();
        assert_eq!(settings.drain_delay, Duration::from_millis(200));
        assert_eq!(
            settings.flush_timeout,
            SessionSettings::DEFAULT_SETTINGS.flush_timeout
        );
        assert!(config.action_sources.is_empty());
        assert_eq!(config.descriptor().parties.len(), 2);
    }
}
