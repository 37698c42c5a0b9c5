use std::path::Path;

use legislative_tally::{PartyId, SessionId, SlotKey};
use serde::{Deserialize, Serialize};

use crate::escrutinio::*;

/// One row of a transcription log, as written by the transcriber.
#[derive(Eq, PartialEq, Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedAction {
    pub action: String,
    #[serde(default)]
    pub party: Option<String>,
    #[serde(default)]
    pub slot: Option<u32>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum EvidenceSpec {
    Override,
    /// A photo file, relative to the configuration file.
    Photo(String),
    Reference(String),
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum Action {
    Start,
    Mark(SlotKey),
    Close,
    Annul(String),
    Expand(Option<PartyId>),
    Freeze(String),
    Unfreeze(String),
    Finalize { user: String, evidence: EvidenceSpec },
    Reopen,
}

fn non_empty(s: &Option<String>) -> Option<&str> {
    s.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Turns a log row into an action. `lineno` is only used for error messages.
pub fn validate_action(pa: &ParsedAction, lineno: usize, default_user: &str) -> EscResult<Action> {
    let user = non_empty(&pa.user).unwrap_or(default_user).to_string();
    let res = match pa.action.trim().to_lowercase().as_str() {
        "start" => Action::Start,
        "mark" => {
            let party = non_empty(&pa.party).context(InvalidActionSnafu {
                lineno,
                message: "mark without a party",
            })?;
            let slot = pa.slot.context(InvalidActionSnafu {
                lineno,
                message: "mark without a slot",
            })?;
            Action::Mark(SlotKey::new(party, slot))
        }
        "close" => Action::Close,
        "annul" => Action::Annul(non_empty(&pa.value).unwrap_or("").to_string()),
        "expand" => Action::Expand(non_empty(&pa.party).map(PartyId::from)),
        "freeze" => Action::Freeze(user),
        "unfreeze" => Action::Unfreeze(user),
        "finalize" => {
            let evidence = match non_empty(&pa.value) {
                Some("override") => EvidenceSpec::Override,
                Some(v) => match v.strip_prefix("photo:") {
                    Some(path) => EvidenceSpec::Photo(path.to_string()),
                    None => EvidenceSpec::Reference(v.to_string()),
                },
                None => EvidenceSpec::Reference(String::new()),
            };
            Action::Finalize { user, evidence }
        }
        "reopen" => Action::Reopen,
        x => {
            return InvalidActionSnafu {
                lineno,
                message: format!("unknown action {:?}", x),
            }
            .fail()
        }
    };
    Ok(res)
}

pub fn simplify_file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(path)
        .to_string()
}

/// A file name fragment for a session id.
pub fn session_file_stem(session_id: &SessionId) -> String {
    session_id
        .as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(action: &str, party: Option<&str>, slot: Option<u32>, value: Option<&str>) -> ParsedAction {
        ParsedAction {
            action: action.to_string(),
            party: party.map(|s| s.to_string()),
            slot,
            user: None,
            value: value.map(|s| s.to_string()),
        }
    }

    #[test]
    fn actions_are_validated() {
        assert_eq!(
            validate_action(&row("mark", Some("pdc"), Some(1), None), 1, "ana").unwrap(),
            Action::Mark(SlotKey::new("pdc", 1))
        );
        assert_eq!(
            validate_action(&row(" Freeze ", None, None, None), 2, "ana").unwrap(),
            Action::Freeze("ana".to_string())
        );
        assert_eq!(
            validate_action(&row("expand", Some(""), None, None), 3, "ana").unwrap(),
            Action::Expand(None)
        );
        assert!(matches!(
            validate_action(&row("mark", Some("pdc"), None, None), 4, "ana"),
            Err(EscrutinioError::InvalidAction { lineno: 4, .. })
        ));
        assert!(validate_action(&row("recount", None, None, None), 5, "ana").is_err());
    }

    #[test]
    fn finalize_evidence_forms() {
        let ev = |v: Option<&str>| match validate_action(&row("finalize", None, None, v), 1, "ana") {
            Ok(Action::Finalize { evidence, .. }) => evidence,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(ev(Some("override")), EvidenceSpec::Override);
        assert_eq!(ev(Some("photo:acta.jpg")), EvidenceSpec::Photo("acta.jpg".to_string()));
        assert_eq!(
            ev(Some("https://evidencia/acta-1")),
            EvidenceSpec::Reference("https://evidencia/acta-1".to_string())
        );
        assert_eq!(ev(None), EvidenceSpec::Reference(String::new()));
    }

    #[test]
    fn session_ids_map_to_file_names() {
        assert_eq!(session_file_stem(&"hn/0142 dip".into()), "hn_0142_dip");
        assert_eq!(simplify_file_name("/tmp/x/actions.csv"), "actions.csv");
    }
}
