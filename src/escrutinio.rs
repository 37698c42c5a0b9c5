use log::{debug, info, warn};

use legislative_tally::builder::SessionBuilder;
use legislative_tally::memory::StaticGeolocator;
use legislative_tally::persistence::JsonFilePersistence;
use legislative_tally::*;
use snafu::{prelude::*, Snafu};

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;
use serde_json::Map as JSMap;
use serde_json::Value as JSValue;
use text_diff::print_diff;

use crate::escrutinio::adapters::*;
use crate::escrutinio::config_reader::*;
use crate::escrutinio::io_common::{
    simplify_file_name, validate_action, Action, EvidenceSpec, ParsedAction,
};

pub mod adapters;
pub mod config_reader;
pub mod io_common;
pub mod io_csv;
pub mod io_json;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EscrutinioError {
    #[snafu(display("Error opening file {path}"))]
    OpeningFile {
        source: std::io::Error,
        path: String,
    },
    #[snafu(display("Error parsing JSON file {path}"))]
    ParsingJson {
        source: serde_json::Error,
        path: String,
    },
    #[snafu(display("Error opening CSV file {path}"))]
    CsvOpen { source: csv::Error, path: String },
    #[snafu(display("Error parsing CSV line {lineno}"))]
    CsvLineParse { source: csv::Error, lineno: usize },
    #[snafu(display("Line {lineno}: {message}"))]
    InvalidAction { lineno: usize, message: String },
    #[snafu(display("The configuration file has no parent directory"))]
    MissingParentDir {},
    #[snafu(display("Tally error"))]
    Tally { source: TallyError },

    #[snafu(whatever, display("{message}"))]
    Whatever {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error>, Some)))]
        source: Option<Box<dyn std::error::Error>>,
    },
}

pub type EscResult<T> = Result<T, EscrutinioError>;

/// What to replay, and where to put the results.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub config_path: Option<String>,
    pub reference_path: Option<String>,
    pub out: Option<String>,
    pub input: Option<String>,
    pub input_type: Option<String>,
    pub state_dir: Option<String>,
}

fn read_actions(
    root_p: &Path,
    opts: &RunOptions,
    config: &StationConfig,
) -> EscResult<Vec<(String, usize, ParsedAction)>> {
    let sources: Vec<ActionSource> = match opts.input.as_ref() {
        Some(input) => vec![ActionSource {
            provider: opts.input_type.clone().unwrap_or_else(|| "csv".to_string()),
            file_path: input.clone(),
        }],
        None => config
            .action_sources
            .iter()
            .map(|s| ActionSource {
                provider: s.provider.clone(),
                file_path: root_p.join(&s.file_path).display().to_string(),
            })
            .collect(),
    };
    if sources.is_empty() {
        whatever!("No action sources for station {}", config.session_id);
    }

    let mut res = Vec::new();
    for source in sources {
        let rows = match source.provider.as_str() {
            "csv" => io_csv::read_csv_actions(&source.file_path)?,
            "json" => io_json::read_json_actions(&source.file_path)?,
            x => whatever!("Provider not implemented {:?}", x),
        };
        info!(
            "read_actions: {} actions from {}",
            rows.len(),
            source.file_path
        );
        let name = simplify_file_name(&source.file_path);
        res.extend(rows.into_iter().map(|(lineno, pa)| (name.clone(), lineno, pa)));
    }
    Ok(res)
}

async fn apply_action(
    session: &mut EscrutinioSession,
    action: &Action,
    root_p: &Path,
) -> EscResult<()> {
    match action {
        Action::Start => session.start().context(TallySnafu)?,
        Action::Mark(key) => {
            session.toggle_mark(key).context(TallySnafu)?;
        }
        Action::Close => {
            session.close_papeleta().context(TallySnafu)?;
        }
        Action::Annul(reason) => {
            session.annul_papeleta(reason).context(TallySnafu)?;
        }
        Action::Expand(party) => session
            .set_expanded_party(party.clone())
            .context(TallySnafu)?,
        Action::Freeze(user) => {
            session.freeze(user).await.context(TallySnafu)?;
        }
        Action::Unfreeze(user) => {
            session.unfreeze(user).await.context(TallySnafu)?;
        }
        Action::Finalize { user, evidence } => {
            let evidence = match evidence {
                EvidenceSpec::Override => Evidence::Override,
                EvidenceSpec::Reference(r) => Evidence::Reference(r.clone()),
                EvidenceSpec::Photo(p) => {
                    let photo_p = root_p.join(p);
                    let blob = fs::read(&photo_p).context(OpeningFileSnafu {
                        path: photo_p.display().to_string(),
                    })?;
                    Evidence::Photo(blob)
                }
            };
            session.finalize(user, evidence).await.context(TallySnafu)?;
        }
        Action::Reopen => session.reopen().context(TallySnafu)?,
    }
    Ok(())
}

/// Errors a transcriber can cause by recording an impossible action. The
/// session refuses them and nothing changes.
fn is_rejection(e: &TallyError) -> bool {
    matches!(
        e,
        TallyError::InvalidBallotState { .. }
            | TallyError::SeatLimitReached { .. }
            | TallyError::UnknownParty { .. }
            | TallyError::SlotOutOfRange { .. }
            | TallyError::SessionLocked { .. }
            | TallyError::InvalidTransition { .. }
            | TallyError::EvidenceRequired {}
    )
}

/// Replays the actions in order. Returns the number of applied and rejected actions.
async fn replay_actions(
    session: &mut EscrutinioSession,
    actions: &[(String, usize, ParsedAction)],
    acting_user: &str,
    root_p: &Path,
) -> EscResult<(usize, usize)> {
    let mut applied = 0;
    let mut rejected = 0;
    for (file_name, lineno, pa) in actions {
        let action = validate_action(pa, *lineno, acting_user)?;
        debug!("replay_actions: {}:{} {:?}", file_name, lineno, action);
        match apply_action(session, &action, root_p).await {
            Ok(()) => applied += 1,
            Err(EscrutinioError::Tally { source }) if is_rejection(&source) => {
                warn!(
                    "replay_actions: {}:{} {:?} rejected: {}",
                    file_name, lineno, action, source
                );
                rejected += 1;
            }
            Err(e) => return Err(e),
        }
    }
    Ok((applied, rejected))
}

fn build_summary_js(
    config: &StationConfig,
    session: &EscrutinioSession,
    applied: usize,
    rejected: usize,
) -> JSValue {
    let layout: Vec<JSValue> = session
        .layout()
        .ranges()
        .iter()
        .map(|(p, r)| json!({"party": p.as_str(), "start": r.start, "end": r.end}))
        .collect();

    let totals = session.party_totals();
    let mut results: Vec<JSValue> = Vec::new();
    for (p, r) in session.layout().ranges() {
        let mut slots: JSMap<String, JSValue> = JSMap::new();
        for slot in r.slots.iter() {
            let count = session.get_count(&SlotKey::new(p.clone(), *slot));
            slots.insert(slot.to_string(), json!(count));
        }
        results.push(json!({
            "party": p.as_str(),
            "total": totals.get(p).copied().unwrap_or(0),
            "slots": slots
        }));
    }

    let checkpoints: Vec<JSValue> = session
        .checkpoints()
        .iter()
        .map(|c| {
            json!({
                "index": c.index,
                "action": c.action.to_string(),
                "actingUser": c.acting_user,
                "totalVotes": c.total_votes(),
                "gps": c.gps.is_some()
            })
        })
        .collect();

    let final_tally = session.final_tally().map(|t| {
        json!({
            "evidence": t.evidence_url,
            "finalizedBy": t.finalized_by
        })
    });

    json!({
        "config": {
            "sessionId": config.session_id,
            "station": config.station,
            "seatCount": config.seat_count,
            "parties": config.parties,
        },
        "status": session.status().to_string(),
        "expandedParty": session.expanded_party().map(|p| p.as_str()),
        "layout": layout,
        "results": results,
        "papeletas": {
            "current": session.current_papeleta().sequence,
            "closed": session.closed_count(),
            "annulled": session.annulled_count(),
            "completedBallots": session.completed_count(),
        },
        "checkpoints": checkpoints,
        "chainVerified": verify_chain(session.checkpoints()),
        "finalTally": final_tally,
        "actions": {"applied": applied, "rejected": rejected},
    })
}

/// Replays the transcription log of a station and returns its summary.
pub async fn run_session(opts: RunOptions) -> EscResult<JSValue> {
    let config_path = match opts.config_path.as_ref() {
        Some(p) => p.clone(),
        None => whatever!("A configuration file must be provided with --config"),
    };
    let config_p = Path::new(config_path.as_str());
    let config = read_config(&config_path)?;
    info!("config: {:?}", config);
    let root_p = config_p.parent().context(MissingParentDirSnafu {})?;

    let actions = read_actions(root_p, &opts, &config)?;

    let state_p: PathBuf = match opts.state_dir.as_ref() {
        Some(d) => PathBuf::from(d),
        None => root_p.join(".escrutinio"),
    };
    info!("run_session: state directory {}", state_p.display());
    let remote = Arc::new(FileRemote::new(state_subdir(&state_p, "remote")?));
    let session_id = SessionId::new(config.session_id.as_str());
    remote.register(&session_id, &config.descriptor())?;

    let geolocator = match config.gps {
        Some(fix) => StaticGeolocator::at(fix),
        None => StaticGeolocator::unavailable(),
    };
    let persistence =
        JsonFilePersistence::new(state_subdir(&state_p, "local")?).context(TallySnafu)?;
    let settings = config.settings();
    let mut session = SessionBuilder::new(&settings)
        .remote(remote.clone())
        .status_query(remote)
        .checkpoint_transport(Arc::new(FileCheckpointTransport::new(state_subdir(
            &state_p,
            "checkpoints",
        )?)))
        .evidence_store(Arc::new(FileEvidenceStore::new(state_subdir(
            &state_p, "evidence",
        )?)))
        .submitter(Arc::new(FileSubmitter::new(state_subdir(&state_p, "final")?)))
        .geolocator(Arc::new(geolocator))
        .persistence(Arc::new(persistence))
        .open(session_id)
        .await
        .context(TallySnafu)?;

    let replayed = replay_actions(&mut session, &actions, &config.acting_user, root_p).await;
    let summary = replayed.map(|(applied, rejected)| {
        info!(
            "run_session: {} actions applied, {} rejected",
            applied, rejected
        );
        build_summary_js(&config, &session, applied, rejected)
    });

    // The session is closed even if the replay failed, so that pending
    // updates are kept for the next run.
    let left = session
        .close(settings.shutdown_grace)
        .await
        .context(TallySnafu)?;
    if !left.is_empty() {
        warn!(
            "run_session: {} count updates not synchronized, kept in the local state",
            left.len()
        );
    }
    let summary_js = summary?;

    let pretty_js_summary =
        serde_json::to_string_pretty(&summary_js).context(ParsingJsonSnafu {
            path: config_path.clone(),
        })?;
    match opts.out.as_deref() {
        None | Some("stdout") => println!("summary:{}", pretty_js_summary),
        Some(out_path) => {
            fs::write(out_path, &pretty_js_summary).context(OpeningFileSnafu { path: out_path })?;
            info!("run_session: summary written to {}", out_path);
        }
    }

    // The reference summary, if provided for comparison
    if let Some(summary_p) = opts.reference_path.as_ref() {
        let summary_ref = read_summary(summary_p)?;
        let pretty_js_summary_ref =
            serde_json::to_string_pretty(&summary_ref).context(ParsingJsonSnafu {
                path: summary_p.clone(),
            })?;
        if pretty_js_summary_ref != pretty_js_summary {
            warn!("Found differences with the reference summary");
            print_diff(
                pretty_js_summary_ref.as_str(),
                pretty_js_summary.as_str(),
                "\n",
            );
            whatever!("Difference detected between calculated summary and reference summary")
        }
    }

    Ok(summary_js)
}
