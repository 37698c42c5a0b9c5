use crate::escrutinio::io_common::ParsedAction;
use crate::escrutinio::*;

/// Reads a log written as a JSON array of actions.
pub fn read_json_actions(path: &str) -> EscResult<Vec<(usize, ParsedAction)>> {
    let contents = fs::read_to_string(path).context(OpeningFileSnafu { path })?;
    let actions: Vec<ParsedAction> =
        serde_json::from_str(contents.as_str()).context(ParsingJsonSnafu { path })?;
    debug!("read_json_actions: {} actions in {}", actions.len(), path);
    Ok(actions
        .into_iter()
        .enumerate()
        .map(|(idx, a)| (idx + 1, a))
        .collect())
}
