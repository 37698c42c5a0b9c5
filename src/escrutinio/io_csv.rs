// Primitives for reading CSV transcription logs.

use crate::escrutinio::io_common::ParsedAction;
use crate::escrutinio::*;

/// Reads a log with a header row: `action,party,slot,user,value`.
///
/// Line numbers in the result count the header, as a spreadsheet would.
pub fn read_csv_actions(path: &str) -> EscResult<Vec<(usize, ParsedAction)>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .context(CsvOpenSnafu { path })?;

    let mut res: Vec<(usize, ParsedAction)> = Vec::new();
    for (idx, line_r) in rdr.deserialize::<ParsedAction>().enumerate() {
        let lineno = idx + 2;
        let line = line_r.context(CsvLineParseSnafu { lineno })?;
        debug!("read_csv_actions: lineno: {:?} row: {:?}", lineno, &line);
        if line.action.is_empty() {
            continue;
        }
        res.push((lineno, line));
    }
    Ok(res)
}
