use clap::Parser;

/// This program replays the transcription log of a polling station through the tally core.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// (file path) The JSON description of the station: session id, seats, parties and action sources.
    /// For more information about the file format, read the documentation of the `manual` module.
    #[clap(short, long, value_parser)]
    pub config: Option<String>,
    /// (file path) A reference file containing the expected station summary in JSON format. If provided,
    /// escrutinio will check that the computed summary matches the reference.
    #[clap(short, long, value_parser)]
    pub reference: Option<String>,

    /// (file path, 'stdout' or empty) If specified, the summary of the station will be written in JSON
    /// format to the given location.
    #[clap(short, long, value_parser)]
    pub out: Option<String>,

    /// (file path or empty) If specified, the transcription log to replay. Setting this option overrides
    /// the action sources of the configuration.
    #[clap(short, long, value_parser)]
    pub input: Option<String>,

    /// (default csv) The type of the input: csv or json.
    #[clap(long, value_parser)]
    pub input_type: Option<String>,

    /// (directory) Where the file-based remote services and the local session state are kept.
    /// Defaults to `.escrutinio` next to the configuration file.
    #[clap(long, value_parser)]
    pub state_dir: Option<String>,

    // Other arguments
    /// If passed as an argument, will turn on verbose logging to the standard output.
    #[clap(long, takes_value = false)]
    pub verbose: bool,
}
