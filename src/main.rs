mod args;
mod escrutinio;

use clap::Parser;
use log::{debug, info};
use snafu::ErrorCompat;

use crate::args::Args;
use crate::escrutinio::RunOptions;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if args.verbose {
        env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }
    debug!("args: {:?}", args);

    let opts = RunOptions {
        config_path: args.config,
        reference_path: args.reference,
        out: args.out,
        input: args.input,
        input_type: args.input_type,
        state_dir: args.state_dir,
    };
    match escrutinio::run_session(opts).await {
        Ok(_) => info!("done"),
        Err(e) => {
            eprintln!("An error occured {}", e);
            if let Some(bt) = ErrorCompat::backtrace(&e) {
                eprintln!("trace: {}", bt);
            }
            std::process::exit(1);
        }
    }
}
