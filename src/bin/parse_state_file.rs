//! Reads a serialized view state file and prints its textual
//! representation to stdout. The inverse of `create_state_file`.

use std::process::ExitCode;

use clap::Parser;
use env_logger::Env;
use shardcast::load_view;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Path of the view state file to read.
    path: String,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .init();

    let args = match CliArgs::try_parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(1);
        }
    };

    match load_view(&args.path) {
        Ok(view) => {
            print!("{}", view.to_text());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error reading '{}': {}", args.path, e);
            ExitCode::from(2)
        }
    }
}
