//! Reads a textual representation of a View from stdin and creates the
//! serialized view state file containing the equivalent data. The inverse
//! of `parse_state_file`.

use std::io::Read;
use std::process::ExitCode;

use clap::Parser;
use env_logger::Env;
use shardcast::{persist_view, View};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Path of the view state file to create.
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

    let mut text = String::new();
    if let Err(e) = std::io::stdin().read_to_string(&mut text) {
        eprintln!("error reading view text from stdin: {}", e);
        return ExitCode::from(2);
    }

    let view = match View::parse_text(&text) {
        Ok(view) => view,
        Err(e) => {
            eprintln!("malformed view text: {}", e);
            return ExitCode::from(1);
        }
    };

    if let Err(e) = persist_view(&view, &args.path) {
        eprintln!("error writing '{}': {}", args.path, e);
        return ExitCode::from(2);
    }
    ExitCode::SUCCESS
}
