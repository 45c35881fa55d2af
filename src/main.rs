use clap::Parser;
use colored::Colorize;
use std::process;
use std::str::FromStr;
use tracing::{warn, Level};

use gpu_cluster_manager::cli::{self, Cli};
use gpu_cluster_manager::errors::{EXIT_INVALID_ARGUMENT, EXIT_SUCCESS};

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() { EXIT_INVALID_ARGUMENT } else { EXIT_SUCCESS };
            let _ = err.print();
            process::exit(code);
        }
    };

    let settings = match cli::load_settings(&cli) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("{} {err}", "error:".red().bold());
            process::exit(err.exit_code());
        }
    };

    let level = Level::from_str(&settings.log_level);
    tracing_subscriber::fmt()
        .with_max_level(*level.as_ref().unwrap_or(&Level::INFO))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
    if level.is_err() {
        warn!(level = %settings.log_level, "Unknown log level, using info");
    }

    let code = match cli::run(cli, settings).await {
        Ok(()) => EXIT_SUCCESS,
        Err(err) => {
            cli::report_error(&err);
            cli::exit_code(&err)
        }
    };
    process::exit(code);
}
