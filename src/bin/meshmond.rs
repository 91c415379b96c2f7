use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use meshmon::config;
use meshmon::daemon::run_daemon;
use meshmon::telemetry;

#[derive(Parser)]
#[command(name = "meshmond", version, about = "Distributed monitoring daemon")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon (default).
    Run,
    /// Validate the configuration and print the effective settings.
    CheckConfig,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let path = cli.config.unwrap_or_else(config::default_config_path);

    let config = match config::load(&path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("meshmond: {err}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command.unwrap_or(Command::Run) {
        Command::CheckConfig => {
            match serde_json::to_string_pretty(&config) {
                Ok(rendered) => {
                    println!("{rendered}");
                    ExitCode::SUCCESS
                }
                Err(err) => {
                    eprintln!("meshmond: {err}");
                    ExitCode::FAILURE
                }
            }
        }
        Command::Run => {
            telemetry::init(&config.logging);
            match run_daemon(config, Some(&path)) {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    tracing::error!(%err, "daemon failed");
                    ExitCode::FAILURE
                }
            }
        }
    }
}
