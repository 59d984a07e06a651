//! `sandcastle`: copy root accounts and their related records from a
//! production org into a sandbox.
//!
//! Usage: `sandcastle [--config PATH] [-s ALIAS] [-t ALIAS] [--no-delete]`
//!
//! Exit codes: 0 success, 1 unexpected failure, 2 configuration,
//! 3 unsafe target, 4 bulk job failure.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use sandcastle_lib::audit::prune_run_logs;
use sandcastle_lib::config::{default_config_path, load_config, Config, Overrides};
use sandcastle_lib::error::MigrationError;
use sandcastle_lib::logging;

#[derive(Debug, Parser)]
#[command(name = "sandcastle", version, about)]
struct Cli {
    /// Config file. Defaults to ~/Sandcastle.json.
    #[arg(long, env = "SANDCASTLE_CONFIG")]
    config: Option<PathBuf>,

    /// Source org alias, overriding the config file.
    #[arg(short = 's', long)]
    source_alias: Option<String>,

    /// Target sandbox alias, overriding the config file.
    #[arg(short = 't', long)]
    target_alias: Option<String>,

    /// Leave existing target records in place.
    #[arg(long)]
    no_delete: bool,

    /// Directory for ledgers and logs.
    #[arg(long)]
    work_dir: Option<PathBuf>,
}

fn resolve_config(cli: Cli) -> Result<Config, MigrationError> {
    let path = match cli.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let mut config = load_config(&path)?;
    config.apply_overrides(Overrides {
        source_alias: cli.source_alias,
        target_alias: cli.target_alias,
        no_delete: cli.no_delete,
        work_dir: cli.work_dir,
    });
    config.validate()?;
    Ok(config)
}

fn report_failure(error: &MigrationError) -> ExitCode {
    eprintln!("Error: {error}");
    eprintln!("  {}", error.recovery_suggestion());
    ExitCode::from(error.exit_code() as u8)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match resolve_config(cli) {
        Ok(config) => config,
        Err(e) => return report_failure(&e),
    };

    let work_dir = config.work_dir();
    match logging::init(&work_dir) {
        Ok(path) => log::info!("Run log: {}", path.display()),
        Err(e) => eprintln!("Run log unavailable ({e}); logging to stderr only"),
    }
    let pruned = prune_run_logs(&work_dir, config.log_retention_days);
    if pruned > 0 {
        log::info!("Removed {} run log(s) older than {} days", pruned, config.log_retention_days);
    }

    match sandcastle_lib::run(config).await {
        Ok(outcome) => {
            println!("{}", outcome.render_table());
            ExitCode::SUCCESS
        }
        Err(aborted) => {
            if !aborted.outcome.kinds.is_empty() {
                println!("{}", aborted.outcome.render_table());
            }
            report_failure(&aborted.error)
        }
    }
}
