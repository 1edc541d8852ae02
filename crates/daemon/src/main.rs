use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use retcon_daemon::config::{resolve_config_path, Config};

/// Retcon reconciliation daemon.
#[derive(Parser, Debug)]
#[command(name = "retcond", version, about)]
struct Args {
    /// Path to the TOML config file. RETCON_CONFIG overrides this.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    retcon_daemon::init_tracing(args.verbose);

    let path = match resolve_config_path(args.config) {
        Ok(path) => path,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::from(1);
        }
    };
    let config = match Config::load(&path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::from(1);
        }
    };

    match retcon_daemon::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}
