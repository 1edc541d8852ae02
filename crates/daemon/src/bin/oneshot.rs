//! Run exactly one reconciliation cycle synchronously and exit.
//!
//! Useful for cron-style integrations and debugging: no server, no workers,
//! just the state machine against the configured store and sources.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use common::ident::ChangeNotification;

use retcon_daemon::config::{resolve_config_path, Config};
use retcon_daemon::database::WorkItem;
use retcon_daemon::state::{State, StateSetupError};
use retcon_daemon::worker::reconcile::execute;

/// One-shot Retcon reconciliation.
#[derive(Parser, Debug)]
#[command(name = "retcon-oneshot", version, about)]
struct Args {
    /// Path to the TOML config file. RETCON_CONFIG overrides this.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Entity the change belongs to.
    entity: String,

    /// Source that reported the change.
    source: String,

    /// Foreign id of the changed document.
    fid: String,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    retcon_daemon::init_tracing(args.verbose);

    let notification = match parse_notification(&args) {
        Ok(n) => n,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::from(1);
        }
    };

    let config = match resolve_config_path(args.config).and_then(Config::load) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::from(1);
        }
    };

    let state = match State::from_config(&config).await {
        Ok(state) => state,
        Err(e @ StateSetupError::Store(_)) => {
            tracing::error!("{e}");
            return ExitCode::from(2);
        }
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::from(1);
        }
    };
    if let Err(e) = state.registry().init_all().await {
        tracing::error!("source init failed: {e}");
        return ExitCode::from(1);
    }

    let item = WorkItem::Process(notification);
    let result = tokio::time::timeout(
        state.tuning().reconcile_timeout,
        execute(&state, &item),
    )
    .await;
    state.registry().close_all().await;

    match result {
        Ok(Ok(outcome)) => {
            println!("{outcome:?}");
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            tracing::error!("reconciliation failed: {e}");
            ExitCode::from(1)
        }
        Err(_) => {
            tracing::error!("reconciliation timed out");
            ExitCode::from(1)
        }
    }
}

fn parse_notification(args: &Args) -> Result<ChangeNotification, String> {
    let entity = args
        .entity
        .parse()
        .map_err(|e| format!("invalid entity name: {e}"))?;
    let source = args
        .source
        .parse()
        .map_err(|e| format!("invalid source name: {e}"))?;
    Ok(ChangeNotification::new(entity, source, args.fid.clone()))
}
