//! Retcon daemon: reconciles structured documents mirrored across external
//! data sources.
//!
//! The crate wires the core model from `common` to the outside world: a
//! sqlite store holding the key tables and the durable work queue, a pool of
//! reconciliation workers, the framed request/reply server, and the
//! configuration and metrics surfaces. The binaries (`retcond`,
//! `retcon-client`, `retcon-oneshot`) are thin wrappers over this library.

pub mod config;
pub mod database;
pub mod metrics;
pub mod server;
pub mod service;
pub mod sources;
pub mod state;
pub mod worker;

pub use config::Config;
pub use service::{run, ServiceError};
pub use state::{State, Tuning};

/// Install the stderr tracing subscriber. `RUST_LOG` wins over the verbosity
/// flag when set.
pub fn init_tracing(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
