pub mod config;
pub mod error;
pub mod lifecycle;
pub mod middleware;
pub mod models;
pub mod pdp;
pub mod representation;
pub mod resolve;
pub mod routes;
pub mod state;

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` wins when set; otherwise
/// `verbose` turns on trace output for this crate.
pub fn init_tracing(log_json: bool, verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose {
            "attribute_pdp=trace,info"
        } else {
            "info"
        })
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let installed = if log_json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if let Err(e) = installed {
        eprintln!("tracing subscriber already installed: {e}");
    }
}
