//! Log output for the `cascade` binary.
//!
//! Planner events go to stderr so stdout carries only the command summary.
//! Without `RUST_LOG`, the planner crates log at `info` (or `debug` with
//! `--verbose`) and every other crate at `warn`.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Crates whose events follow `--verbose`.
const PLANNER_TARGETS: [&str; 2] = ["cascade", "cascade_core"];

/// Filter directives used when `RUST_LOG` is unset.
pub fn default_directives(verbose: bool) -> String {
    let level = if verbose { "debug" } else { "info" };
    let mut directives = vec!["warn".to_string()];
    directives.extend(PLANNER_TARGETS.iter().map(|t| format!("{t}={level}")));
    directives.join(",")
}

/// Install the global subscriber. Later calls in the same process are no-ops.
///
/// With `verbose`, events also carry their module target so per-unit debug
/// lines can be traced back to the planning phase that emitted them.
pub fn init(verbose: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbose)));
    let layer = fmt::layer()
        .with_target(verbose)
        .with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(filter);

    let installed = if json {
        registry.with(layer.json()).try_init()
    } else {
        registry.with(layer).try_init()
    };
    if installed.is_err() {
        tracing::debug!("Subscriber already installed");
    }
}
