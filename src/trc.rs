//! Log output setup.
//!
//! Interactive runs get compact, colored lines drawn through an indicatif layer so progress bars
//! and log lines do not tear each other. Setting `RESTFS_LOG` (or `RUST_LOG`) switches to plain
//! output with span timings, which is also what a daemonized process always gets.

use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::{SubscriberInitExt as _, TryInitError};

use crate::term;

const DEFAULT_DIRECTIVES: &str = "info";

/// The filter the user asked for, if any.
fn requested_filter() -> Option<EnvFilter> {
    EnvFilter::try_from_env("RESTFS_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .ok()
}

/// Install the global subscriber. Fails only if one is already installed.
pub fn init(daemonized: bool) -> Result<(), TryInitError> {
    let color = term::should_use_color(&std::io::stderr());
    match (requested_filter(), daemonized) {
        (Some(filter), _) => plain(filter, color),
        (None, true) => plain(EnvFilter::new(DEFAULT_DIRECTIVES), false),
        (None, false) => interactive(color),
    }
}

fn plain(filter: EnvFilter, color: bool) -> Result<(), TryInitError> {
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(color)
        .with_thread_names(true)
        .with_span_events(FmtSpan::CLOSE)
        .finish()
        .try_init()
}

fn interactive(color: bool) -> Result<(), TryInitError> {
    let bars = IndicatifLayer::new();
    let lines = tracing_subscriber::fmt::layer()
        .compact()
        .without_time()
        .with_target(false)
        .with_ansi(color)
        .with_writer(bars.get_stderr_writer());

    tracing_subscriber::registry()
        .with(EnvFilter::new(DEFAULT_DIRECTIVES))
        .with(lines)
        .with(bars)
        .try_init()
}
