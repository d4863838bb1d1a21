//! Tracing setup for the `gauntlet` binary.
//!
//! Log lines go to stderr; stdout carries the sprint's event stream and
//! final report.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter variable checked before `RUST_LOG`.
pub const ENV_LOG: &str = "GAUNTLET_LOG";

/// Directive used when neither variable is set.
fn default_directive(level: Level) -> String {
    format!("warn,gauntlet_core={level},gauntlet_state={level},gauntlet={level}").to_lowercase()
}

fn build_filter(lookup: impl Fn(&str) -> Option<String>, level: Level) -> EnvFilter {
    [ENV_LOG, "RUST_LOG"]
        .iter()
        .filter_map(|var| lookup(var))
        .find_map(|directive| EnvFilter::try_new(directive).ok())
        .unwrap_or_else(|| EnvFilter::new(default_directive(level)))
}

/// Install the global subscriber. Only the first call in a process wins.
///
/// * `json`: newline-delimited JSON log lines instead of human output.
/// * `level`: verbosity for the gauntlet crates when no filter variable is set.
pub fn init_tracing(json: bool, level: Level) {
    let filter = build_filter(|var| std::env::var(var).ok(), level);
    let layer = fmt::layer().with_target(false).with_writer(std::io::stderr);

    let registry = tracing_subscriber::registry().with(filter);
    let _ = if json {
        registry.with(layer.json()).try_init()
    } else {
        registry.with(layer).try_init()
    };
}
