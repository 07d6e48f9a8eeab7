//! Tracing initialisation for the shipgate binary.
//!
//! Logs go to stderr; stdout carries command output (plans, versions, run
//! summaries) and must stay parseable.

use std::io::IsTerminal;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. Only the first call in a process has an
/// effect.
///
/// `RUST_LOG` overrides `level`. In JSON mode every line carries the
/// enclosing `shipgate.run` span, so one run can be filtered by `run_id`.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let installed = if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer.json().with_current_span(true).with_span_list(false))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer.with_ansi(std::io::stderr().is_terminal()).compact())
            .try_init()
    };
    // A subscriber set by an embedding process or an earlier call wins.
    installed.ok();
}
