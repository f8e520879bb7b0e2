//! Tracing setup for the conductor binary.
//!
//! Diagnostics go to stderr so that command output on stdout stays clean.
//! `RUST_LOG` always wins over the built-in filter.

use std::io::IsTerminal;
use tracing::{Level, span};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::session::PhaseName;

fn use_color() -> bool {
    std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none()
}

fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "conductor=debug,info"
    } else {
        "conductor=info,warn"
    }
}

/// Initialize the global tracing subscriber.
///
/// * `verbose` - debug level for the crate and span close events
/// * `json` - emit one JSON object per line instead of compact text
pub fn init_tracing(verbose: bool, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter(verbose)))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let span_events = if verbose {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_span_events(span_events)
                    .with_current_span(true),
            )
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(use_color())
                    .with_target(verbose)
                    .with_thread_ids(false)
                    .with_line_number(false)
                    .with_file(false)
                    .with_span_events(span_events)
                    .compact(),
            )
            .try_init()?;
    }

    Ok(())
}

/// Span wrapping one attempt of one phase.
pub fn phase_span(session_id: &str, phase: PhaseName, attempt: u32) -> tracing::Span {
    span!(
        Level::INFO,
        "phase",
        session_id = %session_id,
        phase = %phase,
        attempt = attempt,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_levels() {
        assert!(default_filter(true).contains("conductor=debug"));
        assert!(default_filter(false).contains("conductor=info"));
    }

    #[test]
    fn test_phase_span_is_constructible_without_subscriber() {
        let span = phase_span("abc", PhaseName::Plan, 1);
        let _entered = span.enter();
    }
}
