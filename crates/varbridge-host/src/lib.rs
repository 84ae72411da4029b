//! Host side of varbridge: an in-memory symbol table with a small expression
//! language, a line console, and tracing setup for the `varbridge-peer` binary.

pub mod console;
pub mod eval;
pub mod table;

use std::io::IsTerminal;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

pub use console::{Console, Flow};
pub use table::{Function, MemoryTable};

/// Crates whose events `VARBRIDGE_LOG=<level>` applies to. Everything else stays at warn.
const OWN_TARGETS: [&str; 3] = ["varbridge", "varbridge_host", "varbridge_peer"];

/// Install the stderr subscriber for `varbridge-peer`.
///
/// `VARBRIDGE_LOG` takes a level name or full filter directives and wins over
/// `RUST_LOG`. `VARBRIDGE_LOG_FORMAT` selects `json`, `compact` or the default
/// full format. Nothing is written to stdout; it may carry a protocol stream.
pub fn init_tracing() {
    let directives = filter_directives(
        std::env::var("VARBRIDGE_LOG").ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
    );
    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|e| {
        eprintln!("ignoring log filter {directives:?}: {e}");
        EnvFilter::new(filter_directives(None, None))
    });

    let ansi = std::io::stderr().is_terminal();
    let registry = tracing_subscriber::registry().with(filter);
    // An embedding process may already have installed a subscriber; keep it.
    let _ = match std::env::var("VARBRIDGE_LOG_FORMAT").as_deref() {
        Ok("json") => registry
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        Ok("compact") => registry
            .with(fmt::layer().compact().with_ansi(ansi).with_writer(std::io::stderr))
            .try_init(),
        _ => registry
            .with(fmt::layer().with_ansi(ansi).with_writer(std::io::stderr))
            .try_init(),
    };
}

fn filter_directives(varbridge_log: Option<&str>, rust_log: Option<&str>) -> String {
    let level = match varbridge_log.map(str::trim) {
        Some(value) if value.contains('=') || value.contains(',') => return value.to_string(),
        Some("warning") => "warn",
        Some(level @ ("trace" | "debug" | "info" | "warn" | "error" | "off")) => level,
        _ => match rust_log {
            Some(directives) if !directives.trim().is_empty() => return directives.to_string(),
            _ => "info",
        },
    };
    let mut directives = String::from("warn");
    for target in OWN_TARGETS {
        directives.push_str(&format!(",{target}={level}"));
    }
    directives
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_apply_to_own_crates() {
        assert_eq!(
            filter_directives(Some("debug"), None),
            "warn,varbridge=debug,varbridge_host=debug,varbridge_peer=debug"
        );
        assert_eq!(
            filter_directives(Some("warning"), Some("trace")),
            "warn,varbridge=warn,varbridge_host=warn,varbridge_peer=warn"
        );
    }

    #[test]
    fn directives_pass_through() {
        assert_eq!(
            filter_directives(Some("varbridge::session=trace"), None),
            "varbridge::session=trace"
        );
        assert_eq!(filter_directives(None, Some("tokio=debug")), "tokio=debug");
        assert_eq!(filter_directives(Some("loud"), Some("error")), "error");
    }

    #[test]
    fn defaults_to_info() {
        assert_eq!(
            filter_directives(None, Some(" ")),
            "warn,varbridge=info,varbridge_host=info,varbridge_peer=info"
        );
    }
}
