//! ---
//! mes_section: "01-core-functionality"
//! mes_subsection: "module"
//! mes_type: "source"
//! mes_scope: "code"
//! mes_description: "Shared primitives and utilities for the integration engine."
//! mes_version: "v0.0.0-prealpha"
//! mes_owner: "tbd"
//! ---
use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, Span};
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "R_MES_LOG";
const DEFAULT_DIRECTIVE: &str = "info";

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();
static STDOUT_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Available stdout log formats.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Span carried by everything a conveyor line worker logs.
pub fn line_span(line: &str) -> Span {
    info_span!("line", line = %line)
}

/// Span carried by a field endpoint's dispatch loop.
pub fn endpoint_span(endpoint: &str) -> Span {
    info_span!("endpoint", endpoint = %endpoint)
}

/// Filter directive in effect: `R_MES_LOG`, then `logging.filter` from the
/// configuration, then `RUST_LOG`, then `info`.
fn filter_directive(
    env_override: Option<String>,
    configured: Option<&str>,
    rust_log: Option<String>,
) -> String {
    env_override
        .or_else(|| configured.map(str::to_owned))
        .or(rust_log)
        .filter(|directive| !directive.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_DIRECTIVE.to_owned())
}

/// Initialise the global tracing subscriber.
///
/// * The filter follows [`filter_directive`] (e.g. `info,r_mes_net=debug`).
/// * stdout receives JSON or pretty output depending on `config.format`, and a
///   daily rolling JSON file is written under `config.directory`. JSON records
///   carry the fields of the enclosing `line` / `endpoint` span.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.directory)?;
    let prefix = config
        .file_prefix
        .clone()
        .unwrap_or_else(|| service_name.to_owned());

    let file_appender = daily(&config.directory, format!("{prefix}.log"));
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let _ = FILE_GUARD.set(file_guard);
    let _ = STDOUT_GUARD.set(stdout_guard);

    let directive = filter_directive(
        std::env::var(LOG_ENV).ok(),
        config.filter.as_deref(),
        std::env::var(EnvFilter::DEFAULT_ENV).ok(),
    );
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|err| {
        eprintln!("invalid log directive '{directive}' ({err}); defaulting to {DEFAULT_DIRECTIVE}");
        EnvFilter::new(DEFAULT_DIRECTIVE)
    });

    let stdout_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };

    let file_layer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_writer(file_writer)
        .boxed();

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .ok();

    info!(service = %service_name, log_dir = %config.directory.display(), format = ?config.format, filter = %directive, "tracing initialised");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_override_beats_configuration_and_rust_log() {
        assert_eq!(
            filter_directive(
                Some("debug".into()),
                Some("warn"),
                Some("trace".into())
            ),
            "debug"
        );
        assert_eq!(
            filter_directive(None, Some("info,r_mes_net=debug"), Some("trace".into())),
            "info,r_mes_net=debug"
        );
        assert_eq!(filter_directive(None, None, Some("trace".into())), "trace");
    }

    #[test]
    fn blank_directives_fall_back_to_info() {
        assert_eq!(filter_directive(None, None, None), "info");
        assert_eq!(filter_directive(Some("  ".into()), None, None), "info");
    }
}
