//! ---
//! psu_section: "01-core-functionality"
//! psu_subsection: "module"
//! psu_type: "source"
//! psu_scope: "code"
//! psu_description: "Shared primitives and utilities for the redundancy daemon."
//! psu_version: "v0.0.0-prealpha"
//! psu_owner: "tbd"
//! ---
use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{info, Subscriber};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::{self, time::UtcTime};
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "PSU_REDUNDANCY_LOG";
const DEFAULT_DIRECTIVE: &str = "info";

static GUARDS: OnceCell<Vec<WorkerGuard>> = OnceCell::new();

/// Available log formats for the daemon.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterSource {
    Daemon,
    RustLog,
    Default,
}

fn resolve_filter() -> (EnvFilter, FilterSource) {
    if let Ok(directive) = std::env::var(LOG_ENV) {
        match EnvFilter::try_new(&directive) {
            Ok(filter) => return (filter, FilterSource::Daemon),
            Err(err) => eprintln!("ignoring invalid {LOG_ENV} directive {directive:?}: {err}"),
        }
    }
    match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, FilterSource::RustLog),
        Err(_) => (EnvFilter::new(DEFAULT_DIRECTIVE), FilterSource::Default),
    }
}

fn console_layer<S>(format: LogFormat, writer: NonBlocking) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    match format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(UtcTime::rfc_3339())
            .json()
            .with_writer(writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_timer(UtcTime::rfc_3339())
            .with_writer(writer)
            .boxed(),
    }
}

/// Install the global subscriber.
///
/// The filter comes from `PSU_REDUNDANCY_LOG`, then `RUST_LOG`, then `info`.
/// Stdout follows [`LogFormat`]; when `config.file` is set a daily rolling JSON
/// file named `<file_prefix or service>.log` is written under
/// `config.directory`. A second call keeps the first subscriber.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    let (filter, source) = resolve_filter();
    let mut guards = Vec::with_capacity(2);

    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    guards.push(stdout_guard);

    let file_layer = if config.file {
        std::fs::create_dir_all(&config.directory).with_context(|| {
            format!(
                "unable to create log directory {}",
                config.directory.display()
            )
        })?;
        let prefix = config.file_prefix.as_deref().unwrap_or(service_name);
        let (file_writer, file_guard) =
            tracing_appender::non_blocking(daily(&config.directory, format!("{prefix}.log")));
        guards.push(file_guard);
        Some(
            fmt::layer()
                .with_ansi(false)
                .with_timer(UtcTime::rfc_3339())
                .json()
                .with_current_span(false)
                .with_writer(file_writer),
        )
    } else {
        None
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer(config.format, stdout_writer))
        .with(file_layer)
        .try_init()
        .is_ok();
    if installed {
        let _ = GUARDS.set(guards);
    }

    info!(
        service = service_name,
        filter_source = ?source,
        file = config.file,
        log_dir = %config.directory.display(),
        format = ?config.format,
        "tracing initialised"
    );
    Ok(())
}
