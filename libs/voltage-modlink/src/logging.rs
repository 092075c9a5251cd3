//! Logging setup for binaries and tests embedding the link
//!
//! Text output looks like `2025-01-01T00:00:00.000000Z [INFO] voltage_modlink::connection: ...`.
//! `RUST_LOG` overrides the level passed to [`init`].

use std::fmt;
use std::sync::OnceLock;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::{ModbusError, ModbusResult};

/// Timestamp, bracketed level, target, message
#[derive(Debug, Clone, Copy, Default)]
pub struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(
            writer,
            "{} [{}] {}: ",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ"),
            level_label(metadata.level()),
            metadata.target()
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

fn level_label(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "TRACE",
        Level::DEBUG => "DEBUG",
        Level::INFO => "INFO",
        Level::WARN => "WARN",
        Level::ERROR => "ERROR",
    }
}

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Install the global subscriber; later calls are no-ops
pub fn init(level: &str, json: bool) -> ModbusResult<()> {
    if INSTALLED.get().is_some() {
        return Ok(());
    }

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .map_err(|e| ModbusError::config(format!("Invalid log level {level:?}: {e}")))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().event_format(BracketedLevelFormat))
            .try_init()
    };

    // Another subscriber (e.g. a test harness) already owns the global slot
    if let Err(e) = result {
        tracing::debug!("Logging already initialized: {e}");
    }
    let _ = INSTALLED.set(());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        assert!(init("debug", false).is_ok());
        assert!(init("info", true).is_ok());
    }

    #[test]
    fn test_level_labels() {
        assert_eq!(level_label(&Level::WARN), "WARN");
        assert_eq!(level_label(&Level::TRACE), "TRACE");
    }
}
