//! Logging bootstrap for services
//!
//! Console output as `timestamp [LEVEL] message` (or JSON lines), filtered
//! by a reloadable `EnvFilter` so the level can change at runtime.
//! `RUST_LOG` wins over the configured level when set.

use std::sync::{Mutex, OnceLock};

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    reload,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// `2025-12-02T00:50:44.809123Z [INFO] Drv sim registered`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m",
                Level::DEBUG => "\x1b[34m",
                Level::INFO => "\x1b[32m",
                Level::WARN => "\x1b[33m",
                Level::ERROR => "\x1b[31m",
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

type EnvFilterReloadHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;
static LOG_FILTER_HANDLE: OnceLock<EnvFilterReloadHandle> = OnceLock::new();
static CURRENT_LOG_LEVEL: OnceLock<Mutex<String>> = OnceLock::new();

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name, gets `debug` in the default filter
    pub service_name: String,
    /// Filter spec used when `RUST_LOG` is unset (e.g. "info")
    pub level: String,
    /// JSON lines instead of the bracketed text format
    pub enable_json: bool,
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".to_string(),
            level: "info".to_string(),
            enable_json: false,
            ansi: true,
        }
    }
}

/// Filter spec for `config`, honouring `RUST_LOG`.
pub fn filter_spec(config: &LogConfig) -> String {
    match std::env::var("RUST_LOG") {
        Ok(env) if !env.is_empty() => env,
        _ => config.level.clone(),
    }
}

/// Initialize logging system with configuration
pub fn init_with_config(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let spec = filter_spec(&config);
    let env_filter = EnvFilter::try_new(&spec)?;

    let (reload_filter, reload_handle) = reload::Layer::new(env_filter);
    let _ = LOG_FILTER_HANDLE.set(reload_handle);
    let _ = CURRENT_LOG_LEVEL.set(Mutex::new(spec));

    let console_layer = if config.enable_json {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer()
            .with_ansi(config.ansi)
            .event_format(BracketedLevelFormat)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(reload_filter)
        .with(console_layer)
        .try_init()?;

    tracing::debug!("Logging initialized for {}", config.service_name);
    Ok(())
}

/// Dynamically set log filter level at runtime
///
/// `level` is a level ("debug") or a full filter spec ("info,chanmgr=debug").
pub fn set_log_level(level: &str) -> Result<(), String> {
    let handle = LOG_FILTER_HANDLE
        .get()
        .ok_or("Logging not initialized with reload support")?;

    let new_filter =
        EnvFilter::try_new(level).map_err(|e| format!("Invalid log level '{}': {}", level, e))?;

    handle
        .reload(new_filter)
        .map_err(|e| format!("Failed to reload log filter: {}", e))?;

    if let Some(current) = CURRENT_LOG_LEVEL.get() {
        if let Ok(mut guard) = current.lock() {
            *guard = level.to_string();
        }
    }

    tracing::info!("Log level changed to: {}", level);
    Ok(())
}

/// Current log filter string
pub fn get_log_level() -> String {
    CURRENT_LOG_LEVEL
        .get()
        .and_then(|m| m.lock().ok())
        .map(|guard| guard.clone())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_level() {
        assert_eq!(format_level(&Level::WARN), "[WARN]");
        assert_eq!(format_level(&Level::TRACE), "[TRACE]");
    }

    #[test]
    fn test_set_level_before_init_fails() {
        if LOG_FILTER_HANDLE.get().is_none() {
            assert!(set_log_level("debug").is_err());
            assert_eq!(get_log_level(), "unknown");
        }
    }

    #[test]
    fn test_filter_spec_uses_config_level() {
        let config = LogConfig {
            level: "warn,chanmgr=debug".to_string(),
            ..Default::default()
        };
        let spec = filter_spec(&config);
        if std::env::var("RUST_LOG").map_or(true, |v| v.is_empty()) {
            assert_eq!(spec, "warn,chanmgr=debug");
        }
        assert!(EnvFilter::try_new(spec).is_ok());
    }
}
