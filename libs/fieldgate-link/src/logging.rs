//! Logging setup and per-channel log helpers
//!
//! `init_logging` installs the process subscriber and returns a [`LogGuard`].
//! Keep the guard alive for the life of the process; dropping it flushes the
//! file writer, so the owner's shutdown sequence decides when logs are final.

use crate::error::{LinkError, Result};
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Custom format for log level with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Event formatter that outputs: `timestamp [LEVEL] message`
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

/// Daily-rolling log file location
#[derive(Debug, Clone)]
pub struct FileLogConfig {
    pub dir: PathBuf,
    /// File name prefix, the date is appended by the roller
    pub prefix: String,
}

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset (e.g. "info,fieldgate_link=debug")
    pub level: String,
    pub console: bool,
    pub ansi: bool,
    pub file: Option<FileLogConfig>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console: true,
            ansi: true,
            file: None,
        }
    }
}

/// Owns the background file writer. Dropping it flushes pending records.
#[derive(Debug)]
pub struct LogGuard {
    guard: Option<WorkerGuard>,
    installed: bool,
}

impl LogGuard {
    /// Whether this call installed the global subscriber
    pub fn installed(&self) -> bool {
        self.installed
    }

    pub fn has_file_writer(&self) -> bool {
        self.guard.is_some()
    }
}

/// Initialize the logging system. A second call keeps the first subscriber.
pub fn init_logging(config: &LogConfig) -> Result<LogGuard> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::new(directives),
        _ => EnvFilter::try_new(&config.level).map_err(|e| {
            LinkError::config(format!("Invalid log level '{}': {}", config.level, e))
        })?,
    };

    let console_layer = config.console.then(|| {
        fmt::layer()
            .with_ansi(config.ansi)
            .event_format(BracketedLevelFormat)
    });

    let (file_layer, guard) = match &config.file {
        Some(file) => {
            std::fs::create_dir_all(&file.dir)?;
            let appender = tracing_appender::rolling::daily(&file.dir, &file.prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .event_format(BracketedLevelFormat);
            (Some(layer), Some(guard))
        },
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_ok();

    if !installed {
        tracing::debug!("Logging already initialized, keeping existing subscriber");
    }

    Ok(LogGuard { guard, installed })
}

/// Upper-case hex dump joined by spaces: `01 03 00 2C`
pub fn to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Channel-scoped logger
///
/// Every record carries the channel name so interleaved output from many
/// channels can be told apart.
#[derive(Debug, Clone)]
pub struct ChannelLogger {
    channel_name: Arc<str>,
}

impl ChannelLogger {
    pub fn new(channel_name: impl Into<String>) -> Self {
        Self {
            channel_name: Arc::from(channel_name.into()),
        }
    }

    pub fn name(&self) -> &str {
        &self.channel_name
    }

    /// Log connection attempt
    pub fn log_connect(&self, kind: impl Display, target: &str) {
        tracing::info!(channel = %self.channel_name, "[CONNECT] {} to {}", kind, target);
    }

    /// Log connection status change
    pub fn log_status(&self, old_state: impl Display, new_state: impl Display, reason: &str) {
        tracing::info!(
            channel = %self.channel_name,
            "[STATUS] {} -> {} - {}",
            old_state,
            new_state,
            reason
        );
    }

    /// Log retry attempt; a negative `max_attempts` prints as unbounded
    pub fn log_retry(&self, attempt: u32, max_attempts: i32, delay: Duration, reason: &str) {
        let max = if max_attempts < 0 {
            "inf".to_string()
        } else {
            max_attempts.to_string()
        };
        tracing::warn!(
            channel = %self.channel_name,
            "[RETRY] Attempt {}/{}, delay {}ms - {}",
            attempt,
            max,
            delay.as_millis(),
            reason
        );
    }

    /// Log outbound frame
    pub fn log_tx(&self, data: &[u8]) {
        tracing::debug!(
            channel = %self.channel_name,
            "[TX] {} bytes: [{}]",
            data.len(),
            to_hex(data)
        );
    }

    /// Log complete inbound frame
    pub fn log_rx(&self, data: &[u8]) {
        tracing::debug!(
            channel = %self.channel_name,
            "[RX] {} bytes: [{}]",
            data.len(),
            to_hex(data)
        );
    }

    /// Log raw inbound chunk before reassembly
    pub fn log_raw(&self, data: &[u8]) {
        tracing::trace!(
            channel = %self.channel_name,
            "[RAW] {} bytes: [{}]",
            data.len(),
            to_hex(data)
        );
    }

    pub fn log_error(&self, context: &str, err: impl Display) {
        tracing::error!(channel = %self.channel_name, "[ERROR] {} - {}", context, err);
    }
}
