//! Structured logger factory.
//!
//! Builds a `tracing` dispatch from the `log` configuration section: a
//! console sink (human readable or JSON) and an optional rotating JSON file
//! sink. The dispatch is not installed globally unless the caller asks for it;
//! the host runs its own work inside it.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing::Dispatch;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::error::HostError;

/// Logger settings, bound from the `log` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogOptions {
    /// `trace`, `debug`, `info`, `warn` or `error`. Anything else means `info`.
    pub level: String,
    /// Log file path. Empty disables the file sink.
    pub filename: String,
    /// `minutely`, `hourly`, `daily` or `never`.
    pub rotation: String,
    /// Rotated files to keep. 0 keeps everything.
    pub max_files: usize,
    /// Whether to write to stdout.
    pub console: bool,
    /// Whether the console sink writes JSON instead of text.
    pub json: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            filename: String::new(),
            rotation: "daily".to_string(),
            max_files: 7,
            console: true,
            json: false,
        }
    }
}

impl LogOptions {
    /// The effective level; unknown names fall back to `info`.
    #[must_use]
    pub fn level_filter(&self) -> LevelFilter {
        match self.level.trim().to_lowercase().as_str() {
            "trace" => LevelFilter::TRACE,
            "debug" => LevelFilter::DEBUG,
            "warn" | "warning" => LevelFilter::WARN,
            "error" => LevelFilter::ERROR,
            "off" => LevelFilter::OFF,
            _ => LevelFilter::INFO,
        }
    }

    fn rotation(&self) -> Rotation {
        match self.rotation.trim().to_lowercase().as_str() {
            "minutely" => Rotation::MINUTELY,
            "hourly" => Rotation::HOURLY,
            "never" => Rotation::NEVER,
            _ => Rotation::DAILY,
        }
    }
}

/// A constructed logger. Cloning shares the same sinks.
#[derive(Clone)]
pub struct Logger {
    dispatch: Dispatch,
    options: LogOptions,
    _guards: Arc<Vec<WorkerGuard>>,
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Logger {
    /// Builds the sinks described by `options`.
    ///
    /// # Errors
    ///
    /// Returns `HostError::Logger` if the rolling file appender cannot be created.
    pub fn from_options(options: &LogOptions) -> Result<Self, HostError> {
        let filter = EnvFilter::builder()
            .with_default_directive(options.level_filter().into())
            .from_env_lossy();

        let mut guards = Vec::new();
        let file_layer = if options.filename.trim().is_empty() {
            None
        } else {
            let appender = file_appender(options)?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            guards.push(guard);
            Some(
                fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(true),
            )
        };

        let console_text =
            (options.console && !options.json).then(|| fmt::layer().with_target(true));
        let console_json =
            (options.console && options.json).then(|| fmt::layer().json().with_target(true));

        let subscriber = Registry::default()
            .with(filter)
            .with(console_text)
            .with(console_json)
            .with(file_layer);

        Ok(Self {
            dispatch: Dispatch::new(subscriber),
            options: options.clone(),
            _guards: Arc::new(guards),
        })
    }

    /// A logger that discards everything.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            dispatch: Dispatch::none(),
            options: LogOptions {
                console: false,
                ..LogOptions::default()
            },
            _guards: Arc::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    #[must_use]
    pub fn options(&self) -> &LogOptions {
        &self.options
    }

    /// Runs `f` with this logger as the thread's default subscriber.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }

    /// Installs this logger as the process-wide default.
    ///
    /// Returns `false` if another global subscriber was already installed.
    pub fn try_init_global(&self) -> bool {
        tracing::dispatcher::set_global_default(self.dispatch.clone()).is_ok()
    }
}

fn file_appender(options: &LogOptions) -> Result<RollingFileAppender, HostError> {
    let path = Path::new(options.filename.trim());
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let prefix = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("host");

    let mut builder = RollingFileAppender::builder()
        .rotation(options.rotation())
        .filename_prefix(prefix);
    if let Some(ext) = path.extension().and_then(|s| s.to_str()) {
        builder = builder.filename_suffix(ext);
    }
    if options.max_files > 0 {
        builder = builder.max_log_files(options.max_files);
    }
    builder
        .build(dir)
        .map_err(|e| HostError::Logger(e.to_string()))
}
