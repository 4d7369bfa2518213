//! Logging setup shared by the dispatcher process and its workers.
//!
//! Workers write log lines to stderr, which they inherit from the parent, so
//! a single terminal shows both sides. Stdout is reserved for the worker
//! protocol and never receives log output.
//!
//! # Environment Variables
//!
//! - `RANGEPOOL_LOG` - Log filter (overrides RUST_LOG)
//! - `RANGEPOOL_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `RANGEPOOL_LOG_FORMAT` - Output format: pretty, compact, json
//! - `RANGEPOOL_LOG_FILE` - Path to log file (in addition to stderr)
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! # Example
//!
//! ```no_run
//! use rangepool::logging::{LogConfig, init};
//!
//! init(LogConfig::for_cli().with_env_overrides());
//! ```

use std::path::PathBuf;
use std::str::FromStr;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, MakeWriter, format::FmtSpan},
    layer::{Layered, SubscriberExt},
    util::SubscriberInitExt,
};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Full human-readable output
    #[default]
    Pretty,
    /// Single-line output
    Compact,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Rotation policy for the log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

impl FromStr for LogRotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "never" => Ok(Self::Never),
            _ => Err(format!(
                "Unknown log rotation: '{}'. Valid options: hourly, daily, never",
                s
            )),
        }
    }
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Logging configuration.
///
/// Use the builder methods to customize, then pass to [`init`] or [`init_with_file`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (default: WARN)
    pub level: Level,
    pub format: LogFormat,
    /// Path to log file (None = stderr only)
    pub file_path: Option<PathBuf>,
    pub rotation: LogRotation,
    /// Log span timing on close
    pub span_events: bool,
    /// Custom filter string (overrides level if set)
    pub filter: Option<String>,
    pub show_target: bool,
    pub show_thread_ids: bool,
    pub show_line_numbers: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::WARN,
            format: LogFormat::Pretty,
            file_path: None,
            rotation: LogRotation::Daily,
            span_events: false,
            filter: None,
            show_target: true,
            show_thread_ids: false,
            show_line_numbers: false,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for the command-line binary.
    ///
    /// Shows thread ids, since the dispatcher runs one pipe thread per worker.
    pub fn for_cli() -> Self {
        Self {
            show_thread_ids: true,
            ..Self::default()
        }
    }

    /// Preset for worker processes: compact single-line output so lines from
    /// many workers interleave readably on the shared stderr.
    pub fn for_worker() -> Self {
        Self {
            format: LogFormat::Compact,
            show_target: false,
            ..Self::default()
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_rotation(mut self, rotation: LogRotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Apply environment variable overrides.
    ///
    /// Reads `RANGEPOOL_LOG` (falling back to `RUST_LOG`) for the filter,
    /// `RANGEPOOL_LOG_LEVEL`, `RANGEPOOL_LOG_FORMAT` and `RANGEPOOL_LOG_FILE`.
    /// A filter already set from the command line is never replaced.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            if let Ok(filter) = std::env::var("RANGEPOOL_LOG") {
                self.filter = Some(filter);
            } else if let Ok(filter) = std::env::var("RUST_LOG") {
                self.filter = Some(filter);
            }
        }

        if self.filter.is_none()
            && let Ok(level_str) = std::env::var("RANGEPOOL_LOG_LEVEL")
        {
            self.level = parse_level(&level_str).unwrap_or(self.level);
        }

        if let Ok(format) = std::env::var("RANGEPOOL_LOG_FORMAT")
            && let Ok(f) = format.parse()
        {
            self.format = f;
        }

        if let Ok(path) = std::env::var("RANGEPOOL_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        if let Some(ref filter) = self.filter {
            EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                EnvFilter::new(self.level.as_str().to_lowercase())
            })
        } else {
            EnvFilter::new(self.level.as_str().to_lowercase())
        }
    }

    fn span_events(&self) -> FmtSpan {
        if self.span_events {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

/// Parse a log level string.
pub fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

type Stack = Layered<EnvFilter, Registry>;
type BoxedLayer = Box<dyn Layer<Stack> + Send + Sync + 'static>;

/// One formatting layer for `writer` in the configured format.
fn fmt_layer<W>(config: &LogConfig, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match config.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_span_events(config.span_events())
            .with_target(config.show_target)
            .with_ansi(ansi)
            .with_writer(writer)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_span_events(config.span_events())
            .with_target(config.show_target)
            .with_thread_ids(config.show_thread_ids)
            .with_line_number(config.show_line_numbers)
            .with_ansi(ansi)
            .with_writer(writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_span_events(config.span_events())
            .with_target(config.show_target)
            .with_thread_ids(config.show_thread_ids)
            .with_line_number(config.show_line_numbers)
            .with_ansi(ansi)
            .with_writer(writer)
            .boxed(),
    }
}

fn install(filter: EnvFilter, layers: Vec<BoxedLayer>) {
    // A second initialization in the same process is a no-op
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(layers)
        .try_init();
}

/// Initialize the global tracing subscriber, logging to stderr only.
///
/// `config.file_path` is ignored here; see [`init_with_file`]. Calling this
/// more than once is harmless.
pub fn init(config: LogConfig) {
    let filter = config.build_filter();
    let stderr = fmt_layer(&config, std::io::stderr, true);
    install(filter, vec![stderr]);
}

/// Initialize logging to stderr and, when `config.file_path` is set, to a
/// rolling log file as well.
///
/// ```no_run
/// use std::path::PathBuf;
/// use rangepool::logging::{LogConfig, init_with_file};
///
/// let config = LogConfig::for_cli().with_file(PathBuf::from("/tmp/rangepool.log"));
/// init_with_file(config);
/// ```
pub fn init_with_file(config: LogConfig) {
    let Some(path) = config.file_path.clone() else {
        init(config);
        return;
    };

    let parent = path.parent().unwrap_or(std::path::Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("rangepool.log");
    let appender = RollingFileAppender::new(config.rotation.into(), parent, file_name);

    let filter = config.build_filter();
    let layers = vec![
        fmt_layer(&config, std::io::stderr, true),
        fmt_layer(&config, appender, false),
    ];
    install(filter, layers);
}
