use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::Subscriber;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

/// Target of flow lifecycle and uncaught-error events; only these reach the
/// JSON event file.
pub const RUNTIME_TARGET: &str = "runtime";

#[derive(Debug, Copy, Clone, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    #[default]
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(default)]
pub struct LogConfig {
    pub log_level: LogLevel,
    /// When set, logs are also written to daily-rolling files in this directory.
    pub log_dir: Option<PathBuf>,
    pub log_file: String,
    pub event_file: String,
}

impl LogConfig {
    pub fn new(log_level: LogLevel, log_dir: Option<PathBuf>) -> Self {
        Self {
            log_level,
            log_dir,
            ..Self::default()
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_dir: None,
            log_file: "redflow.log".to_string(),
            event_file: "events.json".to_string(),
        }
    }
}

/// Sink for log lines emitted on behalf of a node.
pub trait LoggerType: Send + Sync {
    fn log(&self, level: LogLevel, context: &str, msg: &str);
    fn clone_box(&self) -> Box<dyn LoggerType>;
    fn debug_box(&self) -> String;
}

pub struct Logger(pub Box<dyn LoggerType>);

impl Logger {
    pub fn log(&self, level: LogLevel, context: &str, msg: &str) {
        self.0.log(level, context, msg)
    }
}

impl Default for Logger {
    fn default() -> Self {
        Logger(Box::new(TracingLogger))
    }
}

impl Clone for Logger {
    fn clone(&self) -> Self {
        Logger(self.0.clone_box())
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Forwards node log lines to `tracing`, with the node id as context.
#[derive(Clone, Debug, Default)]
pub struct TracingLogger;

impl LoggerType for TracingLogger {
    fn log(&self, level: LogLevel, context: &str, msg: &str) {
        match level {
            LogLevel::Trace => tracing::trace!(%context, "{msg}"),
            LogLevel::Debug => tracing::debug!(%context, "{msg}"),
            LogLevel::Info => tracing::info!(%context, "{msg}"),
            LogLevel::Warn => tracing::warn!(%context, "{msg}"),
            LogLevel::Error => tracing::error!(%context, "{msg}"),
        }
    }

    fn clone_box(&self) -> Box<dyn LoggerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        "TracingLogger".to_string()
    }
}

/// Keeps every line in memory as well as forwarding it to `tracing`.
/// Clones share the same buffer.
#[derive(Clone, Debug, Default)]
pub struct MemoryLogger {
    lines: Arc<Mutex<Vec<(LogLevel, String, String)>>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(LogLevel, String, String)> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl LoggerType for MemoryLogger {
    fn log(&self, level: LogLevel, context: &str, msg: &str) {
        TracingLogger.log(level, context, msg);
        if let Ok(mut lines) = self.lines.lock() {
            lines.push((level, context.to_string(), msg.to_string()));
        }
    }

    fn clone_box(&self) -> Box<dyn LoggerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        "MemoryLogger".to_string()
    }
}

fn rolling_appender(dir: &Path, file: &str) -> RollingFileAppender {
    RollingFileAppender::new(Rotation::DAILY, dir, file)
}

/// JSON lines for [`RUNTIME_TARGET`] events only.
pub fn runtime_event_layer<S, W>(writer: W) -> impl Layer<S> + Send + Sync
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    fmt::layer()
        .json()
        .with_writer(writer)
        .with_target(true)
        .with_filter(EnvFilter::new(format!("{RUNTIME_TARGET}=info")))
}

/// Install the global tracing subscriber.
///
/// - stdout gets a `fmt` layer filtered by `log_level`
/// - with `log_dir`, a plain-text daily rolling log and a JSON event file
///   (only [`RUNTIME_TARGET`] events) are written as well
///
/// Installing twice is not an error; the first subscriber stays active.
pub fn init_tracing(config: &LogConfig) -> Result<Logger> {
    // 1) filter
    let level = config.log_level.as_str();
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // 2) stdout
    let fmt_layer = fmt::layer().with_thread_names(true);

    // 3) optional files
    let (txt_layer, json_layer) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("could not create log directory {}", dir.display()))?;
            let txt_layer = fmt::layer()
                .with_writer(rolling_appender(dir, &config.log_file))
                .with_ansi(false);
            let json_layer = runtime_event_layer(rolling_appender(dir, &config.event_file));
            (Some(txt_layer), Some(json_layer))
        }
        None => (None, None),
    };

    // 4) install
    if Registry::default()
        .with(env_filter)
        .with(fmt_layer)
        .with(txt_layer)
        .with(json_layer)
        .try_init()
        .is_err()
    {
        tracing::debug!("tracing subscriber already installed");
    }

    Ok(Logger(Box::new(TracingLogger)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_memory_logger_shares_buffer_between_clones() {
        let mem = MemoryLogger::new();
        let logger = Logger(Box::new(mem.clone()));
        let copy = logger.clone();
        logger.log(LogLevel::Info, "n1", "hello");
        copy.log(LogLevel::Warn, "n2", "careful");
        let lines = mem.lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], (LogLevel::Warn, "n2".to_string(), "careful".to_string()));
    }

    #[test]
    fn test_log_config_deserialises_with_defaults() {
        let cfg: LogConfig = serde_json::from_str(r#"{"log_level":"debug"}"#).unwrap();
        assert_eq!(cfg.log_level, LogLevel::Debug);
        assert_eq!(cfg.log_file, "redflow.log");
        assert!(cfg.log_dir.is_none());
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_event_layer_keeps_runtime_target_only() {
        let captured = Captured::default();
        let sink = captured.clone();
        let subscriber = Registry::default().with(runtime_event_layer(move || sink.clone()));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: RUNTIME_TARGET, flow = "f1", "flow deployed");
            tracing::info!("not an event");
            tracing::debug!(target: RUNTIME_TARGET, "too verbose");
        });

        let text = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<serde_json::Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["target"], "runtime");
        assert_eq!(lines[0]["fields"]["message"], "flow deployed");
        assert_eq!(lines[0]["fields"]["flow"], "f1");
    }

    #[test]
    fn test_log_level_parses_cli_spelling() {
        assert_eq!("WARNING".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert!("critical".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_init_tracing_creates_log_dir() {
        let dir = tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        let cfg = LogConfig::new(LogLevel::Info, Some(log_dir.clone()));
        let logger = init_tracing(&cfg).unwrap();
        assert!(log_dir.is_dir());
        assert_eq!(format!("{:?}", logger), "TracingLogger");
        // a second install must not fail
        assert!(init_tracing(&LogConfig::default()).is_ok());
    }
}
