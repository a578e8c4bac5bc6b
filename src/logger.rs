//! Structured logging with in-memory retention.
//!
//! One logger instance is shared by every group label in the process. Each
//! call is appended to an unbounded in-memory store (queryable for the
//! process lifetime; the unbounded growth is intentional) and, when its namespace
//! and level pass the filter, formatted to stdout (info) or stderr (other
//! levels). When a remote peer is attached via [`crate::remote_logger`],
//! stdio and the store are bypassed and every call becomes a socket frame.

use std::collections::HashSet;
use std::io::{IsTerminal, Write};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use colored::Colorize;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::Error;
use crate::remote_logger::RemoteSender;

pub const ENV_DEBUG: &str = "PERCY_DEBUG";
pub const ENV_LOGLEVEL: &str = "PERCY_LOGLEVEL";

static URL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://[^\s]+").expect("valid URL pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// A retained log record. Entries are stored in insertion order and never
/// evicted for the process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub debug: String,
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub meta: Map<String, Value>,
    pub timestamp: i64,
}

/// Parsed namespace filter.
///
/// The spec string is a comma/whitespace-separated list where `*` expands to
/// `.*?`, `:*` to `:?.*?`, and a leading `-` marks an exclusion.
#[derive(Debug, Clone)]
pub struct Namespaces {
    pub include: Vec<Regex>,
    pub exclude: Vec<Regex>,
    pub string: String,
}

impl Namespaces {
    pub fn parse(spec: &str) -> Self {
        let mut include = Vec::new();
        let mut exclude = Vec::new();
        for part in spec.split([',', ' ', '\t', '\n']).filter(|s| !s.is_empty()) {
            let (list, name) = match part.strip_prefix('-') {
                Some(rest) => (&mut exclude, rest),
                None => (&mut include, part),
            };
            if name.is_empty() {
                continue;
            }
            let pattern = regex::escape(name)
                .replace(r":\*", ":?.*?")
                .replace(r"\*", ".*?");
            if let Ok(re) = Regex::new(&format!("^{pattern}$")) {
                list.push(re);
            }
        }
        Self {
            include,
            exclude,
            string: spec.to_string(),
        }
    }

    pub fn matches(&self, debug: &str) -> bool {
        if self.exclude.iter().any(|re| re.is_match(debug)) {
            return false;
        }
        self.include.iter().any(|re| re.is_match(debug))
    }
}

impl Default for Namespaces {
    fn default() -> Self {
        Self::parse("*")
    }
}

struct Sinks {
    stdout: Box<dyn Write + Send>,
    stderr: Box<dyn Write + Send>,
    stdout_tty: bool,
}

#[derive(Default)]
struct ProgressState {
    /// The most recent progress message, if one is "live" on screen.
    message: Option<String>,
    persist: bool,
}

struct LoggerInner {
    level: Mutex<LogLevel>,
    namespaces: Mutex<Namespaces>,
    messages: Mutex<Vec<LogEntry>>,
    deprecations: Mutex<HashSet<String>>,
    last_emit: Mutex<Option<Instant>>,
    progress: Mutex<ProgressState>,
    remote: Mutex<Option<RemoteSender>>,
    sinks: Mutex<Sinks>,
}

/// Process logger. Clones share state; [`Logger::shared`] is the
/// process-wide instance, while `new`/`with_sinks` build isolated instances
/// for embedders and tests.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<LoggerInner>,
}

static SHARED: Lazy<Logger> = Lazy::new(Logger::new);

impl Logger {
    /// Build a logger from the environment: `PERCY_DEBUG` selects namespaces
    /// and forces the debug level, otherwise `PERCY_LOGLEVEL` applies.
    pub fn new() -> Self {
        let stdout_tty = std::io::stdout().is_terminal();
        Self::with_sinks(
            Box::new(std::io::stdout()),
            Box::new(std::io::stderr()),
            stdout_tty,
        )
    }

    /// Build a logger writing to the given sinks. Used by tests and by
    /// embedders that capture output.
    pub fn with_sinks(
        stdout: Box<dyn Write + Send>,
        stderr: Box<dyn Write + Send>,
        stdout_tty: bool,
    ) -> Self {
        let debug_env = std::env::var(ENV_DEBUG).ok().filter(|s| !s.is_empty());
        let (level, namespaces) = match debug_env {
            Some(spec) => (LogLevel::Debug, Namespaces::parse(&spec)),
            None => {
                let level = std::env::var(ENV_LOGLEVEL)
                    .ok()
                    .as_deref()
                    .and_then(LogLevel::parse)
                    .unwrap_or(LogLevel::Info);
                (level, Namespaces::default())
            }
        };
        Self {
            inner: Arc::new(LoggerInner {
                level: Mutex::new(level),
                namespaces: Mutex::new(namespaces),
                messages: Mutex::new(Vec::new()),
                deprecations: Mutex::new(HashSet::new()),
                last_emit: Mutex::new(None),
                progress: Mutex::new(ProgressState::default()),
                remote: Mutex::new(None),
                sinks: Mutex::new(Sinks {
                    stdout,
                    stderr,
                    stdout_tty,
                }),
            }),
        }
    }

    /// The process-wide shared instance.
    pub fn shared() -> &'static Logger {
        &SHARED
    }

    /// A group handle prefixing every call with a namespace label.
    pub fn group(&self, name: impl Into<String>) -> LogGroup {
        LogGroup {
            logger: self.clone(),
            name: name.into(),
        }
    }

    pub fn level(&self) -> LogLevel {
        *self.inner.level.lock().unwrap()
    }

    pub fn set_level(&self, level: LogLevel) {
        *self.inner.level.lock().unwrap() = level;
    }

    pub fn set_namespaces(&self, spec: &str) {
        *self.inner.namespaces.lock().unwrap() = Namespaces::parse(spec);
    }

    pub fn namespaces_string(&self) -> String {
        self.inner.namespaces.lock().unwrap().string.clone()
    }

    /// Whether a call with this namespace and level would reach stdio.
    pub fn should_log(&self, debug: &str, level: LogLevel) -> bool {
        if level < self.level() {
            return false;
        }
        self.inner.namespaces.lock().unwrap().matches(debug)
    }

    /// Record a log call.
    ///
    /// With a remote peer attached the call becomes a single socket frame;
    /// otherwise it is retained in the in-memory store unconditionally and
    /// written to stdio when the filter passes.
    pub fn log(&self, debug: &str, level: LogLevel, message: &str, meta: Map<String, Value>) {
        self.log_value(debug, level, Value::String(message.to_string()), message, meta)
    }

    /// Record an error. On the wire the message is pre-serialized as
    /// `{message, stack}`; locally it renders as the display string.
    pub fn log_error(&self, debug: &str, level: LogLevel, err: &Error, meta: Map<String, Value>) {
        let display = err.to_string();
        let wire = json!({ "message": display, "stack": format!("{err:?}") });
        self.log_value(debug, level, wire, &display, meta)
    }

    fn log_value(
        &self,
        debug: &str,
        level: LogLevel,
        wire_message: Value,
        display: &str,
        meta: Map<String, Value>,
    ) {
        if let Some(remote) = self.remote_sender() {
            let mut wire_meta = meta.clone();
            wire_meta.insert("remote".into(), Value::Bool(true));
            let frame = json!({ "log": [debug, level.as_str(), wire_message, wire_meta] });
            if remote.send(frame.to_string()).is_ok() {
                return;
            }
            // Peer went away mid-call; fall through to local handling.
            self.inner.remote.lock().unwrap().take();
        }

        self.retain(LogEntry {
            debug: debug.to_string(),
            level,
            message: display.to_string(),
            meta,
            timestamp: chrono::Utc::now().timestamp_millis(),
        });

        if self.should_log(debug, level) {
            let line = self.format(debug, level, display);
            self.write_line(level, &line);
        }
    }

    /// Append an entry to the store without any stdio side effects.
    pub(crate) fn retain(&self, entry: LogEntry) {
        self.inner.messages.lock().unwrap().push(entry);
    }

    /// Retained entries matching a predicate.
    pub fn query(&self, filter: impl Fn(&LogEntry) -> bool) -> Vec<LogEntry> {
        self.inner
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|e| filter(e))
            .cloned()
            .collect()
    }

    pub fn entry_count(&self) -> usize {
        self.inner.messages.lock().unwrap().len()
    }

    pub(crate) fn snapshot_entries_for_remote(&self) -> Vec<LogEntry> {
        let mut entries = self.inner.messages.lock().unwrap().clone();
        for entry in &mut entries {
            entry.meta.insert("remote".into(), Value::Bool(true));
        }
        entries
    }

    pub(crate) fn set_remote(&self, sender: RemoteSender) {
        *self.inner.remote.lock().unwrap() = Some(sender);
    }

    pub(crate) fn clear_remote(&self) {
        self.inner.remote.lock().unwrap().take();
    }

    pub fn is_remote(&self) -> bool {
        self.remote_sender().is_some()
    }

    fn remote_sender(&self) -> Option<RemoteSender> {
        let guard = self.inner.remote.lock().unwrap();
        guard.as_ref().filter(|r| r.is_open()).cloned()
    }

    /// Apply a remote `{env}` update to the level/namespace view.
    pub(crate) fn apply_env(&self, env: &Map<String, Value>) {
        if let Some(Value::String(spec)) = env.get(ENV_DEBUG) {
            if !spec.is_empty() {
                self.set_namespaces(spec);
                self.set_level(LogLevel::Debug);
                return;
            }
        }
        if let Some(Value::String(level)) = env.get(ENV_LOGLEVEL) {
            if let Some(level) = LogLevel::parse(level) {
                self.set_level(level);
            }
        }
    }

    /// Emit a deprecation warning once per distinct message.
    pub fn deprecated(&self, debug: &str, message: &str) {
        {
            let mut seen = self.inner.deprecations.lock().unwrap();
            if !seen.insert(message.to_string()) {
                return;
            }
        }
        self.log(debug, LogLevel::Warn, &format!("Warning: {message}"), Map::new());
    }

    /// Render a transient progress line.
    ///
    /// On a TTY the current line is rewritten in place; elsewhere the
    /// message is written once and repeats are suppressed until the next
    /// regular log line. Persistent progress is re-emitted after an
    /// interleaved line.
    pub fn progress(&self, debug: &str, message: &str, persist: bool) {
        if !self.should_log(debug, LogLevel::Info) {
            return;
        }
        let mut progress = self.inner.progress.lock().unwrap();
        let mut sinks = self.inner.sinks.lock().unwrap();
        if sinks.stdout_tty {
            let _ = write!(sinks.stdout, "\r\x1b[0K{message}");
            let _ = sinks.stdout.flush();
        } else if progress.message.as_deref() != Some(message) {
            let _ = writeln!(sinks.stdout, "{message}");
        }
        progress.message = Some(message.to_string());
        progress.persist = persist;
    }

    /// Format a line: `[percy:ns] message (Nms)`. The namespace and the
    /// elapsed time appear only at debug level.
    pub fn format(&self, debug: &str, level: LogLevel, message: &str) -> String {
        let debug_mode = self.level() == LogLevel::Debug;
        let label = if debug_mode && !debug.is_empty() {
            format!("percy:{debug}")
        } else {
            "percy".to_string()
        };

        let body = match level {
            LogLevel::Error => message.red().to_string(),
            LogLevel::Warn => message.yellow().to_string(),
            LogLevel::Info | LogLevel::Debug => URL_PATTERN
                .replace_all(message, |caps: &regex::Captures<'_>| {
                    caps[0].blue().to_string()
                })
                .to_string(),
        };

        let mut line = format!("[{}] {}", label.magenta(), body);
        if debug_mode {
            let mut last = self.inner.last_emit.lock().unwrap();
            let elapsed = last.map(|t| t.elapsed().as_millis()).unwrap_or(0);
            *last = Some(Instant::now());
            line.push_str(&format!(" ({}ms)", elapsed).bright_black().to_string());
        }
        line
    }

    fn write_line(&self, level: LogLevel, line: &str) {
        let mut progress = self.inner.progress.lock().unwrap();
        let mut sinks = self.inner.sinks.lock().unwrap();

        // A live progress line on a TTY is cleared before regular output.
        let live = progress.message.clone();
        if live.is_some() && sinks.stdout_tty {
            let _ = write!(sinks.stdout, "\r\x1b[0K");
        }

        if level == LogLevel::Info {
            let _ = writeln!(sinks.stdout, "{line}");
            let _ = sinks.stdout.flush();
        } else {
            let _ = writeln!(sinks.stderr, "{line}");
            let _ = sinks.stderr.flush();
        }

        match (live, progress.persist) {
            (Some(message), true) => {
                // Persistent progress survives the interleaved line.
                if sinks.stdout_tty {
                    let _ = write!(sinks.stdout, "{message}");
                    let _ = sinks.stdout.flush();
                }
                progress.message = Some(message);
            }
            _ => {
                progress.message = None;
                progress.persist = false;
            }
        }
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-namespace handle returned by [`Logger::group`].
#[derive(Clone)]
pub struct LogGroup {
    logger: Logger,
    name: String,
}

impl LogGroup {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.logger
            .log(&self.name, LogLevel::Debug, message.as_ref(), Map::new());
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.logger
            .log(&self.name, LogLevel::Info, message.as_ref(), Map::new());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.logger
            .log(&self.name, LogLevel::Warn, message.as_ref(), Map::new());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.logger
            .log(&self.name, LogLevel::Error, message.as_ref(), Map::new());
    }

    pub fn error_cause(&self, err: &Error) {
        self.logger
            .log_error(&self.name, LogLevel::Error, err, Map::new());
    }

    pub fn log_with(&self, level: LogLevel, message: &str, meta: Map<String, Value>) {
        self.logger.log(&self.name, level, message, meta);
    }

    pub fn deprecated(&self, message: &str) {
        self.logger.deprecated(&self.name, message);
    }

    pub fn should_log(&self, level: LogLevel) -> bool {
        self.logger.should_log(&self.name, level)
    }

    pub fn progress(&self, message: &str, persist: bool) {
        self.logger.progress(&self.name, message, persist);
    }

    pub fn format(&self, level: LogLevel, message: &str) -> String {
        self.logger.format(&self.name, level, message)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    /// A `Write` sink capturing bytes for assertions.
    #[derive(Clone, Default)]
    pub struct SharedBuf(pub Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        pub fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }

        pub fn is_empty(&self) -> bool {
            self.0.lock().unwrap().is_empty()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// A logger wired to capture buffers, bypassing the environment.
    pub fn capture_logger(
        level: super::LogLevel,
        namespaces: &str,
    ) -> (super::Logger, SharedBuf, SharedBuf) {
        let out = SharedBuf::default();
        let err = SharedBuf::default();
        let logger =
            super::Logger::with_sinks(Box::new(out.clone()), Box::new(err.clone()), false);
        logger.set_level(level);
        logger.set_namespaces(namespaces);
        (logger, out, err)
    }
}
