//! Per-operation log sinks.
//!
//! Every lifecycle operation writes its progress and failures to a `LogSink`.
//! A sink always forwards lines to `tracing`; when a log directory is
//! configured it also appends them to a per-workspace or per-project file.
//! Dropping the sink (or calling [`LogSink::release`]) closes the file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

const LOG_FILE_NAME: &str = "provider.log";

/// What a sink is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkScope {
    Workspace {
        workspace_id: String,
    },
    Project {
        workspace_id: String,
        project_name: String,
    },
}

impl SinkScope {
    fn label(&self) -> String {
        match self {
            SinkScope::Workspace { workspace_id } => workspace_id.clone(),
            SinkScope::Project {
                workspace_id,
                project_name,
            } => format!("{workspace_id}/{project_name}"),
        }
    }

    /// Log file location under `logs_dir`, or `None` when an id or name
    /// would not stay a single directory level below it.
    fn log_path(&self, logs_dir: &Path) -> Option<PathBuf> {
        let components: Vec<&str> = match self {
            SinkScope::Workspace { workspace_id } => vec![workspace_id.as_str()],
            SinkScope::Project {
                workspace_id,
                project_name,
            } => vec![workspace_id.as_str(), project_name.as_str()],
        };
        if !components.iter().all(|c| is_plain_component(c)) {
            return None;
        }
        let mut path = logs_dir.to_path_buf();
        path.extend(components);
        Some(path.join(LOG_FILE_NAME))
    }
}

fn is_plain_component(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

/// Builds sinks for lifecycle operations.
#[derive(Debug, Clone, Default)]
pub struct LogSinkFactory {
    logs_dir: Option<PathBuf>,
}

impl LogSinkFactory {
    pub fn new(logs_dir: Option<PathBuf>) -> Self {
        Self { logs_dir }
    }

    pub fn workspace(&self, workspace_id: &str) -> LogSink {
        self.open(SinkScope::Workspace {
            workspace_id: workspace_id.to_string(),
        })
    }

    pub fn project(&self, workspace_id: &str, project_name: &str) -> LogSink {
        self.open(SinkScope::Project {
            workspace_id: workspace_id.to_string(),
            project_name: project_name.to_string(),
        })
    }

    /// Open a sink for `scope`. Failing to open the persistent file degrades
    /// to a diagnostic-only sink rather than failing the operation.
    pub fn open(&self, scope: SinkScope) -> LogSink {
        let label = scope.label();
        let persistent = self.logs_dir.as_deref().and_then(|dir| {
            let Some(path) = scope.log_path(dir) else {
                tracing::warn!(
                    scope = %label,
                    "log scope is not a plain directory name, continuing with diagnostics only"
                );
                return None;
            };
            match open_append(&path) {
                Ok(file) => Some(Box::new(TimestampedWriter::new(BufWriter::new(file)))
                    as Box<dyn Write + Send>),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "failed to open persistent log, continuing with diagnostics only"
                    );
                    None
                }
            }
        });
        LogSink::new(label, persistent)
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

// ── Sink ────────────────────────────────────────────────────────────

/// Fan-out writer owned by exactly one operation.
pub struct LogSink {
    diagnostic: DiagnosticWriter,
    persistent: Option<Box<dyn Write + Send>>,
}

impl LogSink {
    pub(crate) fn new(scope: String, persistent: Option<Box<dyn Write + Send>>) -> Self {
        Self {
            diagnostic: DiagnosticWriter::new(scope),
            persistent,
        }
    }

    /// Write one line. Write failures are ignored; logging never fails an operation.
    pub fn line(&mut self, message: impl AsRef<str>) {
        let mut bytes = message.as_ref().as_bytes().to_vec();
        bytes.push(b'\n');
        let _ = self.write_all(&bytes);
    }

    /// Whether a persistent destination is still attached.
    pub fn is_persistent(&self) -> bool {
        self.persistent.is_some()
    }

    /// Flush and close the persistent destination. Safe to call repeatedly.
    pub fn release(&mut self) {
        self.diagnostic.flush_pending();
        if let Some(mut persistent) = self.persistent.take() {
            if let Err(e) = persistent.flush() {
                tracing::debug!(error = %e, "failed to flush persistent log");
            }
        }
    }
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.diagnostic.write_all(buf)?;
        if let Some(persistent) = self.persistent.as_mut() {
            persistent.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(persistent) = self.persistent.as_mut() {
            persistent.flush()?;
        }
        Ok(())
    }
}

impl Drop for LogSink {
    fn drop(&mut self) {
        self.release();
    }
}

// ── Line splitting ──────────────────────────────────────────────────

/// Accumulates bytes and yields complete lines.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, buf: &[u8], mut emit: impl FnMut(&str)) {
        self.pending.extend_from_slice(buf);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            emit(text.trim_end_matches('\r'));
        }
    }

    fn take_rest(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.pending).to_string();
        self.pending.clear();
        Some(rest)
    }
}

/// Forwards each completed line to `tracing` at info level.
struct DiagnosticWriter {
    scope: String,
    lines: LineBuffer,
}

impl DiagnosticWriter {
    fn new(scope: String) -> Self {
        Self {
            scope,
            lines: LineBuffer::default(),
        }
    }

    fn flush_pending(&mut self) {
        if let Some(rest) = self.lines.take_rest() {
            tracing::info!(scope = %self.scope, "{rest}");
        }
    }
}

impl Write for DiagnosticWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let scope = &self.scope;
        self.lines.push(buf, |line| {
            if !line.is_empty() {
                tracing::info!(scope = %scope, "{line}");
            }
        });
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Prefixes every line with an RFC 3339 timestamp.
struct TimestampedWriter<W: Write> {
    inner: W,
    lines: LineBuffer,
}

impl<W: Write> TimestampedWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            lines: LineBuffer::default(),
        }
    }

    fn write_line(inner: &mut W, line: &str) -> io::Result<()> {
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        writeln!(inner, "{now} {line}")
    }
}

impl<W: Write> Write for TimestampedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut result = Ok(());
        let inner = &mut self.inner;
        self.lines.push(buf, |line| {
            if result.is_ok() {
                result = Self::write_line(inner, line);
            }
        });
        result.map(|_| buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(rest) = self.lines.take_rest() {
            Self::write_line(&mut self.inner, &rest)?;
        }
        self.inner.flush()
    }
}
