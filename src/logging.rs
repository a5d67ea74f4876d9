//! Tracing setup.
//!
//! Logs go to stderr by default. With `logging.dir` set they go to
//! `toolhost.log` in that directory instead, rotated on every start and
//! flushed line by line so nothing is lost if the host dies.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};

/// Log file name inside the configured directory.
pub const LOG_FILE_NAME: &str = "toolhost.log";

const DEFAULT_FILTER: &str = "toolhost=info,warn";

/// Install the global subscriber.
///
/// Returns the log file path when logging to a file. Calling this again
/// after a subscriber is installed is a no-op.
pub fn init_tracing(config: &LoggingConfig) -> io::Result<Option<PathBuf>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(config.filter.as_deref().unwrap_or(DEFAULT_FILTER))
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    });

    let Some(dir) = config.dir.as_deref() else {
        let builder = fmt::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .with_target(true);
        let _ = match config.format {
            LogFormat::Text => builder.try_init(),
            LogFormat::Json => builder.json().try_init(),
        };
        return Ok(None);
    };

    std::fs::create_dir_all(dir)?;
    let log_path = dir.join(LOG_FILE_NAME);
    rotate_log_file(&log_path, config.keep);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;
    let writer = FlushingWriter::new(log_file);

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);
    let installed = match config.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    if installed.is_ok() {
        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            log_file = %log_path.display(),
            pid = std::process::id(),
            "=== toolhost starting ==="
        );
    }
    Ok(Some(log_path))
}

/// Rotate `toolhost.log` → `.1` → `.2` … keeping `keep` old files.
///
/// Missing files in the chain are skipped.
pub fn rotate_log_file(base_path: &Path, keep: u32) {
    if keep == 0 {
        let _ = std::fs::remove_file(base_path);
        return;
    }

    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// File writer that flushes after every write.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }
}

impl io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| io::Error::other(format!("lock poisoned: {e}")))?;
        let n = io::Write::write(&mut *f, buf)?;
        io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| io::Error::other(format!("lock poisoned: {e}")))?;
        io::Write::flush(&mut *f)
    }
}

impl<'a> fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
