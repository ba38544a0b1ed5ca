//! Logging initialization for opensentinel-daemon.
//!
//! Configures `tracing-subscriber` from the `[general]` section of
//! `SentinelConfig`: an stdout layer (json or pretty) plus a file layer
//! writing `<data_dir>/debug.log`. The log file is capped at 25 MB — once it
//! grows past the cap it is truncated and writing restarts from the top.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tracing_subscriber::fmt::writer::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use opensentinel_core::config::GeneralConfig;

/// Maximum debug.log size before truncate-and-restart.
pub const MAX_LOG_FILE_BYTES: u64 = 25 * 1_000_000;

/// Log file name inside the data directory.
pub const LOG_FILE_NAME: &str = "debug.log";

/// A `MakeWriter` that appends to a single log file behind a mutex and
/// truncates the file once it exceeds a byte cap.
#[derive(Clone)]
pub struct RotatingFileWriter {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    max_bytes: u64,
    file: Mutex<File>,
}

impl RotatingFileWriter {
    /// Open (or create) the log file in append mode.
    pub fn new(path: PathBuf, max_bytes: u64) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            inner: Arc::new(Inner {
                path,
                max_bytes,
                file: Mutex::new(file),
            }),
        })
    }

    /// Path of the underlying log file.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}

/// The actual writer handed to tracing for each event.
pub struct RotatingFileGuard {
    inner: Arc<Inner>,
}

impl Write for RotatingFileGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut file = self.inner.file.lock().expect("log file mutex poisoned");

        // Truncate-and-restart once the cap is exceeded. The file stays in
        // append mode, so subsequent writes land at the (new) end.
        if file.metadata()?.len() > self.inner.max_bytes {
            file.set_len(0)?;
        }

        file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner
            .file
            .lock()
            .expect("log file mutex poisoned")
            .flush()
    }
}

impl<'a> MakeWriter<'a> for RotatingFileWriter {
    type Writer = RotatingFileGuard;

    fn make_writer(&'a self) -> Self::Writer {
        RotatingFileGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// Must be called exactly once, before any tracing macros are used.
pub fn init_tracing(config: &GeneralConfig, data_dir: &Path) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let file_writer = RotatingFileWriter::new(data_dir.join(LOG_FILE_NAME), MAX_LOG_FILE_BYTES)?;

    match config.log_format.as_str() {
        "json" => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .with(file_layer)
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to initialize JSON subscriber: {}", e))?;
        }
        "pretty" => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .with(file_layer)
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to initialize pretty subscriber: {}", e))?;
        }
        other => {
            return Err(anyhow::anyhow!(
                "unknown log format '{}', expected 'json' or 'pretty'",
                other
            ));
        }
    }

    Ok(())
}
