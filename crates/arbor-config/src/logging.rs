use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Layer;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// A level (`info`, `debug`, ...) or a full `EnvFilter` directive string.
    pub level: String,

    /// Emit logs as JSON lines.
    pub json: bool,

    /// Write logs to stderr.
    pub stderr: bool,

    /// Append logs to this file. If it cannot be opened, file logging is disabled while
    /// stderr logging stays active.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: true,
            file: None,
        }
    }
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    pub(crate) fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            "off" | "none" => "off".to_owned(),
            _ => trimmed.to_owned(),
        }
    }

    fn config_env_filter(&self) -> tracing_subscriber::EnvFilter {
        let directives = Self::normalize_level_directives(&self.level);
        tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::default()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        })
    }

    /// The effective filter: the configured level with `RUST_LOG` merged on top.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        let config_directives = Self::normalize_level_directives(&self.level);

        match env_directives {
            Some(env_directives) => {
                let combined = format!("{config_directives},{env_directives}");
                tracing_subscriber::EnvFilter::try_new(combined)
                    .or_else(|_| tracing_subscriber::EnvFilter::try_new(env_directives))
                    .unwrap_or_else(|_| self.config_env_filter())
            }
            None => self.config_env_filter(),
        }
    }
}

struct FileMakeWriter {
    file: Arc<Mutex<File>>,
}

impl<'a> MakeWriter<'a> for FileMakeWriter {
    type Writer = FileWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        FileWriter {
            guard: self.file.lock(),
        }
    }
}

struct FileWriter<'a> {
    guard: MutexGuard<'a, File>,
}

impl Write for FileWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.guard.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.guard.flush()
    }
}

fn open_log_file(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

static TRACING_INIT: Once = Once::new();

/// Installs the global `tracing` subscriber described by `config`.
///
/// Safe to call more than once; only the first call installs anything. Returns whether this
/// call installed the subscriber.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let mut installed = false;
    TRACING_INIT.call_once(|| {
        installed = install(config);
    });
    installed
}

fn install(config: &LoggingConfig) -> bool {
    let filter = config.env_filter();

    let mut file_error = None;
    let file = config.file.as_ref().and_then(|path| match open_log_file(path) {
        Ok(file) => Some(Arc::new(Mutex::new(file))),
        Err(err) => {
            file_error = Some((path.clone(), err));
            None
        }
    });

    let mut make_writer = BoxMakeWriter::new(io::sink);
    if config.stderr {
        // Test output capture only sees `print!`-style writes, so debug builds log through
        // `TestWriter`.
        if cfg!(debug_assertions) {
            make_writer = BoxMakeWriter::new(
                make_writer.and(tracing_subscriber::fmt::writer::TestWriter::with_stderr),
            );
        } else {
            make_writer = BoxMakeWriter::new(make_writer.and(io::stderr));
        }
    }
    if let Some(file) = file {
        make_writer = BoxMakeWriter::new(make_writer.and(FileMakeWriter { file }));
    }

    let layer: Box<dyn Layer<_> + Send + Sync> = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(make_writer)
            .with_ansi(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(make_writer)
            .with_ansi(false)
            .boxed()
    };

    let subscriber = tracing_subscriber::registry().with(filter).with(layer);
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return false;
    }
    if let Some((path, err)) = file_error {
        tracing::warn!(
            target = "arbor.config",
            path = %path.display(),
            error = %err,
            "failed to open log file; file logging disabled"
        );
    }
    true
}
