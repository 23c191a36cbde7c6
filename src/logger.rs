use anyhow::{Context, Result};
use chrono::Local;
use log::{Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

const DEFAULT_FILTER: &str = "focusstack=info";

/// Run log shared by the installed logger; empty until a file is attached.
static RUN_LOG: Mutex<Option<File>> = Mutex::new(None);

/// Sends every record to stderr through `env_logger` and appends a copy to the
/// run log file once one is attached.
pub struct DualLogger {
    env_logger: env_logger::Logger,
}

impl DualLogger {
    pub fn new(env_logger: env_logger::Logger) -> Self {
        Self { env_logger }
    }

    /// Install the logger. `RUST_LOG` overrides the default filter.
    pub fn init() -> Result<()> {
        let env_logger = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(DEFAULT_FILTER),
        )
        .format_timestamp(Some(env_logger::fmt::TimestampPrecision::Seconds))
        .build();
        let max_level = env_logger.filter();

        log::set_boxed_logger(Box::new(DualLogger::new(env_logger)))?;
        log::set_max_level(max_level);
        Ok(())
    }

    /// Start appending records to `path`. Records logged before this call only
    /// went to stderr.
    pub fn set_log_file(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log file {}", path.display()))?;
        if let Ok(mut run_log) = RUN_LOG.lock() {
            *run_log = Some(file);
        }
        Ok(())
    }

    fn format_line(record: &Record) -> String {
        format!(
            "[{}] {:5} {} - {}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            record.level(),
            record.target(),
            record.args()
        )
    }
}

impl log::Log for DualLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.env_logger.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.env_logger.log(record);

            if let Ok(mut run_log) = RUN_LOG.lock() {
                if let Some(file) = run_log.as_mut() {
                    let _ = writeln!(file, "{}", Self::format_line(record));
                }
            }
        }
    }

    fn flush(&self) {
        self.env_logger.flush();
        if let Ok(mut run_log) = RUN_LOG.lock() {
            if let Some(file) = run_log.as_mut() {
                let _ = file.flush();
            }
        }
    }
}
