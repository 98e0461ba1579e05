// Logging bootstrap for the binary: a small file-or-stdout logger behind
// the standard `log` facade.

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Mutex;

use anyhow::Result;
use chrono::Local;
use log::{LevelFilter, Record};
use once_cell::sync::OnceCell;

pub struct SimpleLogger {
    log_file: Option<Mutex<std::fs::File>>,
}

impl SimpleLogger {
    pub fn new(log_file_path: Option<&str>) -> Result<Self> {
        let log_file = match log_file_path {
            Some(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Some(Mutex::new(file))
            }
            None => None,
        };
        Ok(SimpleLogger { log_file })
    }

    fn format(record: &Record) -> String {
        format!(
            "[{}] {} [{}:{}] {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            record.level(),
            record.file().unwrap_or("unknown"),
            record.line().unwrap_or(0),
            record.args()
        )
    }
}

impl log::Log for SimpleLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = Self::format(record);
        match &self.log_file {
            Some(file) => {
                if let Ok(mut file) = file.lock() {
                    let _ = file.write_all(line.as_bytes());
                }
            }
            None => print!("{}", line),
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.log_file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        } else {
            let _ = std::io::stdout().flush();
        }
    }
}

static LOGGER_INSTALLED: OnceCell<()> = OnceCell::new();

/// Install the process-wide logger. Safe to call more than once; only the
/// first call takes effect.
pub fn setup_logging(log_file: Option<&str>, level: LevelFilter) -> Result<()> {
    if LOGGER_INSTALLED.get().is_some() {
        return Ok(());
    }
    let logger = SimpleLogger::new(log_file)?;
    log::set_boxed_logger(Box::new(logger)).map(|()| log::set_max_level(level))?;
    let _ = LOGGER_INSTALLED.set(());
    log::info!(
        "logging initialized at level {} ({} v{})",
        level,
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );
    Ok(())
}
