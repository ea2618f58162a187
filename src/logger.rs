use std::fs::File;
use std::io::{self, Write};
use std::sync::Mutex;

use flexi_logger::writers::LogWriter;
use flexi_logger::{DeferredNow, Logger, LoggerHandle, opt_format};
use log::Record;

use crate::config::LogTarget;

const DEFAULT_LEVEL: &str = "info";

/// Writes one formatted line per record to a file opened by the config.
pub struct FileLogWriter {
    file: Mutex<File>,
}

impl FileLogWriter {
    pub fn new(file: File) -> Self {
        Self {
            file: Mutex::new(file),
        }
    }
}

impl LogWriter for FileLogWriter {
    fn write(&self, now: &mut DeferredNow, record: &Record) -> io::Result<()> {
        let mut line = Vec::with_capacity(128);
        opt_format(&mut line, now, record)?;
        line.push(b'\n');
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        file.write_all(&line)
    }

    fn flush(&self) -> io::Result<()> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        file.flush()
    }
}

/// Start logging to `target`. The level comes from `RUST_LOG`, defaulting
/// to info. Writes are direct, so no logger threads exist across `fork()`.
pub fn setup_logger(target: &LogTarget) -> io::Result<LoggerHandle> {
    let log = Logger::try_with_env_or_str(DEFAULT_LEVEL)
        .map_err(|e| io::Error::other(e.to_string()))?;
    let log = match target.try_clone()? {
        LogTarget::Stdout => log.log_to_stdout().format_for_stdout(opt_format),
        LogTarget::File { file, .. } => {
            log.log_to_writer(Box::new(FileLogWriter::new(file)))
        }
    };
    log.start().map_err(|e| io::Error::other(e.to_string()))
}
