use std::fmt::Formatter;

pub mod config;
pub mod logger;
pub mod privilege;
pub mod server;

pub use config::{Config, ConfigError, LogTarget, Startup};

/// Unwrap an `Ok` or break out of the enclosing loop with the error.
#[macro_export]
macro_rules! break_error {
    ($res:expr) => {
        match $res {
            Ok(x) => x,
            Err(e) => break Some(e.into()),
        }
    };
}

#[derive(Debug)]
pub enum ServeError {
    IoError(std::io::Error),
    Redirect(String),
}

impl std::fmt::Display for ServeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Self::IoError(e) => std::fmt::Display::fmt(e, f),
            Self::Redirect(url) => write!(f, "Redirect({url})"),
        }
    }
}

impl std::error::Error for ServeError {}

impl From<std::io::Error> for ServeError {
    fn from(e: std::io::Error) -> Self {
        Self::IoError(e)
    }
}

impl From<tokio::time::error::Elapsed> for ServeError {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Self::IoError(e.into())
    }
}
