//! Command-line options and process-wide configuration.
//!
//! The configuration is parsed once at startup, before the server binds its
//! port, and is read-only afterwards.

#[cfg(test)]
mod test;

use std::ffi::OsString;
use std::fmt::Formatter;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use clap::{CommandFactory, Parser};
use libc::{gid_t, uid_t};

pub const NAME: &str = "rs-serve";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_PORT: u16 = 80;
pub const DEFAULT_HOSTNAME: &str = "local.dev";

/// Exit status after printing help or version information.
pub const EXIT_INFO: i32 = 127;
pub const EXIT_FAILURE: i32 = 1;

static CONFIG: OnceLock<Config> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(
    name = NAME,
    about = "Serve files from a directory over HTTP.",
    disable_help_flag = true,
    disable_version_flag = true
)]
struct Args {
    /// Display this text and exit.
    #[arg(short, long)]
    help: bool,

    /// Print program version and exit.
    #[arg(short, long)]
    version: bool,

    /// Bind to given port.
    #[arg(short, long, value_name = "PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Set hostname.
    #[arg(short = 'n', long, value_name = "NAME",
          default_value = DEFAULT_HOSTNAME)]
    hostname: String,

    /// Root directory to serve (defaults to cwd).
    #[arg(short, long, value_name = "ROOT")]
    root: Option<PathBuf>,

    /// chroot() to root directory before serving any files.
    #[arg(long)]
    chroot: bool,

    /// Log to given file (defaults to stdout).
    #[arg(short = 'f', long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// After starting the server, detach server process and exit. Without
    /// --log-file, all further output is lost.
    #[arg(short, long)]
    detach: bool,

    /// After binding to the port (but before accepting any connections) set
    /// the user ID to the given value. Only works when run as root.
    #[arg(short, long, value_name = "UID", conflicts_with = "user")]
    uid: Option<uid_t>,

    /// Same as --uid, but specify the user by name.
    #[arg(long, value_name = "USER")]
    user: Option<String>,

    /// Same as --uid, but setting the group ID.
    #[arg(short, long, value_name = "GID", conflicts_with = "group")]
    gid: Option<gid_t>,

    /// Same as --user, but setting the group.
    #[arg(long, value_name = "GROUP")]
    group: Option<String>,
}

#[derive(Debug)]
pub enum LogTarget {
    Stdout,
    File { path: PathBuf, file: File },
}

impl LogTarget {
    /// Open `path` for appending, creating it if needed.
    pub fn open(path: &Path) -> Result<Self, ConfigError> {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Ok(Self::File {
                path: path.to_path_buf(),
                file,
            }),
            Err(source) => Err(ConfigError::LogFile {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(match self {
            Self::Stdout => Self::Stdout,
            Self::File { path, file } => Self::File {
                path: path.clone(),
                file: file.try_clone()?,
            },
        })
    }
}

#[derive(Debug)]
pub struct Config {
    pub port: u16,
    pub hostname: String,
    pub storage_root: PathBuf,
    pub chroot: bool,
    pub detach: bool,
    pub log: LogTarget,
    pub uid: Option<uid_t>,
    pub gid: Option<gid_t>,
}

/// What the process should do after reading its arguments.
#[derive(Debug)]
pub enum Startup {
    Run(Config),
    Help(String),
    Version(String),
}

#[derive(Debug)]
pub enum ConfigError {
    Usage(clap::Error),
    LogFile { path: PathBuf, source: io::Error },
    UnknownUser(String),
    UnknownGroup(String),
    CurrentDir(io::Error),
    AlreadyInstalled,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Self::Usage(e) => write!(f, "{}", e.to_string().trim_end()),
            Self::LogFile { path, source } => write!(
                f,
                "Failed to open log file {}: {source}",
                path.display()
            ),
            Self::UnknownUser(name) => {
                write!(f, "Failed to find UID for user \"{name}\".")
            }
            Self::UnknownGroup(name) => {
                write!(f, "Failed to find GID for group \"{name}\".")
            }
            Self::CurrentDir(e) => {
                write!(f, "Failed to determine current directory: {e}")
            }
            Self::AlreadyInstalled => write!(f, "configuration already set"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Usage(e) => Some(e),
            Self::LogFile { source, .. } => Some(source),
            Self::CurrentDir(e) => Some(e),
            _ => None,
        }
    }
}

impl From<clap::Error> for ConfigError {
    fn from(e: clap::Error) -> Self {
        Self::Usage(e)
    }
}

fn resolve_user(name: &str) -> Result<uid_t, ConfigError> {
    match uzers::get_user_by_name(name) {
        Some(user) => Ok(user.uid()),
        None => Err(ConfigError::UnknownUser(name.into())),
    }
}

fn resolve_group(name: &str) -> Result<gid_t, ConfigError> {
    match uzers::get_group_by_name(name) {
        Some(group) => Ok(group.gid()),
        None => Err(ConfigError::UnknownGroup(name.into())),
    }
}

pub fn help_text() -> String {
    Args::command().render_help().to_string()
}

pub fn version_text() -> String {
    format!("{NAME} {VERSION}\n")
}

impl Config {
    /// Parse an argument vector whose first element is the program name.
    pub fn from_args<I, T>(args: I) -> Result<Startup, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let args = args.into_iter().map(Into::into).collect::<Vec<OsString>>();
        let args = match Args::try_parse_from(&args) {
            Ok(parsed) => parsed,
            Err(e) => return Self::early_exit(&args).ok_or(e.into()),
        };
        if args.help {
            return Ok(Startup::Help(help_text()));
        }
        if args.version {
            return Ok(Startup::Version(version_text()));
        }
        Self::from_parsed(args).map(Startup::Run)
    }

    /// Help or version seen before the first bad argument still wins.
    fn early_exit(args: &[OsString]) -> Option<Startup> {
        let matches = Args::command()
            .ignore_errors(true)
            .try_get_matches_from(args)
            .ok()?;
        // parsing may have stopped before defaults were filled in
        let set = |id: &str| {
            matches!(matches.try_get_one::<bool>(id), Ok(Some(true)))
        };
        if set("help") {
            Some(Startup::Help(help_text()))
        } else if set("version") {
            Some(Startup::Version(version_text()))
        } else {
            None
        }
    }

    fn from_parsed(args: Args) -> Result<Self, ConfigError> {
        let uid = match args.user {
            Some(ref name) => Some(resolve_user(name)?),
            None => args.uid,
        };
        let gid = match args.group {
            Some(ref name) => Some(resolve_group(name)?),
            None => args.gid,
        };

        let log = match args.log_file {
            Some(ref path) => LogTarget::open(path)?,
            None => LogTarget::Stdout,
        };

        let storage_root = match args.root {
            Some(root) => root,
            None => std::env::current_dir().map_err(ConfigError::CurrentDir)?,
        };

        Ok(Self {
            port: args.port,
            hostname: args.hostname,
            storage_root,
            chroot: args.chroot,
            detach: args.detach,
            log,
            uid,
            gid,
        })
    }

    /// The storage root as seen by the process once it has (optionally)
    /// chrooted into it.
    pub fn real_storage_root(&self) -> &Path {
        if self.chroot {
            Path::new("/")
        } else {
            &self.storage_root
        }
    }
}

/// Parse the process arguments, exiting on help, version or any error.
pub fn init() -> Config {
    match Config::from_args(std::env::args_os()) {
        Ok(Startup::Run(config)) => config,
        Ok(Startup::Help(text)) | Ok(Startup::Version(text)) => {
            eprint!("{text}");
            std::process::exit(EXIT_INFO);
        }
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(EXIT_FAILURE);
        }
    }
}

/// Make `config` the process-wide configuration.
pub fn install(config: Config) -> Result<&'static Config, ConfigError> {
    CONFIG
        .set(config)
        .map_err(|_| ConfigError::AlreadyInstalled)?;
    CONFIG.get().ok_or(ConfigError::AlreadyInstalled)
}
