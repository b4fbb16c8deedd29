//! Background daemon supervision.
//!
//! `run --daemon` re-executes the connector as `run --config <path>
//! --log-json` in a new session, appends its output to `daemon.log` and
//! records its pid in `daemon.pid`. `stop` signals that pid.

mod process;

use std::ffi::OsString;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Paths;

pub use process::{OsProcessControl, ProcessControl};

/// How long `stop` waits for the daemon to exit.
pub const STOP_GRACE: Duration = Duration::from_secs(2);

const STOP_POLL: Duration = Duration::from_millis(50);

/// Errors from daemon start/stop.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("connector daemon already running (pid {0})")]
    AlreadyRunning(u32),

    #[error("connector daemon not running ({0})")]
    NotRunning(String),

    #[error("invalid pid file {}: {contents:?}", path.display())]
    InvalidPidFile { path: PathBuf, contents: String },

    #[error("daemon did not exit (pid {0})")]
    DidNotExit(u32),

    #[error("failed to {action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to start daemon: {0}")]
    Spawn(#[source] io::Error),

    #[error("failed to stop daemon (pid {pid}): {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

fn io_error<'a>(
    action: &'static str,
    path: &'a Path,
) -> impl FnOnce(io::Error) -> DaemonError + 'a {
    move |source| DaemonError::Io {
        action,
        path: path.to_path_buf(),
        source,
    }
}

/// What the pid file says.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PidFile {
    Missing,
    Invalid(String),
    Pid(u32),
}

/// Parse pid file contents: a decimal pid, surrounding whitespace ignored.
pub fn parse_pid(raw: &str) -> Option<u32> {
    raw.trim().parse().ok()
}

/// Starts and stops the background connector.
pub struct DaemonSupervisor<P: ProcessControl> {
    paths: Paths,
    control: P,
    grace: Duration,
}

impl<P: ProcessControl> DaemonSupervisor<P> {
    pub fn new(paths: Paths, control: P) -> Self {
        Self {
            paths,
            control,
            grace: STOP_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn control(&self) -> &P {
        &self.control
    }

    pub fn read_pid_file(&self) -> Result<PidFile, DaemonError> {
        let path = self.paths.pid();
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(match parse_pid(&raw) {
                Some(pid) => PidFile::Pid(pid),
                None => PidFile::Invalid(raw),
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(PidFile::Missing),
            Err(e) => Err(io_error("read pid file", &path)(e)),
        }
    }

    /// Start the daemon from the current executable.
    pub fn start(&self) -> Result<u32, DaemonError> {
        let exe = std::env::current_exe().map_err(DaemonError::Spawn)?;
        self.start_program(&exe)
    }

    /// Start `program` as the daemon. Returns the new pid.
    pub fn start_program(&self, program: &Path) -> Result<u32, DaemonError> {
        let dir = self.paths.dir();
        fs::create_dir_all(dir).map_err(io_error("create config dir", dir))?;

        let pid_path = self.paths.pid();
        match self.read_pid_file()? {
            PidFile::Pid(pid) if self.control.is_alive(pid) => {
                return Err(DaemonError::AlreadyRunning(pid));
            }
            PidFile::Pid(pid) => {
                debug!(pid, "Removing stale pid file");
                remove_pid_file(&pid_path);
            }
            PidFile::Invalid(_) => {
                debug!(path = %pid_path.display(), "Removing unreadable pid file");
                remove_pid_file(&pid_path);
            }
            PidFile::Missing => {}
        }

        let log_path = self.paths.log();
        let log = open_log(&log_path).map_err(io_error("open log file", &log_path))?;

        let args: Vec<OsString> = vec![
            "run".into(),
            "--config".into(),
            self.paths.config().as_os_str().to_owned(),
            "--log-json".into(),
        ];
        let pid = self
            .control
            .spawn_detached(program, &args, log)
            .map_err(DaemonError::Spawn)?;

        write_pid_file(&pid_path, pid).map_err(io_error("write pid file", &pid_path))?;

        info!(pid, log = %log_path.display(), "Daemon started");
        Ok(pid)
    }

    /// Stop the daemon. Returns the pid that exited.
    pub async fn stop(&self) -> Result<u32, DaemonError> {
        let pid_path = self.paths.pid();
        let pid = match self.read_pid_file()? {
            PidFile::Missing => {
                return Err(DaemonError::NotRunning(format!(
                    "missing {}",
                    pid_path.display()
                )));
            }
            PidFile::Invalid(contents) => {
                return Err(DaemonError::InvalidPidFile {
                    path: pid_path,
                    contents,
                });
            }
            PidFile::Pid(pid) => pid,
        };

        if !self.control.is_alive(pid) {
            remove_pid_file(&pid_path);
            return Err(DaemonError::NotRunning(format!("stale pid {pid}")));
        }

        self.control
            .terminate(pid)
            .map_err(|source| DaemonError::Signal { pid, source })?;

        let deadline = tokio::time::Instant::now() + self.grace;
        loop {
            if !self.control.is_alive(pid) {
                remove_pid_file(&pid_path);
                info!(pid, "Daemon stopped");
                return Ok(pid);
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(pid, "Daemon did not exit after SIGTERM");
                return Err(DaemonError::DidNotExit(pid));
            }
            tokio::time::sleep(STOP_POLL).await;
        }
    }
}

fn remove_pid_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove pid file");
        }
    }
}

fn private_options() -> fs::OpenOptions {
    let mut options = fs::OpenOptions::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
}

fn open_log(path: &Path) -> io::Result<fs::File> {
    private_options().create(true).append(true).open(path)
}

fn write_pid_file(path: &Path, pid: u32) -> io::Result<()> {
    let mut file = private_options()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    writeln!(file, "{pid}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("1234\n", Some(1234))]
    #[case("  42  ", Some(42))]
    #[case("", None)]
    #[case("abc", None)]
    #[case("-7", None)]
    fn test_parse_pid(#[case] raw: &str, #[case] expected: Option<u32>) {
        assert_eq!(parse_pid(raw), expected);
    }
}
