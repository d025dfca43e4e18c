//! PTY spawning utilities.
//!
//! Opening the PTY pair, building the interpreter command and turning the
//! master side into an [`FdStream`] live here so [`ProcessSession`] only deals
//! with lifecycle.
//!
//! [`ProcessSession`]: super::ProcessSession

use std::os::fd::{FromRawFd, OwnedFd};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtyPair, PtySize};

use crate::constants::{BANNER_TIMEOUT, DEFAULT_PTY_SIZE, TERMINATE_GRACE};
use crate::transport::fd::FdStream;

/// How to launch the interpreter behind the PTY.
///
/// # Example
///
/// ```ignore
/// let config = SessionConfig::new("micropython")
///     .args(["-X", "heapsize=2M"])
///     .cwd("/tmp/device-root");
/// let mut session = ProcessSession::new(config);
/// session.start()?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Interpreter executable, resolved through `PATH`.
    pub program: String,
    /// Arguments passed through unchanged.
    pub args: Vec<String>,
    /// Working directory of the child. Becomes the device's filesystem root.
    pub cwd: Option<PathBuf>,
    /// PTY rows.
    pub rows: u16,
    /// PTY columns.
    pub cols: u16,
    /// Time the child gets between SIGTERM and SIGKILL.
    pub grace: Duration,
    /// Deadline for a restarted child to print its banner.
    pub banner_timeout: Duration,
}

impl SessionConfig {
    /// Defaults for everything but the program.
    pub fn new(program: impl Into<String>) -> Self {
        let (rows, cols) = DEFAULT_PTY_SIZE;
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            rows,
            cols,
            grace: TERMINATE_GRACE,
            banner_timeout: BANNER_TIMEOUT,
        }
    }

    /// Append arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the child's working directory.
    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Set the PTY dimensions.
    #[must_use]
    pub fn size(mut self, rows: u16, cols: u16) -> Self {
        self.rows = rows;
        self.cols = cols;
        self
    }

    /// Set the SIGTERM grace period.
    #[must_use]
    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Set the banner deadline used after a soft reset.
    #[must_use]
    pub fn banner_timeout(mut self, timeout: Duration) -> Self {
        self.banner_timeout = timeout;
        self
    }
}

/// Open a new PTY pair with the given dimensions.
pub fn open_pty(rows: u16, cols: u16) -> Result<PtyPair> {
    let pty_system = native_pty_system();
    let size = PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    };
    pty_system.openpty(size).context("Failed to open PTY")
}

/// Build the interpreter command from a session config.
pub fn build_command(config: &SessionConfig) -> CommandBuilder {
    let mut cmd = CommandBuilder::new(&config.program);
    for arg in &config.args {
        cmd.arg(arg);
    }
    if let Some(cwd) = &config.cwd {
        cmd.cwd(cwd);
    }
    // Interpreters that look at TERM should not try anything fancy.
    cmd.env("TERM", "dumb");
    cmd
}

/// Duplicate the master fd into a raw-mode [`FdStream`].
///
/// The duplicate is independent of `master`, which stays alive so the PTY is
/// not torn down underneath the stream.
pub fn master_stream(master: &dyn MasterPty, label: &str) -> Result<FdStream> {
    let raw = master.as_raw_fd().context("PTY master has no file descriptor")?;
    // SAFETY: `raw` is a valid fd owned by `master` for the duration of the call.
    let dup = unsafe { libc::fcntl(raw, libc::F_DUPFD_CLOEXEC, 0) };
    if dup < 0 {
        return Err(std::io::Error::last_os_error()).context("Failed to duplicate PTY master");
    }
    // SAFETY: `fcntl` returned a fresh descriptor that nothing else owns.
    let fd = unsafe { OwnedFd::from_raw_fd(dup) };
    let stream = FdStream::from_owned(fd, label).context("Failed to configure PTY master")?;
    stream.make_raw().context("Failed to put PTY into raw mode")?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = SessionConfig::new("micropython")
            .args(["-i", "main.py"])
            .cwd("/tmp")
            .size(40, 120)
            .grace(Duration::from_millis(250));
        assert_eq!(config.args, vec!["-i".to_string(), "main.py".to_string()]);
        assert_eq!(config.cwd, Some(PathBuf::from("/tmp")));
        assert_eq!((config.rows, config.cols), (40, 120));
        assert_eq!(config.grace, Duration::from_millis(250));
        assert_eq!(config.banner_timeout, BANNER_TIMEOUT);
    }

    #[test]
    fn test_build_command_passes_args_through() {
        let config = SessionConfig::new("sh").args(["-c", "echo 'a b'"]);
        let cmd = build_command(&config);
        let argv: Vec<String> = cmd
            .get_argv()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(argv, vec!["sh", "-c", "echo 'a b'"]);
    }

    #[test]
    fn test_open_pty() {
        let pair = open_pty(24, 80).unwrap();
        let size = pair.master.get_size().unwrap();
        assert_eq!((size.rows, size.cols), (24, 80));
    }
}
