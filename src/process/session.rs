//! Interpreter child process attached to a PTY.
//!
//! # Lifecycle
//!
//! ```text
//! Terminated --start--> Running --restart--> Restarting --> Running
//!                          |
//!                          +--terminate--> Terminated
//! ```
//!
//! The PTY master is exposed as a transport. Bytes synthesized by the
//! soft-reset emulator go into `pending_output` and are always read before
//! anything new from the PTY.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use portable_pty::{Child, MasterPty};

use super::spawn::{self, SessionConfig};
use crate::constants::{EXIT_POLL_INTERVAL, EXIT_STATUS_WAIT};
use crate::error::TransportError;
use crate::transport::fd::FdStream;
use crate::transport::{AsyncTransport, Transport};

/// Where the child process is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Not running: never started, shut down, or exited on its own.
    #[default]
    Terminated,
    /// Child alive and attached.
    Running,
    /// Old child going away, new one not up yet.
    Restarting,
}

/// One interpreter process behind a PTY.
pub struct ProcessSession {
    config: SessionConfig,
    state: SessionState,
    // Dropped in declaration order: stream, then master, then child.
    stream: Option<FdStream>,
    master: Option<Box<dyn MasterPty + Send>>,
    child: Option<Box<dyn Child + Send + Sync>>,
    pending_output: BytesMut,
    spawn_attempts: usize,
}

impl std::fmt::Debug for ProcessSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSession")
            .field("program", &self.config.program)
            .field("state", &self.state)
            .field("pid", &self.pid())
            .field("pending_output", &self.pending_output.len())
            .finish_non_exhaustive()
    }
}

impl ProcessSession {
    /// Create a session. Nothing is spawned until [`start`](Self::start).
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: SessionState::Terminated,
            stream: None,
            master: None,
            child: None,
            pending_output: BytesMut::new(),
            spawn_attempts: 0,
        }
    }

    /// Launch configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether a child is attached.
    pub fn is_running(&self) -> bool {
        self.state == SessionState::Running
    }

    /// How many times a spawn has been tried, successful or not.
    pub fn spawn_attempts(&self) -> usize {
        self.spawn_attempts
    }

    /// PID of the current child.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref()?.process_id()
    }

    /// Allocate a PTY and spawn the interpreter on it.
    pub fn start(&mut self) -> Result<()> {
        if self.child.is_some() {
            self.terminate();
        }

        self.spawn_attempts += 1;
        let pair = spawn::open_pty(self.config.rows, self.config.cols)?;
        let cmd = spawn::build_command(&self.config);
        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("Failed to spawn {}", self.config.program))?;
        // Only the child keeps the slave open, so its exit shows up as EOF.
        drop(pair.slave);

        let label = format!("{} pty", self.config.program);
        let stream = spawn::master_stream(pair.master.as_ref(), &label)?;

        log::info!(
            "[Process] Started {} (pid {})",
            self.config.program,
            child.process_id().map_or_else(|| "?".to_string(), |p| p.to_string())
        );
        self.child = Some(child);
        self.master = Some(pair.master);
        self.stream = Some(stream);
        self.state = SessionState::Running;
        Ok(())
    }

    /// Replace the child with a fresh one.
    pub fn restart(&mut self) -> Result<()> {
        self.state = SessionState::Restarting;
        self.stop_child(|| std::thread::sleep(EXIT_POLL_INTERVAL));
        self.start()
    }

    /// [`restart`](Self::restart) without blocking the runtime during the
    /// shutdown grace period.
    pub async fn restart_async(&mut self) -> Result<()> {
        self.state = SessionState::Restarting;
        self.stop_child_async().await;
        self.start()
    }

    /// Two-phase shutdown: SIGTERM, wait up to the grace period, then kill.
    pub fn terminate(&mut self) {
        self.stop_child(|| std::thread::sleep(EXIT_POLL_INTERVAL));
        self.state = SessionState::Terminated;
    }

    /// [`terminate`](Self::terminate) for async callers.
    pub async fn terminate_async(&mut self) {
        self.stop_child_async().await;
        self.state = SessionState::Terminated;
    }

    /// Queue synthesized output ahead of anything the PTY produces next.
    pub fn push_pending(&mut self, bytes: &[u8]) {
        self.pending_output.extend_from_slice(bytes);
    }

    /// Whether synthesized output is waiting to be read.
    pub fn has_pending(&self) -> bool {
        !self.pending_output.is_empty()
    }

    /// The live PTY stream, bypassing `pending_output`.
    pub(crate) fn stream_mut(&mut self) -> Result<&mut FdStream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::Closed)
    }

    fn take_pending(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.pending_output.len());
        buf[..n].copy_from_slice(&self.pending_output.split_to(n));
        n
    }

    fn signal_term(&self) -> Option<Instant> {
        let pid = self.pid()?;
        log::debug!("[Process] Sending SIGTERM to {pid}");
        // SAFETY: plain syscall on a pid we spawned and have not reaped yet.
        unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        Some(Instant::now() + self.config.grace)
    }

    fn exited(&mut self) -> bool {
        match self.child.as_mut().map(|c| c.try_wait()) {
            Some(Ok(Some(_))) | None => true,
            Some(Ok(None)) => false,
            Some(Err(e)) => {
                log::warn!("[Process] Failed to poll child: {e}");
                true
            }
        }
    }

    fn stop_child(&mut self, mut pause: impl FnMut()) {
        if self.child.is_none() {
            self.release();
            return;
        }
        if let Some(deadline) = self.signal_term() {
            while !self.exited() && Instant::now() < deadline {
                pause();
            }
        }
        self.reap();
    }

    async fn stop_child_async(&mut self) {
        if self.child.is_none() {
            self.release();
            return;
        }
        if let Some(deadline) = self.signal_term() {
            while !self.exited() && Instant::now() < deadline {
                tokio::time::sleep(EXIT_POLL_INTERVAL).await;
            }
        }
        self.reap_async().await;
    }

    /// Force-kill if still alive and collect the exit status.
    fn reap(&mut self) {
        self.release();
        if let Some(mut child) = self.child.take() {
            kill_if_alive(child.as_mut());
            let _ = child.wait();
        }
    }

    /// [`reap`](Self::reap) with the final `wait` moved off the runtime.
    async fn reap_async(&mut self) {
        self.release();
        if let Some(mut child) = self.child.take() {
            kill_if_alive(child.as_mut());
            if let Err(e) = tokio::task::spawn_blocking(move || child.wait()).await {
                log::warn!("[Process] Reaper task failed: {e}");
            }
        }
    }

    /// Drop every master-side fd so the PTY can be torn down.
    fn release(&mut self) {
        self.stream = None;
        self.master = None;
    }

    /// `Some(code)` once the child's exit status is known, `Some(None)` when
    /// it cannot be learned, `None` while the child still runs.
    fn poll_exit_code(&mut self) -> Option<Option<u32>> {
        match self.child.as_mut().map(|c| c.try_wait()) {
            Some(Ok(Some(status))) => Some(Some(status.exit_code())),
            Some(Ok(None)) => None,
            _ => Some(None),
        }
    }

    /// The child went away by itself; find out how.
    fn exit_error(&mut self) -> TransportError {
        let deadline = Instant::now() + EXIT_STATUS_WAIT;
        let status = loop {
            match self.poll_exit_code() {
                Some(status) => break status,
                None if Instant::now() < deadline => std::thread::sleep(EXIT_POLL_INTERVAL),
                None => break None,
            }
        };
        self.reap();
        self.exited_unexpectedly(status)
    }

    /// [`exit_error`](Self::exit_error) without blocking the runtime.
    async fn exit_error_async(&mut self) -> TransportError {
        let deadline = Instant::now() + EXIT_STATUS_WAIT;
        let status = loop {
            match self.poll_exit_code() {
                Some(status) => break status,
                None if Instant::now() < deadline => tokio::time::sleep(EXIT_POLL_INTERVAL).await,
                None => break None,
            }
        };
        self.reap_async().await;
        self.exited_unexpectedly(status)
    }

    fn exited_unexpectedly(&mut self, status: Option<u32>) -> TransportError {
        log::warn!("[Process] {} exited unexpectedly (status {status:?})", self.config.program);
        self.state = SessionState::Terminated;
        TransportError::ProcessExitedUnexpectedly { status }
    }

    fn settle<T>(&mut self, result: Result<T, TransportError>) -> Result<T, TransportError> {
        match result {
            Err(TransportError::Closed) if self.child.is_some() => Err(self.exit_error()),
            other => other,
        }
    }

    async fn settle_async<T: Send>(
        &mut self,
        result: Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        match result {
            Err(TransportError::Closed) if self.child.is_some() => {
                Err(self.exit_error_async().await)
            }
            other => other,
        }
    }
}

impl Transport for ProcessSession {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        if self.has_pending() {
            return Ok(self.take_pending(buf));
        }
        let result = match self.stream.as_mut() {
            Some(stream) => Transport::read(stream, buf, timeout),
            None => Err(TransportError::Closed),
        };
        self.settle(result)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let result = match self.stream.as_mut() {
            Some(stream) => Transport::write_all(stream, data),
            None => Err(TransportError::Closed),
        };
        self.settle(result)
    }

    fn close(&mut self) {
        self.terminate();
    }

    fn is_closed(&self) -> bool {
        self.stream.is_none() && self.pending_output.is_empty()
    }
}

#[async_trait]
impl AsyncTransport for ProcessSession {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.has_pending() {
            return Ok(self.take_pending(buf));
        }
        let result = match self.stream.as_mut() {
            Some(stream) => AsyncTransport::read(stream, buf).await,
            None => Err(TransportError::Closed),
        };
        self.settle_async(result).await
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let result = match self.stream.as_mut() {
            Some(stream) => AsyncTransport::write_all(stream, data).await,
            None => Err(TransportError::Closed),
        };
        self.settle_async(result).await
    }

    async fn close(&mut self) {
        self.terminate_async().await;
    }

    fn is_closed(&self) -> bool {
        self.stream.is_none() && self.pending_output.is_empty()
    }
}

fn kill_if_alive(child: &mut (dyn Child + Send + Sync)) {
    if !matches!(child.try_wait(), Ok(Some(_))) {
        log::info!("[Process] Child ignored SIGTERM, killing");
        if let Err(e) = child.kill() {
            log::warn!("[Process] Failed to kill child: {e}");
        }
    }
}

impl Drop for ProcessSession {
    fn drop(&mut self) {
        if self.child.is_some() {
            self.terminate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick(program: &str, args: &[&str]) -> ProcessSession {
        ProcessSession::new(
            SessionConfig::new(program)
                .args(args.iter().copied())
                .grace(Duration::from_millis(200)),
        )
    }

    #[test]
    fn test_start_and_terminate() {
        let mut session = quick("cat", &[]);
        assert_eq!(session.state(), SessionState::Terminated);
        session.start().unwrap();
        assert!(session.is_running());
        assert!(session.pid().is_some());
        session.terminate();
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(session.pid().is_none());
        assert!(Transport::is_closed(&session));
    }

    #[test]
    fn test_pty_is_byte_transparent() {
        let mut session = quick("cat", &[]);
        session.start().unwrap();
        Transport::write_all(&mut session, b"a\xffb\n").unwrap();
        let echoed =
            Transport::read_until(&mut session, b"\n", Duration::from_secs(2), None).unwrap();
        assert_eq!(echoed, b"a\xffb\n");
    }

    #[test]
    fn test_pending_output_comes_first() {
        let mut session = quick("sh", &["-c", "printf live; sleep 5"]);
        session.start().unwrap();
        session.push_pending(b"synthetic ");
        let got = Transport::read_until(&mut session, b"live", Duration::from_secs(2), None)
            .unwrap();
        assert_eq!(got, b"synthetic live");
    }

    #[test]
    fn test_restart_changes_pid() {
        let mut session = quick("cat", &[]);
        session.start().unwrap();
        let before = session.pid();
        session.restart().unwrap();
        assert!(session.is_running());
        assert_ne!(session.pid(), before);
    }

    #[test]
    fn test_term_ignoring_child_is_killed() {
        let mut session = quick("sh", &["-c", "trap '' TERM; printf ready; while :; do sleep 1; done"]);
        session.start().unwrap();
        Transport::read_until(&mut session, b"ready", Duration::from_secs(2), None).unwrap();
        let started = Instant::now();
        session.terminate();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[test]
    fn test_unexpected_exit_is_reported() {
        let mut session = quick("sh", &["-c", "exit 3"]);
        session.start().unwrap();
        let mut buf = [0u8; 16];
        let err = loop {
            match Transport::read(&mut session, &mut buf, Duration::from_secs(2)) {
                Ok(_) => continue,
                Err(e) => break e,
            }
        };
        assert!(matches!(err, TransportError::ProcessExitedUnexpectedly { status: Some(3) }));
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn test_async_round_trip_and_restart() {
        let mut session = quick("cat", &[]);
        session.start().unwrap();
        AsyncTransport::write_all(&mut session, b"ping\n").await.unwrap();
        let got = AsyncTransport::read_until(&mut session, b"\n", Duration::from_secs(2), None)
            .await
            .unwrap();
        assert_eq!(got, b"ping\n");
        let before = session.pid();
        session.restart_async().await.unwrap();
        assert_ne!(session.pid(), before);
        session.terminate_async().await;
    }

    #[tokio::test]
    async fn test_async_unexpected_exit_is_reported() {
        let mut session = quick("sh", &["-c", "exit 3"]);
        session.start().unwrap();
        let mut buf = [0u8; 16];
        let err = loop {
            match AsyncTransport::read(&mut session, &mut buf).await {
                Ok(_) => continue,
                Err(e) => break e,
            }
        };
        assert!(matches!(err, TransportError::ProcessExitedUnexpectedly { status: Some(3) }));
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_exit_status_wait_yields_to_runtime() {
        // Closes the PTY right away but lives on, so the exit status wait runs
        // its full course before the child is killed.
        let mut session = quick("sh", &["-c", "exec 0<&- 1>&- 2>&-; exec sleep 5"]);
        session.start().unwrap();

        let ticks = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = std::sync::Arc::clone(&ticks);
        let ticker = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        });

        let mut buf = [0u8; 16];
        let err = loop {
            match AsyncTransport::read(&mut session, &mut buf).await {
                Ok(_) => continue,
                Err(e) => break e,
            }
        };
        ticker.abort();
        assert!(matches!(err, TransportError::ProcessExitedUnexpectedly { .. }));
        assert!(
            ticks.load(std::sync::atomic::Ordering::Relaxed) >= 5,
            "runtime was blocked while waiting for the exit status"
        );
    }
}
