//! Application-wide constants for replbridge.
//!
//! This module centralizes the timeouts and sizing constants used by the
//! Raw-REPL client and the bridge. Wire-level control bytes live in
//! [`crate::protocol`] next to the code that interprets them.
//!
//! # Categories
//!
//! - **Client timeouts**: prompt, follow and raw-paste acknowledgement waits
//! - **Upload**: fallback chunking for peers without raw-paste
//! - **Process**: shutdown grace and banner waits for the PTY child
//! - **Bridge**: listener defaults and buffer sizes

use std::time::Duration;

// ============================================================================
// Client timeouts
// ============================================================================

/// Overall deadline for `enter` to observe the raw REPL prompt.
pub const ENTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Default deadline for a single prompt or sentinel wait during `exec`.
pub const EXEC_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for `exit` to observe the friendly prompt again.
pub const EXIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Deadline for the peer to acknowledge the end of a raw-paste upload.
pub const PASTE_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for each credit byte while the raw-paste window is exhausted.
pub const PASTE_CREDIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for an endpoint to accept more bytes when its buffer is full.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Quiet period used to discard stale bytes after interrupting the peer.
pub const DRAIN_QUIET_PERIOD: Duration = Duration::from_millis(100);

// ============================================================================
// Upload
// ============================================================================

/// Chunk size for peers that do not speak raw-paste.
pub const FALLBACK_CHUNK_SIZE: usize = 256;

/// Gap between fallback chunks so the peer's input buffer can drain.
pub const FALLBACK_CHUNK_DELAY: Duration = Duration::from_millis(10);

// ============================================================================
// Process
// ============================================================================

/// Time a child gets to exit after SIGTERM before it is killed.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(1);

/// Deadline for a freshly spawned interpreter to print its banner.
pub const BANNER_TIMEOUT: Duration = Duration::from_secs(2);

/// Interval between exit checks while waiting for a terminated child.
pub const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long to wait for the exit status of a child that closed its PTY.
pub const EXIT_STATUS_WAIT: Duration = Duration::from_millis(100);

/// Default PTY dimensions (rows, cols).
pub const DEFAULT_PTY_SIZE: (u16, u16) = (24, 80);

// ============================================================================
// Bridge
// ============================================================================

/// Default TCP port of the telnet/RFC 2217 listener.
pub const DEFAULT_TELNET_PORT: u16 = 2217;

/// Default TCP port of the raw socket listener.
pub const DEFAULT_RAW_PORT: u16 = 2218;

/// Read buffer size for both directions of the copy loop.
pub const COPY_BUFFER_SIZE: usize = 4096;

/// Default virtual baud rate reported over RFC 2217.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;
