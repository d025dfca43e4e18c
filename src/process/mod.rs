//! Interpreter process behind a PTY.
//!
//! - [`ProcessSession`] owns the child and exposes the PTY master as a
//!   transport
//! - [`SoftResetEmulator`] wraps a session so a reset byte restarts the child
//!   instead of ending it
//! - [`spawn`] holds the PTY and command plumbing

pub mod session;
pub mod soft_reset;
pub mod spawn;

pub use self::session::{ProcessSession, SessionState};
pub use self::soft_reset::{Outbound, ResetClassifier, SoftResetEmulator};
pub use self::spawn::SessionConfig;
