//! replbridge - Raw-REPL client and PTY network bridge.
//!
//! This crate drives MicroPython-style interpreters through the raw REPL
//! protocol, and makes an interpreter subprocess look like a serial-attached
//! device so existing tooling can talk to it over TCP.
//!
//! # Architecture
//!
//! - **Protocol** - Raw-REPL state machine and raw-paste flow control
//! - **Transport** - Byte endpoints (serial line, TCP, PTY process)
//! - **Process** - Interpreter child on a PTY, with soft-reset emulation
//! - **Bridge** - Telnet/RFC 2217 and raw TCP listeners in front of a process
//! - **Console** - Interactive terminal for any target
//!
//! # Modules
//!
//! - [`protocol`] - [`RawReplEngine`] and [`AsyncRawReplEngine`]
//! - [`transport`] - [`Transport`], [`AsyncTransport`] and [`Target`]
//! - [`process`] - [`ProcessSession`] and [`SoftResetEmulator`]
//! - [`bridge`] - [`BridgeServer`]
//! - [`config`] - Bridge configuration loading

pub mod bridge;
pub mod config;
pub mod console;
pub mod constants;
pub mod error;
pub mod process;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use bridge::BridgeServer;
pub use config::BridgeConfig;
pub use error::{ExecError, Phase, ProtocolError, TransportError, UploadError};
pub use process::{ProcessSession, SoftResetEmulator};
pub use protocol::{AsyncRawReplEngine, RawReplEngine, Value};
pub use transport::{AsyncTransport, Target, Transport};
