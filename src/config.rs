//! Bridge configuration loading.
//!
//! Values are layered: built-in defaults, then a JSON file, then
//! `REPLBRIDGE_*` environment variables. Command-line flags are applied on
//! top by `main`.

use std::path::{Path, PathBuf};
use std::time::Duration;
use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{
    BANNER_TIMEOUT, DEFAULT_PTY_SIZE, DEFAULT_RAW_PORT, DEFAULT_TELNET_PORT, TERMINATE_GRACE,
};
use crate::process::SessionConfig;

/// Configuration for `replbridge bridge`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Address both listeners bind to.
    pub host: String,
    /// Port of the telnet/RFC 2217 listener. `None` disables it.
    pub telnet_port: Option<u16>,
    /// Port of the raw socket listener. `None` disables it.
    pub raw_port: Option<u16>,
    /// Interpreter executable.
    pub program: String,
    /// Arguments passed to the interpreter.
    pub args: Vec<String>,
    /// Working directory of the interpreter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// SIGTERM grace period in milliseconds.
    pub terminate_grace_ms: u64,
    /// Banner deadline after a soft reset, in milliseconds.
    pub banner_timeout_ms: u64,
    /// PTY rows.
    pub rows: u16,
    /// PTY columns.
    pub cols: u16,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let (rows, cols) = DEFAULT_PTY_SIZE;
        Self {
            host: "127.0.0.1".to_string(),
            telnet_port: Some(DEFAULT_TELNET_PORT),
            raw_port: Some(DEFAULT_RAW_PORT),
            program: "micropython".to_string(),
            args: Vec::new(),
            cwd: None,
            terminate_grace_ms: TERMINATE_GRACE.as_millis() as u64,
            banner_timeout_ms: BANNER_TIMEOUT.as_millis() as u64,
            rows,
            cols,
        }
    }
}

impl BridgeConfig {
    /// Default location of the config file, if a config directory exists.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("replbridge").join("config.json"))
    }

    /// Load defaults, then `path` (or the default file when present), then
    /// environment overrides.
    ///
    /// An explicit `path` must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::load_from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Apply `REPLBRIDGE_*` overrides looked up through `var`.
    pub fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = var("REPLBRIDGE_HOST") {
            self.host = host;
        }
        if let Some(port) = var("REPLBRIDGE_TELNET_PORT") {
            self.telnet_port = parse_port(&port).context("Invalid REPLBRIDGE_TELNET_PORT")?;
        }
        if let Some(port) = var("REPLBRIDGE_RAW_PORT") {
            self.raw_port = parse_port(&port).context("Invalid REPLBRIDGE_RAW_PORT")?;
        }
        if let Some(program) = var("REPLBRIDGE_PROGRAM") {
            self.program = program;
        }
        if let Some(cwd) = var("REPLBRIDGE_CWD") {
            self.cwd = Some(PathBuf::from(shellexpand::tilde(&cwd).as_ref()));
        }
        Ok(())
    }

    /// Reject configurations the bridge cannot run.
    pub fn validate(&self) -> Result<()> {
        match (self.telnet_port, self.raw_port) {
            (None, None) => anyhow::bail!("At least one listener must be enabled"),
            (Some(a), Some(b)) if a == b && a != 0 => {
                anyhow::bail!("Telnet and raw listeners cannot share port {a}")
            }
            _ => {}
        }
        if self.program.trim().is_empty() {
            anyhow::bail!("No interpreter program configured");
        }
        Ok(())
    }

    /// Bind address of a listener on this host.
    ///
    /// The host may be an IP literal (IPv6 with or without brackets) or a
    /// name such as `localhost`, in which case the first resolved address
    /// is used.
    pub fn listen_addr(&self, port: u16) -> Result<SocketAddr> {
        let host = self.host.trim_start_matches('[').trim_end_matches(']');
        (host, port)
            .to_socket_addrs()
            .with_context(|| format!("Invalid listen host {:?}", self.host))?
            .next()
            .with_context(|| format!("Listen host {:?} resolved to no address", self.host))
    }

    /// Process settings derived from this config.
    pub fn session_config(&self) -> SessionConfig {
        let mut session = SessionConfig::new(&self.program)
            .args(self.args.iter().cloned())
            .size(self.rows, self.cols)
            .grace(Duration::from_millis(self.terminate_grace_ms))
            .banner_timeout(Duration::from_millis(self.banner_timeout_ms));
        if let Some(cwd) = &self.cwd {
            session = session.cwd(cwd);
        }
        session
    }
}

/// Parse a port, where `off` disables the listener.
fn parse_port(value: &str) -> Result<Option<u16>> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("off") {
        return Ok(None);
    }
    Ok(Some(value.parse::<u16>()?))
}
