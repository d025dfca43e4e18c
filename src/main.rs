//! replbridge CLI - talk to raw-REPL devices and bridge interpreters to TCP.
//!
//! This is the main binary entry point. See the `replbridge` library for
//! the core functionality.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use mimalloc::MiMalloc;
use replbridge::console::{self, ConsoleOptions};
use replbridge::{BridgeConfig, BridgeServer, ExecError, RawReplEngine, Target};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Target used when `--device` is not given: the local bridge's raw port.
const DEFAULT_DEVICE: &str = "tcp://127.0.0.1:2218";

// CLI
#[derive(Parser)]
#[command(name = "replbridge")]
#[command(version)]
#[command(about = "Raw-REPL client and PTY bridge for MicroPython-style interpreters")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct DeviceArgs {
    /// serial:/dev/ttyACM0[@baud], tcp://host:port, rfc2217://host:port or "exec:PROGRAM ARGS"
    #[arg(short, long, default_value = DEFAULT_DEVICE)]
    device: String,

    /// Soft-reset the interpreter before running
    #[arg(long)]
    soft_reset: bool,

    /// Seconds to wait for each response
    #[arg(long, default_value_t = 10)]
    timeout: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve an interpreter subprocess over telnet/RFC 2217 and raw TCP
    Bridge {
        /// Config file (defaults to <config dir>/replbridge/config.json)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Address to listen on
        #[arg(long)]
        host: Option<String>,
        /// Telnet/RFC 2217 port
        #[arg(long)]
        telnet_port: Option<u16>,
        /// Raw socket port
        #[arg(long)]
        raw_port: Option<u16>,
        /// Disable the telnet/RFC 2217 listener
        #[arg(long, conflicts_with = "telnet_port")]
        no_telnet: bool,
        /// Disable the raw socket listener
        #[arg(long, conflicts_with = "raw_port")]
        no_raw: bool,
        /// Working directory of the interpreter
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Interpreter program and its arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Execute code in the raw REPL and print its output
    Exec {
        #[command(flatten)]
        device: DeviceArgs,
        /// Source code to run
        code: String,
    },
    /// Evaluate an expression and print its value
    Eval {
        #[command(flatten)]
        device: DeviceArgs,
        /// Print the value as JSON
        #[arg(long)]
        json: bool,
        /// Python expression
        expr: String,
    },
    /// Run a local file on the device, streaming its output
    Run {
        #[command(flatten)]
        device: DeviceArgs,
        /// Script to upload and run
        file: PathBuf,
    },
    /// Soft-reset the device and return to the interactive prompt
    Reset {
        /// Device target
        #[arg(short, long, default_value = DEFAULT_DEVICE)]
        device: String,
    },
    /// Interactive terminal
    Repl {
        /// Device target
        #[arg(short, long, default_value = DEFAULT_DEVICE)]
        device: String,
        /// Code sent on Ctrl-J
        #[arg(long)]
        inject_code: Option<String>,
        /// File run through the raw REPL on Ctrl-K
        #[arg(long)]
        inject_file: Option<PathBuf>,
        /// Show non-printable bytes as [xx]
        #[arg(long)]
        escape_non_printable: bool,
        /// Also write device output to this file
        #[arg(long)]
        capture: Option<PathBuf>,
    },
}

fn init_logging(verbose: u8) -> Result<()> {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
    // The interactive console owns the terminal, so logs can go to a file instead
    if let Ok(path) = std::env::var("REPLBRIDGE_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file at {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }
    builder.format_timestamp_millis().init();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    match cli.command {
        Commands::Bridge {
            config,
            host,
            telnet_port,
            raw_port,
            no_telnet,
            no_raw,
            cwd,
            command,
        } => {
            let mut config = BridgeConfig::load(config.as_deref())?;
            if let Some(host) = host {
                config.host = host;
            }
            if telnet_port.is_some() || no_telnet {
                config.telnet_port = telnet_port;
            }
            if raw_port.is_some() || no_raw {
                config.raw_port = raw_port;
            }
            if let Some(cwd) = cwd {
                config.cwd = Some(cwd);
            }
            if let Some((program, args)) = command.split_first() {
                config.program = program.clone();
                config.args = args.to_vec();
            }
            config.validate()?;
            runtime()?.block_on(run_bridge(&config))
        }
        Commands::Exec { device, code } => {
            let mut engine = connect(&device)?;
            let outcome = engine.exec(code.as_bytes(), Duration::from_secs(device.timeout));
            let result = finish(outcome.map(|(stdout, _)| stdout));
            close(engine);
            exit_with(result)
        }
        Commands::Eval { device, json, expr } => {
            let mut engine = connect(&device)?;
            let value = engine.eval(&expr);
            close(engine);
            match value {
                Ok(value) if json => println!("{}", serde_json::to_string(&value)?),
                Ok(value) => println!("{value}"),
                Err(e) => return exit_with(finish(Err(e))),
            }
            Ok(())
        }
        Commands::Run { device, file } => {
            let code = std::fs::read(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let mut engine = connect(&device)?;
            let result = engine.exec_raw_no_follow(&code).and_then(|()| {
                let mut stdout = std::io::stdout();
                let mut print = |chunk: &[u8]| {
                    let _ = stdout.write_all(chunk);
                    let _ = stdout.flush();
                };
                let (_, stderr) = engine
                    .follow(Duration::from_secs(device.timeout), Some(&mut print))
                    .map_err(ExecError::from)?;
                if stderr.is_empty() {
                    Ok(Vec::new())
                } else {
                    Err(ExecError::Raised { stdout: Vec::new(), stderr })
                }
            });
            let result = finish(result);
            close(engine);
            exit_with(result)
        }
        Commands::Reset { device } => {
            let target = Target::parse(&device)?;
            let mut engine = RawReplEngine::new(target.open()?);
            engine.enter(true).context("Soft reset failed")?;
            engine.exit().context("Failed to leave the raw REPL")?;
            engine.close();
            Ok(())
        }
        Commands::Repl { device, inject_code, inject_file, escape_non_printable, capture } => {
            let target = Target::parse(&device)?;
            let options = ConsoleOptions { inject_code, inject_file, escape_non_printable, capture };
            runtime()?.block_on(async {
                let device = target.open_async().await?;
                console::run(device, options).await
            })
        }
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start tokio runtime")
}

async fn run_bridge(config: &BridgeConfig) -> Result<()> {
    let server = BridgeServer::start(config).await?;
    if let Some(addr) = server.telnet_addr() {
        eprintln!("RFC 2217 listening on {addr}");
    }
    if let Some(addr) = server.raw_addr() {
        eprintln!("Raw socket listening on {addr}");
    }

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to wait for Ctrl-C")?,
        _ = sigterm.recv() => log::info!("[Bridge] SIGTERM received"),
    }
    server.shutdown().await;
    Ok(())
}

/// Open the target and enter the raw REPL.
fn connect(args: &DeviceArgs) -> Result<RawReplEngine> {
    let target = Target::parse(&args.device)?;
    let mut engine = RawReplEngine::new(target.open()?);
    engine
        .enter(args.soft_reset)
        .with_context(|| format!("Failed to enter raw REPL on {target}"))?;
    Ok(engine)
}

/// Leave the raw REPL, logging rather than failing: the command already ran.
fn close(mut engine: RawReplEngine) {
    if let Err(e) = engine.exit() {
        log::warn!("Failed to leave raw REPL: {e}");
    }
    engine.close();
}

/// Print a command's output. `Ok(true)` when the remote code raised.
fn finish(result: Result<Vec<u8>, ExecError>) -> Result<bool> {
    let mut stdout = std::io::stdout();
    match result {
        Ok(output) => {
            stdout.write_all(&output)?;
            stdout.flush()?;
            Ok(false)
        }
        Err(ExecError::Raised { stdout: output, stderr }) => {
            stdout.write_all(&output)?;
            stdout.flush()?;
            std::io::stderr().write_all(&stderr)?;
            Ok(true)
        }
        Err(e) => Err(e.into()),
    }
}

fn exit_with(raised: Result<bool>) -> Result<()> {
    if raised? {
        std::process::exit(1);
    }
    Ok(())
}
