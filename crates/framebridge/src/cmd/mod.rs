use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Subcommand, ValueEnum};
use framebridge_protocol::{TransportKind, DEFAULT_PORT};

use crate::exit::{CliError, CliResult, INTERNAL, USAGE};
use crate::output::OutputFormat;

pub mod doctor;
pub mod envinfo;
pub mod serve;
pub mod stream;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a consumer and print every frame it receives.
    Serve(ServeArgs),
    /// Run a producer that streams a synthetic test pattern.
    Stream(StreamArgs),
    /// Show version information.
    Version(VersionArgs),
    /// Run local environment health checks.
    Doctor(DoctorArgs),
    /// Print build, settings and environment diagnostics.
    Envinfo(EnvinfoArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format),
        Command::Stream(args) => stream::run(args, format),
        Command::Version(args) => version::run(args),
        Command::Doctor(args) => doctor::run(args, format),
        Command::Envinfo(args) => envinfo::run(args, format),
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum TransportArg {
    Shm,
    #[value(name = "tcp_lz4", alias = "tcp")]
    TcpLz4,
}

impl From<TransportArg> for TransportKind {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Shm => TransportKind::Shm,
            TransportArg::TcpLz4 => TransportKind::TcpLz4,
        }
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Loopback port to listen on.
    #[arg(long, env = "FRAMEBRIDGE_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,
    /// Transport offered to the producer.
    #[arg(long, value_enum, default_value = "tcp_lz4")]
    pub transport: TransportArg,
    /// Exit after receiving N frames.
    #[arg(long)]
    pub count: Option<usize>,
    /// Ask the producer for at most this stream size (e.g. 640x360).
    #[arg(long, value_name = "WxH")]
    pub target: Option<String>,
    /// Give up when no producer connects in time (e.g. 30s, 500ms).
    #[arg(long)]
    pub timeout: Option<String>,
}

#[derive(Args, Debug)]
pub struct StreamArgs {
    /// Consumer port to connect to.
    #[arg(long, env = "FRAMEBRIDGE_PORT", default_value_t = u32::from(DEFAULT_PORT))]
    pub port: u32,
    /// Number of frames to send.
    #[arg(long, default_value_t = 60)]
    pub frames: u64,
    #[arg(long, default_value_t = 64)]
    pub width: u32,
    #[arg(long, default_value_t = 64)]
    pub height: u32,
    /// Frames per second.
    #[arg(long, default_value_t = 30)]
    pub fps: u32,
    /// How long to wait for the consumer to accept the session.
    #[arg(long, default_value = "5s")]
    pub connect_timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

#[derive(Args, Debug, Default)]
pub struct DoctorArgs {}

#[derive(Args, Debug, Default)]
pub struct EnvinfoArgs {}

/// Clear `running` on ctrl-c. Only one handler can be installed per process.
pub(crate) fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

/// Parse `WxH`; both sides must be positive.
pub fn parse_size(input: &str) -> CliResult<(u32, u32)> {
    let invalid = || CliError::new(USAGE, format!("invalid size {input:?}, expected WxH"));
    let (w, h) = input
        .trim()
        .split_once(['x', 'X'])
        .ok_or_else(invalid)?;
    let width: u32 = w.parse().map_err(|_| invalid())?;
    let height: u32 = h.parse().map_err(|_| invalid())?;
    if width == 0 || height == 0 {
        return Err(invalid());
    }
    Ok((width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctrlc_handler_installs_once_per_process() {
        let first = install_ctrlc_handler(Arc::new(AtomicBool::new(true)));
        let second = install_ctrlc_handler(Arc::new(AtomicBool::new(true)));
        assert!(first.is_ok());
        let err = second.unwrap_err();
        assert_eq!(err.code, INTERNAL);
        assert!(err.message.contains("signal handler"), "{}", err.message);
    }

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
    }

    #[test]
    fn parse_size_accepts_both_separators() {
        assert_eq!(parse_size("640x360").unwrap(), (640, 360));
        assert_eq!(parse_size("1920X1080").unwrap(), (1920, 1080));
    }

    #[test]
    fn parse_size_rejects_garbage() {
        assert_eq!(parse_size("640").unwrap_err().code, USAGE);
        assert!(parse_size("0x10").is_err());
        assert!(parse_size("axb").is_err());
    }
}
