mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "framebridge", version, about = "Local frame streaming bridge")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::TransportArg;

    #[test]
    fn parses_serve_subcommand() {
        let cli = Cli::try_parse_from([
            "framebridge",
            "serve",
            "--port",
            "40001",
            "--transport",
            "shm",
            "--count",
            "2",
            "--target",
            "320x180",
        ])
        .expect("serve args should parse");

        match cli.command {
            Command::Serve(args) => {
                assert_eq!(args.port, 40001);
                assert_eq!(args.transport, TransportArg::Shm);
                assert_eq!(args.count, Some(2));
                assert_eq!(args.target.as_deref(), Some("320x180"));
            }
            other => panic!("expected serve, got {other:?}"),
        }
    }

    #[test]
    fn transport_accepts_tcp_alias() {
        let cli = Cli::try_parse_from(["framebridge", "serve", "--transport", "tcp"])
            .expect("alias should parse");
        assert!(matches!(
            cli.command,
            Command::Serve(ref args) if args.transport == TransportArg::TcpLz4
        ));
    }

    #[test]
    fn parses_stream_subcommand_with_globals() {
        let cli = Cli::try_parse_from([
            "framebridge",
            "stream",
            "--frames",
            "5",
            "--fps",
            "10",
            "--log-format",
            "json",
            "--format",
            "pretty",
        ])
        .expect("stream args should parse");
        assert_eq!(cli.log_format, LogFormat::Json);
        assert_eq!(cli.format, Some(OutputFormat::Pretty));
        assert!(matches!(cli.command, Command::Stream(ref args) if args.frames == 5));
    }

    #[test]
    fn rejects_unknown_transport() {
        let err = Cli::try_parse_from(["framebridge", "serve", "--transport", "udp"])
            .expect_err("unknown transport should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidValue);
    }
}
