use clap::Parser;

use sbclink::cmd::{self, Command, RunArgs};
use sbclink::logging::{init_logging, LogFormat, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "sbclink",
    version,
    about = "SPI link daemon for motion-control firmware"
)]
struct Cli {
    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Command>,

    /// Daemon flags when no subcommand is given.
    #[command(flatten)]
    run: RunArgs,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let result = match cli.command {
        Some(command) => cmd::dispatch(command),
        None => cmd::run::run(cli.run),
    };

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

    #[test]
    fn parses_daemon_flags_without_subcommand() {
        let cli = Cli::try_parse_from([
            "sbclink",
            "--socket-path",
            "/tmp/sbclink.sock",
            "--no-spi",
            "--log-level",
            "debug",
        ])
        .expect("daemon flags should parse");

        assert!(cli.command.is_none());
        assert!(cli.run.no_spi);
        assert_eq!(
            cli.run.socket_path.as_deref(),
            Some(std::path::Path::new("/tmp/sbclink.sock"))
        );
    }

    #[test]
    fn parses_status_subcommand() {
        let cli = Cli::try_parse_from(["sbclink", "status", "--socket-path", "/tmp/s.sock"])
            .expect("status args should parse");
        assert!(matches!(cli.command, Some(Command::Status(_))));
    }

    #[test]
    fn parses_run_subcommand() {
        let cli = Cli::try_parse_from(["sbclink", "run", "--no-spi"])
            .expect("run args should parse");
        match cli.command {
            Some(Command::Run(args)) => assert!(args.no_spi),
            other => panic!("expected run, got {other:?}"),
        }
    }
}
