use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::exit::DaemonResult;

pub mod run;
pub mod status;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the link daemon (the default).
    Run(RunArgs),
    /// Query a running daemon and print link statistics.
    Status(StatusArgs),
}

pub fn dispatch(command: Command) -> DaemonResult<i32> {
    match command {
        Command::Run(args) => run::run(args),
        Command::Status(args) => status::run(args),
    }
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Path of the IPC socket (overrides the config file).
    #[arg(long, value_name = "PATH")]
    pub socket_path: Option<PathBuf>,

    /// Configuration file.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Run against a simulated firmware instead of SPI hardware.
    #[arg(long)]
    pub no_spi: bool,
}

#[derive(Args, Debug, Default)]
pub struct StatusArgs {
    /// Path of the daemon's IPC socket.
    #[arg(long, value_name = "PATH")]
    pub socket_path: Option<PathBuf>,

    /// Configuration file (for the default socket path).
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}
