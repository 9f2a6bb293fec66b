use std::io;

use apflash::cli::{
    config::Config, list_ports, recover, replay, serial_monitor, ConnectArgs, RecoverArgs,
    ReplayArgs,
};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use log::{debug, LevelFilter};
use miette::Result;

#[derive(Debug, Parser)]
#[command(about, version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    subcommand: Commands,

    /// Verbosity of the log output
    #[arg(long, global = true, default_value = "info", value_name = "LEVEL")]
    log_level: LevelFilter,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the full recovery procedure against a connected device
    Recover(RecoverArgs),
    /// Drive the procedure from a captured transcript, without hardware
    Replay(ReplayArgs),
    /// Open the serial monitor without running the procedure
    Monitor(ConnectArgs),
    /// List candidate console serial ports
    ListPorts,
    /// Generate completions for the given shell
    Completions { shell: Shell },
}

fn main() -> Result<()> {
    miette::set_panic_hook();

    let args = Cli::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_target(false)
        .init();
    debug!("{:#?}", args);

    match args.subcommand {
        Commands::Recover(args) => {
            let config = Config::load()?;
            recover(args, &config)
        }
        Commands::Replay(args) => replay(args),
        Commands::Monitor(args) => {
            let config = Config::load()?;
            serial_monitor(args, &config)
        }
        Commands::ListPorts => list_ports(),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "apflash", &mut io::stdout());
            Ok(())
        }
    }
}
