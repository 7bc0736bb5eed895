use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use lloggs::LoggingArgs;
use tracing::error;

mod commands;

use commands::Paths;

#[derive(Parser, Debug)]
#[command(name = "barrow")]
#[command(about = "Journaled dump scheduler")]
struct Args {
    /// Directory holding one subdirectory per configuration
    #[arg(long, global = true, default_value = "/etc/barrow")]
    config_root: PathBuf,

    /// Directory for locks, databases, journals and dumps
    #[arg(long, global = true, default_value = "/var/lib/barrow")]
    var_dir: PathBuf,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Dump the disks of a configuration that are due
    Dump(commands::dump::DumpArgs),

    /// Reconcile the last dump run and archive its journal
    Clean(commands::clean::CleanArgs),

    /// Look for leftovers of an interrupted run
    Check(commands::check::CheckArgs),

    /// List recorded dumps
    History(commands::history::HistoryArgs),
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    let _guard = args.logging.setup(|v| match v {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    })?;

    let paths = Paths {
        config_root: args.config_root,
        var_dir: args.var_dir,
    };

    let result = match args.command {
        Command::Dump(args) => commands::dump::run(&paths, args),
        Command::Clean(args) => commands::clean::run(&paths, args),
        Command::Check(args) => commands::check::run(&paths, args),
        Command::History(args) => commands::history::run(&paths, args),
    };

    match result {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(err) => {
            error!(%err, "barrow failed");
            eprintln!("barrow: {err}");
            Ok(ExitCode::FAILURE)
        }
    }
}
