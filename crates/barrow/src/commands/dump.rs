//! Dump the disks of a configuration that are due

use clap::Args;
use tracing::error;

use barrow::{DumpRequest, DumpRunError, FileLock, Hrs, OpLog, Store, run_dumps};

use super::{CommandResult, Paths, clean};

/// Dump the disks of a configuration that are due
#[derive(Args, Debug)]
pub struct DumpArgs {
    /// Configuration name
    config: String,

    /// Disks to dump (default: every configured disk)
    disks: Vec<String>,

    /// Dump even if the disks are not due
    #[arg(long, short = 'f')]
    force: bool,

    /// Date the run as if it started at "YYYY/MM/DD HH:MM:SS"
    #[arg(long, value_parser = parse_date)]
    date: Option<Hrs>,

    /// Leave the journal for a later `barrow clean`
    #[arg(long)]
    no_clean: bool,
}

fn parse_date(s: &str) -> Result<Hrs, String> {
    Hrs::parse_date(s).map_err(|err| err.to_string())
}

pub fn run(paths: &Paths, args: DumpArgs) -> CommandResult {
    let config = paths.load(&args.config)?;
    let _lock = FileLock::try_acquire(&config.layout.config_lock)?;
    config.layout.create_dirs()?;
    let store = Store::open(&config.layout.db_file)?;
    let log = OpLog::new();

    let request = DumpRequest {
        disks: args.disks,
        force: args.force,
        start: args.date.unwrap_or_else(Hrs::now),
    };

    let failure = match run_dumps(&config, &store, &log, &request) {
        Ok(tally) => {
            eprintln!("Dump run {:04} for {:?}", tally.runid, config.name);
            eprintln!("  Scheduled: {}", tally.scheduled);
            eprintln!("  Skipped: {}", tally.skipped);
            if tally.failed > 0 {
                eprintln!("  Failed: {}", tally.failed);
            }
            None
        }
        Err(err @ DumpRunError::Unclean(_)) => return Err(err.into()),
        Err(err) => {
            error!(%err, "dump run failed");
            Some(err)
        }
    };

    if args.no_clean {
        eprintln!("Journal left for `barrow clean {}`", config.name);
    } else {
        clean::reconcile(&config, &store, &log)?;
    }

    match failure {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}
