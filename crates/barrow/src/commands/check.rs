//! Look for leftovers of an interrupted run

use std::collections::HashSet;

use clap::Args;
use tracing::{debug, warn};
use walkdir::WalkDir;

use barrow::{
    FileLock, Journal, OpLog, OpenMode, Report, RunSummary, Store, Tool, get_hostname,
};

use super::{CommandResult, Paths};

/// Look for leftovers of an interrupted run
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Configuration name
    config: String,
}

pub fn run(paths: &Paths, args: CheckArgs) -> CommandResult {
    let config = paths.load(&args.config)?;
    let _lock = FileLock::try_acquire(&config.layout.config_lock)?;
    let layout = &config.layout;
    let mut problems = 0;

    let mut expected = HashSet::new();
    let file = config.journal_file();
    if file.exists() {
        problems += 1;
        let journal = Journal::open(file, OpenMode::Read, Tool::Check, &OpLog::new())?;
        let summary = RunSummary::fold(journal.history());
        expected.extend(summary.dumps.iter().filter_map(|d| d.fname.clone()));

        let report = Report::build(&summary, get_hostname().as_deref(), true);
        eprintln!("Journal {:?} is waiting for `barrow clean`", journal.path());
        eprintln!("{}", report.title);
        for line in report.body.lines() {
            eprintln!("  {line}");
        }
    }

    if layout.partial_dir.is_dir() {
        for entry in WalkDir::new(&layout.partial_dir).min_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(%err, "cannot list the partial directory");
                    problems += 1;
                    continue;
                }
            };
            let name = entry.file_name().to_string_lossy();
            if expected.contains(&*name) {
                debug!(path = ?entry.path(), "working file of the pending run");
                continue;
            }
            problems += 1;
            eprintln!("Stray file: {:?}", entry.path());
        }
    }

    if layout.db_file.exists() {
        let store = Store::open(&layout.db_file)?;
        let (runs, dumps) = store.counts()?;
        eprintln!("Database {:?}: {runs} runs, {dumps} dumps", layout.db_file);
    } else {
        eprintln!("No database yet at {:?}", layout.db_file);
    }

    if problems > 0 {
        return Err(format!("{problems} problem(s) found for {:?}", config.name).into());
    }
    eprintln!("{:?} config seems clean", config.name);
    Ok(())
}
