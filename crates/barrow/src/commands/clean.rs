//! Reconcile the last dump run and archive its journal

use clap::Args;
use tracing::info;

use barrow::{CommandMailer, Config, FileLock, OpLog, PostProcess, Store};

use super::{CommandResult, Paths};

/// Reconcile the last dump run and archive its journal
#[derive(Args, Debug)]
pub struct CleanArgs {
    /// Configuration name
    config: String,
}

pub fn run(paths: &Paths, args: CleanArgs) -> CommandResult {
    let config = paths.load(&args.config)?;
    let _lock = FileLock::try_acquire(&config.layout.config_lock)?;
    config.layout.create_dirs()?;
    let store = Store::open(&config.layout.db_file)?;
    reconcile(&config, &store, &OpLog::new())
}

/// Run the reconciler and print what it did.
pub fn reconcile(config: &Config, store: &Store, log: &OpLog) -> CommandResult {
    let mailer = CommandMailer::default();
    let Some(outcome) = PostProcess::new(config, store, log, &mailer).run()? else {
        info!(config = %config.name, "nothing to clean");
        eprintln!("Nothing to clean for {:?}", config.name);
        return Ok(());
    };

    eprintln!("{}", outcome.report.title);
    eprintln!("  Run: {:04}", outcome.runid);
    if outcome.moved.is_empty() {
        eprintln!("  Moved: none");
    } else {
        eprintln!("  Moved: {}", outcome.moved.join(", "));
    }
    eprintln!("  Journal archived to {:?}", outcome.archived);
    Ok(())
}
