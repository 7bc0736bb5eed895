//! One dump run: schedule, then run a pipeline per selected disk.

use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, info};

use crate::config::Config;
use crate::hrs::Hrs;
use crate::journal::{Entry, Journal, JournalError, OpenMode, Tool};
use crate::model::DumpState;
use crate::oplog::{MessageLevel, OpLog};
use crate::pipeline::Pipeline;
use crate::schedule::{ScheduleError, Scheduler};
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum DumpRunError {
    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error("journal {0:?} is still there: run `barrow clean` first")]
    Unclean(PathBuf),
}

/// What to dump, and when the run is deemed to start.
#[derive(Debug, Clone)]
pub struct DumpRequest {
    /// Disks to consider; all configured disks when empty.
    pub disks: Vec<String>,
    pub force: bool,
    pub start: Hrs,
}

/// Tally of a dump run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpRun {
    pub runid: u64,
    pub scheduled: usize,
    pub skipped: usize,
    /// Dumps that did not end `ok`, including those that never started.
    pub failed: usize,
}

/// Record a new run and dump every disk the scheduler picks.
///
/// Each disk is dumped in turn into the partial directory; a failing disk
/// does not stop the others. The journal is closed but left in place for
/// the reconciler.
pub fn run_dumps(
    config: &Config,
    store: &Store,
    log: &OpLog,
    request: &DumpRequest,
) -> Result<DumpRun, DumpRunError> {
    let file = config.journal_file();
    if file.exists() {
        return Err(DumpRunError::Unclean(file.path().to_path_buf()));
    }

    let run = store.record_run(request.start, &config.name)?;
    info!(config = %config.name, runid = run.runid, start = %run.hrs, "starting dump run");

    let journal = Journal::open(file, OpenMode::Write, Tool::Dump, log)?;
    journal.record(Entry::Start {
        config: config.name.clone(),
        runid: run.runid,
        hrs: run.hrs,
    })?;

    let scheduler = Scheduler::new(config, store, request.start);
    let selection = match scheduler.select(&request.disks, request.force) {
        Ok(selection) => selection,
        Err(err) => {
            log.error(format!("scheduling failed: {err}"));
            journal.close()?;
            return Err(err.into());
        }
    };

    if !selection.scheduled.is_empty() {
        journal.record(Entry::Select {
            disks: selection.scheduled.iter().map(|s| s.disk.clone()).collect(),
        })?;
    }
    for scheduled in &selection.scheduled {
        journal.record(Entry::Schedule {
            disk: scheduled.disk.clone(),
            baseline: scheduled.baseline,
        })?;
    }
    for skipped in &selection.skipped {
        journal.record(Entry::UserMessage {
            level: MessageLevel::Info,
            message: format!("{}: {}", skipped.disk, skipped.reason),
        })?;
    }

    let mut tally = DumpRun {
        runid: run.runid,
        scheduled: selection.scheduled.len(),
        skipped: selection.skipped.len(),
        failed: 0,
    };
    if selection.scheduled.is_empty() {
        log.info("nothing to dump");
    }

    let pipeline = Pipeline::new(config, journal.handle(), log.clone());
    for scheduled in &selection.scheduled {
        let Some(disk) = config.disk(&scheduled.disk) else {
            log.error(format!("{}: disk vanished from the configuration", scheduled.disk));
            tally.failed += 1;
            continue;
        };

        let dest = config
            .layout
            .partial_dir
            .join(config.part_name(&disk.name, request.start));
        debug!(disk = %disk.name, ?dest, baseline = scheduled.baseline, "dumping");
        match pipeline.run_dump(disk, &dest) {
            Ok(outcome) if outcome.state == DumpState::Ok => {}
            Ok(_) => tally.failed += 1,
            Err(err) => {
                log.error(format!("{}: dump aborted: {err}", disk.name));
                tally.failed += 1;
            }
        }
    }

    journal.close()?;
    info!(
        runid = tally.runid,
        scheduled = tally.scheduled,
        skipped = tally.skipped,
        failed = tally.failed,
        "dump run finished"
    );
    Ok(tally)
}
