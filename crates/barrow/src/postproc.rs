//! Post-processing of a dump run.
//!
//! The reconciler replays the journal left by a dump run, checks each dump
//! against what is actually on disk, records the outcome in the store and
//! moves finished dumps from the partial directory to the dump directory.
//! Every step can be repeated: a record already in the store is not
//! re-checked, a file already moved is not moved again. Problems that need
//! a human are counted as panics; the journal is then kept for inspection.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::config::Config;
use crate::hrs::Hrs;
use crate::journal::{DumpInfo, Entry, Journal, JournalError, OpenMode, RunSummary, Tool};
use crate::mail::MailTransport;
use crate::model::{DumpState, StateError};
use crate::oplog::OpLog;
use crate::report::Report;
use crate::store::{DumpRecord, Store, StoreError};

#[derive(Debug, Error)]
pub enum PostProcError {
    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("{path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    Inconsistent(String),

    #[error("{count} problem(s) need manual attention, journal kept")]
    Panic { count: usize },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> PostProcError + '_ {
    move |source| PostProcError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Result of a successful post-processing.
#[derive(Debug, Clone)]
pub struct CleanOutcome {
    pub runid: u64,
    pub report: Report,
    /// Disks whose dump was moved during this pass.
    pub moved: Vec<String>,
    /// Where the journal was archived.
    pub archived: PathBuf,
}

/// The host name, if it can be read as UTF-8.
pub fn get_hostname() -> Option<String> {
    hostname::get().ok().and_then(|h| h.into_string().ok())
}

pub struct PostProcess<'a> {
    config: &'a Config,
    store: &'a Store,
    log: OpLog,
    mailer: &'a dyn MailTransport,
    host: Option<String>,
}

impl<'a> PostProcess<'a> {
    pub fn new(
        config: &'a Config,
        store: &'a Store,
        log: &OpLog,
        mailer: &'a dyn MailTransport,
    ) -> Self {
        Self {
            config,
            store,
            log: log.clone(),
            mailer,
            host: get_hostname(),
        }
    }

    pub fn with_host(mut self, host: Option<String>) -> Self {
        self.host = host;
        self
    }

    /// Reconcile, report, then archive the journal.
    ///
    /// Returns `Ok(None)` when there is no journal to process. Fails with
    /// [`PostProcError::Panic`] after reporting if any dump could not be
    /// reconciled.
    pub fn run(&self) -> Result<Option<CleanOutcome>, PostProcError> {
        let file = self.config.journal_file();
        if !file.exists() {
            debug!(path = ?file.path(), "no journal, nothing to clean");
            return Ok(None);
        }

        let journal = Journal::open(file.clone(), OpenMode::Append, Tool::Clean, &self.log)?;
        journal.record(Entry::CleanStart { hrs: Hrs::now() })?;

        let summary = RunSummary::fold(journal.history());
        if let Some(last) = summary.last_clean {
            info!(last = %last.to_date(), "resuming after a previous cleanup");
        }

        let mut panics = 0;
        let mut moved = Vec::new();
        match (summary.runid, summary.start_hrs) {
            (Some(runid), Some(start)) => {
                for info in &summary.dumps {
                    match self.reconcile_dump(&journal, runid, start, info) {
                        Ok(true) => moved.push(info.disk.clone()),
                        Ok(false) => {}
                        Err(err) => {
                            panics += 1;
                            self.log.error(format!("PANIC: {}: {err}", info.disk));
                        }
                    }
                }
            }
            _ => {
                panics += 1;
                self.log
                    .error("PANIC: journal has no START entry, nothing reconciled");
            }
        }

        journal.record(Entry::CleanEnd { hrs: Hrs::now() })?;
        journal.close()?;

        let journal = Journal::open(file, OpenMode::Read, Tool::Clean, &self.log)?;
        let summary = RunSummary::fold(journal.history());
        let report = Report::build(&summary, self.host.as_deref(), false);
        self.publish(&report);

        if panics > 0 {
            return Err(PostProcError::Panic { count: panics });
        }

        // Both are known: a missing START is a panic above.
        let (Some(runid), Some(start)) = (summary.runid, summary.start_hrs) else {
            return Err(PostProcError::Inconsistent(
                "journal lost its START entry".into(),
            ));
        };
        let archived = journal.roll(
            &self.config.layout.archive_dir,
            &format!("{runid:04}.{start}"),
        )?;
        info!(?archived, "journal archived");

        Ok(Some(CleanOutcome {
            runid,
            report,
            moved,
            archived,
        }))
    }

    fn publish(&self, report: &Report) {
        info!("{}", report.title);
        for line in report.body.lines() {
            info!("{line}");
        }

        if self.config.mailto.is_empty() {
            self.log.warning("mailto not set, no mail will be sent");
            return;
        }
        if let Err(err) = self
            .mailer
            .send(&self.config.mailto, &report.title, &report.body)
        {
            self.log.error(format!("could not mail the report: {err}"));
        }
    }

    /// Check, record and move one dump. Returns whether a file was moved.
    fn reconcile_dump(
        &self,
        journal: &Journal,
        runid: u64,
        start: Hrs,
        info: &DumpInfo,
    ) -> Result<bool, PostProcError> {
        let record = match self.store.select_dump(runid, &info.disk)? {
            Some(record) => {
                debug!(disk = %info.disk, state = %record.state, "already recorded");
                record
            }
            None => {
                let state = self.check(journal, info)?;
                let record = DumpRecord {
                    disk: info.disk.clone(),
                    runid,
                    baseline: info.baseline.unwrap_or(0),
                    state,
                    filename: self.config.final_name(
                        &info.disk,
                        runid,
                        info.baseline.unwrap_or(0),
                        start,
                        state,
                    ),
                    raw_bytes: info.raw_bytes,
                    comp_bytes: info.comp_bytes,
                    file_count: info.file_count,
                    hash: info.hash.clone(),
                };
                self.store.record_dump(&record)?;
                record
            }
        };

        self.move_dump(info, &record)
    }

    /// Compare the journal's view of a dump with its working file, and
    /// record a fix when they disagree.
    fn check(&self, journal: &Journal, info: &DumpInfo) -> Result<DumpState, PostProcError> {
        let disk = &info.disk;
        let state = info.state;
        let expected_loss = state.is_failure() || state.is_fixed();

        let target = match &info.fname {
            None => {
                self.log
                    .warning(format!("{disk}: dump never started ({state})"));
                DumpState::Empty
            }
            Some(fname) => {
                let working = self.config.layout.partial_dir.join(fname);
                match fs::metadata(&working) {
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {
                        if !expected_loss {
                            self.log
                                .error(format!("{disk}: working file {fname} is missing"));
                        }
                        DumpState::Empty
                    }
                    Err(err) => return Err(io_error(&working)(err)),
                    Ok(meta) if meta.len() == 0 => {
                        if !expected_loss {
                            self.log
                                .error(format!("{disk}: working file {fname} is empty"));
                        }
                        fs::remove_file(&working).map_err(io_error(&working))?;
                        DumpState::Empty
                    }
                    Ok(_) if state.is_phase() => {
                        let reason = info
                            .abort_reason
                            .as_deref()
                            .unwrap_or("the dump never finished");
                        self.log.error(format!("{disk}: aborted: {reason}"));
                        DumpState::Aborted
                    }
                    // Fixed by an interrupted cleanup before it finished.
                    Ok(_) if info.comp_bytes.is_none() => state,
                    Ok(meta) if Some(meta.len()) != info.comp_bytes => {
                        self.log.error(format!(
                            "{disk}: working file {fname} is {} bytes, {} were written",
                            meta.len(),
                            info.comp_bytes.unwrap_or(0)
                        ));
                        if expected_loss {
                            state
                        } else {
                            DumpState::Broken
                        }
                    }
                    Ok(_) => state,
                }
            }
        };

        if target == state {
            return Ok(state);
        }
        let fixed = state.fix(target)?;
        journal.record(Entry::DumpFix {
            disk: disk.clone(),
            state: fixed,
        })?;
        info!(disk = %disk, from = %state, to = %fixed, "dump state fixed");
        Ok(fixed)
    }

    /// Move the working file to its final name, unless that already
    /// happened.
    fn move_dump(&self, info: &DumpInfo, record: &DumpRecord) -> Result<bool, PostProcError> {
        let disk = &info.disk;
        if record.state == DumpState::Empty {
            debug!(disk = %disk, "empty dump, nothing to move");
            return Ok(false);
        }
        let Some(fname) = &info.fname else {
            return Err(PostProcError::Inconsistent(format!(
                "{} dump has no working file",
                record.state
            )));
        };

        let layout = &self.config.layout;
        let working = layout.partial_dir.join(fname);
        let target = layout.dump_dir.join(&record.filename);
        let working_exists = exists(&working)?;

        match fs::metadata(&target) {
            Ok(_) if !working_exists => {
                debug!(disk = %disk, ?target, "already moved");
                return Ok(false);
            }
            Ok(meta) if meta.len() == 0 => {
                // Left by a move that did not get past reserving the name.
                fs::remove_file(&target).map_err(io_error(&target))?;
            }
            Ok(_) => {
                return Err(PostProcError::Inconsistent(format!(
                    "both {working:?} and {target:?} exist"
                )));
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                if !working_exists {
                    return Err(PostProcError::Inconsistent(format!(
                        "neither {working:?} nor {target:?} exist"
                    )));
                }
            }
            Err(err) => return Err(io_error(&target)(err)),
        }

        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
            .map_err(io_error(&target))?;
        fs::rename(&working, &target).map_err(io_error(&working))?;
        info!(disk = %disk, ?target, "dump moved");
        Ok(true)
    }
}

fn exists(path: &Path) -> Result<bool, PostProcError> {
    match fs::symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(io_error(path)(err)),
    }
}
