//! Barrow - journaled dump scheduler
//!
//! This library drives periodic dumps of directory trees through an
//! archiver and a chain of filters, journals every step so an interrupted
//! run can be reconciled later, and keeps the history of runs and dumps in
//! a SQLite database.

pub mod config;
pub mod dump;
pub mod hrs;
pub mod journal;
pub mod lock;
pub mod mail;
pub mod model;
pub mod oplog;
pub mod pipeline;
pub mod postproc;
pub mod report;
pub mod schedule;
pub mod store;
pub mod strange;

pub use config::{Config, ConfigError, Disk, Layout};
pub use dump::{DumpRequest, DumpRun, DumpRunError, run_dumps};
pub use hrs::Hrs;
pub use journal::{Journal, JournalError, JournalFile, OpenMode, RunSummary, Tool};
pub use lock::{FileLock, LockError};
pub use mail::{CommandMailer, MailTransport};
pub use model::{ContentHash, DumpState};
pub use oplog::{MessageLevel, OpLog};
pub use pipeline::{DumpOutcome, Pipeline, PipelineError};
pub use postproc::{CleanOutcome, PostProcError, PostProcess, get_hostname};
pub use report::{Report, human_size};
pub use schedule::{Estimator, FullDumpEstimator, ScheduleError, Scheduler, Selection};
pub use store::{DumpRecord, Run, Store, StoreError};
