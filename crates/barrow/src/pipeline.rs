//! The dump pipeline.
//!
//! One dump runs a small graph of subprocesses:
//!
//! ```text
//! archiver --+--> index lister          (counts entries)
//!            |
//!            +--> filter --> ... --> working file
//! ```
//!
//! Each edge is served by a copy task on a scoped thread that reads its
//! source in 64 KiB chunks and writes every chunk to all of its sinks. The
//! stderr of every stage is split into lines and classified. Nothing is
//! cancelled early: all tasks are joined and all stages waited for before
//! the outcome is decided.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{Config, Disk};
use crate::journal::{Entry, JournalError, JournalHandle};
use crate::model::{ContentHash, DumpState};
use crate::oplog::OpLog;
use crate::strange::StrangeParser;

/// Size of one read from a pipe.
pub const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error("cannot create working file {path:?}: {source}")]
    CreateOutput {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot spawn {stage}: {source}")]
    Spawn {
        stage: String,
        #[source]
        source: io::Error,
    },

    #[error("{0} has an empty command")]
    EmptyCommand(String),
}

/// Receives the lines read by a copy task.
pub trait LineHandler: Sync {
    fn line(&self, source: &str, line: &str);
}

/// Counts lines, ignoring their content.
#[derive(Debug, Default)]
pub struct LineCounter(AtomicU64);

impl LineCounter {
    pub fn count(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl LineHandler for LineCounter {
    fn line(&self, _source: &str, _line: &str) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

type Sink<'env> = (String, Box<dyn Write + Send + 'env>);

/// Copies one source to any number of sinks.
pub struct CopyTask<'env> {
    name: String,
    source: Box<dyn Read + Send + 'env>,
    sinks: Vec<Sink<'env>>,
    lines: Option<&'env dyn LineHandler>,
    hash: bool,
}

/// What a copy task saw.
#[derive(Debug, Default)]
pub struct CopyStats {
    pub bytes: u64,
    pub digest: Option<blake3::Hash>,
    /// Sinks dropped after a write error.
    pub failed_sinks: Vec<String>,
    pub read_error: Option<io::Error>,
}

impl CopyStats {
    pub fn is_clean(&self) -> bool {
        self.failed_sinks.is_empty() && self.read_error.is_none()
    }
}

impl<'env> CopyTask<'env> {
    pub fn new(name: impl Into<String>, source: impl Read + Send + 'env) -> Self {
        Self {
            name: name.into(),
            source: Box::new(source),
            sinks: Vec::new(),
            lines: None,
            hash: false,
        }
    }

    pub fn sink(mut self, name: impl Into<String>, sink: impl Write + Send + 'env) -> Self {
        self.sinks.push((name.into(), Box::new(sink)));
        self
    }

    pub fn lines(mut self, handler: &'env dyn LineHandler) -> Self {
        self.lines = Some(handler);
        self
    }

    pub fn hashed(mut self) -> Self {
        self.hash = true;
        self
    }

    /// Copy until end of input, then close every sink.
    pub fn run(mut self) -> CopyStats {
        let mut stats = CopyStats::default();
        let mut hasher = self.hash.then(blake3::Hasher::new);
        let mut pending: Vec<u8> = Vec::new();
        let mut buf = vec![0u8; CHUNK_SIZE];

        loop {
            let n = match self.source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(task = %self.name, %err, "read failed");
                    stats.read_error = Some(err);
                    break;
                }
            };
            let chunk = &buf[..n];
            stats.bytes += n as u64;

            if let Some(hasher) = hasher.as_mut() {
                hasher.update(chunk);
            }

            let name = &self.name;
            self.sinks.retain_mut(|(sink_name, sink)| match sink.write_all(chunk) {
                Ok(()) => true,
                Err(err) => {
                    warn!(task = %name, sink = %sink_name, %err, "dropping sink after write error");
                    stats.failed_sinks.push(sink_name.clone());
                    false
                }
            });

            if let Some(handler) = self.lines {
                pending.extend_from_slice(chunk);
                emit_lines(handler, &self.name, &mut pending);
            }
        }

        if let Some(handler) = self.lines
            && !pending.is_empty()
        {
            handler.line(&self.name, trim_cr(&String::from_utf8_lossy(&pending)));
        }

        for (sink_name, mut sink) in self.sinks.drain(..) {
            if let Err(err) = sink.flush() {
                warn!(task = %self.name, sink = %sink_name, %err, "flush failed");
                stats.failed_sinks.push(sink_name);
            }
        }

        stats.digest = hasher.map(|h| h.finalize());
        debug!(task = %self.name, bytes = stats.bytes, "copy finished");
        stats
    }
}

fn trim_cr(line: &str) -> &str {
    line.strip_suffix('\r').unwrap_or(line)
}

/// Hand every complete line in `pending` to `handler`, keeping the tail.
fn emit_lines(handler: &dyn LineHandler, source: &str, pending: &mut Vec<u8>) {
    let mut start = 0;
    while let Some(pos) = pending[start..].iter().position(|b| *b == b'\n') {
        let line = String::from_utf8_lossy(&pending[start..start + pos]);
        handler.line(source, trim_cr(&line));
        start += pos + 1;
    }
    pending.drain(..start);
}

/// Result of one finished dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpOutcome {
    pub raw_bytes: u64,
    pub comp_bytes: u64,
    pub file_count: u64,
    pub hash: ContentHash,
    pub state: DumpState,
}

struct Stage {
    name: String,
    child: Child,
}

/// Runs dumps for one configuration.
pub struct Pipeline<'a> {
    config: &'a Config,
    journal: JournalHandle,
    log: OpLog,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a Config, journal: JournalHandle, log: OpLog) -> Self {
        Self {
            config,
            journal,
            log,
        }
    }

    /// Dump `disk` into the working file `dest`.
    ///
    /// `DUMP_START` is recorded before anything runs. A dump that could not
    /// be set up records `DUMP_ABORT` and returns the error; otherwise
    /// `DUMP_FINISHED` carries the outcome, whatever its state.
    pub fn run_dump(&self, disk: &Disk, dest: &Path) -> Result<DumpOutcome, PipelineError> {
        let fname = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.journal.record(Entry::DumpStart {
            disk: disk.name.clone(),
            fname,
        })?;

        match self.execute(disk, dest) {
            Ok(outcome) => {
                self.journal.record(Entry::DumpFinished {
                    disk: disk.name.clone(),
                    state: outcome.state,
                    raw: outcome.raw_bytes,
                    comp: outcome.comp_bytes,
                    nfiles: outcome.file_count,
                    hash: outcome.hash.clone(),
                })?;
                info!(
                    disk = %disk.name,
                    state = %outcome.state,
                    raw = outcome.raw_bytes,
                    comp = outcome.comp_bytes,
                    files = outcome.file_count,
                    "dump finished"
                );
                Ok(outcome)
            }
            Err(err) => {
                self.journal.record(Entry::DumpAbort {
                    disk: disk.name.clone(),
                    reason: err.to_string(),
                })?;
                Err(err)
            }
        }
    }

    fn spawn(&self, name: String, argv: &[String], stdin: Stdio) -> Result<Stage, PipelineError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| PipelineError::EmptyCommand(name.clone()))?;
        debug!(stage = %name, ?argv, "spawning");
        let child = Command::new(program)
            .args(args)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| PipelineError::Spawn {
                stage: name.clone(),
                source,
            })?;
        Ok(Stage { name, child })
    }

    fn spawn_all(&self, disk: &Disk) -> Result<Vec<Stage>, PipelineError> {
        let path = disk.path.to_string_lossy();
        let create: Vec<String> = self
            .config
            .archiver
            .create
            .iter()
            .map(|arg| arg.replace("{path}", &path))
            .collect();

        let mut commands = vec![
            (stage_name("create", &create), create, Stdio::null()),
            (
                stage_name("list", &self.config.archiver.list),
                self.config.archiver.list.clone(),
                Stdio::piped(),
            ),
        ];
        for filter in &self.config.filters {
            commands.push((
                stage_name("filter", &filter.command),
                filter.command.clone(),
                Stdio::piped(),
            ));
        }

        let mut stages = Vec::with_capacity(commands.len());
        for (name, argv, stdin) in commands {
            match self.spawn(name, &argv, stdin) {
                Ok(stage) => stages.push(stage),
                Err(err) => {
                    reap(&mut stages);
                    return Err(err);
                }
            }
        }
        Ok(stages)
    }

    fn execute(&self, disk: &Disk, dest: &Path) -> Result<DumpOutcome, PipelineError> {
        let output = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dest)
            .map_err(|source| PipelineError::CreateOutput {
                path: dest.to_path_buf(),
                source,
            })?;

        let mut stages = self.spawn_all(disk)?;
        let parser = StrangeParser::new(&self.config.rules, self.journal.clone(), self.log.clone());
        let index = LineCounter::default();

        let tasks = match build_tasks(&mut stages, &output, &parser, &index) {
            Some(tasks) => tasks,
            None => {
                reap(&mut stages);
                return Err(PipelineError::Spawn {
                    stage: "pipeline".into(),
                    source: io::Error::other("a stage is missing a standard stream"),
                });
            }
        };

        let results: Vec<(String, Role, Option<CopyStats>)> = thread::scope(|scope| {
            let handles: Vec<_> = tasks
                .into_iter()
                .map(|(role, task)| {
                    let name = task.name.clone();
                    (name, role, scope.spawn(move || task.run()))
                })
                .collect();
            handles
                .into_iter()
                .map(|(name, role, handle)| (name, role, handle.join().ok()))
                .collect()
        });

        let mut ok = true;
        let mut raw_bytes = 0;
        let mut comp_bytes = 0;
        let mut digest = None;
        for (name, role, stats) in results {
            let Some(stats) = stats else {
                self.log.error(format!("{}: copy task {name} panicked", disk.name));
                ok = false;
                continue;
            };
            if let Some(err) = &stats.read_error {
                self.log.error(format!("{}: reading {name} failed: {err}", disk.name));
                ok = false;
            }
            for sink in &stats.failed_sinks {
                self.log
                    .error(format!("{}: writing {name} to {sink} failed", disk.name));
                ok = false;
            }
            if role.raw {
                raw_bytes = stats.bytes;
            }
            if role.output {
                comp_bytes = stats.bytes;
                digest = stats.digest;
            }
        }

        for stage in &mut stages {
            match stage.child.wait() {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    self.log
                        .error(format!("{}: {} exited with {status}", disk.name, stage.name));
                    ok = false;
                }
                Err(err) => {
                    self.log
                        .error(format!("{}: waiting for {} failed: {err}", disk.name, stage.name));
                    ok = false;
                }
            }
        }

        if let Err(err) = output.sync_all() {
            self.log
                .error(format!("{}: cannot sync {dest:?}: {err}", disk.name));
            ok = false;
        }

        let digest = digest.unwrap_or_else(|| blake3::hash(b""));
        Ok(DumpOutcome {
            raw_bytes,
            comp_bytes,
            file_count: index.count(),
            hash: ContentHash::blake3(&digest),
            state: if ok { DumpState::Ok } else { DumpState::Failed },
        })
    }
}

/// Which of a task's byte counts feed the outcome.
#[derive(Debug, Clone, Copy, Default)]
struct Role {
    raw: bool,
    output: bool,
}

fn stage_name(role: &str, argv: &[String]) -> String {
    let program = argv
        .first()
        .map(|p| {
            Path::new(p)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| p.clone())
        })
        .unwrap_or_default();
    format!("{role}:{program}")
}

/// Wire copy tasks between the spawned stages.
///
/// `stages` is `[archiver, lister, filters...]`.
fn build_tasks<'env>(
    stages: &mut [Stage],
    output: &'env File,
    parser: &'env StrangeParser<'_>,
    index: &'env LineCounter,
) -> Option<Vec<(Role, CopyTask<'env>)>> {
    let mut tasks = Vec::new();

    for stage in stages.iter_mut() {
        let stderr = stage.child.stderr.take()?;
        tasks.push((
            Role::default(),
            CopyTask::new(stage.name.clone(), stderr).lines(parser),
        ));
    }

    let (archiver, rest) = stages.split_first_mut()?;
    let (lister, filters) = rest.split_first_mut()?;

    let lister_out = lister.child.stdout.take()?;
    tasks.push((
        Role::default(),
        CopyTask::new(format!("{} stdout", lister.name), lister_out).lines(index),
    ));
    let lister_in = lister.child.stdin.take()?;

    // The archiver feeds the lister and the first filter, or the file.
    let mut upstream = CopyTask::new(
        format!("{} stdout", archiver.name),
        archiver.child.stdout.take()?,
    )
    .sink(lister.name.clone(), lister_in);
    let mut role = Role {
        raw: true,
        output: false,
    };

    for filter in filters.iter_mut() {
        let stdin = filter.child.stdin.take()?;
        tasks.push((role, upstream.sink(filter.name.clone(), stdin)));
        upstream = CopyTask::new(
            format!("{} stdout", filter.name),
            filter.child.stdout.take()?,
        );
        role = Role::default();
    }

    role.output = true;
    tasks.push((role, upstream.sink("output", output).hashed()));
    Some(tasks)
}

/// Kill and wait for stages that will never be fed.
fn reap(stages: &mut Vec<Stage>) {
    for mut stage in stages.drain(..) {
        let _ = stage.child.kill();
        let _ = stage.child.wait();
    }
}
