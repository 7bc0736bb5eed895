//! Crash-recoverable run journal.
//!
//! The journal is a text file with one [`Entry`] per line, grouped into
//! sessions bracketed by `SESSION_OPEN` and `SESSION_CLOSE`. Every append
//! takes the journal lock, rewrites the whole file into a temporary sibling
//! and renames it into place, so a crash leaves either the old or the new
//! content. A session without its closing entry marks a process that died.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::hrs::Hrs;
use crate::lock::{FileLock, LockError};
use crate::oplog::{LogObserver, MessageLevel, ObserverId, OpLog};

pub mod entry;
pub mod summary;

pub use entry::{Entry, EntryError, EntryKind, FieldEnum, OpenMode, Tool};
pub use summary::{DumpInfo, RunSummary};

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Entry(#[from] EntryError),

    #[error("journal {0:?} already exists: a previous run did not clean up")]
    Exists(PathBuf),

    #[error("journal {0:?} not found")]
    NotFound(PathBuf),

    #[error("journal is open read-only")]
    ReadOnly,

    #[error("cannot roll journal: {0:?} exists and is not empty")]
    RollTargetExists(PathBuf),
}

/// The journal file and the lock guarding it.
#[derive(Debug, Clone)]
pub struct JournalFile {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Option<Duration>,
}

impl JournalFile {
    pub fn new(path: PathBuf, lock_path: PathBuf, lock_timeout: Option<Duration>) -> Self {
        Self {
            path,
            lock_path,
            lock_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn lock(&self) -> Result<FileLock, JournalError> {
        Ok(FileLock::acquire(&self.lock_path, self.lock_timeout)?)
    }

    /// Start a new journal with `first` as its only line.
    fn create(&self, first: &Entry) -> Result<(), JournalError> {
        let line = first.encode()?;
        let _lock = self.lock()?;
        if self.path.exists() {
            return Err(JournalError::Exists(self.path.clone()));
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&self.path, format!("{line}\n").as_bytes())?;
        Ok(())
    }

    /// Append one entry to an existing journal.
    pub fn append(&self, entry: &Entry) -> Result<(), JournalError> {
        let line = entry.encode()?;
        let _lock = self.lock()?;
        let mut content = match fs::read(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(JournalError::NotFound(self.path.clone()));
            }
            Err(err) => return Err(err.into()),
        };

        // A torn last line stays on its own line and is skipped on replay.
        if content.last().is_some_and(|b| *b != b'\n') {
            content.push(b'\n');
        }
        content.extend_from_slice(line.as_bytes());
        content.push(b'\n');

        write_atomic(&self.path, &content)?;
        debug!(kind = %entry.kind(), "journal entry recorded");
        Ok(())
    }

    /// Read and parse every session in the file.
    pub fn replay(&self) -> Result<Vec<Session>, JournalError> {
        let content = {
            let _lock = self.lock()?;
            match fs::read(&self.path) {
                Ok(content) => content,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    return Err(JournalError::NotFound(self.path.clone()));
                }
                Err(err) => return Err(err.into()),
            }
        };
        Ok(parse_sessions(&String::from_utf8_lossy(&content)))
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(data)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// A cloneable recorder for threads that outlive a borrow of the journal.
#[derive(Debug, Clone)]
pub struct JournalHandle(Arc<JournalFile>);

impl JournalHandle {
    pub fn record(&self, entry: Entry) -> Result<(), JournalError> {
        self.0.append(&entry)
    }
}

/// Entries between a `SESSION_OPEN` and its `SESSION_CLOSE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub tool: Tool,
    pub mode: OpenMode,
    pub opened: Hrs,
    /// `None` when the process died before closing the session.
    pub closed: Option<Hrs>,
    pub entries: Vec<Entry>,
}

impl Session {
    pub fn is_interrupted(&self) -> bool {
        self.closed.is_none()
    }
}

/// Split journal text into sessions.
///
/// Lines that fail to decode and entries found outside a session are
/// logged and skipped.
pub fn parse_sessions(content: &str) -> Vec<Session> {
    let mut sessions = Vec::new();
    let mut current: Option<Session> = None;

    for (idx, line) in content.lines().enumerate() {
        let lineno = idx + 1;
        if line.trim().is_empty() {
            continue;
        }

        let entry = match Entry::decode(line) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(lineno, %err, "skipping unreadable journal line");
                continue;
            }
        };

        match entry {
            Entry::SessionOpen { tool, mode, hrs } => {
                if let Some(open) = current.take() {
                    warn!(lineno, opened = %open.opened, "session opened while another was still open");
                    sessions.push(open);
                }
                current = Some(Session {
                    tool,
                    mode,
                    opened: hrs,
                    closed: None,
                    entries: Vec::new(),
                });
            }
            Entry::SessionClose { hrs } => match current.take() {
                Some(mut open) => {
                    open.closed = Some(hrs);
                    sessions.push(open);
                }
                None => warn!(lineno, "session close without an open session"),
            },
            entry => match current.as_mut() {
                Some(open) => open.entries.push(entry),
                None => warn!(lineno, kind = %entry.kind(), "skipping entry outside any session"),
            },
        }
    }

    if let Some(open) = current {
        sessions.push(open);
    }
    sessions
}

/// Mirrors operator warnings and errors into the journal.
struct JournalMirror {
    file: Weak<JournalFile>,
}

impl LogObserver for JournalMirror {
    fn notify(&self, level: MessageLevel, message: &str) {
        let entry = match level {
            MessageLevel::Info => return,
            MessageLevel::Warning => Entry::Warning {
                message: message.to_string(),
            },
            MessageLevel::Error => Entry::Error {
                message: message.to_string(),
            },
        };
        let Some(file) = self.file.upgrade() else {
            return;
        };
        if let Err(err) = file.append(&entry) {
            // Plain tracing here: going through the OpLog would loop back.
            error!(%err, "could not mirror message into the journal");
        }
    }
}

/// An open journal.
pub struct Journal {
    file: Arc<JournalFile>,
    mode: OpenMode,
    tool: Tool,
    log: OpLog,
    observer: Option<ObserverId>,
    history: Vec<Session>,
    closed: bool,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("path", &self.file.path)
            .field("mode", &self.mode)
            .field("tool", &self.tool)
            .finish()
    }
}

impl Journal {
    /// Open the journal.
    ///
    /// `Write` creates a new file and fails with [`JournalError::Exists`] if
    /// one is already there. `Append` replays the existing file and reports
    /// an interrupted last session. Both record a `SESSION_OPEN` and start
    /// mirroring operator warnings and errors. `Read` never writes.
    pub fn open(
        file: JournalFile,
        mode: OpenMode,
        tool: Tool,
        log: &OpLog,
    ) -> Result<Self, JournalError> {
        let file = Arc::new(file);
        let opening = Entry::SessionOpen {
            tool,
            mode,
            hrs: Hrs::now(),
        };

        let history = match mode {
            OpenMode::Write => {
                file.create(&opening)?;
                Vec::new()
            }
            OpenMode::Append | OpenMode::Read => {
                let history = file.replay()?;
                if mode == OpenMode::Append {
                    if let Some(last) = history.last()
                        && last.is_interrupted()
                    {
                        log.warning(format!(
                            "journal session opened at {} by {} was interrupted",
                            last.opened.to_date(),
                            last.tool.name()
                        ));
                    }
                    file.append(&opening)?;
                }
                history
            }
        };

        let observer = (mode != OpenMode::Read).then(|| {
            log.register(Arc::new(JournalMirror {
                file: Arc::downgrade(&file),
            }))
        });

        debug!(path = ?file.path, mode = mode.name(), "journal opened");
        Ok(Self {
            file,
            mode,
            tool,
            log: log.clone(),
            observer,
            history,
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Sessions that were in the file when it was opened.
    pub fn history(&self) -> &[Session] {
        &self.history
    }

    pub fn record(&self, entry: Entry) -> Result<(), JournalError> {
        if self.mode == OpenMode::Read || self.closed {
            return Err(JournalError::ReadOnly);
        }
        self.file.append(&entry)
    }

    /// A recorder that can be moved to other threads.
    pub fn handle(&self) -> JournalHandle {
        JournalHandle(Arc::clone(&self.file))
    }

    /// Parse the file as it is now, including this session.
    pub fn replay(&self) -> Result<Vec<Session>, JournalError> {
        self.file.replay()
    }

    /// Stop mirroring and record `SESSION_CLOSE`.
    pub fn close(mut self) -> Result<(), JournalError> {
        self.finish()
    }

    fn finish(&mut self) -> Result<(), JournalError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(id) = self.observer.take() {
            self.log.unregister(id);
        }
        if self.mode != OpenMode::Read {
            self.file.append(&Entry::SessionClose { hrs: Hrs::now() })?;
        }
        Ok(())
    }

    /// Close if needed, then move the file to `dir/journal.<suffix>.txt`.
    ///
    /// An existing non-empty destination is never overwritten.
    pub fn roll(mut self, dir: &Path, suffix: &str) -> Result<PathBuf, JournalError> {
        self.finish()?;

        let target = dir.join(format!("journal.{suffix}.txt"));
        let _lock = self.file.lock()?;
        match fs::metadata(&target) {
            Ok(meta) if meta.len() > 0 => {
                return Err(JournalError::RollTargetExists(target));
            }
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        fs::create_dir_all(dir)?;
        fs::rename(&self.file.path, &target)?;
        debug!(?target, "journal rolled");
        Ok(target)
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        if let Some(id) = self.observer.take() {
            self.log.unregister(id);
        }
    }
}
