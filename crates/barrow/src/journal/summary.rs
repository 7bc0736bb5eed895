//! Folding journal sessions into a run summary.

use crate::hrs::Hrs;
use crate::model::{ContentHash, DumpState};
use crate::oplog::MessageLevel;

use super::{Entry, Session, Tool};

/// What the journal says about one disk's dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpInfo {
    pub disk: String,
    pub state: DumpState,
    /// Working file name, known once the dump started.
    pub fname: Option<String>,
    pub baseline: Option<u64>,
    pub raw_bytes: Option<u64>,
    pub comp_bytes: Option<u64>,
    pub file_count: Option<u64>,
    pub hash: Option<ContentHash>,
    pub nfixes: u32,
    pub abort_reason: Option<String>,
}

impl DumpInfo {
    fn selected(disk: &str) -> Self {
        Self {
            disk: disk.to_string(),
            state: DumpState::Selected,
            fname: None,
            baseline: None,
            raw_bytes: None,
            comp_bytes: None,
            file_count: None,
            hash: None,
            nfixes: 0,
            abort_reason: None,
        }
    }
}

/// The state of the last run, as rebuilt from the journal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub config: Option<String>,
    pub runid: Option<u64>,
    pub start_hrs: Option<Hrs>,
    /// Close time of the dump session; `None` if it was interrupted.
    pub end_hrs: Option<Hrs>,
    /// In selection order.
    pub dumps: Vec<DumpInfo>,
    pub notes: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    /// `(source, line)` pairs.
    pub strange_lines: Vec<(String, String)>,
    pub user_messages: Vec<(MessageLevel, String)>,
    /// Opening time of the last clean session folded in.
    pub last_clean: Option<Hrs>,
}

impl RunSummary {
    /// Fold the last dump session and every clean session after it.
    ///
    /// Clean sessions that were interrupted only contribute their fixes.
    pub fn fold(sessions: &[Session]) -> Self {
        let mut summary = Self::default();
        let Some(start) = sessions.iter().rposition(|s| s.tool == Tool::Dump) else {
            return summary;
        };

        let dump = &sessions[start];
        summary.end_hrs = dump.closed;
        for entry in &dump.entries {
            summary.apply(entry, true);
        }

        for session in &sessions[start + 1..] {
            if session.tool != Tool::Clean {
                continue;
            }
            summary.last_clean = Some(session.opened);
            let full = !session.is_interrupted();
            for entry in &session.entries {
                summary.apply(entry, full);
            }
        }

        summary
    }

    pub fn dump(&self, disk: &str) -> Option<&DumpInfo> {
        self.dumps.iter().find(|d| d.disk == disk)
    }

    fn dump_mut(&mut self, disk: &str) -> Option<&mut DumpInfo> {
        self.dumps.iter_mut().find(|d| d.disk == disk)
    }

    /// Dumps that never reached a finished state.
    pub fn unfinished(&self) -> usize {
        self.dumps.iter().filter(|d| d.state.is_phase()).count()
    }

    /// Move `disk` from `from` to `to`, or note the inconsistency.
    fn advance(&mut self, disk: &str, from: DumpState, to: DumpState) -> Option<&mut DumpInfo> {
        let Some(idx) = self.dumps.iter().position(|d| d.disk == disk) else {
            self.errors
                .push(format!("journal: {to} for unselected disk {disk:?}"));
            return None;
        };

        let current = self.dumps[idx].state;
        if current != from {
            self.errors
                .push(format!("journal: {disk:?} cannot go from {current} to {to}"));
            return None;
        }

        let info = &mut self.dumps[idx];
        info.state = to;
        Some(info)
    }

    fn apply(&mut self, entry: &Entry, with_messages: bool) {
        match entry {
            Entry::DumpFix { disk, state } => match self.dump_mut(disk) {
                Some(info) => match info.state.fix(*state) {
                    Ok(fixed) => {
                        info.state = fixed;
                        info.nfixes += 1;
                    }
                    Err(err) => self.errors.push(format!("journal: {disk}: {err}")),
                },
                None => self
                    .errors
                    .push(format!("journal: fix for unknown disk {disk:?}")),
            },
            _ if !with_messages => {}

            Entry::Start { config, runid, hrs } => {
                self.config = Some(config.clone());
                self.runid = Some(*runid);
                self.start_hrs = Some(*hrs);
            }
            Entry::Select { disks } => {
                for disk in disks {
                    if self.dump(disk).is_none() {
                        self.dumps.push(DumpInfo::selected(disk));
                    }
                }
            }
            Entry::Schedule { disk, baseline } => {
                if let Some(info) = self.advance(disk, DumpState::Selected, DumpState::Scheduled) {
                    info.baseline = Some(*baseline);
                }
            }
            Entry::DumpStart { disk, fname } => {
                if let Some(info) = self.advance(disk, DumpState::Scheduled, DumpState::Started) {
                    info.fname = Some(fname.clone());
                }
            }
            Entry::DumpFinished {
                disk,
                state,
                raw,
                comp,
                nfiles,
                hash,
            } => {
                if !state.is_finished() {
                    self.errors
                        .push(format!("journal: {disk:?} finished as {state}"));
                } else if let Some(info) = self.advance(disk, DumpState::Started, *state) {
                    info.raw_bytes = Some(*raw);
                    info.comp_bytes = Some(*comp);
                    info.file_count = Some(*nfiles);
                    info.hash = Some(hash.clone());
                }
            }
            Entry::DumpAbort { disk, reason } => match self.dump_mut(disk) {
                Some(info) => info.abort_reason = Some(reason.clone()),
                None => self
                    .errors
                    .push(format!("journal: abort for unknown disk {disk:?}")),
            },
            Entry::Strange { source, line } => {
                self.strange_lines.push((source.clone(), line.clone()));
            }
            Entry::Note { message } => self.notes.push(message.clone()),
            Entry::Warning { message } => self.warnings.push(message.clone()),
            Entry::Error { message } => self.errors.push(message.clone()),
            Entry::UserMessage { level, message } => {
                self.user_messages.push((*level, message.clone()));
            }
            Entry::SessionOpen { .. }
            | Entry::SessionClose { .. }
            | Entry::CleanStart { .. }
            | Entry::CleanEnd { .. } => {}
        }
    }
}
