//! Journal entries and their line encoding.
//!
//! Each entry is one line, `KIND:field:field:...`. Inside a field the
//! characters `\`, `:`, CR and LF are written as `\xHH` so a line never
//! contains a raw separator or line break.

use std::fmt;

use thiserror::Error;

use crate::hrs::Hrs;
use crate::model::{ContentHash, DumpState};
use crate::oplog::MessageLevel;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EntryError {
    #[error("empty journal line")]
    Empty,

    #[error("unknown entry kind {0:?}")]
    UnknownKind(String),

    #[error("{kind} takes {expected} fields, got {got}")]
    FieldCount {
        kind: EntryKind,
        expected: usize,
        got: usize,
    },

    #[error("{kind} field {field}: invalid value {value:?} ({reason})")]
    InvalidField {
        kind: EntryKind,
        field: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("bad escape sequence in {0:?}")]
    BadEscape(String),
}

/// Which program opened a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Dump,
    Clean,
    Check,
}

/// How the journal file is opened.
///
/// Only `Write` and `Append` sessions are ever recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Write,
    Append,
    Read,
}

/// An enum stored by name in a journal field.
pub trait FieldEnum: Sized + Copy {
    fn name(&self) -> &'static str;
    fn from_name(name: &str) -> Option<Self>;
}

impl FieldEnum for Tool {
    fn name(&self) -> &'static str {
        match self {
            Tool::Dump => "dump",
            Tool::Clean => "clean",
            Tool::Check => "check",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "dump" => Some(Tool::Dump),
            "clean" => Some(Tool::Clean),
            "check" => Some(Tool::Check),
            _ => None,
        }
    }
}

impl FieldEnum for OpenMode {
    fn name(&self) -> &'static str {
        match self {
            OpenMode::Write => "write",
            OpenMode::Append => "append",
            OpenMode::Read => "read",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "write" => Some(OpenMode::Write),
            "append" => Some(OpenMode::Append),
            _ => None,
        }
    }
}

impl FieldEnum for DumpState {
    fn name(&self) -> &'static str {
        self.as_str()
    }

    fn from_name(name: &str) -> Option<Self> {
        name.parse().ok()
    }
}

impl FieldEnum for MessageLevel {
    fn name(&self) -> &'static str {
        self.as_str()
    }

    fn from_name(name: &str) -> Option<Self> {
        MessageLevel::from_str(name)
    }
}

/// Entry kinds, with their on-disk names and positional field names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    SessionOpen,
    SessionClose,
    Start,
    Select,
    Schedule,
    DumpStart,
    DumpFinished,
    DumpAbort,
    Strange,
    Note,
    Warning,
    Error,
    UserMessage,
    CleanStart,
    CleanEnd,
    DumpFix,
}

impl EntryKind {
    pub const ALL: [EntryKind; 16] = [
        EntryKind::SessionOpen,
        EntryKind::SessionClose,
        EntryKind::Start,
        EntryKind::Select,
        EntryKind::Schedule,
        EntryKind::DumpStart,
        EntryKind::DumpFinished,
        EntryKind::DumpAbort,
        EntryKind::Strange,
        EntryKind::Note,
        EntryKind::Warning,
        EntryKind::Error,
        EntryKind::UserMessage,
        EntryKind::CleanStart,
        EntryKind::CleanEnd,
        EntryKind::DumpFix,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::SessionOpen => "SESSION_OPEN",
            EntryKind::SessionClose => "SESSION_CLOSE",
            EntryKind::Start => "START",
            EntryKind::Select => "SELECT",
            EntryKind::Schedule => "SCHEDULE",
            EntryKind::DumpStart => "DUMP_START",
            EntryKind::DumpFinished => "DUMP_FINISHED",
            EntryKind::DumpAbort => "DUMP_ABORT",
            EntryKind::Strange => "STRANGE",
            EntryKind::Note => "NOTE",
            EntryKind::Warning => "WARNING",
            EntryKind::Error => "ERROR",
            EntryKind::UserMessage => "USER_MESSAGE",
            EntryKind::CleanStart => "CLEAN_START",
            EntryKind::CleanEnd => "CLEAN_END",
            EntryKind::DumpFix => "DUMP_FIX",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    pub fn fields(&self) -> &'static [&'static str] {
        match self {
            EntryKind::SessionOpen => &["tool", "mode", "hrs"],
            EntryKind::SessionClose => &["hrs"],
            EntryKind::Start => &["config", "runid", "hrs"],
            EntryKind::Select => &["disks"],
            EntryKind::Schedule => &["disk", "baseline"],
            EntryKind::DumpStart => &["disk", "fname"],
            EntryKind::DumpFinished => &[
                "disk",
                "state",
                "raw",
                "comp",
                "nfiles",
                "hash_algorithm",
                "hash_digest",
            ],
            EntryKind::DumpAbort => &["disk", "reason"],
            EntryKind::Strange => &["source", "line"],
            EntryKind::Note | EntryKind::Warning | EntryKind::Error => &["message"],
            EntryKind::UserMessage => &["level", "message"],
            EntryKind::CleanStart | EntryKind::CleanEnd => &["hrs"],
            EntryKind::DumpFix => &["disk", "state"],
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One journal event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    SessionOpen {
        tool: Tool,
        mode: OpenMode,
        hrs: Hrs,
    },
    SessionClose {
        hrs: Hrs,
    },
    Start {
        config: String,
        runid: u64,
        hrs: Hrs,
    },
    Select {
        disks: Vec<String>,
    },
    Schedule {
        disk: String,
        baseline: u64,
    },
    DumpStart {
        disk: String,
        fname: String,
    },
    DumpFinished {
        disk: String,
        state: DumpState,
        raw: u64,
        comp: u64,
        nfiles: u64,
        hash: ContentHash,
    },
    DumpAbort {
        disk: String,
        reason: String,
    },
    Strange {
        source: String,
        line: String,
    },
    Note {
        message: String,
    },
    Warning {
        message: String,
    },
    Error {
        message: String,
    },
    UserMessage {
        level: MessageLevel,
        message: String,
    },
    CleanStart {
        hrs: Hrs,
    },
    CleanEnd {
        hrs: Hrs,
    },
    DumpFix {
        disk: String,
        state: DumpState,
    },
}

impl Entry {
    pub fn kind(&self) -> EntryKind {
        match self {
            Entry::SessionOpen { .. } => EntryKind::SessionOpen,
            Entry::SessionClose { .. } => EntryKind::SessionClose,
            Entry::Start { .. } => EntryKind::Start,
            Entry::Select { .. } => EntryKind::Select,
            Entry::Schedule { .. } => EntryKind::Schedule,
            Entry::DumpStart { .. } => EntryKind::DumpStart,
            Entry::DumpFinished { .. } => EntryKind::DumpFinished,
            Entry::DumpAbort { .. } => EntryKind::DumpAbort,
            Entry::Strange { .. } => EntryKind::Strange,
            Entry::Note { .. } => EntryKind::Note,
            Entry::Warning { .. } => EntryKind::Warning,
            Entry::Error { .. } => EntryKind::Error,
            Entry::UserMessage { .. } => EntryKind::UserMessage,
            Entry::CleanStart { .. } => EntryKind::CleanStart,
            Entry::CleanEnd { .. } => EntryKind::CleanEnd,
            Entry::DumpFix { .. } => EntryKind::DumpFix,
        }
    }

    /// Encode as a journal line, without the trailing newline.
    pub fn encode(&self) -> Result<String, EntryError> {
        let kind = self.kind();
        let invalid = |field, value: &str, reason| EntryError::InvalidField {
            kind,
            field,
            value: value.to_string(),
            reason,
        };

        let fields: Vec<String> = match self {
            Entry::SessionOpen { tool, mode, hrs } => {
                if *mode == OpenMode::Read {
                    return Err(invalid("mode", mode.name(), "read sessions are not recorded"));
                }
                vec![tool.name().into(), mode.name().into(), hrs.to_string()]
            }
            Entry::SessionClose { hrs } | Entry::CleanStart { hrs } | Entry::CleanEnd { hrs } => {
                vec![hrs.to_string()]
            }
            Entry::Start { config, runid, hrs } => {
                if *runid == 0 {
                    return Err(invalid("runid", "0", "must be positive"));
                }
                vec![config.clone(), runid.to_string(), hrs.to_string()]
            }
            Entry::Select { disks } => {
                if let Some(bad) = disks.iter().find(|d| d.is_empty() || d.contains(',')) {
                    return Err(invalid("disks", bad.as_str(), "disk names must be non-empty without commas"));
                }
                vec![disks.join(",")]
            }
            Entry::Schedule { disk, baseline } => vec![disk.clone(), baseline.to_string()],
            Entry::DumpStart { disk, fname } => vec![disk.clone(), fname.clone()],
            Entry::DumpFinished {
                disk,
                state,
                raw,
                comp,
                nfiles,
                hash,
            } => vec![
                disk.clone(),
                state.name().into(),
                raw.to_string(),
                comp.to_string(),
                nfiles.to_string(),
                hash.algorithm.clone(),
                hash.digest.clone(),
            ],
            Entry::DumpAbort { disk, reason } => vec![disk.clone(), reason.clone()],
            Entry::Strange { source, line } => vec![source.clone(), line.clone()],
            Entry::Note { message } | Entry::Warning { message } | Entry::Error { message } => {
                vec![message.clone()]
            }
            Entry::UserMessage { level, message } => vec![level.name().into(), message.clone()],
            Entry::DumpFix { disk, state } => vec![disk.clone(), state.name().into()],
        };

        let mut line = String::from(kind.as_str());
        for field in &fields {
            line.push(':');
            line.push_str(&escape(field));
        }
        Ok(line)
    }

    /// Decode one journal line; a trailing newline is tolerated.
    pub fn decode(line: &str) -> Result<Self, EntryError> {
        let line = line.trim_end_matches(['\n', '\r']);
        if line.is_empty() {
            return Err(EntryError::Empty);
        }

        let mut parts = line.split(':');
        let key = parts.next().unwrap_or_default();
        let kind =
            EntryKind::from_str(key).ok_or_else(|| EntryError::UnknownKind(key.to_string()))?;

        let raw: Vec<&str> = parts.collect();
        let names = kind.fields();
        if raw.len() != names.len() {
            return Err(EntryError::FieldCount {
                kind,
                expected: names.len(),
                got: raw.len(),
            });
        }

        let values = raw
            .iter()
            .map(|f| unescape(f))
            .collect::<Result<Vec<_>, _>>()?;
        let mut fields = Fields {
            kind,
            names,
            values: values.into_iter(),
            pos: 0,
        };

        let entry = match kind {
            EntryKind::SessionOpen => Entry::SessionOpen {
                tool: fields.enumerated()?,
                mode: fields.enumerated()?,
                hrs: fields.hrs()?,
            },
            EntryKind::SessionClose => Entry::SessionClose { hrs: fields.hrs()? },
            EntryKind::Start => Entry::Start {
                config: fields.string(),
                runid: fields.positive()?,
                hrs: fields.hrs()?,
            },
            EntryKind::Select => {
                let list = fields.string();
                let disks = if list.is_empty() {
                    Vec::new()
                } else {
                    list.split(',').map(str::to_string).collect()
                };
                Entry::Select { disks }
            }
            EntryKind::Schedule => Entry::Schedule {
                disk: fields.string(),
                baseline: fields.uint()?,
            },
            EntryKind::DumpStart => Entry::DumpStart {
                disk: fields.string(),
                fname: fields.string(),
            },
            EntryKind::DumpFinished => Entry::DumpFinished {
                disk: fields.string(),
                state: fields.enumerated()?,
                raw: fields.uint()?,
                comp: fields.uint()?,
                nfiles: fields.uint()?,
                hash: ContentHash {
                    algorithm: fields.string(),
                    digest: fields.string(),
                },
            },
            EntryKind::DumpAbort => Entry::DumpAbort {
                disk: fields.string(),
                reason: fields.string(),
            },
            EntryKind::Strange => Entry::Strange {
                source: fields.string(),
                line: fields.string(),
            },
            EntryKind::Note => Entry::Note {
                message: fields.string(),
            },
            EntryKind::Warning => Entry::Warning {
                message: fields.string(),
            },
            EntryKind::Error => Entry::Error {
                message: fields.string(),
            },
            EntryKind::UserMessage => Entry::UserMessage {
                level: fields.enumerated()?,
                message: fields.string(),
            },
            EntryKind::CleanStart => Entry::CleanStart { hrs: fields.hrs()? },
            EntryKind::CleanEnd => Entry::CleanEnd { hrs: fields.hrs()? },
            EntryKind::DumpFix => Entry::DumpFix {
                disk: fields.string(),
                state: fields.enumerated()?,
            },
        };
        Ok(entry)
    }
}

/// Typed reader over the unescaped fields of one line.
struct Fields {
    kind: EntryKind,
    names: &'static [&'static str],
    values: std::vec::IntoIter<String>,
    pos: usize,
}

impl Fields {
    fn next(&mut self) -> (&'static str, String) {
        let name = self.names.get(self.pos).copied().unwrap_or("?");
        self.pos += 1;
        (name, self.values.next().unwrap_or_default())
    }

    fn invalid(&self, field: &'static str, value: String, reason: &'static str) -> EntryError {
        EntryError::InvalidField {
            kind: self.kind,
            field,
            value,
            reason,
        }
    }

    fn string(&mut self) -> String {
        self.next().1
    }

    fn uint(&mut self) -> Result<u64, EntryError> {
        let (name, value) = self.next();
        value
            .parse()
            .map_err(|_| self.invalid(name, value, "expected an unsigned integer"))
    }

    fn positive(&mut self) -> Result<u64, EntryError> {
        let (name, value) = self.next();
        match value.parse::<u64>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(self.invalid(name, value, "expected a positive integer")),
        }
    }

    fn hrs(&mut self) -> Result<Hrs, EntryError> {
        let (name, value) = self.next();
        value
            .parse()
            .map_err(|_| self.invalid(name, value, "expected a YYYYMMDDHHMMSS timestamp"))
    }

    fn enumerated<T: FieldEnum>(&mut self) -> Result<T, EntryError> {
        let (name, value) = self.next();
        T::from_name(&value).ok_or_else(|| self.invalid(name, value, "unknown name"))
    }
}

/// Escape the field separator, backslash and line breaks.
pub fn escape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for c in field.chars() {
        match c {
            '\\' | ':' | '\n' | '\r' => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// Reverse [`escape`]. Any `\xHH` sequence is accepted.
pub fn unescape(field: &str) -> Result<String, EntryError> {
    if !field.contains('\\') {
        return Ok(field.to_string());
    }

    let bad = || EntryError::BadEscape(field.to_string());
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        if chars.next() != Some('x') {
            return Err(bad());
        }
        let hex: String = chars.by_ref().take(2).collect();
        if hex.len() != 2 {
            return Err(bad());
        }
        let code = u8::from_str_radix(&hex, 16).map_err(|_| bad())?;
        out.push(char::from(code));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hrs() -> Hrs {
        "20240305070809".parse().unwrap()
    }

    fn every_kind() -> Vec<Entry> {
        vec![
            Entry::SessionOpen {
                tool: Tool::Dump,
                mode: OpenMode::Write,
                hrs: hrs(),
            },
            Entry::SessionClose { hrs: hrs() },
            Entry::Start {
                config: "daily".into(),
                runid: 42,
                hrs: hrs(),
            },
            Entry::Select {
                disks: vec!["home".into(), "etc".into()],
            },
            Entry::Schedule {
                disk: "home".into(),
                baseline: 0,
            },
            Entry::DumpStart {
                disk: "home".into(),
                fname: "barrow.daily.home.20240305070809.tar.gz.part".into(),
            },
            Entry::DumpFinished {
                disk: "home".into(),
                state: DumpState::Ok,
                raw: 10240,
                comp: 311,
                nfiles: 7,
                hash: ContentHash {
                    algorithm: "blake3".into(),
                    digest: "af13".into(),
                },
            },
            Entry::DumpAbort {
                disk: "etc".into(),
                reason: "cannot spawn tar: No such file".into(),
            },
            Entry::Strange {
                source: "tar.stderr".into(),
                line: "tar: ./x: weird: thing\\here".into(),
            },
            Entry::Note {
                message: "Total bytes written: 10240".into(),
            },
            Entry::Warning {
                message: "file changed as we read it".into(),
            },
            Entry::Error {
                message: "multi\nline\r\nerror".into(),
            },
            Entry::UserMessage {
                level: MessageLevel::Info,
                message: "etc: skipped".into(),
            },
            Entry::CleanStart { hrs: hrs() },
            Entry::CleanEnd { hrs: hrs() },
            Entry::DumpFix {
                disk: "home".into(),
                state: DumpState::Broken,
            },
        ]
    }

    #[test]
    fn test_every_kind_round_trips() {
        let entries = every_kind();
        let kinds: Vec<EntryKind> = entries.iter().map(Entry::kind).collect();
        assert_eq!(kinds, EntryKind::ALL);

        for entry in entries {
            let line = entry.encode().unwrap();
            assert!(!line.contains('\n'), "{line}");
            assert_eq!(Entry::decode(&line).unwrap(), entry, "{line}");
        }
    }

    #[test]
    fn test_encoding_shape() {
        let line = Entry::Strange {
            source: "tar".into(),
            line: "a:b\\c".into(),
        }
        .encode()
        .unwrap();
        assert_eq!(line, "STRANGE:tar:a\\x3ab\\x5cc");

        let line = Entry::Select { disks: vec![] }.encode().unwrap();
        assert_eq!(line, "SELECT:");
        assert_eq!(
            Entry::decode(&line).unwrap(),
            Entry::Select { disks: vec![] }
        );
    }

    #[test]
    fn test_escaping_is_lossless() {
        for s in ["", "plain", ":", "\\", "\\x3a", "a\nb", "ünï:cødé\r\n", "::\\\\::"] {
            let escaped = escape(s);
            assert!(!escaped.contains(':'));
            assert!(!escaped.contains('\n'));
            assert_eq!(unescape(&escaped).unwrap(), s);
        }
    }

    #[test]
    fn test_decode_rejects() {
        assert_eq!(Entry::decode(""), Err(EntryError::Empty));
        assert!(matches!(
            Entry::decode("BOGUS:1"),
            Err(EntryError::UnknownKind(k)) if k == "BOGUS"
        ));
        assert!(matches!(
            Entry::decode("SCHEDULE:home"),
            Err(EntryError::FieldCount {
                expected: 2,
                got: 1,
                ..
            })
        ));
        assert!(matches!(
            Entry::decode("SCHEDULE:home:-1"),
            Err(EntryError::InvalidField {
                field: "baseline",
                ..
            })
        ));
        assert!(matches!(
            Entry::decode("START:daily:0:20240305070809"),
            Err(EntryError::InvalidField { field: "runid", .. })
        ));
        assert!(matches!(
            Entry::decode("CLEAN_END:2024"),
            Err(EntryError::InvalidField { field: "hrs", .. })
        ));
        assert!(matches!(
            Entry::decode("DUMP_FIX:home:done"),
            Err(EntryError::InvalidField { field: "state", .. })
        ));
        assert!(matches!(
            Entry::decode("SESSION_OPEN:dump:read:20240305070809"),
            Err(EntryError::InvalidField { field: "mode", .. })
        ));
        assert!(matches!(
            Entry::decode("NOTE:bad\\q"),
            Err(EntryError::BadEscape(_))
        ));
    }

    #[test]
    fn test_encode_validates() {
        let err = Entry::Start {
            config: "daily".into(),
            runid: 0,
            hrs: hrs(),
        }
        .encode();
        assert!(matches!(err, Err(EntryError::InvalidField { field: "runid", .. })));

        let err = Entry::Select {
            disks: vec!["a,b".into()],
        }
        .encode();
        assert!(matches!(err, Err(EntryError::InvalidField { field: "disks", .. })));
    }

    #[test]
    fn test_state_names_are_case_insensitive() {
        let entry = Entry::decode("DUMP_FIX:home:EMPTY").unwrap();
        assert_eq!(
            entry,
            Entry::DumpFix {
                disk: "home".into(),
                state: DumpState::Empty
            }
        );
    }
}
