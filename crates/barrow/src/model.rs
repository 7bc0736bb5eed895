//! Dump states and content hashes.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("unknown dump state: {0:?}")]
    Unknown(String),

    #[error("cannot fix a {from} dump into {to}")]
    InvalidFix { from: DumpState, to: DumpState },
}

/// Lifecycle of one dump.
///
/// A dump walks `Selected -> Scheduled -> Started` and finishes as one of
/// `Ok`, `Partial` or `Failed`. `Empty`, `Broken` and `Aborted` are only
/// ever reached by a fix during reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DumpState {
    Selected,
    Scheduled,
    Started,
    Ok,
    Partial,
    Failed,
    Empty,
    Broken,
    Aborted,
}

impl DumpState {
    pub const ALL: [DumpState; 9] = [
        DumpState::Selected,
        DumpState::Scheduled,
        DumpState::Started,
        DumpState::Ok,
        DumpState::Partial,
        DumpState::Failed,
        DumpState::Empty,
        DumpState::Broken,
        DumpState::Aborted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DumpState::Selected => "selected",
            DumpState::Scheduled => "scheduled",
            DumpState::Started => "started",
            DumpState::Ok => "ok",
            DumpState::Partial => "partial",
            DumpState::Failed => "failed",
            DumpState::Empty => "empty",
            DumpState::Broken => "broken",
            DumpState::Aborted => "aborted",
        }
    }

    /// The dump has not finished yet.
    pub fn is_phase(&self) -> bool {
        matches!(
            self,
            DumpState::Selected | DumpState::Scheduled | DumpState::Started
        )
    }

    /// Final state written by the pipeline.
    pub fn is_finished(&self) -> bool {
        matches!(self, DumpState::Ok | DumpState::Partial | DumpState::Failed)
    }

    /// The pipeline itself reported a problem.
    pub fn is_failure(&self) -> bool {
        matches!(self, DumpState::Partial | DumpState::Failed)
    }

    /// Only reachable through a fix.
    pub fn is_fixed(&self) -> bool {
        matches!(self, DumpState::Empty | DumpState::Broken | DumpState::Aborted)
    }

    /// Apply a fix, refusing anything that would go back to a phase state
    /// or move between two different fixed or finished states.
    pub fn fix(self, to: DumpState) -> Result<DumpState, StateError> {
        if to == self || (to.is_fixed() && !self.is_fixed()) {
            Ok(to)
        } else {
            Err(StateError::InvalidFix { from: self, to })
        }
    }
}

impl FromStr for DumpState {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == lower)
            .ok_or_else(|| StateError::Unknown(s.to_string()))
    }
}

impl fmt::Display for DumpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Digest of a dump's final byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentHash {
    pub algorithm: String,
    pub digest: String,
}

impl ContentHash {
    pub const BLAKE3: &'static str = "blake3";

    pub fn blake3(hash: &blake3::Hash) -> Self {
        Self {
            algorithm: Self::BLAKE3.to_string(),
            digest: hash.to_hex().to_string(),
        }
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.digest)
    }
}
