//! Second-resolution wall clock timestamps.
//!
//! Runs, sessions and dump file names carry a 14 digit `YYYYMMDDHHMMSS`
//! stamp in local time. Operators see the same instant as
//! `YYYY/MM/DD HH:MM:SS`.

use std::fmt;
use std::str::FromStr;

use jiff::SignedDuration;
use jiff::civil::DateTime;
use thiserror::Error;

/// Human-facing date format, also accepted by `dump --date`.
pub const DATE_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum HrsError {
    #[error("timestamp must be 14 digits, got {0:?}")]
    Malformed(String),

    #[error("invalid timestamp {input:?}: {source}")]
    Invalid {
        input: String,
        #[source]
        source: jiff::Error,
    },
}

/// A `YYYYMMDDHHMMSS` timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hrs(DateTime);

impl Hrs {
    /// The current local time, truncated to the second.
    pub fn now() -> Self {
        Self::from_datetime(jiff::Zoned::now().datetime())
    }

    pub fn from_datetime(dt: DateTime) -> Self {
        Self(dt.with().subsec_nanosecond(0).build().unwrap_or(dt))
    }

    pub fn datetime(&self) -> DateTime {
        self.0
    }

    /// Parse an operator supplied `YYYY/MM/DD HH:MM:SS` date.
    pub fn parse_date(input: &str) -> Result<Self, HrsError> {
        DateTime::strptime(DATE_FORMAT, input.trim())
            .map(Self::from_datetime)
            .map_err(|source| HrsError::Invalid {
                input: input.to_string(),
                source,
            })
    }

    /// Render as `YYYY/MM/DD HH:MM:SS`.
    pub fn to_date(&self) -> String {
        self.0.strftime(DATE_FORMAT).to_string()
    }

    /// Time elapsed from `earlier` to `self`; negative when `earlier` is later.
    pub fn since(&self, earlier: Hrs) -> SignedDuration {
        self.0.duration_since(earlier.0)
    }
}

impl FromStr for Hrs {
    type Err = HrsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 14 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(HrsError::Malformed(s.to_string()));
        }

        // All ASCII digits, so the slices below are in range and parse.
        let num = |range: std::ops::Range<usize>| -> i16 {
            s[range].bytes().fold(0i16, |acc, b| acc * 10 + (b - b'0') as i16)
        };

        DateTime::new(
            num(0..4),
            num(4..6) as i8,
            num(6..8) as i8,
            num(8..10) as i8,
            num(10..12) as i8,
            num(12..14) as i8,
            0,
        )
        .map(Self)
        .map_err(|source| HrsError::Invalid {
            input: s.to_string(),
            source,
        })
    }
}

impl fmt::Display for Hrs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dt = &self.0;
        write!(
            f,
            "{:04}{:02}{:02}{:02}{:02}{:02}",
            dt.year(),
            dt.month(),
            dt.day(),
            dt.hour(),
            dt.minute(),
            dt.second()
        )
    }
}
