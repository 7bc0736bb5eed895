//! Durable run and dump history.
//!
//! One row per run and one row per (run, disk) dump, in SQLite. Rows are
//! only ever inserted.

use std::path::Path;

use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use thiserror::Error;

use crate::hrs::Hrs;
use crate::model::{ContentHash, DumpState};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("a run started at {0} is already recorded")]
    DuplicateRun(Hrs),

    #[error("dump of {disk:?} for run {runid} is already recorded")]
    DuplicateDump { runid: u64, disk: String },
}

/// One invocation of the dump command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Run {
    pub runid: u64,
    pub hrs: Hrs,
    pub config: String,
}

/// One disk's dump within a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpRecord {
    pub disk: String,
    pub runid: u64,
    /// 0 for a full dump, else the run this one is incremental against.
    pub baseline: u64,
    pub state: DumpState,
    /// Relative to the final dump directory.
    pub filename: String,
    pub raw_bytes: Option<u64>,
    pub comp_bytes: Option<u64>,
    pub file_count: Option<u64>,
    pub hash: Option<ContentHash>,
}

/// Handle on the history database.
pub struct Store {
    conn: Connection,
}

const DUMP_COLUMNS: &str = "d.disk, d.runid, d.baseline, d.state, d.filename, d.raw_bytes, \
     d.comp_bytes, d.file_count, d.hash_algorithm, d.hash_digest, r.hrs, r.config";

impl Store {
    /// Open or create the database.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS runs (
                runid INTEGER PRIMARY KEY AUTOINCREMENT,
                hrs TEXT NOT NULL UNIQUE,
                config TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS dumps (
                dumpid INTEGER PRIMARY KEY AUTOINCREMENT,
                disk TEXT NOT NULL,
                runid INTEGER NOT NULL,
                baseline INTEGER NOT NULL DEFAULT 0,
                state TEXT NOT NULL,
                filename TEXT NOT NULL,
                raw_bytes INTEGER,
                comp_bytes INTEGER,
                file_count INTEGER,
                hash_algorithm TEXT,
                hash_digest TEXT,
                UNIQUE (runid, disk),
                FOREIGN KEY (runid) REFERENCES runs(runid)
            );

            CREATE INDEX IF NOT EXISTS idx_dumps_disk ON dumps(disk);
            "#,
        )?;
        Ok(())
    }

    /// Record the start of a run and return it with its new id.
    pub fn record_run(&self, hrs: Hrs, config: &str) -> Result<Run, StoreError> {
        match self.conn.execute(
            "INSERT INTO runs (hrs, config) VALUES (?1, ?2)",
            params![hrs.to_string(), config],
        ) {
            Ok(_) => {}
            Err(err) if is_constraint(&err) => return Err(StoreError::DuplicateRun(hrs)),
            Err(err) => return Err(err.into()),
        }

        Ok(Run {
            runid: self.conn.last_insert_rowid() as u64,
            hrs,
            config: config.to_string(),
        })
    }

    pub fn select_run(&self, runid: u64) -> Result<Option<Run>, StoreError> {
        let run = self
            .conn
            .query_row(
                "SELECT runid, hrs, config FROM runs WHERE runid = ?1",
                params![runid as i64],
                |row| {
                    Ok(Run {
                        runid: row.get::<_, i64>(0)? as u64,
                        hrs: hrs_column(row, 1)?,
                        config: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(run)
    }

    pub fn record_dump(&self, dump: &DumpRecord) -> Result<(), StoreError> {
        let result = self.conn.execute(
            "INSERT INTO dumps (disk, runid, baseline, state, filename, raw_bytes, comp_bytes, \
             file_count, hash_algorithm, hash_digest) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                dump.disk,
                dump.runid as i64,
                dump.baseline as i64,
                dump.state.as_str(),
                dump.filename,
                dump.raw_bytes.map(|n| n as i64),
                dump.comp_bytes.map(|n| n as i64),
                dump.file_count.map(|n| n as i64),
                dump.hash.as_ref().map(|h| h.algorithm.as_str()),
                dump.hash.as_ref().map(|h| h.digest.as_str()),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_constraint(&err) => Err(StoreError::DuplicateDump {
                runid: dump.runid,
                disk: dump.disk.clone(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    pub fn select_dump(&self, runid: u64, disk: &str) -> Result<Option<DumpRecord>, StoreError> {
        let dump = self
            .conn
            .query_row(
                &format!(
                    "SELECT {DUMP_COLUMNS} FROM dumps d JOIN runs r ON r.runid = d.runid \
                     WHERE d.runid = ?1 AND d.disk = ?2"
                ),
                params![runid as i64, disk],
                |row| dump_from_row(row).map(|(dump, _)| dump),
            )
            .optional()?;
        Ok(dump)
    }

    /// The most recent dump of `disk`, whatever its state.
    pub fn select_last_dump(&self, disk: &str) -> Result<Option<(DumpRecord, Run)>, StoreError> {
        let dump = self
            .conn
            .query_row(
                &format!(
                    "SELECT {DUMP_COLUMNS} FROM dumps d JOIN runs r ON r.runid = d.runid \
                     WHERE d.disk = ?1 ORDER BY d.runid DESC LIMIT 1"
                ),
                params![disk],
                dump_from_row,
            )
            .optional()?;
        Ok(dump)
    }

    /// Dumps, most recent first, optionally for a single disk.
    pub fn history(&self, disk: Option<&str>) -> Result<Vec<(DumpRecord, Run)>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {DUMP_COLUMNS} FROM dumps d JOIN runs r ON r.runid = d.runid \
             WHERE ?1 IS NULL OR d.disk = ?1 ORDER BY d.runid DESC, d.disk"
        ))?;
        let rows = stmt.query_map(params![disk], dump_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Number of recorded runs and dumps.
    pub fn counts(&self) -> Result<(u64, u64), StoreError> {
        let runs: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM runs", [], |row| row.get(0))?;
        let dumps: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM dumps", [], |row| row.get(0))?;
        Ok((runs as u64, dumps as u64))
    }
}

/// A UNIQUE constraint failed; foreign key violations are not included.
fn is_constraint(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::ConstraintViolation
                && e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn hrs_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Hrs> {
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|_| rusqlite::Error::InvalidColumnType(idx, "hrs".into(), Type::Text))
}

fn dump_from_row(row: &Row<'_>) -> rusqlite::Result<(DumpRecord, Run)> {
    let state: String = row.get(3)?;
    let state = state
        .parse()
        .map_err(|_| rusqlite::Error::InvalidColumnType(3, "state".into(), Type::Text))?;

    let algorithm: Option<String> = row.get(8)?;
    let digest: Option<String> = row.get(9)?;
    let hash = match (algorithm, digest) {
        (Some(algorithm), Some(digest)) => Some(ContentHash { algorithm, digest }),
        _ => None,
    };

    let runid = row.get::<_, i64>(1)? as u64;
    let dump = DumpRecord {
        disk: row.get(0)?,
        runid,
        baseline: row.get::<_, i64>(2)? as u64,
        state,
        filename: row.get(4)?,
        raw_bytes: row.get::<_, Option<i64>>(5)?.map(|n| n as u64),
        comp_bytes: row.get::<_, Option<i64>>(6)?.map(|n| n as u64),
        file_count: row.get::<_, Option<i64>>(7)?.map(|n| n as u64),
        hash,
    };
    let run = Run {
        runid,
        hrs: hrs_column(row, 10)?,
        config: row.get(11)?,
    };
    Ok((dump, run))
}
