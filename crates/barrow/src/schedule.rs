//! Choosing which disks to dump and against which baseline.

use jiff::SignedDuration;
use thiserror::Error;
use tracing::debug;

use crate::config::{Config, Disk};
use crate::hrs::Hrs;
use crate::model::DumpState;
use crate::store::{DumpRecord, Store, StoreError};

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("unknown disk {0:?}")]
    UnknownDisk(String),

    #[error("last dump of {disk:?} is dated {}, after now: is the clock wrong?", .last.to_date())]
    ClockSkew { disk: String, last: Hrs },
}

/// A disk picked for this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledDump {
    pub disk: String,
    /// 0 for a full dump, else the run to dump incrementally against.
    pub baseline: u64,
}

/// A disk left out of this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedDisk {
    pub disk: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub scheduled: Vec<ScheduledDump>,
    pub skipped: Vec<SkippedDisk>,
}

/// Estimates the cost of a dump.
pub trait Estimator {
    /// Cost of dumping `disk` incrementally against `baseline`, or in full
    /// when `baseline` is `None`. `None` means no estimate can be made.
    fn estimate(&self, disk: &Disk, baseline: Option<&DumpRecord>) -> Option<u64>;
}

/// Only knows how to price a full dump.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullDumpEstimator;

impl Estimator for FullDumpEstimator {
    fn estimate(&self, _disk: &Disk, baseline: Option<&DumpRecord>) -> Option<u64> {
        match baseline {
            None => Some(0),
            Some(_) => None,
        }
    }
}

pub struct Scheduler<'a> {
    config: &'a Config,
    store: &'a Store,
    now: Hrs,
    estimator: Box<dyn Estimator + 'a>,
}

impl<'a> Scheduler<'a> {
    pub fn new(config: &'a Config, store: &'a Store, now: Hrs) -> Self {
        Self {
            config,
            store,
            now,
            estimator: Box::new(FullDumpEstimator),
        }
    }

    pub fn with_estimator(mut self, estimator: impl Estimator + 'a) -> Self {
        self.estimator = Box::new(estimator);
        self
    }

    /// Pick disks among `names`, or all configured disks when empty.
    ///
    /// Unknown names fail the whole selection, as does a last dump dated in
    /// the future.
    pub fn select(&self, names: &[String], force: bool) -> Result<Selection, ScheduleError> {
        let mut candidates: Vec<&Disk> = Vec::new();
        if names.is_empty() {
            candidates.extend(&self.config.disks);
        } else {
            for name in names {
                let disk = self
                    .config
                    .disk(name)
                    .ok_or_else(|| ScheduleError::UnknownDisk(name.clone()))?;
                if !candidates.iter().any(|d| d.name == disk.name) {
                    candidates.push(disk);
                }
            }
        }

        let mut selection = Selection::default();
        for disk in candidates {
            match self.skip_reason(disk, force)? {
                Some(reason) => {
                    debug!(disk = %disk.name, %reason, "skipped");
                    selection.skipped.push(SkippedDisk {
                        disk: disk.name.clone(),
                        reason,
                    });
                }
                None => {
                    let baseline = self.baseline(disk)?;
                    debug!(disk = %disk.name, baseline, "scheduled");
                    selection.scheduled.push(ScheduledDump {
                        disk: disk.name.clone(),
                        baseline,
                    });
                }
            }
        }
        Ok(selection)
    }

    fn skip_reason(&self, disk: &Disk, force: bool) -> Result<Option<String>, ScheduleError> {
        if force {
            return Ok(None);
        }
        let Some((dump, run)) = self.store.select_last_dump(&disk.name)? else {
            return Ok(None);
        };

        let elapsed = self.now.since(run.hrs);
        if elapsed.is_negative() {
            return Err(ScheduleError::ClockSkew {
                disk: disk.name.clone(),
                last: run.hrs,
            });
        }

        let (wait, what) = if dump.state == DumpState::Ok {
            (self.config.min_interval, "last dump")
        } else {
            (self.config.retry_delay, "last attempt")
        };
        if elapsed >= wait {
            return Ok(None);
        }

        Ok(Some(format!(
            "{what} ({}) was {} ago, next one due in {}",
            dump.state,
            human_duration(elapsed),
            human_duration(wait - elapsed)
        )))
    }

    /// Cheapest candidate by estimate; ties go to the most recent run.
    fn baseline(&self, disk: &Disk) -> Result<u64, ScheduleError> {
        let history = self.store.history(Some(&disk.name))?;
        let candidates = history
            .iter()
            .filter(|(dump, _)| dump.state == DumpState::Ok)
            .map(|(dump, _)| Some(dump))
            .chain(std::iter::once(None));

        let mut best: Option<(u64, u64)> = None;
        for candidate in candidates {
            let Some(cost) = self.estimator.estimate(disk, candidate) else {
                continue;
            };
            if best.is_none_or(|(best_cost, _)| cost < best_cost) {
                best = Some((cost, candidate.map_or(0, |d| d.runid)));
            }
        }
        Ok(best.map_or(0, |(_, runid)| runid))
    }
}

/// `3h05m` style rendering, rounded down to the minute.
pub fn human_duration(duration: SignedDuration) -> String {
    let secs = duration.as_secs().max(0);
    let (hours, minutes) = (secs / 3600, (secs % 3600) / 60);
    if hours > 0 {
        format!("{hours}h{minutes:02}m")
    } else {
        format!("{minutes}m")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Layout;
    use std::path::Path;

    fn config() -> Config {
        let json = r#"{
            "min_interval": "20h",
            "retry_delay": "1h",
            "disks": [
                {"name": "home", "path": "/home"},
                {"name": "etc", "path": "/etc"}
            ]
        }"#;
        Config::from_json("daily", json, Layout::new(Path::new("/tmp"), "daily")).unwrap()
    }

    fn hrs(s: &str) -> Hrs {
        s.parse().unwrap()
    }

    fn record(store: &Store, when: &str, disk: &str, state: DumpState) -> u64 {
        let runid = match store.record_run(hrs(when), "daily") {
            Ok(run) => run.runid,
            Err(StoreError::DuplicateRun(_)) => store
                .history(None)
                .unwrap()
                .into_iter()
                .find(|(_, run)| run.hrs == hrs(when))
                .unwrap()
                .1
                .runid,
            Err(err) => panic!("{err}"),
        };
        store
            .record_dump(&DumpRecord {
                disk: disk.into(),
                runid,
                baseline: 0,
                state,
                filename: format!("{disk}.{runid}"),
                raw_bytes: Some(10),
                comp_bytes: Some(5),
                file_count: Some(1),
                hash: None,
            })
            .unwrap();
        runid
    }

    fn names(selection: &Selection) -> Vec<&str> {
        selection.scheduled.iter().map(|s| s.disk.as_str()).collect()
    }

    #[test]
    fn test_first_run_selects_everything_in_order() {
        let config = config();
        let store = Store::open_in_memory().unwrap();
        let scheduler = Scheduler::new(&config, &store, hrs("20240305070000"));

        let selection = scheduler.select(&[], false).unwrap();
        assert_eq!(names(&selection), vec!["home", "etc"]);
        assert!(selection.scheduled.iter().all(|s| s.baseline == 0));
        assert!(selection.skipped.is_empty());
    }

    #[test]
    fn test_explicit_names() {
        let config = config();
        let store = Store::open_in_memory().unwrap();
        let scheduler = Scheduler::new(&config, &store, hrs("20240305070000"));

        let selection = scheduler
            .select(&["etc".into(), "etc".into()], false)
            .unwrap();
        assert_eq!(names(&selection), vec!["etc"]);

        assert!(matches!(
            scheduler.select(&["var".into()], false),
            Err(ScheduleError::UnknownDisk(d)) if d == "var"
        ));
    }

    #[test]
    fn test_min_interval_and_retry() {
        let config = config();
        let store = Store::open_in_memory().unwrap();
        record(&store, "20240305070000", "home", DumpState::Ok);
        record(&store, "20240305070000", "etc", DumpState::Failed);

        // Two hours later: home is too recent, etc is due for a retry.
        let scheduler = Scheduler::new(&config, &store, hrs("20240305090000"));
        let selection = scheduler.select(&[], false).unwrap();
        assert_eq!(names(&selection), vec!["etc"]);
        assert_eq!(selection.skipped.len(), 1);
        assert_eq!(selection.skipped[0].disk, "home");
        assert!(selection.skipped[0].reason.contains("18h00m"));

        // Thirty minutes later: etc must wait too.
        let scheduler = Scheduler::new(&config, &store, hrs("20240305073000"));
        let selection = scheduler.select(&[], false).unwrap();
        assert!(selection.scheduled.is_empty());

        // Force overrides both.
        let selection = scheduler.select(&[], true).unwrap();
        assert_eq!(names(&selection), vec!["home", "etc"]);

        // A day later everything is due.
        let scheduler = Scheduler::new(&config, &store, hrs("20240306070000"));
        assert_eq!(scheduler.select(&[], false).unwrap().scheduled.len(), 2);
    }

    #[test]
    fn test_clock_skew_fails_selection() {
        let config = config();
        let store = Store::open_in_memory().unwrap();
        record(&store, "20240310000000", "home", DumpState::Ok);

        let scheduler = Scheduler::new(&config, &store, hrs("20240305070000"));
        assert!(matches!(
            scheduler.select(&[], false),
            Err(ScheduleError::ClockSkew { .. })
        ));

        // Forcing does not look at the history.
        assert_eq!(scheduler.select(&[], true).unwrap().scheduled.len(), 2);
    }

    struct PreferIncremental;

    impl Estimator for PreferIncremental {
        fn estimate(&self, _disk: &Disk, baseline: Option<&DumpRecord>) -> Option<u64> {
            Some(if baseline.is_some() { 1 } else { 10 })
        }
    }

    #[test]
    fn test_estimator_picks_most_recent_ok_baseline() {
        let config = config();
        let store = Store::open_in_memory().unwrap();
        record(&store, "20240301000000", "home", DumpState::Ok);
        let second = record(&store, "20240302000000", "home", DumpState::Ok);
        record(&store, "20240303000000", "home", DumpState::Failed);

        let now = hrs("20240305000000");
        let scheduler = Scheduler::new(&config, &store, now).with_estimator(PreferIncremental);
        let selection = scheduler.select(&["home".into()], false).unwrap();
        assert_eq!(selection.scheduled[0].baseline, second);

        let scheduler = Scheduler::new(&config, &store, now);
        let selection = scheduler.select(&["home".into()], false).unwrap();
        assert_eq!(selection.scheduled[0].baseline, 0);
    }

    #[test]
    fn test_human_duration() {
        assert_eq!(human_duration(SignedDuration::from_secs(59)), "0m");
        assert_eq!(human_duration(SignedDuration::from_mins(65)), "1h05m");
        assert_eq!(human_duration(SignedDuration::from_secs(-5)), "0m");
    }
}
