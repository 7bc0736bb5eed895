//! Per-configuration settings and on-disk layout.
//!
//! A configuration named `daily` is read from
//! `<config_root>/daily/barrow.json` and keeps its state under
//! `<var_dir>/daily`, with locks shared in `<var_dir>/lock`.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use jiff::SignedDuration;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::hrs::Hrs;
use crate::journal::JournalFile;
use crate::model::DumpState;
use crate::strange::{RuleAction, RuleSet};

/// File name of a configuration inside its directory.
pub const CONFIG_FILE: &str = "barrow.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("strange rule {name:?} does not compile: {source}")]
    Rule {
        name: String,
        #[source]
        source: regex::Error,
    },

    #[error("{field}: invalid duration {value:?}: {source}")]
    Duration {
        field: &'static str,
        value: String,
        #[source]
        source: jiff::Error,
    },
}

/// Archiver argv templates; `{path}` is replaced by the disk's path.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArchiverConfig {
    pub create: Vec<String>,
    pub list: Vec<String>,
    pub ext: String,
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            create: argv(&[
                "tar",
                "--create",
                "--file",
                "-",
                "--totals",
                "--directory",
                "{path}",
                ".",
            ]),
            list: argv(&["tar", "--list", "--verbose", "--file", "-"]),
            ext: ".tar".into(),
        }
    }
}

/// One stdin to stdout filter stage, typically a compressor.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    pub command: Vec<String>,
    pub ext: String,
}

/// A stderr classification rule as written in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    pub name: String,
    pub pattern: String,
    pub action: RuleAction,
    /// Replacement template using `$name` capture references; the whole
    /// line when absent.
    #[serde(default)]
    pub message: Option<String>,
}

/// A disk (or any directory tree) to dump.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Disk {
    pub name: String,
    pub path: PathBuf,
    /// Free-form note on where the data comes from.
    #[serde(default)]
    pub orig: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    mailto: Vec<String>,
    #[serde(default = "default_min_interval")]
    min_interval: String,
    #[serde(default = "default_retry_delay")]
    retry_delay: String,
    #[serde(default)]
    lock_timeout: Option<String>,
    #[serde(default)]
    archiver: ArchiverConfig,
    #[serde(default = "default_filters")]
    filters: Vec<FilterConfig>,
    #[serde(default = "default_rules")]
    strange_rules: Vec<RuleConfig>,
    disks: Vec<Disk>,
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn default_min_interval() -> String {
    "20h".into()
}

fn default_retry_delay() -> String {
    "1h".into()
}

fn default_filters() -> Vec<FilterConfig> {
    vec![FilterConfig {
        command: argv(&["gzip", "-c"]),
        ext: ".gz".into(),
    }]
}

/// Rules for GNU tar's usual chatter.
pub fn default_rules() -> Vec<RuleConfig> {
    let rule = |name: &str, pattern: &str, action, message: Option<&str>| RuleConfig {
        name: name.into(),
        pattern: pattern.into(),
        action,
        message: message.map(Into::into),
    };
    vec![
        rule(
            "tar-totals",
            r"^Total bytes written: (?P<bytes>\d+)",
            RuleAction::Note,
            Some("archiver wrote $bytes bytes"),
        ),
        rule("tar-socket", r": socket ignored$", RuleAction::Discard, None),
        rule(
            "tar-changed",
            r"^tar: (?P<file>.*): file changed as we read it$",
            RuleAction::Warning,
            Some("$file changed during the dump"),
        ),
        rule(
            "tar-vanished",
            r"^tar: (?P<file>.*): File removed before we read it$",
            RuleAction::Warning,
            Some("$file vanished during the dump"),
        ),
    ]
}

/// Where one configuration keeps its locks, database, journal and dumps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub config_lock: PathBuf,
    pub journal_lock: PathBuf,
    pub db_dir: PathBuf,
    pub db_file: PathBuf,
    pub journal_dir: PathBuf,
    pub journal_file: PathBuf,
    pub archive_dir: PathBuf,
    pub dump_dir: PathBuf,
    pub partial_dir: PathBuf,
}

impl Layout {
    pub fn new(var_dir: &Path, name: &str) -> Self {
        let lock_dir = var_dir.join("lock");
        let base = var_dir.join(name);
        let journal_dir = base.join("journal");
        let dump_dir = base.join("dumps");
        Self {
            config_lock: lock_dir.join(format!("{name}.lock")),
            journal_lock: lock_dir.join(format!("{name}.journal.lock")),
            db_dir: base.join("db"),
            db_file: base.join("db").join(format!("{name}.db")),
            journal_file: journal_dir.join("journal.txt"),
            archive_dir: journal_dir.join("archive"),
            journal_dir,
            partial_dir: dump_dir.join("partial"),
            dump_dir,
        }
    }

    pub fn create_dirs(&self) -> std::io::Result<()> {
        for dir in [
            &self.db_dir,
            &self.journal_dir,
            &self.archive_dir,
            &self.dump_dir,
            &self.partial_dir,
        ] {
            fs::create_dir_all(dir)?;
        }
        if let Some(lock_dir) = self.config_lock.parent() {
            fs::create_dir_all(lock_dir)?;
        }
        Ok(())
    }
}

/// A loaded and validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub name: String,
    pub layout: Layout,
    pub mailto: Vec<String>,
    pub min_interval: SignedDuration,
    pub retry_delay: SignedDuration,
    pub lock_timeout: Option<Duration>,
    pub archiver: ArchiverConfig,
    pub filters: Vec<FilterConfig>,
    pub rules: RuleSet,
    pub disks: Vec<Disk>,
}

impl Config {
    /// Load `<config_root>/<name>/barrow.json`.
    pub fn load(config_root: &Path, var_dir: &Path, name: &str) -> Result<Self, ConfigError> {
        let path = config_root.join(name).join(CONFIG_FILE);
        debug!(?path, "reading configuration");
        let json = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let file: ConfigFile =
            serde_json::from_str(&json).map_err(|source| ConfigError::Json { path, source })?;
        Self::build(name, file, Layout::new(var_dir, name))
    }

    /// Build from JSON text.
    pub fn from_json(name: &str, json: &str, layout: Layout) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_json::from_str(json).map_err(|source| ConfigError::Json {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        Self::build(name, file, layout)
    }

    fn build(name: &str, file: ConfigFile, layout: Layout) -> Result<Self, ConfigError> {
        if name.is_empty() || name.contains(['/', ':', ',']) {
            return Err(ConfigError::Invalid(format!(
                "configuration name {name:?} must be non-empty without '/', ':' or ','"
            )));
        }

        let mut seen = HashSet::new();
        for disk in &file.disks {
            if disk.name.is_empty() || disk.name.contains([',', ':', '/']) {
                return Err(ConfigError::Invalid(format!(
                    "disk name {:?} must be non-empty without ',', ':' or '/'",
                    disk.name
                )));
            }
            if !seen.insert(disk.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "disk {:?} is listed twice",
                    disk.name
                )));
            }
        }

        if file.archiver.create.is_empty() || file.archiver.list.is_empty() {
            return Err(ConfigError::Invalid(
                "archiver commands must not be empty".into(),
            ));
        }
        if file.filters.iter().any(|f| f.command.is_empty()) {
            return Err(ConfigError::Invalid("filter commands must not be empty".into()));
        }

        let lock_timeout = file
            .lock_timeout
            .as_deref()
            .map(|value| parse_duration("lock_timeout", value))
            .transpose()?
            .map(|d| d.unsigned_abs());

        Ok(Self {
            name: name.to_string(),
            layout,
            mailto: file.mailto,
            min_interval: parse_duration("min_interval", &file.min_interval)?,
            retry_delay: parse_duration("retry_delay", &file.retry_delay)?,
            lock_timeout,
            archiver: file.archiver,
            filters: file.filters,
            rules: RuleSet::compile(&file.strange_rules)?,
            disks: file.disks,
        })
    }

    pub fn disk(&self, name: &str) -> Option<&Disk> {
        self.disks.iter().find(|d| d.name == name)
    }

    pub fn journal_file(&self) -> JournalFile {
        JournalFile::new(
            self.layout.journal_file.clone(),
            self.layout.journal_lock.clone(),
            self.lock_timeout,
        )
    }

    /// Extension of a finished dump: archiver then every filter.
    pub fn dump_ext(&self) -> String {
        let mut ext = self.archiver.ext.clone();
        for filter in &self.filters {
            ext.push_str(&filter.ext);
        }
        ext
    }

    /// Working file name, inside the partial directory.
    pub fn part_name(&self, disk: &str, hrs: Hrs) -> String {
        format!("barrow.{}.{}.{}{}.part", self.name, disk, hrs, self.dump_ext())
    }

    /// Final file name, inside the dump directory.
    ///
    /// Level 0 is a full dump, level 1 is incremental against `baseline`.
    /// Anything but an `ok` dump carries its state in the name.
    pub fn final_name(
        &self,
        disk: &str,
        runid: u64,
        baseline: u64,
        hrs: Hrs,
        state: DumpState,
    ) -> String {
        let level = if baseline == 0 { 0 } else { 1 };
        let state = match state {
            DumpState::Ok => String::new(),
            other => format!(".{other}"),
        };
        format!(
            "barrow.{}.{}.{:03}.{}-{:03}.{}{}{}",
            self.name,
            disk,
            runid,
            level,
            baseline,
            hrs,
            state,
            self.dump_ext()
        )
    }
}

fn parse_duration(field: &'static str, value: &str) -> Result<SignedDuration, ConfigError> {
    let duration: SignedDuration = value.parse().map_err(|source| ConfigError::Duration {
        field,
        value: value.to_string(),
        source,
    })?;
    if duration.is_negative() {
        return Err(ConfigError::Invalid(format!("{field} must not be negative")));
    }
    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "mailto": ["root@localhost"],
        "min_interval": "12h",
        "lock_timeout": "30s",
        "disks": [
            {"name": "home", "path": "/home", "orig": "main disk"},
            {"name": "etc", "path": "/etc"}
        ]
    }"#;

    fn layout() -> Layout {
        Layout::new(Path::new("/var/lib/barrow"), "daily")
    }

    #[test]
    fn test_sample_with_defaults() {
        let config = Config::from_json("daily", SAMPLE, layout()).unwrap();
        assert_eq!(config.mailto, vec!["root@localhost".to_string()]);
        assert_eq!(config.min_interval, SignedDuration::from_hours(12));
        assert_eq!(config.retry_delay, SignedDuration::from_hours(1));
        assert_eq!(config.lock_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.archiver, ArchiverConfig::default());
        assert_eq!(config.dump_ext(), ".tar.gz");
        assert_eq!(config.rules.len(), default_rules().len());

        let names: Vec<&str> = config.disks.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["home", "etc"]);
        assert_eq!(config.disk("home").unwrap().orig, "main disk");
        assert!(config.disk("var").is_none());
    }

    #[test]
    fn test_layout() {
        let layout = layout();
        assert_eq!(
            layout.config_lock,
            PathBuf::from("/var/lib/barrow/lock/daily.lock")
        );
        assert_eq!(
            layout.journal_lock,
            PathBuf::from("/var/lib/barrow/lock/daily.journal.lock")
        );
        assert_eq!(layout.db_file, PathBuf::from("/var/lib/barrow/daily/db/daily.db"));
        assert_eq!(
            layout.journal_file,
            PathBuf::from("/var/lib/barrow/daily/journal/journal.txt")
        );
        assert_eq!(
            layout.partial_dir,
            PathBuf::from("/var/lib/barrow/daily/dumps/partial")
        );
    }

    #[test]
    fn test_dump_names() {
        let config = Config::from_json("daily", SAMPLE, layout()).unwrap();
        let hrs: Hrs = "20240305070809".parse().unwrap();
        assert_eq!(
            config.part_name("home", hrs),
            "barrow.daily.home.20240305070809.tar.gz.part"
        );
        assert_eq!(
            config.final_name("home", 7, 0, hrs, DumpState::Ok),
            "barrow.daily.home.007.0-000.20240305070809.tar.gz"
        );
        assert_eq!(
            config.final_name("home", 12, 9, hrs, DumpState::Failed),
            "barrow.daily.home.012.1-009.20240305070809.failed.tar.gz"
        );
    }

    #[test]
    fn test_no_filters() {
        let json = r#"{"filters": [], "disks": [{"name": "a", "path": "/a"}]}"#;
        let config = Config::from_json("daily", json, layout()).unwrap();
        assert_eq!(config.dump_ext(), ".tar");
    }

    #[test]
    fn test_rejects_bad_disks() {
        for json in [
            r#"{"disks": [{"name": "", "path": "/a"}]}"#,
            r#"{"disks": [{"name": "a,b", "path": "/a"}]}"#,
            r#"{"disks": [{"name": "a:b", "path": "/a"}]}"#,
            r#"{"disks": [{"name": "a", "path": "/a"}, {"name": "a", "path": "/b"}]}"#,
        ] {
            assert!(
                matches!(
                    Config::from_json("daily", json, layout()),
                    Err(ConfigError::Invalid(_))
                ),
                "{json}"
            );
        }
    }

    #[test]
    fn test_rejects_bad_values() {
        let json = r#"{"min_interval": "soon", "disks": []}"#;
        assert!(matches!(
            Config::from_json("daily", json, layout()),
            Err(ConfigError::Duration {
                field: "min_interval",
                ..
            })
        ));

        let json = r#"{"retry_delay": "-1h", "disks": []}"#;
        assert!(matches!(
            Config::from_json("daily", json, layout()),
            Err(ConfigError::Invalid(_))
        ));

        let json = r#"{"strange_rules": [{"name": "x", "pattern": "(", "action": "note"}], "disks": []}"#;
        assert!(matches!(
            Config::from_json("daily", json, layout()),
            Err(ConfigError::Rule { .. })
        ));

        let json = r#"{"disks": [], "colour": "blue"}"#;
        assert!(matches!(
            Config::from_json("daily", json, layout()),
            Err(ConfigError::Json { .. })
        ));
    }

    #[test]
    fn test_load_from_directory() {
        let root = tempfile::TempDir::new().unwrap();
        let var = tempfile::TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("daily")).unwrap();
        fs::write(root.path().join("daily").join(CONFIG_FILE), SAMPLE).unwrap();

        let config = Config::load(root.path(), var.path(), "daily").unwrap();
        assert_eq!(config.name, "daily");
        config.layout.create_dirs().unwrap();
        assert!(config.layout.partial_dir.is_dir());
        assert!(config.layout.archive_dir.is_dir());

        assert!(matches!(
            Config::load(root.path(), var.path(), "weekly"),
            Err(ConfigError::Io { .. })
        ));
    }
}
