//! Integration tests for reconciliation after a dump run.

use std::fs;
use std::io;

use serde_json::json;
use tempfile::TempDir;

use barrow::journal::{Entry, parse_sessions};
use barrow::{
    Config, DumpRecord, DumpRequest, DumpRun, DumpState, Hrs, Layout, MailTransport, OpLog,
    PostProcError, PostProcess, Store, run_dumps,
};

struct NoMail;

impl MailTransport for NoMail {
    fn send(&self, _to: &[String], _subject: &str, _body: &str) -> io::Result<()> {
        Ok(())
    }
}

const START: &str = "20240305070000";

struct Setup {
    _dir: TempDir,
    config: Config,
    store: Store,
}

fn setup(script: &str) -> Setup {
    setup_disks(script, &["home"])
}

fn setup_disks(script: &str, disks: &[&str]) -> Setup {
    let dir = TempDir::new().unwrap();
    let disks: Vec<_> = disks
        .iter()
        .map(|name| json!({"name": name, "path": dir.path()}))
        .collect();
    let json = json!({
        "archiver": {"create": ["sh", "-c", script], "list": ["cat"], "ext": ".txt"},
        "filters": [],
        "disks": disks,
    });
    let config = Config::from_json(
        "daily",
        &json.to_string(),
        Layout::new(&dir.path().join("var"), "daily"),
    )
    .unwrap();
    config.layout.create_dirs().unwrap();
    let store = Store::open(&config.layout.db_file).unwrap();
    Setup {
        _dir: dir,
        config,
        store,
    }
}

impl Setup {
    fn dump(&self) -> DumpRun {
        let request = DumpRequest {
            disks: Vec::new(),
            force: false,
            start: START.parse().unwrap(),
        };
        run_dumps(&self.config, &self.store, &OpLog::new(), &request).unwrap()
    }

    fn clean(&self) -> Result<Option<barrow::CleanOutcome>, PostProcError> {
        PostProcess::new(&self.config, &self.store, &OpLog::new(), &NoMail).run()
    }

    fn working(&self) -> std::path::PathBuf {
        self.working_of("home")
    }

    fn working_of(&self, disk: &str) -> std::path::PathBuf {
        let start: Hrs = START.parse().unwrap();
        self.config
            .layout
            .partial_dir
            .join(self.config.part_name(disk, start))
    }

    fn final_path(&self, runid: u64, state: DumpState) -> std::path::PathBuf {
        self.final_of("home", runid, state)
    }

    fn final_of(&self, disk: &str, runid: u64, state: DumpState) -> std::path::PathBuf {
        let start: Hrs = START.parse().unwrap();
        self.config
            .layout
            .dump_dir
            .join(self.config.final_name(disk, runid, 0, start, state))
    }
}

#[test]
fn test_first_dump_is_moved_then_noop() {
    let setup = setup("printf 'a\\nb\\n'");
    let run = setup.dump();
    assert_eq!(run.scheduled, 1);
    assert_eq!(run.failed, 0);
    assert!(setup.working().exists());

    let outcome = setup.clean().unwrap().unwrap();
    assert_eq!(outcome.runid, run.runid);
    assert_eq!(outcome.moved, vec!["home".to_string()]);
    assert_eq!(outcome.report.errmark, "---");

    let record = setup.store.select_dump(run.runid, "home").unwrap().unwrap();
    assert_eq!(record.state, DumpState::Ok);
    assert_eq!(record.file_count, Some(2));
    assert_eq!(
        fs::read(setup.final_path(run.runid, DumpState::Ok)).unwrap(),
        b"a\nb\n"
    );
    assert!(!setup.working().exists());
    assert!(outcome.archived.exists());
    assert!(!setup.config.layout.journal_file.exists());

    // Nothing left to do.
    assert!(setup.clean().unwrap().is_none());
    assert_eq!(setup.store.counts().unwrap(), (1, 1));
}

#[test]
fn test_failed_dump_is_kept_and_moved() {
    let setup = setup("printf 'partial'; exit 1");
    let run = setup.dump();
    assert_eq!(run.failed, 1);

    let outcome = setup.clean().unwrap().unwrap();
    assert_eq!(outcome.moved, vec!["home".to_string()]);
    assert!(outcome.report.errmark.starts_with('!'));

    let record = setup.store.select_dump(run.runid, "home").unwrap().unwrap();
    assert_eq!(record.state, DumpState::Failed);
    assert!(record.filename.contains(".failed."));
    assert_eq!(
        fs::read(setup.final_path(run.runid, DumpState::Failed)).unwrap(),
        b"partial"
    );
}

#[test]
fn test_zero_byte_dump_is_empty() {
    let setup = setup("true");
    let run = setup.dump();
    assert_eq!(fs::metadata(setup.working()).unwrap().len(), 0);

    let outcome = setup.clean().unwrap().unwrap();
    assert!(outcome.moved.is_empty());

    let record = setup.store.select_dump(run.runid, "home").unwrap().unwrap();
    assert_eq!(record.state, DumpState::Empty);
    assert!(!setup.working().exists());
    assert!(!setup.final_path(run.runid, DumpState::Empty).exists());
    assert_eq!(fs::read_dir(&setup.config.layout.dump_dir).unwrap().count(), 1);
}

#[test]
fn test_both_files_present_is_a_panic() {
    let setup = setup("printf 'fresh'");
    let run = setup.dump();
    let target = setup.final_path(run.runid, DumpState::Ok);
    fs::write(&target, b"older").unwrap();

    let err = setup.clean().unwrap_err();
    assert!(matches!(err, PostProcError::Panic { count: 1 }));

    assert_eq!(fs::read(setup.working()).unwrap(), b"fresh");
    assert_eq!(fs::read(&target).unwrap(), b"older");
    assert!(setup.config.layout.journal_file.exists());

    // Once the operator removes the stale file, cleaning resumes.
    fs::remove_file(&target).unwrap();
    let outcome = setup.clean().unwrap().unwrap();
    assert_eq!(outcome.moved, vec!["home".to_string()]);
    assert_eq!(fs::read(&target).unwrap(), b"fresh");
}

#[test]
fn test_panic_on_one_disk_still_moves_the_others() {
    let setup = setup_disks("printf 'fresh'", &["home", "etc"]);
    let run = setup.dump();
    assert_eq!(run.scheduled, 2);
    let home_target = setup.final_of("home", run.runid, DumpState::Ok);
    fs::write(&home_target, b"older").unwrap();

    let err = setup.clean().unwrap_err();
    assert!(matches!(err, PostProcError::Panic { count: 1 }));

    let etc = setup.store.select_dump(run.runid, "etc").unwrap().unwrap();
    assert_eq!(etc.state, DumpState::Ok);
    assert_eq!(
        fs::read(setup.final_of("etc", run.runid, DumpState::Ok)).unwrap(),
        b"fresh"
    );
    assert!(!setup.working_of("etc").exists());

    assert_eq!(fs::read(setup.working_of("home")).unwrap(), b"fresh");
    assert_eq!(fs::read(&home_target).unwrap(), b"older");
    assert!(setup.config.layout.journal_file.exists());
}

#[test]
fn test_recorded_dump_with_no_file_is_a_panic() {
    let setup = setup("printf 'fresh'");
    let run = setup.dump();
    let start: Hrs = START.parse().unwrap();

    // Recorded by an earlier pass, then both files went away.
    setup
        .store
        .record_dump(&DumpRecord {
            disk: "home".into(),
            runid: run.runid,
            baseline: 0,
            state: DumpState::Ok,
            filename: setup
                .config
                .final_name("home", run.runid, 0, start, DumpState::Ok),
            raw_bytes: Some(5),
            comp_bytes: Some(5),
            file_count: Some(1),
            hash: None,
        })
        .unwrap();
    fs::remove_file(setup.working()).unwrap();

    let err = setup.clean().unwrap_err();
    assert!(matches!(err, PostProcError::Panic { count: 1 }));
    assert!(!setup.final_path(run.runid, DumpState::Ok).exists());
    assert!(setup.config.layout.journal_file.exists());
}

#[test]
fn test_missing_working_file_is_empty() {
    let setup = setup("printf 'fresh'");
    let run = setup.dump();
    fs::remove_file(setup.working()).unwrap();

    let outcome = setup.clean().unwrap().unwrap();
    assert!(outcome.moved.is_empty());

    let record = setup.store.select_dump(run.runid, "home").unwrap().unwrap();
    assert_eq!(record.state, DumpState::Empty);
    assert_eq!(fs::read_dir(&setup.config.layout.dump_dir).unwrap().count(), 1);

    let sessions = parse_sessions(&fs::read_to_string(&outcome.archived).unwrap());
    assert!(sessions.iter().flat_map(|s| &s.entries).any(|e| matches!(
        e,
        Entry::Error { message } if message.contains("is missing")
    )));
}
