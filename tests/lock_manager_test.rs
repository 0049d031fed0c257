//! Tests for LockManager
//!
//! Lock files live next to the map as `$~<name>~`. Liveness of a local
//! holder is probed with `kill -0`, mocked here.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output};
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use rstest::rstest;
use tempfile::TempDir;

use mindmap_core::application::services::{LockManager, LockStatus};
use mindmap_core::application::ApplicationError;
use mindmap_core::config::Settings;
use mindmap_core::domain::{LockRecord, SessionIdentity};
use mindmap_core::infrastructure::traits::{CommandRunner, RealFileSystem};
use mindmap_core::util::testing::init_test_setup;

const HOST: &str = "testhost";

/// Answers `kill -0 <pid>` from a list of live pids.
#[derive(Default)]
struct MockProbe {
    alive: Vec<u32>,
    calls: Mutex<Vec<String>>,
}

impl MockProbe {
    fn with_alive(alive: &[u32]) -> Self {
        Self {
            alive: alive.to_vec(),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl CommandRunner for MockProbe {
    fn run(&self, cmd: &str, args: &[&str]) -> io::Result<Output> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{} {}", cmd, args.join(" ")));
        let pid: u32 = args.last().and_then(|p| p.parse().ok()).unwrap_or(0);
        let (code, stderr) = if self.alive.contains(&pid) {
            (0, Vec::new())
        } else {
            (1 << 8, b"kill: No such process".to_vec())
        };
        Ok(Output {
            status: ExitStatus::from_raw(code),
            stdout: Vec::new(),
            stderr,
        })
    }
}

fn setup_map(temp: &TempDir) -> PathBuf {
    let file = temp.path().join("project.mm");
    std::fs::write(&file, "<map version=\"0.9.0\"><node TEXT=\"root\"/></map>\n").unwrap();
    file
}

fn manager(user: &str, pid: u32, probe: Arc<MockProbe>) -> LockManager {
    LockManager::new(
        Arc::new(RealFileSystem),
        probe,
        Arc::new(Settings::default()),
        SessionIdentity::new(user, HOST, pid),
    )
}

fn write_record(file: &Path, record: &LockRecord) {
    let content = toml::to_string(record).unwrap();
    std::fs::write(LockManager::lock_path_for(file), content).unwrap();
}

// ============================================================
// lock path
// ============================================================

#[test]
fn given_map_path_when_deriving_lock_path_then_same_dir_with_marker() {
    let lock = LockManager::lock_path_for(Path::new("/notes/project.mm"));
    assert_eq!(lock, PathBuf::from("/notes/$~project.mm~"));
}

// ============================================================
// try_to_lock()
// ============================================================

#[test]
fn given_no_lock_when_trying_to_lock_then_acquired() {
    init_test_setup();
    let temp = TempDir::new().unwrap();
    let file = setup_map(&temp);
    let locks = manager("alice", 100, Arc::new(MockProbe::default()));

    let holder = locks.try_to_lock(&file).unwrap();

    assert_eq!(holder, None);
    assert!(LockManager::lock_path_for(&file).exists());
    assert!(matches!(locks.status(&file).unwrap(), LockStatus::Owned(r) if r.user == "alice"));
}

#[test]
fn given_own_lock_when_trying_again_then_still_acquired() {
    let temp = TempDir::new().unwrap();
    let file = setup_map(&temp);
    let locks = manager("alice", 100, Arc::new(MockProbe::default()));
    locks.try_to_lock(&file).unwrap();

    assert_eq!(locks.try_to_lock(&file).unwrap(), None);
}

#[test]
fn given_live_lock_of_other_session_when_trying_to_lock_then_holder_returned() {
    let temp = TempDir::new().unwrap();
    let file = setup_map(&temp);
    let probe = Arc::new(MockProbe::with_alive(&[100]));
    let first = manager("alice", 100, probe.clone());
    let second = manager("bob", 200, probe);
    first.try_to_lock(&file).unwrap();

    let holder = second.try_to_lock(&file).unwrap();

    assert_eq!(holder.as_deref(), Some("alice"));
    assert_eq!(second.pop_locking_user_of_old_lock(), None);
}

#[test]
fn given_lock_of_dead_local_process_when_trying_to_lock_then_stale_holder_popped_once() {
    init_test_setup();
    let temp = TempDir::new().unwrap();
    let file = setup_map(&temp);
    let dead = SessionIdentity::new("alice", HOST, 4242);
    write_record(&file, &LockRecord::claim(&dead, Utc::now()));
    let probe = Arc::new(MockProbe::with_alive(&[]));
    let locks = manager("bob", 200, probe.clone());

    let holder = locks.try_to_lock(&file).unwrap();

    assert_eq!(holder, None);
    assert_eq!(locks.pop_locking_user_of_old_lock().as_deref(), Some("alice"));
    assert_eq!(locks.pop_locking_user_of_old_lock(), None);
    assert!(matches!(locks.status(&file).unwrap(), LockStatus::Owned(r) if r.user == "bob"));
    assert_eq!(*probe.calls.lock().unwrap(), vec!["kill -0 4242".to_string()]);
}

#[test]
fn given_old_lock_from_other_host_when_trying_to_lock_then_stale_by_age() {
    let temp = TempDir::new().unwrap();
    let file = setup_map(&temp);
    let remote = SessionIdentity::new("carol", "elsewhere", 1);
    write_record(
        &file,
        &LockRecord::claim(&remote, Utc::now() - Duration::try_hours(2).unwrap()),
    );
    let probe = Arc::new(MockProbe::default());
    let locks = manager("bob", 200, probe.clone());

    assert_eq!(locks.try_to_lock(&file).unwrap(), None);
    assert_eq!(locks.pop_locking_user_of_old_lock().as_deref(), Some("carol"));
    assert!(probe.calls.lock().unwrap().is_empty());
}

#[test]
fn given_fresh_lock_from_other_host_when_trying_to_lock_then_held() {
    let temp = TempDir::new().unwrap();
    let file = setup_map(&temp);
    let remote = SessionIdentity::new("carol", "elsewhere", 1);
    write_record(&file, &LockRecord::claim(&remote, Utc::now()));
    let locks = manager("bob", 200, Arc::new(MockProbe::default()));

    assert_eq!(locks.try_to_lock(&file).unwrap().as_deref(), Some("carol"));
}

#[test]
fn given_legacy_lock_with_user_name_only_when_trying_to_lock_then_held_by_that_user() {
    let temp = TempDir::new().unwrap();
    let file = setup_map(&temp);
    std::fs::write(LockManager::lock_path_for(&file), "dave\n").unwrap();
    let locks = manager("bob", 200, Arc::new(MockProbe::default()));

    assert_eq!(locks.try_to_lock(&file).unwrap().as_deref(), Some("dave"));
}

#[test]
fn given_garbled_lock_file_when_trying_to_lock_then_replaced_silently() {
    let temp = TempDir::new().unwrap();
    let file = setup_map(&temp);
    std::fs::write(LockManager::lock_path_for(&file), "user = \n[[[broken").unwrap();
    let locks = manager("bob", 200, Arc::new(MockProbe::default()));
    assert_eq!(locks.status(&file).unwrap(), LockStatus::Unreadable);

    assert_eq!(locks.try_to_lock(&file).unwrap(), None);
    assert_eq!(locks.pop_locking_user_of_old_lock(), None);
}

// ============================================================
// release() / refresh()
// ============================================================

#[test]
fn given_own_lock_when_releasing_then_lock_file_removed() {
    let temp = TempDir::new().unwrap();
    let file = setup_map(&temp);
    let locks = manager("alice", 100, Arc::new(MockProbe::default()));
    locks.try_to_lock(&file).unwrap();

    assert!(locks.release(&file).unwrap());
    assert!(!LockManager::lock_path_for(&file).exists());
    assert_eq!(locks.status(&file).unwrap(), LockStatus::Free);
}

#[test]
fn given_lock_of_other_session_when_releasing_then_lock_file_kept() {
    let temp = TempDir::new().unwrap();
    let file = setup_map(&temp);
    let probe = Arc::new(MockProbe::with_alive(&[100]));
    let owner = manager("alice", 100, probe.clone());
    let other = manager("bob", 200, probe);
    owner.try_to_lock(&file).unwrap();

    assert!(!other.release(&file).unwrap());
    assert!(LockManager::lock_path_for(&file).exists());
}

#[test]
fn given_no_lock_when_releasing_then_false() {
    let temp = TempDir::new().unwrap();
    let file = setup_map(&temp);
    let locks = manager("alice", 100, Arc::new(MockProbe::default()));

    assert!(!locks.release(&file).unwrap());
}

#[test]
fn given_lock_not_held_when_refreshing_then_error() {
    let temp = TempDir::new().unwrap();
    let file = setup_map(&temp);
    let locks = manager("alice", 100, Arc::new(MockProbe::default()));

    let err = locks.refresh(&file).unwrap_err();

    assert!(matches!(err, ApplicationError::LockNotHeld(_)));
}

#[test]
fn given_own_lock_when_refreshing_then_timestamp_advances() {
    let temp = TempDir::new().unwrap();
    let file = setup_map(&temp);
    let locks = manager("alice", 100, Arc::new(MockProbe::default()));
    locks.try_to_lock(&file).unwrap();
    let before = match locks.status(&file).unwrap() {
        LockStatus::Owned(r) => r.refreshed_at,
        other => panic!("unexpected status {:?}", other),
    };
    std::thread::sleep(std::time::Duration::from_millis(5));

    locks.refresh(&file).unwrap();

    match locks.status(&file).unwrap() {
        LockStatus::Owned(r) => assert!(r.refreshed_at > before),
        other => panic!("unexpected status {:?}", other),
    }
}

// ============================================================
// keep_alive()
// ============================================================

#[rstest]
#[case::fresh(0, false)]
#[case::under_half_stale_period(200, false)]
#[case::past_half_stale_period(400, true)]
fn given_own_lock_of_age_when_keeping_alive_then_refreshed_only_when_due(
    #[case] age_secs: i64,
    #[case] due: bool,
) {
    init_test_setup();
    let temp = TempDir::new().unwrap();
    let file = setup_map(&temp);
    let locks = manager("alice", 100, Arc::new(MockProbe::default()));
    let refreshed_at = Utc::now() - Duration::try_seconds(age_secs).unwrap();
    write_record(&file, &LockRecord::claim(locks.identity(), refreshed_at));

    assert_eq!(locks.keep_alive(&file).unwrap(), due);

    match locks.status(&file).unwrap() {
        LockStatus::Owned(r) => assert_eq!(r.refreshed_at > refreshed_at, due),
        other => panic!("unexpected status {:?}", other),
    }
}

#[test]
fn given_lock_of_other_session_when_keeping_alive_then_not_held() {
    let temp = TempDir::new().unwrap();
    let file = setup_map(&temp);
    let remote = SessionIdentity::new("carol", "elsewhere", 1);
    write_record(&file, &LockRecord::claim(&remote, Utc::now()));
    let locks = manager("alice", 100, Arc::new(MockProbe::default()));

    let err = locks.keep_alive(&file).unwrap_err();

    assert!(matches!(err, ApplicationError::LockNotHeld(_)));
}
