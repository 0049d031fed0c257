//! Tests for MapLoader
//!
//! Loading degrades instead of failing:
//! - unwritable file, foreign lock, locking fault → read-only map
//! - unparseable document → one-node map carrying the error text
//! Only a missing file and a cancelled load are errors.

use std::io::{self, BufRead};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output};
use std::sync::Arc;
use std::time::SystemTime;

use tempfile::TempDir;

use mindmap_core::application::services::{
    ConversionChoice, ConversionPrompt, LoadCancellation, LoadNotice, LockManager,
};
use mindmap_core::application::{ApplicationError, ApplicationResult};
use mindmap_core::config::{ConversionPolicy, Settings};
use mindmap_core::domain::{LockState, SessionIdentity, VersionClass};
use mindmap_core::infrastructure::di::ServiceContainer;
use mindmap_core::infrastructure::traits::{CommandRunner, FileSystem, RealFileSystem};
use mindmap_core::preferences::Preferences;
use mindmap_core::util::testing::init_test_setup;

const CURRENT_DOC: &str = r#"<map version="0.9.0">
  <node ID="ID_1" TEXT="Root">
    <node ID="ID_2" TEXT="first" POSITION="left"/>
    <node ID="ID_3" TEXT="second" FOLDED="true">
      <node ID="ID_4" TEXT="deep"/>
    </node>
  </node>
</map>
"#;

/// Every probed process is alive.
struct AllAlive;

impl CommandRunner for AllAlive {
    fn run(&self, _cmd: &str, _args: &[&str]) -> io::Result<Output> {
        Ok(Output {
            status: ExitStatus::from_raw(0),
            stdout: Vec::new(),
            stderr: Vec::new(),
        })
    }
}

/// Never answers; fails the test if asked.
struct NoPrompt;

impl ConversionPrompt for NoPrompt {
    fn ask(&self, file: &Path, _class: &VersionClass) -> ApplicationResult<Option<ConversionChoice>> {
        panic!("unexpected conversion prompt for {}", file.display());
    }
}

/// Real filesystem that reports every file as not writable.
struct ReadOnlyFs(RealFileSystem);

impl FileSystem for ReadOnlyFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        self.0.read_to_string(path)
    }
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.0.read(path)
    }
    fn read_prefix(&self, path: &Path, len: usize) -> io::Result<Vec<u8>> {
        self.0.read_prefix(path, len)
    }
    fn open_read(&self, path: &Path) -> io::Result<Box<dyn BufRead + Send>> {
        self.0.open_read(path)
    }
    fn write_atomic(&self, path: &Path, content: &[u8]) -> io::Result<()> {
        self.0.write_atomic(path, content)
    }
    fn create_new(&self, path: &Path, content: &str) -> io::Result<()> {
        self.0.create_new(path, content)
    }
    fn exists(&self, path: &Path) -> bool {
        self.0.exists(path)
    }
    fn is_file(&self, path: &Path) -> bool {
        self.0.is_file(path)
    }
    fn is_writable(&self, _path: &Path) -> bool {
        false
    }
    fn modified(&self, path: &Path) -> io::Result<SystemTime> {
        self.0.modified(path)
    }
    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        self.0.create_dir_all(path)
    }
    fn remove_file(&self, path: &Path) -> io::Result<()> {
        self.0.remove_file(path)
    }
    fn ensure_parent(&self, path: &Path) -> io::Result<()> {
        self.0.ensure_parent(path)
    }
}

fn test_settings(temp: &TempDir, policy: ConversionPolicy) -> Settings {
    Settings {
        convert_unknown_versions: policy,
        preferences_file: Some(temp.path().join("prefs/preferences.toml")),
        ..Settings::default()
    }
}

fn container_with(
    temp: &TempDir,
    user: &str,
    pid: u32,
    fs: Arc<dyn FileSystem>,
    policy: ConversionPolicy,
) -> ServiceContainer {
    let settings = test_settings(temp, policy);
    let preferences = Arc::new(Preferences::in_memory(fs.clone(), &settings));
    ServiceContainer::with_deps(
        settings,
        fs,
        Arc::new(AllAlive),
        preferences,
        SessionIdentity::new(user, "testhost", pid),
        Arc::new(NoPrompt),
    )
    .unwrap()
}

fn container(temp: &TempDir, user: &str, pid: u32) -> ServiceContainer {
    container_with(temp, user, pid, Arc::new(RealFileSystem), ConversionPolicy::Ask)
}

fn write_map(temp: &TempDir, content: &str) -> PathBuf {
    let file = temp.path().join("project.mm");
    std::fs::write(&file, content).unwrap();
    file
}

// ============================================================
// fatal outcomes
// ============================================================

#[test]
fn given_missing_file_when_loading_then_file_not_found() {
    init_test_setup();
    let temp = TempDir::new().unwrap();
    let services = container(&temp, "alice", 100);

    let err = services.loader.load(&temp.path().join("nope.mm")).unwrap_err();

    assert!(matches!(err, ApplicationError::FileNotFound(p) if p.ends_with("nope.mm")));
}

#[test]
fn given_cancelled_token_when_loading_then_cancelled_and_lock_retained() {
    let temp = TempDir::new().unwrap();
    let file = write_map(&temp, CURRENT_DOC);
    let services = container(&temp, "alice", 100);
    let cancel = LoadCancellation::new();
    cancel.cancel();

    let err = services.loader.load_with(&file, &cancel).unwrap_err();

    assert!(matches!(err, ApplicationError::Cancelled(_)));
    assert!(LockManager::lock_path_for(&file).exists());
}

// ============================================================
// successful loads
// ============================================================

#[test]
fn given_writable_current_document_when_loading_then_writable_locked_map() {
    init_test_setup();
    let temp = TempDir::new().unwrap();
    let file = write_map(&temp, CURRENT_DOC);
    let services = container(&temp, "alice", 100);

    let outcome = services.loader.load(&file).unwrap();

    assert_eq!(outcome.version, VersionClass::Current);
    assert!(outcome.notices.is_empty());
    assert!(!outcome.is_degraded());
    let map = &outcome.map;
    assert!(!map.is_read_only());
    assert!(map.is_saved());
    assert_eq!(map.lock_state(), &LockState::Owned);
    assert_eq!(map.file(), Some(file.as_path()));
    assert_eq!(map.tree().node_count(), 4);
    let second = map.tree().find_by_id("ID_3").unwrap();
    assert!(map.tree().data(second).unwrap().folded);
}

#[test]
fn given_legacy_document_when_loading_then_parsed_without_prompt() {
    let temp = TempDir::new().unwrap();
    let file = write_map(
        &temp,
        r#"<map version="0.7.1"><node TEXT="old root"><node TEXT="kid"/></node></map>"#,
    );
    let services = container(&temp, "alice", 100);

    let outcome = services.loader.load(&file).unwrap();

    assert_eq!(outcome.version, VersionClass::KnownLegacy("0.7.1".into()));
    assert_eq!(outcome.map.title(), "project.mm");
    assert_eq!(outcome.map.tree().node_count(), 2);
}

#[test]
fn given_malformed_body_with_current_header_when_loading_then_single_error_node() {
    init_test_setup();
    let temp = TempDir::new().unwrap();
    let file = write_map(
        &temp,
        "<map version=\"0.9.0\"><node TEXT=\"Root\"><node TEXT=\"broken\"></map>",
    );
    let services = container(&temp, "alice", 100);

    let outcome = services.loader.load(&file).unwrap();

    assert!(outcome.is_degraded());
    assert!(matches!(outcome.notices.as_slice(), [LoadNotice::ParseFailed(msg)] if !msg.is_empty()));
    let tree = outcome.map.tree();
    assert_eq!(tree.node_count(), 1);
    let root_text = &tree.data(tree.root().unwrap()).unwrap().text;
    assert!(root_text.starts_with("Error while parsing file: "));
    assert!(root_text.len() > "Error while parsing file: ".len());
}

#[test]
fn given_malformed_document_when_editing_and_closing_then_refused_and_file_untouched() {
    init_test_setup();
    let temp = TempDir::new().unwrap();
    let original = "<map version=\"0.9.0\"><node TEXT=\"Root\"><node TEXT=\"broken\"></map>";
    let file = write_map(&temp, original);
    let services = container(&temp, "alice", 100);

    let outcome = services.loader.load(&file).unwrap();
    assert!(outcome.parse_failed());
    assert!(outcome.map.is_read_only());
    assert_eq!(outcome.map.lock_state(), &LockState::Owned);

    let mut controller = services.controller(outcome.map);
    let root = controller.map().require_root().unwrap();
    let added = controller.add_new_node_at(root, 0, "new", None);
    assert!(matches!(added, Err(ApplicationError::ReadOnlyMap(_))));
    assert!(matches!(controller.save(), Err(ApplicationError::ReadOnlyMap(_))));
    assert!(controller.close(false).unwrap());

    assert_eq!(std::fs::read_to_string(&file).unwrap(), original);
    assert!(!LockManager::lock_path_for(&file).exists());
}

#[test]
fn given_unknown_version_with_convert_policy_when_loading_then_converted() {
    let temp = TempDir::new().unwrap();
    let file = write_map(
        &temp,
        r#"<map version="0.8.0"><topic text="Root"><topic text="child" CREATED="17"/></topic></map>"#,
    );
    let services = container_with(
        &temp,
        "alice",
        100,
        Arc::new(RealFileSystem),
        ConversionPolicy::Convert,
    );

    let outcome = services.loader.load(&file).unwrap();

    assert_eq!(
        outcome.notices,
        vec![LoadNotice::Converted {
            from: Some("0.8.0".into())
        }]
    );
    assert!(!outcome.is_degraded());
    let tree = outcome.map.tree();
    let root = tree.root().unwrap();
    assert_eq!(tree.data(root).unwrap().text, "Root");
    assert_eq!(tree.data(tree.children(root)[0]).unwrap().text, "child");
    // the file itself is untouched until saved
    let on_disk = std::fs::read_to_string(&file).unwrap();
    assert!(on_disk.contains("version=\"0.8.0\""));
}

#[test]
fn given_unknown_version_with_as_is_policy_when_loading_then_parsed_unchanged() {
    let temp = TempDir::new().unwrap();
    let file = write_map(&temp, r#"<map version="1.0.1"><node TEXT="Root"/></map>"#);
    let services = container_with(
        &temp,
        "alice",
        100,
        Arc::new(RealFileSystem),
        ConversionPolicy::AsIs,
    );

    let outcome = services.loader.load(&file).unwrap();

    assert_eq!(
        outcome.version,
        VersionClass::Unknown {
            declared: Some("1.0.1".into())
        }
    );
    assert!(outcome.notices.is_empty());
    assert_eq!(outcome.map.tree().node_count(), 1);
}

// ============================================================
// degraded to read-only
// ============================================================

#[test]
fn given_unwritable_file_when_loading_then_read_only_without_lock() {
    let temp = TempDir::new().unwrap();
    let file = write_map(&temp, CURRENT_DOC);
    let services = container_with(
        &temp,
        "alice",
        100,
        Arc::new(ReadOnlyFs(RealFileSystem)),
        ConversionPolicy::Ask,
    );

    let outcome = services.loader.load(&file).unwrap();

    assert!(outcome.map.is_read_only());
    assert_eq!(outcome.notices, vec![LoadNotice::ReadOnlyFile]);
    assert_eq!(outcome.map.lock_state(), &LockState::Unlocked);
    assert!(!LockManager::lock_path_for(&file).exists());
}

#[test]
fn given_map_opened_by_other_session_when_loading_then_read_only_with_holder() {
    init_test_setup();
    let temp = TempDir::new().unwrap();
    let file = write_map(&temp, CURRENT_DOC);
    let first = container(&temp, "alice", 100);
    let second = container(&temp, "bob", 200);

    let opened = first.loader.load(&file).unwrap();
    let outcome = second.loader.load(&file).unwrap();

    assert!(!opened.map.is_read_only());
    assert!(outcome.map.is_read_only());
    assert_eq!(outcome.notices, vec![LoadNotice::LockedBy("alice".into())]);
    assert_eq!(outcome.map.lock_state(), &LockState::HeldBy("alice".into()));
    assert_eq!(outcome.map.tree().node_count(), 4);
}

#[test]
fn given_lock_path_blocked_by_directory_when_loading_then_locking_failed() {
    let temp = TempDir::new().unwrap();
    let file = write_map(&temp, CURRENT_DOC);
    std::fs::create_dir(LockManager::lock_path_for(&file)).unwrap();
    let services = container(&temp, "alice", 100);

    let outcome = services.loader.load(&file).unwrap();

    assert!(outcome.map.is_read_only());
    assert_eq!(outcome.map.lock_state(), &LockState::Failed);
    assert!(matches!(outcome.notices.as_slice(), [LoadNotice::LockingFailed(_)]));
    assert_eq!(outcome.map.tree().node_count(), 4);
}

#[test]
fn given_stale_lock_when_loading_then_informational_notice() {
    let temp = TempDir::new().unwrap();
    let file = write_map(&temp, CURRENT_DOC);
    // legacy record older than the stale threshold
    std::fs::write(LockManager::lock_path_for(&file), "carol").unwrap();
    let settings = Settings {
        lock_stale_after_secs: 0,
        ..test_settings(&temp, ConversionPolicy::Ask)
    };
    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
    let preferences = Arc::new(Preferences::in_memory(fs.clone(), &settings));
    let services = ServiceContainer::with_deps(
        settings,
        fs,
        Arc::new(AllAlive),
        preferences,
        SessionIdentity::new("alice", "testhost", 100),
        Arc::new(NoPrompt),
    )
    .unwrap();
    std::thread::sleep(std::time::Duration::from_millis(20));

    let outcome = services.loader.load(&file).unwrap();

    assert_eq!(outcome.stale_lock_user(), Some("carol"));
    assert!(!outcome.is_degraded());
    assert!(!outcome.map.is_read_only());
}
