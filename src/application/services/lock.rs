//! Advisory lock files guarding map files against concurrent editing
//!
//! ```text
//! notes/
//!   project.mm        <- map file
//!   $~project.mm~     <- lock record (TOML) while a session edits it
//! ```
//!
//! The lock is cooperative: any process that does not consult the lock file
//! can still write the map.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, instrument, warn};

use crate::application::{ApplicationError, ApplicationResult, IoResultExt};
use crate::config::Settings;
use crate::domain::{LockRecord, SessionIdentity};
use crate::infrastructure::traits::{CommandRunner, FileSystem};

const LOCK_PREFIX: &str = "$~";
const LOCK_SUFFIX: &str = "~";

/// What the lock file of a map currently says.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    Free,
    /// Held by this session
    Owned(LockRecord),
    /// Held by a live session elsewhere
    HeldBy(LockRecord),
    /// Left behind by a session that is gone
    Stale(LockRecord),
    /// Present but not parseable; treated as stale
    Unreadable,
}

enum Existing {
    Absent,
    Record(LockRecord),
    Garbled,
}

/// Build the identity of this process for lock records.
///
/// The user is `user_override`, else `$USER` / `$USERNAME`, else "unknown".
pub fn current_identity(user_override: Option<&str>) -> ApplicationResult<SessionIdentity> {
    let user = user_override
        .map(str::to_string)
        .or_else(|| std::env::var("USER").ok())
        .or_else(|| std::env::var("USERNAME").ok())
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .map_err(|e| ApplicationError::OperationFailed {
            context: "get hostname".to_string(),
            source: Box::new(e),
        })?;
    Ok(SessionIdentity::new(user, host, std::process::id()))
}

/// Lock manager for one editing session.
pub struct LockManager {
    fs: Arc<dyn FileSystem>,
    cmd: Arc<dyn CommandRunner>,
    identity: SessionIdentity,
    stale_after: Duration,
    /// Holder of the last stale lock removed, handed out once
    old_lock_user: Mutex<Option<String>>,
}

impl LockManager {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        cmd: Arc<dyn CommandRunner>,
        settings: Arc<Settings>,
        identity: SessionIdentity,
    ) -> Self {
        let secs = i64::try_from(settings.lock_stale_after_secs).unwrap_or(i64::MAX);
        Self {
            fs,
            cmd,
            identity,
            stale_after: Duration::try_seconds(secs).unwrap_or(Duration::MAX),
            old_lock_user: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    /// Lock file path for a map file: `<dir>/$~<file name>~`.
    pub fn lock_path_for(file: &Path) -> PathBuf {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let lock_name = format!("{}{}{}", LOCK_PREFIX, name, LOCK_SUFFIX);
        match file.parent() {
            Some(dir) => dir.join(lock_name),
            None => PathBuf::from(lock_name),
        }
    }

    // ============================================================
    // Public API
    // ============================================================

    /// Claim the lock for `file`.
    ///
    /// Returns `None` when this session now holds the lock, or the user name
    /// of the live session that holds it. A stale lock is removed and its
    /// holder kept for [`LockManager::pop_locking_user_of_old_lock`].
    #[instrument(level = "debug", skip(self))]
    pub fn try_to_lock(&self, file: &Path) -> ApplicationResult<Option<String>> {
        let lock_path = Self::lock_path_for(file);
        let now = Utc::now();

        match self.read_existing(&lock_path)? {
            Existing::Absent => {}
            Existing::Record(record) if record.is_held_by(&self.identity) => {
                debug!("try_to_lock: already held by this session");
                return Ok(None);
            }
            Existing::Record(record) if !self.is_stale(&record, now) => {
                info!(
                    "try_to_lock: {} is locked by {}",
                    file.display(),
                    record.user
                );
                return Ok(Some(record.user));
            }
            Existing::Record(record) => {
                warn!(
                    "try_to_lock: removing stale lock of {} on {}",
                    record.user,
                    file.display()
                );
                self.remove_lock_file(&lock_path)?;
                self.set_old_lock_user(Some(record.user));
            }
            Existing::Garbled => {
                warn!(
                    "try_to_lock: removing unreadable lock file {}",
                    lock_path.display()
                );
                self.remove_lock_file(&lock_path)?;
            }
        }

        self.claim(&lock_path, now)
    }

    /// Holder of the stale lock removed by the last `try_to_lock`; consumed on read.
    pub fn pop_locking_user_of_old_lock(&self) -> Option<String> {
        match self.old_lock_user.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Renew the timestamp of a lock held by this session.
    #[instrument(level = "debug", skip(self))]
    pub fn refresh(&self, file: &Path) -> ApplicationResult<()> {
        let lock_path = Self::lock_path_for(file);
        match self.read_existing(&lock_path)? {
            Existing::Record(record) if record.is_held_by(&self.identity) => {
                self.rewrite_refreshed(record, &lock_path, Utc::now())
            }
            _ => Err(ApplicationError::LockNotHeld(file.to_path_buf())),
        }
    }

    /// Renew the lock of `file` once half the stale period has passed since
    /// its last refresh. Returns whether the record was rewritten.
    #[instrument(level = "trace", skip(self))]
    pub fn keep_alive(&self, file: &Path) -> ApplicationResult<bool> {
        let lock_path = Self::lock_path_for(file);
        match self.read_existing(&lock_path)? {
            Existing::Record(record) if record.is_held_by(&self.identity) => {
                let now = Utc::now();
                if record.age(now) < self.stale_after / 2 {
                    return Ok(false);
                }
                debug!("keep_alive: refreshing {}", lock_path.display());
                self.rewrite_refreshed(record, &lock_path, now)?;
                Ok(true)
            }
            _ => Err(ApplicationError::LockNotHeld(file.to_path_buf())),
        }
    }

    /// Remove the lock of `file` if this session holds it.
    ///
    /// Returns false, leaving the file alone, when there is no lock or it
    /// belongs to another session.
    #[instrument(level = "debug", skip(self))]
    pub fn release(&self, file: &Path) -> ApplicationResult<bool> {
        let lock_path = Self::lock_path_for(file);
        match self.read_existing(&lock_path)? {
            Existing::Record(record) if record.is_held_by(&self.identity) => {
                self.remove_lock_file(&lock_path)?;
                debug!("release: removed {}", lock_path.display());
                Ok(true)
            }
            Existing::Record(record) => {
                debug!("release: lock belongs to {}, keeping it", record.user);
                Ok(false)
            }
            Existing::Absent | Existing::Garbled => Ok(false),
        }
    }

    /// Inspect the lock of `file` without changing it.
    pub fn status(&self, file: &Path) -> ApplicationResult<LockStatus> {
        let lock_path = Self::lock_path_for(file);
        Ok(match self.read_existing(&lock_path)? {
            Existing::Absent => LockStatus::Free,
            Existing::Garbled => LockStatus::Unreadable,
            Existing::Record(r) if r.is_held_by(&self.identity) => LockStatus::Owned(r),
            Existing::Record(r) if self.is_stale(&r, Utc::now()) => LockStatus::Stale(r),
            Existing::Record(r) => LockStatus::HeldBy(r),
        })
    }

    // ============================================================
    // Helpers
    // ============================================================

    fn claim(&self, lock_path: &Path, now: DateTime<Utc>) -> ApplicationResult<Option<String>> {
        let record = LockRecord::claim(&self.identity, now);
        let content = Self::serialize(&record)?;
        match self.fs.create_new(lock_path, &content) {
            Ok(()) => {
                debug!("claim: created {}", lock_path.display());
                Ok(None)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                // another session won the race between our check and create
                match self.read_existing(lock_path)? {
                    Existing::Record(winner) => Ok(Some(winner.user)),
                    _ => Err(ApplicationError::OperationFailed {
                        context: format!("claim lock file: {}", lock_path.display()),
                        source: Box::new(e),
                    }),
                }
            }
            Err(e) => Err(e).with_path_context("create lock file", lock_path),
        }
    }

    fn rewrite_refreshed(
        &self,
        mut record: LockRecord,
        lock_path: &Path,
        now: DateTime<Utc>,
    ) -> ApplicationResult<()> {
        record.refreshed_at = now;
        let content = Self::serialize(&record)?;
        self.fs
            .write_atomic(lock_path, content.as_bytes())
            .with_path_context("refresh lock file", lock_path)
    }

    fn read_existing(&self, lock_path: &Path) -> ApplicationResult<Existing> {
        let content = match self.fs.read_to_string(lock_path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Existing::Absent),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => return Ok(Existing::Garbled),
            Err(e) => return Err(e).with_path_context("read lock file", lock_path),
        };

        if let Ok(record) = toml::from_str::<LockRecord>(&content) {
            return Ok(Existing::Record(record));
        }

        // legacy format: the file holds nothing but the user name
        let trimmed = content.trim();
        if trimmed.is_empty() || trimmed.contains('\n') || trimmed.contains('=') {
            return Ok(Existing::Garbled);
        }
        let modified = self
            .fs
            .modified(lock_path)
            .with_path_context("stat lock file", lock_path)?;
        Ok(Existing::Record(LockRecord::legacy(
            trimmed,
            DateTime::<Utc>::from(modified),
        )))
    }

    fn is_stale(&self, record: &LockRecord, now: DateTime<Utc>) -> bool {
        if let (Some(host), Some(pid)) = (record.host.as_deref(), record.pid) {
            if host == self.identity.host {
                return !self.process_alive(pid);
            }
        }
        record.age(now) > self.stale_after
    }

    /// Probe a local process with `kill -0`. When the probe itself cannot run
    /// the process is assumed alive.
    fn process_alive(&self, pid: u32) -> bool {
        if pid == self.identity.pid {
            return true;
        }
        let pid_arg = pid.to_string();
        match self.cmd.run("kill", &["-0", &pid_arg]) {
            Ok(out) if out.status.success() => true,
            Ok(out) => {
                // EPERM: the process exists but belongs to another user
                String::from_utf8_lossy(&out.stderr).contains("not permitted")
            }
            Err(e) => {
                debug!("process_alive: cannot probe pid {}: {}", pid, e);
                true
            }
        }
    }

    fn remove_lock_file(&self, lock_path: &Path) -> ApplicationResult<()> {
        match self.fs.remove_file(lock_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_path_context("remove lock file", lock_path),
        }
    }

    fn set_old_lock_user(&self, user: Option<String>) {
        match self.old_lock_user.lock() {
            Ok(mut guard) => *guard = user,
            Err(poisoned) => *poisoned.into_inner() = user,
        }
    }

    fn serialize(record: &LockRecord) -> ApplicationResult<String> {
        toml::to_string(record).map_err(|e| ApplicationError::OperationFailed {
            context: "serialize lock record".to_string(),
            source: Box::new(e),
        })
    }
}
