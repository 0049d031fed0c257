//! Opening map files
//!
//! Loading degrades instead of failing wherever a usable map can still be
//! produced: an unwritable file, a foreign lock or a locking fault give a
//! read-only map, and a parse failure gives a read-only one-node map carrying
//! the error text. Only a missing file, a cancelled load and a file that cannot
//! be opened for reading are errors.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use crate::application::services::{LockManager, VersionMigrator};
use crate::application::{ApplicationError, ApplicationResult};
use crate::domain::{parse_map, DomainError, LockState, Map, MapTree, NodeData, VersionClass};
use crate::infrastructure::traits::FileSystem;

/// Non-fatal conditions met while loading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadNotice {
    /// The file is not writable; the map is read-only
    ReadOnlyFile,
    /// Another session holds the lock; the map is read-only
    LockedBy(String),
    /// The lock could not be taken; the map is read-only
    LockingFailed(String),
    /// A stale lock of this user was removed
    StaleLockRemoved(String),
    /// The document was run through the migration transform
    Converted { from: Option<String> },
    /// The document did not parse; the map holds the error text only and is read-only
    ParseFailed(String),
}

impl LoadNotice {
    /// Informational notices leave the map fully usable.
    pub fn is_informational(&self) -> bool {
        matches!(
            self,
            LoadNotice::StaleLockRemoved(_) | LoadNotice::Converted { .. }
        )
    }
}

impl fmt::Display for LoadNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadNotice::ReadOnlyFile => write!(f, "file is not writable, opened read-only"),
            LoadNotice::LockedBy(user) => write!(f, "map is being edited by {}, opened read-only", user),
            LoadNotice::LockingFailed(reason) => {
                write!(f, "could not lock map ({}), opened read-only", reason)
            }
            LoadNotice::StaleLockRemoved(user) => {
                write!(f, "removed stale lock left by {}", user)
            }
            LoadNotice::Converted { from: Some(v) } => {
                write!(f, "converted from version {} to the current format", v)
            }
            LoadNotice::Converted { from: None } => write!(f, "converted to the current format"),
            LoadNotice::ParseFailed(err) => write!(f, "document could not be parsed: {}", err),
        }
    }
}

/// A loaded map and what happened on the way.
#[derive(Debug)]
pub struct LoadOutcome {
    pub map: Map,
    pub version: VersionClass,
    pub notices: Vec<LoadNotice>,
}

impl LoadOutcome {
    pub fn is_degraded(&self) -> bool {
        self.notices.iter().any(|n| !n.is_informational())
    }

    /// The map is the error placeholder, not the document.
    pub fn parse_failed(&self) -> bool {
        self.notices
            .iter()
            .any(|n| matches!(n, LoadNotice::ParseFailed(_)))
    }

    pub fn stale_lock_user(&self) -> Option<&str> {
        self.notices.iter().find_map(|n| match n {
            LoadNotice::StaleLockRemoved(user) => Some(user.as_str()),
            _ => None,
        })
    }
}

/// Shared flag to abort a load between steps.
#[derive(Debug, Clone, Default)]
pub struct LoadCancellation(Arc<AtomicBool>);

impl LoadCancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct MapLoader {
    fs: Arc<dyn FileSystem>,
    locks: Arc<LockManager>,
    migrator: Arc<VersionMigrator>,
}

impl MapLoader {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        locks: Arc<LockManager>,
        migrator: Arc<VersionMigrator>,
    ) -> Self {
        Self { fs, locks, migrator }
    }

    pub fn load(&self, path: &Path) -> ApplicationResult<LoadOutcome> {
        self.load_with(path, &LoadCancellation::default())
    }

    /// Load `path`, checking `cancel` between steps.
    ///
    /// A lock acquired before cancellation stays with this session.
    #[instrument(level = "debug", skip(self, cancel))]
    pub fn load_with(
        &self,
        path: &Path,
        cancel: &LoadCancellation,
    ) -> ApplicationResult<LoadOutcome> {
        if !self.fs.is_file(path) {
            return Err(ApplicationError::FileNotFound(path.to_path_buf()));
        }

        let mut map = Map::empty();
        let mut notices = Vec::new();
        self.claim(path, &mut map, &mut notices);
        Self::check_cancelled(cancel, path)?;

        let (tree, version) = match self.migrator.open(path) {
            Ok(prepared) => {
                Self::check_cancelled(cancel, path)?;
                let version = prepared.class.clone();
                if prepared.converted {
                    notices.push(LoadNotice::Converted {
                        from: version.version().map(str::to_string),
                    });
                }
                let parsed = parse_map(prepared.into_reader()).map(|doc| doc.tree);
                (Self::tree_or_fallback(path, parsed, &mut notices), version)
            }
            Err(ApplicationError::Domain(e)) => {
                // conversion of a malformed document
                let version = self
                    .migrator
                    .classify_file(path)
                    .unwrap_or(VersionClass::Unknown { declared: None });
                (Self::tree_or_fallback(path, Err(e), &mut notices), version)
            }
            Err(e) => return Err(e),
        };

        let parse_failed = notices
            .iter()
            .any(|n| matches!(n, LoadNotice::ParseFailed(_)));
        map.set_tree(tree);
        map.set_file(Some(path.to_path_buf()));
        map.set_saved(true);
        if parse_failed {
            // the error tree must never replace the document on disk
            map.set_read_only(true);
        }
        info!(
            "load: {} ({}, {} node(s), read_only={})",
            path.display(),
            version,
            map.tree().node_count(),
            map.is_read_only()
        );
        Ok(LoadOutcome {
            map,
            version,
            notices,
        })
    }

    fn claim(&self, path: &Path, map: &mut Map, notices: &mut Vec<LoadNotice>) {
        if !self.fs.is_writable(path) {
            info!("claim: {} is not writable", path.display());
            map.set_read_only(true);
            notices.push(LoadNotice::ReadOnlyFile);
            return;
        }

        match self.locks.try_to_lock(path) {
            Ok(None) => map.set_lock_state(LockState::Owned),
            Ok(Some(user)) => {
                map.set_read_only(true);
                map.set_lock_state(LockState::HeldBy(user.clone()));
                notices.push(LoadNotice::LockedBy(user));
            }
            Err(e) => {
                warn!("claim: locking {} failed: {}", path.display(), e);
                map.set_read_only(true);
                map.set_lock_state(LockState::Failed);
                notices.push(LoadNotice::LockingFailed(e.to_string()));
            }
        }

        if let Some(old_user) = self.locks.pop_locking_user_of_old_lock() {
            info!("claim: removed stale lock of {}", old_user);
            notices.push(LoadNotice::StaleLockRemoved(old_user));
        }
    }

    fn tree_or_fallback(
        path: &Path,
        parsed: Result<MapTree, DomainError>,
        notices: &mut Vec<LoadNotice>,
    ) -> MapTree {
        match parsed {
            Ok(tree) => tree,
            Err(e) => {
                error!("load: cannot parse {}: {}", path.display(), e);
                notices.push(LoadNotice::ParseFailed(e.to_string()));
                MapTree::with_root(NodeData::new(format!("Error while parsing file: {}", e)))
            }
        }
    }

    fn check_cancelled(cancel: &LoadCancellation, path: &Path) -> ApplicationResult<()> {
        if cancel.is_cancelled() {
            warn!("load: cancelled for {}", path.display());
            return Err(ApplicationError::Cancelled(format!("load of {}", path.display())));
        }
        Ok(())
    }
}
