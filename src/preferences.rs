//! Runtime preferences with change notification
//!
//! String-valued properties seeded from [`Settings`] and overlaid with the
//! values persisted in the preferences file. Components read them by name
//! and register a [`PropertyChangeListener`] to follow changes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::{debug, instrument};

use crate::application::{ApplicationError, ApplicationResult, IoResultExt};
use crate::config::Settings;
use crate::infrastructure::traits::FileSystem;

/// Write node ids only where links need them ("true" / "false").
pub const SAVE_ONLY_INTRINSICALLY_NEEDED_IDS: &str = "save_only_intrinsically_needed_ids";

/// Remembered answer for unknown document versions ("ask", "convert", "as_is").
pub const CONVERT_TO_CURRENT_VERSION: &str = "convert_to_current_version";

/// Receives `(name, old, new)` whenever a property changes.
pub trait PropertyChangeListener: Send + Sync {
    fn property_changed(&self, name: &str, old_value: Option<&str>, new_value: &str);
}

pub struct Preferences {
    fs: Arc<dyn FileSystem>,
    path: Option<PathBuf>,
    values: RwLock<BTreeMap<String, String>>,
    listeners: RwLock<Vec<Arc<dyn PropertyChangeListener>>>,
}

impl std::fmt::Debug for Preferences {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Preferences")
            .field("path", &self.path)
            .field("values", &self.snapshot())
            .finish()
    }
}

impl Preferences {
    /// Preferences that are never written to disk.
    pub fn in_memory(fs: Arc<dyn FileSystem>, settings: &Settings) -> Self {
        Self {
            fs,
            path: None,
            values: RwLock::new(Self::seed(settings)),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Seed from `settings`, then overlay the persisted file if it exists.
    #[instrument(level = "debug", skip(fs, settings))]
    pub fn load(fs: Arc<dyn FileSystem>, settings: &Settings) -> ApplicationResult<Self> {
        let mut values = Self::seed(settings);
        let path = settings.preferences_file.clone();
        if let Some(path) = path.as_deref().filter(|p| fs.exists(p)) {
            let content = fs
                .read_to_string(path)
                .with_path_context("read preferences", path)?;
            let stored: BTreeMap<String, String> =
                toml::from_str(&content).map_err(|e| ApplicationError::Config {
                    message: format!("parse {}: {}", path.display(), e),
                })?;
            debug!("load: {} stored preference(s)", stored.len());
            values.extend(stored);
        }
        Ok(Self {
            fs,
            path,
            values: RwLock::new(values),
            listeners: RwLock::new(Vec::new()),
        })
    }

    fn seed(settings: &Settings) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                SAVE_ONLY_INTRINSICALLY_NEEDED_IDS.to_string(),
                settings.save_only_intrinsically_needed_ids.to_string(),
            ),
            (
                CONVERT_TO_CURRENT_VERSION.to_string(),
                settings.convert_unknown_versions.as_str().to_string(),
            ),
        ])
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.read_values().get(name).cloned()
    }

    pub fn get_bool(&self, name: &str) -> bool {
        self.get(name)
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    /// Store a property, persist it and notify listeners when the value changed.
    ///
    /// The stored value is only updated once it has been persisted; on error
    /// the old value stays and no listener is called.
    #[instrument(level = "debug", skip(self))]
    pub fn set(&self, name: &str, value: &str) -> ApplicationResult<()> {
        let old = {
            let mut values = match self.values.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let old = values.get(name).cloned();
            if old.as_deref() == Some(value) {
                return Ok(());
            }
            let mut updated = values.clone();
            updated.insert(name.to_string(), value.to_string());
            self.persist(&updated)?;
            *values = updated;
            old
        };
        for listener in self.listeners_snapshot() {
            listener.property_changed(name, old.as_deref(), value);
        }
        Ok(())
    }

    pub fn add_listener(&self, listener: Arc<dyn PropertyChangeListener>) {
        match self.listeners.write() {
            Ok(mut guard) => guard.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }

    /// Register `listener` and replay every current value to it.
    pub fn add_listener_and_propagate(&self, listener: Arc<dyn PropertyChangeListener>) {
        self.add_listener(listener.clone());
        for (name, value) in self.snapshot() {
            listener.property_changed(&name, None, &value);
        }
    }

    pub fn remove_listener(&self, listener: &Arc<dyn PropertyChangeListener>) {
        let target = Arc::as_ptr(listener) as *const ();
        let mut listeners = match self.listeners.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        listeners.retain(|l| !std::ptr::eq(Arc::as_ptr(l) as *const (), target));
    }

    fn snapshot(&self) -> BTreeMap<String, String> {
        self.read_values().clone()
    }

    fn read_values(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, String>> {
        match self.values.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn listeners_snapshot(&self) -> Vec<Arc<dyn PropertyChangeListener>> {
        match self.listeners.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn persist(&self, values: &BTreeMap<String, String>) -> ApplicationResult<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let content = toml::to_string_pretty(values).map_err(|e| ApplicationError::Config {
            message: format!("serialize preferences: {e}"),
        })?;
        self.fs
            .ensure_parent(path)
            .with_path_context("create preferences directory", path)?;
        self.fs
            .write_atomic(path, content.as_bytes())
            .with_path_context("write preferences", path)
    }
}
