//! Saving maps back to their files

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::application::{ApplicationError, ApplicationResult, IoResultExt};
use crate::domain::{write_map, Map, WriteOptions};
use crate::infrastructure::traits::FileSystem;
use crate::preferences::{PropertyChangeListener, Preferences, SAVE_ONLY_INTRINSICALLY_NEEDED_IDS};

/// Persistence collaborator of the controller.
pub trait MapPersistence: Send + Sync {
    /// Save `map`. Returns false when the map could not be saved and the
    /// caller must not proceed with a destructive operation.
    fn save(&self, map: &mut Map) -> ApplicationResult<bool>;
}

/// Writes maps to their own file with an atomic replace.
pub struct FilePersistence {
    fs: Arc<dyn FileSystem>,
    save_only_ids: AtomicBool,
}

impl FilePersistence {
    /// Create and subscribe to the id-minimization preference.
    pub fn new(fs: Arc<dyn FileSystem>, preferences: &Preferences) -> Arc<Self> {
        let persistence = Arc::new(Self {
            fs,
            save_only_ids: AtomicBool::new(false),
        });
        preferences.add_listener_and_propagate(persistence.clone());
        persistence
    }

    pub fn write_options(&self) -> WriteOptions {
        WriteOptions {
            save_only_intrinsically_needed_ids: self.save_only_ids.load(Ordering::SeqCst),
        }
    }
}

impl PropertyChangeListener for FilePersistence {
    fn property_changed(&self, name: &str, _old_value: Option<&str>, new_value: &str) {
        if name == SAVE_ONLY_INTRINSICALLY_NEEDED_IDS {
            let enabled = new_value.trim().eq_ignore_ascii_case("true");
            debug!("property_changed: save only needed ids = {}", enabled);
            self.save_only_ids.store(enabled, Ordering::SeqCst);
        }
    }
}

impl MapPersistence for FilePersistence {
    #[instrument(level = "debug", skip(self, map), fields(file = ?map.file()))]
    fn save(&self, map: &mut Map) -> ApplicationResult<bool> {
        if map.is_read_only() {
            return Err(ApplicationError::ReadOnlyMap(map.title()));
        }
        let Some(path) = map.file().map(|p| p.to_path_buf()) else {
            warn!("save: map '{}' has no file", map.title());
            return Ok(false);
        };

        let content = write_map(map.tree(), &self.write_options())?;
        self.fs
            .write_atomic(&path, &content)
            .with_path_context("save map", &path)?;
        map.set_saved(true);
        info!("save: wrote {} ({} bytes)", path.display(), content.len());
        Ok(true)
    }
}
