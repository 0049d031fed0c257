//! Service container for dependency injection
//!
//! Wires up all services with their dependencies.

use std::sync::Arc;

use crate::application::services::{
    current_identity, load_transform, ControllerStrategy, ConversionPrompt, FilePersistence,
    LockManager, MapController, MapLoader, VersionMigrator,
};
use crate::application::ApplicationResult;
use crate::config::Settings;
use crate::domain::{Map, SessionIdentity};
use crate::infrastructure::prompt::SelectorConversionPrompt;
use crate::infrastructure::traits::{
    CommandRunner, FileSystem, RealCommandRunner, RealFileSystem, SkimSelector,
};
use crate::preferences::Preferences;

/// Container holding all application services.
pub struct ServiceContainer {
    /// Application settings
    pub settings: Arc<Settings>,

    /// Filesystem abstraction
    pub fs: Arc<dyn FileSystem>,

    /// Command runner abstraction
    pub cmd: Arc<dyn CommandRunner>,

    pub preferences: Arc<Preferences>,
    pub locks: Arc<LockManager>,
    pub migrator: Arc<VersionMigrator>,
    pub loader: MapLoader,
    pub persistence: Arc<FilePersistence>,
}

impl ServiceContainer {
    /// Create a new service container with real implementations.
    ///
    /// Unknown versions are asked about with the interactive selector.
    pub fn new(settings: Settings) -> ApplicationResult<Self> {
        let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
        let preferences = Arc::new(Preferences::load(fs.clone(), &settings)?);
        let identity = current_identity(settings.user_name.as_deref())?;
        Self::with_deps(
            settings,
            fs,
            Arc::new(RealCommandRunner),
            preferences,
            identity,
            Arc::new(SelectorConversionPrompt::new(Arc::new(SkimSelector))),
        )
    }

    /// Create a service container with custom dependencies (for testing).
    pub fn with_deps(
        settings: Settings,
        fs: Arc<dyn FileSystem>,
        cmd: Arc<dyn CommandRunner>,
        preferences: Arc<Preferences>,
        identity: SessionIdentity,
        prompt: Arc<dyn ConversionPrompt>,
    ) -> ApplicationResult<Self> {
        let settings = Arc::new(settings);

        let locks = Arc::new(LockManager::new(
            fs.clone(),
            cmd.clone(),
            settings.clone(),
            identity,
        ));
        let transform = load_transform(fs.as_ref(), &settings)?;
        let migrator = Arc::new(VersionMigrator::new(
            fs.clone(),
            &settings,
            transform,
            preferences.clone(),
            prompt,
        ));
        let loader = MapLoader::new(fs.clone(), locks.clone(), migrator.clone());
        let persistence = FilePersistence::new(fs.clone(), &preferences);

        Ok(Self {
            settings,
            fs,
            cmd,
            preferences,
            locks,
            migrator,
            loader,
            persistence,
        })
    }

    /// Strategy for maps backed by a file.
    pub fn file_strategy(&self) -> ControllerStrategy {
        ControllerStrategy {
            persistence: self.persistence.clone(),
            locks: Some(self.locks.clone()),
        }
    }

    /// Controller for a map loaded through this container.
    pub fn controller(&self, map: Map) -> MapController {
        MapController::new(map, self.file_strategy())
    }
}
