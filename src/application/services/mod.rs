//! Application services
//!
//! Concrete service implementations that orchestrate domain logic.
//! Services depend on I/O boundary traits (FileSystem, CommandRunner, etc.)
//! and are concrete structs; only persistence and prompting are traits, so
//! callers can swap them.

mod controller;
mod loader;
mod lock;
mod migration;
mod persistence;

pub use controller::{ControllerStrategy, MapController, NewNodeMode};
pub use loader::{LoadCancellation, LoadNotice, LoadOutcome, MapLoader};
pub use lock::{current_identity, LockManager, LockStatus};
pub use migration::{
    load_transform, ConversionChoice, ConversionPrompt, PreparedDocument, VersionMigrator,
};
pub use persistence::{FilePersistence, MapPersistence};
