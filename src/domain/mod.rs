//! Domain layer: map model and document formats
//!
//! This layer is independent of external concerns (no file I/O, no CLI, no config loading).

pub mod arena;
pub mod document;
pub mod entities;
pub mod error;
pub mod events;
pub mod extension;
pub mod map;
pub mod render;
pub mod rewrite;
pub mod version;

pub use arena::{MapTree, MoveOutcome, ShiftDirection, TreeNode};
pub use document::{parse_map, write_map, ParsedDocument, WriteOptions};
pub use entities::*;
pub use error::{DomainError, DomainResult};
pub use events::{ListenerRegistry, MapChangeListener, MapEvent, NodeProperty};
pub use extension::{EncryptionState, Extension, ExtensionKind, Extensions, IconSet, NodeLink};
pub use map::{LockState, Map};
pub use render::TreeNodeConvert;
pub use rewrite::{DocumentTransform, RewriteRules, RuleTransform};
pub use version::{VersionClass, VersionDetector, CURRENT_VERSION, LEGACY_VERSION};
