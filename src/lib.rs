//! Mind-map document engine
//!
//! Outline tree with change events, version detection and migration of map
//! documents, crash-tolerant loading and advisory lock files.

pub mod application;
pub mod cli;
pub mod config;
pub mod domain;
pub mod exitcode;
pub mod infrastructure;
pub mod preferences;
pub mod util;
