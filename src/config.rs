//! Configuration management with layered loading
//!
//! Precedence (lowest to highest):
//! 1. Compiled defaults
//! 2. Global config: `$XDG_CONFIG_HOME/mindmap/mindmap.toml`
//! 3. Local config: `<map_dir>/.mindmap.toml` (directory of the opened map)
//! 4. Environment variables: `MINDMAP_*` prefix

use std::fmt;
use std::path::{Path, PathBuf};

use config::{Config, ConfigError, Environment};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::application::ApplicationError;
use crate::domain::LEGACY_VERSION;

/// What to do with a document of unknown version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionPolicy {
    /// Ask every time until the user says "don't ask again"
    #[default]
    Ask,
    /// Run the migration transform
    Convert,
    /// Parse unchanged, best effort
    AsIs,
}

impl ConversionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversionPolicy::Ask => "ask",
            ConversionPolicy::Convert => "convert",
            ConversionPolicy::AsIs => "as_is",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "ask" => Some(ConversionPolicy::Ask),
            "convert" | "true" => Some(ConversionPolicy::Convert),
            "as_is" | "false" => Some(ConversionPolicy::AsIs),
            _ => None,
        }
    }
}

impl fmt::Display for ConversionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw settings for intermediate parsing (all fields optional to detect "not specified").
///
/// Used during layered config merging to distinguish between:
/// - `None` → field not specified, inherit from base
/// - `Some([])` → explicit empty array
/// - `Some([...])` → explicit values to merge
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RawSettings {
    pub user_name: Option<String>,
    pub lock_stale_after_secs: Option<u64>,
    pub known_legacy_versions: Option<Vec<String>>,
    pub convert_unknown_versions: Option<ConversionPolicy>,
    pub save_only_intrinsically_needed_ids: Option<bool>,
    pub migration_rules: Option<PathBuf>,
    pub preferences_file: Option<PathBuf>,
}

/// Unified configuration for mindmap.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    /// Identity written into lock files (default: $USER)
    pub user_name: Option<String>,
    /// Age after which a lock from another host counts as stale
    pub lock_stale_after_secs: u64,
    /// Legacy versions parsed without conversion, in match order
    pub known_legacy_versions: Vec<String>,
    /// Policy for documents of unknown version
    pub convert_unknown_versions: ConversionPolicy,
    /// Write node ids only where links need them
    pub save_only_intrinsically_needed_ids: bool,
    /// Rule file replacing the built-in migration rules
    pub migration_rules: Option<PathBuf>,
    /// Where runtime preferences ("don't ask again" answers) are stored
    pub preferences_file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            user_name: None,
            lock_stale_after_secs: 600,
            known_legacy_versions: vec![LEGACY_VERSION.to_string()],
            convert_unknown_versions: ConversionPolicy::Ask,
            save_only_intrinsically_needed_ids: false,
            migration_rules: None,
            preferences_file: default_preferences_file(),
        }
    }
}

fn default_preferences_file() -> Option<PathBuf> {
    ProjectDirs::from("", "", "mindmap").map(|dirs| dirs.data_dir().join("preferences.toml"))
}

/// Get the XDG config directory for mindmap.
pub fn global_config_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "", "mindmap").map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the global config file.
pub fn global_config_path() -> Option<PathBuf> {
    global_config_dir().map(|dir| dir.join("mindmap.toml"))
}

/// Get the path to the local config file next to a map.
pub fn local_config_path(map_dir: &Path) -> PathBuf {
    map_dir.join(".mindmap.toml")
}

/// Expand `~`, `$VAR` and `${VAR}`; unresolvable input is kept verbatim.
pub fn expand_env_vars(path: &str) -> String {
    shellexpand::full(path)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| path.to_string())
}

/// Load a TOML file into RawSettings for manual merging.
fn load_raw_settings(path: &Path) -> Result<RawSettings, ApplicationError> {
    let content = std::fs::read_to_string(path).map_err(|e| ApplicationError::Config {
        message: format!("read {}: {}", path.display(), e),
    })?;
    toml::from_str(&content).map_err(|e| ApplicationError::Config {
        message: format!("parse {}: {}", path.display(), e),
    })
}

impl Settings {
    /// Merge arrays with union semantics and negation support.
    ///
    /// - Items from overlay are appended to base, keeping first-seen order
    /// - Items prefixed with `!` remove the corresponding item from the result
    /// - Duplicates are de-duplicated
    ///
    /// # Examples
    /// ```ignore
    /// merge_array(&["a", "b"], &["c"])       // → ["a", "b", "c"]
    /// merge_array(&["a", "b"], &["!a", "c"]) // → ["b", "c"]
    /// ```
    pub fn merge_array(base: &[String], overlay: &[String]) -> Vec<String> {
        let mut result: Vec<String> = Vec::with_capacity(base.len() + overlay.len());
        for item in base {
            if !result.contains(item) {
                result.push(item.clone());
            }
        }
        for pattern in overlay {
            if let Some(negated) = pattern.strip_prefix('!') {
                result.retain(|r| r != negated);
            } else if !result.contains(pattern) {
                result.push(pattern.clone());
            }
        }
        result
    }

    /// Expand shell variables and tilde in path-like fields.
    fn expand_paths(&mut self) {
        let expand = |p: &PathBuf| PathBuf::from(expand_env_vars(p.to_string_lossy().as_ref()));
        self.migration_rules = self.migration_rules.as_ref().map(expand);
        self.preferences_file = self.preferences_file.as_ref().map(expand);
    }

    /// Merge overlay config onto self (base) with union semantics for arrays.
    ///
    /// - Scalar options: overlay wins if Some, otherwise keep base
    /// - Arrays: union merge with negation support
    pub fn merge_with(&self, overlay: &RawSettings) -> Self {
        Self {
            known_legacy_versions: overlay
                .known_legacy_versions
                .as_ref()
                .map(|o| Self::merge_array(&self.known_legacy_versions, o))
                .unwrap_or_else(|| self.known_legacy_versions.clone()),
            ..self.apply_scalars(overlay)
        }
    }

    /// Apply global config onto defaults with REPLACE semantics for arrays.
    ///
    /// Defaults are only a starting point; the global config defines the
    /// baseline that map-local configs then extend.
    pub fn apply_global(&self, global: &RawSettings) -> Self {
        Self {
            known_legacy_versions: global
                .known_legacy_versions
                .clone()
                .unwrap_or_else(|| self.known_legacy_versions.clone()),
            ..self.apply_scalars(global)
        }
    }

    fn apply_scalars(&self, overlay: &RawSettings) -> Self {
        Self {
            user_name: overlay.user_name.clone().or_else(|| self.user_name.clone()),
            lock_stale_after_secs: overlay
                .lock_stale_after_secs
                .unwrap_or(self.lock_stale_after_secs),
            known_legacy_versions: self.known_legacy_versions.clone(),
            convert_unknown_versions: overlay
                .convert_unknown_versions
                .unwrap_or(self.convert_unknown_versions),
            save_only_intrinsically_needed_ids: overlay
                .save_only_intrinsically_needed_ids
                .unwrap_or(self.save_only_intrinsically_needed_ids),
            migration_rules: overlay
                .migration_rules
                .clone()
                .or_else(|| self.migration_rules.clone()),
            preferences_file: overlay
                .preferences_file
                .clone()
                .or_else(|| self.preferences_file.clone()),
        }
    }

    /// Load settings with layered precedence.
    ///
    /// # Arguments
    /// * `map_dir` - Optional directory of the map being worked on, for local config
    ///
    /// # Array Merge Semantics
    /// - Defaults → Global: REPLACE (global defines the real baseline)
    /// - Global → Local: UNION with negation support
    /// - Any → Env vars: REPLACE (explicit user override)
    pub fn load(map_dir: Option<&Path>) -> Result<Self, ApplicationError> {
        Self::load_from(global_config_path().as_deref(), map_dir)
    }

    /// Same as [`Settings::load`] with an explicit global config path.
    pub fn load_from(
        global_path: Option<&Path>,
        map_dir: Option<&Path>,
    ) -> Result<Self, ApplicationError> {
        let mut current = Self::default();

        if let Some(global_path) = global_path {
            if global_path.exists() {
                let raw = load_raw_settings(global_path)?;
                current = current.apply_global(&raw);
            }
        }

        if let Some(dir) = map_dir {
            let local_path = local_config_path(dir);
            if local_path.exists() {
                let raw = load_raw_settings(&local_path)?;
                current = current.merge_with(&raw);
            }
        }

        current = Self::apply_env_overrides(current)?;
        current.expand_paths();

        Ok(current)
    }

    /// Apply MINDMAP_* environment variables as explicit overrides.
    fn apply_env_overrides(mut settings: Self) -> Result<Self, ApplicationError> {
        let builder = Config::builder().add_source(
            Environment::with_prefix("MINDMAP")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("known_legacy_versions")
                .try_parsing(true),
        );

        let config = builder.build().map_err(config_err)?;

        if let Ok(val) = config.get_string("user_name") {
            settings.user_name = Some(val);
        }
        if let Ok(val) = config.get_int("lock_stale_after_secs") {
            settings.lock_stale_after_secs = u64::try_from(val).map_err(|_| ApplicationError::Config {
                message: format!("lock_stale_after_secs must not be negative: {}", val),
            })?;
        }
        if let Ok(val) = config.get::<Vec<String>>("known_legacy_versions") {
            settings.known_legacy_versions = val;
        }
        if let Ok(val) = config.get_string("convert_unknown_versions") {
            settings.convert_unknown_versions =
                ConversionPolicy::parse(&val).ok_or_else(|| ApplicationError::Config {
                    message: format!("invalid convert_unknown_versions: {}", val),
                })?;
        }
        if let Ok(val) = config.get_bool("save_only_intrinsically_needed_ids") {
            settings.save_only_intrinsically_needed_ids = val;
        }
        if let Ok(val) = config.get_string("migration_rules") {
            settings.migration_rules = Some(PathBuf::from(val));
        }
        if let Ok(val) = config.get_string("preferences_file") {
            settings.preferences_file = Some(PathBuf::from(val));
        }

        Ok(settings)
    }

    /// Show the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ApplicationError> {
        toml::to_string_pretty(self).map_err(|e| ApplicationError::Config {
            message: format!("serialize config: {e}"),
        })
    }

    /// Generate a template config file.
    pub fn template() -> String {
        r#"# mindmap configuration
#
# Locations (by precedence, lowest to highest):
#   Global: ~/.config/mindmap/mindmap.toml  (defines your baseline)
#   Local:  <map_dir>/.mindmap.toml         (per-directory additions)
#   Env:    MINDMAP_* environment variables (explicit overrides)
#
# Array Merge Semantics:
#   Global config REPLACES compiled defaults.
#   Local config UNIONS with global; "!item" removes an inherited item:
#     known_legacy_versions = ["0.8.0", "!0.7.1"]

# User name written into lock files (default: $USER)
# user_name = "alice"

# Locks from other hosts older than this count as stale
# lock_stale_after_secs = 600

# Legacy document versions parsed without conversion
# known_legacy_versions = ["0.7.1"]

# Unknown document versions: "ask", "convert" or "as_is"
# convert_unknown_versions = "ask"

# Write node IDs only where a link points to the node
# save_only_intrinsically_needed_ids = false

# Rule file replacing the built-in migration rules
# migration_rules = "~/.config/mindmap/version_updater.toml"

# Store for remembered answers ("don't ask again")
# preferences_file = "~/.local/share/mindmap/preferences.toml"
"#
        .to_string()
    }
}

fn config_err(e: ConfigError) -> ApplicationError {
    ApplicationError::Config {
        message: e.to_string(),
    }
}
