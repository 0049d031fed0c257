//! Version detection and migration of map documents before parsing
//!
//! Current and known legacy documents are handed to the parser unchanged.
//! For unknown versions a [`ConversionPolicy`] decides between running the
//! [`DocumentTransform`] and parsing as-is; with the `ask` policy the
//! [`ConversionPrompt`] is consulted and may remember the answer.

use std::borrow::Cow;
use std::io::{BufRead, Cursor};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::application::{ApplicationError, ApplicationResult, IoResultExt};
use crate::config::{ConversionPolicy, Settings};
use crate::domain::{DocumentTransform, RuleTransform, VersionClass, VersionDetector};
use crate::infrastructure::traits::FileSystem;
use crate::preferences::{Preferences, CONVERT_TO_CURRENT_VERSION};

/// Answer to the unknown-version question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionChoice {
    /// Run the migration transform (otherwise parse as-is)
    pub convert: bool,
    /// Don't ask again: store the answer as the new policy
    pub remember: bool,
}

/// Asks the user how to treat a document of unknown version.
pub trait ConversionPrompt: Send + Sync {
    /// Returns None if the user cancels.
    fn ask(&self, file: &Path, class: &VersionClass) -> ApplicationResult<Option<ConversionChoice>>;
}

/// A document ready for the parser.
///
/// Owns the underlying reader; dropping the value closes the file.
pub struct PreparedDocument {
    pub class: VersionClass,
    pub converted: bool,
    reader: Box<dyn BufRead + Send>,
}

impl PreparedDocument {
    pub fn into_reader(self) -> Box<dyn BufRead + Send> {
        self.reader
    }
}

impl std::fmt::Debug for PreparedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedDocument")
            .field("class", &self.class)
            .field("converted", &self.converted)
            .finish()
    }
}

/// Build the migration transform: the configured rule file, or the built-in one.
pub fn load_transform(
    fs: &dyn FileSystem,
    settings: &Settings,
) -> ApplicationResult<Arc<dyn DocumentTransform>> {
    match settings.migration_rules.as_deref() {
        Some(path) => {
            let text = fs
                .read_to_string(path)
                .with_path_context("read migration rules", path)?;
            let transform = RuleTransform::from_toml(path.display().to_string(), &text)?;
            Ok(Arc::new(transform))
        }
        None => Ok(Arc::new(RuleTransform::builtin()?)),
    }
}

pub struct VersionMigrator {
    fs: Arc<dyn FileSystem>,
    detector: VersionDetector,
    transform: Arc<dyn DocumentTransform>,
    preferences: Arc<Preferences>,
    prompt: Arc<dyn ConversionPrompt>,
}

impl VersionMigrator {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        settings: &Settings,
        transform: Arc<dyn DocumentTransform>,
        preferences: Arc<Preferences>,
        prompt: Arc<dyn ConversionPrompt>,
    ) -> Self {
        Self {
            fs,
            detector: VersionDetector::new(settings.known_legacy_versions.iter().cloned()),
            transform,
            preferences,
            prompt,
        }
    }

    /// Swap the migration transform.
    pub fn with_transform(mut self, transform: Arc<dyn DocumentTransform>) -> Self {
        self.transform = transform;
        self
    }

    pub fn detector(&self) -> &VersionDetector {
        &self.detector
    }

    pub fn transform(&self) -> &dyn DocumentTransform {
        self.transform.as_ref()
    }

    /// Classify a file from its first bytes only.
    #[instrument(level = "debug", skip(self))]
    pub fn classify_file(&self, path: &Path) -> ApplicationResult<VersionClass> {
        let prefix = self
            .fs
            .read_prefix(path, self.detector.prefix_len())
            .with_path_context("read document header", path)?;
        Ok(self.detector.classify(&prefix))
    }

    /// Policy in effect for unknown versions, including remembered answers.
    pub fn policy(&self) -> ConversionPolicy {
        self.preferences
            .get(CONVERT_TO_CURRENT_VERSION)
            .and_then(|v| ConversionPolicy::parse(&v))
            .unwrap_or_default()
    }

    /// Decide whether an unknown-version document gets converted.
    pub fn decide(&self, file: &Path, class: &VersionClass) -> ApplicationResult<bool> {
        match self.policy() {
            ConversionPolicy::Convert => Ok(true),
            ConversionPolicy::AsIs => Ok(false),
            ConversionPolicy::Ask => {
                let choice = self.prompt.ask(file, class)?.ok_or_else(|| {
                    ApplicationError::Cancelled(format!("conversion of {}", file.display()))
                })?;
                if choice.remember {
                    let policy = if choice.convert {
                        ConversionPolicy::Convert
                    } else {
                        ConversionPolicy::AsIs
                    };
                    info!("decide: remembering '{}' for unknown versions", policy);
                    if let Err(e) = self
                        .preferences
                        .set(CONVERT_TO_CURRENT_VERSION, policy.as_str())
                    {
                        warn!("decide: cannot remember '{}': {}", policy, e);
                    }
                }
                Ok(choice.convert)
            }
        }
    }

    /// Open `path` as a parseable stream, converting it if required.
    #[instrument(level = "debug", skip(self))]
    pub fn open(&self, path: &Path) -> ApplicationResult<PreparedDocument> {
        let class = self.classify_file(path)?;
        let convert = class.needs_decision() && self.decide(path, &class)?;

        let reader: Box<dyn BufRead + Send> = if convert {
            let raw = self
                .fs
                .read(path)
                .with_path_context("read document", path)?;
            info!(
                "open: converting {} ({}) with {}",
                path.display(),
                class,
                self.transform.name()
            );
            Box::new(Cursor::new(self.transform.transform(&raw)?))
        } else {
            self.fs
                .open_read(path)
                .with_path_context("open document", path)?
        };
        debug!("open: {} classified as {}", path.display(), class);

        Ok(PreparedDocument {
            class,
            converted: convert,
            reader,
        })
    }

    /// Bring a document to the current format without asking.
    ///
    /// Current and known legacy documents are returned unchanged, so running
    /// this on its own output is a no-op.
    pub fn migrate<'a>(&self, document: &'a [u8]) -> ApplicationResult<Cow<'a, [u8]>> {
        let prefix_len = self.detector.prefix_len().min(document.len());
        match self.detector.classify(&document[..prefix_len]) {
            VersionClass::Unknown { declared } => {
                debug!("migrate: converting document declaring {:?}", declared);
                Ok(Cow::Owned(self.transform.transform(document)?))
            }
            class => {
                debug!("migrate: {} needs no conversion", class);
                Ok(Cow::Borrowed(document))
            }
        }
    }
}
