//! Document version classification from the first bytes of a map file.

use itertools::Itertools;
use regex::Regex;
use tracing::{debug, instrument};

/// Format version written by this crate.
pub const CURRENT_VERSION: &str = "0.9.0";

/// The one legacy format that parses without conversion.
pub const LEGACY_VERSION: &str = "0.7.1";

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Opening of a map document declaring `version`.
pub fn version_header(version: &str) -> String {
    format!("<map version=\"{}\"", version)
}

/// Outcome of inspecting a document header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionClass {
    Current,
    KnownLegacy(String),
    /// Foreign or unrecognised header; `declared` is the version attribute if one was found
    Unknown { declared: Option<String> },
}

impl VersionClass {
    pub fn is_current(&self) -> bool {
        matches!(self, VersionClass::Current)
    }

    /// Unknown documents need a convert / as-is decision before parsing.
    pub fn needs_decision(&self) -> bool {
        matches!(self, VersionClass::Unknown { .. })
    }

    pub fn version(&self) -> Option<&str> {
        match self {
            VersionClass::Current => Some(CURRENT_VERSION),
            VersionClass::KnownLegacy(v) => Some(v),
            VersionClass::Unknown { declared } => declared.as_deref(),
        }
    }
}

impl std::fmt::Display for VersionClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionClass::Current => write!(f, "current ({})", CURRENT_VERSION),
            VersionClass::KnownLegacy(v) => write!(f, "legacy ({})", v),
            VersionClass::Unknown { declared: Some(v) } => write!(f, "unknown ({})", v),
            VersionClass::Unknown { declared: None } => write!(f, "unknown"),
        }
    }
}

/// Matches a document prefix against an ordered list of version headers.
///
/// The current version is always tried first, then each known legacy version
/// in the configured order.
#[derive(Debug, Clone)]
pub struct VersionDetector {
    /// (version, header) pairs in match order
    headers: Vec<(String, String)>,
    declared_re: Option<Regex>,
}

impl Default for VersionDetector {
    fn default() -> Self {
        Self::new([LEGACY_VERSION])
    }
}

impl VersionDetector {
    pub fn new<I, S>(legacy_versions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let headers = std::iter::once(CURRENT_VERSION.to_string())
            .chain(legacy_versions.into_iter().map(Into::into))
            .unique()
            .map(|version| {
                let header = version_header(&version);
                (version, header)
            })
            .collect();
        Self {
            headers,
            declared_re: Regex::new(r#"<map\s+version\s*=\s*["']([^"']*)["']"#).ok(),
        }
    }

    /// Number of leading bytes classification needs to see.
    pub fn prefix_len(&self) -> usize {
        let longest = self.headers.iter().map(|(_, h)| h.len()).max().unwrap_or(0);
        longest + UTF8_BOM.len()
    }

    pub fn known_versions(&self) -> impl Iterator<Item = &str> {
        self.headers.iter().map(|(v, _)| v.as_str())
    }

    #[instrument(level = "debug", skip(self, prefix), fields(len = prefix.len()))]
    pub fn classify(&self, prefix: &[u8]) -> VersionClass {
        let prefix = prefix.strip_prefix(UTF8_BOM).unwrap_or(prefix);
        for (i, (version, header)) in self.headers.iter().enumerate() {
            if prefix.starts_with(header.as_bytes()) {
                debug!("classify: matched header for {}", version);
                return if i == 0 {
                    VersionClass::Current
                } else {
                    VersionClass::KnownLegacy(version.clone())
                };
            }
        }
        let declared = self.declared_version(prefix);
        debug!("classify: unknown header, declared={:?}", declared);
        VersionClass::Unknown { declared }
    }

    fn declared_version(&self, prefix: &[u8]) -> Option<String> {
        let text = String::from_utf8_lossy(prefix);
        self.declared_re
            .as_ref()?
            .captures(&text)
            .map(|c| c[1].to_string())
    }
}
