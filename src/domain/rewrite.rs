//! Declarative document rewrite used to convert foreign map documents.

use std::borrow::Cow;
use std::fmt;

use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::name::QName;
use quick_xml::{Reader, Writer};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::domain::error::{DomainError, DomainResult};
use crate::domain::version::CURRENT_VERSION;

const BUILTIN_RULES: &str = include_str!("../../rules/version_updater.toml");

/// A document-to-document rewrite applied before parsing.
pub trait DocumentTransform: Send + Sync {
    /// Name for logs and messages.
    fn name(&self) -> &str;

    fn transform(&self, document: &[u8]) -> DomainResult<Vec<u8>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ElementRename {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttributeRename {
    /// Restrict to this element (name after element renames)
    #[serde(default)]
    pub element: Option<String>,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttributeDrop {
    #[serde(default)]
    pub element: Option<String>,
    pub name: String,
}

/// Rule file contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RewriteRules {
    /// Force `<map version>` to the current version
    #[serde(default)]
    pub set_version: bool,
    #[serde(default)]
    pub drop_elements: Vec<String>,
    #[serde(default)]
    pub rename_element: Vec<ElementRename>,
    #[serde(default)]
    pub rename_attribute: Vec<AttributeRename>,
    #[serde(default)]
    pub drop_attribute: Vec<AttributeDrop>,
}

impl RewriteRules {
    pub fn from_toml(text: &str) -> DomainResult<Self> {
        toml::from_str(text).map_err(|e| DomainError::InvalidRules {
            message: e.to_string(),
        })
    }

    fn element_name<'a>(&'a self, source: &'a [u8]) -> &'a [u8] {
        self.rename_element
            .iter()
            .find(|r| r.from.as_bytes() == source)
            .map(|r| r.to.as_bytes())
            .unwrap_or(source)
    }

    fn is_dropped_element(&self, source: &[u8]) -> bool {
        self.drop_elements.iter().any(|d| d.as_bytes() == source)
    }

    /// New attribute name, or None if the attribute is dropped.
    fn attribute_name<'a>(&'a self, element: &[u8], key: &'a [u8]) -> Option<&'a [u8]> {
        let scoped = |scope: &Option<String>| {
            scope
                .as_deref()
                .map_or(true, |s| s.as_bytes() == element)
        };
        let renamed = self
            .rename_attribute
            .iter()
            .find(|r| r.from.as_bytes() == key && scoped(&r.element))
            .map(|r| r.to.as_bytes())
            .unwrap_or(key);
        let dropped = self
            .drop_attribute
            .iter()
            .any(|d| scoped(&d.element) && (d.name.as_bytes() == key || d.name.as_bytes() == renamed));
        (!dropped).then_some(renamed)
    }
}

/// [`DocumentTransform`] driven by a [`RewriteRules`] table.
///
/// Streams the document once; text, comments and attribute values pass
/// through byte for byte.
#[derive(Debug, Clone)]
pub struct RuleTransform {
    name: String,
    rules: RewriteRules,
}

impl RuleTransform {
    pub fn new(name: impl Into<String>, rules: RewriteRules) -> Self {
        Self {
            name: name.into(),
            rules,
        }
    }

    /// The rule file compiled into the crate.
    pub fn builtin() -> DomainResult<Self> {
        Self::from_toml("builtin:version_updater", BUILTIN_RULES)
    }

    pub fn from_toml(name: impl Into<String>, text: &str) -> DomainResult<Self> {
        Ok(Self::new(name, RewriteRules::from_toml(text)?))
    }

    pub fn rules(&self) -> &RewriteRules {
        &self.rules
    }

    fn rewrite_start(&self, e: &BytesStart) -> DomainResult<BytesStart<'static>> {
        let source = e.name();
        let name = self.rules.element_name(source.as_ref());
        let is_map = name == b"map";
        let mut out = BytesStart::new(String::from_utf8_lossy(name).into_owned());

        let mut saw_version = false;
        for attr in e.attributes() {
            let attr = attr.map_err(|err| {
                DomainError::invalid_document(format!("attribute error: {}", err))
            })?;
            let Some(key) = self.rules.attribute_name(name, attr.key.as_ref()) else {
                continue;
            };
            let value: Cow<[u8]> = if is_map && key == b"version" && self.rules.set_version {
                saw_version = true;
                Cow::Borrowed(CURRENT_VERSION.as_bytes())
            } else {
                attr.value
            };
            out.push_attribute((key, value.as_ref()));
        }
        if is_map && self.rules.set_version && !saw_version {
            out.push_attribute(("version", CURRENT_VERSION));
        }
        Ok(out)
    }
}

impl DocumentTransform for RuleTransform {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(level = "debug", skip(self, document), fields(transform = %self.name, len = document.len()))]
    fn transform(&self, document: &[u8]) -> DomainResult<Vec<u8>> {
        let mut reader = Reader::from_reader(document);
        let mut writer = Writer::new(Vec::with_capacity(document.len()));
        let mut buf = Vec::new();
        let mut skip_buf = Vec::new();
        let mut dropped = 0usize;

        loop {
            let event = reader
                .read_event_into(&mut buf)
                .map_err(|e| xml_error(reader.buffer_position(), e))?;
            match event {
                Event::Start(ref e) if self.rules.is_dropped_element(e.name().as_ref()) => {
                    let name = e.name().as_ref().to_vec();
                    reader
                        .read_to_end_into(QName(&name), &mut skip_buf)
                        .map_err(|e| xml_error(reader.buffer_position(), e))?;
                    skip_buf.clear();
                    dropped += 1;
                }
                Event::Empty(ref e) if self.rules.is_dropped_element(e.name().as_ref()) => {
                    dropped += 1;
                }
                Event::Start(ref e) => {
                    let out = self.rewrite_start(e)?;
                    write(&mut writer, Event::Start(out))?;
                }
                Event::Empty(ref e) => {
                    let out = self.rewrite_start(e)?;
                    write(&mut writer, Event::Empty(out))?;
                }
                Event::End(ref e) => {
                    let source = e.name();
                    let name = self.rules.element_name(source.as_ref());
                    let end = BytesEnd::new(String::from_utf8_lossy(name).into_owned());
                    write(&mut writer, Event::End(end))?;
                }
                Event::Eof => break,
                other => write(&mut writer, other)?,
            }
            buf.clear();
        }

        debug!("transform: dropped {} element(s)", dropped);
        Ok(writer.into_inner())
    }
}

impl fmt::Display for RuleTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

fn xml_error(position: usize, e: quick_xml::Error) -> DomainError {
    DomainError::invalid_document(format!("XML error at byte {}: {}", position, e))
}

fn write(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> DomainResult<()> {
    writer
        .write_event(event)
        .map_err(|e| DomainError::invalid_document(format!("XML write error: {}", e)))
}
