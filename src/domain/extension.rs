//! Node capabilities attached by kind.
//!
//! A node carries at most one capability of each [`ExtensionKind`]. The set of
//! kinds is closed; attaching a capability replaces any previous one of the
//! same kind.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

/// Discriminator for the capabilities a node can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExtensionKind {
    Encryption,
    Icons,
    Link,
}

/// A capability attached to a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extension {
    Encryption(EncryptionState),
    Icons(IconSet),
    Link(NodeLink),
}

impl Extension {
    pub fn kind(&self) -> ExtensionKind {
        match self {
            Extension::Encryption(_) => ExtensionKind::Encryption,
            Extension::Icons(_) => ExtensionKind::Icons,
            Extension::Link(_) => ExtensionKind::Link,
        }
    }
}

/// Password protection of a node's content.
///
/// Only the SHA-256 digest of the password is kept. A node whose state is not
/// accessible refuses content mutations until it is unlocked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionState {
    digest: String,
    accessible: bool,
}

impl EncryptionState {
    /// Protect with a new password; the node stays accessible.
    pub fn with_password(password: &str) -> Self {
        Self {
            digest: password_digest(password),
            accessible: true,
        }
    }

    /// Restore from a stored digest; the node starts locked.
    pub fn from_digest(digest: impl Into<String>) -> Self {
        Self {
            digest: digest.into(),
            accessible: false,
        }
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn is_accessible(&self) -> bool {
        self.accessible
    }

    pub fn matches(&self, password: &str) -> bool {
        password_digest(password) == self.digest
    }

    /// Returns true if the password matched and the node is now accessible.
    pub fn unlock(&mut self, password: &str) -> bool {
        if self.matches(password) {
            self.accessible = true;
        }
        self.accessible
    }

    pub fn lock(&mut self) {
        self.accessible = false;
    }
}

fn password_digest(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// Built-in icon names shown next to a node, in display order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IconSet {
    names: Vec<String>,
}

impl IconSet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn add(&mut self, name: impl Into<String>) {
        self.names.push(name.into());
    }

    /// Removes the last occurrence of `name`.
    pub fn remove(&mut self, name: &str) -> bool {
        match self.names.iter().rposition(|n| n == name) {
            Some(pos) => {
                self.names.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Hyperlink from a node to another node of the same map, by node id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLink {
    pub target: String,
}

impl NodeLink {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

/// The capability bag of a node, keyed by kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extensions {
    entries: BTreeMap<ExtensionKind, Extension>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a capability, returning the one it replaced.
    pub fn put(&mut self, extension: Extension) -> Option<Extension> {
        self.entries.insert(extension.kind(), extension)
    }

    pub fn get(&self, kind: ExtensionKind) -> Option<&Extension> {
        self.entries.get(&kind)
    }

    pub fn get_mut(&mut self, kind: ExtensionKind) -> Option<&mut Extension> {
        self.entries.get_mut(&kind)
    }

    pub fn remove(&mut self, kind: ExtensionKind) -> Option<Extension> {
        self.entries.remove(&kind)
    }

    pub fn contains(&self, kind: ExtensionKind) -> bool {
        self.entries.contains_key(&kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Extension> {
        self.entries.values()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encryption(&self) -> Option<&EncryptionState> {
        match self.get(ExtensionKind::Encryption) {
            Some(Extension::Encryption(state)) => Some(state),
            _ => None,
        }
    }

    pub fn encryption_mut(&mut self) -> Option<&mut EncryptionState> {
        match self.get_mut(ExtensionKind::Encryption) {
            Some(Extension::Encryption(state)) => Some(state),
            _ => None,
        }
    }

    pub fn icons(&self) -> Option<&IconSet> {
        match self.get(ExtensionKind::Icons) {
            Some(Extension::Icons(icons)) => Some(icons),
            _ => None,
        }
    }

    pub fn link(&self) -> Option<&NodeLink> {
        match self.get(ExtensionKind::Link) {
            Some(Extension::Link(link)) => Some(link),
            _ => None,
        }
    }
}
