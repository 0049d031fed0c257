//! The map document: tree plus document-level state.
//!
//! Every structural or content mutation goes through [`Map`], which validates
//! it, marks the map unsaved, fires the pre-event, applies the change to the
//! tree and fires the post-event, in that order.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use generational_arena::Index;
use tracing::debug;

use crate::domain::arena::{MapTree, ShiftDirection};
use crate::domain::entities::NodeData;
use crate::domain::error::{DomainError, DomainResult};
use crate::domain::events::{ListenerRegistry, MapChangeListener, MapEvent, NodeProperty};
use crate::domain::extension::{EncryptionState, Extension, ExtensionKind, Extensions};

/// Ownership of the map file's advisory lock.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LockState {
    /// No lock taken (memory-only map or read-only file)
    #[default]
    Unlocked,
    /// This session holds the lock
    Owned,
    /// Another session holds the lock
    HeldBy(String),
    /// Locking failed for an unexpected reason
    Failed,
}

#[derive(Debug)]
pub struct Map {
    tree: MapTree,
    file: Option<PathBuf>,
    saved: bool,
    read_only: bool,
    lock_state: LockState,
    encryption_capable: bool,
    listeners: ListenerRegistry,
}

impl Map {
    /// New memory-only map with a single root node.
    pub fn new(root: NodeData) -> Self {
        Self::from_tree(MapTree::with_root(root))
    }

    /// Map without root, to be filled by a loader.
    pub fn empty() -> Self {
        Self::from_tree(MapTree::new())
    }

    pub fn from_tree(tree: MapTree) -> Self {
        Self {
            tree,
            file: None,
            saved: true,
            read_only: false,
            lock_state: LockState::Unlocked,
            encryption_capable: true,
            listeners: ListenerRegistry::new(),
        }
    }

    pub fn tree(&self) -> &MapTree {
        &self.tree
    }

    /// Replace the tree, e.g. with the result of parsing a document.
    pub fn set_tree(&mut self, tree: MapTree) {
        self.tree = tree;
    }

    pub fn root(&self) -> Option<Index> {
        self.tree.root()
    }

    pub fn require_root(&self) -> DomainResult<Index> {
        self.tree.root().ok_or(DomainError::NoRoot)
    }

    pub fn data(&self, node: Index) -> DomainResult<&NodeData> {
        self.tree.data(node)
    }

    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    pub fn set_file(&mut self, file: Option<PathBuf>) {
        self.file = file;
    }

    /// File name, or the root text for memory-only maps.
    pub fn title(&self) -> String {
        if let Some(name) = self.file.as_ref().and_then(|f| f.file_name()) {
            return name.to_string_lossy().to_string();
        }
        self.root()
            .and_then(|r| self.tree.data(r).ok())
            .map(|d| d.text.clone())
            .unwrap_or_default()
    }

    pub fn is_saved(&self) -> bool {
        self.saved
    }

    /// Set the dirty flag; fires `SavedChanged` only on a transition.
    pub fn set_saved(&mut self, saved: bool) {
        if self.saved != saved {
            self.saved = saved;
            self.listeners.fire(&MapEvent::SavedChanged { saved });
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub fn lock_state(&self) -> &LockState {
        &self.lock_state
    }

    pub fn set_lock_state(&mut self, state: LockState) {
        self.lock_state = state;
    }

    pub fn is_encryption_capable(&self) -> bool {
        self.encryption_capable
    }

    pub fn set_encryption_capable(&mut self, capable: bool) {
        self.encryption_capable = capable;
    }

    pub fn add_listener(&mut self, listener: Arc<dyn MapChangeListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&mut self, listener: &Arc<dyn MapChangeListener>) -> bool {
        self.listeners.remove(listener)
    }

    /// True unless `node` or one of its ancestors is encrypted and locked.
    pub fn is_accessible(&self, node: Index) -> bool {
        let mut current = Some(node);
        while let Some(idx) = current {
            match self.tree.data(idx) {
                Ok(data) if !data.is_accessible() => return false,
                _ => {}
            }
            current = self.tree.parent(idx);
        }
        true
    }

    // ============================================================
    // Mutations
    // ============================================================

    /// Create a detached node owned by this map.
    pub fn create_node(&mut self, data: NodeData) -> Index {
        self.tree.create_node(data)
    }

    pub fn insert_node(&mut self, node: Index, parent: Index, index: usize) -> DomainResult<()> {
        self.tree.check_insert(parent, index, node)?;
        self.set_saved(false);
        self.listeners.fire(&MapEvent::PreNodeInsert {
            node,
            parent,
            index,
        });
        self.tree.insert(parent, index, node)?;
        self.listeners.fire(&MapEvent::NodeInserted {
            node,
            parent,
            index,
        });
        Ok(())
    }

    /// Detach `node` from `parent`; returns its former index.
    pub fn remove_node(&mut self, parent: Index, node: Index) -> DomainResult<usize> {
        let index = self.tree.check_remove(parent, node)?;
        self.set_saved(false);
        self.listeners.fire(&MapEvent::PreNodeDelete {
            node,
            parent,
            index,
        });
        self.tree.remove(parent, node)?;
        self.listeners.fire(&MapEvent::NodeDeleted {
            node,
            parent,
            index,
        });
        Ok(index)
    }

    /// Move `node` below `new_parent`; returns the effective index.
    pub fn move_node(
        &mut self,
        node: Index,
        new_parent: Index,
        new_index: usize,
    ) -> DomainResult<usize> {
        let (old_parent, old_index) = self.tree.check_move(node, new_parent, new_index)?;
        self.set_saved(false);
        self.listeners.fire(&MapEvent::PreNodeMove {
            node,
            old_parent,
            old_index,
            new_parent,
            new_index,
        });
        let outcome = self.tree.move_node(node, new_parent, new_index)?;
        debug!(
            "move_node: {} from {:?}[{}] to {:?}[{}]",
            self.tree.label(node),
            outcome.old_parent,
            outcome.old_index,
            new_parent,
            outcome.new_index
        );
        self.listeners.fire(&MapEvent::NodeMoved {
            node,
            old_parent: outcome.old_parent,
            old_index: outcome.old_index,
            new_parent,
            new_index: outcome.new_index,
        });
        Ok(outcome.new_index)
    }

    /// Move `node` up or down among its same-side siblings; returns the new index.
    pub fn shift_node(&mut self, node: Index, direction: ShiftDirection) -> DomainResult<usize> {
        let (parent, old_index, new_index) = self.tree.shift_target(node, direction)?;
        if old_index == new_index {
            return Ok(old_index);
        }
        self.move_node(node, parent, new_index)
    }

    /// Change the fold flag. Folding is a view hint and leaves the dirty flag alone.
    pub fn set_folded(&mut self, node: Index, folded: bool) -> DomainResult<()> {
        let previous = self.tree.set_folded(node, folded)?;
        if previous != folded {
            self.listeners.fire(&MapEvent::FoldChanged { node, folded });
        }
        Ok(())
    }

    pub fn set_node_text(&mut self, node: Index, text: impl Into<String>) -> DomainResult<()> {
        let text = text.into();
        let old_value = self.tree.data(node)?.text.clone();
        if old_value == text {
            return Ok(());
        }
        self.set_saved(false);
        self.tree.data_mut(node)?.text = text.clone();
        self.listeners.fire(&MapEvent::NodeChanged {
            node,
            property: NodeProperty::Text,
            old_value,
            new_value: text,
        });
        Ok(())
    }

    /// Attach a capability to `node`; a content mutation.
    pub fn put_extension(&mut self, node: Index, extension: Extension) -> DomainResult<()> {
        self.tree.data(node)?;
        self.set_saved(false);
        self.tree.data_mut(node)?.extensions.put(extension);
        Ok(())
    }

    /// Detach the capability of `kind`; a content mutation when one was attached.
    pub fn remove_extension(
        &mut self,
        node: Index,
        kind: ExtensionKind,
    ) -> DomainResult<Option<Extension>> {
        if !self.tree.data(node)?.extensions.contains(kind) {
            return Ok(None);
        }
        self.set_saved(false);
        Ok(self.tree.data_mut(node)?.extensions.remove(kind))
    }

    pub fn extensions(&self, node: Index) -> DomainResult<&Extensions> {
        self.tree.data(node).map(|d| &d.extensions)
    }

    /// Encryption state of `node` for locking and unlocking; not a content mutation.
    pub fn encryption_mut(&mut self, node: Index) -> DomainResult<Option<&mut EncryptionState>> {
        self.tree
            .data_mut(node)
            .map(|d| d.extensions.encryption_mut())
    }

    /// Free a detached subtree that will not be reinserted.
    pub fn discard_node(&mut self, node: Index) -> DomainResult<usize> {
        self.tree.discard(node)
    }
}
