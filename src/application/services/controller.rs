//! Editing operations on an open map
//!
//! [`MapController`] owns one [`Map`] and layers document bookkeeping over
//! the tree operations: write protection of read-only maps, the encryption
//! access check, focus handling and the save/close cycle. Saving and locking
//! are delegated to the [`ControllerStrategy`] it is built with.

use std::sync::Arc;

use generational_arena::Index;
use tracing::{debug, info, instrument, warn};

use crate::application::services::{LockManager, MapPersistence};
use crate::application::{ApplicationError, ApplicationResult};
use crate::domain::{
    DomainError, EncryptionState, Extension, ExtensionKind, LockState, Map, MapChangeListener,
    NodeData, ShiftDirection, Side,
};

/// Collaborators that differ between kinds of maps.
#[derive(Clone)]
pub struct ControllerStrategy {
    pub persistence: Arc<dyn MapPersistence>,
    /// None for maps that are never locked (e.g. memory-only maps)
    pub locks: Option<Arc<LockManager>>,
}

/// Where [`MapController::add_new_node`] puts the new node, relative to the focus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewNodeMode {
    /// Last child of the focused node; focus moves to it
    Child,
    /// Last child of the focused node; focus stays
    ChildWithoutFocus,
    SiblingBefore,
    SiblingAfter,
}

pub struct MapController {
    map: Map,
    strategy: ControllerStrategy,
    focus: Option<Index>,
}

impl MapController {
    pub fn new(map: Map, strategy: ControllerStrategy) -> Self {
        let focus = map.root();
        Self {
            map,
            strategy,
            focus,
        }
    }

    pub fn map(&self) -> &Map {
        &self.map
    }

    pub fn into_map(self) -> Map {
        self.map
    }

    pub fn add_listener(&mut self, listener: Arc<dyn MapChangeListener>) {
        self.map.add_listener(listener);
    }

    pub fn focus(&self) -> Option<Index> {
        self.focus
    }

    pub fn set_focus(&mut self, node: Index) -> ApplicationResult<()> {
        if !self.map.tree().contains(node) {
            return Err(DomainError::UnknownNode(format!("{:?}", node)).into());
        }
        self.focus = Some(node);
        Ok(())
    }

    // ============================================================
    // Node creation
    // ============================================================

    /// Add a node relative to the focused node (the root when nothing is focused).
    ///
    /// A sibling of the root cannot exist, so sibling modes on the root add a child.
    #[instrument(level = "debug", skip(self, text))]
    pub fn add_new_node(
        &mut self,
        mode: NewNodeMode,
        text: impl Into<String>,
    ) -> ApplicationResult<Index> {
        let focus = match self.focus {
            Some(f) => f,
            None => self.map.require_root()?,
        };
        let tree = self.map.tree();

        let (parent, index, side) = match (mode, tree.position(focus)) {
            (NewNodeMode::SiblingBefore, Some((parent, i))) => {
                (parent, i, tree.effective_side(focus))
            }
            (NewNodeMode::SiblingAfter, Some((parent, i))) => {
                (parent, i + 1, tree.effective_side(focus))
            }
            _ => (focus, tree.child_count(focus)?, None),
        };

        if self.map.tree().data(parent)?.folded {
            self.map.set_folded(parent, false)?;
        }
        let node = self.add_new_node_at(parent, index, text, side)?;
        if mode != NewNodeMode::ChildWithoutFocus {
            self.focus = Some(node);
        }
        Ok(node)
    }

    /// Add a node below `parent` at `index`.
    ///
    /// `side` is used for children of the root only; without one the node
    /// goes to the side with fewer branches.
    #[instrument(level = "debug", skip(self, text))]
    pub fn add_new_node_at(
        &mut self,
        parent: Index,
        index: usize,
        text: impl Into<String>,
        side: Option<Side>,
    ) -> ApplicationResult<Index> {
        self.ensure_writable()?;
        self.ensure_accessible(parent)?;

        let mut data = NodeData::new(text);
        if self.map.root() == Some(parent) {
            data.side = Some(side.unwrap_or_else(|| self.map.tree().lighter_side(None)));
        }
        let id = data.id.clone();
        let node = self.map.create_node(data);
        if let Err(e) = self.map.insert_node(node, parent, index) {
            self.map.discard_node(node)?;
            return Err(e.into());
        }
        debug!("add_new_node_at: {} at {}", id, index);
        self.keep_lock_alive();
        Ok(node)
    }

    // ============================================================
    // Structural edits
    // ============================================================

    /// Detach `node` from the tree; returns its former index.
    ///
    /// The detached subtree stays in the map so it can be inserted again.
    #[instrument(level = "debug", skip(self))]
    pub fn delete_node(&mut self, node: Index) -> ApplicationResult<usize> {
        self.ensure_writable()?;
        let Some((parent, _)) = self.map.tree().position(node) else {
            if self.map.root() == Some(node) {
                return Err(DomainError::CannotDeleteRoot.into());
            }
            return Err(DomainError::UnknownNode(self.map.tree().label(node)).into());
        };
        self.ensure_accessible(parent)?;

        let focus_inside = self
            .focus
            .is_some_and(|f| self.map.tree().is_in_subtree(f, node));
        let index = self.map.remove_node(parent, node)?;
        if focus_inside {
            self.focus = Some(parent);
        }
        self.keep_lock_alive();
        Ok(index)
    }

    /// Move `node` below `new_parent`; returns the effective index.
    pub fn move_node(
        &mut self,
        node: Index,
        new_parent: Index,
        new_index: usize,
    ) -> ApplicationResult<usize> {
        self.ensure_writable()?;
        if let Some(old_parent) = self.map.tree().parent(node) {
            self.ensure_accessible(old_parent)?;
        }
        self.ensure_accessible(new_parent)?;
        let index = self.map.move_node(node, new_parent, new_index)?;
        self.keep_lock_alive();
        Ok(index)
    }

    /// Move `node` one step up or down among its same-side siblings.
    pub fn shift_node(&mut self, node: Index, direction: ShiftDirection) -> ApplicationResult<usize> {
        self.ensure_writable()?;
        if let Some(parent) = self.map.tree().parent(node) {
            self.ensure_accessible(parent)?;
        }
        let index = self.map.shift_node(node, direction)?;
        self.keep_lock_alive();
        Ok(index)
    }

    pub fn set_node_text(&mut self, node: Index, text: impl Into<String>) -> ApplicationResult<()> {
        self.ensure_writable()?;
        self.ensure_accessible(node)?;
        self.map.set_node_text(node, text)?;
        self.keep_lock_alive();
        Ok(())
    }

    // ============================================================
    // Folding
    // ============================================================

    /// Folding is allowed on read-only maps; unfolding a locked node is not.
    pub fn set_folded(&mut self, node: Index, folded: bool) -> ApplicationResult<()> {
        if !folded {
            self.ensure_accessible(node)?;
        }
        Ok(self.map.set_folded(node, folded)?)
    }

    pub fn toggle_folded(&mut self, node: Index) -> ApplicationResult<bool> {
        let folded = !self.map.tree().data(node)?.folded;
        self.set_folded(node, folded)?;
        Ok(folded)
    }

    /// Fold all children of `node` that have children, or unfold them all if
    /// they are already folded.
    pub fn toggle_children_folded(&mut self, node: Index) -> ApplicationResult<()> {
        let tree = self.map.tree();
        let branches: Vec<Index> = tree
            .children(node)
            .iter()
            .copied()
            .filter(|&c| !tree.children(c).is_empty())
            .collect();
        let fold = branches
            .iter()
            .any(|&c| tree.data(c).map(|d| !d.folded).unwrap_or(false));
        for child in branches {
            self.set_folded(child, fold)?;
        }
        Ok(())
    }

    // ============================================================
    // Encryption
    // ============================================================

    /// Protect `node` with `password`. The node stays unlocked.
    pub fn encrypt_node(&mut self, node: Index, password: &str) -> ApplicationResult<()> {
        if !self.map.is_encryption_capable() {
            return Err(ApplicationError::Unsupported(format!(
                "encryption in map '{}'",
                self.map.title()
            )));
        }
        self.ensure_writable()?;
        self.ensure_accessible(node)?;
        self.map
            .put_extension(node, Extension::Encryption(EncryptionState::with_password(password)))?;
        self.keep_lock_alive();
        Ok(())
    }

    /// Drop the protection of `node`. Returns false when the password does not match.
    pub fn remove_encryption(&mut self, node: Index, password: &str) -> ApplicationResult<bool> {
        self.ensure_writable()?;
        let label = self.map.tree().label(node);
        let Some(state) = self.map.extensions(node)?.encryption() else {
            return Err(ApplicationError::Unsupported(format!(
                "decryption of unencrypted node '{}'",
                label
            )));
        };
        if !state.matches(password) {
            warn!("remove_encryption: wrong password for '{}'", label);
            return Ok(false);
        }
        self.map.remove_extension(node, ExtensionKind::Encryption)?;
        self.keep_lock_alive();
        Ok(true)
    }

    /// Returns false when the password does not match.
    pub fn unlock_node(&mut self, node: Index, password: &str) -> ApplicationResult<bool> {
        let label = self.map.tree().label(node);
        let Some(state) = self.map.encryption_mut(node)? else {
            return Err(ApplicationError::Unsupported(format!(
                "unlock of unencrypted node '{}'",
                label
            )));
        };
        let unlocked = state.unlock(password);
        if !unlocked {
            warn!("unlock_node: wrong password for '{}'", label);
        }
        Ok(unlocked)
    }

    /// Lock an encrypted node again and fold it.
    pub fn lock_node(&mut self, node: Index) -> ApplicationResult<()> {
        match self.map.encryption_mut(node)? {
            Some(state) => state.lock(),
            None => return Ok(()),
        }
        if !self.map.tree().children(node).is_empty() {
            self.map.set_folded(node, true)?;
        }
        Ok(())
    }

    // ============================================================
    // Icons
    // ============================================================

    pub fn add_icon(&mut self, node: Index, name: &str) -> ApplicationResult<()> {
        self.ensure_writable()?;
        self.ensure_accessible(node)?;
        let mut icons = self.map.extensions(node)?.icons().cloned().unwrap_or_default();
        icons.add(name);
        self.map.put_extension(node, Extension::Icons(icons))?;
        self.keep_lock_alive();
        Ok(())
    }

    /// Remove the last `name` icon of `node`; the icon set goes with its last icon.
    pub fn remove_icon(&mut self, node: Index, name: &str) -> ApplicationResult<bool> {
        self.ensure_writable()?;
        self.ensure_accessible(node)?;
        let Some(mut icons) = self.map.extensions(node)?.icons().cloned() else {
            return Ok(false);
        };
        if !icons.remove(name) {
            return Ok(false);
        }
        if icons.is_empty() {
            self.map.remove_extension(node, ExtensionKind::Icons)?;
        } else {
            self.map.put_extension(node, Extension::Icons(icons))?;
        }
        self.keep_lock_alive();
        Ok(true)
    }

    // ============================================================
    // Save and close
    // ============================================================

    pub fn save(&mut self) -> ApplicationResult<bool> {
        let saved = self.strategy.persistence.save(&mut self.map)?;
        if saved {
            self.refresh_lock();
        }
        Ok(saved)
    }

    /// Close the map, saving it first unless `force` is set.
    ///
    /// Returns false if the save was refused; the map stays open and locked.
    #[instrument(level = "debug", skip(self))]
    pub fn close(&mut self, force: bool) -> ApplicationResult<bool> {
        if !force && !self.map.is_saved() && !self.strategy.persistence.save(&mut self.map)? {
            info!("close: save of '{}' refused, keeping map open", self.map.title());
            return Ok(false);
        }
        self.release_lock()?;
        Ok(true)
    }

    // ============================================================
    // Helpers
    // ============================================================

    fn ensure_writable(&self) -> ApplicationResult<()> {
        if self.map.is_read_only() {
            return Err(ApplicationError::ReadOnlyMap(self.map.title()));
        }
        Ok(())
    }

    fn ensure_accessible(&self, node: Index) -> ApplicationResult<()> {
        self.map.data(node)?;
        if !self.map.is_accessible(node) {
            return Err(DomainError::NodeLocked(self.map.tree().label(node)).into());
        }
        Ok(())
    }

    fn refresh_lock(&self) {
        if let (Some(locks), Some(file), LockState::Owned) = (
            self.strategy.locks.as_ref(),
            self.map.file(),
            self.map.lock_state(),
        ) {
            if let Err(e) = locks.refresh(file) {
                warn!("save: cannot refresh lock of {}: {}", file.display(), e);
            }
        }
    }

    /// Heartbeat for long sessions: edits renew an owned lock that is due.
    fn keep_lock_alive(&self) {
        if let (Some(locks), Some(file), LockState::Owned) = (
            self.strategy.locks.as_ref(),
            self.map.file(),
            self.map.lock_state(),
        ) {
            if let Err(e) = locks.keep_alive(file) {
                warn!("keep_lock_alive: cannot refresh lock of {}: {}", file.display(), e);
            }
        }
    }

    fn release_lock(&mut self) -> ApplicationResult<()> {
        if *self.map.lock_state() != LockState::Owned {
            return Ok(());
        }
        if let (Some(locks), Some(file)) = (self.strategy.locks.as_ref(), self.map.file()) {
            locks.release(file)?;
        }
        self.map.set_lock_state(LockState::Unlocked);
        Ok(())
    }
}
