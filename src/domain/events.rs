//! Change notification for map mutations.
//!
//! Every structural mutation produces a pre-event before the tree changes and a
//! post-event after it, each carrying enough positions (parent and index before
//! and after) for an undo log to reverse the change. Listeners only see event
//! data, never the tree, so they cannot mutate the map from inside a
//! notification; follow-up work has to be queued by the listener.

use std::sync::Arc;

use generational_arena::Index;

/// Content property of a node that changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeProperty {
    Text,
}

/// Domain events emitted by a [`crate::domain::Map`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapEvent {
    PreNodeInsert {
        node: Index,
        parent: Index,
        index: usize,
    },
    NodeInserted {
        node: Index,
        parent: Index,
        index: usize,
    },
    /// Fired while the node is still attached at `index`
    PreNodeDelete {
        node: Index,
        parent: Index,
        index: usize,
    },
    /// Fired after the node is detached; `index` is its former position
    NodeDeleted {
        node: Index,
        parent: Index,
        index: usize,
    },
    PreNodeMove {
        node: Index,
        old_parent: Index,
        old_index: usize,
        new_parent: Index,
        new_index: usize,
    },
    NodeMoved {
        node: Index,
        old_parent: Index,
        old_index: usize,
        new_parent: Index,
        new_index: usize,
    },
    FoldChanged {
        node: Index,
        folded: bool,
    },
    NodeChanged {
        node: Index,
        property: NodeProperty,
        old_value: String,
        new_value: String,
    },
    /// The dirty flag flipped; `saved` is the new state
    SavedChanged {
        saved: bool,
    },
}

impl MapEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            MapEvent::PreNodeInsert { .. } => "node:pre-insert",
            MapEvent::NodeInserted { .. } => "node:inserted",
            MapEvent::PreNodeDelete { .. } => "node:pre-delete",
            MapEvent::NodeDeleted { .. } => "node:deleted",
            MapEvent::PreNodeMove { .. } => "node:pre-move",
            MapEvent::NodeMoved { .. } => "node:moved",
            MapEvent::FoldChanged { .. } => "node:fold",
            MapEvent::NodeChanged { .. } => "node:changed",
            MapEvent::SavedChanged { .. } => "map:saved",
        }
    }
}

/// Receives map events synchronously on the mutating call path.
pub trait MapChangeListener: Send + Sync {
    fn map_changed(&self, event: &MapEvent);
}

/// Ordered set of listeners registered on a map.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Vec<Arc<dyn MapChangeListener>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, listener: Arc<dyn MapChangeListener>) {
        self.listeners.push(listener);
    }

    /// Remove a listener by identity. Returns false if it was not registered.
    pub fn remove(&mut self, listener: &Arc<dyn MapChangeListener>) -> bool {
        let before = self.listeners.len();
        let target = Arc::as_ptr(listener) as *const ();
        self.listeners
            .retain(|l| !std::ptr::eq(Arc::as_ptr(l) as *const (), target));
        self.listeners.len() != before
    }

    pub fn fire(&self, event: &MapEvent) {
        for listener in &self.listeners {
            listener.map_changed(event);
        }
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
