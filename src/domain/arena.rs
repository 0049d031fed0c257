//! Arena-backed outline tree of a map.
//!
//! Nodes live in a generational arena and refer to each other by [`Index`].
//! The child vector of a node is the authoritative outline order; the `parent`
//! back-reference of every attached node mirrors it exactly. Node ids are
//! unique across the arena, detached nodes included.

use std::collections::HashSet;

use generational_arena::{Arena, Index};
use tracing::{instrument, trace, warn};

use crate::domain::entities::{generate_node_id, NodeData, Side};
use crate::domain::error::{DomainError, DomainResult};

/// Tree node in the arena-based map structure.
#[derive(Debug)]
pub struct TreeNode {
    /// Node payload
    pub data: NodeData,
    /// Index of parent node in the arena, None for the root and detached nodes
    pub parent: Option<Index>,
    /// Indices of child nodes in outline order
    pub children: Vec<Index>,
}

/// Direction for shifting a node among its siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftDirection {
    Up,
    Down,
}

/// Where a moved node came from and where it ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveOutcome {
    pub old_parent: Index,
    pub old_index: usize,
    pub new_index: usize,
}

/// Arena-based outline tree.
///
/// Detached nodes (removed, or created but not yet inserted) stay in the arena
/// until [`MapTree::discard`] frees them, so a removed subtree can be put back.
#[derive(Debug)]
pub struct MapTree {
    arena: Arena<TreeNode>,
    root: Option<Index>,
    ids: HashSet<String>,
}

impl Default for MapTree {
    fn default() -> Self {
        Self::new()
    }
}

impl MapTree {
    pub fn new() -> Self {
        Self {
            arena: Arena::new(),
            root: None,
            ids: HashSet::new(),
        }
    }

    pub fn with_root(data: NodeData) -> Self {
        let mut tree = Self::new();
        tree.set_root(data);
        tree
    }

    /// Replace the whole tree by a single root node.
    pub fn set_root(&mut self, data: NodeData) -> Index {
        self.arena.clear();
        self.ids.clear();
        self.ids.insert(data.id.clone());
        let idx = self.arena.insert(TreeNode {
            data,
            parent: None,
            children: Vec::new(),
        });
        self.root = Some(idx);
        idx
    }

    /// Create a detached node.
    ///
    /// An id already used by another node is replaced by a fresh one.
    #[instrument(level = "trace", skip(self))]
    pub fn create_node(&mut self, mut data: NodeData) -> Index {
        if self.ids.contains(&data.id) {
            let fresh = self.fresh_id();
            warn!("create_node: id {} is taken, using {}", data.id, fresh);
            data.id = fresh;
        }
        self.ids.insert(data.id.clone());
        self.arena.insert(TreeNode {
            data,
            parent: None,
            children: Vec::new(),
        })
    }

    fn fresh_id(&self) -> String {
        loop {
            let id = generate_node_id();
            if !self.ids.contains(&id) {
                return id;
            }
        }
    }

    pub fn root(&self) -> Option<Index> {
        self.root
    }

    pub fn get_node(&self, idx: Index) -> Option<&TreeNode> {
        self.arena.get(idx)
    }

    pub fn get_node_mut(&mut self, idx: Index) -> Option<&mut TreeNode> {
        self.arena.get_mut(idx)
    }

    pub fn contains(&self, idx: Index) -> bool {
        self.arena.contains(idx)
    }

    fn node(&self, idx: Index) -> DomainResult<&TreeNode> {
        self.arena
            .get(idx)
            .ok_or_else(|| DomainError::UnknownNode(format!("{:?}", idx)))
    }

    fn node_mut(&mut self, idx: Index) -> DomainResult<&mut TreeNode> {
        self.arena
            .get_mut(idx)
            .ok_or_else(|| DomainError::UnknownNode(format!("{:?}", idx)))
    }

    pub fn data(&self, idx: Index) -> DomainResult<&NodeData> {
        self.node(idx).map(|n| &n.data)
    }

    pub fn data_mut(&mut self, idx: Index) -> DomainResult<&mut NodeData> {
        self.node_mut(idx).map(|n| &mut n.data)
    }

    /// Node id for messages; falls back to the arena index.
    pub fn label(&self, idx: Index) -> String {
        self.arena
            .get(idx)
            .map(|n| n.data.id.clone())
            .unwrap_or_else(|| format!("{:?}", idx))
    }

    pub fn parent(&self, idx: Index) -> Option<Index> {
        self.arena.get(idx).and_then(|n| n.parent)
    }

    pub fn children(&self, idx: Index) -> &[Index] {
        self.arena
            .get(idx)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn child_count(&self, idx: Index) -> DomainResult<usize> {
        self.node(idx).map(|n| n.children.len())
    }

    pub fn index_of(&self, parent: Index, child: Index) -> Option<usize> {
        self.children(parent).iter().position(|&c| c == child)
    }

    /// Parent and index of an attached node.
    pub fn position(&self, node: Index) -> Option<(Index, usize)> {
        let parent = self.parent(node)?;
        self.index_of(parent, node).map(|i| (parent, i))
    }

    /// True if `node` is `ancestor` or lies below it.
    pub fn is_in_subtree(&self, node: Index, ancestor: Index) -> bool {
        let mut current = Some(node);
        while let Some(idx) = current {
            if idx == ancestor {
                return true;
            }
            current = self.parent(idx);
        }
        false
    }

    /// Look up an attached node by its document id.
    pub fn find_by_id(&self, id: &str) -> Option<Index> {
        self.iter().find(|(_, n)| n.data.id == id).map(|(idx, _)| idx)
    }

    // ============================================================
    // Structural primitives
    // ============================================================

    /// Validate an insert without performing it.
    pub fn check_insert(&self, parent: Index, index: usize, node: Index) -> DomainResult<()> {
        let len = self.child_count(parent)?;
        let child = self.node(node)?;
        if child.parent.is_some() || self.root == Some(node) {
            return Err(DomainError::AlreadyAttached(self.label(node)));
        }
        if self.is_in_subtree(parent, node) {
            return Err(DomainError::CycleDetected {
                node: self.label(node),
                target: self.label(parent),
            });
        }
        if index > len {
            return Err(DomainError::InvalidIndex {
                parent: self.label(parent),
                index,
                len,
            });
        }
        Ok(())
    }

    /// Insert a detached `node` as child of `parent` at `index`.
    #[instrument(level = "trace", skip(self))]
    pub fn insert(&mut self, parent: Index, index: usize, node: Index) -> DomainResult<()> {
        self.check_insert(parent, index, node)?;
        self.attach(parent, index, node);
        Ok(())
    }

    fn attach(&mut self, parent: Index, index: usize, node: Index) {
        if let Some(p) = self.arena.get_mut(parent) {
            p.children.insert(index, node);
        }
        if let Some(n) = self.arena.get_mut(node) {
            n.parent = Some(parent);
        }
    }

    /// Validate a remove, returning the current index of `node`.
    pub fn check_remove(&self, parent: Index, node: Index) -> DomainResult<usize> {
        self.node(parent)?;
        self.node(node)?;
        self.index_of(parent, node)
            .ok_or_else(|| DomainError::NotAChild {
                node: self.label(node),
                parent: self.label(parent),
            })
    }

    /// Detach `node` from `parent`, returning its former index.
    #[instrument(level = "trace", skip(self))]
    pub fn remove(&mut self, parent: Index, node: Index) -> DomainResult<usize> {
        let index = self.check_remove(parent, node)?;
        self.detach(parent, index, node);
        Ok(index)
    }

    fn detach(&mut self, parent: Index, index: usize, node: Index) {
        if let Some(p) = self.arena.get_mut(parent) {
            p.children.remove(index);
        }
        if let Some(n) = self.arena.get_mut(node) {
            n.parent = None;
        }
    }

    /// Validate a move, returning the current parent and index of `node`.
    ///
    /// `new_index` addresses the child sequence of `new_parent` after `node`
    /// has been taken out of its old place.
    pub fn check_move(
        &self,
        node: Index,
        new_parent: Index,
        new_index: usize,
    ) -> DomainResult<(Index, usize)> {
        let (old_parent, old_index) = self.movable_position(node, new_parent)?;
        let mut len = self.child_count(new_parent)?;
        if old_parent == new_parent {
            len -= 1;
        }
        if new_index > len {
            return Err(DomainError::InvalidIndex {
                parent: self.label(new_parent),
                index: new_index,
                len,
            });
        }
        Ok((old_parent, old_index))
    }

    fn movable_position(&self, node: Index, new_parent: Index) -> DomainResult<(Index, usize)> {
        self.node(node)?;
        self.node(new_parent)?;
        let (old_parent, old_index) = self.position(node).ok_or(DomainError::RootImmovable)?;
        if self.is_in_subtree(new_parent, node) {
            return Err(DomainError::CycleDetected {
                node: self.label(node),
                target: self.label(new_parent),
            });
        }
        Ok((old_parent, old_index))
    }

    /// Move `node` below `new_parent` at `new_index`.
    ///
    /// Detach and attach happen as one step: if attaching fails the node is put
    /// back at its old position before the error is returned. The side of the
    /// node follows [`MapTree::apply_side_policy`].
    #[instrument(level = "trace", skip(self))]
    pub fn move_node(
        &mut self,
        node: Index,
        new_parent: Index,
        new_index: usize,
    ) -> DomainResult<MoveOutcome> {
        let (old_parent, old_index) = self.movable_position(node, new_parent)?;
        let old_side = self.effective_side(node);

        self.detach(old_parent, old_index, node);
        if let Err(e) = self.insert(new_parent, new_index, node) {
            trace!("move_node: attach failed, restoring {:?}", node);
            self.attach(old_parent, old_index, node);
            return Err(e);
        }
        self.apply_side_policy(node, new_parent, old_side);

        Ok(MoveOutcome {
            old_parent,
            old_index,
            new_index,
        })
    }

    /// Side placement after a move.
    ///
    /// Under the root a node keeps the side of the branch it came from; a node
    /// without one joins the side with fewer top-level branches (right on a
    /// tie). Below any other parent the node's own side is cleared and it
    /// inherits its branch's side.
    fn apply_side_policy(&mut self, node: Index, new_parent: Index, old_side: Option<Side>) {
        let side = if self.root == Some(new_parent) {
            Some(old_side.unwrap_or_else(|| self.lighter_side(Some(node))))
        } else {
            None
        };
        if let Some(n) = self.arena.get_mut(node) {
            n.data.side = side;
        }
    }

    /// Side holding fewer children of the root, ignoring `exclude`.
    pub fn lighter_side(&self, exclude: Option<Index>) -> Side {
        let Some(root) = self.root else {
            return Side::Right;
        };
        let (left, right) = self
            .children(root)
            .iter()
            .filter(|&&c| Some(c) != exclude)
            .fold((0usize, 0usize), |(l, r), &c| {
                match self.top_level_side(c) {
                    Side::Left => (l + 1, r),
                    Side::Right => (l, r + 1),
                }
            });
        if left < right {
            Side::Left
        } else {
            Side::Right
        }
    }

    fn top_level_side(&self, child_of_root: Index) -> Side {
        self.arena
            .get(child_of_root)
            .and_then(|n| n.data.side)
            .unwrap_or(Side::Right)
    }

    /// Side of the top-level branch containing `node`; None for the root and
    /// for nodes outside the root's subtree.
    pub fn effective_side(&self, node: Index) -> Option<Side> {
        let root = self.root?;
        let mut current = node;
        loop {
            let parent = self.parent(current)?;
            if parent == root {
                return Some(self.top_level_side(current));
            }
            current = parent;
        }
    }

    /// Compute where [`ShiftDirection`] takes `node` among its siblings.
    ///
    /// Children of the root only trade places with siblings on the same side.
    /// At either end of its group the node wraps around to the other end.
    /// Returns `(parent, old_index, new_index)`; the new index addresses the
    /// sibling sequence with the node taken out, as [`MapTree::move_node`] expects.
    pub fn shift_target(
        &self,
        node: Index,
        direction: ShiftDirection,
    ) -> DomainResult<(Index, usize, usize)> {
        self.node(node)?;
        let (parent, index) = self.position(node).ok_or(DomainError::RootImmovable)?;
        let side_filter = if self.root == Some(parent) {
            Some(self.top_level_side(node))
        } else {
            None
        };
        let group: Vec<usize> = self
            .children(parent)
            .iter()
            .enumerate()
            .filter(|&(_, &c)| side_filter.map_or(true, |s| self.top_level_side(c) == s))
            .map(|(i, _)| i)
            .collect();

        let Some(pos) = group.iter().position(|&i| i == index) else {
            return Ok((parent, index, index));
        };
        if group.len() < 2 {
            return Ok((parent, index, index));
        }
        let last = group.len() - 1;
        let target_pos = match direction {
            ShiftDirection::Up if pos == 0 => last,
            ShiftDirection::Up => pos - 1,
            ShiftDirection::Down if pos == last => 0,
            ShiftDirection::Down => pos + 1,
        };
        Ok((parent, index, group[target_pos]))
    }

    /// Set the fold flag, returning the previous value.
    pub fn set_folded(&mut self, node: Index, folded: bool) -> DomainResult<bool> {
        let data = self.data_mut(node)?;
        let previous = data.folded;
        data.folded = folded;
        Ok(previous)
    }

    /// Free a detached node and its whole subtree from the arena.
    #[instrument(level = "debug", skip(self))]
    pub fn discard(&mut self, node: Index) -> DomainResult<usize> {
        let n = self.node(node)?;
        if n.parent.is_some() || self.root == Some(node) {
            return Err(DomainError::AlreadyAttached(self.label(node)));
        }
        let doomed: Vec<Index> = self.iter_postorder_from(node).map(|(idx, _)| idx).collect();
        for idx in &doomed {
            if let Some(freed) = self.arena.remove(*idx) {
                self.ids.remove(&freed.data.id);
            }
        }
        Ok(doomed.len())
    }

    // ============================================================
    // Traversal
    // ============================================================

    /// Pre-order traversal from the root.
    pub fn iter(&self) -> TreeIterator<'_> {
        TreeIterator::new(self, self.root)
    }

    fn iter_postorder_from(&self, start: Index) -> PostOrderIterator<'_> {
        PostOrderIterator::new(self, Some(start))
    }

    /// Number of nodes reachable from the root.
    pub fn node_count(&self) -> usize {
        self.iter().count()
    }

    #[instrument(level = "debug", skip(self))]
    pub fn depth(&self) -> usize {
        if let Some(root) = self.root {
            self.calculate_depth(root)
        } else {
            0
        }
    }

    fn calculate_depth(&self, node_idx: Index) -> usize {
        if let Some(node) = self.get_node(node_idx) {
            1 + node
                .children
                .iter()
                .map(|&child| self.calculate_depth(child))
                .max()
                .unwrap_or(0)
        } else {
            0
        }
    }
}

pub struct TreeIterator<'a> {
    tree: &'a MapTree,
    stack: Vec<Index>,
}

impl<'a> TreeIterator<'a> {
    fn new(tree: &'a MapTree, start: Option<Index>) -> Self {
        Self {
            tree,
            stack: start.into_iter().collect(),
        }
    }
}

impl<'a> Iterator for TreeIterator<'a> {
    type Item = (Index, &'a TreeNode);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(current_idx) = self.stack.pop() {
            if let Some(node) = self.tree.get_node(current_idx) {
                // Push children in reverse order for left-to-right traversal
                for &child in node.children.iter().rev() {
                    self.stack.push(child);
                }
                return Some((current_idx, node));
            }
        }
        None
    }
}

struct PostOrderIterator<'a> {
    tree: &'a MapTree,
    stack: Vec<(Index, bool)>,
}

impl<'a> PostOrderIterator<'a> {
    fn new(tree: &'a MapTree, start: Option<Index>) -> Self {
        Self {
            tree,
            stack: start.map(|s| (s, false)).into_iter().collect(),
        }
    }
}

impl<'a> Iterator for PostOrderIterator<'a> {
    type Item = (Index, &'a TreeNode);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some((current_idx, visited)) = self.stack.pop() {
            if let Some(node) = self.tree.get_node(current_idx) {
                if !visited {
                    self.stack.push((current_idx, true));
                    for &child in node.children.iter().rev() {
                        self.stack.push((child, false));
                    }
                } else {
                    return Some((current_idx, node));
                }
            }
        }
        None
    }
}
