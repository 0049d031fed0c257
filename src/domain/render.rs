//! Text rendering of a map tree via `termtree`.

use generational_arena::Index;
use termtree::Tree;
use tracing::instrument;

use crate::domain::arena::MapTree;

pub trait TreeNodeConvert {
    fn to_tree_string(&self) -> Tree<String>;
}

/// One line per node: text, then markers for id, side, fold and capabilities.
fn node_label(tree: &MapTree, idx: Index) -> String {
    let Ok(data) = tree.data(idx) else {
        return format!("{:?}", idx);
    };
    let mut label = format!("{} [{}]", data.text, data.id);
    if tree.parent(idx) == tree.root() && tree.parent(idx).is_some() {
        if let Some(side) = tree.effective_side(idx) {
            label.push_str(&format!(" <{}>", side));
        }
    }
    if data.folded {
        label.push_str(" (folded)");
    }
    if let Some(state) = data.extensions.encryption() {
        label.push_str(if state.is_accessible() {
            " (encrypted)"
        } else {
            " (locked)"
        });
    }
    if let Some(icons) = data.extensions.icons() {
        label.push_str(&format!(" {{{}}}", icons.names().join(",")));
    }
    if let Some(link) = data.extensions.link() {
        label.push_str(&format!(" -> {}", link.target));
    }
    label
}

impl TreeNodeConvert for MapTree {
    #[instrument(level = "debug", skip(self))]
    fn to_tree_string(&self) -> Tree<String> {
        let Some(root_idx) = self.root() else {
            return Tree::new("Empty map".to_string());
        };

        fn build_tree(map: &MapTree, node_idx: Index, parent_tree: &mut Tree<String>) {
            for &child_idx in map.children(node_idx) {
                let mut child_tree = Tree::new(node_label(map, child_idx));
                // contents of locked nodes stay hidden
                if map.data(child_idx).map(|d| d.is_accessible()).unwrap_or(true) {
                    build_tree(map, child_idx, &mut child_tree);
                }
                parent_tree.push(child_tree);
            }
        }

        let mut tree = Tree::new(node_label(self, root_idx));
        build_tree(self, root_idx, &mut tree);
        tree
    }
}
