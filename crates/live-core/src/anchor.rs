//! Stable anchors for elements that hold text.
//!
//! The client cannot address a bare text node, so every element with a
//! direct text child is tagged with `_l_<path>`, where `<path>` is the
//! element's child-index path below `<html>` joined with `_`. The same
//! markup always produces the same anchors, so anchoring every render
//! keeps consecutive trees comparable.

use crate::node::{Attribute, Node, NodeKind};

pub const ANCHOR_PREFIX: &str = "_l_";

/// Tag every text-holding element in a parsed document.
pub fn anchor_tree(document: &mut Node) {
    let mut child = document.first_child.as_deref_mut();
    while let Some(node) = child {
        if node.kind == NodeKind::Element && node.data == "html" {
            anchor_children(node, &mut Vec::new());
            return;
        }
        child = node.next_sibling.as_deref_mut();
    }
}

fn anchor_children(parent: &mut Node, path: &mut Vec<usize>) {
    let mut index = 0;
    let mut child = parent.first_child.as_deref_mut();
    while let Some(node) = child {
        if node.kind == NodeKind::Element {
            path.push(index);
            if node.children().any(|c| c.kind == NodeKind::Text) {
                set_anchor(node, path);
            }
            anchor_children(node, path);
            path.pop();
        }
        index += 1;
        child = node.next_sibling.as_deref_mut();
    }
}

fn set_anchor(node: &mut Node, path: &[usize]) {
    let key = anchor_name(path);
    if !node.attrs.iter().any(|a| a.key == key) {
        node.attrs.push(Attribute::new(key, ""));
    }
}

/// `[1, 0, 2]` becomes `_l_1_0_2`.
pub fn anchor_name(path: &[usize]) -> String {
    let joined: Vec<String> = path.iter().map(usize::to_string).collect();
    format!("{ANCHOR_PREFIX}{}", joined.join("_"))
}
