//! Path-addressed subtree replacement between two document trees.
//!
//! Nodes are paired by position only. A pair matches when attribute
//! count, attribute membership, kind and trimmed data are all equal; a
//! matching pair is descended into, anything else replaces the whole
//! proposed subtree. Within one sibling chain the higher indices are
//! judged first, so deletions come out in descending order and every
//! patch stays valid when applied in sequence.
//!
//! Text and comment nodes are never patched directly. Any change that
//! touches one is reported as a replacement of its parent element, and
//! that single patch subsumes everything else below the parent.

use std::iter;

use tracing::debug;

use crate::error::DiffError;
use crate::markup::to_html;
use crate::node::Node;
use crate::patch::Patch;

/// Leading path components (document, html) hidden from the client.
const HIDDEN_PREFIX: usize = 2;

enum Change<'a> {
    Replace(&'a Node),
    Delete,
}

struct RawPatch<'a> {
    path: Vec<usize>,
    change: Change<'a>,
}

/// Compute the patches that turn `current` into `proposed`.
///
/// Both arguments are whole documents as produced by `markup::parse`.
pub fn diff(current: &Node, proposed: &Node) -> Result<Vec<Patch>, DiffError> {
    let mut raw = Vec::new();
    let root = vec![0];
    if same_node(current, proposed) {
        compare_children(current, proposed, &root, &mut raw);
    } else {
        raw.push(RawPatch {
            path: root,
            change: Change::Replace(proposed),
        });
    }

    let mut patches = Vec::with_capacity(raw.len());
    for patch in raw {
        if patch.path.len() <= HIDDEN_PREFIX {
            // Document or <html> level change: resend everything.
            debug!(path = ?patch.path, "document level change, replacing root");
            return Ok(vec![Patch::root(to_html(proposed)?)]);
        }
        let html = match patch.change {
            Change::Replace(node) => to_html(node)?,
            Change::Delete => String::new(),
        };
        patches.push(Patch::new(patch.path[HIDDEN_PREFIX..].to_vec(), html));
    }
    Ok(patches)
}

fn same_node(current: &Node, proposed: &Node) -> bool {
    current.attrs.len() == proposed.attrs.len()
        && proposed.attrs.iter().all(|a| current.attrs.contains(a))
        && current.kind == proposed.kind
        && current.data.trim() == proposed.data.trim()
}

fn child_path(parent: &[usize], index: usize) -> Vec<usize> {
    let mut path = Vec::with_capacity(parent.len() + 1);
    path.extend_from_slice(parent);
    path.push(index);
    path
}

fn compare_children<'a>(
    current: &'a Node,
    proposed: &'a Node,
    parent_path: &[usize],
    out: &mut Vec<RawPatch<'a>>,
) {
    let currents: Vec<&'a Node> =
        iter::successors(current.first_child(), |n| n.next_sibling()).collect();
    let proposeds: Vec<&'a Node> =
        iter::successors(proposed.first_child(), |n| n.next_sibling()).collect();
    let paired = currents.len().min(proposeds.len());

    let mut local = Vec::new();
    let mut touches_text = false;

    // Appended siblings, in ascending order so indices line up on insert.
    for (index, node) in proposeds.iter().copied().enumerate().skip(paired) {
        touches_text |= node.is_text_like();
        local.push(RawPatch {
            path: child_path(parent_path, index),
            change: Change::Replace(node),
        });
    }

    // Removed siblings, highest index first.
    for (index, node) in currents.iter().enumerate().skip(paired).rev() {
        touches_text |= node.is_text_like();
        local.push(RawPatch {
            path: child_path(parent_path, index),
            change: Change::Delete,
        });
    }

    for index in (0..paired).rev() {
        let (cur, prop) = (currents[index], proposeds[index]);
        let path = child_path(parent_path, index);
        if same_node(cur, prop) {
            compare_children(cur, prop, &path, &mut local);
        } else {
            touches_text |= cur.is_text_like() || prop.is_text_like();
            local.push(RawPatch {
                path,
                change: Change::Replace(prop),
            });
        }
    }

    if touches_text {
        out.push(RawPatch {
            path: parent_path.to_vec(),
            change: Change::Replace(proposed),
        });
    } else {
        out.append(&mut local);
    }
}
