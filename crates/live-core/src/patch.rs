use serde::{Deserialize, Serialize};

/// Replace (or, with an empty fragment, remove) the subtree at `path`.
///
/// `path` is a child-index sequence starting below `<html>`: `[1, 0]` is the
/// first child of `<body>`. An empty path addresses the whole document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub path: Vec<usize>,
    pub html: String,
}

impl Patch {
    pub fn new(path: Vec<usize>, html: impl Into<String>) -> Self {
        Patch {
            path,
            html: html.into(),
        }
    }

    /// Replace the entire document.
    pub fn root(html: impl Into<String>) -> Self {
        Patch::new(Vec::new(), html)
    }

    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }

    pub fn is_deletion(&self) -> bool {
        self.html.is_empty()
    }
}
