//! Parsed markup tree.
//!
//! A tree is owned top-down through `first_child` / `next_sibling`
//! links; there is no parent back-reference. Trees are built once per
//! render pass and never mutated after the pipeline has stored them.

use std::iter;

/// What a node represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Document,
    Doctype,
    Element,
    Text,
    Comment,
}

/// One `name="value"` pair. Valueless attributes carry an empty value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Attribute {
    pub key: String,
    pub value: String,
}

impl Attribute {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Attribute {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A parsed element, text, comment, doctype or document node.
///
/// `data` is the tag name for elements, the content for text and
/// comments, and the doctype name for doctypes.
#[derive(Debug)]
pub struct Node {
    pub kind: NodeKind,
    pub data: String,
    pub attrs: Vec<Attribute>,
    pub first_child: Option<Box<Node>>,
    pub next_sibling: Option<Box<Node>>,
}

impl Node {
    pub fn new(kind: NodeKind, data: impl Into<String>) -> Self {
        Node {
            kind,
            data: data.into(),
            attrs: Vec::new(),
            first_child: None,
            next_sibling: None,
        }
    }

    pub fn element(name: impl Into<String>, attrs: Vec<Attribute>) -> Self {
        let mut node = Node::new(NodeKind::Element, name);
        node.attrs = attrs;
        node
    }

    pub fn text(content: impl Into<String>) -> Self {
        Node::new(NodeKind::Text, content)
    }

    /// Attach `children` in order, replacing any existing children.
    pub fn with_children(mut self, children: Vec<Node>) -> Self {
        self.first_child = link_siblings(children);
        self
    }

    /// Text and comment nodes cannot be addressed by the client on
    /// their own; changes to them are reported against the parent.
    pub fn is_text_like(&self) -> bool {
        matches!(self.kind, NodeKind::Text | NodeKind::Comment)
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|a| a.key == key)
            .map(|a| a.value.as_str())
    }

    pub fn has_attr(&self, key: &str) -> bool {
        self.attr(key).is_some()
    }

    pub fn first_child(&self) -> Option<&Node> {
        self.first_child.as_deref()
    }

    pub fn next_sibling(&self) -> Option<&Node> {
        self.next_sibling.as_deref()
    }

    /// Iterate over direct children in document order.
    pub fn children(&self) -> impl Iterator<Item = &Node> {
        iter::successors(self.first_child(), |n| n.next_sibling())
    }

    /// Find the first element with the given tag name, depth first.
    pub fn find_element(&self, name: &str) -> Option<&Node> {
        if self.kind == NodeKind::Element && self.data == name {
            return Some(self);
        }
        self.children().find_map(|c| c.find_element(name))
    }

    /// Concatenated text of all descendant text nodes.
    pub fn text_content(&self) -> String {
        let mut out = String::new();
        collect_text(self, &mut out);
        out
    }
}

fn collect_text(node: &Node, out: &mut String) {
    if node.kind == NodeKind::Text {
        out.push_str(&node.data);
    }
    for child in node.children() {
        collect_text(child, out);
    }
}

/// Turn an ordered list into a `next_sibling` chain, returning its head.
pub(crate) fn link_siblings(nodes: Vec<Node>) -> Option<Box<Node>> {
    let mut head: Option<Box<Node>> = None;
    for mut node in nodes.into_iter().rev() {
        node.next_sibling = head.take();
        head = Some(Box::new(node));
    }
    head
}

// Sibling chains can be long; unlink them iteratively so dropping a
// wide tree only recurses as deep as the tree itself.
impl Drop for Node {
    fn drop(&mut self) {
        let mut next = self.next_sibling.take();
        while let Some(mut node) = next {
            next = node.next_sibling.take();
        }
    }
}
