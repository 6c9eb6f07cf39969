//! Markup tokenizer, tree builder and serializer.
//!
//! Rendered markup is parsed into a `Node` tree on every render pass.
//! The builder also shapes the tree so that two renders of logically
//! identical markup are structurally comparable:
//! - the document always has one `html` element holding `head` and `body`,
//!   synthesized when the markup omits them;
//! - head-only tags seen before any body content are placed in `head`;
//! - whitespace-only text nodes are dropped;
//! - `body` carries the `live-rendered` attribute.
//!
//! This is not a full HTML5 tree builder. Known limitations:
//! - no implied end tags (`<p>` does not close an open `<p>`);
//! - no foster parenting or adoption agency for misnested formatting tags;
//! - a small fixed entity table (see `decode_entities`).

use std::fmt::{self, Write};

use memchr::memchr;

use crate::error::ParseError;
use crate::node::{Attribute, Node, NodeKind};

/// Attribute flagging that the server rendered this document, so the
/// client knows to open the realtime connection.
pub const LIVE_RENDERED: &str = "live-rendered";

/// Maximum element nesting accepted by the builder.
pub const MAX_DEPTH: usize = 512;

const COMMENT_START: &str = "<!--";
const COMMENT_END: &str = "-->";
const DOCTYPE_START: &[u8] = b"<!doctype";

const HEAD_ELEMENTS: &[&str] = &[
    "base", "link", "meta", "noscript", "script", "style", "template", "title",
];

/// Parse rendered markup into a shaped document tree.
pub fn parse(input: &str) -> Result<Node, ParseError> {
    let tokens = tokenize(input)?;
    let mut builder = TreeBuilder::new();
    for token in tokens {
        builder.process(token)?;
    }
    Ok(builder.finish())
}

/// Serialize a node and its descendants (never its siblings).
pub fn to_html(node: &Node) -> Result<String, fmt::Error> {
    let mut out = String::new();
    write_node(&mut out, node)?;
    Ok(out)
}

/// Serialize into any `fmt::Write` sink.
pub fn write_node<W: Write>(out: &mut W, node: &Node) -> fmt::Result {
    match node.kind {
        NodeKind::Document => {
            for child in node.children() {
                write_node(out, child)?;
            }
            Ok(())
        }
        NodeKind::Doctype => write!(out, "<!DOCTYPE {}>", node.data),
        NodeKind::Comment => write!(out, "<!--{}-->", node.data),
        NodeKind::Text => escape_text(out, &node.data),
        NodeKind::Element => {
            write!(out, "<{}", node.data)?;
            for attr in &node.attrs {
                write!(out, " {}=\"", attr.key)?;
                escape_attr(out, &attr.value)?;
                out.write_char('"')?;
            }
            if is_void_element(&node.data) {
                return out.write_str("/>");
            }
            out.write_char('>')?;
            let raw = is_raw_text_element(&node.data);
            for child in node.children() {
                if raw && child.kind == NodeKind::Text {
                    out.write_str(&child.data)?;
                } else {
                    write_node(out, child)?;
                }
            }
            write!(out, "</{}>", node.data)
        }
    }
}

pub fn is_void_element(name: &str) -> bool {
    matches!(
        name,
        "area"
            | "base"
            | "br"
            | "col"
            | "embed"
            | "hr"
            | "img"
            | "input"
            | "link"
            | "meta"
            | "param"
            | "source"
            | "track"
            | "wbr"
    )
}

/// Elements whose content is kept verbatim (no entity decoding, no escaping).
fn is_raw_text_element(name: &str) -> bool {
    matches!(name, "script" | "style")
}

/// Elements whose content is text only, but with entities decoded.
fn is_escapable_raw_text_element(name: &str) -> bool {
    matches!(name, "textarea" | "title")
}

fn escape_text<W: Write>(out: &mut W, text: &str) -> fmt::Result {
    for ch in text.chars() {
        match ch {
            '&' => out.write_str("&amp;")?,
            '<' => out.write_str("&lt;")?,
            '>' => out.write_str("&gt;")?,
            _ => out.write_char(ch)?,
        }
    }
    Ok(())
}

fn escape_attr<W: Write>(out: &mut W, value: &str) -> fmt::Result {
    for ch in value.chars() {
        match ch {
            '&' => out.write_str("&amp;")?,
            '"' => out.write_str("&quot;")?,
            _ => out.write_char(ch)?,
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
enum Token {
    Doctype(String),
    StartTag {
        name: String,
        attrs: Vec<Attribute>,
        self_closing: bool,
    },
    EndTag(String),
    Comment(String),
    Text(String),
}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b':')
}

fn starts_with_ignore_ascii_case(haystack: &[u8], start: usize, needle: &[u8]) -> bool {
    haystack.len() >= start + needle.len()
        && haystack[start..start + needle.len()].eq_ignore_ascii_case(needle)
}

fn push_text(out: &mut Vec<Token>, text: String) {
    if text.is_empty() {
        return;
    }
    if let Some(Token::Text(prev)) = out.last_mut() {
        prev.push_str(&text);
    } else {
        out.push(Token::Text(text));
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ParseError> {
    let bytes = input.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;

    // Slices are only ever cut at ASCII structural bytes, so every
    // endpoint stays on a UTF-8 boundary.
    while i < bytes.len() {
        if bytes[i] != b'<' {
            let end = memchr(b'<', &bytes[i..]).map_or(bytes.len(), |rel| i + rel);
            push_text(&mut out, decode_entities(&input[i..end]));
            i = end;
            continue;
        }

        if input[i..].starts_with(COMMENT_START) {
            let body = i + COMMENT_START.len();
            let end = input[body..]
                .find(COMMENT_END)
                .ok_or(ParseError::UnterminatedComment { offset: i })?;
            out.push(Token::Comment(input[body..body + end].to_string()));
            i = body + end + COMMENT_END.len();
            continue;
        }

        if starts_with_ignore_ascii_case(bytes, i, DOCTYPE_START) {
            let close =
                memchr(b'>', &bytes[i..]).ok_or(ParseError::UnterminatedTag { offset: i })?;
            let name = input[i + DOCTYPE_START.len()..i + close].trim();
            let name = if name.is_empty() { "html" } else { name };
            out.push(Token::Doctype(name.to_ascii_lowercase()));
            i += close + 1;
            continue;
        }

        if bytes.get(i + 1) == Some(&b'/') && bytes.get(i + 2).is_some_and(u8::is_ascii_alphabetic)
        {
            let start = i + 2;
            let mut j = start;
            while j < bytes.len() && is_name_byte(bytes[j]) {
                j += 1;
            }
            let name = input[start..j].to_ascii_lowercase();
            let close =
                memchr(b'>', &bytes[j..]).ok_or(ParseError::UnterminatedTag { offset: i })?;
            out.push(Token::EndTag(name));
            i = j + close + 1;
            continue;
        }

        if bytes.get(i + 1).is_some_and(u8::is_ascii_alphabetic) {
            let tag_start = i;
            let (name, attrs, self_closing, next) = read_start_tag(input, i)?;
            i = next;

            let raw = is_raw_text_element(&name);
            let escapable = is_escapable_raw_text_element(&name);
            if self_closing || !(raw || escapable) {
                out.push(Token::StartTag {
                    name,
                    attrs,
                    self_closing,
                });
                continue;
            }

            let (content_end, after) =
                find_close_tag(input, i, &name).ok_or_else(|| ParseError::UnterminatedRawText {
                    tag: name.clone(),
                    offset: tag_start,
                })?;
            let content = &input[i..content_end];
            out.push(Token::StartTag {
                name: name.clone(),
                attrs,
                self_closing: false,
            });
            if !content.is_empty() {
                let text = if raw {
                    content.to_string()
                } else {
                    decode_entities(content)
                };
                out.push(Token::Text(text));
            }
            out.push(Token::EndTag(name));
            i = after;
            continue;
        }

        // A '<' that opens no markup is plain text.
        let end = memchr(b'<', &bytes[i + 1..]).map_or(bytes.len(), |rel| i + 1 + rel);
        push_text(&mut out, decode_entities(&input[i..end]));
        i = end;
    }

    Ok(out)
}

type StartTag = (String, Vec<Attribute>, bool, usize);

fn read_start_tag(input: &str, start: usize) -> Result<StartTag, ParseError> {
    let bytes = input.as_bytes();
    let len = bytes.len();
    let mut j = start + 1;
    while j < len && is_name_byte(bytes[j]) {
        j += 1;
    }
    let name = input[start + 1..j].to_ascii_lowercase();
    let mut attrs: Vec<Attribute> = Vec::new();

    loop {
        while j < len && bytes[j].is_ascii_whitespace() {
            j += 1;
        }
        match bytes.get(j) {
            None => return Err(ParseError::UnterminatedTag { offset: start }),
            Some(b'>') => return Ok((name, attrs, false, j + 1)),
            Some(b'/') => {
                if bytes.get(j + 1) == Some(&b'>') {
                    return Ok((name, attrs, true, j + 2));
                }
                j += 1;
                continue;
            }
            Some(_) => {}
        }

        let key_start = j;
        while j < len
            && !bytes[j].is_ascii_whitespace()
            && !matches!(bytes[j], b'=' | b'>' | b'/')
        {
            j += 1;
        }
        if key_start == j {
            // Stray '=' with no attribute name.
            j += 1;
            continue;
        }
        let key = input[key_start..j].to_ascii_lowercase();

        while j < len && bytes[j].is_ascii_whitespace() {
            j += 1;
        }
        let mut value = String::new();
        if bytes.get(j) == Some(&b'=') {
            j += 1;
            while j < len && bytes[j].is_ascii_whitespace() {
                j += 1;
            }
            match bytes.get(j) {
                Some(&quote @ (b'"' | b'\'')) => {
                    let value_start = j + 1;
                    let rel = memchr(quote, &bytes[value_start..])
                        .ok_or(ParseError::UnterminatedAttribute { offset: j })?;
                    value = decode_entities(&input[value_start..value_start + rel]);
                    j = value_start + rel + 1;
                }
                Some(_) => {
                    let value_start = j;
                    while j < len && !bytes[j].is_ascii_whitespace() && bytes[j] != b'>' {
                        j += 1;
                    }
                    value = decode_entities(&input[value_start..j]);
                }
                None => return Err(ParseError::UnterminatedTag { offset: start }),
            }
        }

        // First occurrence wins, as in browsers.
        if !attrs.iter().any(|a| a.key == key) {
            attrs.push(Attribute { key, value });
        }
    }
}

/// Find `</name` (any case) followed by optional whitespace and `>`.
/// Returns (start of close tag, index just past it).
fn find_close_tag(input: &str, from: usize, name: &str) -> Option<(usize, usize)> {
    let bytes = input.as_bytes();
    let mut i = from;
    while let Some(rel) = memchr(b'<', &bytes[i..]) {
        i += rel;
        let name_start = i + 2;
        let name_end = name_start + name.len();
        if bytes.get(i + 1) == Some(&b'/')
            && name_end <= bytes.len()
            && bytes[name_start..name_end].eq_ignore_ascii_case(name.as_bytes())
        {
            let mut k = name_end;
            while k < bytes.len() && bytes[k].is_ascii_whitespace() {
                k += 1;
            }
            if bytes.get(k) == Some(&b'>') {
                return Some((i, k + 1));
            }
        }
        i += 1;
    }
    None
}

/// Decode a small, fixed set of entities.
///
/// Named: `&amp;`, `&lt;`, `&gt;`, `&quot;`, `&apos;`, `&nbsp;`.
/// Numeric: `&#123;` and `&#x1F4A9;`, semicolon-terminated, valid scalars only.
/// Anything else passes through unchanged.
pub fn decode_entities(s: &str) -> String {
    if memchr(b'&', s.as_bytes()).is_none() {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        match decode_one(tail) {
            Some((ch, used)) => {
                out.push(ch);
                rest = &tail[used..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_one(tail: &str) -> Option<(char, usize)> {
    const MAX_ENTITY_LEN: usize = 12;
    let semi = tail
        .as_bytes()
        .iter()
        .take(MAX_ENTITY_LEN)
        .position(|&b| b == b';')?;
    let name = &tail[1..semi];
    let ch = match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => '\u{a0}',
        _ => {
            let digits = name.strip_prefix('#')?;
            let code = match digits.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => digits.parse::<u32>().ok()?,
            };
            char::from_u32(code)?
        }
    };
    Some((ch, semi + 1))
}

// ---------------------------------------------------------------------------
// Tree builder
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ArenaNode {
    kind: NodeKind,
    data: String,
    attrs: Vec<Attribute>,
    children: Vec<usize>,
}

impl ArenaNode {
    fn new(kind: NodeKind, data: impl Into<String>, attrs: Vec<Attribute>) -> Self {
        ArenaNode {
            kind,
            data: data.into(),
            attrs,
            children: Vec::new(),
        }
    }
}

struct TreeBuilder {
    nodes: Vec<ArenaNode>,
    doctype: Option<String>,
    html: usize,
    head: usize,
    body: usize,
    /// `head` until body content appears, then `body`.
    root: usize,
    in_body: bool,
    /// Open elements below `root`.
    open: Vec<usize>,
}

impl TreeBuilder {
    fn new() -> Self {
        let mut builder = TreeBuilder {
            nodes: Vec::new(),
            doctype: None,
            html: 0,
            head: 0,
            body: 0,
            root: 0,
            in_body: false,
            open: Vec::new(),
        };
        builder.html = builder.push(ArenaNode::new(NodeKind::Element, "html", Vec::new()));
        builder.head = builder.append(
            builder.html,
            ArenaNode::new(NodeKind::Element, "head", Vec::new()),
        );
        builder.body = builder.append(
            builder.html,
            ArenaNode::new(NodeKind::Element, "body", Vec::new()),
        );
        builder.root = builder.head;
        builder
    }

    fn push(&mut self, node: ArenaNode) -> usize {
        let index = self.nodes.len();
        self.nodes.push(node);
        index
    }

    fn append(&mut self, parent: usize, node: ArenaNode) -> usize {
        let index = self.push(node);
        self.nodes[parent].children.push(index);
        index
    }

    fn append_text(&mut self, parent: usize, text: String) {
        if let Some(&last) = self.nodes[parent].children.last() {
            if self.nodes[last].kind == NodeKind::Text {
                self.nodes[last].data.push_str(&text);
                return;
            }
        }
        self.append(parent, ArenaNode::new(NodeKind::Text, text, Vec::new()));
    }

    fn current(&self) -> usize {
        self.open.last().copied().unwrap_or(self.root)
    }

    fn merge_attrs(&mut self, target: usize, attrs: Vec<Attribute>) {
        let existing = &mut self.nodes[target].attrs;
        for attr in attrs {
            if !existing.iter().any(|a| a.key == attr.key) {
                existing.push(attr);
            }
        }
    }

    fn enter_body(&mut self) {
        if !self.in_body {
            self.in_body = true;
            self.root = self.body;
            self.open.clear();
        }
    }

    fn process(&mut self, token: Token) -> Result<(), ParseError> {
        match token {
            Token::Doctype(name) => {
                if !self.in_body && self.doctype.is_none() {
                    self.doctype = Some(name);
                }
            }
            Token::Comment(text) => {
                let parent = self.current();
                self.append(parent, ArenaNode::new(NodeKind::Comment, text, Vec::new()));
            }
            Token::Text(text) => {
                if text.trim().is_empty() {
                    return Ok(());
                }
                if !self.in_body && self.open.is_empty() {
                    self.enter_body();
                }
                let parent = self.current();
                self.append_text(parent, text);
            }
            Token::StartTag {
                name,
                attrs,
                self_closing,
            } => match name.as_str() {
                "html" => self.merge_attrs(self.html, attrs),
                "head" => {
                    if !self.in_body {
                        self.merge_attrs(self.head, attrs);
                    }
                }
                "body" => {
                    self.merge_attrs(self.body, attrs);
                    self.enter_body();
                }
                _ => {
                    if !self.in_body
                        && self.open.is_empty()
                        && !HEAD_ELEMENTS.contains(&name.as_str())
                    {
                        self.enter_body();
                    }
                    let parent = self.current();
                    let void = is_void_element(&name);
                    let index = self.append(parent, ArenaNode::new(NodeKind::Element, name, attrs));
                    if !void && !self_closing {
                        if self.open.len() >= MAX_DEPTH {
                            return Err(ParseError::TooDeep { limit: MAX_DEPTH });
                        }
                        self.open.push(index);
                    }
                }
            },
            Token::EndTag(name) => {
                if matches!(name.as_str(), "html" | "head" | "body") {
                    return Ok(());
                }
                // Unmatched end tags are ignored.
                if let Some(pos) = self.open.iter().rposition(|&i| self.nodes[i].data == name) {
                    self.open.truncate(pos);
                }
            }
        }
        Ok(())
    }

    fn finish(mut self) -> Node {
        let body = &mut self.nodes[self.body].attrs;
        if !body.iter().any(|a| a.key == LIVE_RENDERED) {
            body.push(Attribute::new(LIVE_RENDERED, ""));
        }

        let html = self.build(self.html);
        let mut children = Vec::with_capacity(2);
        if let Some(doctype) = self.doctype.take() {
            children.push(Node::new(NodeKind::Doctype, doctype));
        }
        children.push(html);
        Node::new(NodeKind::Document, "").with_children(children)
    }

    // Depth is bounded by MAX_DEPTH, so plain recursion is fine here.
    fn build(&mut self, index: usize) -> Node {
        let children = std::mem::take(&mut self.nodes[index].children);
        let built: Vec<Node> = children.into_iter().map(|c| self.build(c)).collect();
        let arena = &mut self.nodes[index];
        let mut node = Node::new(arena.kind, std::mem::take(&mut arena.data));
        node.attrs = std::mem::take(&mut arena.attrs);
        node.with_children(built)
    }
}
