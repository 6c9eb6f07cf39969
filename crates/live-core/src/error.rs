//! Error types for the pure core.
//!
//! Parsing and diffing are the only fallible steps of a render cycle
//! that live here; upload validation errors are attached to descriptors
//! rather than returned.

use thiserror::Error;

/// Markup could not be turned into a tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Input ended inside a start or end tag.
    #[error("unterminated tag starting at byte {offset}")]
    UnterminatedTag { offset: usize },

    /// Input ended inside `<!-- ... `.
    #[error("unterminated comment starting at byte {offset}")]
    UnterminatedComment { offset: usize },

    /// A quoted attribute value was never closed.
    #[error("unterminated attribute value starting at byte {offset}")]
    UnterminatedAttribute { offset: usize },

    /// `<script>` / `<style>` without a matching close tag.
    #[error("unterminated <{tag}> starting at byte {offset}")]
    UnterminatedRawText { tag: String, offset: usize },

    /// Element nesting exceeded the builder's depth limit.
    #[error("element nesting deeper than {limit}")]
    TooDeep { limit: usize },
}

/// Patch generation failed.
#[derive(Debug, Error)]
pub enum DiffError {
    /// A patched subtree could not be serialized.
    #[error("failed to render patch: {0}")]
    Render(#[from] std::fmt::Error),
}

/// One violated upload rule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadError {
    #[error("uploads not found")]
    NotFound,

    #[error("upload too large: {size} bytes exceeds {max}")]
    TooLarge { size: u64, max: u64 },

    #[error("upload not accepted: {content_type}")]
    NotAccepted { content_type: String },

    #[error("upload too many files: {count} exceeds {max}")]
    TooManyFiles { count: usize, max: usize },

    #[error("upload malformed")]
    Malformed,
}
