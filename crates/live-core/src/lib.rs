//! live-core
//!
//! Pure live-view logic, no I/O:
//! - parsed markup trees (`Node`)
//! - markup tokenizer, tree builder and serializer
//! - stable anchors for text-holding elements
//! - the tree comparator producing path-addressed patches
//! - event params and upload descriptors

pub mod node;
pub mod markup;
pub mod anchor;
pub mod diff;
pub mod patch;
pub mod params;
pub mod upload;
pub mod error;

pub use node::{Attribute, Node, NodeKind};
pub use markup::{parse, to_html, LIVE_RENDERED};
pub use anchor::anchor_tree;
pub use diff::diff;
pub use patch::Patch;
pub use params::Params;
pub use upload::{validate_uploads, Upload, UploadConfig, UploadContext};
pub use error::{DiffError, ParseError, UploadError};
