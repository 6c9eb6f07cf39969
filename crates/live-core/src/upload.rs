//! Upload descriptors and validation.
//!
//! The browser announces files in a `uploads` param before sending any
//! bytes. Validation only looks at that announcement; staging and
//! storing the bytes belong to the caller.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::UploadError;
use crate::params::Params;

/// Param key holding the announced files, keyed by upload field name.
pub const UPLOADS_KEY: &str = "uploads";

const DEFAULT_MAX_FILES: usize = 1;
const DEFAULT_MAX_SIZE: u64 = 10 * 1024 * 1024;

/// Limits for one upload field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadConfig {
    pub name: String,
    pub max_files: usize,
    pub max_size: u64,
    /// Allowed content types. Empty means anything goes.
    pub accept: Vec<String>,
}

impl UploadConfig {
    pub fn new(name: impl Into<String>) -> Self {
        UploadConfig {
            name: name.into(),
            max_files: DEFAULT_MAX_FILES,
            max_size: DEFAULT_MAX_SIZE,
            accept: Vec::new(),
        }
    }

    pub fn max_files(mut self, max_files: usize) -> Self {
        self.max_files = max_files;
        self
    }

    pub fn max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn accept<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.accept = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn accepts(&self, content_type: &str) -> bool {
        self.accept.is_empty() || self.accept.iter().any(|t| t == content_type)
    }
}

/// One announced file.
#[derive(Debug, Clone, PartialEq)]
pub struct Upload {
    pub name: String,
    pub size: u64,
    pub content_type: String,
    pub errors: Vec<UploadError>,
    /// Fraction transferred, 0.0 to 1.0.
    pub progress: f32,
}

impl Upload {
    fn failed(error: UploadError) -> Self {
        Upload {
            name: String::new(),
            size: 0,
            content_type: String::new(),
            errors: vec![error],
            progress: 0.0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Snapshot of the current uploads per field, handed to the renderer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadContext {
    fields: BTreeMap<String, Vec<Upload>>,
}

impl UploadContext {
    pub fn get(&self, name: &str) -> &[Upload] {
        self.fields.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn insert(&mut self, name: impl Into<String>, upload: Upload) {
        self.fields.entry(name.into()).or_default().push(upload);
    }

    pub fn remove(&mut self, name: &str) -> Vec<Upload> {
        self.fields.remove(name).unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.fields.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn has_errors(&self) -> bool {
        self.fields
            .values()
            .flatten()
            .any(|u| !u.errors.is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Upload])> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

/// Check announced files against each field's limits.
///
/// A missing `uploads` param yields an empty context. A configured field
/// absent from the announcement gets a single `NotFound` descriptor; too
/// many files gets a single `TooManyFiles` descriptor. Otherwise each
/// file gets one error per rule it breaks.
pub fn validate_uploads(configs: &[UploadConfig], params: &Params) -> UploadContext {
    let mut context = UploadContext::default();
    let Some(announced) = params.get(UPLOADS_KEY) else {
        return context;
    };

    for config in configs {
        let files = match announced.get(&config.name) {
            None => {
                context.insert(&config.name, Upload::failed(UploadError::NotFound));
                continue;
            }
            Some(Value::Array(files)) => files,
            Some(_) => {
                context.insert(&config.name, Upload::failed(UploadError::Malformed));
                continue;
            }
        };

        if files.len() > config.max_files {
            context.insert(
                &config.name,
                Upload::failed(UploadError::TooManyFiles {
                    count: files.len(),
                    max: config.max_files,
                }),
            );
            continue;
        }

        for file in files {
            context.insert(&config.name, describe(config, file));
        }
    }
    context
}

fn describe(config: &UploadConfig, file: &Value) -> Upload {
    let Some(fields) = file.as_object() else {
        return Upload::failed(UploadError::Malformed);
    };
    let name = fields.get("name").and_then(Value::as_str).unwrap_or_default();
    let content_type = fields.get("type").and_then(Value::as_str).unwrap_or_default();
    let size = fields.get("size").and_then(Value::as_u64).unwrap_or(0);
    let progress = fields
        .get("progress")
        .and_then(Value::as_f64)
        .unwrap_or(0.0) as f32;

    let mut errors = Vec::new();
    if size > config.max_size {
        errors.push(UploadError::TooLarge {
            size,
            max: config.max_size,
        });
    }
    if !config.accepts(content_type) {
        errors.push(UploadError::NotAccepted {
            content_type: content_type.to_string(),
        });
    }

    Upload {
        name: name.to_string(),
        size,
        content_type: content_type.to_string(),
        errors,
        progress: progress.clamp(0.0, 1.0),
    }
}
