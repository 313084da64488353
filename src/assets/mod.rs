//! Asset loaders that run as jobs.
//!
//! Loaders only read and decode into memory. Anything that needs the render
//! context happens on the caller's thread after the load job was joined.

pub mod file_cache;
pub mod model;
pub mod pvr;
pub mod texture;

use std::path::PathBuf;
use thiserror::Error;

/// Payload-level load failure. The scheduler never sees these.
#[derive(Debug, Error)]
pub enum AssetError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unexpected end of data while reading {what}")]
    Truncated { what: &'static str },

    #[error("Bad magic: {0}")]
    BadMagic(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Triangle {triangle} references vertex {index} but the model has {vertex_count} vertices")]
    BadIndex {
        triangle: usize,
        index: i32,
        vertex_count: usize,
    },

    #[error("Asset {0} has not been loaded")]
    NotLoaded(PathBuf),
}

impl AssetError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AssetError::Io {
            path: path.into(),
            source,
        }
    }

    /// Maps a read past the end of a buffer to [`AssetError::Truncated`].
    pub(crate) fn truncated(what: &'static str) -> impl FnOnce(std::io::Error) -> Self {
        move |_| AssetError::Truncated { what }
    }
}

pub type Result<T> = std::result::Result<T, AssetError>;
