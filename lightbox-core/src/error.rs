use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("file not found: {0}")]
    NotFound(PathBuf),

    #[error("volume unavailable for: {0}")]
    VolumeUnavailable(PathBuf),

    #[error("plugin {plugin} failed for {path}: {message}")]
    Plugin {
        plugin: &'static str,
        path: PathBuf,
        message: String,
    },

    #[error("rating {0} outside 0..=5")]
    InvalidRating(i64),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("shutdown in progress")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
