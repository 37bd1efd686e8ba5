use thiserror::Error;

/// Errors raised by the image codec (decoding sources, encoding/decoding tiles)
#[derive(Debug, Clone, Error)]
pub enum CodecError {
    /// The source bytes could not be decoded
    #[error("Failed to decode image: {message}")]
    Decode { message: String },

    /// The pixels could not be encoded
    #[error("Failed to encode image: {message}")]
    Encode { message: String },

    /// The pixel layout is not one the tile stores can persist
    #[error("Unsupported pixel format: {0}")]
    UnsupportedPixelFormat(String),
}

/// Errors raised while resolving or decoding a source image
#[derive(Debug, Error)]
pub enum SourceError {
    /// The URL names a scheme no source can resolve
    #[error("Unsupported URL: {0}")]
    UnsupportedUrl(String),

    /// The source does not exist
    #[error("Source not found: {0}")]
    NotFound(String),

    /// Reading the source failed
    #[error("I/O error reading {url}: {source}")]
    Io {
        url: String,
        #[source]
        source: std::io::Error,
    },

    /// The source bytes are not a decodable image
    #[error("Cannot decode {url}: {source}")]
    Codec {
        url: String,
        #[source]
        source: CodecError,
    },
}

impl SourceError {
    pub(crate) fn io(url: &str, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            SourceError::NotFound(url.to_string())
        } else {
            SourceError::Io {
                url: url.to_string(),
                source,
            }
        }
    }
}

/// Errors raised by tile and file stores
#[derive(Debug, Error)]
pub enum StoreError {
    /// Error from the embedded SQLite database
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem error from the file-based tile store
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted tile could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// A persisted record could not be interpreted
    #[error("Malformed record: {0}")]
    Malformed(String),
}

/// Errors raised by the body of a background job
#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// The job ran but could not complete its work
    #[error("Job failed: {message}")]
    Failed { message: String },

    /// The job body panicked; the worker survived
    #[error("Job panicked: {message}")]
    Panicked { message: String },
}

impl JobError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// Errors delivered to tile and file callbacks.
///
/// These travel across threads as plain values; nothing here is ever
/// propagated as a panic.
#[derive(Debug, Clone, Error)]
pub enum TileError {
    /// The request was cancelled before it could be answered
    #[error("Request was aborted")]
    Aborted,

    /// The tile does not exist and could not be generated
    #[error("Tile not found: image {image_id}, scale {scale}, position ({x}, {y})")]
    NotFound {
        image_id: i64,
        scale: u32,
        x: u32,
        y: u32,
    },

    /// The requested scale lies outside the image's pyramid
    #[error("Invalid scale {scale}: image pyramid ends at {max_scale}")]
    InvalidScale { scale: u32, max_scale: u32 },

    /// The file entry has not been persisted yet
    #[error("Image has no persistent id: {url}")]
    InvalidImage { url: String },

    /// Generating tiles or metadata for a source failed
    #[error("Generation failed for {url}: {message}")]
    Generation { url: String, message: String },

    /// The store rejected the operation
    #[error("Store error: {message}")]
    Store { message: String },

    /// The source could not be resolved
    #[error("Source error for {url}: {message}")]
    Source { url: String, message: String },

    /// The tile pixels could not be decoded
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// The coordinator thread is no longer running
    #[error("Coordinator is not running")]
    Disconnected,
}

impl From<StoreError> for TileError {
    fn from(err: StoreError) -> Self {
        TileError::Store {
            message: err.to_string(),
        }
    }
}

impl From<SourceError> for TileError {
    fn from(err: SourceError) -> Self {
        let url = match &err {
            SourceError::UnsupportedUrl(url) | SourceError::NotFound(url) => url.clone(),
            SourceError::Io { url, .. } | SourceError::Codec { url, .. } => url.clone(),
        };
        TileError::Source {
            url,
            message: err.to_string(),
        }
    }
}
