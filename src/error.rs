use std::time::Duration;

use serde::Serialize;

/// Main error type for the application
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// I/O errors (file operations, spawning ffmpeg, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Image decoding/encoding errors
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport errors talking to a remote service
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The video could not be opened or probed at all
    #[error("Source unreadable: {0}")]
    SourceUnreadable(String),

    /// The video opened but not a single frame could be decoded
    #[error("No frames decoded: {0}")]
    NoFramesDecoded(String),

    /// A detection request for one frame failed
    #[error("Detection call failed: {0}")]
    DetectionCallFailed(String),

    /// An embedding batch failed (possibly after retries)
    #[error("Embedding batch failed: {0}")]
    EmbeddingBatchFailed(String),

    /// Invalid configuration, detected before or during a run
    #[error("Configuration invalid: {0}")]
    ConfigurationInvalid(String),

    /// A whole stage produced no usable output
    #[error("Stage '{stage}' failed: {message}")]
    StageFailed {
        /// The stage name (sample, crop, embed, dedup).
        stage: &'static str,
        /// Why the stage produced nothing.
        message: String,
    },

    /// The run was cancelled
    #[error("Cancelled during {0}")]
    Cancelled(&'static str),

    /// The run exceeded its time budget
    #[error("Run timed out after {0:?}")]
    TimedOut(Duration),

    /// Anything else
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Standard error payload, suitable for handing to a reporting layer
#[derive(Serialize, Debug)]
pub struct ErrorResponse {
    /// Stable error kind
    pub kind: &'static str,
    /// Error message
    pub message: String,
    /// Whether the error aborted the run
    pub fatal: bool,
}

impl AppError {
    /// Whether repeating the failed operation could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            // any batch failure gets the full attempt budget
            Self::EmbeddingBatchFailed(_) | Self::DetectionCallFailed(_) => true,
            _ => false,
        }
    }

    /// Whether the error ends the whole run rather than a single frame or batch
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::DetectionCallFailed(_) | Self::EmbeddingBatchFailed(_)
        )
    }

    /// Short machine-readable name of the variant
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Image(_) => "image",
            Self::Json(_) => "json",
            Self::Http(_) => "http",
            Self::SourceUnreadable(_) => "source_unreadable",
            Self::NoFramesDecoded(_) => "no_frames_decoded",
            Self::DetectionCallFailed(_) => "detection_call_failed",
            Self::EmbeddingBatchFailed(_) => "embedding_batch_failed",
            Self::ConfigurationInvalid(_) => "configuration_invalid",
            Self::StageFailed { .. } => "stage_failed",
            Self::Cancelled(_) => "cancelled",
            Self::TimedOut(_) => "timed_out",
            Self::Internal(_) => "internal",
        }
    }

    /// Convert the error to a JSON-serializable payload
    pub fn to_json(&self) -> ErrorResponse {
        ErrorResponse {
            kind: self.kind(),
            message: self.to_string(),
            fatal: self.is_fatal(),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, AppError>;
