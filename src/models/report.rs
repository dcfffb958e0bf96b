use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::crop::BoundingBox;

/// Run-wide counters, threaded through every stage and returned with the report.
///
/// Each run owns its own accumulator, so concurrent runs never share counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    /// Frames the sampler returned
    pub original_frame_count: usize,
    /// Sample timestamps that could not be decoded
    pub frames_failed: usize,
    /// Frames whose detection request failed
    pub detection_failed: usize,
    /// Whether detection found nothing and whole frames were used instead
    pub fell_back_to_full_frames: bool,
    /// Crops handed to the embedder
    pub images_before_dedup: usize,
    /// Crops dropped because their embedding batch failed
    pub embedding_failed: usize,
    /// Embedding batches that failed after all retries
    pub embedding_failed_batches: usize,
    /// Images kept after deduplication
    pub final_image_count: usize,
    /// Images removed as near-duplicates
    pub removed_duplicate_count: usize,
    /// `removed / (kept + removed)`
    pub deduplication_rate: f64,
}

/// One representative image that survived deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeptImage {
    /// Position of the crop in the crop stage's output
    pub crop_index: usize,
    /// Frame the crop was cut from
    pub frame_index: usize,
    /// Timestamp of that frame
    pub timestamp_seconds: f64,
    /// Region of the frame, in pixels
    pub bounding_box: BoundingBox,
    /// Detected object class, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Detector confidence, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    /// Where the image was written, once saved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// An image dropped as a near-duplicate of a kept one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemovedImage {
    /// Position of the crop in the crop stage's output
    pub crop_index: usize,
    /// Frame the crop was cut from
    pub frame_index: usize,
    /// Timestamp of that frame
    pub timestamp_seconds: f64,
    /// Crop index of the kept image it matched
    pub duplicate_of: usize,
    /// Cosine similarity to that image
    pub similarity: f32,
}

/// The artifact handed to whatever renders the final report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistillationReport {
    /// Unique id of the run
    pub run_id: Uuid,
    /// When the report was produced (RFC 3339)
    pub generated_at: String,
    /// Name and version of the producing crate
    pub generator: String,
    /// The video that was distilled
    pub source: String,
    /// Crop strategy used
    pub crop_strategy: String,
    /// Threshold the deduplicator ran with
    pub similarity_threshold: f32,
    /// Kept images, in frame/crop emission order
    pub images: Vec<KeptImage>,
    /// Removed images and what they duplicated
    pub removed: Vec<RemovedImage>,
    /// Aggregate statistics
    pub stats: RunStats,
}

impl DistillationReport {
    /// Serializes the report to a pretty-printed JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Deserializes a `DistillationReport` from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json_str)
    }

    /// Writes the report as JSON to `path`.
    pub fn write_to(&self, path: &Path) -> crate::Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
