#![doc(html_root_url = "https://docs.rs/framesift/0.1.0")]
#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

//! # FrameSift
//!
//! Distill a video into a small, non-redundant set of timestamped images.
//!
//! A run samples frames from the video, cuts each frame into candidate
//! regions, embeds every region through a remote embedding service and drops
//! regions that are near-duplicates of one already kept.
//!
//! ## Stages
//!
//! - **Sampling**: up to `target_count` frames spread over the video or a time window
//! - **Cropping**: one centered region per frame, or one region per detected object
//! - **Embedding**: batched calls to the embedding service with retry
//! - **Deduplication**: greedy cosine-similarity filtering in frame order
//!
//! Failures of single frames, detection calls or embedding batches are
//! tolerated and counted in the run statistics; only a stage that produces
//! nothing at all fails the run.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use framesift::{distill_video, Config, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     framesift::init()?;
//!     let mut result = distill_video("talk.mp4", Config::default()).await?;
//!     result.save("output", 85)?;
//!     println!("kept {} images", result.stats().final_image_count);
//!     Ok(())
//! }
//! ```

/// Run configuration and its defaults.
pub mod config;
pub mod core;
/// Defines the application's error types and result aliases.
pub mod error;
pub mod models;
mod utils;

// Public API exports
pub use crate::{
    config::{AspectRatio, Config, CropStrategyKind, SamplingMode, TimeRange},
    core::{
        crop::{BoundingBox, Crop, CropStrategy},
        dedup::{deduplicate, DedupResult},
        embeddings::{cosine_similarity, EmbeddingVector},
        pipeline::{Distillation, Pipeline, ServiceStatus},
        video::{check_ffmpeg_installed, sample, FfmpegSource, Frame, InMemorySource, VideoSource},
    },
    error::{AppError, Result},
    models::report::{DistillationReport, KeptImage, RemovedImage, RunStats},
};

use tokio_util::sync::CancellationToken;

#[allow(dead_code, unreachable_pub)]
mod built_info {
    // The file has been placed there by the build script.
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

/// Name and version recorded in every report
pub(crate) fn generator() -> String {
    format!("{} {}", built_info::PKG_NAME, built_info::PKG_VERSION)
}

/// Initialize logging and check for required system dependencies.
///
/// Call once, early, from binaries. Library code never sets up logging itself.
///
/// # Errors
///
/// Currently infallible; returns `Result` so callers can use `?`.
///
/// # Example
///
/// ```no_run
/// use framesift::init;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     init()?;
///     // Application code here
///     Ok(())
/// }
/// ```
pub fn init() -> Result<()> {
    let env = env_logger::Env::default()
        .default_filter_or("info")
        .default_write_style_or("auto");

    // A second call (e.g. from tests) keeps the first logger
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .format_module_path(false)
        .format_target(false)
        .try_init();

    log::info!("Initializing {}", generator());

    if let Err(e) = check_ffmpeg_installed() {
        log::warn!("FFmpeg is not installed or not in PATH: {}", e);
        log::warn!("Video files cannot be sampled until it is");
    }

    Ok(())
}

/// Distill the video file at `path` with a pipeline built from `config`.
///
/// This is a convenience function for the common case; build a [`Pipeline`]
/// directly to reuse it across videos or to cancel a run.
///
/// # Errors
///
/// Returns an error if the configuration is invalid, the video cannot be read,
/// or a whole stage fails.
pub async fn distill_video<P: AsRef<std::path::Path>>(path: P, config: Config) -> Result<Distillation> {
    let path = path.as_ref();
    log::debug!("Distilling video: {}", path.display());

    let pipeline = Pipeline::from_config(config)?;
    let source = FfmpegSource::new(path);
    pipeline.run(&source, &CancellationToken::new()).await
}
