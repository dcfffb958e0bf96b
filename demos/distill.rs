//! Example showing how to distill a video into its distinct objects
//!
//! Needs ffmpeg on the PATH and both services running:
//! `cargo run --example distill -- path/to/video.mp4`

use anyhow::{Context, Result};
use framesift::{init, Config, CropStrategyKind, FfmpegSource, Pipeline};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize the application
    init()?;

    let video = std::env::args()
        .nth(1)
        .context("usage: distill <video>")?;

    // Twenty frames, one crop per detected object
    let mut config = Config::default();
    config.sampler.target_count = 20;
    config.crop.strategy = CropStrategyKind::Detection;
    config.dedup.similarity_threshold = 0.9;

    let pipeline = Pipeline::from_config(config)?;
    let result = pipeline
        .run(&FfmpegSource::new(&video), &CancellationToken::new())
        .await?;

    for image in &result.report.images {
        println!(
            "frame {:>3} @ {:>7.2}s  {:<12} {}",
            image.frame_index,
            image.timestamp_seconds,
            image.label.as_deref().unwrap_or("-"),
            image.bounding_box
        );
    }

    if let Some(first) = result.report.removed.first() {
        println!(
            "crop {} was dropped as a {:.2}% match of crop {}",
            first.crop_index,
            first.similarity * 100.0,
            first.duplicate_of
        );
    }

    let stats = result.stats();
    println!(
        "{} frames -> {} images ({:.0}% removed as duplicates)",
        stats.original_frame_count,
        stats.final_image_count,
        stats.deduplication_rate * 100.0
    );

    Ok(())
}
