//! The orchestrator: runs Sample → Crop → Embed → Dedup over one video.
//!
//! Every stage finishes its whole output before the next one starts. A
//! [`CancellationToken`] and the optional run timeout are checked at each stage
//! boundary and abandon whatever stage is in flight.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use image::DynamicImage;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::core::crop::{build_cropper, crop_frames, full_frame_crops, Crop, CropOutcome, CropStrategy};
use crate::core::dedup::{deduplicate, DedupResult};
use crate::core::detection::HttpDetector;
use crate::core::embeddings::{Embedder, HttpEmbedder};
use crate::core::video::{sample_frames, VideoSource};
use crate::error::{AppError, Result};
use crate::models::report::{DistillationReport, KeptImage, RemovedImage, RunStats};
use crate::utils::{crop_filename, encode_jpeg, ensure_dir_exists};

/// Name of the JSON report written by [`Distillation::save`]
pub const REPORT_FILE_NAME: &str = "visual_processing_results.json";

/// Sub-directory of the output directory holding the kept crops
pub const CROPS_DIR_NAME: &str = "crops";

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Reachability of one remote service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatus {
    /// `detection` or `embedding`
    pub name: &'static str,
    /// Base URL that was probed
    pub url: String,
    /// Whether `GET /` answered with a success status
    pub healthy: bool,
    /// Response body, or the error
    pub message: String,
}

/// Result of a successful run: the report plus the pixels of every kept image.
#[derive(Debug)]
pub struct Distillation {
    /// Provenance and statistics
    pub report: DistillationReport,
    /// Kept crops, parallel to `report.images`
    pub images: Vec<DynamicImage>,
    /// Raw deduplication outcome
    pub dedup: DedupResult,
}

impl Distillation {
    /// Aggregate statistics of the run
    pub fn stats(&self) -> &RunStats {
        &self.report.stats
    }

    /// Write kept crops as JPEG under `dir/crops/` and the report as
    /// `dir/visual_processing_results.json`.
    ///
    /// Each kept image's `path` in the report is set relative to `dir`.
    /// Returns the report path.
    pub fn save(&mut self, dir: impl AsRef<Path>, image_quality: u8) -> Result<PathBuf> {
        let dir = dir.as_ref();
        let crops_dir = dir.join(CROPS_DIR_NAME);
        ensure_dir_exists(&crops_dir)?;

        for (kept, image) in self.report.images.iter_mut().zip(&self.images) {
            let name = crop_filename(kept.frame_index, kept.crop_index, kept.label.as_deref());
            std::fs::write(crops_dir.join(&name), encode_jpeg(image, image_quality)?)?;
            kept.path = Some(format!("{}/{}", CROPS_DIR_NAME, name));
        }

        self.save_report(dir)
    }

    /// Write only the JSON report into `dir`.
    pub fn save_report(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let dir = dir.as_ref();
        ensure_dir_exists(dir)?;
        let report_path = dir.join(REPORT_FILE_NAME);
        self.report.write_to(&report_path)?;
        log::info!(
            "Saved report with {} images to {}",
            self.report.images.len(),
            report_path.display()
        );
        Ok(report_path)
    }
}

/// Applies cancellation and the run deadline to each stage.
struct StageGuard<'a> {
    cancel: &'a CancellationToken,
    deadline: Option<tokio::time::Instant>,
    budget: Duration,
}

impl<'a> StageGuard<'a> {
    fn new(cancel: &'a CancellationToken, run_timeout: Option<Duration>) -> Self {
        Self {
            cancel,
            deadline: run_timeout.map(|t| tokio::time::Instant::now() + t),
            budget: run_timeout.unwrap_or_default(),
        }
    }

    async fn run<F: Future>(&self, stage: &'static str, work: F) -> Result<F::Output> {
        if self.cancel.is_cancelled() {
            return Err(AppError::Cancelled(stage));
        }
        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                log::warn!("Run cancelled during {}", stage);
                Err(AppError::Cancelled(stage))
            }
            _ = deadline => {
                log::warn!("Run exceeded {:?} during {}", self.budget, stage);
                Err(AppError::TimedOut(self.budget))
            }
            output = work => Ok(output),
        }
    }
}

/// A configured distillation pipeline, reusable across runs.
///
/// Runs share nothing mutable: each one owns its own [`RunStats`].
pub struct Pipeline {
    config: Config,
    cropper: Box<dyn CropStrategy>,
    embedder: Embedder,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("cropper", &self.cropper.name())
            .field("embedder", &self.embedder)
            .field("config", &self.config)
            .finish()
    }
}

impl Pipeline {
    /// Build a pipeline talking to the services named in `config`.
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        let quality = config.output.image_quality;
        let cropper = build_cropper(&config.crop, &config.services, quality)?;
        let embedder = Embedder::http(
            &config.embedding,
            &config.services.embedding_url,
            config.services.embedding_timeout,
            quality,
        )?;
        Ok(Self { config, cropper, embedder })
    }

    /// Build a pipeline from explicit stage implementations.
    pub fn new(config: Config, cropper: Box<dyn CropStrategy>, embedder: Embedder) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, cropper, embedder })
    }

    /// Configuration the pipeline was built with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Probe both remote services. Never fails; problems show up as unhealthy entries.
    pub async fn check_services(&self) -> Vec<ServiceStatus> {
        let services = &self.config.services;
        let quality = self.config.output.image_quality;
        let (detection, embedding) = tokio::join!(
            probe_detector(&services.detection_url, quality),
            probe_embedder(&services.embedding_url, &self.config.embedding.task, quality),
        );
        vec![
            service_status("detection", &services.detection_url, detection),
            service_status("embedding", &services.embedding_url, embedding),
        ]
    }

    /// Distill `source` into its kept images.
    ///
    /// Fails on an unreadable source, on a stage that produced nothing usable,
    /// on cancellation through `cancel` and when the run timeout elapses.
    pub async fn run(&self, source: &dyn VideoSource, cancel: &CancellationToken) -> Result<Distillation> {
        let started = Instant::now();
        let guard = StageGuard::new(cancel, self.config.run_timeout);
        let mut stats = RunStats::default();
        log::info!(
            "Distilling {} ({} cropping, threshold {:.2})",
            source.describe(),
            self.cropper.name(),
            self.config.dedup.similarity_threshold
        );

        let frames = guard
            .run("sample", sample_frames(source, &self.config.sampler, &mut stats))
            .await??;

        let CropOutcome {
            mut crops,
            failed_frames,
        } = guard
            .run(
                "crop",
                crop_frames(
                    &frames,
                    self.cropper.as_ref(),
                    self.config.crop.detection_concurrency,
                    &mut stats,
                ),
            )
            .await?;
        if crops.is_empty() {
            if failed_frames.len() >= frames.len() {
                return Err(AppError::StageFailed {
                    stage: "crop",
                    message: format!("{} cropping failed for all {} frames", self.cropper.name(), frames.len()),
                });
            }
            // frames whose call failed stay excluded
            log::warn!(
                "No regions found in {} frames, falling back to full frames",
                frames.len() - failed_frames.len()
            );
            crops = full_frame_crops(&frames, &failed_frames);
            stats.fell_back_to_full_frames = true;
        }
        // crops refer back to frames by index only
        let frame_times: Vec<f64> = frames.iter().map(|f| f.timestamp_seconds).collect();
        drop(frames);
        stats.images_before_dedup = crops.len();

        let vectors = guard.run("embed", self.embedder.embed(&crops, &mut stats)).await??;
        if vectors.is_empty() {
            return Err(AppError::StageFailed {
                stage: "embed",
                message: format!("all {} crops failed to embed", crops.len()),
            });
        }

        let threshold = self.config.dedup.similarity_threshold;
        let dedup = guard.run("dedup", async { deduplicate(&vectors, threshold) }).await?;

        stats.final_image_count = dedup.kept_count();
        stats.removed_duplicate_count = dedup.removed_count();
        stats.deduplication_rate = dedup.deduplication_rate;

        let distillation = self.assemble(source, crops, &frame_times, dedup, stats);
        let s = distillation.stats();
        log::info!(
            "Distilled {} frames into {} images in {:.2?} ({} before dedup, {} duplicates, {} frame/{} detection/{} embedding failures)",
            s.original_frame_count,
            s.final_image_count,
            started.elapsed(),
            s.images_before_dedup,
            s.removed_duplicate_count,
            s.frames_failed,
            s.detection_failed,
            s.embedding_failed
        );
        Ok(distillation)
    }

    /// Attach provenance to the dedup outcome and build the report.
    fn assemble(
        &self,
        source: &dyn VideoSource,
        crops: Vec<Crop>,
        frame_times: &[f64],
        dedup: DedupResult,
        stats: RunStats,
    ) -> Distillation {
        let timestamp_of = |frame_index: usize| frame_times.get(frame_index).copied().unwrap_or_default();
        let mut crops: Vec<Option<Crop>> = crops.into_iter().map(Some).collect();

        let removed = dedup
            .removed
            .iter()
            .filter_map(|r| {
                let c = crops.get(r.index)?.as_ref()?;
                Some(RemovedImage {
                    crop_index: r.index,
                    frame_index: c.source_frame_index,
                    timestamp_seconds: timestamp_of(c.source_frame_index),
                    duplicate_of: r.duplicate_of,
                    similarity: r.similarity,
                })
            })
            .collect();

        let mut kept = Vec::with_capacity(dedup.kept.len());
        let mut images = Vec::with_capacity(dedup.kept.len());
        for &index in &dedup.kept {
            if let Some(c) = crops.get_mut(index).and_then(Option::take) {
                kept.push(KeptImage {
                    crop_index: index,
                    frame_index: c.source_frame_index,
                    timestamp_seconds: timestamp_of(c.source_frame_index),
                    bounding_box: c.bounding_box,
                    label: c.label,
                    confidence: c.confidence,
                    path: None,
                });
                images.push(c.image);
            }
        }

        let report = DistillationReport {
            run_id: Uuid::new_v4(),
            generated_at: chrono::Utc::now().to_rfc3339(),
            generator: crate::generator(),
            source: source.describe(),
            crop_strategy: self.cropper.name().to_string(),
            similarity_threshold: dedup.similarity_threshold,
            images: kept,
            removed,
            stats,
        };
        Distillation { report, images, dedup }
    }
}

async fn probe_detector(url: &str, quality: u8) -> Result<String> {
    HttpDetector::new(url, HEALTH_CHECK_TIMEOUT, quality)?.health_check().await
}

async fn probe_embedder(url: &str, task: &str, quality: u8) -> Result<String> {
    HttpEmbedder::new(url, task, HEALTH_CHECK_TIMEOUT, quality)?.health_check().await
}

fn service_status(name: &'static str, url: &str, outcome: Result<String>) -> ServiceStatus {
    match outcome {
        Ok(message) => {
            log::info!("{} service at {} is up", name, url);
            ServiceStatus { name, url: url.to_string(), healthy: true, message }
        }
        Err(e) => {
            log::warn!("{} service at {} is unavailable: {}", name, url, e);
            ServiceStatus { name, url: url.to_string(), healthy: false, message: e.to_string() }
        }
    }
}
