//! Turning frames into candidate sub-images.
//!
//! A [`CropStrategy`] decides which regions of a frame are worth keeping; the
//! [`crop`] driver runs it over every frame, cuts the regions out and keeps the
//! frame visiting order. Strategies are picked once, from configuration, by
//! [`build_cropper`].

use std::fmt;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::config::{AspectRatio, CropConfig, CropStrategyKind, ServiceConfig};
use crate::core::detection::{Detector, HttpDetector};
use crate::core::video::Frame;
use crate::error::Result;
use crate::models::report::RunStats;

/// Pixel rectangle `[x1, x2) × [y1, y2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Left edge
    pub x1: u32,
    /// Top edge
    pub y1: u32,
    /// Right edge (exclusive)
    pub x2: u32,
    /// Bottom edge (exclusive)
    pub y2: u32,
}

impl BoundingBox {
    /// The box covering a whole `width × height` image
    pub fn full(width: u32, height: u32) -> Self {
        Self { x1: 0, y1: 0, x2: width, y2: height }
    }

    /// Width in pixels
    pub fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1)
    }

    /// Height in pixels
    pub fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1)
    }

    /// Area in pixels
    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {}, {})", self.x1, self.y1, self.x2, self.y2)
    }
}

/// A sub-image cut from one frame.
///
/// The frame is referenced by index only, so frames can be dropped as soon as
/// cropping is done.
#[derive(Debug, Clone)]
pub struct Crop {
    /// Position in the crop stage's output
    pub index: usize,
    /// Index of the frame this was cut from
    pub source_frame_index: usize,
    /// Region of the frame
    pub bounding_box: BoundingBox,
    /// Detected object class
    pub label: Option<String>,
    /// Detector confidence
    pub confidence: Option<f32>,
    /// The cut-out pixels
    pub image: DynamicImage,
}

/// A region a strategy wants cut out of a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CropRegion {
    /// Region of the frame
    pub bounding_box: BoundingBox,
    /// Detected object class
    pub label: Option<String>,
    /// Detector confidence
    pub confidence: Option<f32>,
}

impl CropRegion {
    fn plain(bounding_box: BoundingBox) -> Self {
        Self { bounding_box, label: None, confidence: None }
    }
}

/// Chooses the regions of a frame to keep.
#[async_trait]
pub trait CropStrategy: Send + Sync {
    /// Short name used in logs and reports
    fn name(&self) -> &'static str;

    /// Regions to cut out of `frame`, in output order.
    ///
    /// An error means the frame contributes nothing; it never aborts the run.
    async fn regions(&self, frame: &Frame) -> Result<Vec<CropRegion>>;
}

/// Expand a detector box by `margin` of its size on every side and clamp it to the image.
///
/// Returns `None` for degenerate boxes.
pub fn expand_box(raw: [f32; 4], margin: f32, width: u32, height: u32) -> Option<BoundingBox> {
    if raw.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let (x1, x2) = (raw[0].min(raw[2]), raw[0].max(raw[2]));
    let (y1, y2) = (raw[1].min(raw[3]), raw[1].max(raw[3]));
    let (mx, my) = ((x2 - x1) * margin, (y2 - y1) * margin);

    let bbox = BoundingBox {
        x1: (x1 - mx).max(0.0).floor() as u32,
        y1: (y1 - my).max(0.0).floor() as u32,
        x2: ((x2 + mx).ceil().max(0.0) as u32).min(width),
        y2: ((y2 + my).ceil().max(0.0) as u32).min(height),
    };
    (bbox.x2 > bbox.x1 && bbox.y2 > bbox.y1).then_some(bbox)
}

/// Largest region of `ratio` centered in a `width × height` image.
pub fn center_box(width: u32, height: u32, ratio: AspectRatio) -> BoundingBox {
    let (w, h) = (width as u64, height as u64);
    let (rw, rh) = (ratio.width as u64, ratio.height as u64);

    let (crop_w, crop_h) = if w * rh > h * rw {
        // wider than the target: trim left and right
        (((h * rw + rh / 2) / rh).clamp(1, w.max(1)), h)
    } else {
        // taller than the target: trim top and bottom
        (w, ((w * rh + rw / 2) / rw).clamp(1, h.max(1)))
    };

    let x1 = (w - crop_w.min(w)) / 2;
    let y1 = (h - crop_h.min(h)) / 2;
    BoundingBox {
        x1: x1 as u32,
        y1: y1 as u32,
        x2: (x1 + crop_w).min(w) as u32,
        y2: (y1 + crop_h).min(h) as u32,
    }
}

/// One crop per detected object above a confidence threshold.
#[derive(Debug)]
pub struct DetectionCropper<D> {
    detector: D,
    confidence_threshold: f32,
    margin: f32,
}

impl<D: Detector> DetectionCropper<D> {
    /// Create a cropper around `detector`.
    pub fn new(detector: D, confidence_threshold: f32, margin: f32) -> Self {
        Self { detector, confidence_threshold, margin }
    }
}

#[async_trait]
impl<D: Detector> CropStrategy for DetectionCropper<D> {
    fn name(&self) -> &'static str {
        "detection"
    }

    async fn regions(&self, frame: &Frame) -> Result<Vec<CropRegion>> {
        let mut detections = self.detector.detect(&frame.image).await?;
        let total = detections.len();
        detections.retain(|d| d.confidence >= self.confidence_threshold);
        // stable sort: equal confidences keep the detector's order
        detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        let (width, height) = (frame.image.width(), frame.image.height());
        let regions: Vec<CropRegion> = detections
            .into_iter()
            .filter_map(|d| {
                expand_box(d.bounding_box, self.margin, width, height).map(|bounding_box| CropRegion {
                    bounding_box,
                    label: Some(d.label),
                    confidence: Some(d.confidence),
                })
            })
            .collect();

        log::debug!(
            "Frame {}: {} detections, {} above {:.2}",
            frame.index,
            total,
            regions.len(),
            self.confidence_threshold
        );
        Ok(regions)
    }
}

/// Exactly one crop per frame: the largest centered region of a fixed ratio.
#[derive(Debug, Clone)]
pub struct CenterCropper {
    ratio: AspectRatio,
}

impl CenterCropper {
    /// Create a cropper for `ratio`.
    pub fn new(ratio: AspectRatio) -> Self {
        Self { ratio }
    }
}

#[async_trait]
impl CropStrategy for CenterCropper {
    fn name(&self) -> &'static str {
        "center"
    }

    async fn regions(&self, frame: &Frame) -> Result<Vec<CropRegion>> {
        let bbox = center_box(frame.image.width(), frame.image.height(), self.ratio);
        Ok(vec![CropRegion::plain(bbox)])
    }
}

/// Exactly one crop per frame covering the whole image.
#[derive(Debug, Clone, Default)]
pub struct FullFrameCropper;

#[async_trait]
impl CropStrategy for FullFrameCropper {
    fn name(&self) -> &'static str {
        "full_frame"
    }

    async fn regions(&self, frame: &Frame) -> Result<Vec<CropRegion>> {
        Ok(vec![CropRegion::plain(BoundingBox::full(
            frame.image.width(),
            frame.image.height(),
        ))])
    }
}

/// Build the strategy named by the configuration.
pub fn build_cropper(
    crop: &CropConfig,
    services: &ServiceConfig,
    image_quality: u8,
) -> Result<Box<dyn CropStrategy>> {
    Ok(match crop.strategy {
        CropStrategyKind::Center => Box::new(CenterCropper::new(crop.aspect_ratio)),
        CropStrategyKind::FullFrame => Box::new(FullFrameCropper),
        CropStrategyKind::Detection => {
            let detector = HttpDetector::new(
                services.detection_url.clone(),
                services.detection_timeout,
                image_quality,
            )?;
            Box::new(DetectionCropper::new(
                detector,
                crop.confidence_threshold,
                crop.box_margin,
            ))
        }
    })
}

/// Cut `region` out of `frame`.
fn cut(frame: &Frame, region: CropRegion, index: usize) -> Crop {
    let b = region.bounding_box;
    Crop {
        index,
        source_frame_index: frame.index,
        bounding_box: b,
        label: region.label,
        confidence: region.confidence,
        image: frame.image.crop_imm(b.x1, b.y1, b.width(), b.height()),
    }
}

/// Crops of one pass over the frames, with the frames that produced nothing because
/// their strategy call failed.
#[derive(Debug, Default)]
pub struct CropOutcome {
    /// Crops in frame order, indexed by position
    pub crops: Vec<Crop>,
    /// Indices of frames whose strategy call failed
    pub failed_frames: Vec<usize>,
}

/// Run `strategy` over every frame and cut out the chosen regions.
///
/// Up to `concurrency` frames are processed at once, but crops come back in
/// frame order. Frames whose strategy call fails contribute no crops and are
/// counted in `stats.detection_failed`.
pub async fn crop(
    frames: &[Frame],
    strategy: &dyn CropStrategy,
    concurrency: usize,
    stats: &mut RunStats,
) -> Vec<Crop> {
    crop_frames(frames, strategy, concurrency, stats).await.crops
}

/// Like [`crop`], but also reports which frames failed.
pub async fn crop_frames(
    frames: &[Frame],
    strategy: &dyn CropStrategy,
    concurrency: usize,
    stats: &mut RunStats,
) -> CropOutcome {
    let results: Vec<(&Frame, Result<Vec<CropRegion>>)> = stream::iter(frames)
        .map(|frame| async move { (frame, strategy.regions(frame).await) })
        .buffered(concurrency.max(1))
        .collect()
        .await;

    let mut outcome = CropOutcome::default();
    for (frame, result) in results {
        match result {
            Ok(regions) => {
                for region in regions {
                    let index = outcome.crops.len();
                    outcome.crops.push(cut(frame, region, index));
                }
            }
            Err(e) => {
                log::warn!("{} crop failed for frame {}: {}", strategy.name(), frame.index, e);
                stats.detection_failed += 1;
                outcome.failed_frames.push(frame.index);
            }
        }
    }

    log::info!(
        "{} cropping produced {} crops from {} frames ({} failed)",
        strategy.name(),
        outcome.crops.len(),
        frames.len(),
        outcome.failed_frames.len()
    );
    outcome
}

/// Treat every frame not listed in `skip` as a single crop.
pub(crate) fn full_frame_crops(frames: &[Frame], skip: &[usize]) -> Vec<Crop> {
    frames
        .iter()
        .filter(|frame| !skip.contains(&frame.index))
        .enumerate()
        .map(|(index, frame)| {
            let full = BoundingBox::full(frame.image.width(), frame.image.height());
            cut(frame, CropRegion::plain(full), index)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::detection::Detection;
    use crate::error::AppError;
    use image::RgbImage;

    fn frame(index: usize, width: u32, height: u32) -> Frame {
        let level = (index * 20) as u8;
        Frame {
            index,
            timestamp_seconds: index as f64,
            image: DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, image::Rgb([level, level, level]))),
        }
    }

    /// Returns canned detections, failing for frames whose gray level is listed
    struct FakeDetector {
        detections: Vec<Detection>,
        failing_levels: Vec<u8>,
    }

    #[async_trait]
    impl Detector for FakeDetector {
        async fn detect(&self, image: &DynamicImage) -> Result<Vec<Detection>> {
            let level = image.to_rgb8().get_pixel(0, 0)[0];
            if self.failing_levels.contains(&level) {
                return Err(AppError::DetectionCallFailed("HTTP 500".into()));
            }
            Ok(self.detections.clone())
        }
    }

    fn det(bbox: [f32; 4], label: &str, confidence: f32) -> Detection {
        Detection { bounding_box: bbox, label: label.into(), confidence }
    }

    #[test]
    fn test_center_box_wide_frame() {
        let b = center_box(1920, 1080, AspectRatio::default());
        assert_eq!(b, BoundingBox { x1: 240, y1: 0, x2: 1680, y2: 1080 });
    }

    #[test]
    fn test_center_box_square_frame() {
        let b = center_box(640, 640, AspectRatio::default());
        assert_eq!(b, BoundingBox { x1: 0, y1: 80, x2: 640, y2: 560 });
    }

    #[test]
    fn test_center_box_ratio_within_tolerance() {
        let ratios = ["4:3", "16:9", "1:1", "3:4", "3:2"];
        let sizes = [(1920, 1080), (1280, 720), (720, 1280), (333, 777), (1001, 999)];
        for ratio in ratios {
            let ratio: AspectRatio = ratio.parse().unwrap();
            for (w, h) in sizes {
                let b = center_box(w, h, ratio);
                assert!(b.x2 <= w && b.y2 <= h);
                // off by at most one pixel on the trimmed side
                let expected_w = b.height() as f64 * ratio.value();
                assert!(
                    (b.width() as f64 - expected_w).abs() <= ratio.value().max(1.0),
                    "{}x{} @ {}: got {}x{}",
                    w, h, ratio, b.width(), b.height()
                );
                // centered: equal trim on both sides, give or take a pixel
                assert!((b.x1 as i64 - (w - b.x2) as i64).abs() <= 1);
                assert!((b.y1 as i64 - (h - b.y2) as i64).abs() <= 1);
            }
        }
    }

    #[test]
    fn test_expand_box_margin_and_clamp() {
        let b = expand_box([10.0, 10.0, 110.0, 60.0], 0.1, 640, 480).unwrap();
        assert_eq!(b, BoundingBox { x1: 0, y1: 5, x2: 120, y2: 65 });

        let clamped = expand_box([600.0, 400.0, 640.0, 480.0], 0.5, 640, 480).unwrap();
        assert_eq!(clamped.x2, 640);
        assert_eq!(clamped.y2, 480);
    }

    #[test]
    fn test_expand_box_rejects_degenerate() {
        assert!(expand_box([5.0, 5.0, 5.0, 50.0], 0.1, 100, 100).is_none());
        assert!(expand_box([f32::NAN, 0.0, 10.0, 10.0], 0.1, 100, 100).is_none());
        assert!(expand_box([200.0, 200.0, 300.0, 300.0], 0.0, 100, 100).is_none());
    }

    #[tokio::test]
    async fn test_center_crop_one_per_frame() {
        let frames: Vec<Frame> = (0..5).map(|i| frame(i, 160, 90)).collect();
        let mut stats = RunStats::default();
        let crops = crop(&frames, &CenterCropper::new(AspectRatio::default()), 4, &mut stats).await;

        assert_eq!(crops.len(), frames.len());
        for (i, c) in crops.iter().enumerate() {
            assert_eq!(c.index, i);
            assert_eq!(c.source_frame_index, i);
            assert_eq!((c.image.width(), c.image.height()), (120, 90));
            assert!(c.label.is_none());
        }
    }

    #[tokio::test]
    async fn test_detection_filters_and_orders_by_confidence() {
        let detector = FakeDetector {
            detections: vec![
                det([0.0, 0.0, 10.0, 10.0], "cup", 0.55),
                det([20.0, 20.0, 40.0, 40.0], "person", 0.92),
                det([50.0, 10.0, 60.0, 30.0], "dog", 0.3),
                det([30.0, 0.0, 50.0, 20.0], "cat", 0.92),
            ],
            failing_levels: vec![],
        };
        let cropper = DetectionCropper::new(detector, 0.5, 0.0);
        let frames = vec![frame(0, 64, 48), frame(1, 64, 48)];
        let mut stats = RunStats::default();
        let crops = crop(&frames, &cropper, 2, &mut stats).await;

        let labels: Vec<_> = crops.iter().map(|c| c.label.clone().unwrap()).collect();
        assert_eq!(labels, ["person", "cat", "cup", "person", "cat", "cup"]);
        assert_eq!(crops[0].source_frame_index, 0);
        assert_eq!(crops[3].source_frame_index, 1);
        assert_eq!(crops[0].bounding_box, BoundingBox { x1: 20, y1: 20, x2: 40, y2: 40 });
        assert_eq!((crops[0].image.width(), crops[0].image.height()), (20, 20));
        assert!(crops.iter().enumerate().all(|(i, c)| c.index == i));
        assert_eq!(stats.detection_failed, 0);
    }

    #[tokio::test]
    async fn test_detection_failures_are_counted_not_raised() {
        let detector = FakeDetector {
            detections: vec![det([0.0, 0.0, 16.0, 16.0], "person", 0.9)],
            // frames 2, 5 and 8
            failing_levels: vec![40, 100, 160],
        };
        let cropper = DetectionCropper::new(detector, 0.5, 0.05);
        let frames: Vec<Frame> = (0..10).map(|i| frame(i, 64, 48)).collect();
        let mut stats = RunStats::default();
        let crops = crop(&frames, &cropper, 3, &mut stats).await;

        assert_eq!(stats.detection_failed, 3);
        assert_eq!(crops.len(), 7);
        let sources: Vec<_> = crops.iter().map(|c| c.source_frame_index).collect();
        assert_eq!(sources, vec![0, 1, 3, 4, 6, 7, 9]);
    }

    #[tokio::test]
    async fn test_crop_frames_reports_failed_frames() {
        let detector = FakeDetector {
            detections: Vec::new(),
            failing_levels: vec![20, 60],
        };
        let cropper = DetectionCropper::new(detector, 0.5, 0.05);
        let frames: Vec<Frame> = (0..5).map(|i| frame(i, 32, 24)).collect();
        let mut stats = RunStats::default();
        let outcome = crop_frames(&frames, &cropper, 2, &mut stats).await;

        assert!(outcome.crops.is_empty());
        assert_eq!(outcome.failed_frames, vec![1, 3]);
        let fallback = full_frame_crops(&frames, &outcome.failed_frames);
        let sources: Vec<_> = fallback.iter().map(|c| c.source_frame_index).collect();
        assert_eq!(sources, vec![0, 2, 4]);
        assert!(fallback.iter().enumerate().all(|(i, c)| c.index == i));
    }

    #[tokio::test]
    async fn test_full_frame_cropper() {
        let frames = vec![frame(0, 50, 40)];
        let mut stats = RunStats::default();
        let crops = crop(&frames, &FullFrameCropper, 1, &mut stats).await;
        assert_eq!(crops.len(), 1);
        assert_eq!(crops[0].bounding_box, BoundingBox::full(50, 40));
        assert_eq!(full_frame_crops(&frames, &[])[0].bounding_box, crops[0].bounding_box);
        assert!(full_frame_crops(&frames, &[0]).is_empty());
    }

    #[test]
    fn test_build_cropper_from_config() {
        let services = ServiceConfig::default();
        for (kind, name) in [
            (CropStrategyKind::Center, "center"),
            (CropStrategyKind::Detection, "detection"),
            (CropStrategyKind::FullFrame, "full_frame"),
        ] {
            let config = CropConfig { strategy: kind, ..CropConfig::default() };
            let cropper = build_cropper(&config, &services, 85).unwrap();
            assert_eq!(cropper.name(), name);
        }
    }
}
