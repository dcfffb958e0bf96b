use std::time::Duration;

use assert_fs::prelude::*;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{DynamicImage, RgbImage};
use predicates::prelude::*;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use framesift::core::crop::{crop, DetectionCropper, FullFrameCropper};
use framesift::core::detection::HttpDetector;
use framesift::core::embeddings::{Embedder, HttpEmbedder};
use framesift::{
    deduplicate, AppError, Config, CropStrategyKind, EmbeddingVector, InMemorySource, Pipeline,
    RunStats,
};

/// Ten one-second 64x48 frames with gray levels 0, 20, .., 180
fn video() -> InMemorySource {
    let images = (0..10u8)
        .map(|i| DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 48, image::Rgb([i * 20; 3]))))
        .collect();
    InMemorySource::new("lecture.mp4", images, 1.0).unwrap()
}

/// Recover the frame number from a base64 JPEG of a solid gray frame
fn frame_number(encoded: &str) -> usize {
    let bytes = STANDARD.decode(encoded).unwrap();
    let level = image::load_from_memory(&bytes).unwrap().to_rgb8().get_pixel(0, 0)[0];
    (level as usize + 10) / 20
}

fn body(request: &Request) -> Value {
    serde_json::from_slice(&request.body).unwrap()
}

/// One confident detection per frame; HTTP 500 for the listed frames
struct Detections {
    failing: Vec<usize>,
}

impl Respond for Detections {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let frame = frame_number(body(request)["image_base64"].as_str().unwrap());
        if self.failing.contains(&frame) {
            return ResponseTemplate::new(500).set_body_string("model crashed");
        }
        ResponseTemplate::new(200).set_body_json(json!({
            "detections": [
                {"bounding_box": [8.0, 8.0, 40.0, 40.0], "label": "person", "confidence": 0.9},
                {"bounding_box": [0.0, 0.0, 10.0, 10.0], "label": "cup", "confidence": 0.2}
            ]
        }))
    }
}

/// One-hot vectors keyed by frame number, or the same vector for everything
struct Embeddings {
    identical: bool,
    rejected_frame: Option<usize>,
}

impl Respond for Embeddings {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let frames: Vec<usize> = body(request)["images"]
            .as_array()
            .unwrap()
            .iter()
            .map(|img| frame_number(img.as_str().unwrap()))
            .collect();
        if self.rejected_frame.map_or(false, |f| frames.contains(&f)) {
            return ResponseTemplate::new(400).set_body_string("image too large");
        }
        let embeddings: Vec<Vec<f32>> = frames
            .iter()
            .map(|&f| {
                let mut v = vec![0.0; 10];
                v[if self.identical { 0 } else { f }] = 1.0;
                v
            })
            .collect();
        ResponseTemplate::new(200).set_body_json(json!({ "embeddings": embeddings }))
    }
}

async fn services(detections: Detections, embeddings: Embeddings) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/detect/"))
        .respond_with(detections)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/encode-image/"))
        .respond_with(embeddings)
        .mount(&server)
        .await;
    server
}

fn config_for(server: &MockServer) -> Config {
    let mut config = Config::default();
    config.sampler.target_count = 10;
    config.services.detection_url = server.uri();
    config.services.embedding_url = server.uri();
    config.embedding.base_delay = Duration::from_millis(1);
    config.embedding.max_delay = Duration::from_millis(5);
    config
}

#[tokio::test]
async fn test_detection_failures_on_three_of_ten_frames() {
    let server = services(
        Detections { failing: vec![2, 5, 8] },
        Embeddings { identical: false, rejected_frame: None },
    )
    .await;
    let mut config = config_for(&server);
    config.crop.strategy = CropStrategyKind::Detection;

    let result = Pipeline::from_config(config)
        .unwrap()
        .run(&video(), &CancellationToken::new())
        .await
        .unwrap();

    let stats = result.stats();
    assert_eq!(stats.original_frame_count, 10);
    assert_eq!(stats.detection_failed, 3);
    assert_eq!(stats.images_before_dedup, 7);
    assert_eq!(stats.final_image_count, 7);

    let frames: Vec<_> = result.report.images.iter().map(|i| i.frame_index).collect();
    assert_eq!(frames, vec![0, 1, 3, 4, 6, 7, 9]);
    for image in &result.report.images {
        assert_eq!(image.label.as_deref(), Some("person"));
        assert_eq!(image.confidence, Some(0.9));
        assert_eq!(image.timestamp_seconds, image.frame_index as f64);
        // 32px box grown by 1.6px per side, rounded outwards
        assert_eq!(image.bounding_box.width(), 36);
    }
}

#[tokio::test]
async fn test_crop_stage_against_detection_service() {
    let server = services(
        Detections { failing: vec![3] },
        Embeddings { identical: false, rejected_frame: None },
    )
    .await;
    let detector = HttpDetector::new(server.uri(), Duration::from_secs(5), 90).unwrap();
    let cropper = DetectionCropper::new(detector, 0.1, 0.0);

    // samples land on frames 1, 3, 6 and 8
    let frames = framesift::sample(&video(), 4, None).await.unwrap();
    let mut stats = RunStats::default();
    let crops = crop(&frames, &cropper, 2, &mut stats).await;

    assert_eq!(stats.detection_failed, 1);
    // both detections clear a 0.1 threshold; higher confidence first
    let labels: Vec<_> = crops.iter().map(|c| c.label.clone().unwrap()).collect();
    assert_eq!(labels, ["person", "cup", "person", "cup", "person", "cup"]);
}

#[tokio::test]
async fn test_embedding_retries_transient_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/encode-image/"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/encode-image/"))
        .respond_with(Embeddings { identical: false, rejected_frame: None })
        .mount(&server)
        .await;

    let config = config_for(&server);
    let backend = HttpEmbedder::new(server.uri(), "retrieval", Duration::from_secs(5), 90).unwrap();
    let embedder = Embedder::new(Box::new(backend), &config.embedding);

    let frames = framesift::sample(&video(), 3, None).await.unwrap();
    let mut stats = RunStats::default();
    let crops = crop(&frames, &FullFrameCropper, 1, &mut stats).await;
    let vectors = embedder.embed(&crops, &mut stats).await.unwrap();

    assert_eq!(vectors.len(), 3);
    assert_eq!(stats.embedding_failed, 0);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_rejected_batch_is_retried_then_dropped() {
    let server = services(
        Detections { failing: vec![] },
        Embeddings { identical: false, rejected_frame: Some(3) },
    )
    .await;
    let mut config = config_for(&server);
    config.embedding.batch_size = 2;

    let result = Pipeline::from_config(config)
        .unwrap()
        .run(&video(), &CancellationToken::new())
        .await
        .unwrap();

    let stats = result.stats();
    assert_eq!(stats.images_before_dedup, 10);
    assert_eq!(stats.embedding_failed, 2);
    assert_eq!(stats.embedding_failed_batches, 1);
    assert_eq!(stats.final_image_count, 8);
    let frames: Vec<_> = result.report.images.iter().map(|i| i.frame_index).collect();
    assert_eq!(frames, vec![0, 1, 4, 5, 6, 7, 8, 9]);

    // four good batches once, the rejected one for every attempt
    let embed_calls = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/encode-image/")
        .count();
    assert_eq!(embed_calls, 4 + 3);
}

#[tokio::test]
async fn test_identical_frames_collapse_and_save() {
    let server = services(
        Detections { failing: vec![] },
        Embeddings { identical: true, rejected_frame: None },
    )
    .await;
    let config = config_for(&server);

    let mut result = Pipeline::from_config(config)
        .unwrap()
        .run(&video(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.stats().final_image_count, 1);
    assert_eq!(result.stats().removed_duplicate_count, 9);
    assert!(result.report.removed.iter().all(|r| r.duplicate_of == 0));

    let out = assert_fs::TempDir::new().unwrap();
    result.save(out.path(), 85).unwrap();

    out.child("crops").assert(predicate::path::is_dir());
    out.child("crops/frame_000000_crop_0000.jpg")
        .assert(predicate::path::is_file());
    out.child("visual_processing_results.json")
        .assert(predicate::str::contains("\"final_image_count\": 1"))
        .assert(predicate::str::contains("\"deduplication_rate\": 0.9"))
        .assert(predicate::str::contains("\"path\": \"crops/frame_000000_crop_0000.jpg\""));
}

#[tokio::test]
async fn test_unreachable_embedding_service_fails_the_stage() {
    let server = services(
        Detections { failing: vec![] },
        Embeddings { identical: false, rejected_frame: None },
    )
    .await;
    let mut config = config_for(&server);
    config.services.embedding_url = "http://127.0.0.1:9".into();
    config.embedding.max_attempts = 2;

    let err = Pipeline::from_config(config)
        .unwrap()
        .run(&video(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::StageFailed { stage: "embed", .. }));
    assert_eq!(err.to_json().kind, "stage_failed");
}

#[tokio::test]
async fn test_check_services() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let mut config = config_for(&server);
    config.services.embedding_url = "http://127.0.0.1:9".into();
    let statuses = Pipeline::from_config(config).unwrap().check_services().await;

    assert_eq!(statuses[0].name, "detection");
    assert!(statuses[0].healthy);
    assert_eq!(statuses[0].message, "ok");
    assert_eq!(statuses[1].name, "embedding");
    assert!(!statuses[1].healthy);
}

#[test]
fn test_dedup_identical_then_orthogonal() {
    let mut raw = vec![vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0]; 5];
    for axis in 1..6 {
        let mut v = vec![0.0; 6];
        v[axis] = 1.0;
        raw.push(v);
    }
    let vectors: Vec<EmbeddingVector> = raw
        .into_iter()
        .enumerate()
        .map(|(owner_crop_index, vector)| EmbeddingVector { owner_crop_index, vector })
        .collect();

    let result = deduplicate(&vectors, 0.95);
    assert_eq!(result.kept, vec![0, 5, 6, 7, 8, 9]);
    assert_eq!(result.removed.iter().map(|r| r.index).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    assert!(result.removed.iter().all(|r| r.duplicate_of == 0));
    assert!((result.deduplication_rate - 0.4).abs() < 1e-12);
}

#[test]
fn test_empty_dedup_is_not_an_error() {
    let result = deduplicate(&[], 0.95);
    assert!(result.kept.is_empty() && result.removed.is_empty());
    assert_eq!(result.deduplication_rate, 0.0);
}
