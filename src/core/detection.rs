//! Client for the remote object-detection service.

use std::time::Duration;

use async_trait::async_trait;
use image::DynamicImage;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::utils::{encode_image_base64, join_url};

/// One object found in an image, in pixel coordinates of that image.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// `[x1, y1, x2, y2]`
    pub bounding_box: [f32; 4],
    /// Object class
    pub label: String,
    /// Confidence in `[0, 1]`
    pub confidence: f32,
}

/// Something that finds objects in an image.
#[async_trait]
pub trait Detector: Send + Sync {
    /// Detect objects in `image`; any error fails the whole image.
    async fn detect(&self, image: &DynamicImage) -> Result<Vec<Detection>>;
}

#[derive(Debug, Serialize)]
struct DetectRequest<'a> {
    image_base64: &'a str,
}

/// Boxes arrive either flat (`x1`..`y2`) or as a `bounding_box` array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireDetection {
    Nested {
        bounding_box: [f32; 4],
        label: String,
        confidence: f32,
    },
    Flat {
        x1: f32,
        y1: f32,
        x2: f32,
        y2: f32,
        label: String,
        confidence: f32,
    },
}

impl From<WireDetection> for Detection {
    fn from(wire: WireDetection) -> Self {
        match wire {
            WireDetection::Nested { bounding_box, label, confidence } => Detection {
                bounding_box,
                label,
                confidence,
            },
            WireDetection::Flat { x1, y1, x2, y2, label, confidence } => Detection {
                bounding_box: [x1, y1, x2, y2],
                label,
                confidence,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DetectResponse {
    Wrapped { detections: Vec<WireDetection> },
    Bare(Vec<WireDetection>),
}

/// HTTP client for a detection service exposing `POST /detect/`.
#[derive(Debug, Clone)]
pub struct HttpDetector {
    http: Client,
    base_url: String,
    image_quality: u8,
}

impl HttpDetector {
    /// Create a new detector client.
    pub fn new(base_url: impl Into<String>, timeout: Duration, image_quality: u8) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            image_quality,
        })
    }

    /// Base URL the client talks to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check whether the service answers `GET /`.
    ///
    /// Returns the response body on success.
    pub async fn health_check(&self) -> Result<String> {
        let response = self.http.get(join_url(&self.base_url, "/")).send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(AppError::DetectionCallFailed(format!(
                "health check returned {}",
                status
            )));
        }
        Ok(body.trim().to_string())
    }
}

#[async_trait]
impl Detector for HttpDetector {
    async fn detect(&self, image: &DynamicImage) -> Result<Vec<Detection>> {
        let encoded = encode_image_base64(image, self.image_quality)?;
        let url = join_url(&self.base_url, "/detect/");

        let response = self
            .http
            .post(&url)
            .json(&DetectRequest { image_base64: &encoded })
            .send()
            .await
            .map_err(|e| AppError::DetectionCallFailed(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::DetectionCallFailed(format!(
                "detection service returned {}: {}",
                status,
                body.trim()
            )));
        }

        let parsed: DetectResponse = response
            .json()
            .await
            .map_err(|e| AppError::DetectionCallFailed(format!("malformed detection response: {}", e)))?;

        let detections = match parsed {
            DetectResponse::Wrapped { detections } => detections,
            DetectResponse::Bare(detections) => detections,
        };
        Ok(detections.into_iter().map(Detection::from).collect())
    }
}
