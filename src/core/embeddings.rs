use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use image::DynamicImage;
use ndarray::ArrayView1;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::EmbeddingConfig;
use crate::core::crop::Crop;
use crate::core::retry::{retry_async, RetryPolicy};
use crate::error::{AppError, Result};
use crate::models::report::RunStats;
use crate::utils::{encode_image_base64, join_url};

/// Embedding of one crop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingVector {
    /// Index of the crop this vector describes
    pub owner_crop_index: usize,
    /// The vector itself
    pub vector: Vec<f32>,
}

impl EmbeddingVector {
    /// Number of components
    pub fn dimension(&self) -> usize {
        self.vector.len()
    }
}

/// Compute cosine similarity between two embeddings.
///
/// Zero when either vector has zero norm or the dimensions differ; otherwise
/// clamped to `[-1, 1]`.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let a = ArrayView1::from(a);
    let b = ArrayView1::from(b);
    let dot_product = a.dot(&b);
    let norm_a = a.dot(&a).sqrt();
    let norm_b = b.dot(&b).sqrt();

    if norm_a > 0.0 && norm_b > 0.0 {
        (dot_product / (norm_a * norm_b)).clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// Something that turns a batch of images into vectors.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// One vector per image, in order. The whole batch fails or succeeds together.
    async fn embed_batch(&self, images: &[&DynamicImage]) -> Result<Vec<Vec<f32>>>;
}

#[derive(Debug, Serialize)]
struct EncodeImageRequest<'a> {
    images: Vec<String>,
    task: &'a str,
    return_multivector: bool,
}

#[derive(Debug, Deserialize)]
struct EncodeImageResponse {
    embeddings: Vec<Vec<f32>>,
}

/// HTTP client for an embedding service exposing `POST /encode-image/`.
#[derive(Debug, Clone)]
pub struct HttpEmbedder {
    http: Client,
    base_url: String,
    task: String,
    image_quality: u8,
}

impl HttpEmbedder {
    /// Create a new embedding client.
    pub fn new(
        base_url: impl Into<String>,
        task: impl Into<String>,
        timeout: Duration,
        image_quality: u8,
    ) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            task: task.into(),
            image_quality,
        })
    }

    /// Base URL the client talks to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check whether the service answers `GET /`.
    pub async fn health_check(&self) -> Result<String> {
        let response = self.http.get(join_url(&self.base_url, "/")).send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(AppError::EmbeddingBatchFailed(format!(
                "health check returned {}",
                status
            )));
        }
        Ok(body.trim().to_string())
    }
}

#[async_trait]
impl EmbeddingBackend for HttpEmbedder {
    async fn embed_batch(&self, images: &[&DynamicImage]) -> Result<Vec<Vec<f32>>> {
        let encoded = images
            .iter()
            .map(|img| encode_image_base64(img, self.image_quality))
            .collect::<Result<Vec<_>>>()?;
        let url = join_url(&self.base_url, "/encode-image/");

        let response = self
            .http
            .post(&url)
            .json(&EncodeImageRequest {
                images: encoded,
                task: &self.task,
                return_multivector: false,
            })
            .send()
            .await
            .map_err(|e| AppError::EmbeddingBatchFailed(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::EmbeddingBatchFailed(format!(
                "embedding service returned {}: {}",
                status,
                body.trim()
            )));
        }

        let parsed: EncodeImageResponse = response
            .json()
            .await
            .map_err(|e| AppError::EmbeddingBatchFailed(format!("malformed embedding response: {}", e)))?;
        Ok(parsed.embeddings)
    }
}

/// Batches crops through an [`EmbeddingBackend`], retrying failed batches.
pub struct Embedder {
    backend: Box<dyn EmbeddingBackend>,
    batch_size: usize,
    concurrency: usize,
    retry: RetryPolicy,
    expected_dimension: Option<usize>,
}

impl std::fmt::Debug for Embedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Embedder")
            .field("batch_size", &self.batch_size)
            .field("concurrency", &self.concurrency)
            .field("retry", &self.retry)
            .field("expected_dimension", &self.expected_dimension)
            .finish()
    }
}

impl Embedder {
    /// Create an embedder over `backend` using the batching and retry settings of `config`.
    pub fn new(backend: Box<dyn EmbeddingBackend>, config: &EmbeddingConfig) -> Self {
        Self {
            backend,
            batch_size: config.batch_size.max(1),
            concurrency: config.concurrency.max(1),
            retry: RetryPolicy {
                max_attempts: config.max_attempts,
                base_delay: config.base_delay,
                max_delay: config.max_delay,
            },
            expected_dimension: config.expected_dimension,
        }
    }

    /// Build an embedder talking to the HTTP service described by `config`.
    pub fn http(
        config: &EmbeddingConfig,
        base_url: &str,
        timeout: Duration,
        image_quality: u8,
    ) -> Result<Self> {
        let backend = HttpEmbedder::new(base_url, config.task.clone(), timeout, image_quality)?;
        Ok(Self::new(Box::new(backend), config))
    }

    /// One backend call, checked against the batch contract.
    async fn embed_checked(&self, images: &[&DynamicImage]) -> Result<Vec<Vec<f32>>> {
        let vectors = self.backend.embed_batch(images).await?;
        if vectors.len() != images.len() {
            return Err(AppError::EmbeddingBatchFailed(format!(
                "sent {} images, received {} vectors",
                images.len(),
                vectors.len()
            )));
        }
        if let Some(first) = vectors.first() {
            if first.is_empty() {
                return Err(AppError::EmbeddingBatchFailed("received empty vectors".into()));
            }
            if vectors.iter().any(|v| v.len() != first.len()) {
                return Err(AppError::EmbeddingBatchFailed("vectors in one batch differ in dimension".into()));
            }
        }
        Ok(vectors)
    }

    /// Embed every crop, one vector per crop, in crop order.
    ///
    /// Batches that still fail after retries are dropped; their crops are
    /// counted in `stats.embedding_failed`. A vector whose dimension differs
    /// from the rest of the run is a configuration error and aborts.
    pub async fn embed(&self, crops: &[Crop], stats: &mut RunStats) -> Result<Vec<EmbeddingVector>> {
        if crops.is_empty() {
            return Ok(Vec::new());
        }
        let batches: Vec<&[Crop]> = crops.chunks(self.batch_size).collect();
        log::info!(
            "Embedding {} crops in {} batches of up to {}",
            crops.len(),
            batches.len(),
            self.batch_size
        );

        let outcomes: Vec<_> = stream::iter(batches.into_iter().enumerate())
            .map(|(batch_no, batch)| async move {
                let images: Vec<&DynamicImage> = batch.iter().map(|c| &c.image).collect();
                let name = format!("embedding batch {}", batch_no);
                let outcome = retry_async(&self.retry, &name, || self.embed_checked(&images)).await;
                (batch_no, batch, outcome)
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut dimension = self.expected_dimension;
        let mut embedded = Vec::with_capacity(crops.len());
        for (batch_no, batch, outcome) in outcomes {
            match outcome {
                Ok(vectors) => {
                    for (crop, vector) in batch.iter().zip(vectors) {
                        match dimension {
                            Some(d) if d != vector.len() => {
                                return Err(AppError::ConfigurationInvalid(format!(
                                    "embedding dimension changed within one run: expected {}, got {} for crop {}",
                                    d,
                                    vector.len(),
                                    crop.index
                                )));
                            }
                            Some(_) => {}
                            None => dimension = Some(vector.len()),
                        }
                        embedded.push(EmbeddingVector {
                            owner_crop_index: crop.index,
                            vector,
                        });
                    }
                }
                Err(failure) => {
                    log::warn!(
                        "Dropping embedding batch {} ({} crops) after {} attempts: {}",
                        batch_no,
                        batch.len(),
                        failure.attempts,
                        failure.error
                    );
                    stats.embedding_failed += batch.len();
                    stats.embedding_failed_batches += 1;
                }
            }
        }

        log::info!(
            "Embedded {} of {} crops (dimension {:?})",
            embedded.len(),
            crops.len(),
            dimension
        );
        Ok(embedded)
    }
}
