//! The distillation stages and the pipeline that sequences them

/// Region cropping strategies and the crop stage driver.
pub mod crop;
/// Greedy cosine-similarity deduplication.
pub mod dedup;
/// Client for the remote object-detection service.
pub mod detection;
/// Embedding service client, batching and cosine similarity.
pub mod embeddings;
/// Stage sequencing, cancellation and result persistence.
pub mod pipeline;
/// Exponential backoff for remote calls.
pub mod retry;
/// Video sources and frame sampling.
pub mod video;
