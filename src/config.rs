//! Run configuration: defaults, environment overrides and validation.

use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Configuration for one distillation run
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Frame sampling
    pub sampler: SamplerConfig,
    /// Region cropping
    pub crop: CropConfig,
    /// Vector embedding
    pub embedding: EmbeddingConfig,
    /// Deduplication
    pub dedup: DedupConfig,
    /// Remote service endpoints
    pub services: ServiceConfig,
    /// Where and how results are written
    pub output: OutputConfig,
    /// Upper bound on the wall-clock time of a whole run
    pub run_timeout: Option<Duration>,
}

/// A `[start, start + duration)` window of the source, in seconds
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Offset from the beginning of the video
    pub start: f64,
    /// Length of the window; `None` runs to the end of the video
    pub duration: Option<f64>,
}

/// How sample timestamps are chosen
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SamplingMode {
    /// Split the window into `target_count` equal intervals, one sample each
    Uniform,
    /// One sample every `1 / fps` seconds, capped at `target_count`
    FixedRate {
        /// Samples per second
        fps: f64,
    },
}

/// Frame sampling configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Upper bound on frames returned
    pub target_count: usize,
    /// Optional window of the source to sample from
    pub time_range: Option<TimeRange>,
    /// Sampling policy
    pub mode: SamplingMode,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            target_count: 50,
            time_range: None,
            mode: SamplingMode::Uniform,
        }
    }
}

/// Which crop strategy the pipeline builds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CropStrategyKind {
    /// Largest centered region of a fixed aspect ratio
    Center,
    /// One crop per detected object
    Detection,
    /// The whole frame, untouched
    FullFrame,
}

impl FromStr for CropStrategyKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "center" => Ok(Self::Center),
            "detection" | "yolo" => Ok(Self::Detection),
            "full_frame" | "full" | "none" => Ok(Self::FullFrame),
            other => Err(AppError::ConfigurationInvalid(format!(
                "unknown crop strategy '{}'",
                other
            ))),
        }
    }
}

/// Width-to-height ratio, written as `"W:H"`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AspectRatio {
    /// Horizontal term
    pub width: u32,
    /// Vertical term
    pub height: u32,
}

impl AspectRatio {
    /// Create a new ratio; both terms must be positive
    pub fn new(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(AppError::ConfigurationInvalid(format!(
                "aspect ratio terms must be positive, got {}:{}",
                width, height
            )));
        }
        Ok(Self { width, height })
    }

    /// The ratio as a float
    pub fn value(&self) -> f64 {
        self.width as f64 / self.height as f64
    }
}

impl Default for AspectRatio {
    fn default() -> Self {
        Self { width: 4, height: 3 }
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.width, self.height)
    }
}

impl FromStr for AspectRatio {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || AppError::ConfigurationInvalid(format!("invalid aspect ratio '{}'", s));
        let (w, h) = s.trim().split_once(':').ok_or_else(invalid)?;
        let w = w.trim().parse::<u32>().map_err(|_| invalid())?;
        let h = h.trim().parse::<u32>().map_err(|_| invalid())?;
        Self::new(w, h)
    }
}

impl TryFrom<String> for AspectRatio {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<AspectRatio> for String {
    fn from(ratio: AspectRatio) -> Self {
        ratio.to_string()
    }
}

/// Region cropping configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CropConfig {
    /// Strategy selected for the run
    pub strategy: CropStrategyKind,
    /// Detections below this confidence are discarded
    pub confidence_threshold: f32,
    /// Fraction of a detection's width/height added on each side
    pub box_margin: f32,
    /// Target ratio for center crops
    pub aspect_ratio: AspectRatio,
    /// Detection requests in flight at once
    pub detection_concurrency: usize,
}

impl Default for CropConfig {
    fn default() -> Self {
        Self {
            strategy: CropStrategyKind::Center,
            confidence_threshold: 0.5,
            box_margin: 0.05,
            aspect_ratio: AspectRatio::default(),
            detection_concurrency: 4,
        }
    }
}

/// Vector embedding configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Images per request
    pub batch_size: usize,
    /// Attempts per batch, including the first
    pub max_attempts: u32,
    /// First backoff delay; doubles on each retry
    pub base_delay: Duration,
    /// Ceiling on a single backoff delay
    pub max_delay: Duration,
    /// Task-mode tag sent with every request
    pub task: String,
    /// Batch requests in flight at once
    pub concurrency: usize,
    /// Dimension every vector must have, if known up front
    pub expected_dimension: Option<usize>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            task: String::from("retrieval"),
            concurrency: 1,
            expected_dimension: None,
        }
    }
}

/// Deduplication configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Cosine similarity above which an image is a duplicate
    pub similarity_threshold: f32,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.95,
        }
    }
}

/// Remote service endpoints
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Base URL of the object detection service
    pub detection_url: String,
    /// Base URL of the embedding service
    pub embedding_url: String,
    /// Per-request timeout for detection
    pub detection_timeout: Duration,
    /// Per-request timeout for embedding
    pub embedding_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            detection_url: String::from("http://localhost:8761"),
            embedding_url: String::from("http://localhost:8762"),
            detection_timeout: Duration::from_secs(30),
            embedding_timeout: Duration::from_secs(120),
        }
    }
}

/// Output configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory receiving the report and kept images
    pub dir: PathBuf,
    /// JPEG quality for saved images and encoded requests
    pub image_quality: u8,
    /// Whether kept crops are written next to the report
    pub save_images: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("output"),
            image_quality: 85,
            save_images: true,
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env_var(key) {
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            AppError::ConfigurationInvalid(format!("{} has an invalid value '{}'", key, raw))
        }),
        None => Ok(None),
    }
}

impl Config {
    /// Defaults overridden by `FRAMESIFT_*` environment variables.
    ///
    /// A `.env` file in the working directory is loaded first when present.
    /// The result is validated before it is returned.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let mut config = Self::default();

        if let Some(n) = env_parse::<usize>("FRAMESIFT_TARGET_COUNT")? {
            config.sampler.target_count = n;
        }
        if let Some(start) = env_parse::<f64>("FRAMESIFT_START")? {
            config.sampler.time_range = Some(TimeRange {
                start,
                duration: env_parse::<f64>("FRAMESIFT_DURATION")?,
            });
        } else if let Some(duration) = env_parse::<f64>("FRAMESIFT_DURATION")? {
            config.sampler.time_range = Some(TimeRange {
                start: 0.0,
                duration: Some(duration),
            });
        }
        if let Some(fps) = env_parse::<f64>("FRAMESIFT_SAMPLE_FPS")? {
            config.sampler.mode = SamplingMode::FixedRate { fps };
        }
        if let Some(kind) = env_parse::<CropStrategyKind>("FRAMESIFT_CROP_MODE")? {
            config.crop.strategy = kind;
        }
        if let Some(c) = env_parse::<f32>("FRAMESIFT_CROP_CONFIDENCE")? {
            config.crop.confidence_threshold = c;
        }
        if let Some(ratio) = env_parse::<AspectRatio>("FRAMESIFT_ASPECT_RATIO")? {
            config.crop.aspect_ratio = ratio;
        }
        if let Some(n) = env_parse::<usize>("FRAMESIFT_BATCH_SIZE")? {
            config.embedding.batch_size = n;
        }
        if let Some(t) = env_parse::<f32>("FRAMESIFT_SIMILARITY_THRESHOLD")? {
            config.dedup.similarity_threshold = t;
        }
        if let Some(url) = env_var("FRAMESIFT_DETECTION_URL") {
            config.services.detection_url = url;
        }
        if let Some(url) = env_var("FRAMESIFT_EMBEDDING_URL") {
            config.services.embedding_url = url;
        }
        if let Some(dir) = env_var("FRAMESIFT_OUTPUT_DIR") {
            config.output.dir = PathBuf::from(dir);
        }
        if let Some(secs) = env_parse::<u64>("FRAMESIFT_RUN_TIMEOUT_SECS")? {
            config.run_timeout = Some(Duration::from_secs(secs));
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations no stage could run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(AppError::ConfigurationInvalid(msg));

        if self.sampler.target_count == 0 {
            return invalid("target_count must be positive".into());
        }
        if let Some(range) = &self.sampler.time_range {
            if !range.start.is_finite() || range.start < 0.0 {
                return invalid(format!("time range start must be >= 0, got {}", range.start));
            }
            if let Some(d) = range.duration {
                if !d.is_finite() || d <= 0.0 {
                    return invalid(format!("time range duration must be positive, got {}", d));
                }
            }
        }
        if let SamplingMode::FixedRate { fps } = self.sampler.mode {
            if !fps.is_finite() || fps <= 0.0 {
                return invalid(format!("sampling fps must be positive, got {}", fps));
            }
        }

        let threshold = self.dedup.similarity_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return invalid(format!("similarity_threshold must be in [0, 1], got {}", threshold));
        }
        let confidence = self.crop.confidence_threshold;
        if !(0.0..=1.0).contains(&confidence) {
            return invalid(format!("confidence_threshold must be in [0, 1], got {}", confidence));
        }
        if !self.crop.box_margin.is_finite() || self.crop.box_margin < 0.0 {
            return invalid(format!("box_margin must be >= 0, got {}", self.crop.box_margin));
        }
        if self.crop.aspect_ratio.width == 0 || self.crop.aspect_ratio.height == 0 {
            return invalid(format!("aspect ratio {} is degenerate", self.crop.aspect_ratio));
        }
        if self.crop.detection_concurrency == 0 {
            return invalid("detection_concurrency must be positive".into());
        }

        if self.embedding.batch_size == 0 {
            return invalid("batch_size must be positive".into());
        }
        if self.embedding.max_attempts == 0 {
            return invalid("max_attempts must be positive".into());
        }
        if self.embedding.concurrency == 0 {
            return invalid("embedding concurrency must be positive".into());
        }
        if self.embedding.expected_dimension == Some(0) {
            return invalid("expected_dimension must be positive".into());
        }
        if self.output.image_quality == 0 || self.output.image_quality > 100 {
            return invalid(format!(
                "image_quality must be in 1..=100, got {}",
                self.output.image_quality
            ));
        }

        Ok(())
    }
}
