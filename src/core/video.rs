use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;

use async_trait::async_trait;
use image::DynamicImage;
use serde::Deserialize;
use tokio::process::Command;

use crate::config::{SamplerConfig, SamplingMode, TimeRange};
use crate::error::{AppError, Result};
use crate::models::report::RunStats;

/// A decoded still frame at a known position in the video.
#[derive(Debug, Clone)]
pub struct Frame {
    /// 0-based, contiguous over the frames actually returned
    pub index: usize,
    /// Presentation time of the frame
    pub timestamp_seconds: f64,
    /// Decoded pixels
    pub image: DynamicImage,
}

/// Basic properties of a video source
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    /// Total duration in seconds
    pub duration: f64,
    /// Frame rate, when the container reports one
    pub fps: Option<f64>,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

/// Anything frames can be decoded from at arbitrary timestamps.
#[async_trait]
pub trait VideoSource: Send + Sync {
    /// Human-readable name for logs and reports
    fn describe(&self) -> String;

    /// Open the source and read its properties.
    ///
    /// Failing here means the source is unreadable as a whole.
    async fn probe(&self) -> Result<VideoInfo>;

    /// Decode the frame shown at `timestamp` seconds.
    async fn frame_at(&self, timestamp: f64) -> Result<DynamicImage>;
}

/// Checks if FFmpeg and FFprobe are installed and available in the system path
pub fn check_ffmpeg_installed() -> Result<()> {
    for tool in ["ffmpeg", "ffprobe"] {
        let output = std::process::Command::new(tool)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|_| {
                AppError::SourceUnreadable(format!("{} is not installed or not in system PATH", tool))
            })?;

        if !output.success() {
            return Err(AppError::SourceUnreadable(format!("{} -version failed", tool)));
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: String,
    width: Option<u32>,
    height: Option<u32>,
    duration: Option<String>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
}

/// Parse an ffprobe rational such as `30000/1001`; `0/0` yields `None`
fn parse_frame_rate(raw: &str) -> Option<f64> {
    let fps = match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => raw.trim().parse().ok()?,
    };
    (fps.is_finite() && fps > 0.0).then_some(fps)
}

/// The `-ss` argument that lands inside the frame shown at `timestamp`.
///
/// With a known frame rate this aims at the middle of the frame's interval, so
/// neither rounding nor non-integer rates like 30000/1001 pick a neighbor.
fn seek_position(timestamp: f64, fps: Option<f64>) -> String {
    let target = match fps {
        Some(fps) => timestamp + 0.5 / fps,
        None => timestamp,
    };
    format!("{:.6}", target)
}

/// A video file decoded by the `ffmpeg`/`ffprobe` command line tools.
#[derive(Debug, Clone)]
pub struct FfmpegSource {
    path: PathBuf,
    // frame rate, known once the file has been opened
    fps: OnceLock<Option<f64>>,
}

impl FfmpegSource {
    /// Creates a new `FfmpegSource` for the file at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            fps: OnceLock::new(),
        }
    }

    /// Path of the underlying file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl VideoSource for FfmpegSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn probe(&self) -> Result<VideoInfo> {
        if !self.path.exists() {
            return Err(AppError::SourceUnreadable(format!(
                "input file not found: {}",
                self.path.display()
            )));
        }

        let output = Command::new("ffprobe")
            .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(&self.path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| AppError::SourceUnreadable(format!("failed to spawn ffprobe: {}", e)))?;

        if !output.status.success() {
            return Err(AppError::SourceUnreadable(format!(
                "ffprobe could not open {}: {}",
                self.path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let probe: FfprobeOutput = serde_json::from_slice(&output.stdout)
            .map_err(|e| AppError::SourceUnreadable(format!("unexpected ffprobe output: {}", e)))?;

        let stream = probe
            .streams
            .iter()
            .find(|s| s.codec_type == "video")
            .ok_or_else(|| AppError::SourceUnreadable("no video stream found".to_string()))?;

        let duration = probe
            .format
            .duration
            .as_deref()
            .or(stream.duration.as_deref())
            .and_then(|d| d.parse::<f64>().ok())
            .filter(|d| d.is_finite() && *d > 0.0)
            .ok_or_else(|| AppError::SourceUnreadable("video reports no duration".to_string()))?;

        let fps = stream
            .avg_frame_rate
            .as_deref()
            .and_then(parse_frame_rate)
            .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate));

        let _ = self.fps.set(fps);
        Ok(VideoInfo {
            duration,
            fps,
            width: stream.width.unwrap_or(0),
            height: stream.height.unwrap_or(0),
        })
    }

    async fn frame_at(&self, timestamp: f64) -> Result<DynamicImage> {
        // Input-side -ss seeks to the nearest keyframe, then decodes up to the exact time
        let seek = seek_position(timestamp, self.fps.get().copied().flatten());
        let output = Command::new("ffmpeg")
            .arg("-hide_banner")
            .arg("-loglevel").arg("error")
            .arg("-ss").arg(seek)
            .arg("-i").arg(&self.path)
            .arg("-frames:v").arg("1")
            .arg("-f").arg("image2pipe")
            .arg("-vcodec").arg("png")
            .arg("pipe:1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() || output.stdout.is_empty() {
            return Err(AppError::Internal(format!(
                "ffmpeg produced no frame at {:.3}s: {}",
                timestamp,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(image::load_from_memory(&output.stdout)?)
    }
}

/// A source over frames that are already decoded, evenly spaced at `fps`.
#[derive(Debug, Clone)]
pub struct InMemorySource {
    name: String,
    images: Vec<DynamicImage>,
    fps: f64,
}

impl InMemorySource {
    /// Frame `i` is shown from `i / fps` until `(i + 1) / fps`.
    pub fn new(name: impl Into<String>, images: Vec<DynamicImage>, fps: f64) -> Result<Self> {
        if !fps.is_finite() || fps <= 0.0 {
            return Err(AppError::ConfigurationInvalid(format!(
                "in-memory source fps must be positive, got {}",
                fps
            )));
        }
        Ok(Self {
            name: name.into(),
            images,
            fps,
        })
    }
}

#[async_trait]
impl VideoSource for InMemorySource {
    fn describe(&self) -> String {
        self.name.clone()
    }

    async fn probe(&self) -> Result<VideoInfo> {
        let first = self
            .images
            .first()
            .ok_or_else(|| AppError::SourceUnreadable(format!("{} holds no frames", self.name)))?;
        Ok(VideoInfo {
            duration: self.images.len() as f64 / self.fps,
            fps: Some(self.fps),
            width: first.width(),
            height: first.height(),
        })
    }

    async fn frame_at(&self, timestamp: f64) -> Result<DynamicImage> {
        let position = (timestamp * self.fps + 1e-9).floor();
        if position < 0.0 {
            return Err(AppError::Internal(format!("negative timestamp {}", timestamp)));
        }
        self.images
            .get(position as usize)
            .cloned()
            .ok_or_else(|| AppError::Internal(format!("no frame at {:.3}s", timestamp)))
    }
}

/// Work out which timestamps to decode.
///
/// The result is strictly increasing, at most `target_count` long, and lies
/// inside the requested window.
pub fn plan_timestamps(info: &VideoInfo, config: &SamplerConfig) -> Result<Vec<f64>> {
    let range = config.time_range.unwrap_or(TimeRange {
        start: 0.0,
        duration: None,
    });
    let start = range.start.max(0.0);
    let end = match range.duration {
        Some(d) => (start + d).min(info.duration),
        None => info.duration,
    };
    let window = end - start;
    if window <= 0.0 {
        return Err(AppError::NoFramesDecoded(format!(
            "sampling window [{:.3}s, {:.3}s) is empty for a {:.3}s video",
            start, end, info.duration
        )));
    }

    let raw: Vec<f64> = match config.mode {
        SamplingMode::Uniform => {
            let mut count = config.target_count;
            if let Some(fps) = info.fps {
                // A short clip cannot offer more distinct frames than it contains
                let available = ((window * fps).floor() as usize).max(1);
                count = count.min(available);
            }
            let interval = window / count as f64;
            (0..count)
                .map(|i| start + (i as f64 + 0.5) * interval)
                .collect()
        }
        SamplingMode::FixedRate { fps } => {
            let step = 1.0 / fps;
            (0..config.target_count)
                .map(|k| start + k as f64 * step)
                .take_while(|t| *t < end)
                .collect()
        }
    };

    let mut planned: Vec<f64> = Vec::with_capacity(raw.len());
    for t in raw {
        let t = match info.fps {
            Some(fps) => (t * fps + 1e-9).floor() / fps,
            None => t,
        };
        if planned.last().map_or(true, |last| t > *last) {
            planned.push(t);
        }
    }
    Ok(planned)
}

/// Sample up to `target_count` frames, uniformly spread over the video or `time_range`.
pub async fn sample(
    source: &dyn VideoSource,
    target_count: usize,
    time_range: Option<TimeRange>,
) -> Result<Vec<Frame>> {
    let config = SamplerConfig {
        target_count,
        time_range,
        mode: SamplingMode::Uniform,
    };
    let mut stats = RunStats::default();
    sample_frames(source, &config, &mut stats).await
}

/// Sample frames per `config`, recording decode failures in `stats`.
///
/// Individual frames that fail to decode are skipped. The call only fails when
/// the source cannot be opened or nothing at all could be decoded.
pub async fn sample_frames(
    source: &dyn VideoSource,
    config: &SamplerConfig,
    stats: &mut RunStats,
) -> Result<Vec<Frame>> {
    if config.target_count == 0 {
        return Err(AppError::ConfigurationInvalid("target_count must be positive".into()));
    }

    let info = source.probe().await.map_err(|e| match e {
        AppError::SourceUnreadable(_) => e,
        other => AppError::SourceUnreadable(format!("{}: {}", source.describe(), other)),
    })?;
    log::info!(
        "Sampling {}: duration={:.2}s fps={:?} size={}x{}",
        source.describe(),
        info.duration,
        info.fps,
        info.width,
        info.height
    );

    let timestamps = plan_timestamps(&info, config)?;
    log::debug!("Planned {} sample timestamps", timestamps.len());

    let mut frames = Vec::with_capacity(timestamps.len());
    for timestamp in timestamps {
        match source.frame_at(timestamp).await {
            Ok(image) => frames.push(Frame {
                index: frames.len(),
                timestamp_seconds: timestamp,
                image,
            }),
            Err(e) => {
                log::warn!("Skipping frame at {:.3}s: {}", timestamp, e);
                stats.frames_failed += 1;
            }
        }
    }

    if frames.is_empty() {
        return Err(AppError::NoFramesDecoded(format!(
            "none of the sampled timestamps of {} could be decoded",
            source.describe()
        )));
    }

    stats.original_frame_count = frames.len();
    if let (Some(first), Some(last)) = (frames.first(), frames.last()) {
        log::info!(
            "Sampled {} frames spanning {:.1}s - {:.1}s",
            frames.len(),
            first.timestamp_seconds,
            last.timestamp_seconds
        );
    }
    Ok(frames)
}
