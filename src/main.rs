use framesift::{init, AppError, Config, FfmpegSource, Pipeline, Result};

use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize the application
    init()?;

    let video = std::env::args().nth(1).ok_or_else(|| {
        AppError::ConfigurationInvalid("usage: framesift <video> [output-dir]".into())
    })?;
    let mut config = Config::from_env()?;
    if let Some(dir) = std::env::args().nth(2) {
        config.output.dir = dir.into();
    }
    let output = config.output.clone();

    let pipeline = Pipeline::from_config(config)?;
    for status in pipeline.check_services().await {
        if !status.healthy {
            log::warn!("{} service may be unavailable, continuing anyway", status.name);
        }
    }

    // Ctrl-C abandons the run between or inside stages
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, cancelling run");
            on_signal.cancel();
        }
    });

    let source = FfmpegSource::new(&video);
    let mut result = match pipeline.run(&source, &cancel).await {
        Ok(result) => result,
        Err(e) => {
            log::error!("{}", serde_json::to_string(&e.to_json())?);
            return Err(e);
        }
    };

    let report_path = if output.save_images {
        result.save(&output.dir, output.image_quality)?
    } else {
        result.save_report(&output.dir)?
    };

    let stats = result.stats();
    log::info!(
        "{}: {} frames -> {} candidates -> {} images ({:.1}% duplicates), report at {}",
        video,
        stats.original_frame_count,
        stats.images_before_dedup,
        stats.final_image_count,
        stats.deduplication_rate * 100.0,
        report_path.display()
    );
    Ok(())
}
