use anyhow::{ensure, Context, Result};
use clap::Parser;
use rayon::ThreadPoolBuilder;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cyto_seg::{Config, ImageProcessor, ModelLocator, WarmUpOutcome};

fn main() -> Result<()> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with_target(false)
        .init();

    if let ModelLocator::File(path) = &config.model {
        ensure!(path.exists(), "Model path does not exist: {}", path.display());
    }
    ensure!(
        config.input.exists(),
        "Input path does not exist: {}",
        config.input.display()
    );

    ThreadPoolBuilder::new()
        .num_threads(config.num_threads)
        .build_global()
        .context("Failed to build worker thread pool")?;

    info!(
        model = %config.model,
        device = %config.device,
        input = %config.input.display(),
        output = %config.output_dir.display(),
        "starting segmentation"
    );

    let processor = ImageProcessor::with_onnx_model(config);
    let warm_up = processor.segmenter().warm_up();

    let summary = processor.process().context("Segmentation run failed")?;

    if let WarmUpOutcome::Failed(reason) = warm_up.wait() {
        info!(%reason, "model warm-up did not complete");
    }
    ensure!(
        summary.is_complete(),
        "{} of {} images failed",
        summary.failed,
        summary.succeeded + summary.failed
    );
    info!(processed = summary.succeeded, "done");
    Ok(())
}
