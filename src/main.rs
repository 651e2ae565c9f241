mod engine;
mod error;
mod model;
mod segmentation;

use anyhow::{Context, Result};
use clap::Parser;
use engine::{EngineConfig, LoadOptions, MatteEngine};
use image::{RgbImage, Rgba, RgbaImage};
use model::ModelSourceConfig;
use segmentation::PipelineConfig;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input image to matte
    #[arg(short, long)]
    image: String,

    /// Output path (PNG with alpha)
    #[arg(short, long, default_value = "matte.png")]
    out: String,

    /// Model source (local path or URL), tried before any other source
    #[arg(long, alias = "model-url")]
    model: Option<String>,

    /// Comma-separated list of fallback model sources
    #[arg(long, alias = "model-urls")]
    models: Option<String>,

    /// Skip accelerated execution providers and run portable (CPU) only
    #[arg(long)]
    cpu_only: bool,

    /// Square inference canvas size in pixels
    #[arg(long, default_value_t = 1024)]
    target: u32,

    /// Per-request segmentation timeout in seconds
    #[arg(long, default_value_t = 180)]
    timeout: u64,

    /// Write the foreground cutout (original pixels under the matte)
    /// instead of the bare alpha mask
    #[arg(long)]
    cutout: bool,

    /// Enable debug logging (includes worker phase events)
    #[arg(long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    tracing::info!("Mattebox starting");

    // Resolve model sources from CLI flags and environment
    let sources = ModelSourceConfig::from_env(args.model.clone(), args.models.clone()).resolve();
    tracing::info!("Model sources: {}", sources.len());
    tracing::info!("Inference canvas: {}x{}", args.target, args.target);

    let config = EngineConfig {
        segment_timeout: Duration::from_secs(args.timeout),
        pipeline: PipelineConfig {
            target: args.target,
            ..PipelineConfig::default()
        },
        intra_threads: None,
    };

    // Initialize the inference engine
    let matte_engine = MatteEngine::new(sources, config);
    let _phases = matte_engine.on_phase(|event| match &event.detail {
        Some(detail) => tracing::debug!("[{}] {}", event.phase, detail),
        None => tracing::debug!("[{}]", event.phase),
    });

    // Load the model up front so session setup is not billed to the segment
    let load_start = Instant::now();
    matte_engine.load_model(LoadOptions {
        force_provider_fallback: args.cpu_only,
    })?;
    tracing::info!(
        "Model ready in {:.1}s",
        load_start.elapsed().as_secs_f64()
    );

    // Load the input image
    let input = image::open(&args.image)
        .with_context(|| format!("Failed to open input image {}", args.image))?
        .to_rgb8();
    tracing::info!(
        "Segmenting {} ({}x{})",
        args.image,
        input.width(),
        input.height()
    );

    // Run segmentation
    let segment_start = Instant::now();
    let matte = matte_engine.segment(input.clone())?;
    tracing::info!(
        "Matte ready in {:.1}s",
        segment_start.elapsed().as_secs_f64()
    );

    // Write the result
    let result = if args.cutout {
        apply_matte(&input, &matte)
    } else {
        matte
    };
    result
        .save(&args.out)
        .with_context(|| format!("Failed to write {}", args.out))?;
    tracing::info!("Wrote {}", args.out);

    Ok(())
}

/// Copy the matte's alpha channel onto the original pixels.
fn apply_matte(image: &RgbImage, matte: &RgbaImage) -> RgbaImage {
    let mut out = RgbaImage::new(image.width(), image.height());
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let rgb = image.get_pixel(x, y);
        let alpha = matte.get_pixel(x, y)[3];
        *pixel = Rgba([rgb[0], rgb[1], rgb[2], alpha]);
    }
    out
}
