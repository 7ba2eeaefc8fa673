use std::path::PathBuf;
use std::thread;

use clap::{Parser, ValueEnum};
use image::ImageFormat;

use crate::catalog::{ClassCatalog, Palette};
use crate::traits::{Device, ModelLocator};

/// Which color table to paint overlays with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum PaletteKind {
    #[default]
    Standard,
    Neon,
}

impl PaletteKind {
    pub fn build(self, catalog: &ClassCatalog) -> Palette {
        match self {
            Self::Standard => Palette::standard(),
            Self::Neon => Palette::neon(catalog.len()),
        }
    }
}

/// Settings consumed by the model handle and the ONNX loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelConfig {
    pub locator: ModelLocator,
    pub device: Device,
    pub sessions: usize,
    pub intra_threads: usize,
    pub strict_device: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Image file or directory of images to segment
    pub input: PathBuf,

    #[arg(default_value = "output")]
    pub output_dir: PathBuf,

    /// Model path, `file://` URL or http(s) URL
    #[arg(short, long, value_parser = parse_locator)]
    pub model: ModelLocator,

    /// `cpu`, `gpu` or `gpu:N`
    #[arg(short, long, default_value = "gpu:0", value_parser = parse_device)]
    pub device: Device,

    /// Fail instead of falling back to CPU when the GPU is unavailable
    #[arg(long)]
    pub strict_device: bool,

    #[arg(short, long, default_value = "png", value_parser = check_format)]
    pub format: String,

    #[arg(short, long, value_enum, default_value_t = PaletteKind::Standard)]
    pub palette: PaletteKind,

    /// Also write the single-channel class-id map next to the overlay
    #[arg(long)]
    pub raw: bool,

    /// Blend the overlay over the input instead of writing it alone
    #[arg(long)]
    pub composite: bool,

    #[arg(long, default_value_t = 0.6)]
    pub opacity: f32,

    /// Inference sessions kept per model
    #[arg(long, default_value_t = 1)]
    pub sessions: usize,

    /// ONNX Runtime intra-op threads, 0 lets the runtime decide
    #[arg(long, default_value_t = 0)]
    pub intra_threads: usize,

    #[arg(
        short = 'j', long, default_value_t = thread::available_parallelism().map_or(1, |n| n.get())
    )]
    pub num_threads: usize,

    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            locator: self.model.clone(),
            device: self.device,
            sessions: self.sessions,
            intra_threads: self.intra_threads,
            strict_device: self.strict_device,
        }
    }

    pub fn output_format(&self) -> ImageFormat {
        ImageFormat::from_extension(&self.format).unwrap_or(ImageFormat::Png)
    }
}

fn parse_locator(s: &str) -> Result<ModelLocator, String> {
    s.parse().map_err(|e: crate::SegError| e.to_string())
}

fn parse_device(s: &str) -> Result<Device, String> {
    s.parse().map_err(|e: crate::SegError| e.to_string())
}

fn check_format(s: &str) -> Result<String, String> {
    let supported: Vec<_> = ImageFormat::all()
        .filter(|f| f.writing_enabled())
        .flat_map(|f| f.extensions_str())
        .map(|s| format!("`{}`", s))
        .collect();
    let supported_message = format!("Supported formats: {}", supported.join(", "));

    let format = ImageFormat::from_extension(s)
        .ok_or(format!("{} is not supported. {}", s, supported_message))?;
    if !format.writing_enabled() {
        return Err(format!("{} is not supported. {}", s, supported_message));
    }

    Ok(s.to_string())
}
