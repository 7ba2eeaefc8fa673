pub mod catalog;
pub mod colorize;
pub mod config;
pub mod errors;
pub mod handle;
pub mod model;
pub mod pipeline;
pub mod postprocess;
pub mod preprocess;
pub mod traits;

pub mod mocks;

use image::{DynamicImage, ImageFormat};
use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use walkdir::WalkDir;

pub use catalog::{ClassCatalog, Palette};
pub use colorize::{colorize, composite, to_raw_label_bitmap};
pub use config::{Config, ModelConfig, PaletteKind};
pub use errors::{Result, SegError};
pub use handle::{HandleState, ModelHandle, WarmUp, WarmUpOutcome};
pub use model::{OrtLoader, OrtModel};
pub use pipeline::{Segmentation, Segmenter};
pub use postprocess::{reduce, LabelGrid};
pub use preprocess::{bitmap_from_raw, prepare};
pub use traits::*;

/// Segments image files from disk and writes overlays next to a mirrored
/// output layout.
pub struct ImageProcessor<L: ModelLoader> {
    segmenter: Segmenter<L>,
    config: Config,
}

/// Outcome of a [`ImageProcessor::process`] run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessSummary {
    pub succeeded: usize,
    pub failed: usize,
}

impl ProcessSummary {
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

/// Files written for one input image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    pub overlay: PathBuf,
    pub raw: PathBuf,
}

impl<L: ModelLoader> ImageProcessor<L> {
    pub const fn new(segmenter: Segmenter<L>, config: Config) -> Self {
        Self { segmenter, config }
    }

    pub fn segmenter(&self) -> &Segmenter<L> {
        &self.segmenter
    }

    /// Processes every image under the configured input.
    ///
    /// The model is loaded before any file is touched and a load failure ends
    /// the run. Per-file failures are logged and counted in the summary.
    pub fn process(&self) -> Result<ProcessSummary> {
        let input_path = &self.config.input;
        let output_path = &self.config.output_dir;

        if !input_path.exists() {
            return Err(SegError::FileSystem {
                path: input_path.clone(),
                operation: "input existence check".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "input path does not exist",
                ),
            });
        }

        fs::create_dir_all(output_path).map_err(|e| SegError::FileSystem {
            path: output_path.clone(),
            operation: "output directory creation".to_string(),
            source: e,
        })?;

        let image_files = self.collect_image_files(input_path);
        if image_files.is_empty() {
            info!(input = %input_path.display(), "no image files to process");
            return Ok(ProcessSummary::default());
        }

        self.segmenter.handle().ensure_ready()?;

        let pb = ProgressBar::new(image_files.len() as u64);
        pb.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            )
            .map_err(|e| SegError::Configuration {
                message: e.to_string(),
            })?
            .progress_chars("#>-"),
        );

        let succeeded = image_files
            .par_iter()
            .progress_with(pb.clone())
            .filter(|input_file| match self.process_single_image(input_file) {
                Ok(()) => true,
                Err(e) => {
                    error!(file = %input_file.display(), error = %e, "segmentation failed");
                    false
                }
            })
            .count();

        pb.finish();
        let summary = ProcessSummary {
            succeeded,
            failed: image_files.len() - succeeded,
        };
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            "all images processed"
        );
        Ok(summary)
    }

    fn collect_image_files(&self, input_path: &Path) -> Vec<PathBuf> {
        WalkDir::new(input_path)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|path| self.is_supported_image_format(path))
            .collect()
    }

    pub fn is_supported_image_format(&self, path: &Path) -> bool {
        ImageFormat::from_path(path).is_ok_and(|format| format.reading_enabled())
    }

    fn process_single_image(&self, input_file: &Path) -> Result<()> {
        let img = image::open(input_file).map_err(|e| SegError::ImageProcessing {
            path: input_file.display().to_string(),
            operation: "image loading".to_string(),
            source: Box::new(e),
        })?;

        let segmentation = self.segmenter.segment(&img)?;
        let paths = self.output_paths(input_file)?;

        if let Some(parent) = paths.overlay.parent() {
            fs::create_dir_all(parent).map_err(|e| SegError::FileSystem {
                path: parent.to_path_buf(),
                operation: "output directory creation".to_string(),
                source: e,
            })?;
        }

        let overlay = if self.config.composite {
            composite(&img, &segmentation.overlay, self.config.opacity)?
        } else {
            segmentation.overlay
        };
        let format = self.config.output_format();
        let overlay = match format {
            ImageFormat::Jpeg => DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(overlay).to_rgb8()),
            _ => DynamicImage::ImageRgba8(overlay),
        };
        overlay
            .save_with_format(&paths.overlay, format)
            .map_err(|e| SegError::ImageProcessing {
                path: paths.overlay.display().to_string(),
                operation: "overlay saving".to_string(),
                source: Box::new(e),
            })?;

        if self.config.raw {
            segmentation
                .raw
                .save_with_format(&paths.raw, ImageFormat::Png)
                .map_err(|e| SegError::ImageProcessing {
                    path: paths.raw.display().to_string(),
                    operation: "label map saving".to_string(),
                    source: Box::new(e),
                })?;
        }

        Ok(())
    }

    pub fn output_paths(&self, input_file: &Path) -> Result<OutputPaths> {
        let relative_path = self.get_relative_path(input_file)?;
        let stem = relative_path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| SegError::FileSystem {
                path: input_file.to_path_buf(),
                operation: "file name extraction".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "input file has no usable name",
                ),
            })?;
        let dir = self
            .config
            .output_dir
            .join(relative_path.parent().unwrap_or(Path::new("")));

        Ok(OutputPaths {
            overlay: dir.join(format!("{stem}_overlay.{}", self.config.format)),
            raw: dir.join(format!("{stem}_labels.png")),
        })
    }

    pub fn get_relative_path(&self, input_file: &Path) -> Result<PathBuf> {
        let input = &self.config.input;
        if input.is_file() || input == input_file {
            return input_file
                .file_name()
                .map(PathBuf::from)
                .ok_or_else(|| SegError::FileSystem {
                    path: input_file.to_path_buf(),
                    operation: "relative path calculation".to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "input file has no name",
                    ),
                });
        }
        input_file
            .strip_prefix(input)
            .map(|p| p.to_path_buf())
            .map_err(|_| SegError::FileSystem {
                path: input_file.to_path_buf(),
                operation: "relative path calculation".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "input file is not inside the input directory",
                ),
            })
    }
}

impl ImageProcessor<OrtLoader> {
    /// ONNX Runtime backed processor for the VOC catalog.
    pub fn with_onnx_model(config: Config) -> Self {
        let model_config = config.model_config();
        let catalog = ClassCatalog::voc();
        let handle = Arc::new(ModelHandle::new(
            OrtLoader::from_config(&model_config).with_expected_classes(catalog.len()),
            model_config.locator,
            model_config.device,
        ));
        let palette = config.palette.build(&catalog);
        Self::new(Segmenter::new(handle, catalog, palette), config)
    }
}
