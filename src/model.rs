use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use ndarray::prelude::*;
use ort::{
    execution_providers::{
        CUDAExecutionProvider, ExecutionProviderDispatch, TensorRTExecutionProvider,
    },
    session::{builder::SessionBuilder, Session},
    value::TensorRef,
};
use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::config::ModelConfig;
use crate::errors::{Result, SegError};
use crate::traits::{Device, ModelLoader, ModelLocator, Predictor, SegmentationModel};

/// Loads ONNX segmentation models through ONNX Runtime.
#[derive(Debug, Clone)]
pub struct OrtLoader {
    sessions: usize,
    intra_threads: usize,
    strict_device: bool,
    expected_classes: Option<usize>,
}

impl OrtLoader {
    /// `sessions` is the number of independent sessions kept per model, so
    /// that many inference calls can run at once.
    pub fn new(sessions: usize, intra_threads: usize, strict_device: bool) -> Self {
        Self {
            sessions: sessions.max(1),
            intra_threads,
            strict_device,
            expected_classes: None,
        }
    }

    /// Rejects models whose static class axis differs from `classes`.
    pub fn with_expected_classes(mut self, classes: usize) -> Self {
        self.expected_classes = Some(classes);
        self
    }

    pub fn from_config(config: &ModelConfig) -> Self {
        Self::new(config.sessions, config.intra_threads, config.strict_device)
    }

    fn execution_providers(&self, device: Device) -> Vec<ExecutionProviderDispatch> {
        let Device::Gpu(device_id) = device else {
            return Vec::new();
        };
        let providers = [
            TensorRTExecutionProvider::default()
                .with_device_id(device_id)
                .build(),
            CUDAExecutionProvider::default()
                .with_device_id(device_id)
                .build(),
        ];
        if self.strict_device {
            // TensorRT is optional; CUDA must come up for a strict GPU request.
            let [tensorrt, cuda] = providers;
            vec![tensorrt, cuda.error_on_failure()]
        } else {
            providers.into()
        }
    }

    fn build_session(&self, locator: &ModelLocator, device: Device) -> Result<Session> {
        let fail = |operation: &'static str| {
            move |e: ort::Error| SegError::model_load(locator, operation, e)
        };

        let mut builder = SessionBuilder::new()
            .map_err(fail("session builder initialization"))?
            .with_execution_providers(self.execution_providers(device))
            .map_err(fail("execution provider registration"))?
            .with_memory_pattern(true)
            .map_err(fail("memory pattern configuration"))?;
        if self.intra_threads > 0 {
            builder = builder
                .with_intra_threads(self.intra_threads)
                .map_err(fail("intra-op thread configuration"))?;
        }

        match locator {
            ModelLocator::File(path) => {
                ensure_model_file(locator, path)?;
                builder
                    .commit_from_file(path)
                    .map_err(fail("model file loading"))
            }
            #[cfg(feature = "fetch-models")]
            ModelLocator::Url(url) => builder
                .commit_from_url(url)
                .map_err(fail("model download")),
            #[cfg(not(feature = "fetch-models"))]
            ModelLocator::Url(_) => Err(SegError::model_load(
                locator,
                "model download",
                std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "remote models require the `fetch-models` feature",
                ),
            )),
        }
    }
}

impl Default for OrtLoader {
    fn default() -> Self {
        Self::new(1, 0, false)
    }
}

fn ensure_model_file(locator: &ModelLocator, path: &Path) -> Result<()> {
    if path.is_file() {
        return Ok(());
    }
    Err(SegError::model_load(
        locator,
        "model file lookup",
        std::io::Error::new(std::io::ErrorKind::NotFound, "model file does not exist"),
    ))
}

impl ModelLoader for OrtLoader {
    type Model = OrtModel;

    fn load(&self, locator: &ModelLocator, device: Device) -> Result<OrtModel> {
        let sessions = (0..self.sessions)
            .map(|_| self.build_session(locator, device))
            .collect::<Result<Vec<_>>>()?;

        let first = &sessions[0];
        let input_name = first
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| missing_tensor(locator, "model input lookup"))?;
        let output = first
            .outputs
            .first()
            .ok_or_else(|| missing_tensor(locator, "model output lookup"))?;
        let output_name = output.name.clone();
        let classes = output
            .output_type
            .tensor_shape()
            .and_then(|shape| shape.get(1).copied())
            .and_then(|classes| usize::try_from(classes).ok())
            .filter(|&classes| classes > 0);
        check_class_axis(locator, classes, self.expected_classes)?;

        debug!(
            input = %input_name,
            output = %output_name,
            ?classes,
            sessions = sessions.len(),
            "onnx model committed"
        );

        Ok(OrtModel {
            sessions: sessions.into_iter().map(Mutex::new).collect(),
            next: AtomicUsize::new(0),
            input_name,
            output_name,
        })
    }
}

/// A dynamic class axis (`None`) is accepted and checked per call instead.
fn check_class_axis(
    locator: &ModelLocator,
    declared: Option<usize>,
    expected: Option<usize>,
) -> Result<()> {
    match (declared, expected) {
        (Some(declared), Some(expected)) if declared != expected => Err(SegError::model_load(
            locator,
            "class axis check",
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("model declares {declared} classes, catalog has {expected}"),
            ),
        )),
        _ => Ok(()),
    }
}

fn missing_tensor(locator: &ModelLocator, operation: &str) -> SegError {
    SegError::model_load(
        locator,
        operation,
        std::io::Error::new(std::io::ErrorKind::InvalidData, "model declares no tensors"),
    )
}

/// Committed ONNX sessions for one model.
pub struct OrtModel {
    sessions: Box<[Mutex<Session>]>,
    next: AtomicUsize,
    input_name: String,
    output_name: String,
}

impl SegmentationModel for OrtModel {
    type Predictor<'a> = OrtPredictor<'a>;

    /// Takes the first idle session, or queues on one in round-robin order.
    fn predictor(&self) -> Result<OrtPredictor<'_>> {
        let session = self
            .sessions
            .iter()
            .find_map(|session| session.try_lock())
            .unwrap_or_else(|| {
                let index = self.next.fetch_add(1, Ordering::Relaxed) % self.sessions.len();
                self.sessions[index].lock()
            });

        Ok(OrtPredictor {
            session,
            input_name: &self.input_name,
            output_name: &self.output_name,
        })
    }
}

/// Exclusive use of one session for the duration of a call.
pub struct OrtPredictor<'a> {
    session: MutexGuard<'a, Session>,
    input_name: &'a str,
    output_name: &'a str,
}

impl Predictor for OrtPredictor<'_> {
    fn predict(&mut self, input: ArrayView4<f32>) -> Result<Array4<f32>> {
        let input = input.as_standard_layout().into_owned();
        let outputs = self
            .session
            .run(ort::inputs![self.input_name => TensorRef::from_array_view(&input)?])?;
        let output = outputs[self.output_name]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix4>()?
            .to_owned();
        Ok(output)
    }
}
