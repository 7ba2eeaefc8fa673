use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use ndarray::prelude::*;

use crate::errors::{Result, SegError};

/// Where a model artifact lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelLocator {
    File(PathBuf),
    Url(String),
}

impl fmt::Display for ModelLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Url(url) => f.write_str(url),
        }
    }
}

impl FromStr for ModelLocator {
    type Err = SegError;

    /// `file://` locators become local paths, `http(s)://` stay URLs, and
    /// anything else is taken as a path.
    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(SegError::Configuration {
                message: "model locator is empty".to_string(),
            });
        }
        if let Some(path) = s.strip_prefix("file://") {
            return Ok(Self::File(PathBuf::from(path)));
        }
        if s.starts_with("http://") || s.starts_with("https://") {
            return Ok(Self::Url(s.to_string()));
        }
        Ok(Self::File(PathBuf::from(s)))
    }
}

/// Compute device the model is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
    #[default]
    Cpu,
    Gpu(i32),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Gpu(id) => write!(f, "gpu:{id}"),
        }
    }
}

impl FromStr for Device {
    type Err = SegError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        let (kind, index) = match lower.split_once(':') {
            Some((kind, index)) => (kind, Some(index)),
            None => (lower.as_str(), None),
        };
        let invalid = || SegError::Configuration {
            message: format!("invalid device `{s}`, expected `cpu` or `gpu[:N]`"),
        };

        match (kind, index) {
            ("cpu", None) => Ok(Self::Cpu),
            ("gpu" | "cuda", None) => Ok(Self::Gpu(0)),
            ("gpu" | "cuda", Some(index)) => index
                .parse::<i32>()
                .ok()
                .filter(|id| *id >= 0)
                .map(Self::Gpu)
                .ok_or_else(invalid),
            _ => Err(invalid()),
        }
    }
}

/// Loads a model artifact once per cold start.
pub trait ModelLoader: Send + Sync + 'static {
    type Model: SegmentationModel;

    fn load(&self, locator: &ModelLocator, device: Device) -> Result<Self::Model>;
}

/// A loaded model shared read-only between concurrent inference calls.
pub trait SegmentationModel: Send + Sync + 'static {
    type Predictor<'a>: Predictor
    where
        Self: 'a;

    /// Acquires a scoped inference context; it is released when dropped.
    fn predictor(&self) -> Result<Self::Predictor<'_>>;
}

/// Scoped inference context bound to one call.
pub trait Predictor {
    /// Runs the model and returns its raw `[1, C, H, W]` scores.
    fn predict(&mut self, input: ArrayView4<f32>) -> Result<Array4<f32>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_parsing() -> Result<()> {
        assert_eq!(
            "file:///models/deeplab.onnx".parse::<ModelLocator>()?,
            ModelLocator::File("/models/deeplab.onnx".into())
        );
        assert_eq!(
            "https://example.org/deeplab.onnx".parse::<ModelLocator>()?,
            ModelLocator::Url("https://example.org/deeplab.onnx".to_string())
        );
        assert_eq!(
            "models/deeplab.onnx".parse::<ModelLocator>()?,
            ModelLocator::File("models/deeplab.onnx".into())
        );
        assert!("".parse::<ModelLocator>().is_err());
        Ok(())
    }

    #[test]
    fn test_device_parsing() -> Result<()> {
        assert_eq!("cpu".parse::<Device>()?, Device::Cpu);
        assert_eq!("GPU".parse::<Device>()?, Device::Gpu(0));
        assert_eq!("gpu:2".parse::<Device>()?, Device::Gpu(2));
        assert_eq!("cuda:1".parse::<Device>()?, Device::Gpu(1));
        assert!("gpu:-1".parse::<Device>().is_err());
        assert!("tpu".parse::<Device>().is_err());
        assert!("cpu:0".parse::<Device>().is_err());
        Ok(())
    }

    #[test]
    fn test_device_display_round_trip() -> Result<()> {
        for device in [Device::Cpu, Device::Gpu(3)] {
            assert_eq!(device.to_string().parse::<Device>()?, device);
        }
        Ok(())
    }
}
