use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use ndarray::prelude::*;

use crate::errors::{Result, SegError};
use crate::traits::{Device, ModelLoader, ModelLocator, Predictor, SegmentationModel};

/// Test loader that counts loads and can be scripted to be slow or to fail.
#[derive(Debug)]
pub struct MockLoader {
    output_classes: usize,
    delay: Duration,
    failures_left: AtomicUsize,
    fail_inference: bool,
    hotspots: Vec<(usize, usize, usize)>,
    loads: AtomicUsize,
}

impl MockLoader {
    /// A model that predicts background everywhere.
    pub fn new(classes: usize) -> Self {
        Self {
            output_classes: classes,
            delay: Duration::ZERO,
            failures_left: AtomicUsize::new(0),
            fail_inference: false,
            hotspots: Vec::new(),
            loads: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// The first `count` loads fail.
    pub fn failing(self, count: usize) -> Self {
        self.failures_left.store(count, Ordering::SeqCst);
        self
    }

    pub fn failing_inference(mut self) -> Self {
        self.fail_inference = true;
        self
    }

    /// Makes `class` win at pixel (`x`, `y`).
    pub fn with_hotspot(mut self, x: usize, y: usize, class: usize) -> Self {
        self.hotspots.push((x, y, class));
        self
    }

    /// Emits a class axis of a different length than the catalog expects.
    pub fn with_output_classes(mut self, output_classes: usize) -> Self {
        self.output_classes = output_classes;
        self
    }

    /// Number of times `load` was entered.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ModelLoader for MockLoader {
    type Model = MockModel;

    fn load(&self, locator: &ModelLocator, _device: Device) -> Result<MockModel> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.delay);

        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(SegError::model_load(
                locator,
                "mock load",
                std::io::Error::new(std::io::ErrorKind::NotFound, "mock artifact missing"),
            ));
        }

        Ok(MockModel {
            output_classes: self.output_classes,
            fail_inference: self.fail_inference,
            hotspots: self.hotspots.clone(),
            live: AtomicUsize::new(0),
            acquired: AtomicUsize::new(0),
        })
    }
}

#[derive(Debug)]
pub struct MockModel {
    output_classes: usize,
    fail_inference: bool,
    hotspots: Vec<(usize, usize, usize)>,
    live: AtomicUsize,
    acquired: AtomicUsize,
}

impl MockModel {
    /// Predictors currently held.
    pub fn live_predictors(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Predictors handed out since load.
    pub fn acquired_predictors(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }
}

impl SegmentationModel for MockModel {
    type Predictor<'a> = MockPredictor<'a>;

    fn predictor(&self) -> Result<MockPredictor<'_>> {
        self.live.fetch_add(1, Ordering::SeqCst);
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(MockPredictor { model: self })
    }
}

pub struct MockPredictor<'a> {
    model: &'a MockModel,
}

impl Predictor for MockPredictor<'_> {
    /// Background scores 1.0 everywhere, hotspots score 2.0 for their class.
    fn predict(&mut self, input: ArrayView4<f32>) -> Result<Array4<f32>> {
        if self.model.fail_inference {
            return Err(SegError::inference(
                "mock run",
                "scripted inference failure",
            ));
        }

        let (batch, _, height, width) = input.dim();
        let mut output = Array4::<f32>::zeros((batch, self.model.output_classes, height, width));
        if self.model.output_classes > 0 {
            output.slice_mut(s![.., 0, .., ..]).fill(1.0);
        }
        for &(x, y, class) in &self.model.hotspots {
            if x < width && y < height && class < self.model.output_classes {
                output.slice_mut(s![.., class, y, x]).fill(2.0);
            }
        }
        Ok(output)
    }
}

impl Drop for MockPredictor<'_> {
    fn drop(&mut self) {
        self.model.live.fetch_sub(1, Ordering::SeqCst);
    }
}
