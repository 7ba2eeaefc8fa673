use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use ndarray::prelude::*;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::errors::{Result, SegError};
use crate::traits::{Device, ModelLoader, ModelLocator, Predictor, SegmentationModel};

/// Observable lifecycle of a [`ModelHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Unloaded,
    Loading,
    Ready,
    Failed,
}

impl HandleState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

enum Slot<M> {
    Unloaded,
    Loading,
    Ready(Arc<M>),
    Failed,
}

struct Failure {
    attempt: u64,
    operation: String,
    source: Arc<dyn std::error::Error + Send + Sync>,
}

struct Lifecycle<M> {
    slot: Slot<M>,
    attempts: u64,
    last_failure: Option<Failure>,
}

/// Lazily loaded, shareable model.
///
/// The first caller of [`ModelHandle::ensure_ready`] loads the model while
/// every concurrent caller waits for that single attempt. A failed attempt is
/// reported to everyone who waited on it; the next call tries again. Once
/// ready, the handle stays ready.
pub struct ModelHandle<L: ModelLoader> {
    loader: L,
    locator: ModelLocator,
    device: Device,
    lifecycle: Mutex<Lifecycle<L::Model>>,
    settled: Condvar,
}

impl<L: ModelLoader> ModelHandle<L> {
    pub fn new(loader: L, locator: ModelLocator, device: Device) -> Self {
        Self {
            loader,
            locator,
            device,
            lifecycle: Mutex::new(Lifecycle {
                slot: Slot::Unloaded,
                attempts: 0,
                last_failure: None,
            }),
            settled: Condvar::new(),
        }
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    pub fn locator(&self) -> &ModelLocator {
        &self.locator
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn state(&self) -> HandleState {
        match self.lifecycle.lock().slot {
            Slot::Unloaded => HandleState::Unloaded,
            Slot::Loading => HandleState::Loading,
            Slot::Ready(_) => HandleState::Ready,
            Slot::Failed => HandleState::Failed,
        }
    }

    /// Number of load attempts started so far.
    pub fn load_attempts(&self) -> u64 {
        self.lifecycle.lock().attempts
    }

    /// Loads the model unless it is already loaded, blocking while another
    /// caller's load is in flight.
    pub fn ensure_ready(&self) -> Result<Arc<L::Model>> {
        let mut lifecycle = self.lifecycle.lock();
        loop {
            match &lifecycle.slot {
                Slot::Ready(model) => return Ok(Arc::clone(model)),
                Slot::Unloaded | Slot::Failed => break,
                Slot::Loading => {
                    let awaited = lifecycle.attempts;
                    self.settled.wait_while(&mut lifecycle, |l| {
                        matches!(l.slot, Slot::Loading) && l.attempts == awaited
                    });
                    if let Some(failure) = &lifecycle.last_failure {
                        if failure.attempt == awaited && !matches!(lifecycle.slot, Slot::Ready(_))
                        {
                            return Err(self.load_error(failure));
                        }
                    }
                }
            }
        }

        lifecycle.attempts += 1;
        let attempt = lifecycle.attempts;
        lifecycle.slot = Slot::Loading;
        let loaded = MutexGuard::unlocked(&mut lifecycle, || self.load(attempt));
        let result = self.publish(&mut lifecycle, attempt, loaded);
        self.settled.notify_all();
        result
    }

    fn load(&self, attempt: u64) -> Result<L::Model> {
        info!(
            locator = %self.locator,
            device = %self.device,
            attempt,
            "loading segmentation model"
        );
        let started = Instant::now();
        let model = panic::catch_unwind(AssertUnwindSafe(|| {
            self.loader.load(&self.locator, self.device)
        }))
        .unwrap_or_else(|_| {
            Err(SegError::model_load(
                &self.locator,
                "model load",
                std::io::Error::other("model loader panicked"),
            ))
        })?;
        info!(elapsed = ?started.elapsed(), "segmentation model ready");
        Ok(model)
    }

    fn publish(
        &self,
        lifecycle: &mut Lifecycle<L::Model>,
        attempt: u64,
        loaded: Result<L::Model>,
    ) -> Result<Arc<L::Model>> {
        match loaded {
            Ok(model) => {
                let model = Arc::new(model);
                lifecycle.slot = Slot::Ready(Arc::clone(&model));
                lifecycle.last_failure = None;
                Ok(model)
            }
            Err(err) => {
                let failure = match err {
                    SegError::ModelLoad {
                        operation, source, ..
                    } => Failure {
                        attempt,
                        operation,
                        source,
                    },
                    other => Failure {
                        attempt,
                        operation: "model load".to_string(),
                        source: Arc::new(other),
                    },
                };
                let err = self.load_error(&failure);
                warn!(attempt, error = %err, "segmentation model load failed");
                lifecycle.slot = Slot::Failed;
                lifecycle.last_failure = Some(failure);
                Err(err)
            }
        }
    }

    fn load_error(&self, failure: &Failure) -> SegError {
        SegError::ModelLoad {
            locator: self.locator.to_string(),
            operation: failure.operation.clone(),
            source: Arc::clone(&failure.source),
        }
    }

    /// The loaded model, without triggering a load.
    pub fn model(&self) -> Result<Arc<L::Model>> {
        let lifecycle = self.lifecycle.lock();
        match &lifecycle.slot {
            Slot::Ready(model) => Ok(Arc::clone(model)),
            Slot::Unloaded => Err(SegError::NotReady {
                state: HandleState::Unloaded.as_str(),
            }),
            Slot::Loading => Err(SegError::NotReady {
                state: HandleState::Loading.as_str(),
            }),
            Slot::Failed => Err(SegError::NotReady {
                state: HandleState::Failed.as_str(),
            }),
        }
    }

    /// Runs one inference on a ready model and returns its raw output.
    ///
    /// The predictor is acquired for this call only and released on return,
    /// including when the engine fails.
    pub fn infer(&self, input: ArrayView4<f32>) -> Result<Array4<f32>> {
        let model = self.model()?;
        let mut predictor = model.predictor()?;
        let started = Instant::now();
        let output = predictor.predict(input)?;
        debug!(
            input = ?input.shape(),
            output = ?output.shape(),
            elapsed = ?started.elapsed(),
            "inference finished"
        );
        Ok(output)
    }
}

impl<L: ModelLoader> ModelHandle<L> {
    /// Starts loading on a background thread and returns immediately.
    ///
    /// Failures are logged, never returned to the caller of `warm_up`.
    pub fn warm_up(self: &Arc<Self>) -> WarmUp {
        let cancelled = Arc::new(AtomicBool::new(false));
        let handle = Arc::clone(self);
        let flag = Arc::clone(&cancelled);

        let spawned = thread::Builder::new()
            .name("model-warm-up".to_string())
            .spawn(move || {
                if flag.load(Ordering::Acquire) {
                    debug!("model warm-up cancelled before start");
                    return WarmUpOutcome::Cancelled;
                }
                match handle.ensure_ready() {
                    Ok(_) => WarmUpOutcome::Ready,
                    Err(err) => {
                        warn!(error = %err, "background model warm-up failed");
                        WarmUpOutcome::Failed(err.to_string())
                    }
                }
            });

        let thread = match spawned {
            Ok(thread) => Some(thread),
            Err(err) => {
                warn!(error = %err, "could not spawn model warm-up thread");
                None
            }
        };

        WarmUp { cancelled, thread }
    }
}

/// How a background warm-up ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarmUpOutcome {
    Ready,
    Failed(String),
    Cancelled,
}

/// Handle to a background warm-up started by [`ModelHandle::warm_up`].
///
/// Dropping it detaches the thread.
pub struct WarmUp {
    cancelled: Arc<AtomicBool>,
    thread: Option<JoinHandle<WarmUpOutcome>>,
}

impl WarmUp {
    /// Skips the load if it has not started yet. A load already in flight
    /// runs to completion.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Blocks until the warm-up thread exits.
    pub fn wait(self) -> WarmUpOutcome {
        match self.thread {
            Some(thread) => thread.join().unwrap_or_else(|_| {
                WarmUpOutcome::Failed("warm-up thread panicked".to_string())
            }),
            None => WarmUpOutcome::Failed("warm-up thread was not spawned".to_string()),
        }
    }
}
