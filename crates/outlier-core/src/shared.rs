//! Thread-safe detector wrapper with anomaly transition notifications.
//!
//! All operations on one [`SharedDetector`] are serialised by a single lock
//! that is held for the full duration of the call, including any implicit
//! training triggered by `detect`. Listeners run after the lock is released
//! so they may call back into the detector.

use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::detector::{DetectionResult, Detector, DetectorKind};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transition {
    /// Detection flipped from normal to anomalous
    Entered,
    /// Detection flipped from anomalous back to normal
    Cleared,
}

/// Emitted when consecutive detections disagree on `is_anomaly`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub detector: DetectorKind,
    pub transition: Transition,
    pub result: DetectionResult,
    pub at: DateTime<Utc>,
}

pub type TransitionListener = Arc<dyn Fn(&AnomalyEvent) + Send + Sync>;

struct Inner<D> {
    detector: D,
    in_anomaly: bool,
    listeners: Vec<TransitionListener>,
}

pub struct SharedDetector<D: Detector> {
    inner: Mutex<Inner<D>>,
}

impl<D: Detector> SharedDetector<D> {
    pub fn new(detector: D) -> Self {
        Self {
            inner: Mutex::new(Inner {
                detector,
                in_anomaly: false,
                listeners: Vec::new(),
            }),
        }
    }

    pub fn on_transition<F>(&self, listener: F)
    where
        F: Fn(&AnomalyEvent) + Send + Sync + 'static,
    {
        self.inner.lock().listeners.push(Arc::new(listener));
    }

    pub fn name(&self) -> &'static str {
        self.inner.lock().detector.name()
    }

    pub fn kind(&self) -> DetectorKind {
        self.inner.lock().detector.kind()
    }

    pub fn dimensions(&self) -> Option<usize> {
        self.inner.lock().detector.dimensions()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().detector.is_initialized()
    }

    /// Whether the most recent detection was anomalous
    pub fn in_anomaly(&self) -> bool {
        self.inner.lock().in_anomaly
    }

    pub fn add_training_data(&self, point: &[f64]) -> Result<()> {
        self.inner.lock().detector.add_training_data(point)
    }

    pub fn add_value(&self, value: f64) -> Result<()> {
        self.inner.lock().detector.add_value(value)
    }

    pub fn train(&self) -> Result<()> {
        self.inner.lock().detector.train()
    }

    pub fn detect(&self, value: f64) -> Result<DetectionResult> {
        self.detect_multi(&[value])
    }

    pub fn detect_multi(&self, point: &[f64]) -> Result<DetectionResult> {
        let (result, pending) = {
            let mut inner = self.inner.lock();
            let result = inner.detector.detect_multi(point)?;
            let pending = inner.record(&result);
            (result, pending)
        };

        if let Some((event, listeners)) = pending {
            for listener in &listeners {
                listener(&event);
            }
        }
        Ok(result)
    }

    /// Run `f` with exclusive access, e.g. to pair an add with a detect
    /// without another caller interleaving. Detections made inside `f` do
    /// not emit transition events.
    pub fn atomically<R>(&self, f: impl FnOnce(&mut D) -> R) -> R {
        f(&mut self.inner.lock().detector)
    }

    pub fn save(&self, writer: &mut dyn Write) -> Result<()> {
        self.inner.lock().detector.save(writer)
    }

    pub fn load(&self, reader: &mut dyn Read) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.detector.load(reader)?;
        inner.in_anomaly = false;
        Ok(())
    }

    pub fn into_inner(self) -> D {
        self.inner.into_inner().detector
    }
}

impl<D: Detector> Inner<D> {
    fn record(&mut self, result: &DetectionResult) -> Option<(AnomalyEvent, Vec<TransitionListener>)> {
        if result.is_anomaly == self.in_anomaly {
            return None;
        }
        self.in_anomaly = result.is_anomaly;

        let kind = self.detector.kind();
        if result.is_anomaly {
            warn!(
                detector = kind.name(),
                value = result.value,
                z_score = result.z_score,
                "Anomaly detected"
            );
        }

        if !self.detector.config().notify_transitions || self.listeners.is_empty() {
            return None;
        }

        let event = AnomalyEvent {
            detector: kind,
            transition: if result.is_anomaly {
                Transition::Entered
            } else {
                Transition::Cleared
            },
            result: result.clone(),
            at: Utc::now(),
        };
        Some((event, self.listeners.clone()))
    }
}

impl<D: Detector> From<D> for SharedDetector<D> {
    fn from(detector: D) -> Self {
        Self::new(detector)
    }
}

impl<D: Detector> fmt::Debug for SharedDetector<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SharedDetector")
            .field("detector", &inner.detector.name())
            .field("in_anomaly", &inner.in_anomaly)
            .field("listeners", &inner.listeners.len())
            .finish()
    }
}
