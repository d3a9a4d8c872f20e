//! Physiological state vectors.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// One reading from the sensor: a component per signal, each in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PhysiologicalState(pub Vec<f32>);

impl PhysiologicalState {
    pub fn new(components: Vec<f32>) -> Self {
        Self(components)
    }

    pub fn zeros(n: usize) -> Self {
        Self(vec![0.0; n])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// True when every component is finite and inside `[0, 1]`.
    pub fn is_valid(&self) -> bool {
        self.0.iter().all(|v| v.is_finite() && (0.0..=1.0).contains(v))
    }

    pub fn validate(&self, label: &str) -> Result<(), EngineError> {
        validate_unit(&self.0, label)
    }

    /// `(after - before) / seconds`, component-wise.
    pub fn delta_per_second(before: &Self, after: &Self, seconds: f32) -> Vec<f32> {
        let secs = if seconds > 0.0 { seconds } else { 1.0 };
        before
            .0
            .iter()
            .zip(after.0.iter())
            .map(|(b, a)| (a - b) / secs)
            .collect()
    }
}

impl From<Vec<f32>> for PhysiologicalState {
    fn from(v: Vec<f32>) -> Self {
        Self(v)
    }
}

/// Every component finite and inside `[0, 1]`.
pub fn validate_unit(values: &[f32], label: &str) -> Result<(), EngineError> {
    for (i, v) in values.iter().enumerate() {
        if !v.is_finite() {
            return Err(EngineError::InvalidSample {
                reason: format!("{label}[{i}] is not finite"),
            });
        }
        if !(0.0..=1.0).contains(v) {
            return Err(EngineError::InvalidSample {
                reason: format!("{label}[{i}]={v} outside [0,1]"),
            });
        }
    }
    Ok(())
}

pub fn clamp01(v: &mut [f32]) {
    for x in v.iter_mut() {
        *x = if x.is_finite() { x.clamp(0.0, 1.0) } else { 0.5 };
    }
}
