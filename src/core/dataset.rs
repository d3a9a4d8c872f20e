//! Paired before/after response samples, grouped per stimulus.

use hashbrown::{HashMap, HashSet};
use tracing::debug;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::model::Decorrelation;
use crate::state::PhysiologicalState;
use crate::stimulus::{StimulusCatalog, StimulusKey};

/// One training row: regressor input and the observed delta per second.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Sample {
    pub input: Vec<f32>,
    pub delta: Vec<f32>,
}

/// All samples recorded for one stimulus (or for the synthesizer).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StimulusDataset {
    pub identity: String,
    pub sensor: String,
    pub input_dim: usize,
    pub output_dim: usize,
    pub samples: Vec<Sample>,
}

impl StimulusDataset {
    pub fn new(identity: String, sensor: String, input_dim: usize, output_dim: usize) -> Self {
        Self {
            identity,
            sensor,
            input_dim,
            output_dim,
            samples: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Minimum sample count needed before this dataset can be trained.
    pub fn required_samples(&self, min_samples: usize) -> usize {
        min_samples.max(2 * self.input_dim)
    }

    pub fn ensure_sufficient(&self, min_samples: usize) -> Result<(), EngineError> {
        let required = self.required_samples(min_samples);
        if self.len() < required {
            return Err(EngineError::InsufficientData {
                stimulus: self.identity.clone(),
                required,
                available: self.len(),
            });
        }
        Ok(())
    }

    /// Drop samples whose delta is more than `max_sigma` standard deviations
    /// from the per-component mean. Returns how many were removed.
    pub fn filter_outliers(&mut self, max_sigma: f32) -> usize {
        let n = self.samples.len();
        if max_sigma <= 0.0 || n < 3 || self.output_dim == 0 {
            return 0;
        }
        let dim = self.output_dim;
        let mut mean = vec![0.0f64; dim];
        for s in &self.samples {
            for (m, d) in mean.iter_mut().zip(&s.delta) {
                *m += *d as f64;
            }
        }
        mean.iter_mut().for_each(|m| *m /= n as f64);
        let mut var = vec![0.0f64; dim];
        for s in &self.samples {
            for i in 0..dim {
                let d = s.delta[i] as f64 - mean[i];
                var[i] += d * d;
            }
        }
        let sd: Vec<f64> = var.iter().map(|v| (v / (n - 1) as f64).sqrt()).collect();

        let before = self.samples.len();
        self.samples.retain(|s| {
            s.delta.iter().enumerate().all(|(i, d)| {
                sd[i] <= f64::EPSILON || ((*d as f64 - mean[i]).abs() / sd[i]) <= max_sigma as f64
            })
        });
        let removed = before - self.samples.len();
        if removed > 0 {
            debug!("{}: filtered {} outlier samples", self.identity, removed);
        }
        removed
    }

    /// Decorrelation fitted on the "before" state slice of the inputs.
    pub fn fit_decorrelation(&self, ridge: f64) -> Option<Decorrelation> {
        let offset = self.input_dim.saturating_sub(self.output_dim);
        Decorrelation::fit(
            self.samples.iter().map(|s| s.input.as_slice()),
            offset,
            self.output_dim,
            ridge,
        )
    }
}

/// The engine's in-RAM dataset collection for one catalog and one sensor.
#[derive(Debug, Clone)]
pub struct ResponseDataset {
    sensor: String,
    signal_count: usize,
    settle_secs: f32,
    sets: HashMap<StimulusKey, StimulusDataset>,
    dirty: HashSet<StimulusKey>,
    rejected: u64,
}

impl ResponseDataset {
    pub fn for_catalog(
        catalog: &StimulusCatalog,
        sensor: &str,
        signal_count: usize,
        settle_secs: f32,
    ) -> Self {
        let mut sets = HashMap::new();
        for key in catalog.training_order() {
            sets.insert(
                key,
                StimulusDataset::new(
                    catalog.identity(key),
                    sensor.to_string(),
                    catalog.input_dim(key, signal_count),
                    signal_count,
                ),
            );
        }
        Self {
            sensor: sensor.to_string(),
            signal_count,
            settle_secs,
            sets,
            dirty: HashSet::new(),
            rejected: 0,
        }
    }

    pub fn sensor(&self) -> &str {
        &self.sensor
    }

    pub fn get(&self, key: StimulusKey) -> Option<&StimulusDataset> {
        self.sets.get(&key)
    }

    /// Replace a stimulus's dataset with a persisted copy, if shapes agree.
    pub fn install(&mut self, key: StimulusKey, loaded: StimulusDataset) -> bool {
        match self.sets.get_mut(&key) {
            Some(slot)
                if slot.input_dim == loaded.input_dim && slot.output_dim == loaded.output_dim =>
            {
                *slot = loaded;
                true
            }
            _ => false,
        }
    }

    /// Move a dataset out (the job manager owns it while training).
    pub fn take(&mut self, key: StimulusKey) -> Option<StimulusDataset> {
        self.dirty.remove(&key);
        self.sets.remove(&key)
    }

    pub fn len_of(&self, key: StimulusKey) -> usize {
        self.sets.get(&key).map(StimulusDataset::len).unwrap_or(0)
    }

    pub fn total_samples(&self) -> usize {
        self.sets.values().map(StimulusDataset::len).sum()
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    pub fn dirty_keys(&self) -> Vec<StimulusKey> {
        let mut keys: Vec<StimulusKey> = self.dirty.iter().copied().collect();
        keys.sort();
        keys
    }

    pub fn mark_clean(&mut self, key: StimulusKey) {
        self.dirty.remove(&key);
    }

    pub fn clear(&mut self) {
        self.sets.clear();
        self.dirty.clear();
    }

    /// Store one before/after pair for a single stimulus.
    pub fn store(
        &mut self,
        stimulus: StimulusKey,
        before: &PhysiologicalState,
        after: &PhysiologicalState,
    ) -> Result<(), EngineError> {
        self.store_presentation(&[stimulus], None, before, after)
    }

    /// Store one presentation: every shown stimulus gets `(before, delta)`,
    /// and a synth transition additionally gets
    /// `(synth_before ++ synth_after ++ before, delta)`.
    ///
    /// Nothing is stored unless both readings are valid.
    pub fn store_presentation(
        &mut self,
        shown: &[StimulusKey],
        synth: Option<(&[f32], &[f32])>,
        before: &PhysiologicalState,
        after: &PhysiologicalState,
    ) -> Result<(), EngineError> {
        if let Err(e) = self.validate_pair(before, after) {
            self.rejected += 1;
            return Err(e);
        }
        for key in shown {
            if !self.sets.contains_key(key) {
                self.rejected += 1;
                return Err(EngineError::InvalidSample {
                    reason: format!("no dataset for {key:?}"),
                });
            }
        }
        if let Some((sb, sa)) = synth {
            let expected = self
                .sets
                .get(&StimulusKey::Synth)
                .map(|d| d.input_dim.saturating_sub(self.signal_count) / 2);
            if expected != Some(sb.len()) || sb.len() != sa.len() {
                self.rejected += 1;
                return Err(EngineError::InvalidSample {
                    reason: "synth parameter vector does not match dataset".to_string(),
                });
            }
        }

        let delta = PhysiologicalState::delta_per_second(before, after, self.settle_secs);
        for key in shown {
            if let Some(set) = self.sets.get_mut(key) {
                set.samples.push(Sample {
                    input: before.0.clone(),
                    delta: delta.clone(),
                });
                self.dirty.insert(*key);
            }
        }
        if let Some((sb, sa)) = synth {
            if let Some(set) = self.sets.get_mut(&StimulusKey::Synth) {
                let mut input = Vec::with_capacity(set.input_dim);
                input.extend_from_slice(sb);
                input.extend_from_slice(sa);
                input.extend_from_slice(&before.0);
                set.samples.push(Sample { input, delta });
                self.dirty.insert(StimulusKey::Synth);
            }
        }
        Ok(())
    }

    fn validate_pair(
        &self,
        before: &PhysiologicalState,
        after: &PhysiologicalState,
    ) -> Result<(), EngineError> {
        if before.len() != self.signal_count || after.len() != self.signal_count {
            return Err(EngineError::InvalidSample {
                reason: format!(
                    "expected {} components, got {}/{}",
                    self.signal_count,
                    before.len(),
                    after.len()
                ),
            });
        }
        before.validate("before")?;
        after.validate("after")
    }

    /// Every dataset must reach `max(min_samples, 2 x input_dim)` samples.
    pub fn check_sufficient(
        &self,
        order: &[StimulusKey],
        min_samples: usize,
    ) -> Result<(), EngineError> {
        for key in order {
            if let Some(set) = self.sets.get(key) {
                set.ensure_sufficient(min_samples)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stimulus::SynthSpec;

    fn dataset() -> ResponseDataset {
        let catalog = StimulusCatalog::from_labels(
            vec!["a.png".to_string()],
            vec!["calm".to_string()],
            Some(SynthSpec {
                name: "pad".to_string(),
                param_count: 2,
            }),
        );
        ResponseDataset::for_catalog(&catalog, "stub", 2, 0.5)
    }

    fn st(v: &[f32]) -> PhysiologicalState {
        PhysiologicalState::new(v.to_vec())
    }

    #[test]
    fn store_appends_rate_normalised_delta() {
        let mut ds = dataset();
        ds.store(StimulusKey::Picture(0), &st(&[0.2, 0.4]), &st(&[0.3, 0.2]))
            .unwrap();
        let set = ds.get(StimulusKey::Picture(0)).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.samples[0].input, vec![0.2, 0.4]);
        assert!((set.samples[0].delta[0] - 0.2).abs() < 1e-6);
        assert!((set.samples[0].delta[1] + 0.4).abs() < 1e-6);
        assert_eq!(ds.dirty_keys(), vec![StimulusKey::Picture(0)]);
    }

    #[test]
    fn out_of_range_before_is_rejected_without_storing() {
        let mut ds = dataset();
        let err = ds.store(StimulusKey::Keyword(0), &st(&[1.5, 0.1]), &st(&[0.5, 0.5]));
        assert!(matches!(err, Err(EngineError::InvalidSample { .. })));
        assert_eq!(ds.len_of(StimulusKey::Keyword(0)), 0);
        assert_eq!(ds.rejected(), 1);
    }

    #[test]
    fn invalid_components_never_stored() {
        let bad = [f32::NAN, f32::INFINITY, -0.1, 1.0001];
        for b in bad {
            let mut ds = dataset();
            assert!(ds
                .store(StimulusKey::Picture(0), &st(&[0.5, 0.5]), &st(&[b, 0.5]))
                .is_err());
            assert_eq!(ds.total_samples(), 0);
        }
    }

    #[test]
    fn synth_transition_goes_to_dedicated_dataset() {
        let mut ds = dataset();
        ds.store_presentation(
            &[StimulusKey::Picture(0), StimulusKey::Keyword(0)],
            Some((&[0.1, 0.2], &[0.3, 0.4])),
            &st(&[0.5, 0.6]),
            &st(&[0.5, 0.7]),
        )
        .unwrap();
        assert_eq!(ds.len_of(StimulusKey::Picture(0)), 1);
        assert_eq!(ds.len_of(StimulusKey::Keyword(0)), 1);
        let synth = ds.get(StimulusKey::Synth).unwrap();
        assert_eq!(synth.samples[0].input, vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6]);
    }

    #[test]
    fn insufficient_data_reports_threshold() {
        let ds = dataset();
        let order = vec![StimulusKey::Picture(0)];
        let err = ds.check_sufficient(&order, 10).unwrap_err();
        assert!(err.to_string().contains("less than 10 data points"));
    }

    #[test]
    fn outliers_are_filtered() {
        let mut set = StimulusDataset::new("k".to_string(), "s".to_string(), 1, 1);
        for i in 0..50 {
            set.samples.push(Sample {
                input: vec![0.5],
                delta: vec![0.01 * (i % 5) as f32],
            });
        }
        set.samples.push(Sample {
            input: vec![0.5],
            delta: vec![5.0],
        });
        let removed = set.filter_outliers(4.0);
        assert_eq!(removed, 1);
        assert_eq!(set.len(), 50);
    }
}
