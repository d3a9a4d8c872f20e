//! Candidate ranking for program execution.
//!
//! Each candidate's model predicts a state change; its error against the
//! current target row is
//! `sum_i (|target_i - (state_i + delta_i)| + 0.5 * stdev_i) / tolerance_i`
//! over the signals the row constrains. The winner is drawn uniformly from
//! the `top_k` lowest errors so the loop does not lock onto one stimulus.
//!
//! The direct strategy scores against the live reading. The Monte-Carlo
//! strategy scores against a pool of hypothetical states that is advanced
//! through the chosen models, for when the reading cannot be trusted.

use std::cmp::Ordering;

use tracing::warn;

use crate::config::EngineConfig;
use crate::model::{Prediction, ResponsePredictor};
use crate::prng::Prng;
use crate::program::TargetRow;
use crate::state::clamp01;
use crate::stimulus::{Stimulus, StimulusKey};

pub type Predictor = Box<dyn ResponsePredictor + Send + Sync>;

/// Models available for scoring, grouped the way they are shown.
#[derive(Default)]
pub struct ModelSet {
    pub pictures: Vec<(StimulusKey, Predictor)>,
    pub keywords: Vec<(StimulusKey, Predictor)>,
    pub synth: Option<Predictor>,
}

impl ModelSet {
    pub fn len(&self) -> usize {
        self.pictures.len() + self.keywords.len() + usize::from(self.synth.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn predictor(&self, key: StimulusKey) -> Option<&Predictor> {
        match key {
            StimulusKey::Picture(_) => self.pictures.iter().find(|(k, _)| *k == key).map(|(_, p)| p),
            StimulusKey::Keyword(_) => self.keywords.iter().find(|(k, _)| *k == key).map(|(_, p)| p),
            StimulusKey::Synth => self.synth.as_ref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoringSettings {
    pub top_k: usize,
    pub synth_candidates: usize,
    pub timestep_secs: f32,
    pub synth_jitter_sigma: f32,
    pub pool_size: usize,
    pub reset_fraction: f32,
}

impl ScoringSettings {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            top_k: cfg.top_k.max(1),
            synth_candidates: cfg.synth_candidates.max(1),
            timestep_secs: cfg.scoring_timestep_secs,
            synth_jitter_sigma: cfg.synth_jitter_sigma,
            pool_size: cfg.mc_pool_size.max(1),
            reset_fraction: cfg.mc_reset_fraction.clamp(0.0, 1.0),
        }
    }
}

/// Running means behind the noise-to-signal quality ratio.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QualityAccumulator {
    stdev_sum: f64,
    delta_sum: f64,
    count: u64,
}

impl QualityAccumulator {
    fn add(&mut self, stdev: f32, delta: f32) {
        self.stdev_sum += stdev as f64;
        self.delta_sum += delta.abs() as f64;
        self.count += 1;
    }

    /// `mean(stdev) / mean(|delta|)`; above 1 the model noise dominates.
    pub fn ratio(&self) -> Option<f32> {
        if self.count == 0 || self.delta_sum <= f64::EPSILON {
            return None;
        }
        Some((self.stdev_sum / self.delta_sum) as f32)
    }
}

/// Error of one prediction against a target row, accumulating quality stats.
pub fn prediction_error(
    prediction: &Prediction,
    state: &[f32],
    row: &TargetRow,
    timestep: f32,
    quality: &mut QualityAccumulator,
) -> f32 {
    let mut error = 0.0f32;
    for i in row.constrained() {
        let (Some(cur), Some(mean)) = (state.get(i), prediction.mean.get(i)) else {
            continue;
        };
        let delta = mean * timestep;
        let stdev = prediction.stdev(i) * timestep;
        quality.add(stdev, delta);
        error += ((row.target[i] - (cur + delta)).abs() + 0.5 * stdev) / row.tolerance[i];
    }
    error
}

/// Indices of the `k` smallest errors, best first. NaN sorts last.
pub fn top_k_indices(errors: &[f32], k: usize) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..errors.len()).collect();
    idx.sort_by(|&a, &b| {
        errors[a]
            .partial_cmp(&errors[b])
            .unwrap_or_else(|| errors[a].is_nan().cmp(&errors[b].is_nan()))
    });
    idx.truncate(k.max(1));
    idx
}

/// Uniform choice among the `k` lowest errors.
pub fn select_top_k(errors: &[f32], k: usize, rng: &mut Prng) -> Option<usize> {
    if errors.is_empty() {
        return None;
    }
    let top = top_k_indices(errors, k);
    Some(top[rng.gen_range_usize(0, top.len())])
}

/// Outcome of one scoring round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub picture: Option<StimulusKey>,
    pub keyword: Option<StimulusKey>,
    pub synth: Option<Vec<f32>>,
    /// Error of the best-ranked candidate across all groups.
    pub best_error: Option<f32>,
    pub quality: Option<f32>,
    pub evaluated: usize,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.picture.is_none() && self.keyword.is_none() && self.synth.is_none()
    }

    pub fn noisy(&self) -> bool {
        self.quality.map(|q| q > 1.0).unwrap_or(false)
    }

    pub fn stimuli(&self) -> Vec<Stimulus> {
        let mut out = Vec::with_capacity(3);
        if let Some(StimulusKey::Picture(id)) = self.picture {
            out.push(Stimulus::Picture(id));
        }
        if let Some(StimulusKey::Keyword(id)) = self.keyword {
            out.push(Stimulus::Keyword(id));
        }
        if let Some(p) = &self.synth {
            out.push(Stimulus::SynthParams(p.clone()));
        }
        out
    }

    fn note_best(&mut self, e: f32) {
        self.best_error = Some(match self.best_error {
            Some(b) if b <= e => b,
            _ => e,
        });
    }
}

/// Scoring strategy, picked per `Execute` command.
pub enum CandidateScorer {
    Direct(DirectScorer),
    MonteCarlo(MonteCarloScorer),
}

impl CandidateScorer {
    pub fn new(settings: ScoringSettings, monte_carlo: bool, signal_count: usize, rng: Prng) -> Self {
        if monte_carlo {
            CandidateScorer::MonteCarlo(MonteCarloScorer::new(settings, signal_count, rng))
        } else {
            CandidateScorer::Direct(DirectScorer::new(settings, rng))
        }
    }

    pub fn is_monte_carlo(&self) -> bool {
        matches!(self, CandidateScorer::MonteCarlo(_))
    }

    /// Rank every group and pick one candidate per group. `synth_current`
    /// is the parameter vector currently playing, if any.
    pub fn select(
        &mut self,
        models: &ModelSet,
        current: &[f32],
        row: &TargetRow,
        synth_current: Option<&[f32]>,
    ) -> Selection {
        let selection = match self {
            CandidateScorer::Direct(s) => s.select(models, current, row, synth_current),
            CandidateScorer::MonteCarlo(s) => s.select(models, row, synth_current),
        };
        if let Some(q) = selection.quality.filter(|q| *q > 1.0) {
            warn!("model noise exceeds signal (stdev/|delta| = {q:.2})");
        }
        selection
    }

    /// Drop any hypothetical state carried between rounds.
    pub fn flush(&mut self) {
        if let CandidateScorer::MonteCarlo(s) = self {
            s.reset_pool();
        }
    }
}

fn synth_input(before: &[f32], after: &[f32], state: &[f32]) -> Vec<f32> {
    let mut input = Vec::with_capacity(before.len() + after.len() + state.len());
    input.extend_from_slice(before);
    input.extend_from_slice(after);
    input.extend_from_slice(state);
    input
}

/// Perturbed copies of the current synth parameters, clamped to `[0, 1]`.
fn synth_candidates(current: &[f32], count: usize, sigma: f32, rng: &mut Prng) -> Vec<Vec<f32>> {
    (0..count)
        .map(|_| {
            let mut v: Vec<f32> = current
                .iter()
                .map(|p| p + sigma * rng.next_normal())
                .collect();
            clamp01(&mut v);
            v
        })
        .collect()
}

pub struct DirectScorer {
    settings: ScoringSettings,
    rng: Prng,
}

impl DirectScorer {
    pub fn new(settings: ScoringSettings, rng: Prng) -> Self {
        Self { settings, rng }
    }

    pub fn select(
        &mut self,
        models: &ModelSet,
        current: &[f32],
        row: &TargetRow,
        synth_current: Option<&[f32]>,
    ) -> Selection {
        let dt = self.settings.timestep_secs;
        let k = self.settings.top_k;
        let mut quality = QualityAccumulator::default();
        let mut out = Selection::default();

        for (group, slot) in [(&models.pictures, &mut out.picture), (&models.keywords, &mut out.keyword)] {
            let errors: Vec<f32> = group
                .iter()
                .map(|(_, m)| prediction_error(&m.predict(current), current, row, dt, &mut quality))
                .collect();
            *slot = select_top_k(&errors, k, &mut self.rng).map(|i| group[i].0);
            out.evaluated += errors.len();
            if let Some(best) = top_k_indices(&errors, 1).first() {
                out.best_error = Some(errors[*best].min(out.best_error.unwrap_or(f32::INFINITY)));
            }
        }

        if let (Some(model), Some(before)) = (&models.synth, synth_current) {
            let candidates = synth_candidates(
                before,
                self.settings.synth_candidates,
                self.settings.synth_jitter_sigma,
                &mut self.rng,
            );
            let errors: Vec<f32> = candidates
                .iter()
                .map(|c| {
                    let p = model.predict(&synth_input(before, c, current));
                    prediction_error(&p, current, row, dt, &mut quality)
                })
                .collect();
            if let Some(i) = select_top_k(&errors, k, &mut self.rng) {
                out.note_best(errors[top_k_indices(&errors, 1)[0]]);
                out.synth = candidates.into_iter().nth(i);
            }
            out.evaluated += errors.len();
        }

        out.quality = quality.ratio();
        out
    }
}

pub struct MonteCarloScorer {
    settings: ScoringSettings,
    rng: Prng,
    signal_count: usize,
    pool: Vec<Vec<f32>>,
}

impl MonteCarloScorer {
    pub fn new(settings: ScoringSettings, signal_count: usize, rng: Prng) -> Self {
        let mut s = Self {
            settings,
            rng,
            signal_count,
            pool: Vec::new(),
        };
        s.reset_pool();
        s
    }

    pub fn pool(&self) -> &[Vec<f32>] {
        &self.pool
    }

    pub fn reset_pool(&mut self) {
        let n = self.signal_count;
        let rng = &mut self.rng;
        self.pool = (0..self.settings.pool_size)
            .map(|_| {
                let mut v = vec![0.0; n];
                rng.fill_uniform(&mut v);
                v
            })
            .collect();
    }

    fn pool_error(
        &self,
        input_for: impl Fn(&[f32]) -> Vec<f32>,
        model: &Predictor,
        row: &TargetRow,
        quality: &mut QualityAccumulator,
    ) -> f32 {
        let dt = self.settings.timestep_secs;
        let total: f32 = self
            .pool
            .iter()
            .map(|state| prediction_error(&model.predict(&input_for(state)), state, row, dt, quality))
            .sum();
        total / self.pool.len().max(1) as f32
    }

    pub fn select(
        &mut self,
        models: &ModelSet,
        row: &TargetRow,
        synth_current: Option<&[f32]>,
    ) -> Selection {
        let k = self.settings.top_k;
        let mut quality = QualityAccumulator::default();
        let mut out = Selection::default();
        // (error, key) of every chosen enumerable stimulus, for pool advance.
        let mut chosen: Vec<(f32, StimulusKey)> = Vec::new();

        for (group, slot) in [(&models.pictures, &mut out.picture), (&models.keywords, &mut out.keyword)] {
            let errors: Vec<f32> = group
                .iter()
                .map(|(_, m)| self.pool_error(|s| s.to_vec(), m, row, &mut quality))
                .collect();
            out.evaluated += errors.len();
            if let Some(i) = select_top_k(&errors, k, &mut self.rng) {
                *slot = Some(group[i].0);
                chosen.push((errors[i], group[i].0));
                let best = errors[top_k_indices(&errors, 1)[0]];
                out.best_error = Some(best.min(out.best_error.unwrap_or(f32::INFINITY)));
            }
        }

        let mut synth_choice: Option<(f32, Vec<f32>)> = None;
        if let (Some(model), Some(before)) = (&models.synth, synth_current) {
            let candidates = synth_candidates(
                before,
                self.settings.synth_candidates,
                self.settings.synth_jitter_sigma,
                &mut self.rng,
            );
            let errors: Vec<f32> = candidates
                .iter()
                .map(|c| self.pool_error(|s| synth_input(before, c, s), model, row, &mut quality))
                .collect();
            out.evaluated += errors.len();
            if let Some(i) = select_top_k(&errors, k, &mut self.rng) {
                out.note_best(errors[top_k_indices(&errors, 1)[0]]);
                synth_choice = Some((errors[i], candidates[i].clone()));
            }
        }

        self.advance_pool(models, &mut chosen, synth_choice.as_ref(), synth_current);
        out.synth = synth_choice.map(|(_, v)| v);
        out.quality = quality.ratio();
        out
    }

    /// Move every pool member through one of the two best chosen models,
    /// clamp, then redraw a fraction of the pool.
    fn advance_pool(
        &mut self,
        models: &ModelSet,
        chosen: &mut Vec<(f32, StimulusKey)>,
        synth: Option<&(f32, Vec<f32>)>,
        synth_current: Option<&[f32]>,
    ) {
        let dt = self.settings.timestep_secs;
        if let Some((e, _)) = synth {
            chosen.push((*e, StimulusKey::Synth));
        }
        chosen.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));
        chosen.truncate(2);
        if chosen.is_empty() {
            return;
        }

        for state in self.pool.iter_mut() {
            let pick = chosen[self.rng.gen_range_usize(0, chosen.len())].1;
            let Some(model) = models.predictor(pick) else {
                continue;
            };
            let input = match (pick, synth, synth_current) {
                (StimulusKey::Synth, Some((_, after)), Some(before)) => synth_input(before, after, state),
                _ => state.clone(),
            };
            let p = model.predict(&input);
            for (s, d) in state.iter_mut().zip(&p.mean) {
                *s += d * dt;
            }
            clamp01(state);
        }

        let resets = (self.pool.len() as f32 * self.settings.reset_fraction).round() as usize;
        for i in self.rng.sample_indices(self.pool.len(), resets) {
            self.rng.fill_uniform(&mut self.pool[i]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Predicts a fixed delta with a fixed stdev, regardless of input.
    struct Fixed {
        delta: Vec<f32>,
        stdev: f32,
    }

    impl ResponsePredictor for Fixed {
        fn predict(&self, _input: &[f32]) -> Prediction {
            let n = self.delta.len();
            let mut p = Prediction::certain(self.delta.clone());
            for i in 0..n {
                p.covariance[i * n + i] = self.stdev * self.stdev;
            }
            p
        }
    }

    fn fixed(delta: &[f32], stdev: f32) -> Predictor {
        Box::new(Fixed {
            delta: delta.to_vec(),
            stdev,
        })
    }

    fn settings(top_k: usize) -> ScoringSettings {
        ScoringSettings {
            top_k,
            synth_candidates: 50,
            timestep_secs: 1.0,
            synth_jitter_sigma: 0.05,
            pool_size: 100,
            reset_fraction: 0.2,
        }
    }

    fn row(target: f32) -> TargetRow {
        TargetRow {
            target: vec![target],
            tolerance: vec![1.0],
        }
    }

    #[test]
    fn error_formula_counts_only_constrained_signals() {
        let row = TargetRow {
            target: vec![0.9, 0.0],
            tolerance: vec![0.5, f32::INFINITY],
        };
        let mut p = Prediction::certain(vec![0.1, 0.9]);
        p.covariance[0] = 0.04;
        let mut q = QualityAccumulator::default();
        let e = prediction_error(&p, &[0.5, 0.5], &row, 1.0, &mut q);
        // (|0.9 - 0.6| + 0.5 * 0.2) / 0.5
        assert!((e - 0.8).abs() < 1e-5, "e={e}");
        assert!((q.ratio().unwrap() - 2.0).abs() < 1e-5);
    }

    #[test]
    fn top_one_always_picks_the_best() {
        let mut rng = Prng::new(1);
        for _ in 0..200 {
            assert_eq!(select_top_k(&[0.9, 0.1], 1, &mut rng), Some(1));
        }
    }

    #[test]
    fn top_two_explores_both() {
        let mut rng = Prng::new(2);
        let mut hits = [0usize; 2];
        for _ in 0..400 {
            hits[select_top_k(&[0.1, 0.9], 2, &mut rng).unwrap()] += 1;
        }
        assert!(hits[0] > 0 && hits[1] > 0, "{hits:?}");
        assert_eq!(select_top_k(&[], 2, &mut rng), None);
    }

    #[test]
    fn nan_errors_rank_last() {
        assert_eq!(top_k_indices(&[f32::NAN, 0.5, 0.2], 3), vec![2, 1, 0]);
    }

    #[test]
    fn direct_strategy_ranks_groups_independently() {
        // Current 0.5, target 0.9: delta 0.3 gives error 0.1, delta -0.3 gives 0.7.
        let models = ModelSet {
            pictures: vec![
                (StimulusKey::Picture(0), fixed(&[-0.3], 0.0)),
                (StimulusKey::Picture(1), fixed(&[0.3], 0.0)),
            ],
            keywords: vec![
                (StimulusKey::Keyword(0), fixed(&[0.4], 0.0)),
                (StimulusKey::Keyword(1), fixed(&[0.0], 0.0)),
            ],
            synth: None,
        };
        let mut scorer = CandidateScorer::new(settings(1), false, 1, Prng::new(3));
        for _ in 0..20 {
            let s = scorer.select(&models, &[0.5], &row(0.9), None);
            assert_eq!(s.picture, Some(StimulusKey::Picture(1)));
            assert_eq!(s.keyword, Some(StimulusKey::Keyword(0)));
            assert!(s.best_error.unwrap() < 1e-5);
            assert_eq!(s.evaluated, 4);
            assert_eq!(s.stimuli().len(), 2);
        }
    }

    #[test]
    fn noisy_models_raise_quality_flag() {
        let models = ModelSet {
            keywords: vec![(StimulusKey::Keyword(0), fixed(&[0.01], 0.5))],
            ..ModelSet::default()
        };
        let mut scorer = CandidateScorer::new(settings(1), false, 1, Prng::new(4));
        let s = scorer.select(&models, &[0.5], &row(0.9), None);
        assert!(s.noisy());
        assert_eq!(s.keyword, Some(StimulusKey::Keyword(0)));
    }

    /// Synth model whose delta equals the "after" parameter minus 0.5.
    struct ParamDriven;

    impl ResponsePredictor for ParamDriven {
        fn predict(&self, input: &[f32]) -> Prediction {
            Prediction::certain(vec![input[1] - 0.5])
        }
    }

    #[test]
    fn synth_search_moves_toward_target() {
        let models = ModelSet {
            synth: Some(Box::new(ParamDriven)),
            ..ModelSet::default()
        };
        let mut scorer = DirectScorer::new(settings(1), Prng::new(5));
        let s = scorer.select(&models, &[0.5], &row(0.9), Some(&[0.5]));
        let params = s.synth.unwrap();
        assert_eq!(params.len(), 1);
        // The best of 50 jittered candidates pushes upward.
        assert!(params[0] > 0.5);
        assert!((0.0..=1.0).contains(&params[0]));
    }

    #[test]
    fn monte_carlo_pool_stays_in_range_and_refreshes() {
        let models = ModelSet {
            pictures: vec![
                (StimulusKey::Picture(0), fixed(&[5.0, 5.0], 0.0)),
                (StimulusKey::Picture(1), fixed(&[-5.0, -5.0], 0.0)),
            ],
            ..ModelSet::default()
        };
        let row = TargetRow {
            target: vec![1.0, 1.0],
            tolerance: vec![1.0, 1.0],
        };
        let mut scorer = MonteCarloScorer::new(settings(1), 2, Prng::new(6));
        assert_eq!(scorer.pool().len(), 100);
        let s = scorer.select(&models, &row, None);
        assert_eq!(s.picture, Some(StimulusKey::Picture(0)));
        assert!(scorer
            .pool()
            .iter()
            .flatten()
            .all(|v| (0.0..=1.0).contains(v)));
        // The chosen model saturates the pool; only redrawn members differ.
        let saturated = scorer.pool().iter().filter(|s| s[0] == 1.0 && s[1] == 1.0).count();
        assert_eq!(saturated, 80);
    }

    #[test]
    fn monte_carlo_redraws_exactly_the_reset_fraction() {
        let models = ModelSet {
            pictures: vec![
                (StimulusKey::Picture(0), fixed(&[5.0, 5.0], 0.0)),
                (StimulusKey::Picture(1), fixed(&[-5.0, -5.0], 0.0)),
            ],
            ..ModelSet::default()
        };
        let row = TargetRow {
            target: vec![1.0, 1.0],
            tolerance: vec![1.0, 1.0],
        };
        for seed in 0..20 {
            let mut scorer = MonteCarloScorer::new(settings(1), 2, Prng::new(seed));
            scorer.select(&models, &row, None);
            let fresh = scorer.pool().iter().filter(|s| s[0] < 1.0 || s[1] < 1.0).count();
            assert_eq!(fresh, 20, "seed={seed}");
        }
    }

    #[test]
    fn monte_carlo_averages_over_the_pool() {
        let models = ModelSet {
            keywords: vec![
                (StimulusKey::Keyword(0), fixed(&[0.0], 0.0)),
                (StimulusKey::Keyword(1), fixed(&[0.2], 0.0)),
            ],
            ..ModelSet::default()
        };
        let mut scorer = CandidateScorer::new(settings(1), true, 1, Prng::new(7));
        assert!(scorer.is_monte_carlo());
        let s = scorer.select(&models, &[0.0], &row(1.0), None);
        assert_eq!(s.keyword, Some(StimulusKey::Keyword(1)));
        scorer.flush();
    }
}
