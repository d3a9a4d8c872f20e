//! Sequential two-phase training across a whole catalog.
//!
//! One stimulus at a time goes through gradient pre-fit, optional
//! uncertainty sampling, then persistence. The queue holds keys only; a
//! dataset is loaded when its job starts and dropped when it ends. With at
//! most one optimizer or sampler handle alive, memory stays flat however
//! large the catalog is.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::dataset::StimulusDataset;
use crate::model::ResponseModel;
use crate::storage::{ArtifactKey, ArtifactStore};
use crate::stimulus::StimulusKey;
use crate::training::{OptimizerHandle, SamplerHandle, TrainingServices};

/// Result of one `step`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JobStatus {
    /// A job is in flight; overall progress in `[0, 1]`.
    Running(f32),
    /// A stimulus finished (or was skipped); the next one starts on the next step.
    AdvancedToNext,
    AllComplete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobSettings {
    pub uncertainty: bool,
    pub sampler_quota: usize,
    pub optimizer_max_iters: usize,
    pub decorrelate: bool,
    pub outlier_sigma: f32,
    pub ridge: f32,
}

impl JobSettings {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            uncertainty: cfg.uncertainty,
            sampler_quota: cfg.sampler_quota.max(1),
            optimizer_max_iters: cfg.optimizer_max_iters.max(1),
            decorrelate: cfg.decorrelate,
            outlier_sigma: cfg.outlier_sigma,
            ridge: cfg.ridge,
        }
    }
}

enum JobPhase {
    Gradient(Box<dyn OptimizerHandle>),
    Sampling {
        handle: Box<dyn SamplerHandle>,
        point: ResponseModel,
    },
}

impl JobPhase {
    fn name(&self) -> &'static str {
        match self {
            JobPhase::Gradient(_) => "gradient",
            JobPhase::Sampling { .. } => "sampling",
        }
    }
}

struct OptimizationJob {
    stimulus: StimulusKey,
    key: ArtifactKey,
    dataset: StimulusDataset,
    phase: JobPhase,
    started_at: Duration,
}

pub struct OptimizationJobManager {
    settings: JobSettings,
    queue: VecDeque<(StimulusKey, ArtifactKey)>,
    job: Option<OptimizationJob>,
    total: usize,
    completed: usize,
    skipped: Vec<String>,
    unsaved: Vec<(ArtifactKey, ResponseModel)>,
    started_at: Option<Duration>,
}

impl OptimizationJobManager {
    /// `queue` must already be in training order.
    pub fn new(settings: JobSettings, queue: Vec<(StimulusKey, ArtifactKey)>) -> Self {
        Self {
            settings,
            total: queue.len(),
            queue: queue.into(),
            job: None,
            completed: 0,
            skipped: Vec::new(),
            unsaved: Vec::new(),
            started_at: None,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Index of the stimulus being trained; equals `total()` once done.
    pub fn stimulus_index(&self) -> usize {
        self.completed
    }

    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    pub fn unsaved_count(&self) -> usize {
        self.unsaved.len()
    }

    pub fn is_finished(&self) -> bool {
        self.job.is_none() && self.queue.is_empty()
    }

    /// Identity and phase name of the job in flight.
    pub fn current(&self) -> Option<(&str, &'static str)> {
        self.job
            .as_ref()
            .map(|j| (j.dataset.identity.as_str(), j.phase.name()))
    }

    pub fn current_stimulus(&self) -> Option<StimulusKey> {
        self.job.as_ref().map(|j| j.stimulus)
    }

    /// `(completed + partial) / total`.
    pub fn progress(&self) -> f32 {
        if self.total == 0 {
            return 1.0;
        }
        let partial = self.job.as_ref().map(|j| self.partial(j)).unwrap_or(0.0);
        ((self.completed as f32 + partial) / self.total as f32).clamp(0.0, 1.0)
    }

    /// Remaining time extrapolated from the elapsed time and progress so far.
    pub fn eta(&self, now: Duration) -> Option<Duration> {
        let start = self.started_at?;
        let p = self.progress();
        if p <= 0.0 || p >= 1.0 {
            return None;
        }
        let elapsed = now.saturating_sub(start).as_secs_f32();
        Some(Duration::from_secs_f32(elapsed * (1.0 - p) / p))
    }

    fn partial(&self, job: &OptimizationJob) -> f32 {
        let gradient_share = if self.settings.uncertainty { 0.5 } else { 1.0 };
        match &job.phase {
            JobPhase::Gradient(h) => {
                let it = h.poll().iterations as f32;
                gradient_share * (it / self.settings.optimizer_max_iters as f32).min(0.99)
            }
            JobPhase::Sampling { handle, .. } => {
                let c = handle.sample_count() as f32;
                gradient_share
                    + (1.0 - gradient_share) * (c / self.settings.sampler_quota as f32).min(0.99)
            }
        }
    }

    /// Advance the pipeline by exactly one action.
    pub fn step(
        &mut self,
        services: &mut TrainingServices,
        store: &mut dyn ArtifactStore,
        now: Duration,
    ) -> JobStatus {
        self.started_at.get_or_insert(now);
        self.retry_unsaved(store);

        let Some(job) = self.job.take() else {
            return match self.queue.pop_front() {
                Some((stimulus, key)) => self.start_job(services, &*store, stimulus, key, now),
                None => JobStatus::AllComplete,
            };
        };

        let OptimizationJob {
            stimulus,
            key,
            dataset,
            phase,
            started_at,
        } = job;

        match phase {
            JobPhase::Gradient(mut handle) => {
                let progress = handle.poll();
                if !progress.finished {
                    self.job = Some(OptimizationJob {
                        stimulus,
                        key,
                        dataset,
                        phase: JobPhase::Gradient(handle),
                        started_at,
                    });
                    return JobStatus::Running(self.progress());
                }
                handle.stop();
                drop(handle);

                let point = ResponseModel {
                    identity: dataset.identity.clone(),
                    sensor: dataset.sensor.clone(),
                    regressor: progress.regressor,
                    uncertainty: None,
                    trained_samples: dataset.len() as u32,
                    loss: progress.loss,
                };
                info!(
                    "{}: gradient phase done after {} iterations (loss {:.6})",
                    point.identity, progress.iterations, point.loss
                );

                if self.settings.uncertainty {
                    match services.sampler.start(&dataset, &point.regressor) {
                        Ok(handle) => {
                            self.job = Some(OptimizationJob {
                                stimulus,
                                key,
                                dataset,
                                phase: JobPhase::Sampling { handle, point },
                                started_at,
                            });
                            return JobStatus::Running(self.progress());
                        }
                        Err(e) => {
                            warn!("{}: sampler unavailable, keeping point estimate: {e}", point.identity);
                        }
                    }
                }
                self.finish(store, key, point, now.saturating_sub(started_at));
                JobStatus::AdvancedToNext
            }
            JobPhase::Sampling { mut handle, point } => {
                if handle.sample_count() < self.settings.sampler_quota {
                    self.job = Some(OptimizationJob {
                        stimulus,
                        key,
                        dataset,
                        phase: JobPhase::Sampling { handle, point },
                        started_at,
                    });
                    return JobStatus::Running(self.progress());
                }
                handle.stop();
                let model = handle.export_model(&point);
                drop(handle);
                self.finish(store, key, model, now.saturating_sub(started_at));
                JobStatus::AdvancedToNext
            }
        }
    }

    fn start_job(
        &mut self,
        services: &mut TrainingServices,
        store: &dyn ArtifactStore,
        stimulus: StimulusKey,
        key: ArtifactKey,
        now: Duration,
    ) -> JobStatus {
        let mut dataset = match store.load_dataset(&key) {
            Ok(Some(set)) => set,
            Ok(None) => return self.skip(key.identity, "no stored dataset"),
            Err(e) => return self.skip(key.identity, &e.to_string()),
        };
        if self.settings.outlier_sigma > 0.0 {
            dataset.filter_outliers(self.settings.outlier_sigma);
        }
        let decorrelation = if self.settings.decorrelate {
            dataset.fit_decorrelation(self.settings.ridge as f64)
        } else {
            None
        };

        match services.optimizer.start(&dataset, decorrelation) {
            Ok(handle) => {
                info!(
                    "training {} ({}/{}) on {} samples",
                    dataset.identity,
                    self.completed + 1,
                    self.total,
                    dataset.len()
                );
                self.job = Some(OptimizationJob {
                    stimulus,
                    key,
                    dataset,
                    phase: JobPhase::Gradient(handle),
                    started_at: now,
                });
                JobStatus::Running(self.progress())
            }
            Err(e) => self.skip(dataset.identity, &e.to_string()),
        }
    }

    fn skip(&mut self, identity: String, reason: &str) -> JobStatus {
        warn!("skipping {identity}: {reason}");
        self.skipped.push(identity);
        self.completed += 1;
        JobStatus::AdvancedToNext
    }

    fn finish(
        &mut self,
        store: &mut dyn ArtifactStore,
        key: ArtifactKey,
        model: ResponseModel,
        took: Duration,
    ) {
        self.completed += 1;
        match store.save_model(&key, &model) {
            Ok(()) => info!(
                "{}: model saved in {:.1}s ({}/{})",
                model.identity,
                took.as_secs_f32(),
                self.completed,
                self.total
            ),
            Err(e) => {
                warn!("{}: model not saved, will retry: {e}", model.identity);
                self.unsaved.push((key, model));
            }
        }
    }

    /// Retry models whose save failed earlier. Returns how many are still unsaved.
    pub fn retry_unsaved(&mut self, store: &mut dyn ArtifactStore) -> usize {
        self.unsaved
            .retain(|(key, model)| store.save_model(key, model).is_err());
        self.unsaved.len()
    }

    /// Stop and release the job in flight. Datasets not yet trained are dropped.
    pub fn stop(&mut self) {
        if let Some(job) = self.job.take() {
            info!("{}: {} phase stopped", job.dataset.identity, job.phase.name());
            match job.phase {
                JobPhase::Gradient(mut h) => h.stop(),
                JobPhase::Sampling { mut handle, .. } => handle.stop(),
            }
        }
        self.queue.clear();
    }
}

impl Drop for OptimizationJobManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Sample;
    use crate::model::ResponsePredictor;
    use crate::prng::Prng;
    use crate::storage::MemoryStore;
    use std::time::Instant;

    fn linear_set(identity: &str, input_dim: usize, n: usize, seed: u64) -> StimulusDataset {
        let mut rng = Prng::new(seed);
        let mut set = StimulusDataset::new(identity.to_string(), "stub".to_string(), input_dim, 1);
        for _ in 0..n {
            let input: Vec<f32> = (0..input_dim).map(|_| rng.next_f32_01()).collect();
            let delta = vec![0.3 * input[input_dim - 1] - 0.1 + 0.01 * rng.next_normal()];
            set.samples.push(Sample { input, delta });
        }
        set
    }

    fn catalog_sets() -> Vec<(StimulusKey, StimulusDataset)> {
        vec![
            (StimulusKey::Picture(0), linear_set("picture:a.png", 1, 40, 1)),
            (StimulusKey::Keyword(0), linear_set("keyword:calm", 1, 40, 2)),
            (StimulusKey::Synth, linear_set("synth:pad", 5, 60, 3)),
        ]
    }

    /// Persist `sets` and return the manager's queue for them.
    fn seed(store: &mut MemoryStore, sets: Vec<(StimulusKey, StimulusDataset)>) -> Vec<(StimulusKey, ArtifactKey)> {
        sets.into_iter()
            .map(|(stimulus, set)| {
                let key = ArtifactKey::new(&set.identity, &set.sensor);
                store.save_dataset(&key, &set).unwrap();
                (stimulus, key)
            })
            .collect()
    }

    fn settings(uncertainty: bool) -> JobSettings {
        let cfg = EngineConfig {
            uncertainty,
            sampler_quota: 30,
            sampler_burn_in: 10,
            ..EngineConfig::default()
        };
        JobSettings::from_config(&cfg)
    }

    fn services(uncertainty: bool) -> TrainingServices {
        let cfg = EngineConfig {
            uncertainty,
            sampler_quota: 30,
            sampler_burn_in: 10,
            ..EngineConfig::default()
        };
        TrainingServices::from_config(&cfg, 17)
    }

    fn run_to_completion(
        mgr: &mut OptimizationJobManager,
        svc: &mut TrainingServices,
        store: &mut MemoryStore,
    ) -> Vec<JobStatus> {
        let t0 = Instant::now();
        let mut seen = Vec::new();
        loop {
            assert!(t0.elapsed() < Duration::from_secs(60), "training never finished");
            let status = mgr.step(svc, store, t0.elapsed());
            assert!(svc.live.current() <= 1);
            seen.push(status);
            match status {
                JobStatus::AllComplete => return seen,
                JobStatus::Running(p) => {
                    assert!((0.0..=1.0).contains(&p));
                    std::thread::sleep(Duration::from_millis(1));
                }
                JobStatus::AdvancedToNext => {}
            }
        }
    }

    #[test]
    fn trains_whole_catalog_one_handle_at_a_time() {
        let mut svc = services(true);
        let mut store = MemoryStore::new();
        let queue = seed(&mut store, catalog_sets());
        let mut mgr = OptimizationJobManager::new(settings(true), queue);
        let seen = run_to_completion(&mut mgr, &mut svc, &mut store);

        assert_eq!(mgr.stimulus_index(), mgr.total());
        assert_eq!(store.model_count(), 3);
        assert_eq!(seen.iter().filter(|s| **s == JobStatus::AdvancedToNext).count(), 3);
        assert!(svc.live.peak() <= 1);
        assert_eq!(svc.live.current(), 0);

        let key = ArtifactKey::new("synth:pad", "stub");
        let model = store.load_model(&key).unwrap().unwrap();
        assert!(model.has_uncertainty());
        assert_eq!(model.regressor.input_dim, 5);
    }

    #[test]
    fn construction_failure_skips_only_that_stimulus() {
        let mut sets = catalog_sets();
        // An empty dataset makes the optimizer refuse to start.
        sets[1].1.samples.clear();
        let mut svc = services(false);
        let mut store = MemoryStore::new();
        let queue = seed(&mut store, sets);
        let mut mgr = OptimizationJobManager::new(settings(false), queue);
        run_to_completion(&mut mgr, &mut svc, &mut store);

        assert_eq!(mgr.skipped(), &["keyword:calm".to_string()]);
        assert_eq!(mgr.stimulus_index(), 3);
        assert_eq!(store.model_count(), 2);
    }

    #[test]
    fn rerun_on_same_data_is_idempotent() {
        let mut store = MemoryStore::new();
        let held_out = [0.7f32];
        let mut predictions = Vec::new();
        for _ in 0..2 {
            let mut svc = services(false);
            let queue = seed(&mut store, catalog_sets());
            let mut mgr = OptimizationJobManager::new(settings(false), queue);
            run_to_completion(&mut mgr, &mut svc, &mut store);
            assert_eq!(mgr.stimulus_index(), 3);
            let model = store
                .load_model(&ArtifactKey::new("keyword:calm", "stub"))
                .unwrap()
                .unwrap();
            predictions.push(model.predict(&held_out).mean[0]);
        }
        assert_eq!(store.model_count(), 3);
        assert!((predictions[0] - predictions[1]).abs() < 1e-3);
        assert!((predictions[0] - (0.3 * 0.7 - 0.1)).abs() < 0.02);
    }

    #[test]
    fn failed_saves_are_retried_at_next_step() {
        let mut svc = services(false);
        let mut store = MemoryStore::new();
        let queue = seed(
            &mut store,
            vec![(StimulusKey::Keyword(0), linear_set("keyword:calm", 1, 40, 2))],
        );
        store.fail_saves = true;
        let mut mgr = OptimizationJobManager::new(settings(false), queue);
        run_to_completion(&mut mgr, &mut svc, &mut store);
        assert_eq!(mgr.unsaved_count(), 1);
        assert_eq!(store.model_count(), 0);

        store.fail_saves = false;
        assert_eq!(mgr.step(&mut svc, &mut store, Duration::ZERO), JobStatus::AllComplete);
        assert_eq!(mgr.unsaved_count(), 0);
        assert_eq!(store.model_count(), 1);
    }

    #[test]
    fn stop_releases_live_handles() {
        let mut svc = services(true);
        let mut store = MemoryStore::new();
        let queue = seed(&mut store, catalog_sets());
        let mut mgr = OptimizationJobManager::new(settings(true), queue);
        let status = mgr.step(&mut svc, &mut store, Duration::ZERO);
        assert!(matches!(status, JobStatus::Running(_)));
        assert_eq!(svc.live.current(), 1);
        assert_eq!(mgr.current().map(|c| c.1), Some("gradient"));

        mgr.stop();
        assert_eq!(svc.live.current(), 0);
        assert!(mgr.is_finished());
    }

    #[test]
    fn empty_catalog_completes_immediately() {
        let mut svc = services(false);
        let mut store = MemoryStore::new();
        let mut mgr = OptimizationJobManager::new(settings(false), Vec::new());
        assert_eq!(mgr.progress(), 1.0);
        assert_eq!(
            mgr.step(&mut svc, &mut store, Duration::ZERO),
            JobStatus::AllComplete
        );
    }

    #[test]
    fn datasets_are_loaded_when_their_job_starts() {
        let mut svc = services(false);
        let mut store = MemoryStore::new();
        let mut queue = seed(
            &mut store,
            vec![(StimulusKey::Keyword(0), linear_set("keyword:calm", 1, 40, 2))],
        );
        let late = linear_set("keyword:rain", 1, 40, 4);
        let late_key = ArtifactKey::new(&late.identity, &late.sensor);
        queue.push((StimulusKey::Keyword(1), late_key.clone()));
        queue.push((StimulusKey::Keyword(2), ArtifactKey::new("keyword:gone", "stub")));
        let mut mgr = OptimizationJobManager::new(settings(false), queue);

        assert!(matches!(
            mgr.step(&mut svc, &mut store, Duration::ZERO),
            JobStatus::Running(_)
        ));
        assert_eq!(mgr.current().map(|c| c.0), Some("keyword:calm"));
        // Not in the store when the run began; picked up once its turn comes.
        store.save_dataset(&late_key, &late).unwrap();
        run_to_completion(&mut mgr, &mut svc, &mut store);

        assert!(store.load_model(&late_key).unwrap().is_some());
        assert_eq!(mgr.skipped(), &["keyword:gone".to_string()]);
        assert_eq!(store.model_count(), 2);
    }
}
