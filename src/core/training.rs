//! Optimizer and sampler services used by the job manager.
//!
//! Both run on their own threads and are only ever polled from the engine
//! worker through non-blocking accessors:
//! - `LbfgsOptimizer`: limited-memory quasi-Newton on the ridge-regularised
//!   squared error, with each gradient split across a bounded worker set.
//! - `HmcSampler`: Hamiltonian Monte Carlo over the regressor weights,
//!   seeded from the gradient solution, on one extra thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

#[cfg(feature = "parallel")]
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::dataset::StimulusDataset;
use crate::error::EngineError;
use crate::model::{Decorrelation, Regressor, ResponseModel, UncertaintySnapshot};
use crate::prng::Prng;

// ─────────────────────────────────────────────────────────────────────────
// Live-handle instrumentation
// ─────────────────────────────────────────────────────────────────────────

/// Counts optimizer/sampler handles that are currently alive.
#[derive(Debug, Clone, Default)]
pub struct LiveHandles {
    count: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl LiveHandles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously live handles ever observed.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn acquire(&self) -> HandleGuard {
        let now = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        HandleGuard {
            count: Arc::clone(&self.count),
        }
    }
}

#[derive(Debug)]
struct HandleGuard {
    count: Arc<AtomicUsize>,
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Service contracts
// ─────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OptimizerProgress {
    pub regressor: Regressor,
    pub loss: f32,
    pub iterations: usize,
    /// Converged or hit the iteration budget; the solution is final.
    pub finished: bool,
}

pub trait OptimizerHandle: Send {
    fn poll(&self) -> OptimizerProgress;
    fn stop(&mut self);
}

pub trait OptimizerService: Send {
    fn start(
        &mut self,
        dataset: &StimulusDataset,
        decorrelation: Option<Decorrelation>,
    ) -> Result<Box<dyn OptimizerHandle>, EngineError>;
}

pub trait SamplerHandle: Send {
    fn sample_count(&self) -> usize;
    fn export_model(&self, base: &ResponseModel) -> ResponseModel;
    fn stop(&mut self);
}

pub trait SamplerService: Send {
    fn start(
        &mut self,
        dataset: &StimulusDataset,
        warm_start: &Regressor,
    ) -> Result<Box<dyn SamplerHandle>, EngineError>;
}

/// The pair of backends the job manager drives, plus their instrumentation.
pub struct TrainingServices {
    pub optimizer: Box<dyn OptimizerService>,
    pub sampler: Box<dyn SamplerService>,
    pub live: LiveHandles,
}

impl TrainingServices {
    pub fn from_config(cfg: &EngineConfig, seed: u64) -> Self {
        let live = LiveHandles::new();
        Self {
            optimizer: Box::new(LbfgsOptimizer::from_config(cfg, live.clone())),
            sampler: Box::new(HmcSampler::from_config(cfg, seed, live.clone())),
            live,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Shared least-squares problem
// ─────────────────────────────────────────────────────────────────────────

/// Training rows with inputs already decorrelated.
#[derive(Debug)]
struct Problem {
    inputs: Vec<Vec<f32>>,
    targets: Vec<Vec<f32>>,
    input_dim: usize,
    output_dim: usize,
}

impl Problem {
    fn build(
        dataset: &StimulusDataset,
        decorrelation: Option<&Decorrelation>,
    ) -> Result<Self, EngineError> {
        if dataset.is_empty() {
            return Err(EngineError::Training(format!(
                "{}: empty dataset",
                dataset.identity
            )));
        }
        let mut inputs = Vec::with_capacity(dataset.len());
        let mut targets = Vec::with_capacity(dataset.len());
        for s in &dataset.samples {
            if s.input.len() != dataset.input_dim || s.delta.len() != dataset.output_dim {
                return Err(EngineError::Training(format!(
                    "{}: sample shape mismatch",
                    dataset.identity
                )));
            }
            inputs.push(match decorrelation {
                Some(d) => d.apply(&s.input),
                None => s.input.clone(),
            });
            targets.push(s.delta.clone());
        }
        Ok(Self {
            inputs,
            targets,
            input_dim: dataset.input_dim,
            output_dim: dataset.output_dim,
        })
    }

    fn param_count(&self) -> usize {
        Regressor::param_count(self.input_dim, self.output_dim)
    }

    fn rows(&self) -> usize {
        self.inputs.len()
    }

    /// `sum_n sum_o w_o * r_no^2 / 2` and its gradient over rows `[lo, hi)`.
    fn partial(&self, params: &[f64], weights: &[f64], lo: usize, hi: usize) -> (f64, Vec<f64>) {
        let (ni, no) = (self.input_dim, self.output_dim);
        let mut grad = vec![0.0f64; params.len()];
        let mut value = 0.0f64;
        for n in lo..hi {
            let x = &self.inputs[n];
            let y = &self.targets[n];
            for o in 0..no {
                let row = &params[o * ni..(o + 1) * ni];
                let pred: f64 = row
                    .iter()
                    .zip(x)
                    .map(|(w, v)| w * *v as f64)
                    .sum::<f64>()
                    + params[no * ni + o];
                let r = pred - y[o] as f64;
                value += 0.5 * weights[o] * r * r;
                let g = weights[o] * r;
                for (gi, v) in grad[o * ni..(o + 1) * ni].iter_mut().zip(x) {
                    *gi += g * *v as f64;
                }
                grad[no * ni + o] += g;
            }
        }
        (value, grad)
    }

    fn weighted_sse(&self, params: &[f64], weights: &[f64], workers: usize) -> (f64, Vec<f64>) {
        let rows = self.rows();
        let workers = workers.max(1).min(rows.max(1));
        if workers <= 1 || rows < 64 {
            return self.partial(params, weights, 0, rows);
        }
        let chunk = rows.div_ceil(workers);
        let bounds: Vec<(usize, usize)> = (0..workers)
            .map(|i| (i * chunk, ((i + 1) * chunk).min(rows)))
            .filter(|(lo, hi)| lo < hi)
            .collect();
        let parts = self.run_partials(params, weights, &bounds);

        let mut value = 0.0;
        let mut grad = vec![0.0f64; params.len()];
        for (v, g) in parts {
            value += v;
            for (a, b) in grad.iter_mut().zip(g) {
                *a += b;
            }
        }
        (value, grad)
    }

    #[cfg(not(feature = "parallel"))]
    fn run_partials(
        &self,
        params: &[f64],
        weights: &[f64],
        bounds: &[(usize, usize)],
    ) -> Vec<(f64, Vec<f64>)> {
        std::thread::scope(|scope| {
            let handles: Vec<_> = bounds
                .iter()
                .map(|&(lo, hi)| scope.spawn(move || self.partial(params, weights, lo, hi)))
                .collect();
            handles
                .into_iter()
                .filter_map(|h| h.join().ok())
                .collect()
        })
    }

    #[cfg(feature = "parallel")]
    fn run_partials(
        &self,
        params: &[f64],
        weights: &[f64],
        bounds: &[(usize, usize)],
    ) -> Vec<(f64, Vec<f64>)> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(bounds.len())
            .build();
        match pool {
            Ok(pool) => pool.install(|| {
                bounds
                    .par_iter()
                    .map(|&(lo, hi)| self.partial(params, weights, lo, hi))
                    .collect()
            }),
            Err(_) => bounds
                .iter()
                .map(|&(lo, hi)| self.partial(params, weights, lo, hi))
                .collect(),
        }
    }

    /// Mean squared residual per output at `params`.
    fn residual_variance(&self, params: &[f64]) -> Vec<f64> {
        let (ni, no) = (self.input_dim, self.output_dim);
        let mut acc = vec![0.0f64; no];
        for (x, y) in self.inputs.iter().zip(&self.targets) {
            for o in 0..no {
                let pred: f64 = params[o * ni..(o + 1) * ni]
                    .iter()
                    .zip(x)
                    .map(|(w, v)| w * *v as f64)
                    .sum::<f64>()
                    + params[no * ni + o];
                let r = pred - y[o] as f64;
                acc[o] += r * r;
            }
        }
        let n = self.rows().max(1) as f64;
        acc.into_iter().map(|v| (v / n).max(1e-8)).collect()
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn to_f32(v: &[f64]) -> Vec<f32> {
    v.iter().map(|x| *x as f32).collect()
}

// ─────────────────────────────────────────────────────────────────────────
// L-BFGS optimizer
// ─────────────────────────────────────────────────────────────────────────

const LBFGS_HISTORY: usize = 6;
const ARMIJO_C1: f64 = 1e-4;
const MAX_BACKTRACKS: usize = 40;

#[derive(Debug, Clone)]
pub struct LbfgsOptimizer {
    pub workers: usize,
    pub max_iters: usize,
    pub tolerance: f64,
    pub ridge: f64,
    live: LiveHandles,
}

impl LbfgsOptimizer {
    pub fn from_config(cfg: &EngineConfig, live: LiveHandles) -> Self {
        Self {
            workers: cfg.gradient_workers.max(1),
            max_iters: cfg.optimizer_max_iters.max(1),
            tolerance: cfg.optimizer_tolerance as f64,
            ridge: cfg.ridge.max(0.0) as f64,
            live,
        }
    }
}

#[derive(Debug)]
struct OptimizerShared {
    snapshot: Mutex<OptimizerProgress>,
    stop: AtomicBool,
}

struct LbfgsHandle {
    shared: Arc<OptimizerShared>,
    thread: Option<JoinHandle<()>>,
    _guard: HandleGuard,
}

impl OptimizerService for LbfgsOptimizer {
    fn start(
        &mut self,
        dataset: &StimulusDataset,
        decorrelation: Option<Decorrelation>,
    ) -> Result<Box<dyn OptimizerHandle>, EngineError> {
        let problem = Problem::build(dataset, decorrelation.as_ref())?;
        let initial = Regressor {
            input_dim: problem.input_dim,
            output_dim: problem.output_dim,
            params: vec![0.0; problem.param_count()],
            decorrelation,
        };
        let shared = Arc::new(OptimizerShared {
            snapshot: Mutex::new(OptimizerProgress {
                regressor: initial.clone(),
                loss: f32::INFINITY,
                iterations: 0,
                finished: false,
            }),
            stop: AtomicBool::new(false),
        });

        let cfg = self.clone();
        let worker_shared = Arc::clone(&shared);
        let identity = dataset.identity.clone();
        let thread = std::thread::Builder::new()
            .name(format!("lbfgs:{identity}"))
            .spawn(move || run_lbfgs(&cfg, &problem, initial, &worker_shared))
            .map_err(|e| EngineError::Training(format!("spawn optimizer: {e}")))?;

        Ok(Box::new(LbfgsHandle {
            shared,
            thread: Some(thread),
            _guard: self.live.acquire(),
        }))
    }
}

impl OptimizerHandle for LbfgsHandle {
    fn poll(&self) -> OptimizerProgress {
        match self.shared.snapshot.lock() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(t) = self.thread.take() {
            if t.join().is_err() {
                warn!("optimizer thread panicked");
            }
        }
    }
}

impl Drop for LbfgsHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_lbfgs(
    cfg: &LbfgsOptimizer,
    problem: &Problem,
    initial: Regressor,
    shared: &OptimizerShared,
) {
    let n = problem.rows().max(1) as f64;
    let ni = problem.input_dim;
    let no = problem.output_dim;
    let weights = vec![1.0 / n; no];
    let ridge = cfg.ridge;

    // Mean squared error plus a ridge penalty on the weights (not the biases).
    let objective = |x: &[f64]| -> (f64, Vec<f64>) {
        let (mut f, mut g) = problem.weighted_sse(x, &weights, cfg.workers);
        for i in 0..no * ni {
            f += 0.5 * ridge * x[i] * x[i];
            g[i] += ridge * x[i];
        }
        (f, g)
    };

    let publish = |x: &[f64], f: f64, iterations: usize, finished: bool| {
        if let Ok(mut s) = shared.snapshot.lock() {
            s.regressor.params = to_f32(x);
            s.loss = f as f32;
            s.iterations = iterations;
            s.finished = finished;
        }
    };

    let mut x: Vec<f64> = initial.params.iter().map(|v| *v as f64).collect();
    let (mut f, mut g) = objective(&x);
    let mut history: VecDeque<(Vec<f64>, Vec<f64>, f64)> = VecDeque::with_capacity(LBFGS_HISTORY);
    let mut iterations = 0usize;
    publish(&x, f, 0, false);

    while iterations < cfg.max_iters {
        if shared.stop.load(Ordering::Relaxed) {
            publish(&x, f, iterations, false);
            return;
        }
        let gnorm = dot(&g, &g).sqrt();
        if gnorm < 1e-12 {
            break;
        }

        // Two-loop recursion: d = -H g.
        let mut q = g.clone();
        let mut alphas = Vec::with_capacity(history.len());
        for (s, y, rho) in history.iter().rev() {
            let a = rho * dot(s, &q);
            for (qi, yi) in q.iter_mut().zip(y) {
                *qi -= a * yi;
            }
            alphas.push(a);
        }
        if let Some((s, y, _)) = history.back() {
            let gamma = dot(s, y) / dot(y, y).max(1e-300);
            q.iter_mut().for_each(|v| *v *= gamma);
        }
        for ((s, y, rho), a) in history.iter().zip(alphas.into_iter().rev()) {
            let b = rho * dot(y, &q);
            for (qi, si) in q.iter_mut().zip(s) {
                *qi += (a - b) * si;
            }
        }
        let mut d: Vec<f64> = q.into_iter().map(|v| -v).collect();
        let mut slope = dot(&g, &d);
        if slope >= 0.0 {
            history.clear();
            d = g.iter().map(|v| -v).collect();
            slope = -gnorm * gnorm;
        }

        let mut step = if history.is_empty() {
            (1.0 / gnorm).min(1.0)
        } else {
            1.0
        };
        let mut accepted = None;
        for _ in 0..MAX_BACKTRACKS {
            let candidate: Vec<f64> = x.iter().zip(&d).map(|(xi, di)| xi + step * di).collect();
            let (fc, gc) = objective(&candidate);
            if fc.is_finite() && fc <= f + ARMIJO_C1 * step * slope {
                accepted = Some((candidate, fc, gc));
                break;
            }
            step *= 0.5;
        }
        iterations += 1;

        let Some((x_new, f_new, g_new)) = accepted else {
            debug!("lbfgs: line search stalled after {} iterations", iterations);
            break;
        };
        let s: Vec<f64> = x_new.iter().zip(&x).map(|(a, b)| a - b).collect();
        let y: Vec<f64> = g_new.iter().zip(&g).map(|(a, b)| a - b).collect();
        let sy = dot(&s, &y);
        if sy > 1e-16 {
            if history.len() == LBFGS_HISTORY {
                history.pop_front();
            }
            history.push_back((s, y, 1.0 / sy));
        }

        let improvement = (f - f_new).abs();
        x = x_new;
        let f_prev = f;
        f = f_new;
        g = g_new;
        publish(&x, f, iterations, false);

        if improvement <= cfg.tolerance * f_prev.abs().max(1e-12) {
            break;
        }
    }
    publish(&x, f, iterations, true);
}

// ─────────────────────────────────────────────────────────────────────────
// HMC sampler
// ─────────────────────────────────────────────────────────────────────────

const TARGET_ACCEPT: f64 = 0.65;

#[derive(Debug, Clone)]
pub struct HmcSampler {
    pub quota: usize,
    pub burn_in: usize,
    pub step_size: f64,
    pub leapfrog_steps: usize,
    pub prior_sigma: f64,
    pub snapshot_size: usize,
    rng: Prng,
    live: LiveHandles,
}

impl HmcSampler {
    pub fn from_config(cfg: &EngineConfig, seed: u64, live: LiveHandles) -> Self {
        Self {
            quota: cfg.sampler_quota.max(1),
            burn_in: cfg.sampler_burn_in,
            step_size: cfg.sampler_step_size.max(1e-6) as f64,
            leapfrog_steps: cfg.sampler_leapfrog_steps.max(1),
            prior_sigma: cfg.prior_sigma.max(1e-3) as f64,
            snapshot_size: cfg.uncertainty_snapshot.max(2),
            rng: Prng::new(seed ^ 0x4843_4D53),
            live,
        }
    }
}

#[derive(Debug, Default)]
struct SamplerState {
    samples: Vec<Vec<f32>>,
    noise_var: Vec<f32>,
    accepted: usize,
    proposed: usize,
}

#[derive(Debug)]
struct SamplerShared {
    state: Mutex<SamplerState>,
    count: AtomicUsize,
    stop: AtomicBool,
}

struct HmcHandle {
    shared: Arc<SamplerShared>,
    snapshot_size: usize,
    thread: Option<JoinHandle<()>>,
    _guard: HandleGuard,
}

impl SamplerService for HmcSampler {
    fn start(
        &mut self,
        dataset: &StimulusDataset,
        warm_start: &Regressor,
    ) -> Result<Box<dyn SamplerHandle>, EngineError> {
        let problem = Problem::build(dataset, warm_start.decorrelation.as_ref())?;
        if warm_start.params.len() != problem.param_count() {
            return Err(EngineError::Training(format!(
                "{}: warm start has {} params, expected {}",
                dataset.identity,
                warm_start.params.len(),
                problem.param_count()
            )));
        }
        let shared = Arc::new(SamplerShared {
            state: Mutex::new(SamplerState::default()),
            count: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
        });
        let cfg = self.clone();
        let rng = self.rng.fork();
        let start: Vec<f64> = warm_start.params.iter().map(|v| *v as f64).collect();
        let worker_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name(format!("hmc:{}", dataset.identity))
            .spawn(move || run_hmc(&cfg, &problem, start, rng, &worker_shared))
            .map_err(|e| EngineError::Training(format!("spawn sampler: {e}")))?;

        Ok(Box::new(HmcHandle {
            shared,
            snapshot_size: self.snapshot_size,
            thread: Some(thread),
            _guard: self.live.acquire(),
        }))
    }
}

impl SamplerHandle for HmcHandle {
    fn sample_count(&self) -> usize {
        self.shared.count.load(Ordering::SeqCst)
    }

    fn export_model(&self, base: &ResponseModel) -> ResponseModel {
        let state = match self.shared.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut model = base.clone();
        if state.samples.is_empty() {
            return model;
        }

        let dim = state.samples[0].len();
        let m = state.samples.len() as f64;
        let mut mean = vec![0.0f64; dim];
        for s in &state.samples {
            for (a, b) in mean.iter_mut().zip(s) {
                *a += *b as f64 / m;
            }
        }
        model.regressor.params = to_f32(&mean);

        // Thin the chain evenly down to the snapshot size.
        let keep = self.snapshot_size.min(state.samples.len());
        let stride = state.samples.len() as f64 / keep as f64;
        let samples = (0..keep)
            .map(|i| state.samples[((i as f64 * stride) as usize).min(state.samples.len() - 1)].clone())
            .collect();
        model.uncertainty = Some(UncertaintySnapshot {
            samples,
            noise_var: state.noise_var.clone(),
        });
        if state.proposed > 0 {
            debug!(
                "{}: hmc acceptance {:.2}",
                model.identity,
                state.accepted as f64 / state.proposed as f64
            );
        }
        model
    }

    fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(t) = self.thread.take() {
            if t.join().is_err() {
                warn!("sampler thread panicked");
            }
        }
    }
}

impl Drop for HmcHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_hmc(
    cfg: &HmcSampler,
    problem: &Problem,
    start: Vec<f64>,
    mut rng: Prng,
    shared: &SamplerShared,
) {
    let noise_var = problem.residual_variance(&start);
    let inv_var: Vec<f64> = noise_var.iter().map(|v| 1.0 / v).collect();
    let prior_prec = 1.0 / (cfg.prior_sigma * cfg.prior_sigma);
    if let Ok(mut st) = shared.state.lock() {
        st.noise_var = to_f32(&noise_var);
    }

    // Potential energy: Gaussian likelihood plus Gaussian prior.
    let potential = |x: &[f64]| -> (f64, Vec<f64>) {
        let (mut u, mut g) = problem.weighted_sse(x, &inv_var, 1);
        u += 0.5 * prior_prec * dot(x, x);
        for (gi, xi) in g.iter_mut().zip(x) {
            *gi += prior_prec * xi;
        }
        (u, g)
    };

    // Scale the initial step by the data size; adapted during burn-in.
    let mut eps = cfg.step_size / (problem.rows() as f64).sqrt().max(1.0);
    let mut x = start;
    let (mut u, mut grad) = potential(&x);
    let mut iteration = 0usize;

    while !shared.stop.load(Ordering::Relaxed) {
        let p0: Vec<f64> = (0..x.len()).map(|_| rng.next_normal() as f64).collect();
        let mut p = p0.clone();
        let mut xn = x.clone();
        let mut gn = grad.clone();
        let mut un = u;

        for _ in 0..cfg.leapfrog_steps {
            for (pi, gi) in p.iter_mut().zip(&gn) {
                *pi -= 0.5 * eps * gi;
            }
            for (xi, pi) in xn.iter_mut().zip(&p) {
                *xi += eps * pi;
            }
            let (u2, g2) = potential(&xn);
            un = u2;
            gn = g2;
            for (pi, gi) in p.iter_mut().zip(&gn) {
                *pi -= 0.5 * eps * gi;
            }
        }

        let h0 = u + 0.5 * dot(&p0, &p0);
        let h1 = un + 0.5 * dot(&p, &p);
        let log_accept = h0 - h1;
        let accept = h1.is_finite() && (log_accept >= 0.0 || (rng.next_f32_01() as f64) < log_accept.exp());
        if accept {
            x = xn;
            u = un;
            grad = gn;
        }

        iteration += 1;
        if iteration <= cfg.burn_in {
            // Robbins-Monro style nudge toward the target acceptance rate.
            let rate = if accept { 1.0 } else { 0.0 };
            eps *= (1.0 + 0.1 * (rate - TARGET_ACCEPT)).max(0.5);
            continue;
        }

        let count = {
            let mut st = match shared.state.lock() {
                Ok(s) => s,
                Err(poisoned) => poisoned.into_inner(),
            };
            st.proposed += 1;
            if accept {
                st.accepted += 1;
            }
            st.samples.push(to_f32(&x));
            st.samples.len()
        };
        shared.count.store(count, Ordering::SeqCst);
        if count >= cfg.quota {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Sample;
    use std::time::{Duration, Instant};

    fn linear_dataset(n: usize, noise: f32, seed: u64) -> StimulusDataset {
        let mut rng = Prng::new(seed);
        let mut data = StimulusDataset::new("keyword:test".to_string(), "stub".to_string(), 2, 2);
        for _ in 0..n {
            let a = rng.next_f32_01();
            let b = rng.next_f32_01();
            data.samples.push(Sample {
                input: vec![a, b],
                delta: vec![
                    0.5 * a - 0.2 * b + 0.1 + noise * rng.next_normal(),
                    -0.3 * a + 0.05 + noise * rng.next_normal(),
                ],
            });
        }
        data
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            ridge: 1e-6,
            optimizer_max_iters: 500,
            gradient_workers: 3,
            sampler_quota: 60,
            sampler_burn_in: 30,
            ..EngineConfig::default()
        }
    }

    fn wait_until<F: Fn() -> bool>(f: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(30);
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn lbfgs_recovers_linear_response() {
        let data = linear_dataset(400, 0.0, 11);
        let live = LiveHandles::new();
        let mut opt = LbfgsOptimizer::from_config(&test_config(), live.clone());
        let handle = opt.start(&data, None).unwrap();
        assert_eq!(live.current(), 1);
        assert!(wait_until(|| handle.poll().finished));

        let progress = handle.poll();
        let y = progress.regressor.predict(&[0.4, 0.8]);
        assert!((y[0] - (0.2 - 0.16 + 0.1)).abs() < 1e-2, "y0={}", y[0]);
        assert!((y[1] - (-0.12 + 0.05)).abs() < 1e-2, "y1={}", y[1]);
        drop(handle);
        assert_eq!(live.current(), 0);
    }

    #[test]
    fn lbfgs_stop_returns_promptly() {
        let data = linear_dataset(2_000, 0.05, 3);
        let mut opt = LbfgsOptimizer::from_config(
            &EngineConfig {
                optimizer_max_iters: 1_000_000,
                optimizer_tolerance: 0.0,
                ..test_config()
            },
            LiveHandles::new(),
        );
        let mut handle = opt.start(&data, None).unwrap();
        let t0 = Instant::now();
        handle.stop();
        assert!(t0.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn empty_dataset_fails_to_start() {
        let data = StimulusDataset::new("picture:x".to_string(), "stub".to_string(), 2, 2);
        let mut opt = LbfgsOptimizer::from_config(&test_config(), LiveHandles::new());
        assert!(opt.start(&data, None).is_err());
    }

    #[test]
    fn hmc_reaches_quota_and_exports_uncertainty() {
        let data = linear_dataset(200, 0.05, 5);
        let live = LiveHandles::new();
        let mut opt = LbfgsOptimizer::from_config(&test_config(), live.clone());
        let opt_handle = opt.start(&data, None).unwrap();
        assert!(wait_until(|| opt_handle.poll().finished));
        let warm = opt_handle.poll().regressor;
        drop(opt_handle);

        let mut sampler = HmcSampler::from_config(&test_config(), 9, live.clone());
        let mut handle = sampler.start(&data, &warm).unwrap();
        assert!(wait_until(|| handle.sample_count() >= 60));
        handle.stop();

        let base = ResponseModel {
            identity: data.identity.clone(),
            sensor: data.sensor.clone(),
            regressor: warm.clone(),
            uncertainty: None,
            trained_samples: data.len() as u32,
            loss: 0.0,
        };
        let model = handle.export_model(&base);
        let unc = model.uncertainty.as_ref().unwrap();
        assert!(!unc.samples.is_empty());
        assert!(unc.samples.len() <= test_config().uncertainty_snapshot);
        assert_eq!(unc.noise_var.len(), 2);
        // Posterior mean stays near the point estimate.
        let a = model.regressor.predict(&[0.5, 0.5]);
        let b = warm.predict(&[0.5, 0.5]);
        assert!((a[0] - b[0]).abs() < 0.1);
        drop(handle);
        assert_eq!(live.current(), 0);
        assert_eq!(live.peak(), 1);
    }
}
