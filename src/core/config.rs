//! Engine tuning knobs.
//!
//! Every constant the control loop depends on lives here so the daemon can
//! load overrides from `config.json` and `NEUROFEED_*` environment variables.

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EngineConfig {
    /// Fixed scheduler tick.
    #[cfg_attr(feature = "serde", serde(default = "default_tick_ms"))]
    pub tick_ms: u64,
    /// Wait between presenting a stimulus and taking the "after" reading.
    #[cfg_attr(feature = "serde", serde(default = "default_settle_ms"))]
    pub settle_ms: u64,
    /// How long the sensor may stay disconnected before a command aborts.
    #[cfg_attr(feature = "serde", serde(default = "default_grace_ms"))]
    pub sensor_grace_ms: u64,

    #[cfg_attr(feature = "serde", serde(default = "default_min_samples"))]
    pub min_samples: usize,
    /// Persist collected datasets after this many stored samples.
    #[cfg_attr(feature = "serde", serde(default = "default_autosave_every"))]
    pub autosave_every: u32,
    #[cfg_attr(feature = "serde", serde(default))]
    pub decorrelate: bool,
    /// Samples whose delta is further than this many sigmas from the mean are
    /// dropped before training. Zero disables filtering.
    #[cfg_attr(feature = "serde", serde(default = "default_outlier_sigma"))]
    pub outlier_sigma: f32,

    // Collecting: synth-parameter exploration.
    #[cfg_attr(feature = "serde", serde(default = "default_jitter_prob"))]
    pub synth_jitter_prob: f32,
    #[cfg_attr(feature = "serde", serde(default = "default_jitter_sigma"))]
    pub synth_jitter_sigma: f32,

    // Scoring.
    #[cfg_attr(feature = "serde", serde(default = "default_top_k"))]
    pub top_k: usize,
    #[cfg_attr(feature = "serde", serde(default = "default_synth_candidates"))]
    pub synth_candidates: usize,
    #[cfg_attr(feature = "serde", serde(default = "default_timestep"))]
    pub scoring_timestep_secs: f32,
    #[cfg_attr(feature = "serde", serde(default = "default_pool_size"))]
    pub mc_pool_size: usize,
    #[cfg_attr(feature = "serde", serde(default = "default_reset_fraction"))]
    pub mc_reset_fraction: f32,
    #[cfg_attr(feature = "serde", serde(default = "default_tolerance"))]
    pub default_tolerance: f32,

    // Training.
    #[cfg_attr(feature = "serde", serde(default = "default_true"))]
    pub uncertainty: bool,
    #[cfg_attr(feature = "serde", serde(default = "default_max_iters"))]
    pub optimizer_max_iters: usize,
    #[cfg_attr(feature = "serde", serde(default = "default_opt_tolerance"))]
    pub optimizer_tolerance: f32,
    #[cfg_attr(feature = "serde", serde(default = "default_gradient_workers"))]
    pub gradient_workers: usize,
    #[cfg_attr(feature = "serde", serde(default = "default_ridge"))]
    pub ridge: f32,
    #[cfg_attr(feature = "serde", serde(default = "default_prior_sigma"))]
    pub prior_sigma: f32,
    #[cfg_attr(feature = "serde", serde(default = "default_sampler_quota"))]
    pub sampler_quota: usize,
    #[cfg_attr(feature = "serde", serde(default = "default_burn_in"))]
    pub sampler_burn_in: usize,
    #[cfg_attr(feature = "serde", serde(default = "default_step_size"))]
    pub sampler_step_size: f32,
    #[cfg_attr(feature = "serde", serde(default = "default_leapfrog"))]
    pub sampler_leapfrog_steps: usize,
    /// Weight samples kept in an exported uncertainty snapshot.
    #[cfg_attr(feature = "serde", serde(default = "default_snapshot_size"))]
    pub uncertainty_snapshot: usize,

    #[cfg_attr(feature = "serde", serde(default))]
    pub seed: Option<u64>,
}

fn default_tick_ms() -> u64 {
    100
}

fn default_settle_ms() -> u64 {
    1_000
}

fn default_grace_ms() -> u64 {
    2_000
}

fn default_min_samples() -> usize {
    10
}

fn default_autosave_every() -> u32 {
    20
}

fn default_outlier_sigma() -> f32 {
    4.0
}

fn default_jitter_prob() -> f32 {
    0.8
}

fn default_jitter_sigma() -> f32 {
    0.05
}

fn default_top_k() -> usize {
    3
}

fn default_synth_candidates() -> usize {
    300
}

fn default_timestep() -> f32 {
    1.0
}

fn default_pool_size() -> usize {
    100
}

fn default_reset_fraction() -> f32 {
    0.2
}

fn default_tolerance() -> f32 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_max_iters() -> usize {
    400
}

fn default_opt_tolerance() -> f32 {
    1e-7
}

fn default_gradient_workers() -> usize {
    4
}

fn default_ridge() -> f32 {
    1e-3
}

fn default_prior_sigma() -> f32 {
    10.0
}

fn default_sampler_quota() -> usize {
    200
}

fn default_burn_in() -> usize {
    50
}

fn default_step_size() -> f32 {
    0.01
}

fn default_leapfrog() -> usize {
    12
}

fn default_snapshot_size() -> usize {
    40
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            settle_ms: default_settle_ms(),
            sensor_grace_ms: default_grace_ms(),
            min_samples: default_min_samples(),
            autosave_every: default_autosave_every(),
            decorrelate: false,
            outlier_sigma: default_outlier_sigma(),
            synth_jitter_prob: default_jitter_prob(),
            synth_jitter_sigma: default_jitter_sigma(),
            top_k: default_top_k(),
            synth_candidates: default_synth_candidates(),
            scoring_timestep_secs: default_timestep(),
            mc_pool_size: default_pool_size(),
            mc_reset_fraction: default_reset_fraction(),
            default_tolerance: default_tolerance(),
            uncertainty: true,
            optimizer_max_iters: default_max_iters(),
            optimizer_tolerance: default_opt_tolerance(),
            gradient_workers: default_gradient_workers(),
            ridge: default_ridge(),
            prior_sigma: default_prior_sigma(),
            sampler_quota: default_sampler_quota(),
            sampler_burn_in: default_burn_in(),
            sampler_step_size: default_step_size(),
            sampler_leapfrog_steps: default_leapfrog(),
            uncertainty_snapshot: default_snapshot_size(),
            seed: None,
        }
    }
}

impl EngineConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn settle_secs(&self) -> f32 {
        self.settle_ms as f32 / 1000.0
    }

    pub fn sensor_grace(&self) -> Duration {
        Duration::from_millis(self.sensor_grace_ms)
    }

    /// Load a JSON config; absent fields take their defaults.
    #[cfg(feature = "serde")]
    pub fn from_json_file(path: &std::path::Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config {:?}: {e}", path))?;
        serde_json::from_str(&text).map_err(|e| format!("Failed to parse config {:?}: {e}", path))
    }

    /// Apply `NEUROFEED_*` environment overrides.
    pub fn apply_env(&mut self) {
        if let Some(ms) = env_parse::<u64>("NEUROFEED_TICK_MS") {
            self.tick_ms = ms.max(1);
        }
        if let Some(ms) = env_parse::<u64>("NEUROFEED_SETTLE_MS") {
            self.settle_ms = ms;
        }
        if let Ok(v) = std::env::var("NEUROFEED_UNCERTAINTY") {
            let vv = v.trim().to_ascii_lowercase();
            self.uncertainty = !(vv == "off" || vv == "0" || vv == "false");
        }
        if let Some(k) = env_parse::<usize>("NEUROFEED_TOP_K") {
            self.top_k = k.max(1);
        }
        if let Some(n) = env_parse::<usize>("NEUROFEED_GRADIENT_WORKERS") {
            self.gradient_workers = n.max(1);
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse::<T>().ok()
}
