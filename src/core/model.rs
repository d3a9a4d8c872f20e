//! Per-stimulus response models.
//!
//! A model maps the current (optionally decorrelated) input to an expected
//! state change per second. Models with an uncertainty snapshot also report a
//! predictive covariance built from the spread of sampled weight vectors.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Linear decorrelation of the state slice `[offset, offset + n)` of an input:
/// `z = L^-1 (x - mean)` where `L L^T` is the (regularised) covariance.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Decorrelation {
    pub offset: usize,
    pub mean: Vec<f32>,
    /// Row-major `n x n` lower-triangular inverse Cholesky factor.
    pub whitening: Vec<f32>,
}

impl Decorrelation {
    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    /// Fit on the state slice of every row. Returns `None` when there are too
    /// few rows or the covariance is not positive definite.
    pub fn fit<'a, I>(rows: I, offset: usize, n: usize, ridge: f64) -> Option<Self>
    where
        I: IntoIterator<Item = &'a [f32]>,
    {
        let rows: Vec<&[f32]> = rows.into_iter().collect();
        if n == 0 || rows.len() < 2 {
            return None;
        }
        let count = rows.len() as f64;
        let mut mean = vec![0.0f64; n];
        for r in &rows {
            let slice = r.get(offset..offset + n)?;
            for (m, v) in mean.iter_mut().zip(slice) {
                *m += *v as f64;
            }
        }
        for m in mean.iter_mut() {
            *m /= count;
        }

        let mut cov = vec![0.0f64; n * n];
        for r in &rows {
            let slice = &r[offset..offset + n];
            for i in 0..n {
                let di = slice[i] as f64 - mean[i];
                for j in 0..=i {
                    cov[i * n + j] += di * (slice[j] as f64 - mean[j]);
                }
            }
        }
        for i in 0..n {
            for j in 0..=i {
                let v = cov[i * n + j] / (count - 1.0);
                cov[i * n + j] = v;
                cov[j * n + i] = v;
            }
            cov[i * n + i] += ridge.max(1e-9);
        }

        let chol = cholesky(&cov, n)?;
        let inv = invert_lower(&chol, n)?;
        Some(Self {
            offset,
            mean: mean.into_iter().map(|m| m as f32).collect(),
            whitening: inv.into_iter().map(|v| v as f32).collect(),
        })
    }

    pub fn apply(&self, input: &[f32]) -> Vec<f32> {
        let n = self.dim();
        let mut out = input.to_vec();
        if input.len() < self.offset + n {
            return out;
        }
        let centred: Vec<f32> = (0..n)
            .map(|i| input[self.offset + i] - self.mean[i])
            .collect();
        for i in 0..n {
            let row = &self.whitening[i * n..i * n + n];
            out[self.offset + i] = row[..=i]
                .iter()
                .zip(&centred[..=i])
                .map(|(w, c)| w * c)
                .sum();
        }
        out
    }
}

/// Lower Cholesky factor of a symmetric positive-definite matrix.
pub(crate) fn cholesky(a: &[f64], n: usize) -> Option<Vec<f64>> {
    let mut l = vec![0.0f64; n * n];
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[i * n + j];
            for k in 0..j {
                sum -= l[i * n + k] * l[j * n + k];
            }
            if i == j {
                if sum <= 0.0 || !sum.is_finite() {
                    return None;
                }
                l[i * n + i] = sum.sqrt();
            } else {
                l[i * n + j] = sum / l[j * n + j];
            }
        }
    }
    Some(l)
}

pub(crate) fn invert_lower(l: &[f64], n: usize) -> Option<Vec<f64>> {
    let mut inv = vec![0.0f64; n * n];
    for col in 0..n {
        // Forward substitution for L x = e_col.
        for i in col..n {
            let mut sum = if i == col { 1.0 } else { 0.0 };
            for k in col..i {
                sum -= l[i * n + k] * inv[k * n + col];
            }
            let d = l[i * n + i];
            if d == 0.0 {
                return None;
            }
            inv[i * n + col] = sum / d;
        }
    }
    Some(inv)
}

/// Affine map `y = W x + b` with an optional input decorrelation.
///
/// Parameters are laid out as `output_dim` rows of `input_dim` weights
/// followed by `output_dim` biases.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Regressor {
    pub input_dim: usize,
    pub output_dim: usize,
    pub params: Vec<f32>,
    pub decorrelation: Option<Decorrelation>,
}

impl Regressor {
    pub fn param_count(input_dim: usize, output_dim: usize) -> usize {
        output_dim * (input_dim + 1)
    }

    pub fn zeros(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            params: vec![0.0; Self::param_count(input_dim, output_dim)],
            decorrelation: None,
        }
    }

    pub fn transform_input(&self, input: &[f32]) -> Vec<f32> {
        match &self.decorrelation {
            Some(d) => d.apply(input),
            None => input.to_vec(),
        }
    }

    /// Evaluate with an explicit parameter vector on an already transformed input.
    pub fn eval_with(
        params: &[f32],
        input_dim: usize,
        output_dim: usize,
        x: &[f32],
        out: &mut [f32],
    ) {
        let bias = &params[output_dim * input_dim..];
        for o in 0..output_dim {
            let row = &params[o * input_dim..(o + 1) * input_dim];
            let dot: f32 = row.iter().zip(x).map(|(w, v)| w * v).sum();
            out[o] = dot + bias[o];
        }
    }

    pub fn predict(&self, input: &[f32]) -> Vec<f32> {
        let x = self.transform_input(input);
        let mut out = vec![0.0; self.output_dim];
        Self::eval_with(&self.params, self.input_dim, self.output_dim, &x, &mut out);
        out
    }
}

/// Sampled weight vectors from the Bayesian phase plus residual noise.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UncertaintySnapshot {
    pub samples: Vec<Vec<f32>>,
    /// Per-output observation noise variance.
    pub noise_var: Vec<f32>,
}

/// Predicted delta-per-second with its covariance (row-major `n x n`).
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub mean: Vec<f32>,
    pub covariance: Vec<f32>,
}

impl Prediction {
    pub fn certain(mean: Vec<f32>) -> Self {
        let n = mean.len();
        Self {
            mean,
            covariance: vec![0.0; n * n],
        }
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn stdev(&self, i: usize) -> f32 {
        let n = self.dim();
        self.covariance
            .get(i * n + i)
            .map(|v| v.max(0.0).sqrt())
            .unwrap_or(0.0)
    }
}

/// Anything the scorer can query for a predicted response.
pub trait ResponsePredictor {
    fn predict(&self, input: &[f32]) -> Prediction;
}

/// A trained response model for one stimulus and one sensor.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ResponseModel {
    pub identity: String,
    pub sensor: String,
    pub regressor: Regressor,
    pub uncertainty: Option<UncertaintySnapshot>,
    pub trained_samples: u32,
    pub loss: f32,
}

impl ResponseModel {
    pub fn has_uncertainty(&self) -> bool {
        self.uncertainty
            .as_ref()
            .map(|u| !u.samples.is_empty())
            .unwrap_or(false)
    }
}

impl ResponsePredictor for ResponseModel {
    fn predict(&self, input: &[f32]) -> Prediction {
        let reg = &self.regressor;
        let x = reg.transform_input(input);
        let n = reg.output_dim;
        let mut mean = vec![0.0; n];
        Regressor::eval_with(&reg.params, reg.input_dim, n, &x, &mut mean);

        let Some(unc) = self.uncertainty.as_ref().filter(|u| !u.samples.is_empty()) else {
            return Prediction::certain(mean);
        };

        let mut preds: Vec<Vec<f32>> = Vec::with_capacity(unc.samples.len());
        for s in &unc.samples {
            if s.len() != reg.params.len() {
                continue;
            }
            let mut out = vec![0.0; n];
            Regressor::eval_with(s, reg.input_dim, n, &x, &mut out);
            preds.push(out);
        }
        let mut covariance = vec![0.0f32; n * n];
        if preds.len() >= 2 {
            let m = preds.len() as f32;
            let centre: Vec<f32> = (0..n)
                .map(|i| preds.iter().map(|p| p[i]).sum::<f32>() / m)
                .collect();
            for p in &preds {
                for i in 0..n {
                    let di = p[i] - centre[i];
                    for j in 0..n {
                        covariance[i * n + j] += di * (p[j] - centre[j]) / (m - 1.0);
                    }
                }
            }
        }
        for (i, v) in unc.noise_var.iter().take(n).enumerate() {
            covariance[i * n + i] += v.max(0.0);
        }
        Prediction { mean, covariance }
    }
}
