// Minimal PRNG (no external crates).
//
// This is NOT cryptographically secure.
// It drives stimulus exploration, Monte-Carlo pools and HMC momenta, where
// reproducibility from a seed matters more than statistical strength.

#[derive(Debug, Clone)]
pub struct Prng {
    state: u64,
    spare_normal: Option<f32>,
}

impl Prng {
    pub fn new(seed: u64) -> Self {
        // Avoid a zero state.
        let seed = if seed == 0 { 0x9E3779B97F4A7C15 } else { seed };
        Self {
            state: seed,
            spare_normal: None,
        }
    }

    /// Seed from the wall clock; used when no explicit seed is configured.
    pub fn from_entropy() -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x51F1_5EED);
        Self::new(nanos ^ 0xD1B5_4A32_D192_ED03)
    }

    /// Derive an independent stream (e.g. for a worker thread).
    pub fn fork(&mut self) -> Self {
        Self::new(self.next_u64() ^ 0xA076_1D64_78BD_642F)
    }

    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    #[inline]
    pub fn next_f32_01(&mut self) -> f32 {
        // 24 mantissa bits so the result stays strictly below 1.0.
        let x = self.next_u32() >> 8;
        (x as f32) / ((1u32 << 24) as f32)
    }

    #[inline]
    pub fn gen_range_f32(&mut self, low: f32, high: f32) -> f32 {
        low + (high - low) * self.next_f32_01()
    }

    #[inline]
    pub fn gen_range_usize(&mut self, low: usize, high: usize) -> usize {
        if high <= low {
            return low;
        }
        let span = (high - low) as u64;
        let v = self.next_u64() % span;
        low + v as usize
    }

    #[inline]
    pub fn chance(&mut self, p: f32) -> bool {
        self.next_f32_01() < p
    }

    /// Standard normal draw (Box-Muller, caching the second value).
    pub fn next_normal(&mut self) -> f32 {
        if let Some(z) = self.spare_normal.take() {
            return z;
        }
        // u1 in (0,1] so ln() stays finite.
        let u1 = 1.0 - self.next_f32_01();
        let u2 = self.next_f32_01();
        let r = (-2.0 * u1.ln()).sqrt();
        let theta = std::f32::consts::TAU * u2;
        self.spare_normal = Some(r * theta.sin());
        r * theta.cos()
    }

    pub fn fill_uniform(&mut self, out: &mut [f32]) {
        for v in out.iter_mut() {
            *v = self.next_f32_01();
        }
    }

    /// `k` distinct indices from `0..n` (partial Fisher-Yates).
    pub fn sample_indices(&mut self, n: usize, k: usize) -> Vec<usize> {
        let k = k.min(n);
        let mut idx: Vec<usize> = (0..n).collect();
        for i in 0..k {
            let j = self.gen_range_usize(i, n);
            idx.swap(i, j);
        }
        idx.truncate(k);
        idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_stream() {
        let mut a = Prng::new(7);
        let mut b = Prng::new(7);
        for _ in 0..32 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn unit_interval_bounds() {
        let mut rng = Prng::new(99);
        for _ in 0..10_000 {
            let x = rng.next_f32_01();
            assert!((0.0..1.0).contains(&x));
        }
    }

    #[test]
    fn normal_draws_are_centred() {
        let mut rng = Prng::new(3);
        let n = 20_000;
        let mut sum = 0.0f64;
        let mut sq = 0.0f64;
        for _ in 0..n {
            let z = rng.next_normal() as f64;
            assert!(z.is_finite());
            sum += z;
            sq += z * z;
        }
        let mean = sum / n as f64;
        let var = sq / n as f64 - mean * mean;
        assert!(mean.abs() < 0.05, "mean={mean}");
        assert!((var - 1.0).abs() < 0.1, "var={var}");
    }

    #[test]
    fn range_usize_empty_span_returns_low() {
        let mut rng = Prng::new(1);
        assert_eq!(rng.gen_range_usize(4, 4), 4);
        for _ in 0..100 {
            let v = rng.gen_range_usize(2, 5);
            assert!((2..5).contains(&v));
        }
    }

    #[test]
    fn sampled_indices_are_distinct() {
        let mut rng = Prng::new(11);
        for _ in 0..50 {
            let mut picked = rng.sample_indices(100, 20);
            assert_eq!(picked.len(), 20);
            picked.sort_unstable();
            picked.dedup();
            assert_eq!(picked.len(), 20);
            assert!(picked.iter().all(|&i| i < 100));
        }
        assert_eq!(rng.sample_indices(3, 10).len(), 3);
    }
}
