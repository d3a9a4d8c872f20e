//! Criterion benchmarks for candidate scoring.
//!
//! Run with:
//!   cargo bench
//!
//! Results are saved to target/criterion/

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use neurofeed::config::EngineConfig;
use neurofeed::model::{Regressor, ResponseModel, UncertaintySnapshot};
use neurofeed::prng::Prng;
use neurofeed::program::TargetProgram;
use neurofeed::scorer::{CandidateScorer, ModelSet, Predictor, ScoringSettings};
use neurofeed::stimulus::StimulusKey;

const SIGNALS: usize = 4;

fn make_model(input_dim: usize, rng: &mut Prng, uncertain: bool) -> ResponseModel {
    let mut regressor = Regressor::zeros(input_dim, SIGNALS);
    for p in regressor.params.iter_mut() {
        *p = 0.2 * rng.next_normal();
    }
    let uncertainty = uncertain.then(|| UncertaintySnapshot {
        samples: (0..32)
            .map(|_| {
                regressor
                    .params
                    .iter()
                    .map(|p| p + 0.01 * rng.next_normal())
                    .collect()
            })
            .collect(),
        noise_var: vec![1e-4; SIGNALS],
    });
    ResponseModel {
        identity: "bench".to_string(),
        sensor: "bench".to_string(),
        regressor,
        uncertainty,
        trained_samples: 100,
        loss: 0.0,
    }
}

fn make_models(count: usize, uncertain: bool, seed: u64) -> ModelSet {
    let mut rng = Prng::new(seed);
    let mut models = ModelSet::default();
    for i in 0..count as u32 {
        let p: Predictor = Box::new(make_model(SIGNALS, &mut rng, uncertain));
        models.pictures.push((StimulusKey::Picture(i), p));
        let k: Predictor = Box::new(make_model(SIGNALS, &mut rng, uncertain));
        models.keywords.push((StimulusKey::Keyword(i), k));
    }
    models
}

/// Benchmark one direct scoring round with varying catalog sizes.
fn bench_direct(c: &mut Criterion) {
    let mut group = c.benchmark_group("direct_select");
    let names: Vec<String> = (0..SIGNALS).map(|i| format!("s{i}")).collect();
    let table = TargetProgram::constant("s0", 0.8, 0.1, 10)
        .to_table(&names, 0.1)
        .expect("valid program");
    let row = table.row(0).expect("row");
    let current = vec![0.4; SIGNALS];

    for size in [16usize, 64, 256].iter() {
        group.throughput(Throughput::Elements(2 * *size as u64));
        for uncertain in [false, true] {
            let label = if uncertain { "uncertain" } else { "point" };
            group.bench_with_input(BenchmarkId::new(label, size), size, |b, &size| {
                let models = make_models(size, uncertain, 42);
                let settings = ScoringSettings::from_config(&EngineConfig::default());
                let mut scorer = CandidateScorer::new(settings, false, SIGNALS, Prng::new(7));
                b.iter(|| black_box(scorer.select(&models, &current, row, None).best_error));
            });
        }
    }

    group.finish();
}

/// Benchmark Monte-Carlo scoring with varying pool sizes.
fn bench_monte_carlo(c: &mut Criterion) {
    let mut group = c.benchmark_group("monte_carlo_select");
    let names: Vec<String> = (0..SIGNALS).map(|i| format!("s{i}")).collect();
    let table = TargetProgram::constant("s0", 0.8, 0.1, 10)
        .to_table(&names, 0.1)
        .expect("valid program");
    let row = table.row(0).expect("row");
    let current = vec![0.4; SIGNALS];
    let models = make_models(64, false, 9);

    for pool in [16usize, 64, 256].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(pool), pool, |b, &pool| {
            let settings = ScoringSettings {
                pool_size: pool,
                ..ScoringSettings::from_config(&EngineConfig::default())
            };
            let mut scorer = CandidateScorer::new(settings, true, SIGNALS, Prng::new(7));
            b.iter(|| black_box(scorer.select(&models, &current, row, None).best_error));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_direct, bench_monte_carlo);
criterion_main!(benches);
