use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::rngs::StdRng;
use rand::SeedableRng;

use target_prop::dtp::{collect_activations, GradMode, NullSink};
use target_prop::networks::{self, Activation};
use target_prop::nn::optim::{LearningRate, OptimizerConfig};
use target_prop::nn::utils::randn;
use target_prop::{Dtp, ForwardNetwork, HParams, InversionRegistry, Phase};

fn hparams(layers: usize) -> HParams {
    let k = layers - 1;
    HParams {
        feedback_training_iterations: vec![2; k],
        noise: vec![0.1; k],
        b_optim: OptimizerConfig::sgd(LearningRate::Global(1e-3), 0.9, 0.0),
        ..Default::default()
    }
}

pub fn dtp_step(c: &mut Criterion) {
    let registry = InversionRegistry::default();
    let mut rng = StdRng::seed_from_u64(0);
    let batch = black_box(16);

    let specs = networks::mlp(&[256, 128], 10, Activation::Elu);
    let mut mlp = Dtp::from_specs(&specs, &[3, 16, 16], hparams(specs.len()), &registry).unwrap();
    let x = randn(&[batch, 3, 16, 16], &mut rng);
    let labels: Vec<usize> = (0..batch).map(|i| i % 10).collect();
    c.bench_function("mlp train step", |b| {
        b.iter(|| mlp.shared_step(&x, &labels, Phase::Train, &mut NullSink).unwrap());
    });

    let specs = networks::lenet(&[8, 16], 10, Activation::Elu);
    let mut lenet = Dtp::from_specs(&specs, &[3, 32, 32], hparams(specs.len()), &registry).unwrap();
    let x = randn(&[batch, 3, 32, 32], &mut rng);
    c.bench_function("lenet train step", |b| {
        b.iter(|| lenet.shared_step(&x, &labels, Phase::Train, &mut NullSink).unwrap());
    });
    c.bench_function("lenet eval step", |b| {
        b.iter(|| lenet.shared_step(&x, &labels, Phase::Validate, &mut NullSink).unwrap());
    });

    let forward = ForwardNetwork::from_specs(&specs, &[3, 32, 32], &mut rng).unwrap();
    c.bench_function("lenet activation trace", |b| {
        b.iter(|| collect_activations(&forward, &x, GradMode::Local).unwrap());
    });
}

criterion_group!(benches, dtp_step);
criterion_main!(benches);
