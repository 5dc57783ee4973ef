use rand::rngs::StdRng;
use rand::SeedableRng;

use target_prop::dtp::feedback::{feedback_loss, train_feedback};
use target_prop::dtp::forward::{compute_targets, train_forward};
use target_prop::dtp::{
    align_values_with_backward_net, collect_activations, FeedbackSchedule, GradMode, MemorySink,
    NullSink,
};
use target_prop::networks::{self, Activation};
use target_prop::nn::optim::{LearningRate, Optimizer, OptimizerConfig};
use target_prop::nn::utils::randn;
use target_prop::nn::Layer;
use target_prop::{
    BackwardNetwork, Dtp, ErrorCategory, ForwardNetwork, HParams, InversionRegistry, LayerReduction,
    LayerSpec, Phase, Tensor,
};

fn linear(out_features: usize) -> LayerSpec {
    LayerSpec::Linear { out_features, bias: true }
}

fn batch_of(batch: usize, shape: &[usize]) -> Vec<usize> {
    std::iter::once(batch).chain(shape.iter().copied()).collect()
}

/// Schedule of `k` layers with the given values everywhere.
fn hparams(k: usize, iterations: usize, noise: f32, lr: f32) -> HParams {
    HParams {
        feedback_training_iterations: vec![iterations; k],
        noise: vec![noise; k],
        b_optim: OptimizerConfig::sgd(LearningRate::PerLayer(vec![lr; k]), 0.0, 0.0),
        f_optim: OptimizerConfig::sgd(LearningRate::Global(0.05), 0.0, 0.0),
        scheduler: None,
        ..Default::default()
    }
}

fn params_of(layers: &[Box<dyn Layer>]) -> Vec<Tensor> {
    layers.iter().flat_map(|l| l.params().into_iter().map(|p| p.w.clone())).collect()
}

#[test]
fn backward_network_round_trip() {
    let mut rng = StdRng::seed_from_u64(0);
    let registry = InversionRegistry::default();
    let strided = vec![
        LayerSpec::Block(vec![
            LayerSpec::Conv2d {
                out_channels: 3,
                kernel_size: 3,
                stride: 2,
                padding: 1,
                bias: false,
            },
            LayerSpec::Tanh,
        ]),
        LayerSpec::Block(vec![
            LayerSpec::Normalize,
            LayerSpec::Flatten,
            linear(7),
            LayerSpec::Relu,
        ]),
        linear(2),
    ];
    let cases = [
        (networks::mlp(&[16, 8], 4, Activation::Relu), vec![2, 5, 5]),
        (networks::lenet(&[3, 5], 6, Activation::Elu), vec![3, 20, 18]),
        (strided, vec![2, 9, 11]),
    ];
    for (specs, input) in cases {
        let forward = ForwardNetwork::from_specs(&specs, &input, &mut rng).unwrap();
        let x = randn(&batch_of(3, &input), &mut rng);
        let backward = BackwardNetwork::build(&forward, &registry, &x, &mut rng).unwrap();
        assert_eq!(backward.len(), forward.len());

        // full round trip, every backward layer fed the aux of its forward layer
        let trace = collect_activations(&forward, &x, GradMode::Off).unwrap();
        let mut h = trace.output().clone();
        for i in (0..forward.len()).rev() {
            h = backward.reconstruct(i, &h, trace.aux(i)).unwrap();
        }
        assert_eq!(h.shape(), x.shape());
    }
}

#[test]
fn unsupported_layer_fails_before_training() {
    let specs = networks::mlp(&[4], 2, Activation::Relu);
    let err = Dtp::from_specs(&specs, &[3], hparams(1, 1, 0.1, 0.1), &InversionRegistry::empty())
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);
    assert!(err.to_string().contains("Block"), "{err}");
}

#[test]
fn schedule_alignment() {
    let mut rng = StdRng::seed_from_u64(1);
    let specs = networks::lenet(&[2, 3], 5, Activation::Elu);
    let forward = ForwardNetwork::from_specs(&specs, &[1, 16, 16], &mut rng).unwrap();
    let x = randn(&[2, 1, 16, 16], &mut rng);
    let backward =
        BackwardNetwork::build(&forward, &InversionRegistry::default(), &x, &mut rng).unwrap();
    let k = backward.trainable_count();
    assert_eq!(k, forward.len() - 1);

    for wrong in [k - 1, k + 1] {
        let values = vec![1usize; wrong];
        let err = align_values_with_backward_net(&values, &backward, 0, true).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }
    let values: Vec<usize> = (1..=k).collect();
    let aligned = align_values_with_backward_net(&values, &backward, 0, true).unwrap();
    assert_eq!(aligned.len(), backward.len());
    assert_eq!(*aligned.last().unwrap(), 0);
    // forward layer i is mirrored by backward layer N - 1 - i
    for i in 1..forward.len() {
        assert_eq!(aligned[backward.mirror_index(i)], i);
    }

    let wrong_length = HParams::default();
    let err = Dtp::new(forward, wrong_length, &x, &InversionRegistry::default()).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);
}

#[test]
fn activation_trace_is_idempotent() {
    let mut rng = StdRng::seed_from_u64(2);
    let specs = networks::lenet(&[2, 4], 3, Activation::Relu);
    let forward = ForwardNetwork::from_specs(&specs, &[2, 16, 16], &mut rng).unwrap();
    let x = randn(&[4, 2, 16, 16], &mut rng);
    let a = collect_activations(&forward, &x, GradMode::Local).unwrap();
    let b = collect_activations(&forward, &x, GradMode::Local).unwrap();
    assert!(a.ys().zip(b.ys()).all(|(ya, yb)| ya == yb));
    assert_eq!(a.output(), &forward.forward(&x).unwrap());
}

#[test]
fn feedback_loss_decreases() {
    let mut rng = StdRng::seed_from_u64(3);
    let forward = ForwardNetwork::from_specs(&[linear(6), linear(6)], &[5], &mut rng).unwrap();
    let x = randn(&[32, 5], &mut rng);
    let mut backward =
        BackwardNetwork::build(&forward, &InversionRegistry::default(), &x, &mut rng).unwrap();
    let hp = hparams(1, 60, 0.3, 0.5);
    let schedule = FeedbackSchedule::from_hparams(&hp, &backward).unwrap();
    let mut optim =
        Optimizer::with_lrs(hp.b_optim.clone(), backward.layers(), &schedule.lrs).unwrap();
    let trace = collect_activations(&forward, &x, GradMode::Off).unwrap();

    let fixed_noise_loss = |backward: &BackwardNetwork| {
        let mut fixed = StdRng::seed_from_u64(99);
        let g = backward.layer(backward.mirror_index(1));
        feedback_loss(forward.layer(1), g, trace.y(0), trace.y(1), 0.3, 8, &mut fixed).unwrap().0
    };
    let before = fixed_noise_loss(&backward);
    let outcome = train_feedback(
        &forward,
        &mut backward,
        &mut optim,
        &schedule,
        &trace,
        Phase::Train,
        1,
        &mut rng,
    )
    .unwrap();
    let after = fixed_noise_loss(&backward);
    assert!(after < before, "{before} -> {after}");

    let losses = &outcome.layers[1].losses;
    assert_eq!(losses.len(), 60);
    let head = losses[..10].iter().sum::<f32>() / 10.0;
    let tail = losses[50..].iter().sum::<f32>() / 10.0;
    assert!(tail < head, "{head} -> {tail}");
}

#[test]
fn targets_are_deterministic() {
    let mut rng = StdRng::seed_from_u64(4);
    let specs = networks::mlp(&[10, 8], 4, Activation::Elu);
    let forward = ForwardNetwork::from_specs(&specs, &[6], &mut rng).unwrap();
    let x = randn(&[5, 6], &mut rng);
    let backward =
        BackwardNetwork::build(&forward, &InversionRegistry::default(), &x, &mut rng).unwrap();
    let trace = collect_activations(&forward, &x, GradMode::Off).unwrap();
    let nudged = trace.output() * 0.9;
    let a = compute_targets(&backward, &trace, nudged.clone()).unwrap().into_targets().unwrap();
    let b = compute_targets(&backward, &trace, nudged).unwrap().into_targets().unwrap();
    assert_eq!(a, b);
    assert_eq!(a.len(), forward.len());

    // an unchanged output target leaves every activation where it is
    let same = compute_targets(&backward, &trace, trace.output().clone())
        .unwrap()
        .into_targets()
        .unwrap();
    for (t, y) in same.iter().zip(trace.ys()) {
        assert!(t.iter().zip(y.iter()).all(|(a, b)| (a - b).abs() < 1e-5));
    }
}

#[test]
fn two_layer_scenario() {
    let mut rng = StdRng::seed_from_u64(5);
    let mut forward = ForwardNetwork::from_specs(&[linear(6), linear(3)], &[8], &mut rng).unwrap();
    let x = randn(&[4, 8], &mut rng);
    let labels = [0, 2, 1, 2];
    let mut backward =
        BackwardNetwork::build(&forward, &InversionRegistry::default(), &x, &mut rng).unwrap();
    for p in backward.layers_mut()[0].params_mut() {
        p.w *= 0.01;
    }
    let hp = hparams(1, 5, 0.1, 5.0);
    let schedule = FeedbackSchedule::from_hparams(&hp, &backward).unwrap();
    assert_eq!(schedule.iterations, vec![5, 0]);
    let mut b_optim =
        Optimizer::with_lrs(hp.b_optim.clone(), backward.layers(), &schedule.lrs).unwrap();
    let mut f_optim = Optimizer::new(hp.f_optim.clone(), forward.layers()).unwrap();

    let trace = collect_activations(&forward, &x, GradMode::Off).unwrap();
    let outcome = train_feedback(
        &forward,
        &mut backward,
        &mut b_optim,
        &schedule,
        &trace,
        Phase::Train,
        1,
        &mut rng,
    )
    .unwrap();
    let angles = &outcome.layers[1].angles;
    assert_eq!(angles.len(), 5);
    assert!(angles.iter().all(|a| a.is_finite()));
    let early = (angles[0] + angles[1]) / 2.0;
    let late = (angles[3] + angles[4]) / 2.0;
    assert!(late <= early, "{angles:?}");

    let reduction = LayerReduction::Sum;
    let out = train_forward(
        &mut forward,
        &backward,
        &mut f_optim,
        &x,
        &labels,
        hp.beta,
        reduction,
        Phase::Train,
    )
    .unwrap();
    assert!(out.loss.is_finite() && out.loss >= 0.0);
    assert_eq!(out.layer_losses.len(), 2);
}

#[test]
fn single_layer_network() {
    let specs = [linear(3)];
    let hp = HParams {
        feedback_training_iterations: vec![],
        noise: vec![],
        b_optim: OptimizerConfig::sgd(LearningRate::Global(0.1), 0.0, 0.0),
        ..Default::default()
    };
    let mut dtp = Dtp::from_specs(&specs, &[4], hp, &InversionRegistry::default()).unwrap();
    assert_eq!(dtp.backward_net().len(), 1);
    assert_eq!(dtp.schedule().iterations, vec![0]);
    assert!(dtp.feedback_optimizer().groups().is_empty());

    let mut rng = StdRng::seed_from_u64(6);
    let x = randn(&[3, 4], &mut rng);
    let mut sink = MemorySink::new();
    let out = dtp.shared_step(&x, &[0, 1, 2], Phase::Train, &mut sink).unwrap();
    assert_eq!(out.feedback_loss, 0.0);
    assert_eq!(out.forward_layer_losses.len(), 1);
    assert!(out.forward_loss.is_finite() && out.forward_loss >= 0.0);
    assert!(sink.keys().all(|k| !k.contains("B_iterations")));
    // the only target is the nudged output
    assert!(sink.last("train/delta.norm()").unwrap() > 0.0);
}

#[test]
fn evaluation_never_updates() {
    let specs = networks::lenet(&[2, 3], 4, Activation::Elu);
    let hp = hparams(specs.len() - 1, 2, 0.1, 0.01);
    let mut dtp = Dtp::from_specs(&specs, &[1, 16, 16], hp, &InversionRegistry::default()).unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    let x = randn(&[2, 1, 16, 16], &mut rng);
    let labels = [3, 0];
    let forward_before = params_of(dtp.forward_net().layers());
    let backward_before = params_of(dtp.backward_net().layers());
    for phase in [Phase::Validate, Phase::Test] {
        let mut sink = MemorySink::new();
        let out = dtp.shared_step(&x, &labels, phase, &mut sink).unwrap();
        // one iteration per scheduled layer
        assert!(out.layer_angles.iter().skip(1).all(|a| a.len() == 1));
        assert!(sink.keys().all(|k| k.starts_with(phase.prefix())));
    }
    assert_eq!(params_of(dtp.forward_net().layers()), forward_before);
    assert_eq!(params_of(dtp.backward_net().layers()), backward_before);

    dtp.shared_step(&x, &labels, Phase::Train, &mut NullSink).unwrap();
    assert_ne!(params_of(dtp.forward_net().layers()), forward_before);
    assert_ne!(params_of(dtp.backward_net().layers()), backward_before);
}

#[test]
fn symmetric_init_starts_aligned() {
    let specs = networks::mlp(&[9, 7], 3, Activation::Relu);
    let hp = HParams {
        init_symmetric_weights: true,
        ..hparams(specs.len() - 1, 1, 0.1, 0.01)
    };
    let mut dtp = Dtp::from_specs(&specs, &[2, 3], hp, &InversionRegistry::default()).unwrap();
    let mut rng = StdRng::seed_from_u64(8);
    let x = randn(&[4, 2, 3], &mut rng);
    let out = dtp.shared_step(&x, &[0, 1, 2, 0], Phase::Validate, &mut NullSink).unwrap();
    for (angles, distances) in out.layer_angles.iter().zip(&out.layer_distances).skip(1) {
        assert!(angles[0].abs() < 0.5, "{angles:?}");
        assert!(distances[0].abs() < 1e-6, "{distances:?}");
    }
}
