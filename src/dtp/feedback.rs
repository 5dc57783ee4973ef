//! Training of the feedback weights.
//!
//! Each feedback layer `G` is fitted to the local inverse of its forward layer
//! `F` from gaussian perturbations of the forward input: with `dx` the noise and
//! `dr = G(F(x + dx)) - G(F(x))`, the loss `-2 <dx, dr> + |dr|^2` is minimised
//! when the jacobian of `G . F` is the identity.

use rand::rngs::StdRng;
use tracing::debug;

use super::metrics::compute_dist_angle;
use super::model::Phase;
use super::network::{BackwardNetwork, ForwardNetwork};
use super::schedule::FeedbackSchedule;
use super::trace::ActivationTrace;
use crate::error::{DtpError, Result};
use crate::nn::optim::Optimizer;
use crate::nn::utils::{batch_dot, randn};
use crate::nn::{Aux, Layer, Tensor};

/// Per-iteration values for one feedback layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayerFeedbackStats {
    pub losses: Vec<f32>,
    /// Angle in degrees between the forward and feedback weights, taken before
    /// the update of each iteration.
    pub angles: Vec<f32>,
    pub distances: Vec<f32>,
}

impl LayerFeedbackStats {
    pub fn iterations(&self) -> usize {
        self.losses.len()
    }

    pub fn total_loss(&self) -> f32 {
        self.losses.iter().sum()
    }
}

/// Result of the feedback phase for one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedbackOutcome {
    /// Indexed by forward layer. Entry 0 is always empty.
    pub layers: Vec<LayerFeedbackStats>,
}

impl FeedbackOutcome {
    pub fn total_loss(&self) -> f32 {
        self.layers.iter().map(|l| l.total_loss()).sum()
    }
}

/// Feedback loss of `feedback` w.r.t. `forward` at `x`, where `y = forward(x)`.
/// Averages over `samples` noise draws of scale `noise_scale`. Returns the loss
/// and the gradients of the feedback parameters.
pub fn feedback_loss(
    forward: &dyn Layer,
    feedback: &dyn Layer,
    x: &Tensor,
    y: &Tensor,
    noise_scale: f32,
    samples: usize,
    rng: &mut StdRng,
) -> Result<(f32, Vec<Tensor>)> {
    let noise: Vec<Tensor> = (0..samples).map(|_| randn(x.shape(), rng) * noise_scale).collect();
    feedback_loss_with_noise(forward, feedback, x, y, &noise)
}

pub(crate) fn feedback_loss_with_noise(
    forward: &dyn Layer,
    feedback: &dyn Layer,
    x: &Tensor,
    y: &Tensor,
    noise: &[Tensor],
) -> Result<(f32, Vec<Tensor>)> {
    if noise.is_empty() {
        return Err(DtpError::InternalConsistency(
            "feedback loss needs at least one noise sample".to_string(),
        ));
    }
    let batch = x.shape().first().copied().unwrap_or(0).max(1) as f32;
    let scale = 1.0 / (batch * noise.len() as f32);
    let mut loss = 0.0;
    let mut grads: Option<Vec<Tensor>> = None;
    for dx in noise {
        let (y_noise, aux_noise) = forward.forward(&(x + dx), &Aux::None)?;
        // both reconstructions route through the indices of the perturbed pass
        let r = feedback.forward_with_grad(y, &aux_noise)?;
        let r_noise = feedback.forward_with_grad(&y_noise, &aux_noise)?;
        let dr = &r_noise.y - &r.y;
        if dr.shape() != dx.shape() {
            return Err(DtpError::shape(
                format!("{} reconstruction", feedback.name()),
                dx.shape(),
                dr.shape(),
            ));
        }
        let cross = batch_dot(dx, &dr).mean().unwrap_or(0.0);
        let sq = batch_dot(&dr, &dr).mean().unwrap_or(0.0);
        loss += -2.0 * cross + sq;

        let g_noise = (&dr - dx) * (2.0 * scale);
        let g_clean = -&g_noise;
        let (_, from_noise) = (r_noise.pullback)(&g_noise)?;
        let (_, from_clean) = (r.pullback)(&g_clean)?;
        let sample: Vec<Tensor> =
            from_noise.into_iter().zip(from_clean).map(|(a, b)| a + b).collect();
        grads = Some(match grads {
            None => sample,
            Some(acc) => acc.into_iter().zip(sample).map(|(a, b)| a + b).collect(),
        });
    }
    Ok((loss / noise.len() as f32, grads.unwrap_or_default()))
}

/// Runs the feedback phase on `trace`, forward layers 1 to N - 1.
///
/// While training every layer gets its scheduled number of iterations, each
/// followed by an update of that layer alone. Evaluation phases run a single
/// iteration per scheduled layer and never update.
#[allow(clippy::too_many_arguments)]
pub fn train_feedback(
    forward: &ForwardNetwork,
    backward: &mut BackwardNetwork,
    optimizer: &mut Optimizer,
    schedule: &FeedbackSchedule,
    trace: &ActivationTrace,
    phase: Phase,
    samples: usize,
    rng: &mut StdRng,
) -> Result<FeedbackOutcome> {
    let n = forward.len();
    if trace.len() != n || backward.len() != n || schedule.len() != n {
        return Err(DtpError::InternalConsistency(format!(
            "feedback phase over {n} forward layers got a trace of {}, \
             {} backward layers and a schedule of {}",
            trace.len(),
            backward.len(),
            schedule.len()
        )));
    }
    let mut outcome = FeedbackOutcome {
        layers: vec![LayerFeedbackStats::default(); n],
    };
    for i in 1..n {
        let bi = backward.mirror_index(i);
        let iterations = match phase {
            Phase::Train => schedule.iterations[bi],
            _ => schedule.iterations[bi].min(1),
        };
        if iterations == 0 {
            continue;
        }
        let noise = schedule.noise[bi];
        if noise <= 0.0 {
            return Err(DtpError::InternalConsistency(format!(
                "backward layer {bi} ({}) is scheduled for {iterations} iterations \
                 with noise scale {noise}",
                backward.layer(bi).name()
            )));
        }
        let (x, y) = (trace.y(i - 1), trace.y(i));
        let stats = &mut outcome.layers[i];
        for it in 0..iterations {
            let f = forward.layer(i);
            let (loss, grads) = feedback_loss(f, backward.layer(bi), x, y, noise, samples, rng)?;
            let (distance, angle) = compute_dist_angle(f, backward.layer(bi))?;
            if phase == Phase::Train {
                let layer = &mut backward.layers_mut()[bi];
                layer.zero_grad();
                layer.accumulate_grads(grads)?;
                optimizer.step_layer(bi, layer.as_mut())?;
                layer.zero_grad();
            }
            debug!(layer = i, iteration = it, loss, angle, distance, "feedback");
            stats.losses.push(loss);
            stats.angles.push(angle);
            stats.distances.push(distance);
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nn::utils::compute_jacobian;
    use crate::nn::Linear;
    use approx::assert_abs_diff_eq;
    use ndarray::prelude::*;
    use rand::SeedableRng;

    #[test]
    fn test_exact_inverse_has_no_gradient() {
        let mut rng = StdRng::seed_from_u64(0);
        let f = Linear::from_weights(array![[2.0f32, 0.0], [0.0, 0.5]].into_dyn(), None);
        let g = Linear::from_weights(array![[0.5f32, 0.0], [0.0, 2.0]].into_dyn(), None);
        let x = randn(&[6, 2], &mut rng);
        let y = f.forward(&x, &Aux::None).unwrap().0;
        let noise = vec![randn(&[6, 2], &mut rng) * 0.1];
        let (loss, grads) = feedback_loss_with_noise(&f, &g, &x, &y, &noise).unwrap();
        // dr equals dx, so the loss is minus the mean squared noise
        let expected = -batch_dot(&noise[0], &noise[0]).mean().unwrap();
        assert_abs_diff_eq!(loss, expected, epsilon = 1e-5);
        assert_eq!(grads.len(), 1);
        assert!(grads[0].iter().all(|v| v.abs() < 1e-5));
    }

    #[test]
    fn test_feedback_grads_match_finite_differences() {
        let mut rng = StdRng::seed_from_u64(1);
        let f = Linear::new(4, 3, true, &mut rng);
        let g_w = randn(&[4, 3], &mut rng);
        let x = randn(&[5, 4], &mut rng);
        let y = f.forward(&x, &Aux::None).unwrap().0;
        let noise: Vec<Tensor> = (0..3).map(|_| randn(&[5, 4], &mut rng) * 0.5).collect();

        let loss_at = |w: &Tensor| {
            let g = Linear::from_weights(w.clone(), None);
            let loss = feedback_loss_with_noise(&f, &g, &x, &y, &noise).unwrap().0;
            Tensor::from_elem(IxDyn(&[1]), loss)
        };
        let g = Linear::from_weights(g_w.clone(), None);
        let (_, grads) = feedback_loss_with_noise(&f, &g, &x, &y, &noise).unwrap();
        let jac = compute_jacobian(&g_w, loss_at, 1e-2);
        for (a, b) in grads[0].iter().zip(jac.column(0).iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-2);
        }
    }

    #[test]
    fn test_no_noise_samples() {
        let mut rng = StdRng::seed_from_u64(2);
        let f = Linear::new(2, 2, false, &mut rng);
        let x = randn(&[1, 2], &mut rng);
        assert!(feedback_loss_with_noise(&f, &f, &x, &x, &[]).is_err());
    }

    #[test]
    fn test_scheduled_layer_without_noise() {
        use crate::config::LayerSpec;
        use crate::dtp::trace::{collect_activations, GradMode};
        use crate::dtp::InversionRegistry;
        use crate::nn::optim::{LearningRate, OptimizerConfig};

        let mut rng = StdRng::seed_from_u64(3);
        let specs = [
            LayerSpec::Linear { out_features: 4, bias: true },
            LayerSpec::Linear { out_features: 2, bias: true },
        ];
        let forward = ForwardNetwork::from_specs(&specs, &[3], &mut rng).unwrap();
        let x = randn(&[5, 3], &mut rng);
        let mut backward =
            BackwardNetwork::build(&forward, &InversionRegistry::default(), &x, &mut rng)
                .unwrap();
        let schedule = FeedbackSchedule {
            iterations: vec![1, 0],
            noise: vec![0.0, 0.0],
            lrs: vec![0.1, 0.0],
        };
        let config = OptimizerConfig::sgd(LearningRate::Global(0.1), 0.0, 0.0);
        let mut optim = Optimizer::with_lrs(config, backward.layers(), &schedule.lrs).unwrap();
        let trace = collect_activations(&forward, &x, GradMode::Off).unwrap();
        let before = backward.layer(0).params()[0].w.clone();
        for phase in [Phase::Train, Phase::Validate] {
            let err = train_feedback(
                &forward,
                &mut backward,
                &mut optim,
                &schedule,
                &trace,
                phase,
                1,
                &mut rng,
            )
            .unwrap_err();
            assert_eq!(err.category(), crate::error::ErrorCategory::InternalConsistency);
            assert!(err.to_string().contains("backward layer 0"), "{err}");
        }
        assert_eq!(backward.layer(0).params()[0].w, before);
    }
}
