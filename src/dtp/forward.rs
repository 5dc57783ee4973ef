//! Training of the forward weights from difference targets.

use tracing::debug;

use super::model::Phase;
use super::network::{BackwardNetwork, ForwardNetwork};
use super::trace::{collect_activations, ActivationTrace, GradMode};
use crate::config::LayerReduction;
use crate::error::{DtpError, Result};
use crate::nn::loss::{accuracy, cross_entropy};
use crate::nn::optim::Optimizer;
use crate::nn::utils::{l2_norm, mean_sq_norm};
use crate::nn::Tensor;

/// One target per forward activation. Every entry is written exactly once.
#[derive(Debug, Clone)]
pub struct TargetTrace {
    targets: Vec<Option<Tensor>>,
}

impl TargetTrace {
    pub fn new(len: usize) -> Self {
        Self {
            targets: vec![None; len],
        }
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn set(&mut self, i: usize, target: Tensor) -> Result<()> {
        let slot = self
            .targets
            .get_mut(i)
            .ok_or_else(|| DtpError::InternalConsistency(format!("target {i} is out of range")))?;
        if slot.is_some() {
            return Err(DtpError::InternalConsistency(format!("target {i} is already set")));
        }
        *slot = Some(target);
        Ok(())
    }

    pub fn get(&self, i: usize) -> Result<&Tensor> {
        self.targets
            .get(i)
            .and_then(|t| t.as_ref())
            .ok_or_else(|| DtpError::InternalConsistency(format!("target {i} is not set")))
    }

    pub fn is_complete(&self) -> bool {
        self.targets.iter().all(|t| t.is_some())
    }

    pub fn into_targets(self) -> Result<Vec<Tensor>> {
        self.targets
            .into_iter()
            .enumerate()
            .map(|(i, t)| {
                t.ok_or_else(|| DtpError::InternalConsistency(format!("target {i} is not set")))
            })
            .collect()
    }
}

/// Carries `output_target` down through the feedback network:
/// `t[i - 1] = y[i - 1] + G_i(t[i]) - G_i(y[i])`.
pub fn compute_targets(
    backward: &BackwardNetwork,
    trace: &ActivationTrace,
    output_target: Tensor,
) -> Result<TargetTrace> {
    let n = trace.len();
    if n == 0 || backward.len() != n {
        return Err(DtpError::InternalConsistency(format!(
            "{n} activations for a backward network of {} layers",
            backward.len()
        )));
    }
    if output_target.shape() != trace.output().shape() {
        return Err(DtpError::shape("output target", trace.output().shape(), output_target.shape()));
    }
    let mut targets = TargetTrace::new(n);
    targets.set(n - 1, output_target)?;
    for i in (1..n).rev() {
        let aux = trace.aux(i);
        let at = |e: DtpError| e.at(format!("target of forward layer {}", i - 1));
        let from_target = backward.reconstruct(i, targets.get(i)?, aux).map_err(at)?;
        let from_y = backward.reconstruct(i, trace.y(i), aux).map_err(at)?;
        let prev = trace.y(i - 1);
        if from_target.shape() != prev.shape() {
            return Err(DtpError::shape(
                format!("target of forward layer {}", i - 1),
                prev.shape(),
                from_target.shape(),
            ));
        }
        targets.set(i - 1, prev + &(from_target - from_y))?;
    }
    Ok(targets)
}

/// Result of the forward phase for one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForwardOutcome {
    /// Reduced sum of the layer losses.
    pub loss: f32,
    pub layer_losses: Vec<f32>,
    /// Summed cross entropy of the logits.
    pub task_loss: f32,
    pub accuracy: f32,
    pub delta_norm: f32,
}

/// Runs the forward phase: targets from the nudged logits, then one update of
/// every forward layer towards its target. Only [`Phase::Train`] updates.
#[allow(clippy::too_many_arguments)]
pub fn train_forward(
    forward: &mut ForwardNetwork,
    backward: &BackwardNetwork,
    optimizer: &mut Optimizer,
    x: &Tensor,
    labels: &[usize],
    beta: f32,
    reduction: LayerReduction,
    phase: Phase,
) -> Result<ForwardOutcome> {
    let training = phase == Phase::Train;
    let mode = if training { GradMode::Local } else { GradMode::Off };
    let mut trace = collect_activations(forward, x, mode)?;

    let logits = trace.output();
    let (task_loss, grad) = cross_entropy(logits, labels)?;
    let acc = accuracy(logits, labels)?;
    let delta = grad * -beta;
    let delta_norm = l2_norm(&delta);
    let targets = compute_targets(backward, &trace, logits + &delta)?;

    let n = trace.len();
    let scale = match reduction {
        LayerReduction::Sum => 1.0,
        LayerReduction::Mean => 1.0 / n as f32,
    };
    let batch = x.shape().first().copied().unwrap_or(0).max(1) as f32;
    if training {
        optimizer.zero_grad(forward.layers_mut());
    }
    let mut layer_losses = Vec::with_capacity(n);
    for i in 0..n {
        let target = targets.get(i)?;
        let y = trace.y(i);
        if y.shape() != target.shape() {
            return Err(DtpError::shape(
                format!("target of forward layer {i}"),
                y.shape(),
                target.shape(),
            ));
        }
        let diff = y - target;
        layer_losses.push(0.5 * mean_sq_norm(&diff));
        if training {
            let pullback = trace.take_pullback(i)?;
            let (_, grads) = pullback(&(diff * (scale / batch)))?;
            forward.layers_mut()[i]
                .accumulate_grads(grads)
                .map_err(|e| e.at(format!("forward layer {i}")))?;
        }
    }
    if training {
        optimizer.step(forward.layers_mut())?;
        optimizer.zero_grad(forward.layers_mut());
    }
    let loss = layer_losses.iter().sum::<f32>() * scale;
    debug!(loss, task_loss, delta_norm, "forward");
    Ok(ForwardOutcome {
        loss,
        layer_losses,
        task_loss,
        accuracy: acc,
        delta_norm,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dtp::InversionRegistry;
    use crate::nn::utils::randn;
    use crate::nn::{Layer, Linear};
    use crate::LayerSpec;
    use ndarray::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_target_trace_is_write_once() {
        let mut t = TargetTrace::new(2);
        assert!(t.get(0).is_err());
        t.set(1, Tensor::zeros(IxDyn(&[1, 2]))).unwrap();
        assert!(!t.is_complete());
        let err = t.set(1, Tensor::ones(IxDyn(&[1, 2]))).unwrap_err();
        assert_eq!(err.category(), crate::ErrorCategory::InternalConsistency);
        assert_eq!(t.get(1).unwrap().sum(), 0.0);
        assert!(t.clone().into_targets().is_err());
        t.set(0, Tensor::zeros(IxDyn(&[1, 2]))).unwrap();
        assert_eq!(t.into_targets().unwrap().len(), 2);
    }

    #[test]
    fn test_difference_correction() {
        // with exact inverses the target moves the input by the inverse of the output move
        let w0 = array![[2.0f32, 0.0], [0.0, 4.0]].into_dyn();
        let w1 = array![[1.0f32, 1.0], [0.0, 1.0]].into_dyn();
        let w1_inv = array![[1.0f32, -1.0], [0.0, 1.0]].into_dyn();
        let forward = ForwardNetwork::new(vec![
            Box::new(Linear::from_weights(w0, None)),
            Box::new(Linear::from_weights(w1, None)),
        ])
        .unwrap();
        let x = array![[1.0f32, 1.0]].into_dyn();
        let inverses: Vec<Box<dyn Layer>> = vec![
            Box::new(Linear::from_weights(w1_inv, None)),
            Box::new(Linear::from_weights(array![[0.5f32, 0.0], [0.0, 0.25]].into_dyn(), None)),
        ];
        let backward = BackwardNetwork::from_layers(&forward, inverses, &x).unwrap();
        let trace = collect_activations(&forward, &x, GradMode::Off).unwrap();
        let delta = array![[1.0f32, 0.0]].into_dyn();
        let targets = compute_targets(&backward, &trace, trace.output() + &delta).unwrap();
        let targets = targets.into_targets().unwrap();
        // y0 = [2, 4], W1^-1 [1, 0] = [1, 0]
        assert_eq!(targets[0], array![[3.0f32, 4.0]].into_dyn());
        assert_eq!(targets[1], array![[7.0f32, 4.0]].into_dyn());
    }

    #[test]
    fn test_single_layer_targets() {
        let mut rng = StdRng::seed_from_u64(3);
        let specs = [LayerSpec::Linear { out_features: 3, bias: true }];
        let forward = ForwardNetwork::from_specs(&specs, &[4], &mut rng).unwrap();
        let x = randn(&[2, 4], &mut rng);
        let backward =
            BackwardNetwork::build(&forward, &InversionRegistry::default(), &x, &mut rng).unwrap();
        let trace = collect_activations(&forward, &x, GradMode::Off).unwrap();
        let out = trace.output() * 2.0;
        let targets = compute_targets(&backward, &trace, out.clone()).unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets.get(0).unwrap(), &out);

        let wrong = Tensor::zeros(IxDyn(&[2, 4]));
        assert!(compute_targets(&backward, &trace, wrong).is_err());
    }
}
