use super::network::BackwardNetwork;
use crate::config::HParams;
use crate::error::{DtpError, Result};

/// Reindexes per-layer values onto the backward network.
///
/// `values` holds one entry per trainable backward layer, the never trained
/// last one excluded. With `forward_ordering` the values are given in forward
/// network order. Every non-trainable layer, and every layer left once the
/// values run out, gets `default`.
pub fn align_values_with_backward_net<T: Copy>(
    values: &[T],
    backward: &BackwardNetwork,
    default: T,
    forward_ordering: bool,
) -> Result<Vec<T>> {
    let needed = backward.trainable_count();
    if values.len() != needed {
        return Err(DtpError::Configuration(format!(
            "{} values given, the backward network has {needed} layers that need one",
            values.len()
        )));
    }
    let mut left: Vec<T> = values.to_vec();
    if !forward_ordering {
        left.reverse();
    }
    // popped from the back, so forward order is consumed last to first
    let mut aligned = Vec::with_capacity(backward.len());
    for layer in backward.layers() {
        match left.last() {
            Some(&v) if layer.is_trainable() => {
                left.pop();
                aligned.push(v);
            }
            _ => aligned.push(default),
        }
    }
    Ok(aligned)
}

fn at(what: &'static str) -> impl Fn(DtpError) -> DtpError {
    move |e| match e {
        DtpError::Configuration(msg) => DtpError::Configuration(format!("{what}: {msg}")),
        other => other,
    }
}

/// Feedback iterations, noise scale and learning rate of every backward layer,
/// in backward order.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackSchedule {
    pub iterations: Vec<usize>,
    pub noise: Vec<f32>,
    pub lrs: Vec<f32>,
}

impl FeedbackSchedule {
    pub fn from_hparams(hparams: &HParams, backward: &BackwardNetwork) -> Result<Self> {
        let schedule = Self {
            iterations: align_values_with_backward_net(
                &hparams.feedback_training_iterations,
                backward,
                0,
                true,
            )
            .map_err(at("feedback_training_iterations"))?,
            noise: align_values_with_backward_net(&hparams.noise, backward, 0.0, true)
                .map_err(at("noise"))?,
            lrs: align_values_with_backward_net(&hparams.feedback_lrs(), backward, 0.0, true)
                .map_err(at("feedback learning rates"))?,
        };
        schedule.validate(backward)?;
        Ok(schedule)
    }

    pub fn len(&self) -> usize {
        self.iterations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.iterations.is_empty()
    }

    /// Trainable layers need a positive count, scale and rate. Every other layer,
    /// and always the last one, needs all three to be zero.
    pub fn validate(&self, backward: &BackwardNetwork) -> Result<()> {
        let n = backward.len();
        if self.iterations.len() != n || self.noise.len() != n || self.lrs.len() != n {
            return Err(DtpError::Configuration(format!(
                "schedule has {}/{}/{} entries for a backward network of {n} layers",
                self.iterations.len(),
                self.noise.len(),
                self.lrs.len()
            )));
        }
        for (i, layer) in backward.layers().iter().enumerate() {
            let (iters, noise, lr) = (self.iterations[i], self.noise[i], self.lrs[i]);
            let positive = iters > 0 && noise > 0.0 && lr > 0.0;
            let zero = iters == 0 && noise == 0.0 && lr == 0.0;
            let ok = if i == n - 1 || !layer.is_trainable() { zero } else { positive };
            if !ok {
                return Err(DtpError::Configuration(format!(
                    "backward layer {i} ({}) has iterations {iters}, noise {noise}, lr {lr}",
                    layer.name()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dtp::{ForwardNetwork, InversionRegistry};
    use crate::nn::utils::randn;
    use crate::nn::optim::{LearningRate, OptimizerConfig};
    use crate::LayerSpec;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Linear, ReLU, Linear, ReLU, Linear on 6 features.
    fn backward() -> BackwardNetwork {
        let mut rng = StdRng::seed_from_u64(0);
        let linear = |out_features| LayerSpec::Linear { out_features, bias: true };
        let specs = [linear(5), LayerSpec::Relu, linear(4), LayerSpec::Relu, linear(3)];
        let forward = ForwardNetwork::from_specs(&specs, &[6], &mut rng).unwrap();
        let x = randn(&[2, 6], &mut rng);
        BackwardNetwork::build(&forward, &InversionRegistry::default(), &x, &mut rng).unwrap()
    }

    #[test]
    fn test_align() {
        let backward = backward();
        assert_eq!(backward.trainable_count(), 2);
        // forward order: second linear, then third
        let aligned = align_values_with_backward_net(&[10, 20], &backward, 0, true).unwrap();
        assert_eq!(aligned, vec![20, 0, 10, 0, 0]);
        let aligned = align_values_with_backward_net(&[10, 20], &backward, 0, false).unwrap();
        assert_eq!(aligned, vec![10, 0, 20, 0, 0]);

        for bad in [&[][..], &[1][..], &[1, 2, 3][..]] {
            let err = align_values_with_backward_net(bad, &backward, 0, true).unwrap_err();
            assert_eq!(err.category(), crate::ErrorCategory::Configuration);
        }
    }

    #[test]
    fn test_schedule_from_hparams() {
        let backward = backward();
        let hp = HParams {
            feedback_training_iterations: vec![3, 4],
            noise: vec![0.1, 0.2],
            b_optim: OptimizerConfig::sgd(LearningRate::PerLayer(vec![0.01, 0.02]), 0.0, 0.0),
            ..Default::default()
        };
        let schedule = FeedbackSchedule::from_hparams(&hp, &backward).unwrap();
        assert_eq!(schedule.iterations, vec![4, 0, 3, 0, 0]);
        assert_eq!(schedule.noise, vec![0.2, 0.0, 0.1, 0.0, 0.0]);
        assert_eq!(schedule.lrs, vec![0.02, 0.0, 0.01, 0.0, 0.0]);

        let global = HParams {
            b_optim: OptimizerConfig::sgd(LearningRate::Global(0.5), 0.0, 0.0),
            ..hp.clone()
        };
        let schedule = FeedbackSchedule::from_hparams(&global, &backward).unwrap();
        assert_eq!(schedule.lrs, vec![0.5, 0.0, 0.5, 0.0, 0.0]);

        // a trainable layer with zero noise
        let zero_noise = HParams {
            noise: vec![0.0, 0.2],
            ..hp
        };
        let err = FeedbackSchedule::from_hparams(&zero_noise, &backward).unwrap_err();
        assert_eq!(err.category(), crate::ErrorCategory::Configuration);
    }

    #[test]
    fn test_last_layer_is_never_scheduled() {
        let backward = backward();
        let schedule = FeedbackSchedule {
            iterations: vec![1, 0, 1, 0, 1],
            noise: vec![0.1, 0.0, 0.1, 0.0, 0.1],
            lrs: vec![0.1, 0.0, 0.1, 0.0, 0.1],
        };
        assert!(schedule.validate(&backward).is_err());
    }
}
