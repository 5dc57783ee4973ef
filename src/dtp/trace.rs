use super::network::ForwardNetwork;
use crate::error::{DtpError, Result};
use crate::nn::{Aux, Pullback, Tensor};

/// Whether the activation trace keeps the pullback of every layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradMode {
    Off,
    /// Gradients flow inside each layer, never across layer boundaries.
    Local,
}

pub struct TraceEntry {
    pub y: Tensor,
    pub aux: Aux,
    pub pullback: Option<Pullback>,
}

/// Output of every forward layer for one batch. `ys[i]` is computed from a
/// detached copy of `ys[i - 1]`.
pub struct ActivationTrace {
    entries: Vec<TraceEntry>,
}

impl std::fmt::Debug for ActivationTrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shapes: Vec<_> = self.entries.iter().map(|e| e.y.shape().to_vec()).collect();
        f.debug_struct("ActivationTrace").field("ys", &shapes).finish()
    }
}

/// Runs `forward` layer by layer on `x`.
pub fn collect_activations(
    forward: &ForwardNetwork,
    x: &Tensor,
    mode: GradMode,
) -> Result<ActivationTrace> {
    let mut entries: Vec<TraceEntry> = Vec::with_capacity(forward.len());
    for (i, layer) in forward.layers().iter().enumerate() {
        let input = entries.last().map_or(x, |e| &e.y);
        let at = |e: DtpError| e.at(format!("forward layer {i} ({})", layer.name()));
        let entry = match mode {
            GradMode::Off => {
                let (y, aux) = layer.forward(input, &Aux::None).map_err(at)?;
                TraceEntry { y, aux, pullback: None }
            }
            GradMode::Local => {
                let out = layer.forward_with_grad(input, &Aux::None).map_err(at)?;
                TraceEntry {
                    y: out.y,
                    aux: out.aux,
                    pullback: Some(out.pullback),
                }
            }
        };
        entries.push(entry);
    }
    Ok(ActivationTrace { entries })
}

impl ActivationTrace {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn y(&self, i: usize) -> &Tensor {
        &self.entries[i].y
    }

    pub fn aux(&self, i: usize) -> &Aux {
        &self.entries[i].aux
    }

    pub fn ys(&self) -> impl Iterator<Item = &Tensor> {
        self.entries.iter().map(|e| &e.y)
    }

    /// The logits.
    pub fn output(&self) -> &Tensor {
        &self.entries[self.entries.len() - 1].y
    }

    /// Takes the pullback of layer `i`; it can only be used once.
    pub fn take_pullback(&mut self, i: usize) -> Result<Pullback> {
        self.entries[i].pullback.take().ok_or_else(|| {
            DtpError::InternalConsistency(format!("no pullback recorded for forward layer {i}"))
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::networks;
    use crate::nn::utils::randn;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_trace_is_idempotent() {
        let mut rng = StdRng::seed_from_u64(0);
        let specs = networks::lenet(&[3, 4], 5, networks::Activation::Relu);
        let forward = ForwardNetwork::from_specs(&specs, &[1, 16, 16], &mut rng).unwrap();
        let x = randn(&[2, 1, 16, 16], &mut rng);
        let a = collect_activations(&forward, &x, GradMode::Off).unwrap();
        let b = collect_activations(&forward, &x, GradMode::Local).unwrap();
        assert_eq!(a.len(), forward.len());
        for (ya, yb) in a.ys().zip(b.ys()) {
            assert_eq!(ya, yb);
        }
        for i in 0..a.len() {
            assert_eq!(a.aux(i), b.aux(i));
        }
        assert_eq!(a.output().shape(), &[2, 5]);
    }

    #[test]
    fn test_pullbacks() {
        let mut rng = StdRng::seed_from_u64(1);
        let specs = networks::mlp(&[4], 2, networks::Activation::Relu);
        let forward = ForwardNetwork::from_specs(&specs, &[3], &mut rng).unwrap();
        let x = randn(&[2, 3], &mut rng);
        let mut off = collect_activations(&forward, &x, GradMode::Off).unwrap();
        assert!(off.take_pullback(0).is_err());
        let mut local = collect_activations(&forward, &x, GradMode::Local).unwrap();
        let pb = local.take_pullback(0).unwrap();
        let (dx, grads) = pb(&Tensor::ones(local.y(0).raw_dim())).unwrap();
        assert_eq!(dx.shape(), x.shape());
        assert_eq!(grads.len(), forward.layer(0).params().len());
        assert!(local.take_pullback(0).is_err());
    }
}
