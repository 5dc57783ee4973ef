//! Forward architectures as layer lists.
//!
//! Layers are grouped into blocks so that every trainable unit, the first one
//! included, is a single forward layer with its own feedback layer and
//! schedule entry.

use serde::{Deserialize, Serialize};

use crate::config::LayerSpec;

/// Width of the hidden dense layer of [`lenet`].
pub const LENET_FC_WIDTH: usize = 512;

#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum Activation {
    Relu,
    #[default]
    Elu,
}

impl Activation {
    pub fn spec(self) -> LayerSpec {
        match self {
            Activation::Relu => LayerSpec::Relu,
            Activation::Elu => LayerSpec::Elu(1.0),
        }
    }
}

fn linear(out_features: usize) -> LayerSpec {
    LayerSpec::Linear { out_features, bias: true }
}

/// Flatten, then one dense block per entry of `hidden`, then the classifier.
/// `mlp(&[h0, h1], c, act)` has `hidden.len() + 1` forward layers.
pub fn mlp(hidden: &[usize], n_classes: usize, act: Activation) -> Vec<LayerSpec> {
    let mut layers = Vec::with_capacity(hidden.len() + 1);
    let mut flatten = Some(LayerSpec::Flatten);
    for &h in hidden {
        let block = flatten.take().into_iter().chain([linear(h), act.spec()]).collect();
        layers.push(LayerSpec::Block(block));
    }
    match flatten {
        Some(f) => layers.push(LayerSpec::Block(vec![f, linear(n_classes)])),
        None => layers.push(linear(n_classes)),
    }
    layers
}

/// Conv(5x5, padding 1) + activation + max pool(3x3, stride 2) per entry of
/// `channels`, then a hidden dense block and the classifier.
pub fn lenet(channels: &[usize], n_classes: usize, act: Activation) -> Vec<LayerSpec> {
    let mut layers: Vec<LayerSpec> = channels
        .iter()
        .map(|&c| {
            LayerSpec::Block(vec![
                LayerSpec::Conv2d {
                    out_channels: c,
                    kernel_size: 5,
                    stride: 1,
                    padding: 1,
                    bias: true,
                },
                act.spec(),
                LayerSpec::MaxPool2d { kernel_size: 3, stride: 2 },
            ])
        })
        .collect();
    layers.push(LayerSpec::Block(vec![LayerSpec::Flatten, linear(LENET_FC_WIDTH), act.spec()]));
    layers.push(linear(n_classes));
    layers
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dtp::ForwardNetwork;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_layer_counts() {
        let mut rng = StdRng::seed_from_u64(0);
        let specs = mlp(&[6, 5], 3, Activation::Relu);
        let net = ForwardNetwork::from_specs(&specs, &[2, 4], &mut rng).unwrap();
        assert_eq!(net.len(), 3);
        assert!(net.layers().iter().all(|l| l.is_trainable()));
        assert_eq!(net.output_shape(), &[3]);

        let specs = mlp(&[], 2, Activation::Elu);
        let net = ForwardNetwork::from_specs(&specs, &[5], &mut rng).unwrap();
        assert_eq!(net.len(), 1);

        let specs = lenet(&[4, 8], 10, Activation::Elu);
        let net = ForwardNetwork::from_specs(&specs, &[3, 32, 32], &mut rng).unwrap();
        assert_eq!(net.len(), 4);
        assert_eq!(net.layer(0).output_shape(), &[4, 14, 14]);
        assert_eq!(net.layer(1).output_shape(), &[8, 5, 5]);
        assert_eq!(net.output_shape(), &[10]);
    }

    #[test]
    fn test_activation_names() {
        assert_eq!("relu".parse::<Activation>().unwrap(), Activation::Relu);
        assert_eq!(Activation::Elu.to_string(), "elu");
    }
}
