use rand::rngs::StdRng;
use tracing::info;

use super::registry::InversionRegistry;
use crate::config::LayerSpec;
use crate::error::{DtpError, Result};
use crate::nn::{
    batched, Aux, Block, Conv2d, ConvTranspose2d, Elu, Identity, Layer, Linear, MaxPool2d,
    MaxUnpool2d, Normalize, Relu, Reshape, Tanh, Tensor,
};

fn image_shape(spec: &str, input: &[usize]) -> Result<[usize; 3]> {
    input
        .try_into()
        .map_err(|_| {
            DtpError::shape(format!("{spec} input (channels, height, width)"), &[0, 0, 0], input)
        })
}

impl LayerSpec {
    /// Instantiates the layer for per-example inputs of shape `input`.
    pub fn build(&self, input: &[usize], rng: &mut StdRng) -> Result<Box<dyn Layer>> {
        let layer: Box<dyn Layer> = match self {
            LayerSpec::Linear { out_features, bias } => {
                let [in_features] = input else {
                    return Err(DtpError::shape("Linear input", &[0], input));
                };
                Box::new(Linear::new(*in_features, *out_features, *bias, rng))
            }
            LayerSpec::Conv2d {
                out_channels,
                kernel_size,
                stride,
                padding,
                bias,
            } => Box::new(Conv2d::new(
                image_shape("Conv2d", input)?,
                *out_channels,
                [*kernel_size; 2],
                [*stride; 2],
                [*padding; 2],
                *bias,
                rng,
            )?),
            LayerSpec::ConvTranspose2d {
                out_channels,
                kernel_size,
                stride,
                padding,
                output_padding,
                bias,
            } => Box::new(ConvTranspose2d::new(
                image_shape("ConvTranspose2d", input)?,
                *out_channels,
                [*kernel_size; 2],
                [*stride; 2],
                [*padding; 2],
                [*output_padding; 2],
                *bias,
                rng,
            )?),
            LayerSpec::MaxPool2d { kernel_size, stride } => Box::new(MaxPool2d::new(
                image_shape("MaxPool2d", input)?,
                [*kernel_size; 2],
                [*stride; 2],
            )?),
            LayerSpec::MaxUnpool2d { kernel_size, stride } => {
                let [c, h, w] = image_shape("MaxUnpool2d", input)?;
                let out = [
                    c,
                    (h.max(1) - 1) * stride + kernel_size,
                    (w.max(1) - 1) * stride + kernel_size,
                ];
                Box::new(MaxUnpool2d::new([c, h, w], out, [*kernel_size; 2], [*stride; 2])?)
            }
            LayerSpec::Flatten => Box::new(Reshape::flatten(input)),
            LayerSpec::Reshape(shape) => Box::new(Reshape::new(input, shape)?),
            LayerSpec::Relu => Box::new(Relu::new(input)),
            LayerSpec::Elu(alpha) => Box::new(Elu::new(input, *alpha)),
            LayerSpec::Tanh => Box::new(Tanh::new(input)),
            LayerSpec::Identity => Box::new(Identity::new(input)),
            LayerSpec::Normalize => Box::new(Normalize::new(input)),
            LayerSpec::Block(specs) => {
                let mut layers = Vec::with_capacity(specs.len());
                let mut shape = input.to_vec();
                for spec in specs {
                    let layer = spec.build(&shape, rng)?;
                    shape = layer.output_shape().to_vec();
                    layers.push(layer);
                }
                Box::new(Block::new(layers)?)
            }
        };
        Ok(layer)
    }
}

/// Runs `layers` one after the other, each on the output of the previous one.
/// Returns the final output and the aux emitted by every layer.
fn chain(
    layers: &[Box<dyn Layer>],
    x: &Tensor,
    auxes: Option<&[&Aux]>,
) -> Result<(Tensor, Vec<Aux>)> {
    let mut h = x.clone();
    let mut emitted = Vec::with_capacity(layers.len());
    let none = Aux::None;
    for (i, layer) in layers.iter().enumerate() {
        let aux = auxes.map_or(&none, |a| a[i]);
        let (y, out) =
            layer.forward(&h, aux).map_err(|e| e.at(format!("layer {i} ({})", layer.name())))?;
        h = y;
        emitted.push(out);
    }
    Ok((h, emitted))
}

/// The classifier being trained, layers in input to output order.
#[derive(Debug)]
pub struct ForwardNetwork {
    layers: Vec<Box<dyn Layer>>,
}

impl ForwardNetwork {
    pub fn new(layers: Vec<Box<dyn Layer>>) -> Result<Self> {
        if layers.is_empty() {
            return Err(DtpError::Configuration("the forward network has no layers".to_string()));
        }
        for (i, pair) in layers.windows(2).enumerate() {
            if pair[0].output_shape() != pair[1].input_shape() {
                return Err(DtpError::shape(
                    format!("forward layer {} ({}) input", i + 1, pair[1].name()),
                    pair[0].output_shape(),
                    pair[1].input_shape(),
                ));
            }
        }
        Ok(Self { layers })
    }

    /// Builds the layers of `specs` for per-example inputs of shape `input_shape`.
    pub fn from_specs(
        specs: &[LayerSpec],
        input_shape: &[usize],
        rng: &mut StdRng,
    ) -> Result<Self> {
        let mut layers = Vec::with_capacity(specs.len());
        let mut shape = input_shape.to_vec();
        for (i, spec) in specs.iter().enumerate() {
            let layer = spec.build(&shape, rng).map_err(|e| e.at(format!("forward layer {i}")))?;
            shape = layer.output_shape().to_vec();
            layers.push(layer);
        }
        Self::new(layers)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layers(&self) -> &[Box<dyn Layer>] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [Box<dyn Layer>] {
        &mut self.layers
    }

    pub fn layer(&self, i: usize) -> &dyn Layer {
        self.layers[i].as_ref()
    }

    pub fn input_shape(&self) -> &[usize] {
        self.layers[0].input_shape()
    }

    pub fn output_shape(&self) -> &[usize] {
        self.layers[self.layers.len() - 1].output_shape()
    }

    /// Inference pass, returns the logits.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(chain(&self.layers, x, None)?.0)
    }
}

/// Per-layer inverses of a [`ForwardNetwork`] in reverse order: layer `i`
/// mirrors forward layer `N - 1 - i`. The last layer mirrors the first forward
/// layer and is never trained.
#[derive(Debug)]
pub struct BackwardNetwork {
    layers: Vec<Box<dyn Layer>>,
}

impl BackwardNetwork {
    /// Inverts every forward layer, reverses the result and checks that
    /// `example_input` survives the forward then backward round trip.
    pub fn build(
        forward: &ForwardNetwork,
        registry: &InversionRegistry,
        example_input: &Tensor,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let mut layers = Vec::with_capacity(forward.len());
        for (i, layer) in forward.layers().iter().enumerate() {
            let inverse = registry
                .invert(layer.as_ref(), rng)
                .map_err(|e| e.at(format!("forward layer {i}")))?;
            layers.push(inverse);
        }
        layers.reverse();
        let backward = Self::from_layers(forward, layers, example_input)?;
        info!(
            layers = backward.len(),
            trainable = backward.trainable_count(),
            "built backward network"
        );
        Ok(backward)
    }

    /// Wraps hand-built inverses, with the same checks as [`BackwardNetwork::build`].
    pub fn from_layers(
        forward: &ForwardNetwork,
        layers: Vec<Box<dyn Layer>>,
        example_input: &Tensor,
    ) -> Result<Self> {
        let n = forward.len();
        if layers.len() != n {
            return Err(DtpError::Configuration(format!(
                "backward network has {} layers, forward network has {n}",
                layers.len()
            )));
        }
        for (i, g) in layers.iter().enumerate() {
            let f = forward.layer(n - 1 - i);
            if g.input_shape() != f.output_shape() {
                return Err(DtpError::shape(
                    format!("backward layer {i} ({}) input", g.name()),
                    f.output_shape(),
                    g.input_shape(),
                ));
            }
            if g.output_shape() != f.input_shape() {
                return Err(DtpError::shape(
                    format!("backward layer {i} ({}) output", g.name()),
                    f.input_shape(),
                    g.output_shape(),
                ));
            }
        }
        let backward = Self { layers };
        backward.check_round_trip(forward, example_input)?;
        Ok(backward)
    }

    fn check_round_trip(&self, forward: &ForwardNetwork, example_input: &Tensor) -> Result<()> {
        let (y, auxes) = chain(forward.layers(), example_input, None)?;
        let mirrored: Vec<&Aux> = auxes.iter().rev().collect();
        let (recovered, _) = chain(&self.layers, &y, Some(&mirrored)).map_err(|e| match e {
            DtpError::ShapeMismatch { actual, expected, .. } => {
                DtpError::BackwardNetworkMismatch { expected, actual }
            }
            other => other,
        })?;
        if recovered.shape() != example_input.shape() {
            return Err(DtpError::BackwardNetworkMismatch {
                expected: example_input.shape().to_vec(),
                actual: recovered.shape().to_vec(),
            });
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layers(&self) -> &[Box<dyn Layer>] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [Box<dyn Layer>] {
        &mut self.layers
    }

    pub fn layer(&self, i: usize) -> &dyn Layer {
        self.layers[i].as_ref()
    }

    /// Index of the backward layer that mirrors forward layer `forward_index`.
    pub fn mirror_index(&self, forward_index: usize) -> usize {
        self.layers.len() - 1 - forward_index
    }

    /// Trainable layers, not counting the never trained last one.
    pub fn trainable_count(&self) -> usize {
        self.layers.iter().filter(|l| l.is_trainable()).count().saturating_sub(1)
    }

    /// Reconstructs the input of forward layer `forward_index` from its output.
    pub fn reconstruct(&self, forward_index: usize, y: &Tensor, aux: &Aux) -> Result<Tensor> {
        let i = self.mirror_index(forward_index);
        Ok(self.layers[i].forward(y, aux)?.0)
    }

    /// Shape of a batch entering the backward network.
    pub fn batched_input_shape(&self, batch: usize) -> Vec<usize> {
        batched(batch, self.layers[0].input_shape())
    }
}
