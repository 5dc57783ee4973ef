use std::any::Any;
use std::fmt;

use ndarray::prelude::*;

use crate::error::{DtpError, Result};

pub mod activations;
pub mod block;
pub mod conv;
pub mod init;
pub mod linear;
pub mod loss;
pub mod norm;
pub mod optim;
pub mod pool;
pub mod reshape;
pub mod utils;

pub use activations::{Elu, Identity, Relu, Tanh};
pub use block::Block;
pub use conv::{Conv2d, ConvTranspose2d};
pub use init::{reinit_weights, Initializer};
pub use linear::Linear;
pub use norm::Normalize;
pub use pool::{MaxPool2d, MaxUnpool2d};
pub use reshape::Reshape;

/// Batch-first dense tensor, NCHW for images.
pub type Tensor = ArrayD<f32>;

/// A weight and the gradient accumulated for it.
#[derive(Clone, Debug)]
pub struct Param {
    pub w: Tensor,
    pub g: Tensor,
}

impl Param {
    pub fn new(w: Tensor) -> Param {
        let g = Tensor::zeros(w.raw_dim());
        Param { w, g }
    }

    pub fn shape(&self) -> &[usize] {
        self.w.shape()
    }

    pub fn zero_grad(&mut self) {
        self.g.fill(0.0);
    }
}

/// Side channel produced by a forward layer next to its activation and consumed
/// by the backward layer that mirrors it.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Aux {
    #[default]
    None,
    /// Argmax positions of a max pool, flat within each (batch, channel) plane.
    Indices(ArrayD<usize>),
    /// One entry per child of a block, in the producing block's child order.
    Seq(Vec<Aux>),
}

impl Aux {
    pub fn is_none(&self) -> bool {
        matches!(self, Aux::None)
    }
}

/// Maps the gradient w.r.t. a layer output to the gradient w.r.t. its input
/// and the gradients of the layer's parameters, in `params()` order.
pub type Pullback = Box<dyn FnOnce(&Tensor) -> Result<(Tensor, Vec<Tensor>)>>;

/// Output of a gradient-tracking forward call.
pub struct Forward {
    pub y: Tensor,
    pub aux: Aux,
    pub pullback: Pullback,
}

impl fmt::Debug for Forward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Forward")
            .field("y", &self.y.shape())
            .field("aux", &self.aux)
            .finish_non_exhaustive()
    }
}

pub trait Layer: Any + Send + fmt::Debug {
    /// Kind name used in errors and logs.
    fn name(&self) -> &'static str;

    /// Per-example input shape, batch axis excluded.
    fn input_shape(&self) -> &[usize];

    /// Per-example output shape, batch axis excluded.
    fn output_shape(&self) -> &[usize];

    /// Forward pass that also returns the pullback of this layer. Gradients never
    /// flow past the layer input, so `x` acts as a leaf.
    fn forward_with_grad(&self, x: &Tensor, aux: &Aux) -> Result<Forward>;

    /// Forward pass without gradient tracking.
    fn forward(&self, x: &Tensor, aux: &Aux) -> Result<(Tensor, Aux)> {
        let out = self.forward_with_grad(x, aux)?;
        Ok((out.y, out.aux))
    }

    fn params(&self) -> Vec<&Param> {
        Vec::new()
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        Vec::new()
    }

    /// Nested layers, for containers.
    fn children(&self) -> &[Box<dyn Layer>] {
        &[]
    }

    fn children_mut(&mut self) -> &mut [Box<dyn Layer>] {
        &mut []
    }

    fn as_any(&self) -> &dyn Any;

    fn is_trainable(&self) -> bool {
        !self.params().is_empty()
    }

    fn zero_grad(&mut self) {
        for p in self.params_mut() {
            p.zero_grad();
        }
    }

    /// Adds `grads` (in `params()` order) onto the stored gradients.
    fn accumulate_grads(&mut self, grads: Vec<Tensor>) -> Result<()> {
        let name = self.name();
        let mut params = self.params_mut();
        if params.len() != grads.len() {
            return Err(DtpError::InternalConsistency(format!(
                "{name} has {} parameters but received {} gradients",
                params.len(),
                grads.len()
            )));
        }
        for (p, g) in params.iter_mut().zip(grads) {
            if p.g.shape() != g.shape() {
                return Err(DtpError::shape(format!("{name} gradient"), p.g.shape(), g.shape()));
            }
            p.g += &g;
        }
        Ok(())
    }
}

/// Checks that `x` is a batch of `expected`-shaped examples.
pub(crate) fn check_input(name: &str, expected: &[usize], x: &Tensor) -> Result<()> {
    if x.ndim() == 0 || &x.shape()[1..] != expected {
        let actual = if x.ndim() == 0 { &[][..] } else { &x.shape()[1..] };
        return Err(DtpError::shape(format!("{name} input"), expected, actual));
    }
    Ok(())
}

/// Prepends the batch axis to a per-example shape.
pub(crate) fn batched(batch: usize, shape: &[usize]) -> Vec<usize> {
    let mut full = Vec::with_capacity(shape.len() + 1);
    full.push(batch);
    full.extend_from_slice(shape);
    full
}
