use std::any::Any;

use ndarray::prelude::*;
use rand::Rng;

use super::{check_input, init::Initializer, Aux, Forward, Layer, Param, Tensor};
use crate::error::Result;

/// Dense layer, expects x to be [batch, in_dim] and outputs [batch, out_dim].
#[derive(Debug, Clone)]
pub struct Linear {
    w: Param,
    bias: Option<Param>,
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
}

impl Linear {
    pub fn new<R: Rng + ?Sized>(in_dim: usize, out_dim: usize, bias: bool, rng: &mut R) -> Self {
        let w = Initializer::FanInUniform.init(&[out_dim, in_dim], in_dim, out_dim, rng);
        let b = bias.then(|| Initializer::FanInUniform.init(&[out_dim], in_dim, out_dim, rng));
        Self::from_weights(w, b)
    }

    /// `w` is [out_dim, in_dim].
    pub fn from_weights(w: Tensor, bias: Option<Tensor>) -> Self {
        let (out_dim, in_dim) = (w.shape()[0], w.shape()[1]);
        Self {
            w: Param::new(w),
            bias: bias.map(Param::new),
            input_shape: vec![in_dim],
            output_shape: vec![out_dim],
        }
    }

    pub fn in_dim(&self) -> usize {
        self.input_shape[0]
    }

    pub fn out_dim(&self) -> usize {
        self.output_shape[0]
    }

    pub fn has_bias(&self) -> bool {
        self.bias.is_some()
    }

    pub fn weight(&self) -> &Param {
        &self.w
    }

    pub fn weight_mut(&mut self) -> &mut Param {
        &mut self.w
    }

    fn w2(&self) -> Result<Array2<f32>> {
        Ok(self.w.w.clone().into_dimensionality::<Ix2>()?)
    }
}

impl Layer for Linear {
    fn name(&self) -> &'static str {
        "Linear"
    }

    fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    fn forward_with_grad(&self, x: &Tensor, _aux: &Aux) -> Result<Forward> {
        check_input(self.name(), &self.input_shape, x)?;
        let x2 = x.clone().into_dimensionality::<Ix2>()?;
        let w = self.w2()?;
        let mut y = x2.dot(&w.t());
        if let Some(b) = &self.bias {
            y += &b.w.view().into_dimensionality::<Ix1>()?;
        }
        let has_bias = self.bias.is_some();

        let pullback = move |grad: &Tensor| -> Result<(Tensor, Vec<Tensor>)> {
            let g = grad.view().into_dimensionality::<Ix2>()?;
            let dx = g.dot(&w);
            let dw = g.t().dot(&x2);
            let mut grads = vec![dw.into_dyn()];
            if has_bias {
                grads.push(g.sum_axis(Axis(0)).into_dyn());
            }
            Ok((dx.into_dyn(), grads))
        };
        Ok(Forward {
            y: y.into_dyn(),
            aux: Aux::None,
            pullback: Box::new(pullback),
        })
    }

    fn params(&self) -> Vec<&Param> {
        std::iter::once(&self.w).chain(self.bias.iter()).collect()
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        std::iter::once(&mut self.w).chain(self.bias.iter_mut()).collect()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
