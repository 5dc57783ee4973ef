use std::any::Any;

use ndarray::prelude::*;

use super::{check_input, utils::flatten_batch, Aux, Forward, Layer, Tensor};
use crate::error::Result;

/// Standardises every example to zero mean and unit variance over all of its
/// features. Parameter free.
#[derive(Debug, Clone)]
pub struct Normalize {
    eps: f32,
    shape: Vec<usize>,
}

impl Normalize {
    pub fn new(shape: &[usize]) -> Self {
        Self {
            eps: 1e-5,
            shape: shape.to_vec(),
        }
    }
}

impl Layer for Normalize {
    fn name(&self) -> &'static str {
        "Normalize"
    }

    fn input_shape(&self) -> &[usize] {
        &self.shape
    }

    fn output_shape(&self) -> &[usize] {
        &self.shape
    }

    fn forward_with_grad(&self, x: &Tensor, _aux: &Aux) -> Result<Forward> {
        check_input(self.name(), &self.shape, x)?;
        let full_shape = x.shape().to_vec();
        let x2 = flatten_batch(x);
        let n = x2.ncols().max(1) as f32;
        let mean = x2.sum_axis(Axis(1)) / n;
        let centered = &x2 - &mean.view().insert_axis(Axis(1));
        let var = centered.mapv(|v| v * v).sum_axis(Axis(1)) / n;
        let inv_std = var.mapv(|v| 1.0 / (v + self.eps).sqrt());
        let inv_std = inv_std.insert_axis(Axis(1));
        let x_hat = &centered * &inv_std;
        let y = x_hat.clone().into_shape(IxDyn(&full_shape))?;

        let pullback = move |grad: &Tensor| -> Result<(Tensor, Vec<Tensor>)> {
            // dx = inv_std * (g - mean(g) - x_hat * mean(g * x_hat))
            let g = flatten_batch(grad);
            let g_mean = g.sum_axis(Axis(1)).insert_axis(Axis(1)) / n;
            let gx_mean = (&g * &x_hat).sum_axis(Axis(1)).insert_axis(Axis(1)) / n;
            let dx = (&g - &g_mean - &x_hat * &gx_mean) * &inv_std;
            Ok((dx.into_shape(IxDyn(&full_shape))?, Vec::new()))
        };
        Ok(Forward {
            y,
            aux: Aux::None,
            pullback: Box::new(pullback),
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
