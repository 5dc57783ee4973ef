use std::any::Any;

use ndarray::prelude::*;

use super::{check_input, conv::conv_out_size, Aux, Forward, Layer, Tensor};
use crate::error::{DtpError, Result};

/// Max pooling without padding. Emits the argmax of every window as
/// `Aux::Indices`, flat within each (batch, channel) plane.
#[derive(Debug, Clone)]
pub struct MaxPool2d {
    kernel: [usize; 2],
    stride: [usize; 2],
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
}

impl MaxPool2d {
    pub fn new(input_shape: [usize; 3], kernel: [usize; 2], stride: [usize; 2]) -> Result<Self> {
        let oh = conv_out_size(input_shape[1], kernel[0], stride[0], 0);
        let ow = conv_out_size(input_shape[2], kernel[1], stride[1], 0);
        let (Some(oh), Some(ow)) = (oh, ow) else {
            return Err(DtpError::Configuration(format!(
                "MaxPool2d kernel {kernel:?} with stride {stride:?} \
                 does not fit input {input_shape:?}"
            )));
        };
        Ok(Self {
            kernel,
            stride,
            input_shape: input_shape.to_vec(),
            output_shape: vec![input_shape[0], oh, ow],
        })
    }

    pub fn kernel_size(&self) -> [usize; 2] {
        self.kernel
    }

    pub fn stride(&self) -> [usize; 2] {
        self.stride
    }
}

impl Layer for MaxPool2d {
    fn name(&self) -> &'static str {
        "MaxPool2d"
    }

    fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    fn forward_with_grad(&self, x: &Tensor, _aux: &Aux) -> Result<Forward> {
        check_input(self.name(), &self.input_shape, x)?;
        let x4 = x.view().into_dimensionality::<Ix4>()?;
        let dims = x4.dim();
        let (b, c, _, w) = dims;
        let (oh, ow) = (self.output_shape[1], self.output_shape[2]);
        let mut y = Array4::<f32>::zeros((b, c, oh, ow));
        let mut indices = Array4::<usize>::zeros((b, c, oh, ow));

        for ((bi, ci, i, j), out) in y.indexed_iter_mut() {
            let (h0, w0) = (i * self.stride[0], j * self.stride[1]);
            let mut best = f32::NEG_INFINITY;
            let mut best_idx = h0 * w + w0;
            for ki in 0..self.kernel[0] {
                for kj in 0..self.kernel[1] {
                    let v = x4[[bi, ci, h0 + ki, w0 + kj]];
                    if v > best {
                        best = v;
                        best_idx = (h0 + ki) * w + w0 + kj;
                    }
                }
            }
            *out = best;
            indices[[bi, ci, i, j]] = best_idx;
        }

        let idx = indices.clone();
        let pullback = move |grad: &Tensor| -> Result<(Tensor, Vec<Tensor>)> {
            let g = grad.view().into_dimensionality::<Ix4>()?;
            let mut dx = Array4::<f32>::zeros(dims);
            for ((bi, ci, i, j), &k) in idx.indexed_iter() {
                dx[[bi, ci, k / w, k % w]] += g[[bi, ci, i, j]];
            }
            Ok((dx.into_dyn(), Vec::new()))
        };
        Ok(Forward {
            y: y.into_dyn(),
            aux: Aux::Indices(indices.into_dyn()),
            pullback: Box::new(pullback),
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Partial inverse of [`MaxPool2d`]: scatters every input value to the position
/// recorded in the pooling indices, zeros elsewhere. Without indices each value
/// goes to the top-left corner of its window.
#[derive(Debug, Clone)]
pub struct MaxUnpool2d {
    kernel: [usize; 2],
    stride: [usize; 2],
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
}

impl MaxUnpool2d {
    /// `output_shape` is the per-example shape before pooling.
    pub fn new(
        input_shape: [usize; 3],
        output_shape: [usize; 3],
        kernel: [usize; 2],
        stride: [usize; 2],
    ) -> Result<Self> {
        let pooled = MaxPool2d::new(output_shape, kernel, stride)?;
        if pooled.output_shape() != &input_shape[..] {
            return Err(DtpError::shape("MaxUnpool2d input", pooled.output_shape(), &input_shape));
        }
        Ok(Self {
            kernel,
            stride,
            input_shape: input_shape.to_vec(),
            output_shape: output_shape.to_vec(),
        })
    }

    pub fn kernel_size(&self) -> [usize; 2] {
        self.kernel
    }

    pub fn stride(&self) -> [usize; 2] {
        self.stride
    }
}

impl Layer for MaxUnpool2d {
    fn name(&self) -> &'static str {
        "MaxUnpool2d"
    }

    fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    fn forward_with_grad(&self, x: &Tensor, aux: &Aux) -> Result<Forward> {
        check_input(self.name(), &self.input_shape, x)?;
        let x4 = x.view().into_dimensionality::<Ix4>()?;
        let (b, c, oh, ow) = x4.dim();
        let (h, w) = (self.output_shape[1], self.output_shape[2]);

        let indices = match aux {
            Aux::Indices(idx) => {
                if idx.shape() != x4.shape() {
                    return Err(DtpError::shape("MaxUnpool2d indices", x4.shape(), idx.shape()));
                }
                idx.view().into_dimensionality::<Ix4>()?.to_owned()
            }
            Aux::None => Array4::from_shape_fn((b, c, oh, ow), |(_, _, i, j)| {
                i * self.stride[0] * w + j * self.stride[1]
            }),
            Aux::Seq(_) => {
                return Err(DtpError::InternalConsistency(
                    "MaxUnpool2d expects pooling indices, got a block aux".to_string(),
                ))
            }
        };
        if let Some(&k) = indices.iter().find(|&&k| k >= h * w) {
            return Err(DtpError::InternalConsistency(format!(
                "MaxUnpool2d index {k} out of range for a {h}x{w} plane"
            )));
        }

        let mut y = Array4::<f32>::zeros((b, c, h, w));
        for ((bi, ci, i, j), &k) in indices.indexed_iter() {
            y[[bi, ci, k / w, k % w]] += x4[[bi, ci, i, j]];
        }

        let pullback = move |grad: &Tensor| -> Result<(Tensor, Vec<Tensor>)> {
            let g = grad.view().into_dimensionality::<Ix4>()?;
            let dx = Array4::from_shape_fn(indices.raw_dim(), |(bi, ci, i, j)| {
                let k = indices[[bi, ci, i, j]];
                g[[bi, ci, k / w, k % w]]
            });
            Ok((dx.into_dyn(), Vec::new()))
        };
        Ok(Forward {
            y: y.into_dyn(),
            aux: Aux::None,
            pullback: Box::new(pullback),
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
