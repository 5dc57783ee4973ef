use std::any::Any;

use ndarray::prelude::*;
use rand::Rng;

use super::{check_input, init::Initializer, Aux, Forward, Layer, Param, Tensor};
use crate::error::{DtpError, Result};

/// Unfolds every receptive field of `x` [b, c, h, w] into a row.
/// Rows are ordered (b, oh, ow), columns (c, kh, kw).
pub(crate) fn im2col(
    x: ArrayView4<f32>,
    kernel: [usize; 2],
    stride: [usize; 2],
    padding: [usize; 2],
    out_hw: [usize; 2],
) -> Array2<f32> {
    let (b, c, h, w) = x.dim();
    let [kh, kw] = kernel;
    let [oh, ow] = out_hw;
    let mut cols = Array2::zeros((b * oh * ow, c * kh * kw));
    for bi in 0..b {
        for i in 0..oh {
            for j in 0..ow {
                let row = (bi * oh + i) * ow + j;
                for ci in 0..c {
                    for ki in 0..kh {
                        let hi = (i * stride[0] + ki) as isize - padding[0] as isize;
                        if hi < 0 || hi as usize >= h {
                            continue;
                        }
                        for kj in 0..kw {
                            let wj = (j * stride[1] + kj) as isize - padding[1] as isize;
                            if wj < 0 || wj as usize >= w {
                                continue;
                            }
                            cols[[row, (ci * kh + ki) * kw + kj]] =
                                x[[bi, ci, hi as usize, wj as usize]];
                        }
                    }
                }
            }
        }
    }
    cols
}

/// Adjoint of [`im2col`], overlapping entries accumulate.
pub(crate) fn col2im(
    cols: ArrayView2<f32>,
    dims: (usize, usize, usize, usize),
    kernel: [usize; 2],
    stride: [usize; 2],
    padding: [usize; 2],
    out_hw: [usize; 2],
) -> Array4<f32> {
    let (b, c, h, w) = dims;
    let [kh, kw] = kernel;
    let [oh, ow] = out_hw;
    let mut x = Array4::zeros(dims);
    for bi in 0..b {
        for i in 0..oh {
            for j in 0..ow {
                let row = (bi * oh + i) * ow + j;
                for ci in 0..c {
                    for ki in 0..kh {
                        let hi = (i * stride[0] + ki) as isize - padding[0] as isize;
                        if hi < 0 || hi as usize >= h {
                            continue;
                        }
                        for kj in 0..kw {
                            let wj = (j * stride[1] + kj) as isize - padding[1] as isize;
                            if wj < 0 || wj as usize >= w {
                                continue;
                            }
                            x[[bi, ci, hi as usize, wj as usize]] +=
                                cols[[row, (ci * kh + ki) * kw + kj]];
                        }
                    }
                }
            }
        }
    }
    x
}

/// Output size of a strided window sweep, `None` if the kernel does not fit.
pub(crate) fn conv_out_size(
    size: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
) -> Option<usize> {
    if stride == 0 || size + 2 * padding < kernel {
        return None;
    }
    Some((size + 2 * padding - kernel) / stride + 1)
}

fn channels_last_rows(x: ArrayView4<f32>) -> Result<Array2<f32>> {
    let (b, c, h, w) = x.dim();
    let rows = x.permuted_axes([0, 2, 3, 1]).as_standard_layout().into_owned();
    Ok(rows.into_shape((b * h * w, c))?)
}

fn rows_to_channels_first(rows: Array2<f32>, b: usize, h: usize, w: usize) -> Result<Array4<f32>> {
    let c = rows.ncols();
    let x = rows.into_shape((b, h, w, c))?;
    Ok(x.permuted_axes([0, 3, 1, 2]).as_standard_layout().into_owned())
}

fn bias_grad(g: ArrayView4<f32>) -> Tensor {
    g.sum_axis(Axis(3)).sum_axis(Axis(2)).sum_axis(Axis(0)).into_dyn()
}

fn add_bias(y: &mut Array4<f32>, bias: &Option<Param>) -> Result<()> {
    if let Some(b) = bias {
        let c = b.w.len();
        *y += &b.w.view().into_shape((1, c, 1, 1))?;
    }
    Ok(())
}

/// 2d convolution over [batch, c, h, w], weight [out_chan, in_chan, kh, kw].
#[derive(Debug, Clone)]
pub struct Conv2d {
    filter: Param,
    bias: Option<Param>,
    stride: [usize; 2],
    pad: [usize; 2],
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
}

impl Conv2d {
    pub fn new<R: Rng + ?Sized>(
        input_shape: [usize; 3],
        out_chan: usize,
        kernel_size: [usize; 2],
        stride: [usize; 2],
        padding: [usize; 2],
        bias: bool,
        rng: &mut R,
    ) -> Result<Self> {
        let in_chan = input_shape[0];
        let receptive_field = kernel_size[0] * kernel_size[1];
        let fan_in = receptive_field * in_chan;
        let fan_out = receptive_field * out_chan;
        let w = Initializer::FanInUniform.init(
            &[out_chan, in_chan, kernel_size[0], kernel_size[1]],
            fan_in,
            fan_out,
            rng,
        );
        let b = bias.then(|| Initializer::FanInUniform.init(&[out_chan], fan_in, fan_out, rng));
        Self::from_weights(w, b, input_shape, stride, padding)
    }

    pub fn from_weights(
        filter: Tensor,
        bias: Option<Tensor>,
        input_shape: [usize; 3],
        stride: [usize; 2],
        padding: [usize; 2],
    ) -> Result<Self> {
        if filter.ndim() != 4 || filter.shape()[1] != input_shape[0] {
            return Err(DtpError::shape(
                "Conv2d filter",
                &[filter.shape().first().copied().unwrap_or(0), input_shape[0], 0, 0],
                filter.shape(),
            ));
        }
        let (oc, kh, kw) = (filter.shape()[0], filter.shape()[2], filter.shape()[3]);
        let oh = conv_out_size(input_shape[1], kh, stride[0], padding[0]);
        let ow = conv_out_size(input_shape[2], kw, stride[1], padding[1]);
        let (Some(oh), Some(ow)) = (oh, ow) else {
            return Err(DtpError::Configuration(format!(
                "Conv2d kernel {kh}x{kw} with stride {stride:?} and padding {padding:?} \
                 does not fit input {input_shape:?}"
            )));
        };
        Ok(Self {
            filter: Param::new(filter),
            bias: bias.map(Param::new),
            stride,
            pad: padding,
            input_shape: input_shape.to_vec(),
            output_shape: vec![oc, oh, ow],
        })
    }

    pub fn kernel_size(&self) -> [usize; 2] {
        [self.filter.shape()[2], self.filter.shape()[3]]
    }

    pub fn stride(&self) -> [usize; 2] {
        self.stride
    }

    pub fn padding(&self) -> [usize; 2] {
        self.pad
    }

    pub fn has_bias(&self) -> bool {
        self.bias.is_some()
    }

    pub fn filter(&self) -> &Param {
        &self.filter
    }

    pub fn filter_mut(&mut self) -> &mut Param {
        &mut self.filter
    }
}

impl Layer for Conv2d {
    fn name(&self) -> &'static str {
        "Conv2d"
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
        let b = dims.0;
        let kernel = self.kernel_size();
        let (stride, pad) = (self.stride, self.pad);
        let (oc, oh, ow) = (self.output_shape[0], self.output_shape[1], self.output_shape[2]);
        let filter_shape = self.filter.shape().to_vec();

        let cols = im2col(x4, kernel, stride, pad, [oh, ow]);
        let wmat = self
            .filter
            .w
            .as_standard_layout()
            .into_owned()
            .into_shape((oc, cols.ncols()))?;
        let out = cols.dot(&wmat.t());
        let mut y = rows_to_channels_first(out, b, oh, ow)?;
        add_bias(&mut y, &self.bias)?;
        let has_bias = self.bias.is_some();

        let pullback = move |grad: &Tensor| -> Result<(Tensor, Vec<Tensor>)> {
            let g4 = grad.view().into_dimensionality::<Ix4>()?;
            let g2 = channels_last_rows(g4)?;
            let dcols = g2.dot(&wmat);
            let dx = col2im(dcols.view(), dims, kernel, stride, pad, [oh, ow]);
            let dw = g2.t().dot(&cols).into_shape(IxDyn(&filter_shape))?;
            let mut grads = vec![dw];
            if has_bias {
                grads.push(bias_grad(g4));
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
        std::iter::once(&self.filter).chain(self.bias.iter()).collect()
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        std::iter::once(&mut self.filter).chain(self.bias.iter_mut()).collect()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Transposed 2d convolution, weight [in_chan, out_chan, kh, kw].
/// The output size is `(h - 1) * stride - 2 * padding + kernel + output_padding`.
#[derive(Debug, Clone)]
pub struct ConvTranspose2d {
    filter: Param,
    bias: Option<Param>,
    stride: [usize; 2],
    pad: [usize; 2],
    output_padding: [usize; 2],
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
}

impl ConvTranspose2d {
    #[allow(clippy::too_many_arguments)]
    pub fn new<R: Rng + ?Sized>(
        input_shape: [usize; 3],
        out_chan: usize,
        kernel_size: [usize; 2],
        stride: [usize; 2],
        padding: [usize; 2],
        output_padding: [usize; 2],
        bias: bool,
        rng: &mut R,
    ) -> Result<Self> {
        let in_chan = input_shape[0];
        let receptive_field = kernel_size[0] * kernel_size[1];
        // fan in of a transposed conv is taken over its weight's second axis
        let fan_in = receptive_field * out_chan;
        let fan_out = receptive_field * in_chan;
        let w = Initializer::FanInUniform.init(
            &[in_chan, out_chan, kernel_size[0], kernel_size[1]],
            fan_in,
            fan_out,
            rng,
        );
        let b = bias.then(|| Initializer::FanInUniform.init(&[out_chan], fan_in, fan_out, rng));
        Self::from_weights(w, b, input_shape, stride, padding, output_padding)
    }

    pub fn from_weights(
        filter: Tensor,
        bias: Option<Tensor>,
        input_shape: [usize; 3],
        stride: [usize; 2],
        padding: [usize; 2],
        output_padding: [usize; 2],
    ) -> Result<Self> {
        if filter.ndim() != 4 || filter.shape()[0] != input_shape[0] {
            return Err(DtpError::shape(
                "ConvTranspose2d filter",
                &[input_shape[0], filter.shape().get(1).copied().unwrap_or(0), 0, 0],
                filter.shape(),
            ));
        }
        let (oc, kh, kw) = (filter.shape()[1], filter.shape()[2], filter.shape()[3]);
        // output padding only disambiguates sizes that a strided conv maps together
        let out_size = |size: usize, k: usize, axis: usize| {
            if stride[axis] == 0 || output_padding[axis] >= stride[axis] {
                return None;
            }
            let full = size.checked_sub(1)? * stride[axis] + k + output_padding[axis];
            full.checked_sub(2 * padding[axis]).filter(|s| *s > 0)
        };
        let oh = out_size(input_shape[1], kh, 0);
        let ow = out_size(input_shape[2], kw, 1);
        let (Some(oh), Some(ow)) = (oh, ow) else {
            return Err(DtpError::Configuration(format!(
                "ConvTranspose2d kernel {kh}x{kw} with stride {stride:?}, padding {padding:?} \
                 and output padding {output_padding:?} is invalid for input {input_shape:?}"
            )));
        };
        Ok(Self {
            filter: Param::new(filter),
            bias: bias.map(Param::new),
            stride,
            pad: padding,
            output_padding,
            input_shape: input_shape.to_vec(),
            output_shape: vec![oc, oh, ow],
        })
    }

    pub fn kernel_size(&self) -> [usize; 2] {
        [self.filter.shape()[2], self.filter.shape()[3]]
    }

    pub fn stride(&self) -> [usize; 2] {
        self.stride
    }

    pub fn padding(&self) -> [usize; 2] {
        self.pad
    }

    pub fn output_padding(&self) -> [usize; 2] {
        self.output_padding
    }

    pub fn has_bias(&self) -> bool {
        self.bias.is_some()
    }

    pub fn filter(&self) -> &Param {
        &self.filter
    }

    pub fn filter_mut(&mut self) -> &mut Param {
        &mut self.filter
    }
}

impl Layer for ConvTranspose2d {
    fn name(&self) -> &'static str {
        "ConvTranspose2d"
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
        let (b, cin, h, w) = x4.dim();
        let kernel = self.kernel_size();
        let (stride, pad) = (self.stride, self.pad);
        let (oc, oh, ow) = (self.output_shape[0], self.output_shape[1], self.output_shape[2]);
        let out_dims = (b, oc, oh, ow);
        let filter_shape = self.filter.shape().to_vec();

        // the input grid plays the role of the im2col grid of the output
        let x2 = channels_last_rows(x4)?;
        let wmat = self
            .filter
            .w
            .as_standard_layout()
            .into_owned()
            .into_shape((cin, oc * kernel[0] * kernel[1]))?;
        let cols = x2.dot(&wmat);
        let mut y = col2im(cols.view(), out_dims, kernel, stride, pad, [h, w]);
        add_bias(&mut y, &self.bias)?;
        let has_bias = self.bias.is_some();

        let pullback = move |grad: &Tensor| -> Result<(Tensor, Vec<Tensor>)> {
            let g4 = grad.view().into_dimensionality::<Ix4>()?;
            let gcols = im2col(g4, kernel, stride, pad, [h, w]);
            let dx = rows_to_channels_first(gcols.dot(&wmat.t()), b, h, w)?;
            let dw = x2.t().dot(&gcols).into_shape(IxDyn(&filter_shape))?;
            let mut grads = vec![dw];
            if has_bias {
                grads.push(bias_grad(g4));
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
        std::iter::once(&self.filter).chain(self.bias.iter()).collect()
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        std::iter::once(&mut self.filter).chain(self.bias.iter_mut()).collect()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nn::utils::{grad_check, randn};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn check_layer_grads(
        layer: &dyn Layer,
        x: &Tensor,
        rebuild: impl Fn(Vec<Tensor>) -> Box<dyn Layer>,
    ) {
        let f = |x: &Tensor| layer.forward(x, &Aux::None).unwrap().0;
        let df =
            |g: &Tensor| (layer.forward_with_grad(x, &Aux::None).unwrap().pullback)(g).unwrap().0;
        grad_check(x, f, df, None, None, None).unwrap();

        let weights: Vec<Tensor> = layer.params().iter().map(|p| p.w.clone()).collect();
        for (k, w) in weights.iter().enumerate() {
            let f = |w: &Tensor| {
                let mut ws = weights.clone();
                ws[k] = w.clone();
                rebuild(ws).forward(x, &Aux::None).unwrap().0
            };
            let df = |g: &Tensor| {
                let forward = layer.forward_with_grad(x, &Aux::None).unwrap();
                let (_, mut grads) = (forward.pullback)(g).unwrap();
                grads.remove(k)
            };
            grad_check(w, f, df, None, None, None).unwrap();
        }
    }

    #[test]
    fn test_conv2d_forward() {
        // 1 channel 3x3 input, 2x2 box filter, stride 1
        let x = Tensor::from_shape_vec(IxDyn(&[1, 1, 3, 3]), (0..9).map(|v| v as f32).collect())
            .unwrap();
        let w = Tensor::ones(IxDyn(&[1, 1, 2, 2]));
        let conv = Conv2d::from_weights(w, None, [1, 3, 3], [1, 1], [0, 0]).unwrap();
        assert_eq!(conv.output_shape(), &[1, 2, 2]);
        let (y, _) = conv.forward(&x, &Aux::None).unwrap();
        assert_eq!(y.into_raw_vec(), vec![8., 12., 20., 24.]);
    }

    #[test]
    fn gradcheck_conv2d() {
        let mut rng = StdRng::seed_from_u64(0);
        let conv = Conv2d::new([2, 5, 5], 3, [3, 3], [2, 2], [1, 1], true, &mut rng).unwrap();
        assert_eq!(conv.output_shape(), &[3, 3, 3]);
        let x = randn(&[2, 2, 5, 5], &mut rng);
        check_layer_grads(&conv, &x, |ws| {
            let mut ws = ws.into_iter();
            let w = ws.next().unwrap();
            Box::new(Conv2d::from_weights(w, ws.next(), [2, 5, 5], [2, 2], [1, 1]).unwrap())
        });
    }

    #[test]
    fn gradcheck_conv_transpose2d() {
        let mut rng = StdRng::seed_from_u64(1);
        let conv =
            ConvTranspose2d::new([3, 3, 3], 2, [3, 3], [2, 2], [1, 1], [0, 0], true, &mut rng)
                .unwrap();
        assert_eq!(conv.output_shape(), &[2, 5, 5]);
        let x = randn(&[2, 3, 3, 3], &mut rng);
        check_layer_grads(&conv, &x, |ws| {
            let mut ws = ws.into_iter();
            let w = ws.next().unwrap();
            let b = ws.next();
            let conv = ConvTranspose2d::from_weights(w, b, [3, 3, 3], [2, 2], [1, 1], [0, 0]);
            Box::new(conv.unwrap())
        });
    }

    #[test]
    fn test_conv_transpose_is_adjoint() {
        // <conv(x), y> == <x, conv_t(y)> when both share the filter and have no bias
        let mut rng = StdRng::seed_from_u64(2);
        let w = randn(&[4, 2, 3, 3], &mut rng);
        let conv = Conv2d::from_weights(w.clone(), None, [2, 6, 6], [2, 2], [1, 1]).unwrap();
        let convt =
            ConvTranspose2d::from_weights(w, None, [4, 3, 3], [2, 2], [1, 1], [1, 1]).unwrap();
        assert_eq!(convt.output_shape(), &[2, 6, 6]);
        let x = randn(&[1, 2, 6, 6], &mut rng);
        let y = randn(&[1, 4, 3, 3], &mut rng);
        let lhs = (&conv.forward(&x, &Aux::None).unwrap().0 * &y).sum();
        let rhs = (&x * &convt.forward(&y, &Aux::None).unwrap().0).sum();
        approx::assert_relative_eq!(lhs, rhs, epsilon = 1e-3);
    }

    #[test]
    fn test_conv_rejects_small_input() {
        let mut rng = StdRng::seed_from_u64(3);
        let err = Conv2d::new([1, 2, 2], 1, [5, 5], [1, 1], [0, 0], false, &mut rng).unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Configuration);
    }
}
