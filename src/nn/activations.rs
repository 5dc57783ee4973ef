use std::any::Any;

use super::{check_input, Aux, Forward, Layer, Tensor};
use crate::error::Result;

/// Applies `f` elementwise, the pullback multiplies by `df(x, y)`.
fn elementwise(x: &Tensor, f: impl Fn(f32) -> f32, df: fn(f32, f32) -> f32) -> Forward {
    let y = x.mapv(f);
    let gate = ndarray::Zip::from(x).and(&y).map_collect(|&x, &y| df(x, y));
    let pullback = move |grad: &Tensor| -> Result<(Tensor, Vec<Tensor>)> {
        if grad.shape() != gate.shape() {
            return Err(crate::error::DtpError::shape(
                "activation gradient",
                gate.shape(),
                grad.shape(),
            ));
        }
        Ok((grad * &gate, Vec::new()))
    };
    Forward {
        y,
        aux: Aux::None,
        pullback: Box::new(pullback),
    }
}

macro_rules! shape_preserving {
    ($ty:ident) => {
        impl $ty {
            pub fn shape(&self) -> &[usize] {
                &self.shape
            }
        }
    };
}

#[derive(Debug, Clone)]
pub struct Relu {
    shape: Vec<usize>,
}

impl Relu {
    pub fn new(shape: &[usize]) -> Self {
        Self { shape: shape.to_vec() }
    }
}

shape_preserving!(Relu);

impl Layer for Relu {
    fn name(&self) -> &'static str {
        "ReLU"
    }

    fn input_shape(&self) -> &[usize] {
        &self.shape
    }

    fn output_shape(&self) -> &[usize] {
        &self.shape
    }

    fn forward_with_grad(&self, x: &Tensor, _aux: &Aux) -> Result<Forward> {
        check_input(self.name(), &self.shape, x)?;
        Ok(elementwise(x, |v| v.max(0.0), |x, _| if x > 0.0 { 1.0 } else { 0.0 }))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// `x` for positive inputs, `alpha * (exp(x) - 1)` otherwise.
#[derive(Debug, Clone)]
pub struct Elu {
    alpha: f32,
    shape: Vec<usize>,
}

impl Elu {
    pub fn new(shape: &[usize], alpha: f32) -> Self {
        Self { alpha, shape: shape.to_vec() }
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }
}

shape_preserving!(Elu);

impl Layer for Elu {
    fn name(&self) -> &'static str {
        "ELU"
    }

    fn input_shape(&self) -> &[usize] {
        &self.shape
    }

    fn output_shape(&self) -> &[usize] {
        &self.shape
    }

    fn forward_with_grad(&self, x: &Tensor, _aux: &Aux) -> Result<Forward> {
        check_input(self.name(), &self.shape, x)?;
        let alpha = self.alpha;
        let y = x.mapv(|v| if v > 0.0 { v } else { alpha * v.exp_m1() });
        let gate = x.mapv(|v| if v > 0.0 { 1.0 } else { alpha * v.exp() });
        let pullback = move |grad: &Tensor| -> Result<(Tensor, Vec<Tensor>)> {
            Ok((grad * &gate, Vec::new()))
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

#[derive(Debug, Clone)]
pub struct Tanh {
    shape: Vec<usize>,
}

impl Tanh {
    pub fn new(shape: &[usize]) -> Self {
        Self { shape: shape.to_vec() }
    }
}

shape_preserving!(Tanh);

impl Layer for Tanh {
    fn name(&self) -> &'static str {
        "Tanh"
    }

    fn input_shape(&self) -> &[usize] {
        &self.shape
    }

    fn output_shape(&self) -> &[usize] {
        &self.shape
    }

    fn forward_with_grad(&self, x: &Tensor, _aux: &Aux) -> Result<Forward> {
        check_input(self.name(), &self.shape, x)?;
        Ok(elementwise(x, f32::tanh, |_, y| 1.0 - y * y))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone)]
pub struct Identity {
    shape: Vec<usize>,
}

impl Identity {
    pub fn new(shape: &[usize]) -> Self {
        Self { shape: shape.to_vec() }
    }
}

shape_preserving!(Identity);

impl Layer for Identity {
    fn name(&self) -> &'static str {
        "Identity"
    }

    fn input_shape(&self) -> &[usize] {
        &self.shape
    }

    fn output_shape(&self) -> &[usize] {
        &self.shape
    }

    fn forward_with_grad(&self, x: &Tensor, _aux: &Aux) -> Result<Forward> {
        check_input(self.name(), &self.shape, x)?;
        Ok(Forward {
            y: x.clone(),
            aux: Aux::None,
            pullback: Box::new(|grad: &Tensor| -> Result<(Tensor, Vec<Tensor>)> {
                Ok((grad.clone(), Vec::new()))
            }),
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
