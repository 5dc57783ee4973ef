use std::any::Any;

use super::{batched, check_input, Aux, Forward, Layer, Tensor};
use crate::error::{DtpError, Result};

/// Reinterprets every example of shape `from` as shape `to`, row-major.
#[derive(Debug, Clone)]
pub struct Reshape {
    from: Vec<usize>,
    to: Vec<usize>,
}

impl Reshape {
    pub fn new(from: &[usize], to: &[usize]) -> Result<Self> {
        let (n, m) = (from.iter().product::<usize>(), to.iter().product::<usize>());
        if n != m {
            return Err(DtpError::Configuration(format!(
                "cannot reshape {from:?} ({n} elements) into {to:?} ({m} elements)"
            )));
        }
        Ok(Self {
            from: from.to_vec(),
            to: to.to_vec(),
        })
    }

    /// Collapses everything but the batch axis.
    pub fn flatten(from: &[usize]) -> Self {
        Self {
            from: from.to_vec(),
            to: vec![from.iter().product()],
        }
    }
}

impl Layer for Reshape {
    fn name(&self) -> &'static str {
        "Reshape"
    }

    fn input_shape(&self) -> &[usize] {
        &self.from
    }

    fn output_shape(&self) -> &[usize] {
        &self.to
    }

    fn forward_with_grad(&self, x: &Tensor, _aux: &Aux) -> Result<Forward> {
        check_input(self.name(), &self.from, x)?;
        let b = x.shape()[0];
        let y = x.as_standard_layout().into_owned().into_shape(batched(b, &self.to))?;
        let back_shape = batched(b, &self.from);
        let pullback = move |grad: &Tensor| -> Result<(Tensor, Vec<Tensor>)> {
            let dx = grad.as_standard_layout().into_owned().into_shape(back_shape)?;
            Ok((dx, Vec::new()))
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

#[test]
fn test_reshape() {
    let r = Reshape::flatten(&[2, 3, 3]);
    assert_eq!(r.output_shape(), &[18]);
    let x = Tensor::from_shape_fn(ndarray::IxDyn(&[4, 2, 3, 3]), |d| d[0] as f32);
    let out = r.forward_with_grad(&x, &Aux::None).unwrap();
    assert_eq!(out.y.shape(), &[4, 18]);
    let (dx, grads) = (out.pullback)(&out.y).unwrap();
    assert_eq!(dx, x);
    assert!(grads.is_empty());

    assert!(Reshape::new(&[2, 3], &[5]).is_err());
}
