use std::any::Any;

use super::{Aux, Forward, Layer, Param, Pullback, Tensor};
use crate::error::{DtpError, Result};

/// A group of layers that trains and inverts as one unit.
///
/// A forward block emits `Aux::Seq` with one entry per child in child order.
/// A mirrored block is the inverse of such a block: its children are the
/// inverted children in reverse order, so child `j` consumes entry `len - 1 - j`
/// of the aux it is given.
#[derive(Debug)]
pub struct Block {
    layers: Vec<Box<dyn Layer>>,
    mirrored: bool,
}

impl Block {
    pub fn new(layers: Vec<Box<dyn Layer>>) -> Result<Self> {
        Self::build(layers, false)
    }

    pub fn mirrored(layers: Vec<Box<dyn Layer>>) -> Result<Self> {
        Self::build(layers, true)
    }

    fn build(layers: Vec<Box<dyn Layer>>, mirrored: bool) -> Result<Self> {
        if layers.is_empty() {
            return Err(DtpError::Configuration("a block needs at least one layer".to_string()));
        }
        for (i, pair) in layers.windows(2).enumerate() {
            if pair[0].output_shape() != pair[1].input_shape() {
                return Err(DtpError::shape(
                    format!("block child {} ({})", i + 1, pair[1].name()),
                    pair[0].output_shape(),
                    pair[1].input_shape(),
                ));
            }
        }
        Ok(Self { layers, mirrored })
    }

    pub fn is_mirrored(&self) -> bool {
        self.mirrored
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    fn child_aux<'a>(&self, aux: &'a Aux, j: usize) -> Result<&'a Aux> {
        static NONE: Aux = Aux::None;
        match aux {
            Aux::None => Ok(&NONE),
            Aux::Seq(entries) if entries.len() == self.layers.len() => {
                let k = if self.mirrored { entries.len() - 1 - j } else { j };
                Ok(&entries[k])
            }
            Aux::Seq(entries) => Err(DtpError::InternalConsistency(format!(
                "block of {} layers received an aux of {} entries",
                self.layers.len(),
                entries.len()
            ))),
            Aux::Indices(_) => Err(DtpError::InternalConsistency(
                "block received pooling indices instead of a per-child aux".to_string(),
            )),
        }
    }
}

impl Layer for Block {
    fn name(&self) -> &'static str {
        "Block"
    }

    fn input_shape(&self) -> &[usize] {
        self.layers[0].input_shape()
    }

    fn output_shape(&self) -> &[usize] {
        self.layers[self.layers.len() - 1].output_shape()
    }

    fn forward_with_grad(&self, x: &Tensor, aux: &Aux) -> Result<Forward> {
        let mut pullbacks: Vec<(Pullback, usize)> = Vec::with_capacity(self.layers.len());
        let mut auxes = Vec::with_capacity(self.layers.len());
        let mut h = x.clone();
        for (j, layer) in self.layers.iter().enumerate() {
            let out = layer
                .forward_with_grad(&h, self.child_aux(aux, j)?)
                .map_err(|e| e.at(format!("block child {j}")))?;
            pullbacks.push((out.pullback, layer.params().len()));
            auxes.push(out.aux);
            h = out.y;
        }

        let pullback = move |grad: &Tensor| -> Result<(Tensor, Vec<Tensor>)> {
            let mut g = grad.clone();
            let mut per_child = Vec::with_capacity(pullbacks.len());
            for (pb, n_params) in pullbacks.into_iter().rev() {
                let (dx, grads) = pb(&g)?;
                if grads.len() != n_params {
                    return Err(DtpError::InternalConsistency(format!(
                        "block child produced {} gradients for {n_params} parameters",
                        grads.len()
                    )));
                }
                per_child.push(grads);
                g = dx;
            }
            let grads = per_child.into_iter().rev().flatten().collect();
            Ok((g, grads))
        };
        Ok(Forward {
            y: h,
            aux: Aux::Seq(auxes),
            pullback: Box::new(pullback),
        })
    }

    fn params(&self) -> Vec<&Param> {
        self.layers.iter().flat_map(|l| l.params()).collect()
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        self.layers.iter_mut().flat_map(|l| l.params_mut()).collect()
    }

    fn children(&self) -> &[Box<dyn Layer>] {
        &self.layers
    }

    fn children_mut(&mut self) -> &mut [Box<dyn Layer>] {
        &mut self.layers
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
