use tracing::info;

use super::network::{BackwardNetwork, ForwardNetwork};
use crate::error::{DtpError, Result};
use crate::nn::{Layer, Linear};

/// Copies the forward weights into the feedback layers: dense layers get the
/// transpose, convolutions the same filter. Biases keep their values.
pub fn init_symmetric_weights(
    forward: &ForwardNetwork,
    backward: &mut BackwardNetwork,
) -> Result<()> {
    let mut copied = 0;
    for i in 0..forward.len() {
        let bi = backward.mirror_index(i);
        let g = backward.layers_mut()[bi].as_mut();
        copied += copy_symmetric(forward.layer(i), g)
            .map_err(|e| e.at(format!("backward layer {bi}")))?;
    }
    info!(weights = copied, "initialised feedback weights symmetrically");
    Ok(())
}

fn copy_symmetric(f: &dyn Layer, g: &mut dyn Layer) -> Result<usize> {
    if !f.children().is_empty() {
        let (f_children, g_children) = (f.children(), g.children_mut());
        if f_children.len() != g_children.len() {
            return Err(DtpError::InternalConsistency(format!(
                "{} children mirrored by {}",
                f_children.len(),
                g_children.len()
            )));
        }
        let mut copied = 0;
        // inverted blocks hold their children in reverse
        for (fc, gc) in f_children.iter().zip(g_children.iter_mut().rev()) {
            copied += copy_symmetric(fc.as_ref(), gc.as_mut())?;
        }
        return Ok(copied);
    }

    let Some(w) = f.params().first().map(|p| p.w.clone()) else {
        return Ok(0);
    };
    let w = if f.as_any().is::<Linear>() { w.t().to_owned() } else { w };
    let name = g.name();
    let Some(target) = g.params_mut().into_iter().next() else {
        return Err(DtpError::InternalConsistency(format!(
            "{} has weights but its feedback {name} has none",
            f.name()
        )));
    };
    if target.w.shape() != w.shape() {
        return Err(DtpError::shape(format!("{name} weight"), w.shape(), target.w.shape()));
    }
    target.w.assign(&w);
    Ok(1)
}
