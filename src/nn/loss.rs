use ndarray::prelude::*;

use super::Tensor;
use crate::error::{DtpError, Result};

/// Row-wise softmax of [batch, classes] logits.
pub fn softmax(logits: ArrayView2<f32>) -> Array2<f32> {
    let mut out = logits.to_owned();
    for mut row in out.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |m, v| m.max(*v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row /= sum;
    }
    out
}

/// expects a 1D array of labels [B], outputs an array of shape [B, classes]
pub fn one_hot(labels: &[usize], classes: usize) -> Array2<f32> {
    let mut out = Array2::zeros((labels.len(), classes));
    for (i, &l) in labels.iter().enumerate() {
        if l < classes {
            out[[i, l]] = 1.0;
        }
    }
    out
}

fn check_labels(logits: &Tensor, labels: &[usize]) -> Result<()> {
    if logits.ndim() != 2 || logits.shape()[0] != labels.len() {
        return Err(DtpError::shape(
            "cross entropy logits",
            &[labels.len(), logits.shape().get(1).copied().unwrap_or(0)],
            logits.shape(),
        ));
    }
    let classes = logits.shape()[1];
    if let Some(l) = labels.iter().find(|&&l| l >= classes) {
        return Err(DtpError::Configuration(format!(
            "label {l} out of range for {classes} classes"
        )));
    }
    Ok(())
}

/// Cross entropy summed over the batch, together with its gradient w.r.t. the
/// logits (`softmax - one_hot`). expects logits of shape [B, classes]
pub fn cross_entropy(logits: &Tensor, labels: &[usize]) -> Result<(f32, Tensor)> {
    check_labels(logits, labels)?;
    let logits = logits.view().into_dimensionality::<Ix2>()?;
    let p = softmax(logits);
    let loss = labels
        .iter()
        .enumerate()
        .map(|(i, &l)| -p[[i, l]].max(f32::MIN_POSITIVE).ln())
        .sum::<f32>();
    let grad = p - one_hot(labels, logits.ncols());
    Ok((loss, grad.into_dyn()))
}

/// Fraction of rows whose argmax equals the label.
pub fn accuracy(logits: &Tensor, labels: &[usize]) -> Result<f32> {
    check_labels(logits, labels)?;
    if labels.is_empty() {
        return Ok(0.0);
    }
    let logits = logits.view().into_dimensionality::<Ix2>()?;
    let correct = logits
        .rows()
        .into_iter()
        .zip(labels)
        .filter(|(row, l)| argmax(row.view()) == **l)
        .count();
    Ok(correct as f32 / labels.len() as f32)
}

fn argmax(row: ArrayView1<f32>) -> usize {
    let mut best = 0;
    for (i, v) in row.iter().enumerate() {
        if *v > row[best] {
            best = i;
        }
    }
    best
}
