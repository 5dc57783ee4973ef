//! This module only defines the dataset logic for producing batches.
//! Real image loaders are not part of the crate, the synthetic blobs are
//! enough to drive the training loop end to end.
use anyhow::{Error, Result};
use ndarray::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::nn::utils::randn;
use crate::nn::{batched, Tensor};

pub trait DatasetBuilder {
    type Dataset: Dataset;
    fn build_train(&self) -> Result<Self::Dataset>;
    fn build_test(&self) -> Option<Result<Self::Dataset>>;
}

/// The universal Dataset trait, which is the final object
/// passed to the model for training
pub trait Dataset {
    type DataPoint;
    fn next(&mut self) -> Option<Self::DataPoint>;
    fn reset(&mut self);
    fn shuffle(&mut self);
}

/// A batch of examples and their class labels.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub x: Tensor,
    pub labels: Vec<usize>,
}

/// Gaussian clusters, one per class, of examples of any shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BlobsParams {
    pub n_classes: usize,
    pub shape: Vec<usize>,
    pub train_per_class: usize,
    /// Held out examples used for early stopping, never for the final score.
    pub val_per_class: usize,
    pub test_per_class: usize,
    /// Standard deviation of the class centres.
    pub spread: f32,
    /// Standard deviation of the examples around their centre.
    pub noise: f32,
    pub train_batch_size: usize,
    pub test_batch_size: usize,
    pub seed: u64,
}

impl Default for BlobsParams {
    fn default() -> Self {
        Self {
            n_classes: 10,
            shape: vec![3, 32, 32],
            train_per_class: 100,
            val_per_class: 20,
            test_per_class: 20,
            spread: 1.0,
            noise: 0.5,
            train_batch_size: 32,
            test_batch_size: 64,
            seed: 0,
        }
    }
}

impl DatasetBuilder for BlobsParams {
    type Dataset = Blobs;

    fn build_train(&self) -> Result<Blobs> {
        if self.train_batch_size == 0 {
            return Err(Error::msg("batch size cannot be zero"));
        }
        self.build(self.train_per_class, self.train_batch_size, 1)
    }

    fn build_test(&self) -> Option<Result<Blobs>> {
        if self.test_per_class == 0 {
            return None;
        }
        if self.test_batch_size == 0 {
            return Some(Err(Error::msg("batch size cannot be zero")));
        }
        Some(self.build(self.test_per_class, self.test_batch_size, 2))
    }
}

impl BlobsParams {
    /// Validation split, drawn around the same centres as train and test.
    pub fn build_val(&self) -> Option<Result<Blobs>> {
        if self.val_per_class == 0 {
            return None;
        }
        if self.test_batch_size == 0 {
            return Some(Err(Error::msg("batch size cannot be zero")));
        }
        Some(self.build(self.val_per_class, self.test_batch_size, 3))
    }

    fn centres(&self) -> Result<Array2<f32>> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let features = self.shape.iter().product::<usize>();
        let centres = randn(&[self.n_classes, features], &mut rng) * self.spread;
        Ok(centres.into_dimensionality::<Ix2>()?)
    }

    fn build(&self, per_class: usize, batch_size: usize, split: u64) -> Result<Blobs> {
        if self.n_classes == 0 || self.shape.is_empty() {
            return Err(Error::msg("blobs need at least one class and a non-empty shape"));
        }
        let centres = self.centres()?;
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(split));
        let n = per_class * self.n_classes;
        let labels: Vec<usize> = (0..n).map(|i| i % self.n_classes).collect();
        let mut x = randn(&[n, centres.ncols()], &mut rng) * self.noise;
        let mut rows = x.view_mut().into_dimensionality::<Ix2>()?;
        for (mut row, &l) in rows.rows_mut().into_iter().zip(&labels) {
            row += &centres.row(l);
        }
        let x = x.into_shape(batched(n, &self.shape))?;
        let order = (0..n).collect();
        Ok(Blobs {
            x,
            labels,
            order,
            idx: 0,
            batch_size,
            rng,
        })
    }
}

/// In-memory classification data served in batches.
#[derive(Debug, Clone)]
pub struct Blobs {
    x: Tensor,
    labels: Vec<usize>,
    order: Vec<usize>,
    idx: usize,
    batch_size: usize,
    rng: StdRng,
}

impl Blobs {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Per-example shape.
    pub fn shape(&self) -> &[usize] {
        &self.x.shape()[1..]
    }
}

impl Dataset for Blobs {
    type DataPoint = Batch;

    fn next(&mut self) -> Option<Batch> {
        if self.idx >= self.order.len() {
            return None;
        }
        let end = (self.idx + self.batch_size).min(self.order.len());
        let picked = &self.order[self.idx..end];
        self.idx = end;
        Some(Batch {
            x: self.x.select(Axis(0), picked),
            labels: picked.iter().map(|&i| self.labels[i]).collect(),
        })
    }

    fn reset(&mut self) {
        self.idx = 0;
    }

    fn shuffle(&mut self) {
        self.order.shuffle(&mut self.rng);
    }
}
