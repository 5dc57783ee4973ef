use serde::{Deserialize, Serialize};

use crate::error::{DtpError, Result};
use crate::nn::optim::{CosineAnnealing, LearningRate, OptimizerConfig};
use crate::nn::Initializer;

/// How the per-layer forward losses combine into the loss that is minimised.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
pub enum LayerReduction {
    #[default]
    Sum,
    Mean,
}

/// When the forward learning rate scheduler advances.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
pub enum SchedulerInterval {
    /// Once per epoch, from `Dtp::on_epoch_end`.
    #[default]
    Epoch,
    /// After every training batch.
    Step,
}

/// Description of one forward layer. Input sizes are inferred from the
/// preceding layer, only output sizes are given.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum LayerSpec {
    Linear {
        out_features: usize,
        bias: bool,
    },
    Conv2d {
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        bias: bool,
    },
    ConvTranspose2d {
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        output_padding: usize,
        bias: bool,
    },
    MaxPool2d {
        kernel_size: usize,
        stride: usize,
    },
    /// Output size `(h - 1) * stride + kernel_size`.
    MaxUnpool2d {
        kernel_size: usize,
        stride: usize,
    },
    Flatten,
    Reshape(Vec<usize>),
    Relu,
    Elu(f32),
    Tanh,
    Identity,
    Normalize,
    Block(Vec<LayerSpec>),
}

/// Hyper-parameters of the DTP training core. Per-layer lists are given in
/// forward order, one entry per trainable forward layer but the first.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct HParams {
    pub batch_size: usize,
    /// Max number of training epochs in total.
    pub max_epochs: usize,
    /// Number of training steps for the feedback weights per batch, per layer.
    pub feedback_training_iterations: Vec<usize>,
    /// The scale of the gaussian perturbation in the feedback loss, per layer.
    pub noise: Vec<f32>,
    /// Feedback optimizer. Its learning rate is given per layer.
    pub b_optim: OptimizerConfig,
    pub f_optim: OptimizerConfig,
    /// Cosine annealing of the forward learning rate.
    pub scheduler: Option<CosineAnnealing>,
    pub scheduler_interval: SchedulerInterval,
    /// Nudging coefficient used for the output target.
    pub beta: f32,
    /// Noise samples averaged into the feedback loss of a single iteration.
    pub feedback_samples_per_iteration: usize,
    /// Epochs without validation improvement before training stops. 0 disables.
    pub early_stopping_patience: usize,
    pub init_symmetric_weights: bool,
    /// Re-draws the forward weight matrices and filters. `None` keeps the
    /// fan-in uniform init of the layers.
    pub forward_init: Option<Initializer>,
    /// Same for the feedback weights, applied before any symmetric copy.
    pub feedback_init: Option<Initializer>,
    pub layer_reduction: LayerReduction,
    pub seed: u64,
}

impl Default for HParams {
    fn default() -> Self {
        Self {
            batch_size: 128,
            max_epochs: 90,
            feedback_training_iterations: vec![20, 30, 35, 55, 20],
            noise: vec![0.4, 0.4, 0.2, 0.2, 0.08],
            b_optim: OptimizerConfig::sgd(
                LearningRate::PerLayer(vec![1e-4, 3.5e-4, 8e-3, 8e-3, 0.18]),
                0.9,
                0.0,
            ),
            f_optim: OptimizerConfig::sgd(LearningRate::Global(0.08), 0.9, 1e-4),
            scheduler: Some(CosineAnnealing::default()),
            scheduler_interval: SchedulerInterval::Epoch,
            beta: 0.7,
            feedback_samples_per_iteration: 1,
            early_stopping_patience: 0,
            init_symmetric_weights: false,
            forward_init: None,
            feedback_init: None,
            layer_reduction: LayerReduction::Sum,
            seed: 0,
        }
    }
}

impl HParams {
    /// Checks the values that do not depend on the network.
    pub fn validate(&self) -> Result<()> {
        if !(self.beta > 0.0 && self.beta <= 1.0) {
            return Err(DtpError::Configuration(format!(
                "beta must be in (0, 1], got {}",
                self.beta
            )));
        }
        if self.feedback_samples_per_iteration == 0 {
            return Err(DtpError::Configuration(
                "feedback_samples_per_iteration must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(DtpError::Configuration("batch_size must be at least 1".to_string()));
        }
        if let Some(bad) = self.noise.iter().find(|n| !n.is_finite() || **n < 0.0) {
            return Err(DtpError::Configuration(format!(
                "noise scales must be finite and >= 0, got {bad}"
            )));
        }
        Ok(())
    }

    /// Feedback learning rates in forward order. A global rate applies to
    /// every layer that has an iteration count.
    pub fn feedback_lrs(&self) -> Vec<f32> {
        match &self.b_optim.lr {
            LearningRate::PerLayer(lrs) => lrs.clone(),
            LearningRate::Global(lr) => vec![*lr; self.feedback_training_iterations.len()],
        }
    }
}
