//! Optimizers with one parameter group per bound layer.
//!
//! Gradients live in each layer's [`Param`]s; an optimizer only owns its
//! per-parameter state and the learning rate of every group, so the same
//! network can be read by other trainers while the optimizer is idle.

use std::f32::consts::PI;

use serde::{Deserialize, Serialize};

use super::{Layer, Param, Tensor};
use crate::error::{DtpError, Result};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum OptimizerKind {
    Sgd,
    Adam,
}

/// A single rate for every layer, or one rate per layer of the bound network.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum LearningRate {
    Global(f32),
    PerLayer(Vec<f32>),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct OptimizerConfig {
    pub kind: OptimizerKind,
    pub lr: LearningRate,
    pub momentum: f32,
    pub weight_decay: f32,
    pub nesterov: bool,
    pub betas: (f32, f32),
    pub eps: f32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::Sgd,
            lr: LearningRate::Global(1e-3),
            momentum: 0.0,
            weight_decay: 0.0,
            nesterov: false,
            betas: (0.9, 0.999),
            eps: 1e-8,
        }
    }
}

impl OptimizerConfig {
    pub fn sgd(lr: LearningRate, momentum: f32, weight_decay: f32) -> Self {
        Self {
            kind: OptimizerKind::Sgd,
            lr,
            momentum,
            weight_decay,
            ..Default::default()
        }
    }

    pub fn adam(lr: LearningRate) -> Self {
        Self {
            kind: OptimizerKind::Adam,
            lr,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
enum ParamState {
    Sgd { velocity: Option<Tensor> },
    Adam { m: Tensor, v: Tensor },
}

#[derive(Debug, Clone)]
pub struct ParamGroup {
    pub layer: usize,
    pub lr: f32,
    base_lr: f32,
    steps: usize,
    state: Vec<ParamState>,
}

impl ParamGroup {
    pub fn base_lr(&self) -> f32 {
        self.base_lr
    }
}

#[derive(Debug, Clone)]
pub struct Optimizer {
    config: OptimizerConfig,
    groups: Vec<ParamGroup>,
}

impl Optimizer {
    /// Binds every trainable layer. A per-layer rate list must have one entry
    /// per layer; layers whose rate is zero are left out.
    pub fn new(config: OptimizerConfig, layers: &[Box<dyn Layer>]) -> Result<Self> {
        let lrs = match &config.lr {
            LearningRate::Global(lr) => vec![*lr; layers.len()],
            LearningRate::PerLayer(lrs) => {
                if lrs.len() != layers.len() {
                    return Err(DtpError::Configuration(format!(
                        "{} learning rates given for a network of {} layers",
                        lrs.len(),
                        layers.len()
                    )));
                }
                lrs.clone()
            }
        };
        Self::with_lrs(config, layers, &lrs)
    }

    /// Binds the trainable layers whose entry in `lrs` is positive.
    pub fn with_lrs(
        config: OptimizerConfig,
        layers: &[Box<dyn Layer>],
        lrs: &[f32],
    ) -> Result<Self> {
        if lrs.len() != layers.len() {
            return Err(DtpError::Configuration(format!(
                "{} learning rates given for a network of {} layers",
                lrs.len(),
                layers.len()
            )));
        }
        let groups = layers
            .iter()
            .zip(lrs)
            .enumerate()
            .filter(|(_, (layer, lr))| layer.is_trainable() && **lr > 0.0)
            .map(|(i, (layer, &lr))| ParamGroup {
                layer: i,
                lr,
                base_lr: lr,
                steps: 0,
                state: layer.params().iter().map(|p| new_state(config.kind, p)).collect(),
            })
            .collect();
        Ok(Self { config, groups })
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    pub fn has_group(&self, layer: usize) -> bool {
        self.groups.iter().any(|g| g.layer == layer)
    }

    pub fn lr(&self, layer: usize) -> Option<f32> {
        self.groups.iter().find(|g| g.layer == layer).map(|g| g.lr)
    }

    /// Updates every bound layer from its accumulated gradients.
    pub fn step(&mut self, layers: &mut [Box<dyn Layer>]) -> Result<()> {
        let n = layers.len();
        for k in 0..self.groups.len() {
            let i = self.groups[k].layer;
            let layer = layers.get_mut(i).ok_or_else(|| {
                DtpError::InternalConsistency(format!(
                    "optimizer bound to layer {i} of a {n} layer network"
                ))
            })?;
            update_group(&self.config, &mut self.groups[k], layer.as_mut())?;
        }
        Ok(())
    }

    /// Updates only layer `i`.
    pub fn step_layer(&mut self, i: usize, layer: &mut dyn Layer) -> Result<()> {
        let group = self
            .groups
            .iter_mut()
            .find(|g| g.layer == i)
            .ok_or_else(|| {
                DtpError::InternalConsistency(format!("no optimizer group for layer {i}"))
            })?;
        update_group(&self.config, group, layer)
    }

    pub fn zero_grad(&self, layers: &mut [Box<dyn Layer>]) {
        for g in self.groups.iter() {
            if let Some(layer) = layers.get_mut(g.layer) {
                layer.zero_grad();
            }
        }
    }

    pub fn apply_schedule(&mut self, scheduler: &dyn LrScheduler) {
        for g in self.groups.iter_mut() {
            g.lr = scheduler.lr(g.base_lr);
        }
    }
}

fn new_state(kind: OptimizerKind, p: &Param) -> ParamState {
    match kind {
        OptimizerKind::Sgd => ParamState::Sgd { velocity: None },
        OptimizerKind::Adam => ParamState::Adam {
            m: Tensor::zeros(p.w.raw_dim()),
            v: Tensor::zeros(p.w.raw_dim()),
        },
    }
}

fn update_group(
    config: &OptimizerConfig,
    group: &mut ParamGroup,
    layer: &mut dyn Layer,
) -> Result<()> {
    let name = layer.name();
    let mut params = layer.params_mut();
    if params.len() != group.state.len() {
        return Err(DtpError::InternalConsistency(format!(
            "optimizer group for layer {} ({name}) tracks {} parameters, layer has {}",
            group.layer,
            group.state.len(),
            params.len()
        )));
    }
    group.steps += 1;
    let lr = group.lr;
    for (p, state) in params.iter_mut().zip(group.state.iter_mut()) {
        let mut d_p = p.g.clone();
        if config.weight_decay != 0.0 {
            d_p.scaled_add(config.weight_decay, &p.w);
        }
        match state {
            ParamState::Sgd { velocity } => {
                if config.momentum != 0.0 {
                    let buf = match velocity.take() {
                        Some(mut buf) => {
                            buf *= config.momentum;
                            buf += &d_p;
                            buf
                        }
                        None => d_p.clone(),
                    };
                    if config.nesterov {
                        d_p.scaled_add(config.momentum, &buf);
                    } else {
                        d_p = buf.clone();
                    }
                    *velocity = Some(buf);
                }
                p.w.scaled_add(-lr, &d_p);
            }
            ParamState::Adam { m, v } => {
                let (b1, b2) = config.betas;
                *m *= b1;
                m.scaled_add(1.0 - b1, &d_p);
                *v *= b2;
                v.scaled_add(1.0 - b2, &d_p.mapv(|x| x * x));
                let bias1 = 1.0 - b1.powi(group.steps as i32);
                let bias2 = 1.0 - b2.powi(group.steps as i32);
                let eps = config.eps;
                let update = ndarray::Zip::from(&*m)
                    .and(&*v)
                    .map_collect(|&m, &v| (m / bias1) / ((v / bias2).sqrt() + eps));
                p.w.scaled_add(-lr, &update);
            }
        }
    }
    Ok(())
}

/// Learning rate schedule applied to the base rate of every group.
pub trait LrScheduler {
    /// The rate for a group whose initial rate is `base_lr`.
    fn lr(&self, base_lr: f32) -> f32;

    /// Advance the scheduler to the next epoch.
    fn step(&mut self);

    fn reset(&mut self);
}

/// `eta_min + (base - eta_min) * (1 + cos(pi * t / t_max)) / 2`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CosineAnnealing {
    pub t_max: usize,
    pub eta_min: f32,
    #[serde(skip)]
    epoch: usize,
}

impl CosineAnnealing {
    pub fn new(t_max: usize, eta_min: f32) -> Self {
        Self { t_max, eta_min, epoch: 0 }
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }
}

impl Default for CosineAnnealing {
    fn default() -> Self {
        Self::new(85, 1e-5)
    }
}

impl LrScheduler for CosineAnnealing {
    fn lr(&self, base_lr: f32) -> f32 {
        if self.t_max == 0 {
            return base_lr;
        }
        let t = self.epoch as f32 / self.t_max as f32;
        self.eta_min + (base_lr - self.eta_min) * (1.0 + (PI * t).cos()) / 2.0
    }

    fn step(&mut self) {
        self.epoch += 1;
    }

    fn reset(&mut self) {
        self.epoch = 0;
    }
}
