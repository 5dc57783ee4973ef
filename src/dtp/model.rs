use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::feedback::train_feedback;
use super::forward::train_forward;
use super::metrics::MetricsSink;
use super::network::{BackwardNetwork, ForwardNetwork};
use super::registry::InversionRegistry;
use super::schedule::FeedbackSchedule;
use super::trace::{collect_activations, GradMode};
use super::weights::init_symmetric_weights;
use crate::config::{HParams, LayerSpec, SchedulerInterval};
use crate::error::Result;
use crate::nn::optim::{CosineAnnealing, LrScheduler, Optimizer};
use crate::nn::{batched, reinit_weights, Tensor};

/// Mixed into the seed of the model's own stream, which draws the feedback
/// weights and the feedback noise. Keeps them independent of forward weights
/// drawn from the plain seed.
const FEEDBACK_STREAM: u64 = 0x9e37_79b9_7f4a_7c15;

/// Which part of the data a step runs on. Only `Train` updates weights.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum Phase {
    Train,
    Validate,
    Test,
}

impl Phase {
    /// Prefix of the metric names recorded in this phase.
    pub fn prefix(&self) -> &'static str {
        match self {
            Phase::Train => "train",
            Phase::Validate => "val",
            Phase::Test => "test",
        }
    }

    pub fn is_training(&self) -> bool {
        *self == Phase::Train
    }
}

/// Scalars produced by one [`Dtp::shared_step`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput {
    /// `forward_loss + feedback_loss`
    pub loss: f32,
    pub feedback_loss: f32,
    pub forward_loss: f32,
    /// Summed feedback loss of every forward layer, entry 0 unused.
    pub layer_losses: Vec<f32>,
    /// Per-iteration weight angles of every forward layer, in degrees.
    pub layer_angles: Vec<Vec<f32>>,
    pub layer_distances: Vec<Vec<f32>>,
    pub forward_layer_losses: Vec<f32>,
    pub accuracy: f32,
}

/// A forward network, its feedback network and the two optimizers that train
/// them. Each step fits the feedback weights first and then moves the forward
/// weights towards their targets.
#[derive(Debug)]
pub struct Dtp {
    forward: ForwardNetwork,
    backward: BackwardNetwork,
    hparams: HParams,
    schedule: FeedbackSchedule,
    forward_optim: Optimizer,
    feedback_optim: Optimizer,
    scheduler: Option<CosineAnnealing>,
    rng: StdRng,
    epoch: usize,
}

impl Dtp {
    /// `example_input` is a batch used to check that the feedback network
    /// maps outputs back onto inputs.
    pub fn new(
        mut forward: ForwardNetwork,
        hparams: HParams,
        example_input: &Tensor,
        registry: &InversionRegistry,
    ) -> Result<Self> {
        hparams.validate()?;
        let mut rng = StdRng::seed_from_u64(hparams.seed ^ FEEDBACK_STREAM);
        if let Some(init) = hparams.forward_init {
            for layer in forward.layers_mut() {
                reinit_weights(layer.as_mut(), init, &mut rng);
            }
        }
        let mut backward = BackwardNetwork::build(&forward, registry, example_input, &mut rng)?;
        if let Some(init) = hparams.feedback_init {
            for layer in backward.layers_mut() {
                reinit_weights(layer.as_mut(), init, &mut rng);
            }
        }
        if hparams.init_symmetric_weights {
            init_symmetric_weights(&forward, &mut backward)?;
        }
        let schedule = FeedbackSchedule::from_hparams(&hparams, &backward)?;
        let feedback_optim =
            Optimizer::with_lrs(hparams.b_optim.clone(), backward.layers(), &schedule.lrs)?;
        let mut forward_optim = Optimizer::new(hparams.f_optim.clone(), forward.layers())?;
        let scheduler = hparams.scheduler.clone();
        if let Some(s) = &scheduler {
            forward_optim.apply_schedule(s);
        }
        info!(
            layers = forward.len(),
            feedback_groups = feedback_optim.groups().len(),
            forward_groups = forward_optim.groups().len(),
            "dtp model ready"
        );
        Ok(Self {
            forward,
            backward,
            hparams,
            schedule,
            forward_optim,
            feedback_optim,
            scheduler,
            rng,
            epoch: 0,
        })
    }

    /// Builds the forward network from `specs` for inputs of shape `input_shape`
    /// (batch axis excluded), then the model around it.
    pub fn from_specs(
        specs: &[LayerSpec],
        input_shape: &[usize],
        hparams: HParams,
        registry: &InversionRegistry,
    ) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(hparams.seed);
        let forward = ForwardNetwork::from_specs(specs, input_shape, &mut rng)?;
        let example = Tensor::zeros(batched(1, input_shape));
        Self::new(forward, hparams, &example, registry)
    }

    /// Feedback phase then forward phase on one batch. Scalars go to `sink`
    /// under `{phase}/...` names.
    pub fn shared_step(
        &mut self,
        x: &Tensor,
        labels: &[usize],
        phase: Phase,
        sink: &mut dyn MetricsSink,
    ) -> Result<StepOutput> {
        let trace = collect_activations(&self.forward, x, GradMode::Off)?;
        let feedback = train_feedback(
            &self.forward,
            &mut self.backward,
            &mut self.feedback_optim,
            &self.schedule,
            &trace,
            phase,
            self.hparams.feedback_samples_per_iteration,
            &mut self.rng,
        )?;
        drop(trace);
        let forward = train_forward(
            &mut self.forward,
            &self.backward,
            &mut self.forward_optim,
            x,
            labels,
            self.hparams.beta,
            self.hparams.layer_reduction,
            phase,
        )?;
        if phase == Phase::Train && self.hparams.scheduler_interval == SchedulerInterval::Step {
            self.step_scheduler();
        }

        let p = phase.prefix();
        for (i, stats) in feedback.layers.iter().enumerate().skip(1) {
            sink.record(&format!("{p}/B_total_loss[{i}]"), stats.total_loss());
            sink.record(&format!("{p}/B_iterations[{i}]"), stats.iterations() as f32);
        }
        for (i, loss) in forward.layer_losses.iter().enumerate() {
            sink.record(&format!("{p}/F_loss[{i}]"), *loss);
        }
        let feedback_loss = feedback.total_loss();
        sink.record(&format!("{p}/B_loss"), feedback_loss);
        sink.record(&format!("{p}/F_loss"), forward.loss);
        sink.record(&format!("{p}/accuracy"), forward.accuracy);
        sink.record(&format!("{p}/delta.norm()"), forward.delta_norm);

        let loss = forward.loss + feedback_loss;
        if !loss.is_finite() {
            warn!(
                phase = %phase,
                forward = forward.loss,
                feedback = feedback_loss,
                "non-finite loss"
            );
        }
        Ok(StepOutput {
            loss,
            feedback_loss,
            forward_loss: forward.loss,
            layer_losses: feedback.layers.iter().map(|l| l.total_loss()).collect(),
            layer_angles: feedback.layers.iter().map(|l| l.angles.clone()).collect(),
            layer_distances: feedback.layers.iter().map(|l| l.distances.clone()).collect(),
            forward_layer_losses: forward.layer_losses,
            accuracy: forward.accuracy,
        })
    }

    /// Logits of the forward network.
    pub fn predict(&self, x: &Tensor) -> Result<Tensor> {
        self.forward.forward(x)
    }

    /// Counts the epoch. Advances the forward learning rate schedule unless it
    /// is stepped after every training batch.
    pub fn on_epoch_end(&mut self) {
        self.epoch += 1;
        if self.hparams.scheduler_interval == SchedulerInterval::Epoch {
            self.step_scheduler();
            let lr = self.forward_optim.groups().first().map(|g| g.lr);
            info!(epoch = self.epoch, lr = ?lr, "forward lr");
        }
    }

    fn step_scheduler(&mut self) {
        if let Some(s) = self.scheduler.as_mut() {
            s.step();
            self.forward_optim.apply_schedule(s);
        }
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn forward_net(&self) -> &ForwardNetwork {
        &self.forward
    }

    pub fn backward_net(&self) -> &BackwardNetwork {
        &self.backward
    }

    pub fn hparams(&self) -> &HParams {
        &self.hparams
    }

    pub fn schedule(&self) -> &FeedbackSchedule {
        &self.schedule
    }

    pub fn forward_optimizer(&self) -> &Optimizer {
        &self.forward_optim
    }

    pub fn feedback_optimizer(&self) -> &Optimizer {
        &self.feedback_optim
    }
}
