//! Target propagation training: network inversion, the activation trace, the
//! feedback and forward trainers and the model that sequences them.

pub mod feedback;
pub mod forward;
pub mod metrics;
pub mod model;
pub mod network;
pub mod registry;
pub mod schedule;
pub mod trace;
pub mod weights;

pub use feedback::{FeedbackOutcome, LayerFeedbackStats};
pub use forward::{ForwardOutcome, TargetTrace};
pub use metrics::{
    compute_dist_angle, ChannelSink, MemorySink, MetricsSink, NullSink, Record, TracingSink,
};
pub use model::{Dtp, Phase, StepOutput};
pub use network::{BackwardNetwork, ForwardNetwork};
pub use registry::InversionRegistry;
pub use schedule::{align_values_with_backward_net, FeedbackSchedule};
pub use trace::{collect_activations, ActivationTrace, GradMode};
pub use weights::init_symmetric_weights;
