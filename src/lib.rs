//! Difference target propagation.
//!
//! Every forward layer is paired with a learned feedback layer that
//! approximates its inverse. The feedback layers are fitted with a noise based
//! local loss, then a correction of the output is carried back through them to
//! give every forward layer its own target.

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};

pub mod config;
pub mod datasets;
pub mod dtp;
pub mod error;
pub mod logging;
pub mod networks;
pub mod nn;

pub use config::{HParams, LayerReduction, LayerSpec, SchedulerInterval};
pub use dtp::{BackwardNetwork, Dtp, ForwardNetwork, InversionRegistry, Phase, StepOutput};
pub use error::{DtpError, ErrorCategory};
pub use nn::{Layer, Tensor};

pub trait Config: Send + Sync {
    fn config(&self) -> String;
    fn load_config(&mut self, config: &str) -> Result<()>;
}

impl<T: Serialize + DeserializeOwned + Send + Sync> Config for T {
    fn config(&self) -> String {
        let pretty = ron::ser::PrettyConfig::default();
        ron::ser::to_string_pretty(self, pretty)
            .unwrap_or_else(|e| format!("/* unserializable config: {e} */"))
    }
    fn load_config(&mut self, config: &str) -> Result<()> {
        *self = ron::from_str(config).context(format!("Failed to load config {}", config))?;
        Ok(())
    }
}
