use std::collections::{BTreeMap, HashMap};

use crossbeam::channel::{Receiver, Sender};
use ndarray::Ix2;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DtpError, Result};
use crate::nn::utils::l2_norm;
use crate::nn::{Layer, Tensor};

/// First weight of `layer`, searching nested layers depth first.
fn first_weight(layer: &dyn Layer) -> Option<&Tensor> {
    if let Some(p) = layer.params().into_iter().next() {
        return Some(&p.w);
    }
    layer.children().iter().find_map(|c| first_weight(c.as_ref()))
}

/// Normalised distance and angle in degrees between the weights of a forward
/// layer and its feedback layer. A 2-D feedback weight of the transposed shape
/// is compared transposed. Layers without weights give `(0, 0)`.
pub fn compute_dist_angle(forward: &dyn Layer, feedback: &dyn Layer) -> Result<(f32, f32)> {
    let (Some(f), Some(g)) = (first_weight(forward), first_weight(feedback)) else {
        return Ok((0.0, 0.0));
    };
    let transposed = g.ndim() == 2
        && f.ndim() == 2
        && g.shape()[0] == f.shape()[1]
        && g.shape()[1] == f.shape()[0];
    let g = if transposed {
        g.view().into_dimensionality::<Ix2>()?.t().to_owned().into_dyn()
    } else if g.shape() == f.shape() {
        g.clone()
    } else {
        return Err(DtpError::shape(
            format!("weights of {} and its feedback {}", forward.name(), feedback.name()),
            f.shape(),
            g.shape(),
        ));
    };

    let f_norm = l2_norm(f);
    let g_norm = l2_norm(&g);
    let diff = l2_norm(&(f - &g));
    let distance = if f_norm > 0.0 { diff / f_norm } else { diff };
    let cos = if f_norm > 0.0 && g_norm > 0.0 {
        (f * &g).sum() / (f_norm * g_norm)
    } else {
        0.0
    };
    let angle = cos.clamp(-1.0, 1.0).acos().to_degrees();
    Ok((distance, angle))
}

/// Destination of the named scalars produced by a training step.
pub trait MetricsSink {
    fn record(&mut self, key: &str, value: f32);
}

impl<T: MetricsSink + ?Sized> MetricsSink for &mut T {
    fn record(&mut self, key: &str, value: f32) {
        (**self).record(key, value);
    }
}

/// Records into both sinks.
impl<A: MetricsSink, B: MetricsSink> MetricsSink for (A, B) {
    fn record(&mut self, key: &str, value: f32) {
        self.0.record(key, value);
        self.1.record(key, value);
    }
}

impl<T: MetricsSink> MetricsSink for Option<T> {
    fn record(&mut self, key: &str, value: f32) {
        if let Some(sink) = self {
            sink.record(key, value);
        }
    }
}

/// Drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn record(&mut self, _key: &str, _value: f32) {}
}

/// Keeps every recorded value, one series per key.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    series: BTreeMap<String, Vec<f32>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn series(&self, key: &str) -> &[f32] {
        self.series.get(key).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn last(&self, key: &str) -> Option<f32> {
        self.series(key).last().copied()
    }

    pub fn mean(&self, key: &str) -> Option<f32> {
        let s = self.series(key);
        (!s.is_empty()).then(|| s.iter().sum::<f32>() / s.len() as f32)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(|k| k.as_str())
    }

    pub fn clear(&mut self) {
        self.series.clear();
    }
}

impl MetricsSink for MemorySink {
    fn record(&mut self, key: &str, value: f32) {
        self.series.entry(key.to_string()).or_default().push(value);
    }
}

/// Emits every scalar as a `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn record(&mut self, key: &str, value: f32) {
        debug!(target: "target_prop::metrics", key, value);
    }
}

/// A scalar sent to another thread, `step` counts the records of `key`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Record {
    pub key: String,
    pub step: usize,
    pub value: f32,
}

/// Sends records over a channel, for a plotting or logging thread.
/// Records are dropped once the receiver hangs up.
#[derive(Debug)]
pub struct ChannelSink {
    send: Sender<Record>,
    steps: HashMap<String, usize>,
}

impl ChannelSink {
    pub fn new(send: Sender<Record>) -> Self {
        Self {
            send,
            steps: HashMap::new(),
        }
    }

    pub fn unbounded() -> (Self, Receiver<Record>) {
        let (send, recv) = crossbeam::channel::unbounded();
        (Self::new(send), recv)
    }
}

impl MetricsSink for ChannelSink {
    fn record(&mut self, key: &str, value: f32) {
        let step = self.steps.entry(key.to_string()).or_insert(0);
        let record = Record {
            key: key.to_string(),
            step: *step,
            value,
        };
        *step += 1;
        if self.send.send(record).is_err() {
            debug!(key, "metrics receiver disconnected");
        }
    }
}
