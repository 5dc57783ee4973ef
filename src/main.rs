use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use anyhow::{Context, Error, Result};
use clap::{Parser, ValueEnum};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::info;

use target_prop::datasets::{Blobs, BlobsParams, Dataset, DatasetBuilder};
use target_prop::dtp::{ChannelSink, MemorySink, MetricsSink, TracingSink};
use target_prop::networks::{self, Activation};
use target_prop::nn::optim::LearningRate;
use target_prop::{logging, Config, Dtp, HParams, InversionRegistry, Phase};

#[derive(ValueEnum, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
enum NetworkKind {
    #[default]
    Mlp,
    Lenet,
}

/// Everything a run needs, loadable from a single ron file.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
struct RunConfig {
    network: NetworkKind,
    activation: Activation,
    /// Hidden widths of the mlp.
    hidden: Vec<usize>,
    /// Conv channels of the lenet.
    channels: Vec<usize>,
    data: BlobsParams,
    hparams: HParams,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            network: NetworkKind::Mlp,
            activation: Activation::Elu,
            hidden: vec![256, 128],
            channels: vec![32, 64],
            data: BlobsParams::default(),
            hparams: HParams::default(),
        }
    }
}

/// Trains a classifier on synthetic data with difference target propagation.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// ron file holding a run config, missing fields take their defaults
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    epochs: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, value_enum)]
    network: Option<NetworkKind>,
    /// print the resolved config and exit
    #[arg(long)]
    dump_config: bool,
    /// write every recorded scalar to this file, one ron record per line
    #[arg(long)]
    metrics_out: Option<PathBuf>,
    /// log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log: String,
}

/// Keeps the last `k` entries of a per-layer list, padding with its last value.
fn fit<T: Copy>(values: &[T], k: usize) -> Vec<T> {
    match values.last() {
        Some(&last) if values.len() < k => values.iter().copied().pad_using(k, |_| last).collect(),
        _ => values[values.len().saturating_sub(k)..].to_vec(),
    }
}

/// Sizes the default per-layer schedule to a network with `layers` forward layers.
fn fit_defaults(hparams: &mut HParams, layers: usize) {
    let k = layers.saturating_sub(1);
    hparams.feedback_training_iterations = fit(&hparams.feedback_training_iterations, k);
    hparams.noise = fit(&hparams.noise, k);
    if let LearningRate::PerLayer(lrs) = &hparams.b_optim.lr {
        hparams.b_optim.lr = LearningRate::PerLayer(fit(lrs, k));
    }
}

fn run_epoch(
    dtp: &mut Dtp,
    data: &mut Blobs,
    phase: Phase,
    sink: &mut dyn MetricsSink,
) -> Result<()> {
    data.reset();
    if phase == Phase::Train {
        data.shuffle();
    }
    while let Some(batch) = data.next() {
        dtp.shared_step(&batch.x, &batch.labels, phase, sink)
            .with_context(|| format!("{phase} step failed"))?;
    }
    Ok(())
}

/// Drains the records of the returned sink into `path` on a separate thread,
/// until the sink is dropped.
fn spawn_metrics_writer(path: &Path) -> Result<(ChannelSink, JoinHandle<Result<()>>)> {
    let file = File::create(path).with_context(|| format!("unable to create {}", path.display()))?;
    let (sink, recv) = ChannelSink::unbounded();
    let handle = std::thread::spawn(move || -> Result<()> {
        let mut out = BufWriter::new(file);
        for record in recv.iter() {
            writeln!(out, "{}", ron::to_string(&record)?)?;
        }
        out.flush()?;
        Ok(())
    });
    Ok((sink, handle))
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init_tracing(&args.log)?;

    let mut run = RunConfig::default();
    if let Some(path) = &args.config {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read {}", path.display()))?;
        run.load_config(&text)?;
    }
    if let Some(network) = args.network {
        run.network = network;
    }
    if let Some(epochs) = args.epochs {
        run.hparams.max_epochs = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        run.hparams.batch_size = batch_size;
    }
    if let Some(seed) = args.seed {
        run.hparams.seed = seed;
        run.data.seed = seed;
    }
    run.data.train_batch_size = run.hparams.batch_size;

    let specs = match run.network {
        NetworkKind::Mlp => networks::mlp(&run.hidden, run.data.n_classes, run.activation),
        NetworkKind::Lenet => networks::lenet(&run.channels, run.data.n_classes, run.activation),
    };
    if args.config.is_none() {
        fit_defaults(&mut run.hparams, specs.len());
    }
    if args.dump_config {
        println!("{}", run.config());
        return Ok(());
    }

    let mut train = run.data.build_train()?;
    let mut val = run.data.build_val().transpose()?;
    let mut test = run.data.build_test().transpose()?;
    let (channel, writer) = match &args.metrics_out {
        Some(path) => {
            let (sink, handle) = spawn_metrics_writer(path)?;
            (Some(sink), Some(handle))
        }
        None => (None, None),
    };
    // every scalar of every batch, on top of the per-epoch summaries
    let mut stream = (TracingSink, channel);
    let registry = InversionRegistry::default();
    let mut dtp = Dtp::from_specs(&specs, &run.data.shape, run.hparams.clone(), &registry)
        .context("unable to build the model")?;
    info!(network = ?run.network, layers = specs.len(), examples = train.len(), "training");

    let patience = run.hparams.early_stopping_patience;
    let (mut best, mut stale) = (f32::NEG_INFINITY, 0);
    for epoch in 0..run.hparams.max_epochs {
        let mut sink = MemorySink::new();
        run_epoch(&mut dtp, &mut train, Phase::Train, &mut (&mut sink, &mut stream))?;
        let layer_losses = (0..specs.len())
            .filter_map(|i| sink.mean(&format!("train/F_loss[{i}]")))
            .map(|l| format!("{l:.4}"))
            .join(" ");
        info!(
            epoch,
            b_loss = sink.mean("train/B_loss"),
            f_loss = sink.mean("train/F_loss"),
            accuracy = sink.mean("train/accuracy"),
            layers = %layer_losses,
            "train"
        );

        if let Some(val) = val.as_mut() {
            let mut val_sink = MemorySink::new();
            run_epoch(&mut dtp, val, Phase::Validate, &mut (&mut val_sink, &mut stream))?;
            let acc = val_sink.mean("val/accuracy").unwrap_or(0.0);
            info!(epoch, loss = val_sink.mean("val/F_loss"), accuracy = acc, "validate");
            if acc > best {
                (best, stale) = (acc, 0);
            } else {
                stale += 1;
            }
            if patience > 0 && stale >= patience {
                info!(epoch, best, "early stopping");
                break;
            }
        }
        dtp.on_epoch_end();
    }

    let mut final_sink = MemorySink::new();
    if let Some(test) = test.as_mut() {
        run_epoch(&mut dtp, test, Phase::Test, &mut (&mut final_sink, &mut stream))?;
    }
    drop(stream);
    if let Some(handle) = writer {
        handle
            .join()
            .map_err(|_| Error::msg("metrics writer panicked"))?
            .context("unable to write metrics")?;
    }
    match final_sink.mean("test/accuracy") {
        Some(acc) => info!(accuracy = acc, best_val_accuracy = best, "test"),
        None => info!("no test split to evaluate"),
    }
    Ok(())
}

#[test]
fn test_fit_defaults() {
    assert_eq!(fit(&[1, 2, 3, 4, 5], 2), vec![4, 5]);
    assert_eq!(fit(&[1, 2], 4), vec![1, 2, 2, 2]);
    assert_eq!(fit::<u8>(&[], 0), Vec::<u8>::new());
    let mut hp = HParams::default();
    fit_defaults(&mut hp, 3);
    assert_eq!(hp.feedback_training_iterations, vec![55, 20]);
    assert_eq!(hp.noise, vec![0.2, 0.08]);
}
