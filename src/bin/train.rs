//! PC decoder training binary.
//!
//! Trains a predictive coding decoder to generate points of a synthetic
//! dataset that lies on a low-dimensional manifold: latent codes
//! `z ~ N(0, I)` of size `internal_dim` are pushed through a fixed random
//! `tanh` projection into `output_dim`, plus a little Gaussian noise.
//! The decoder has to recover a latent representation by relaxation alone.
//!
//! Writes JSONL metrics (one event per line) and, optionally, the weights of
//! the best epoch.

use clap::Parser;
use ndarray::{Array2, Axis};
use pcx::checkpoint::{load_checkpoint, save_checkpoint};
use pcx::training::{batches, EarlyStopping, EpochMetrics};
use pcx::transform::{Snapshot, StalePolicy};
use pcx::{Config, PcDecoder, PcMode, PcResult, RandomKeyGenerator, Session, Tensor};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "pcx-train",
    about = "Train a predictive coding decoder on a synthetic manifold"
)]
struct Args {
    /// JSON training config; command-line flags override its fields
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output metrics file (JSONL)
    #[arg(long, default_value = "data/output/metrics.jsonl")]
    metrics_file: PathBuf,

    /// Checkpoint directory
    #[arg(long, default_value = "data/checkpoints")]
    checkpoint_dir: PathBuf,

    /// Save weights whenever the test MSE improves
    #[arg(long, default_value_t = false)]
    save_best_results: bool,

    /// Initialize weights from a checkpoint (node states are never saved)
    #[arg(long)]
    load_weights_from: Option<PathBuf>,

    /// Weight update schedule: pc or ppc
    #[arg(long)]
    pc_mode: Option<PcMode>,

    /// Relaxation iterations per batch
    #[arg(long)]
    t: Option<usize>,

    /// Number of training epochs
    #[arg(long)]
    epochs: Option<usize>,

    /// Mini-batch size
    #[arg(long)]
    batch_size: Option<usize>,

    /// Random seed for model, data and shuffling
    #[arg(long)]
    seed: Option<u64>,

    /// Training samples to generate
    #[arg(long, default_value_t = 2000)]
    train_samples: usize,

    /// Test samples to generate
    #[arg(long, default_value_t = 400)]
    test_samples: usize,

    /// Standard deviation of the additive noise
    #[arg(long, default_value_t = 0.05)]
    noise: f32,
}

impl Args {
    fn config(&self) -> PcResult<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_json_file(path)?,
            None => Config::default(),
        };
        if let Some(mode) = self.pc_mode {
            config.pc_mode = mode;
        }
        if let Some(t) = self.t {
            config.t = t;
        }
        if let Some(epochs) = self.epochs {
            config.epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Points `tanh(A z) + ε` with a fixed random `A: [output_dim, internal_dim]`.
fn manifold_dataset(
    config: &Config,
    samples: usize,
    noise: f32,
    projection: &Array2<f32>,
    rkg: &mut RandomKeyGenerator,
) -> PcResult<Tensor> {
    let z = rkg
        .normal(&[samples, config.model.internal_dim])
        .into_dimensionality::<ndarray::Ix2>()
        .map_err(|e| pcx::PcError::ShapeMismatch(e.to_string()))?;
    let points = z.dot(&projection.t()).mapv(f32::tanh);
    let eps = rkg.normal(&[samples, config.model.output_dim]) * noise;
    Ok(points.into_dyn() + eps)
}

fn write_event(file: &mut fs::File, event: serde_json::Value) -> PcResult<()> {
    writeln!(file, "{event}")?;
    Ok(())
}

fn run(args: &Args) -> PcResult<()> {
    let config = args.config()?;

    if let Some(parent) = args.metrics_file.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut metrics_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&args.metrics_file)?;

    let mut data_rkg = RandomKeyGenerator::new(config.seed.wrapping_add(1));
    let projection = data_rkg
        .normal(&[config.model.output_dim, config.model.internal_dim])
        .into_dimensionality::<ndarray::Ix2>()
        .map_err(|e| pcx::PcError::ShapeMismatch(e.to_string()))?;
    let train = manifold_dataset(&config, args.train_samples, args.noise, &projection, &mut data_rkg)?;
    let test = manifold_dataset(&config, args.test_samples, args.noise, &projection, &mut data_rkg)?;

    let mut session = Session::from_config(&config)?;
    if let Some(path) = &args.load_weights_from {
        let data = load_checkpoint(&mut session.model, path)?;
        info!(epoch = data.epoch, mse = data.mse, "initialized weights from checkpoint");
    }

    info!(
        dims = ?session.model.dims(),
        mode = %config.pc_mode,
        t = config.t,
        batch_size = config.batch_size,
        epochs = config.epochs,
        train = train.len_of(Axis(0)),
        test = test.len_of(Axis(0)),
        "pc decoder training"
    );
    write_event(
        &mut metrics_file,
        serde_json::json!({
            "type": "start",
            "config": config,
            "dims": session.model.dims(),
        }),
    )?;

    let mut step = Snapshot::new(session, |s: &mut Session<PcDecoder>, batch: &Tensor| {
        s.train_batch(batch)
    })
    .with_policy(StalePolicy::Recompile);

    let mut stopper = EarlyStopping::new(config.early_stop_patience);
    let mut shuffler = RandomKeyGenerator::new(config.seed.wrapping_add(2));
    let start = Instant::now();

    for epoch in 1..=config.epochs {
        if config.extend_hidden_layers
            && epoch > 1
            && (epoch - 1) % config.extend_hidden_layers_every_n_epochs == 0
            && step.bound().model.num_hidden_layers() < config.model.num_hidden_layers
        {
            step.bound_mut().grow()?;
            write_event(
                &mut metrics_file,
                serde_json::json!({
                    "type": "grow",
                    "epoch": epoch,
                    "dims": step.bound().model.dims(),
                }),
            )?;
        }

        let mut history = Vec::new();
        for batch in batches(&train, config.batch_size, Some(&mut shuffler))? {
            history.push(step.call(&batch)?);
        }
        let train_metrics =
            EpochMetrics::from_batches(&history, config.use_last_n_batches_to_compute_metrics);
        let test_metrics = step.bound_mut().test_epoch(&test, config.batch_size)?;
        let improved = stopper.update(test_metrics.mse);
        if !train_metrics.energy.is_finite() {
            warn!(epoch, energy = train_metrics.energy, "training energy diverged");
        }

        info!(
            epoch,
            train_mse = train_metrics.mse,
            train_energy = train_metrics.energy,
            test_mse = test_metrics.mse,
            best = stopper.best(),
            elapsed = start.elapsed().as_secs_f32(),
            "epoch complete"
        );
        write_event(
            &mut metrics_file,
            serde_json::json!({
                "type": "epoch",
                "epoch": epoch,
                "train": train_metrics,
                "test": test_metrics,
                "best_test_mse": stopper.best(),
                "compilations": step.compilations(),
                "elapsed_secs": start.elapsed().as_secs_f32(),
            }),
        )?;

        if improved && args.save_best_results {
            let path = args.checkpoint_dir.join("best.json");
            save_checkpoint(&step.bound().model, &path, epoch, test_metrics.mse)?;
            write_event(
                &mut metrics_file,
                serde_json::json!({
                    "type": "checkpoint",
                    "epoch": epoch,
                    "path": path.to_string_lossy(),
                }),
            )?;
        }
        metrics_file.flush()?;

        if stopper.should_stop() {
            info!(
                patience = config.early_stop_patience,
                best = stopper.best(),
                "early stopping"
            );
            break;
        }
    }

    let mut session = step.into_bound();
    let sample = batches(&test, config.batch_size, None)?;
    if let Some(first) = sample.first() {
        let states = session.internal_states(first)?;
        write_event(
            &mut metrics_file,
            serde_json::json!({
                "type": "internal_states",
                "shape": states.shape(),
                "mean": states.mean().unwrap_or(0.0),
            }),
        )?;
    }
    metrics_file.flush()?;
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    if let Err(e) = run(&args) {
        error!(error = %e, "training failed");
        std::process::exit(1);
    }
}
