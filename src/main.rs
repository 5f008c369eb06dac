use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueHint};
use ndarray::Axis;
use tracing::{info, warn};

use hebbscope::checkpoint::{load_weights, Checkpoint, LayerMapping};
use hebbscope::config::AppConfig;
use hebbscope::data::Split;
use hebbscope::error::HebbError;
use hebbscope::evaluator::{Evaluator, HebbianEvaluator, TrainableLayers};
use hebbscope::krotov::HebbianEngine;
use hebbscope::layers::Mode;
use hebbscope::model::{Model, ModelSpec};
use hebbscope::recorder::ActivationRecorder;
use hebbscope::visualize::Visualizer;

type DynError = Box<dyn std::error::Error>;

#[derive(Parser)]
#[command(author, version, about = "Hebbian pretraining, readout evaluation and activation rendering")]
struct Cli {
    /// JSON config; missing sections fall back to defaults
    #[arg(long, global = true, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Dataset directory holding the IDX files
    #[arg(long, global = true, value_hint = ValueHint::DirPath)]
    data: Option<PathBuf>,

    /// Use only the first N examples of each split
    #[arg(long, global = true)]
    limit: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train the first layer with the Krotov-Hopfield rule and save a checkpoint
    Pretrain(PretrainArgs),

    /// Fine-tune only the readout and print {"loss", "acc"}
    Evaluate(EvaluateArgs),

    /// Render the input, activated-unit weights and overlays for a batch
    Visualize(VisualizeArgs),
}

#[derive(Args)]
struct PretrainArgs {
    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    lr: Option<f32>,

    /// Destination checkpoint
    #[arg(long, default_value = "checkpoints/hebbian.hbck", value_hint = ValueHint::FilePath)]
    out: PathBuf,
}

#[derive(Args)]
struct EvaluateArgs {
    /// Pretrained checkpoint; without it the network starts from random init
    #[arg(long, value_hint = ValueHint::FilePath)]
    checkpoint: Option<PathBuf>,

    /// Layers to restore, as `name` or `source=target`, comma separated
    #[arg(long, value_delimiter = ',')]
    layers: Vec<LayerMapping>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    eval_every: Option<usize>,

    /// Layers left trainable, comma separated; defaults to the last one
    #[arg(long, value_delimiter = ',')]
    trainable: Vec<String>,

    /// Measure on the test split instead of the training data
    #[arg(long)]
    test: bool,

    /// Save the fine-tuned network here
    #[arg(long, value_hint = ValueHint::FilePath)]
    save: Option<PathBuf>,
}

#[derive(Args)]
struct VisualizeArgs {
    #[arg(long, value_hint = ValueHint::FilePath)]
    checkpoint: PathBuf,

    /// Layers to restore; defaults to every layer in the checkpoint
    #[arg(long, value_delimiter = ',')]
    layers: Vec<LayerMapping>,

    /// Number of test examples drawn for the batch
    #[arg(long, default_value_t = 16)]
    batch: usize,

    /// Render only this example of the batch
    #[arg(long)]
    example: Option<usize>,

    #[arg(long, value_hint = ValueHint::DirPath)]
    out: Option<PathBuf>,

    #[arg(long)]
    cutoff: Option<f32>,

    /// Keep units regardless of their weight energy
    #[arg(long)]
    no_filter: bool,

    /// Skip titles and tick labels even when built with `fonts`
    #[arg(long)]
    no_annotate: bool,
}

/// `explicit` is the `model` section of a `--config` file. It wins over the
/// spec stored in the checkpoint; without either the defaults apply.
fn restore(explicit: Option<&ModelSpec>, path: &Path, mappings: &[LayerMapping]) -> Result<Model, HebbError> {
    let ck = Checkpoint::load(path)?;
    let spec = match ck.spec {
        Some(_) => ck.resolve_spec(explicit)?,
        None => explicit.cloned().unwrap_or_default(),
    };
    let mut model = Model::from_spec(&spec)?;
    let mappings: Vec<LayerMapping> = if mappings.is_empty() {
        ck.layer_names().map(LayerMapping::same).collect()
    } else {
        mappings.to_vec()
    };
    load_weights(&mut model, &ck, &mappings)?;
    info!(path = %path.display(), layers = mappings.len(), "restored model");
    Ok(model)
}

fn pretrain(mut cfg: AppConfig, args: PretrainArgs) -> Result<(), DynError> {
    if let Some(e) = args.epochs {
        cfg.hebbian = cfg.hebbian.with_epochs(e);
    }
    if let Some(lr) = args.lr {
        cfg.hebbian = cfg.hebbian.with_lr(lr);
    }
    let mut loader = cfg.data.loader(Split::Train)?;
    let mut model = Model::from_spec(&cfg.model)?;
    let engine = HebbianEngine::new(cfg.hebbian.clone())?;
    engine.init_weights(&mut model)?;
    let history = engine.train(&mut model, &mut loader)?;
    info!(epochs = history.len(), final_change = history.last().copied(), "pretraining done");
    Checkpoint::from_model(&model).save(&args.out)?;
    Ok(())
}

fn evaluate(mut cfg: AppConfig, explicit: Option<&ModelSpec>, args: EvaluateArgs) -> Result<(), DynError> {
    if let Some(e) = args.epochs {
        cfg.evaluator = cfg.evaluator.with_epochs(e);
    }
    if let Some(e) = args.eval_every {
        cfg.evaluator = cfg.evaluator.with_eval_every(e);
    }
    if !args.trainable.is_empty() {
        cfg.evaluator = cfg.evaluator.with_trainable(TrainableLayers::Named(args.trainable));
    }

    let mut model = match &args.checkpoint {
        Some(path) => {
            let mappings = if args.layers.is_empty() {
                vec![LayerMapping::same(&cfg.hebbian.layer)]
            } else {
                args.layers
            };
            restore(explicit, path, &mappings)?
        }
        None => {
            warn!("no checkpoint given, evaluating a randomly initialized network");
            Model::from_spec(&cfg.model)?
        }
    };

    let train = cfg.data.loader(Split::Train)?;
    let mut evaluator = HebbianEvaluator::new(train, cfg.evaluator.clone());
    if args.test {
        evaluator = evaluator.with_eval_loader(cfg.data.loader(Split::Test)?);
    }
    let report = evaluator.run(&mut model)?;
    println!("{}", serde_json::to_string(&report)?);

    if let Some(out) = args.save {
        Checkpoint::from_model(&model).save(&out)?;
    }
    Ok(())
}

fn visualize(mut cfg: AppConfig, explicit: Option<&ModelSpec>, args: VisualizeArgs) -> Result<(), DynError> {
    let vis_cfg = &mut cfg.visualizer;
    if let Some(dir) = args.out {
        vis_cfg.out_dir = dir;
    }
    if let Some(c) = args.cutoff {
        vis_cfg.cutoff = c;
    }
    if args.no_filter {
        vis_cfg.filter_threshold = None;
    }
    if args.no_annotate {
        vis_cfg.annotate = false;
    }

    let mut model = restore(explicit, &args.checkpoint, &args.layers)?;
    let (batch, shape) = cfg.data.sample(Split::Test, args.batch)?;
    if let Some(only) = args.example.filter(|&i| i >= batch.len()) {
        return Err(HebbError::Config(format!(
            "example {only} is outside the batch of {}",
            batch.len()
        ))
        .into());
    }

    let mut recorder = ActivationRecorder::attach(&model, &cfg.visualizer.hook_layer)?;
    recorder.forward(&mut model, batch.inputs.clone(), Mode::Eval)?;
    let record = recorder
        .take()
        .ok_or_else(|| HebbError::Config("recorder captured nothing".into()))?;
    let weights = model.linear(&cfg.visualizer.weight_layer)?.weight_matrix()?;

    let visualizer = Visualizer::new(cfg.visualizer.clone());
    let mut rendered = 0usize;
    for (i, input) in batch.inputs.axis_iter(Axis(0)).enumerate() {
        if args.example.is_some_and(|only| only != i) {
            continue;
        }
        match visualizer.visualize_example(i, input, record.example(i)?, weights, shape) {
            Ok(art) => {
                rendered += 1;
                info!(example = i, label = batch.labels[i], overlays = art.overlays.len(), "rendered example");
            }
            Err(HebbError::EmptySelection(why)) => {
                warn!(example = i, %why, "nothing to render, skipping");
            }
            Err(e) => return Err(e.into()),
        }
    }
    info!(rendered, total = batch.len(), out_dir = %cfg.visualizer.out_dir.display(), "visualization done");
    Ok(())
}

fn main() -> Result<(), DynError> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut cfg = AppConfig::load_or_default(cli.config.as_deref())?;
    if let Some(dir) = cli.data {
        cfg.data.dir = dir;
    }
    if cli.limit.is_some() {
        cfg.data.limit = cli.limit;
    }

    let explicit = cli.config.is_some().then(|| cfg.model.clone());

    match cli.command {
        Command::Pretrain(args) => pretrain(cfg, args),
        Command::Evaluate(args) => evaluate(cfg, explicit.as_ref(), args),
        Command::Visualize(args) => visualize(cfg, explicit.as_ref(), args),
    }
}
