//! das-rs CLI: Boundless distributed alignment search

use anyhow::Result;
use clap::{Parser, ValueEnum};
use das_rs::{
    select_device, task_for, AlignableModel, AlignmentExperiment, AlignmentOverrides, DasConfig,
    ExperimentConfig, ExperimentOutcome, HfCodec, LoadedModel, ModelArchitecture, RotationInit,
    SinkSet, TaskSizes, TextLogSink, TracingSink, TrainingArgs,
};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum InitArg {
    /// Start from the identity rotation
    Identity,
    /// Start from a random orthogonal rotation seeded by --seed
    Random,
}

#[derive(Parser)]
#[command(name = "das-rs")]
#[command(about = "Boundless distributed alignment search in Rust")]
#[command(version)]
struct Cli {
    /// Model ID from `HuggingFace` or a local model directory
    #[arg(short, long, default_value = "../alpaca_7b/")]
    model: String,

    /// Model type: llama or t5
    #[arg(long, default_value = "llama")]
    model_type: String,

    /// Task: price_tagging_{lb,ub} or continent_matching_{continent_map,output_rep}
    #[arg(long, default_value = "price_tagging_lb")]
    task_name: String,

    /// Output directory; each run gets its own subdirectory
    #[arg(short, long)]
    output_dir: PathBuf,

    #[arg(long, default_value_t = 128)]
    train_batch_size: usize,

    #[arg(long, default_value_t = 128)]
    eval_batch_size: usize,

    /// Learning rate of the rotation
    #[arg(long, default_value_t = 0.01)]
    lr: f64,

    /// Learning rate of the interval boundaries
    #[arg(long, default_value_t = 1e-2)]
    boundary_lr: f64,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(long, default_value_t = 1)]
    gradient_accumulation_steps: usize,

    #[arg(long, default_value_t = 10)]
    epochs: usize,

    /// Warmup as a fraction of all optimizer updates
    #[arg(long, default_value_t = 0.1)]
    warm_up: f64,

    #[arg(long, default_value_t = 10)]
    log_step: usize,

    #[arg(long, default_value_t = 500)]
    valid_steps: usize,

    #[arg(long, default_value_t = 50.0)]
    temperature_start: f64,

    #[arg(long, default_value_t = 0.1)]
    temperature_end: f64,

    /// Train the alignment (otherwise only the prealign check runs)
    #[arg(long)]
    do_align: bool,

    #[arg(long, default_value_t = 10_000)]
    n_training_examples: usize,

    #[arg(long, default_value_t = 1_000)]
    n_eval_examples: usize,

    /// Override the layer in das_config (ignored when negative)
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    layer: i64,

    /// Override the token range start in das_config (ignored when negative)
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    token_start: i64,

    /// Override the token range end in das_config (ignored when negative)
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    token_end: i64,

    /// Initial rotation
    #[arg(long, value_enum, default_value_t = InitArg::Identity)]
    rotation_init: InitArg,

    /// Resume from a saved alignment checkpoint
    #[arg(long)]
    restore: Option<PathBuf>,

    /// Use BF16 weights on GPU
    #[arg(long)]
    bf16: bool,

    /// Force CPU mode (slower but avoids CUDA issues)
    #[arg(long)]
    cpu: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Fail fast on unknown names before touching any weights
    let architecture = ModelArchitecture::from_model_type(&cli.model_type)?;
    architecture.ensure_backend()?;
    let task = task_for(&cli.task_name, architecture.family())?;
    let das_config = DasConfig::locate(&cli.model)?;

    let config = ExperimentConfig {
        model_id: cli.model.clone(),
        architecture,
        task_name: cli.task_name.clone(),
        seed: cli.seed,
        output_dir: cli.output_dir.clone(),
        overrides: AlignmentOverrides {
            layer: cli.layer,
            token_start: cli.token_start,
            token_end: cli.token_end,
        },
        do_align: cli.do_align,
        train_batch_size: cli.train_batch_size,
        eval_batch_size: cli.eval_batch_size,
        sizes: TaskSizes {
            n_train: cli.n_training_examples,
            n_eval: cli.n_eval_examples,
        },
        training: TrainingArgs {
            lr: cli.lr,
            boundary_lr: cli.boundary_lr,
            warm_up: cli.warm_up,
            epochs: cli.epochs,
            gradient_accumulation_steps: cli.gradient_accumulation_steps,
            log_step: cli.log_step,
            valid_steps: cli.valid_steps,
            temperature_start: cli.temperature_start,
            temperature_end: cli.temperature_end,
            ..Default::default()
        },
        restore_from: cli.restore.clone(),
    };
    let experiment = AlignmentExperiment::new(config, &das_config)?;

    println!("=== das-rs: Boundless distributed alignment search ===");
    println!("Model:  {}", cli.model);
    println!("Task:   {}", cli.task_name);
    println!("Site:   {}", experiment.alignment());
    println!("Run:    {}", experiment.run_dir().display());
    if cli.cpu {
        println!("Mode:   CPU (forced)");
    }

    if experiment.is_complete() {
        println!("\nRun already finished, nothing to do.");
        return Ok(());
    }

    let init = match cli.rotation_init {
        InitArg::Identity => RotationInit::Identity,
        InitArg::Random => RotationInit::Random { seed: cli.seed },
    };
    let mut sink = SinkSet::new()
        .with(TracingSink)
        .with(TextLogSink::new(experiment.run_dir())?);

    let outcome = experiment.run(
        |alignment| {
            let (device, dtype) = select_device(cli.cpu, cli.bf16);
            info!("Loading tokenizer...");
            let codec = HfCodec::from_pretrained(&cli.model)?;
            info!("Loading model...");
            let model =
                AlignableModel::from_pretrained(&cli.model, architecture, alignment, init, &device, dtype)?;
            Ok(LoadedModel {
                model,
                codec: Box::new(codec),
            })
        },
        task.as_ref(),
        &mut sink,
    )?;

    match outcome {
        ExperimentOutcome::Skipped { run_name } => {
            println!("\nRun {run_name} already finished, nothing to do.");
        }
        ExperimentOutcome::Completed(summary) => {
            println!("\n=== Results ===");
            println!("Prealign accuracy: {:.2}", summary.prealign_accuracy);
            if let Some(report) = &summary.train {
                if let Some(best) = report.best_dev_accuracy {
                    println!("Best dev accuracy: {best:.2}");
                }
                println!("Test accuracy:     {:.2}", report.test_accuracy);
                println!(
                    "Boundaries:        [{:.3}, {:.3}] at temperature {:.3}",
                    report.boundaries[0], report.boundaries[1], report.temperature
                );
            }
        }
    }

    Ok(())
}
