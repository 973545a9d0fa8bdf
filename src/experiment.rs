//! Experiment runner for one alignment search
//!
//! Resolves the alignment site and run identity, skips runs that already
//! finished, then samples task data, loads the model and drives the
//! [`Aligner`] through prealign evaluation and training.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{info, warn};

use crate::aligner::{Aligner, TrainReport, TrainingArgs};
use crate::checkpoint::{load_alignment, CheckpointPaths};
use crate::config::{run_name, AlignmentConfig, AlignmentOverrides, DasConfig};
use crate::data::{intervention_batches, prompt_batches, TokenCodec};
use crate::metrics::MetricSink;
use crate::model::{AlignableModel, ModelArchitecture};
use crate::tasks::{Task, TaskSizes};

pub const RUN_SUMMARY_FILE: &str = "run_summary.json";

/// Configuration for one alignment run
#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    /// HuggingFace model ID or local model directory
    pub model_id: String,
    /// Backend the loader builds for `model_id`
    pub architecture: ModelArchitecture,
    pub task_name: String,
    /// Seeds task sampling; part of the run identity
    pub seed: u64,
    /// Parent directory of all run directories
    pub output_dir: PathBuf,
    pub overrides: AlignmentOverrides,
    /// Train the alignment after the prealign check
    pub do_align: bool,
    pub train_batch_size: usize,
    pub eval_batch_size: usize,
    pub sizes: TaskSizes,
    pub training: TrainingArgs,
    /// Start from a saved alignment instead of a fresh rotation
    pub restore_from: Option<PathBuf>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            model_id: "../alpaca_7b/".to_string(),
            architecture: ModelArchitecture::Llama,
            task_name: "price_tagging_lb".to_string(),
            seed: 42,
            output_dir: PathBuf::from("./results_test/"),
            overrides: AlignmentOverrides::default(),
            do_align: false,
            train_batch_size: 128,
            eval_batch_size: 128,
            sizes: TaskSizes {
                n_train: 10_000,
                n_eval: 1_000,
            },
            training: TrainingArgs::default(),
            restore_from: None,
        }
    }
}

/// Model and tokenizer handed back by the loader
pub struct LoadedModel {
    pub model: AlignableModel,
    pub codec: Box<dyn TokenCodec>,
}

/// What a finished run records in `run_summary.json`
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_name: String,
    pub model_id: String,
    pub task_name: String,
    pub seed: u64,
    pub layer: usize,
    pub token_range: [usize; 2],
    pub prealign_accuracy: f64,
    pub trainable_parameters: usize,
    pub train: Option<TrainReport>,
}

#[derive(Debug, Clone)]
pub enum ExperimentOutcome {
    /// `rotate-last` already existed; nothing was loaded or trained
    Skipped { run_name: String },
    Completed(RunSummary),
}

/// One alignment run with a resolved site and identity
pub struct AlignmentExperiment {
    config: ExperimentConfig,
    alignment: AlignmentConfig,
    run_name: String,
    paths: CheckpointPaths,
}

impl AlignmentExperiment {
    /// Resolve the alignment site from `das_config` plus the CLI overrides.
    ///
    /// Nothing is written to disk here, so a rejected configuration leaves
    /// no run directory behind.
    pub fn new(config: ExperimentConfig, das_config: &DasConfig) -> Result<Self> {
        config.architecture.ensure_backend()?;
        anyhow::ensure!(config.train_batch_size > 0, "train_batch_size must be positive");
        anyhow::ensure!(config.eval_batch_size > 0, "eval_batch_size must be positive");
        config.training.validate()?;

        let alignment = das_config.resolve(&config.overrides)?;
        let run_name = run_name(&config.model_id, &config.task_name, config.seed, &alignment);
        let paths = CheckpointPaths::for_run(&config.output_dir, &run_name);
        Ok(Self {
            config,
            alignment,
            run_name,
            paths,
        })
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn alignment(&self) -> &AlignmentConfig {
        &self.alignment
    }

    pub fn run_name(&self) -> &str {
        &self.run_name
    }

    pub fn run_dir(&self) -> &Path {
        self.paths.dir()
    }

    /// A final checkpoint exists for this identity
    pub fn is_complete(&self) -> bool {
        self.paths.has_last()
    }

    /// Run the experiment.
    ///
    /// `load` is only called when the run has not finished before; it gets
    /// the resolved alignment site.
    pub fn run<L>(&self, load: L, task: &dyn Task, sink: &mut dyn MetricSink) -> Result<ExperimentOutcome>
    where
        L: FnOnce(AlignmentConfig) -> Result<LoadedModel>,
    {
        if self.is_complete() {
            info!(
                "Final checkpoint exists for run {}, skipping",
                self.run_name
            );
            return Ok(ExperimentOutcome::Skipped {
                run_name: self.run_name.clone(),
            });
        }

        info!("Starting alignment run {}", self.run_name);
        let config_path = DasConfig::from_alignment(&self.alignment).save(self.run_dir())?;
        info!("Saved resolved DAS config to {}", config_path.display());

        let LoadedModel { mut model, codec } = load(self.alignment)?;
        anyhow::ensure!(
            *model.alignment() == self.alignment,
            "Loaded model is aligned at {}, expected {}",
            model.alignment(),
            self.alignment
        );
        if let Some(path) = &self.config.restore_from {
            load_alignment(path, model.device())?.apply_to(model.rotation_mut())?;
        }

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let data = task
            .sample(self.config.sizes, &mut rng)
            .with_context(|| format!("Failed to sample task {}", task.name()))?
            .encode(codec.as_ref(), task.pad_to())?;

        let device = model.device().clone();
        let prealign = prompt_batches(&data.prealign, self.config.eval_batch_size, &device)?;
        let train = intervention_batches(&data.train, self.config.train_batch_size, &device)?;
        let dev = intervention_batches(&data.dev, self.config.eval_batch_size, &device)?;
        let test = intervention_batches(&data.test, self.config.eval_batch_size, &device)?;

        let trainable_parameters = model.trainable_parameter_count();
        let mut aligner = Aligner::new(
            &mut model,
            codec.as_ref(),
            sink,
            self.paths.clone(),
            self.run_name.clone(),
        )
        .with_max_new_tokens(self.config.training.max_new_tokens);

        let prealign_accuracy = aligner.prealign_eval(&prealign)?;
        let train_report = if self.config.do_align {
            Some(aligner.train(&train, &dev, &test, &self.config.training)?)
        } else {
            warn!("Alignment training disabled (do_align = false)");
            None
        };

        let range = self.alignment.token_range();
        let summary = RunSummary {
            run_name: self.run_name.clone(),
            model_id: self.config.model_id.clone(),
            task_name: self.config.task_name.clone(),
            seed: self.config.seed,
            layer: self.alignment.layer(),
            token_range: [range.start, range.end],
            prealign_accuracy,
            trainable_parameters,
            train: train_report,
        };
        let summary_path = self.run_dir().join(RUN_SUMMARY_FILE);
        std::fs::write(&summary_path, serde_json::to_string_pretty(&summary)?)
            .with_context(|| format!("Failed to write {}", summary_path.display()))?;
        info!("Run summary saved to {}", summary_path.display());

        Ok(ExperimentOutcome::Completed(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &Path) -> ExperimentConfig {
        ExperimentConfig {
            model_id: "models/tiny-llama/".to_string(),
            task_name: "price_tagging_lb".to_string(),
            seed: 7,
            output_dir: dir.to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn test_identity_follows_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let das = DasConfig {
            das_layer: 3,
            das_token_range: [10, 12],
        };
        let mut cfg = config(dir.path());
        cfg.overrides.token_end = 14;
        let experiment = AlignmentExperiment::new(cfg, &das).unwrap();
        assert_eq!(
            experiment.run_name(),
            "model:tiny-llama_task:price_tagging_lb_seed:7_intl:3_intr:10,14"
        );
        assert_eq!(experiment.run_dir(), dir.path().join(experiment.run_name()));
        assert!(!experiment.is_complete());
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.train_batch_size = 0;
        assert!(AlignmentExperiment::new(cfg, &DasConfig::default()).is_err());

        let mut cfg = config(dir.path());
        cfg.overrides.token_start = 90;
        assert!(AlignmentExperiment::new(cfg, &DasConfig::default()).is_err());
    }

    #[test]
    fn test_unsupported_architecture_leaves_no_run_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.architecture = ModelArchitecture::T5;
        let err = AlignmentExperiment::new(cfg, &DasConfig::default())
            .err()
            .unwrap();
        assert!(err.to_string().contains("No pretrained backend"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
