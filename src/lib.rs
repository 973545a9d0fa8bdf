// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_possible_wrap)] // usize→i64 in tensor ops
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `base`/`bases`
#![allow(clippy::module_name_repetitions)] // AlignableModel in model.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::unused_self)] // &self for API consistency
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive

//! das-rs: Boundless distributed alignment search
//!
//! Searches for a linear subspace of a frozen language model's hidden
//! states that realizes a variable of a high-level causal model. The
//! subspace is a learned rotation plus a soft, boundary-parameterized mask
//! over the rotated coordinates; interchange interventions swap that
//! subspace between a base and a source input.
//!
//! ## Architecture
//!
//! - `rotation`: BoundaryMaskedRotation (orthogonal rotation + soft interval mask)
//! - `intervention`: Interchange in rotated space and position splicing
//! - `model`: AlignableBackend capability trait and the AlignableModel wrapper
//! - `forward_llama`: LLaMA forward pass with a hidden-state injection hook
//! - `masks`: Cached causal attention masks
//! - `data`: Tokenization, left padding and batch collation
//! - `tasks`: Task collaborators with known causal models
//! - `schedule`: Temperature annealing and learning-rate warmup
//! - `aligner`: Training loop, evaluation and checkpointing
//! - `checkpoint`: Alignment checkpoints in safetensors
//! - `metrics`: Injected metric sinks and accuracy bookkeeping
//! - `config`: DAS config, alignment site and run identity
//! - `experiment`: Runner for one alignment search

pub mod aligner;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod experiment;
pub mod forward_llama;
pub mod intervention;
pub mod masks;
pub mod metrics;
pub mod model;
pub mod rotation;
pub mod schedule;
pub mod tasks;

pub use aligner::{Aligner, AlignerPhase, TrainReport, TrainingArgs};
pub use checkpoint::{load_alignment, save_alignment, AlignmentCheckpoint, CheckpointPaths};
pub use config::{run_name, AlignmentConfig, AlignmentOverrides, DasConfig, TokenRange};
pub use data::{
    intervention_batches, prompt_batches, Batch, HfCodec, InterventionExample, PromptExample,
    TextExample, TokenCodec, IGNORE_INDEX,
};
pub use experiment::{
    AlignmentExperiment, ExperimentConfig, ExperimentOutcome, LoadedModel, RunSummary,
};
pub use forward_llama::{AlignableLlama, LlamaConfig};
pub use intervention::{splice_positions, Intervention};
pub use masks::create_causal_mask;
pub use metrics::{Accuracy, MemorySink, MetricSink, SinkSet, TextLogSink, TracingSink};
pub use model::{
    select_device, token_loss, AlignableBackend, AlignableModel, AlignmentOutput,
    HiddenStateSlice, Injection, ModelArchitecture, ModelFamily,
};
pub use rotation::{BoundaryMaskedRotation, RotationInit};
pub use schedule::{LinearWarmup, TemperatureSchedule};
pub use tasks::{task_for, Task, TaskData, TaskSizes};
