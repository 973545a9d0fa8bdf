//! Integration tests for das-rs
//!
//! Everything here runs on CPU against toy models with random weights.
//! Tests marked with #[ignore] need a model download.
//! Run them explicitly with: cargo test --ignored

use std::cell::Cell;
use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor, D};
use das_rs::checkpoint::{load_alignment, LAST_CHECKPOINT};
use das_rs::experiment::RUN_SUMMARY_FILE;
use das_rs::intervention::fixed_mask;
use das_rs::{
    intervention_batches, prompt_batches, AlignableBackend, AlignableLlama, AlignableModel,
    Aligner, AlignmentConfig, AlignmentExperiment, AlignmentOverrides, CheckpointPaths, DasConfig,
    ExperimentConfig, ExperimentOutcome, HiddenStateSlice, Injection, Intervention,
    InterventionExample, LlamaConfig, LoadedModel, MemorySink, ModelArchitecture, ModelFamily,
    RotationInit, Task, TaskData, TaskSizes, TextExample, TokenCodec, TrainingArgs,
};
use rand::rngs::StdRng;
use rand::Rng;

const WORDS: &[&str] = &["<pad>", "a", "b", "c", "d", "Yes", "No"];

/// Whitespace tokenizer over [`WORDS`]; `<pad>` is the only special token
struct WordCodec {
    vocab: HashMap<&'static str, u32>,
}

impl WordCodec {
    fn new() -> Self {
        let vocab = WORDS
            .iter()
            .enumerate()
            .map(|(i, w)| (*w, i as u32))
            .collect();
        Self { vocab }
    }
}

impl TokenCodec for WordCodec {
    fn encode(&self, text: &str, _add_special_tokens: bool) -> Result<Vec<u32>> {
        text.split_whitespace()
            .map(|w| self.token_id(w).with_context(|| format!("unknown word {w}")))
            .collect()
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        let words: Vec<&str> = ids
            .iter()
            .filter(|&&id| !(skip_special_tokens && id == 0))
            .map(|&id| WORDS.get(id as usize).copied().unwrap_or("?"))
            .collect();
        Ok(words.join(" "))
    }

    fn token_id(&self, token: &str) -> Option<u32> {
        self.vocab.get(token).copied()
    }

    fn pad_id(&self) -> u32 {
        0
    }
}

/// "Is the first letter the same as the last?" over three-letter prompts
struct SameLetterTask;

impl SameLetterTask {
    fn prompt(rng: &mut StdRng) -> (String, bool) {
        let letters = ["a", "b", "c", "d"];
        let picks: Vec<&str> = (0..3).map(|_| letters[rng.gen_range(0..4)]).collect();
        (picks.join(" "), picks[0] == picks[2])
    }

    fn answer(same: bool) -> &'static str {
        if same {
            "Yes"
        } else {
            "No"
        }
    }
}

impl Task for SameLetterTask {
    fn name(&self) -> &str {
        "same_letter"
    }

    fn pad_to(&self) -> usize {
        4
    }

    fn sample(&self, sizes: TaskSizes, rng: &mut StdRng) -> Result<TaskData> {
        let prealign = (0..sizes.n_eval)
            .map(|_| {
                let (prompt, same) = Self::prompt(rng);
                TextExample::plain(prompt, Self::answer(same))
            })
            .collect();
        let mut interchange = |n: usize| -> Vec<TextExample> {
            (0..n)
                .map(|_| {
                    let (base, _) = Self::prompt(rng);
                    let (source, same) = Self::prompt(rng);
                    TextExample::interchange(base, source, Self::answer(same), 0)
                })
                .collect()
        };
        Ok(TaskData {
            prealign,
            train: interchange(sizes.n_train),
            dev: interchange(sizes.n_eval),
            test: interchange(sizes.n_eval),
        })
    }
}

fn toy_config() -> LlamaConfig {
    LlamaConfig {
        hidden_size: 8,
        intermediate_size: 16,
        num_attention_heads: 2,
        num_key_value_heads: None,
        num_hidden_layers: 2,
        vocab_size: WORDS.len(),
        rope_theta: 10_000.0,
        rms_norm_eps: 1e-6,
        max_position_embeddings: 8,
        tie_word_embeddings: false,
    }
}

fn toy_model() -> Result<AlignableModel> {
    let device = Device::Cpu;
    let backend = AlignableLlama::random(toy_config(), 11, &device)?;
    AlignableModel::new(
        Box::new(backend),
        AlignmentConfig::new(1, 0, 1)?,
        RotationInit::Random { seed: 5 },
        &device,
    )
}

fn ids(rows: &[[u32; 4]]) -> Tensor {
    let flat: Vec<u32> = rows.iter().flatten().copied().collect();
    Tensor::from_vec(flat, (rows.len(), 4), &Device::Cpu).unwrap()
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

/// With a hard mask over rotated dims [0, 4) the intervened forward equals
/// a manual rotate / mix / unrotate / splice of the same hidden states.
#[test]
fn test_intervened_logits_match_manual_splice() {
    let mut model = toy_model().unwrap();
    model.rotation().set_boundaries([0.5, 0.5]).unwrap();
    model.rotation_mut().set_temperature(1e-4);
    model.set_training(false);

    let base = ids(&[[1, 2, 3, 4], [4, 3, 2, 1]]);
    let source = ids(&[[2, 2, 1, 3], [3, 1, 4, 4]]);

    let slice = model.forward_source(&source).unwrap();
    let intervened = model
        .forward_intervened(&base, &slice, &[0, 0], None)
        .unwrap()
        .logits;

    let backend = model.backend();
    let q = model.rotation().rotation_matrix().unwrap();
    let mask = fixed_mask(8, 0..4, &Device::Cpu).unwrap();
    let base_slice = backend.forward_hidden_states(&base, 1).unwrap()[1]
        .narrow(1, 0, 1)
        .unwrap();
    let source_slice = backend.forward_hidden_states(&source, 1).unwrap()[1]
        .narrow(1, 0, 1)
        .unwrap();
    let rotated_base = base_slice.broadcast_matmul(&q).unwrap();
    let rotated_source = source_slice.broadcast_matmul(&q).unwrap();
    let mixed = (rotated_source.broadcast_mul(&mask).unwrap()
        + rotated_base
            .broadcast_mul(&mask.affine(-1.0, 1.0).unwrap())
            .unwrap())
    .unwrap();
    let replacement = mixed
        .broadcast_matmul(&q.t().unwrap().contiguous().unwrap())
        .unwrap();

    let replace = |_: &Tensor| -> Result<Tensor> { Ok(replacement.clone()) };
    let injection = Injection {
        layer: 1,
        span: 0..1,
        replace: &replace,
    };
    let manual = backend
        .forward_with_injection(&base, None, Some(&injection))
        .unwrap();

    assert_eq!(intervened.dims(), &[2, 4, WORDS.len()]);
    assert!(max_abs_diff(&intervened, &manual) < 1e-4);

    // The intervention is not a no-op: plain logits differ at the last position
    let plain = model.forward_plain(&base, None).unwrap().logits;
    let last = |t: &Tensor| t.i((.., 3, ..)).unwrap();
    assert!(max_abs_diff(&last(&plain), &last(&intervened)) > 0.0);
}

fn two_examples() -> Vec<InterventionExample> {
    vec![
        InterventionExample {
            base_input_ids: vec![1, 2, 3, 4],
            source_input_ids: vec![2, 2, 1, 2],
            intervention_id: 0,
            target_label: 5,
        },
        InterventionExample {
            base_input_ids: vec![4, 3, 2, 1],
            source_input_ids: vec![3, 1, 4, 4],
            intervention_id: 0,
            target_label: 6,
        },
    ]
}

#[test]
fn test_one_training_step_has_finite_loss() {
    let mut model = toy_model().unwrap();
    let codec = WordCodec::new();
    let mut sink = MemorySink::new();
    let dir = tempfile::tempdir().unwrap();

    let train = intervention_batches(&two_examples(), 2, &Device::Cpu).unwrap();
    let args = TrainingArgs {
        epochs: 1,
        log_step: 1,
        ..Default::default()
    };

    let checkpoints = CheckpointPaths::for_run(dir.path(), "toy");
    let mut aligner = Aligner::new(&mut model, &codec, &mut sink, checkpoints.clone(), "toy");
    let report = aligner.train(&train, &[], &[], &args).unwrap();

    assert_eq!(report.total_steps, 1);
    assert_eq!(report.optimizer_steps, 1);
    assert!(report.last_loss.unwrap().is_finite());
    assert_eq!(report.test_accuracy, 0.0);
    assert_eq!(sink.train_steps.len(), 1);

    // The saved alignment restores into a fresh rotation
    let saved = load_alignment(&checkpoints.last(), &Device::Cpu).unwrap();
    let mut fresh = toy_model().unwrap();
    saved.apply_to(fresh.rotation_mut()).unwrap();
    let restored = fresh.rotation().rotation_matrix().unwrap();
    let trained = model.rotation().rotation_matrix().unwrap();
    assert!(max_abs_diff(&restored, &trained) < 1e-6);
}

/// After one training step, base and source states that differ only in
/// rotated dims [0, 4) splice exactly: the intervened logits equal a forward
/// with the spliced state injected, and swapping dims [4, 8) is a no-op.
#[test]
fn test_trained_rotation_swaps_only_masked_dims() {
    let mut model = toy_model().unwrap();
    let codec = WordCodec::new();
    let mut sink = MemorySink::new();
    let dir = tempfile::tempdir().unwrap();
    let device = Device::Cpu;

    let train = intervention_batches(&two_examples(), 2, &device).unwrap();
    let args = TrainingArgs {
        epochs: 1,
        log_step: 1,
        ..Default::default()
    };
    let untrained = model.rotation().rotation_matrix().unwrap();
    {
        let checkpoints = CheckpointPaths::for_run(dir.path(), "splice");
        let mut aligner = Aligner::new(&mut model, &codec, &mut sink, checkpoints, "splice");
        let report = aligner.train(&train, &[], &[], &args).unwrap();
        assert_eq!(report.optimizer_steps, 1);
    }
    let q = model.rotation().rotation_matrix().unwrap();
    assert!(max_abs_diff(&untrained, &q) > 0.0);

    // Hard masks: id 0 covers rotated dims [0, 4), id 1 covers [4, 8)
    model.rotation().set_boundaries([0.5, 1.0]).unwrap();
    model.rotation_mut().set_temperature(1e-4);
    model.set_training(false);

    let base = ids(&[[1, 2, 3, 4], [4, 3, 2, 1]]);
    let other = ids(&[[2, 2, 1, 3], [3, 1, 4, 4]]);
    let base_slice = model.forward_source(&base).unwrap();
    let other_slice = model.forward_source(&other).unwrap();

    // Source = base with rotated dims [0, 4) taken from another input
    let low = fixed_mask(8, 0..4, &device).unwrap();
    let rotation = model.rotation();
    let rotated_base = rotation.rotate(&base_slice.tensor).unwrap();
    let rotated_other = rotation.rotate(&other_slice.tensor).unwrap();
    let rotated_source = (rotated_other.broadcast_mul(&low).unwrap()
        + rotated_base
            .broadcast_mul(&low.affine(-1.0, 1.0).unwrap())
            .unwrap())
    .unwrap();
    let source_state = rotation.unrotate(&rotated_source).unwrap();
    let source = HiddenStateSlice {
        tensor: source_state.clone(),
        ..base_slice.clone()
    };

    // The replacement keeps base's rotated dims outside the mask
    let mask = rotation.batch_mask(&[0, 0]).unwrap();
    let spliced = Intervention::apply(&base_slice.tensor, &source.tensor, rotation, &mask).unwrap();
    let rotated_spliced = rotation.rotate(&spliced).unwrap();
    let dims = |t: &Tensor, start: usize| t.narrow(2, start, 4).unwrap();
    assert!(max_abs_diff(&dims(&rotated_spliced, 0), &dims(&rotated_other, 0)) < 1e-4);
    assert!(max_abs_diff(&dims(&rotated_spliced, 4), &dims(&rotated_base, 4)) < 1e-4);

    let intervened = model
        .forward_intervened(&base, &source, &[0, 0], None)
        .unwrap()
        .logits;
    let replace = |_: &Tensor| -> Result<Tensor> { Ok(source_state.clone()) };
    let injection = Injection {
        layer: 1,
        span: 0..1,
        replace: &replace,
    };
    let manual = model
        .backend()
        .forward_with_injection(&base, None, Some(&injection))
        .unwrap();
    let last = |t: &Tensor| t.i((.., 3, ..)).unwrap();
    assert!(max_abs_diff(&last(&intervened), &last(&manual)) < 1e-4);

    // Base and source agree on rotated dims [4, 8)
    let unchanged = model
        .forward_intervened(&base, &source, &[1, 1], None)
        .unwrap()
        .logits;
    let plain = model.forward_plain(&base, None).unwrap().logits;
    assert!(max_abs_diff(&unchanged, &plain) < 1e-4);
}

#[test]
fn test_prealign_on_empty_dataset() {
    let mut model = toy_model().unwrap();
    let codec = WordCodec::new();
    let mut sink = MemorySink::new();
    let dir = tempfile::tempdir().unwrap();
    let batches = prompt_batches(&[], 4, &Device::Cpu).unwrap();
    assert!(batches.is_empty());

    let mut aligner = Aligner::new(
        &mut model,
        &codec,
        &mut sink,
        CheckpointPaths::for_run(dir.path(), "empty"),
        "empty",
    );
    assert_eq!(aligner.prealign_eval(&batches).unwrap(), 0.0);
}

fn experiment_config(output_dir: &Path) -> ExperimentConfig {
    ExperimentConfig {
        model_id: "toy/tiny-llama".to_string(),
        architecture: ModelArchitecture::Llama,
        task_name: "same_letter".to_string(),
        seed: 3,
        output_dir: output_dir.to_path_buf(),
        overrides: AlignmentOverrides {
            layer: 1,
            token_start: 0,
            token_end: 1,
        },
        do_align: true,
        train_batch_size: 2,
        eval_batch_size: 2,
        sizes: TaskSizes {
            n_train: 4,
            n_eval: 2,
        },
        training: TrainingArgs {
            epochs: 1,
            log_step: 1,
            valid_steps: 1,
            ..Default::default()
        },
        restore_from: None,
    }
}

#[test]
fn test_second_run_is_skipped_without_loading() {
    let dir = tempfile::tempdir().unwrap();
    let loads = Cell::new(0);
    let loader = |alignment: AlignmentConfig| -> Result<LoadedModel> {
        loads.set(loads.get() + 1);
        let backend = AlignableLlama::random(toy_config(), 11, &Device::Cpu)?;
        let model =
            AlignableModel::new(Box::new(backend), alignment, RotationInit::Identity, &Device::Cpu)?;
        Ok(LoadedModel {
            model,
            codec: Box::new(WordCodec::new()),
        })
    };

    let experiment =
        AlignmentExperiment::new(experiment_config(dir.path()), &DasConfig::default()).unwrap();
    assert_eq!(
        experiment.run_name(),
        "model:tiny-llama_task:same_letter_seed:3_intl:1_intr:0,1"
    );

    let mut sink = MemorySink::new();
    let first = experiment.run(loader, &SameLetterTask, &mut sink).unwrap();
    let summary = match first {
        ExperimentOutcome::Completed(summary) => summary,
        ExperimentOutcome::Skipped { .. } => panic!("first run must not be skipped"),
    };
    assert_eq!(loads.get(), 1);
    let report = summary.train.unwrap();
    assert_eq!(report.total_steps, 2);
    assert!(experiment.run_dir().join(LAST_CHECKPOINT).is_file());
    assert!(experiment.run_dir().join(RUN_SUMMARY_FILE).is_file());

    let saved = DasConfig::load(&experiment.run_dir().join("das_config/config.json")).unwrap();
    assert_eq!(saved.das_layer, 1);
    assert_eq!(saved.das_token_range, [0, 1]);

    let again =
        AlignmentExperiment::new(experiment_config(dir.path()), &DasConfig::default()).unwrap();
    let mut sink = MemorySink::new();
    let second = again.run(loader, &SameLetterTask, &mut sink).unwrap();
    assert!(matches!(second, ExperimentOutcome::Skipped { .. }));
    assert_eq!(loads.get(), 1);
    assert!(sink.train_steps.is_empty());
}

/// Test double: the LLaMA body acts as encoder, and every decoder position
/// repeats the prediction made after the last input token.
struct ToySeq2Seq {
    inner: AlignableLlama,
}

impl AlignableBackend for ToySeq2Seq {
    fn family(&self) -> ModelFamily {
        ModelFamily::EncoderDecoder
    }

    fn n_layers(&self) -> usize {
        self.inner.n_layers()
    }

    fn d_model(&self) -> usize {
        self.inner.d_model()
    }

    fn vocab_size(&self) -> usize {
        self.inner.vocab_size()
    }

    fn max_seq_len(&self) -> usize {
        self.inner.max_seq_len()
    }

    fn dtype(&self) -> DType {
        self.inner.dtype()
    }

    fn forward_hidden_states(&self, input_ids: &Tensor, up_to_layer: usize) -> Result<Vec<Tensor>> {
        self.inner.forward_hidden_states(input_ids, up_to_layer)
    }

    fn forward_with_injection(
        &self,
        input_ids: &Tensor,
        decoder_targets: Option<&Tensor>,
        injection: Option<&Injection<'_>>,
    ) -> Result<Tensor> {
        let logits = self.inner.forward_with_injection(input_ids, None, injection)?;
        let seq_len = logits.dim(1)?;
        let steps = match decoder_targets {
            Some(targets) => targets.dim(1)?,
            None => 1,
        };
        Ok(logits.narrow(1, seq_len - 1, 1)?.repeat((1, steps, 1))?)
    }

    fn generate(
        &self,
        input_ids: &Tensor,
        max_new_tokens: usize,
        injection: Option<&Injection<'_>>,
    ) -> Result<Vec<Vec<u32>>> {
        let logits = self.forward_with_injection(input_ids, None, injection)?;
        let first = logits.i((.., 0, ..))?.argmax(D::Minus1)?.to_vec1::<u32>()?;
        Ok(first
            .into_iter()
            .map(|token| vec![token; max_new_tokens])
            .collect())
    }
}

#[test]
fn test_encoder_decoder_family_uses_output_only_labels() {
    let device = Device::Cpu;
    let inner = AlignableLlama::random(toy_config(), 11, &device).unwrap();
    let mut model = AlignableModel::new(
        Box::new(ToySeq2Seq { inner }),
        AlignmentConfig::new(1, 0, 1).unwrap(),
        RotationInit::Identity,
        &device,
    )
    .unwrap();
    assert_eq!(model.family(), ModelFamily::EncoderDecoder);

    let examples = vec![InterventionExample {
        base_input_ids: vec![1, 2, 3, 4],
        source_input_ids: vec![2, 2, 1, 2],
        intervention_id: 1,
        target_label: 5,
    }];
    let batch = intervention_batches(&examples, 1, &device).unwrap().remove(0);
    let labels = model.training_labels(&batch);
    assert_eq!(labels.dims(), &[1, 1]);
    assert_eq!(model.target_tokens(&batch).unwrap(), vec![5]);

    let slice = model.forward_source(batch.source_input_ids.as_ref().unwrap()).unwrap();
    let output = model
        .forward_intervened(&batch.input_ids, &slice, &[1], Some(labels))
        .unwrap();
    assert_eq!(output.logits.dims(), &[1, 1, WORDS.len()]);
    assert!(output.loss.unwrap().to_scalar::<f32>().unwrap().is_finite());
    assert_eq!(model.step_predictions(&output.logits).unwrap()[0].len(), 1);

    let codec = WordCodec::new();
    let mut sink = MemorySink::new();
    let dir = tempfile::tempdir().unwrap();
    let batches = vec![batch];
    let mut aligner = Aligner::new(
        &mut model,
        &codec,
        &mut sink,
        CheckpointPaths::for_run(dir.path(), "seq2seq"),
        "seq2seq",
    );
    let report = aligner
        .train(
            &batches,
            &batches,
            &batches,
            &TrainingArgs {
                epochs: 2,
                log_step: 1,
                valid_steps: 1,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(report.total_steps, 2);
    assert!(report.best_dev_accuracy.is_some());
}

/// Test loading a real LLaMA checkpoint and running one intervened forward
#[test]
#[ignore = "requires model download"]
fn test_tiny_llama_forward() {
    let model_id = "TinyLlama/TinyLlama-1.1B-Chat-v1.0";
    let device = Device::Cpu;
    let backend = AlignableLlama::load(model_id, &device, DType::F32).unwrap();
    assert_eq!(backend.n_layers(), 22);
    assert_eq!(backend.d_model(), 2048);

    let codec = das_rs::HfCodec::from_pretrained(model_id).unwrap();
    let model = AlignableModel::new(
        Box::new(backend),
        AlignmentConfig::new(10, 2, 3).unwrap(),
        RotationInit::Identity,
        &device,
    )
    .unwrap();

    let base = codec.encode("The capital of France is", true).unwrap();
    let source = codec.encode("The capital of Italy is", true).unwrap();
    let len = base.len().min(source.len());
    let base = Tensor::from_vec(base[..len].to_vec(), (1, len), &device).unwrap();
    let source = Tensor::from_vec(source[..len].to_vec(), (1, len), &device).unwrap();

    let slice = model.forward_source(&source).unwrap();
    let output = model.forward_intervened(&base, &slice, &[0], None).unwrap();
    assert_eq!(output.logits.dims()[2], model.backend().vocab_size());
}
