//! Alignable model wrapper
//!
//! The pretrained model is opaque: anything implementing [`AlignableBackend`]
//! can be aligned. [`AlignableModel`] puts the learnable
//! [`BoundaryMaskedRotation`] next to a frozen backend and exposes the two
//! passes of an interchange intervention:
//!
//! 1. [`forward_source`](AlignableModel::forward_source) reads the hidden
//!    state slice at the alignment site from the source input;
//! 2. [`forward_intervened`](AlignableModel::forward_intervened) runs the
//!    base input, swapping the masked rotated subspace of the base slice for
//!    the source's, and returns logits (plus loss when labels are given).

use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor, Var, D};
use hf_hub::api::sync::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};
use tracing::info;

use crate::config::{AlignmentConfig, TokenRange};
use crate::data::{Batch, IGNORE_INDEX};
use crate::forward_llama::AlignableLlama;
use crate::intervention::{splice_positions, Intervention};
use crate::rotation::{BoundaryMaskedRotation, RotationInit};

/// How a backend turns inputs into predictions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    /// Causal LM; the prediction is the token after the last input position
    DecoderOnly,
    /// Seq2seq; predictions are decoder outputs, labels feed the decoder
    EncoderDecoder,
}

/// Supported `--model-type` values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelArchitecture {
    /// LLaMA / Alpaca (Meta)
    Llama,
    /// T5 (Google)
    T5,
}

impl ModelArchitecture {
    /// Parse a model type name
    pub fn from_model_type(model_type: &str) -> Result<Self> {
        match model_type.to_lowercase().as_str() {
            "llama" => Ok(Self::Llama),
            "t5" => Ok(Self::T5),
            other => anyhow::bail!("Unsupported model_type: {other} (expected \"llama\" or \"t5\")"),
        }
    }

    pub fn family(&self) -> ModelFamily {
        match self {
            Self::Llama => ModelFamily::DecoderOnly,
            Self::T5 => ModelFamily::EncoderDecoder,
        }
    }

    /// Fail unless [`AlignableModel::from_pretrained`] can load this architecture
    pub fn ensure_backend(&self) -> Result<()> {
        match self {
            Self::Llama => Ok(()),
            Self::T5 => anyhow::bail!(
                "No pretrained backend is available for model_type {self:?}; \
                 encoder-decoder models need a custom AlignableBackend"
            ),
        }
    }
}

/// Where model files come from: a local directory or a HuggingFace repo
pub enum ModelSource {
    Local(PathBuf),
    Hub(ApiRepo),
}

impl ModelSource {
    /// Local directory if `model_id` names one, otherwise a hub repo
    pub fn open(model_id: &str) -> Result<Self> {
        let path = Path::new(model_id);
        if path.is_dir() {
            return Ok(Self::Local(path.to_path_buf()));
        }
        let api = Api::new()?;
        Ok(Self::Hub(
            api.repo(Repo::new(model_id.to_string(), RepoType::Model)),
        ))
    }

    /// Path to `name`, downloading it if needed
    pub fn get(&self, name: &str) -> Result<PathBuf> {
        match self {
            Self::Local(dir) => {
                let path = dir.join(name);
                anyhow::ensure!(path.is_file(), "{} not found", path.display());
                Ok(path)
            }
            Self::Hub(repo) => repo
                .get(name)
                .with_context(|| format!("Failed to download {name}")),
        }
    }
}

/// Replace the hidden state on `span` after decoder layer `layer`.
///
/// `replace` receives the base slice `[batch, span, D]` and returns its
/// replacement with the same shape.
pub struct Injection<'a> {
    pub layer: usize,
    pub span: Range<usize>,
    pub replace: &'a dyn Fn(&Tensor) -> Result<Tensor>,
}

impl Injection<'_> {
    /// Apply to the full hidden state `[batch, seq, D]` of the target layer
    pub fn apply(&self, hidden: &Tensor) -> Result<Tensor> {
        let seq_len = hidden.dim(1)?;
        anyhow::ensure!(
            self.span.end <= seq_len,
            "Injection span {}..{} exceeds sequence length {seq_len}",
            self.span.start,
            self.span.end
        );
        let slice = hidden.narrow(1, self.span.start, self.span.len())?;
        let replacement = (self.replace)(&slice)?;
        splice_positions(hidden, self.span.clone(), &replacement)
    }
}

/// Capability trait for a frozen model that can be aligned.
///
/// Hidden states are the residual stream after each decoder layer
/// (`[batch, seq, D]`). Logits are returned as f32.
pub trait AlignableBackend {
    fn family(&self) -> ModelFamily;
    fn n_layers(&self) -> usize;
    fn d_model(&self) -> usize;
    fn vocab_size(&self) -> usize;
    fn max_seq_len(&self) -> usize;
    fn dtype(&self) -> DType;

    /// Hidden states after layers `0..=up_to_layer`
    fn forward_hidden_states(&self, input_ids: &Tensor, up_to_layer: usize) -> Result<Vec<Tensor>>;

    /// Full forward with an optional injection, returning `[batch, seq, vocab]`.
    ///
    /// Encoder-decoder backends teacher-force `decoder_targets`; decoder-only
    /// backends ignore it.
    fn forward_with_injection(
        &self,
        input_ids: &Tensor,
        decoder_targets: Option<&Tensor>,
        injection: Option<&Injection<'_>>,
    ) -> Result<Tensor>;

    /// Greedy decoding of `max_new_tokens` per row; returns only new tokens.
    ///
    /// The default re-runs the causal forward on the growing sequence and
    /// fits decoder-only models. Encoder-decoder backends must override it.
    fn generate(
        &self,
        input_ids: &Tensor,
        max_new_tokens: usize,
        injection: Option<&Injection<'_>>,
    ) -> Result<Vec<Vec<u32>>> {
        let batch = input_ids.dim(0)?;
        let mut ids = input_ids.clone();
        let mut generated = vec![Vec::with_capacity(max_new_tokens); batch];

        for _ in 0..max_new_tokens {
            let logits = self.forward_with_injection(&ids, None, injection)?;
            let seq_len = logits.dim(1)?;
            let next = logits.i((.., seq_len - 1, ..))?.argmax(D::Minus1)?;
            for (row, token) in next.to_vec1::<u32>()?.into_iter().enumerate() {
                generated[row].push(token);
            }
            ids = Tensor::cat(&[&ids, &next.unsqueeze(1)?.to_dtype(ids.dtype())?], 1)?;
        }
        Ok(generated)
    }
}

/// Hidden states at the alignment site, tagged with where they came from
#[derive(Debug, Clone)]
pub struct HiddenStateSlice {
    /// `[batch, span, D]`
    pub tensor: Tensor,
    pub layer: usize,
    pub token_range: TokenRange,
}

/// Output of an aligned forward pass
#[derive(Debug, Clone)]
pub struct AlignmentOutput {
    /// `[batch, seq, vocab]` f32
    pub logits: Tensor,
    /// Scalar cross-entropy, present when labels were given
    pub loss: Option<Tensor>,
}

/// Pick device and dtype (CUDA when available; BF16 only on request and on GPU)
pub fn select_device(force_cpu: bool, bf16: bool) -> (Device, DType) {
    if force_cpu {
        info!("Forcing CPU mode");
        return (Device::Cpu, DType::F32);
    }
    match Device::cuda_if_available(0) {
        Ok(dev) if dev.is_cuda() => {
            info!("Using CUDA device");
            (dev, if bf16 { DType::BF16 } else { DType::F32 })
        }
        _ => {
            info!("CUDA not available, using CPU");
            (Device::Cpu, DType::F32)
        }
    }
}

/// Frozen backend plus the learnable alignment parameters
pub struct AlignableModel {
    backend: Box<dyn AlignableBackend>,
    rotation: BoundaryMaskedRotation,
    alignment: AlignmentConfig,
    device: Device,
}

impl AlignableModel {
    /// Wrap a backend; fails if the alignment site does not fit the model
    pub fn new(
        backend: Box<dyn AlignableBackend>,
        alignment: AlignmentConfig,
        init: RotationInit,
        device: &Device,
    ) -> Result<Self> {
        alignment.validate(backend.n_layers(), backend.max_seq_len())?;
        let rotation = BoundaryMaskedRotation::new(backend.d_model(), init, device)?;

        let model = Self {
            backend,
            rotation,
            alignment,
            device: device.clone(),
        };
        for (name, var) in model.trainable_parameters() {
            info!(
                "Requiring gradients on: {name} ({} params)",
                var.as_tensor().elem_count()
            );
        }
        info!(
            "Alignment site: {} ({} trainable params, frozen backend)",
            model.alignment,
            model.trainable_parameter_count()
        );
        Ok(model)
    }

    /// Load a pretrained backend by architecture
    pub fn from_pretrained(
        model_id: &str,
        architecture: ModelArchitecture,
        alignment: AlignmentConfig,
        init: RotationInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        info!("Loading model: {}", model_id);
        info!("Architecture: {:?}", architecture);
        info!("Device: {:?}", device);
        info!("Dtype: {:?}", dtype);

        architecture.ensure_backend()?;
        let backend: Box<dyn AlignableBackend> = match architecture {
            ModelArchitecture::Llama => Box::new(AlignableLlama::load(model_id, device, dtype)?),
            ModelArchitecture::T5 => {
                anyhow::bail!("No encoder-decoder backend is available for '{model_id}'")
            }
        };
        Self::new(backend, alignment, init, device)
    }

    pub fn backend(&self) -> &dyn AlignableBackend {
        self.backend.as_ref()
    }

    pub fn family(&self) -> ModelFamily {
        self.backend.family()
    }

    pub fn alignment(&self) -> &AlignmentConfig {
        &self.alignment
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn rotation(&self) -> &BoundaryMaskedRotation {
        &self.rotation
    }

    pub fn rotation_mut(&mut self) -> &mut BoundaryMaskedRotation {
        &mut self.rotation
    }

    /// Toggle gradient recording for the alignment parameters
    pub fn set_training(&mut self, training: bool) {
        self.rotation.set_training(training);
    }

    /// The only parameters that receive gradients
    pub fn trainable_parameters(&self) -> Vec<(&'static str, Var)> {
        self.rotation.trainable_vars()
    }

    pub fn trainable_parameter_count(&self) -> usize {
        self.trainable_parameters()
            .iter()
            .map(|(_, var)| var.as_tensor().elem_count())
            .sum()
    }

    /// Read the alignment-site slice from the source input
    pub fn forward_source(&self, source_input_ids: &Tensor) -> Result<HiddenStateSlice> {
        let layer = self.alignment.layer();
        let range = self.alignment.token_range();
        let seq_len = source_input_ids.dim(1)?;
        anyhow::ensure!(
            range.end <= seq_len,
            "Token range [{range}) exceeds source sequence length {seq_len}"
        );

        let states = self.backend.forward_hidden_states(source_input_ids, layer)?;
        let hidden = states
            .last()
            .context("Backend returned no hidden states")?;
        Ok(HiddenStateSlice {
            tensor: hidden.narrow(1, range.start, range.len())?,
            layer,
            token_range: range,
        })
    }

    /// Decoder targets to teacher-force, by family
    fn decoder_targets<'t>(&self, labels: Option<&'t Tensor>) -> Option<&'t Tensor> {
        match self.family() {
            ModelFamily::DecoderOnly => None,
            ModelFamily::EncoderDecoder => labels,
        }
    }

    /// Base forward with the source's masked subspace swapped in
    pub fn forward_intervened(
        &self,
        base_input_ids: &Tensor,
        source: &HiddenStateSlice,
        intervention_ids: &[usize],
        labels: Option<&Tensor>,
    ) -> Result<AlignmentOutput> {
        if source.layer != self.alignment.layer() || source.token_range != self.alignment.token_range()
        {
            anyhow::bail!(
                "Source slice from layer {} tokens [{}) does not match alignment site {}",
                source.layer,
                source.token_range,
                self.alignment
            );
        }
        let batch = base_input_ids.dim(0)?;
        anyhow::ensure!(
            intervention_ids.len() == batch,
            "{} intervention ids for a batch of {batch}",
            intervention_ids.len()
        );

        let mask = self.rotation.batch_mask(intervention_ids)?;
        let replace = |base: &Tensor| -> Result<Tensor> {
            Intervention::apply(base, &source.tensor, &self.rotation, &mask)
        };
        let injection = Injection {
            layer: self.alignment.layer(),
            span: self.alignment.token_range().as_range(),
            replace: &replace,
        };

        let logits = self.backend.forward_with_injection(
            base_input_ids,
            self.decoder_targets(labels),
            Some(&injection),
        )?;
        let loss = labels.map(|l| token_loss(&logits, l)).transpose()?;
        Ok(AlignmentOutput { logits, loss })
    }

    /// Forward without intervention
    pub fn forward_plain(&self, input_ids: &Tensor, labels: Option<&Tensor>) -> Result<AlignmentOutput> {
        let logits =
            self.backend
                .forward_with_injection(input_ids, self.decoder_targets(labels), None)?;
        let loss = labels.map(|l| token_loss(&logits, l)).transpose()?;
        Ok(AlignmentOutput { logits, loss })
    }

    pub fn generate_plain(&self, input_ids: &Tensor, max_new_tokens: usize) -> Result<Vec<Vec<u32>>> {
        self.backend.generate(input_ids, max_new_tokens, None)
    }

    /// Greedy generation with the intervention applied on every step
    pub fn generate_intervened(
        &self,
        base_input_ids: &Tensor,
        source: &HiddenStateSlice,
        intervention_ids: &[usize],
        max_new_tokens: usize,
    ) -> Result<Vec<Vec<u32>>> {
        let mask = self.rotation.batch_mask(intervention_ids)?;
        let replace = |base: &Tensor| -> Result<Tensor> {
            Intervention::apply(base, &source.tensor, &self.rotation, &mask)
        };
        let injection = Injection {
            layer: self.alignment.layer(),
            span: self.alignment.token_range().as_range(),
            replace: &replace,
        };
        self.backend
            .generate(base_input_ids, max_new_tokens, Some(&injection))
    }

    /// Labels the loss is computed against
    pub fn training_labels<'b>(&self, batch: &'b Batch) -> &'b Tensor {
        match self.family() {
            ModelFamily::DecoderOnly => &batch.labels,
            ModelFamily::EncoderDecoder => &batch.output_only_labels,
        }
    }

    /// Expected answer token per example
    pub fn target_tokens(&self, batch: &Batch) -> Result<Vec<u32>> {
        let labels = match self.family() {
            ModelFamily::DecoderOnly => {
                let seq_len = batch.labels.dim(1)?;
                batch.labels.i((.., seq_len - 1))?
            }
            ModelFamily::EncoderDecoder => batch.output_only_labels.i((.., 0))?,
        };
        labels
            .to_vec1::<i64>()?
            .into_iter()
            .map(|l| u32::try_from(l).with_context(|| format!("Invalid target label {l}")))
            .collect()
    }

    /// Greedy predictions from teacher-forced logits
    pub fn step_predictions(&self, logits: &Tensor) -> Result<Vec<Vec<u32>>> {
        match self.family() {
            ModelFamily::DecoderOnly => {
                let seq_len = logits.dim(1)?;
                let last = logits.i((.., seq_len - 1, ..))?.argmax(D::Minus1)?;
                Ok(last.to_vec1::<u32>()?.into_iter().map(|t| vec![t]).collect())
            }
            ModelFamily::EncoderDecoder => Ok(logits.argmax(D::Minus1)?.to_vec2::<u32>()?),
        }
    }
}

/// Mean cross-entropy over positions whose label is not [`IGNORE_INDEX`]
pub fn token_loss(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let (batch, seq_len, vocab) = logits.dims3()?;
    let label_dims = labels.dims2()?;
    anyhow::ensure!(
        label_dims == (batch, seq_len),
        "Labels {label_dims:?} do not match logits [{batch}, {seq_len}, _]"
    );

    let flat_labels = labels.flatten_all()?.to_vec1::<i64>()?;
    let mut rows = Vec::new();
    let mut targets = Vec::new();
    for (i, &label) in flat_labels.iter().enumerate() {
        if label == IGNORE_INDEX {
            continue;
        }
        let target = u32::try_from(label)
            .ok()
            .filter(|&t| (t as usize) < vocab)
            .with_context(|| format!("Label {label} outside vocabulary of {vocab}"))?;
        rows.push(i as u32);
        targets.push(target);
    }
    anyhow::ensure!(!rows.is_empty(), "Every label is ignored; nothing to score");

    let device = logits.device();
    let n = rows.len();
    let rows = Tensor::from_vec(rows, n, device)?;
    let targets = Tensor::from_vec(targets, n, device)?;
    let selected = logits
        .reshape((batch * seq_len, vocab))?
        .to_dtype(DType::F32)?
        .index_select(&rows, 0)?;
    Ok(candle_nn::loss::cross_entropy(&selected, &targets)?)
}
