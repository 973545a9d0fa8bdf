//! Examples, tokenization and batching
//!
//! Tasks produce text examples. This module turns them into token ids with
//! left padding to a fixed length, attaches labels aligned with logit
//! positions, and collates them into device tensors.

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tokenizers::{AddedToken, Tokenizer};
use tracing::{debug, info, warn};

/// Label value excluded from the loss
pub const IGNORE_INDEX: i64 = -100;

/// Text-level example as produced by a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextExample {
    pub prompt: String,
    /// Source prompt for interchange examples, `None` for plain prompts
    pub source_prompt: Option<String>,
    pub target: String,
    pub intervention_id: usize,
}

impl TextExample {
    pub fn plain(prompt: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            source_prompt: None,
            target: target.into(),
            intervention_id: 0,
        }
    }

    pub fn interchange(
        prompt: impl Into<String>,
        source_prompt: impl Into<String>,
        target: impl Into<String>,
        intervention_id: usize,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            source_prompt: Some(source_prompt.into()),
            target: target.into(),
            intervention_id,
        }
    }
}

/// Encoded prompt with the token the model should emit after it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptExample {
    pub input_ids: Vec<u32>,
    pub target_label: u32,
}

/// Encoded interchange example
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterventionExample {
    pub base_input_ids: Vec<u32>,
    pub source_input_ids: Vec<u32>,
    pub intervention_id: usize,
    /// Counterfactual target: what the model should emit after the swap
    pub target_label: u32,
}

/// Minimal tokenizer surface the pipeline needs
pub trait TokenCodec {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>>;
    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String>;
    /// Vocabulary id of an exact token string
    fn token_id(&self, token: &str) -> Option<u32>;
    fn pad_id(&self) -> u32;
}

/// [`TokenCodec`] over a HuggingFace tokenizer
pub struct HfCodec {
    tokenizer: Tokenizer,
    pad_id: u32,
}

impl HfCodec {
    /// Wrap a tokenizer, making sure it has a pad token
    pub fn new(mut tokenizer: Tokenizer) -> Result<Self> {
        let pad_id = ensure_pad_token(&mut tokenizer)?;
        Ok(Self { tokenizer, pad_id })
    }

    /// Load `tokenizer.json` from a local model directory or the hub
    pub fn from_pretrained(model_id: &str) -> Result<Self> {
        let local = Path::new(model_id).join("tokenizer.json");
        let tokenizer_path = if local.is_file() {
            local
        } else {
            let api = Api::new()?;
            let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));
            repo.get("tokenizer.json")
                .context("Failed to download tokenizer.json")?
        };
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;
        Self::new(tokenizer)
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }
}

impl TokenCodec for HfCodec {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, add_special_tokens)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.tokenizer
            .decode(ids, skip_special_tokens)
            .map_err(|e| anyhow::anyhow!("Decode error: {e}"))
    }

    fn token_id(&self, token: &str) -> Option<u32> {
        self.tokenizer.token_to_id(token)
    }

    fn pad_id(&self) -> u32 {
        self.pad_id
    }
}

/// Existing tokens that can stand in for padding, in order of preference
const PAD_CANDIDATES: [&str; 4] = ["<pad>", "[PAD]", "<unk>", "</s>"];

/// Return the pad token id, reusing a pad-like token or adding `[PAD]`
pub fn ensure_pad_token(tokenizer: &mut Tokenizer) -> Result<u32> {
    if let Some(padding) = tokenizer.get_padding() {
        return Ok(padding.pad_id);
    }
    for candidate in PAD_CANDIDATES {
        if let Some(id) = tokenizer.token_to_id(candidate) {
            info!("Tokenizer has no pad token, using '{candidate}' (id {id})");
            return Ok(id);
        }
    }
    tokenizer.add_special_tokens(&[AddedToken::from("[PAD]", true)]);
    let id = tokenizer
        .token_to_id("[PAD]")
        .context("Tokenizer has no id for the [PAD] token it was just given")?;
    warn!("Added special pad token [PAD] (id {id})");
    Ok(id)
}

/// Id of the single token that spells `target`
pub fn label_token(codec: &dyn TokenCodec, target: &str) -> Result<u32> {
    if let Some(id) = codec.token_id(target) {
        return Ok(id);
    }
    let ids = codec.encode(target, false)?;
    match ids.as_slice() {
        [id] => Ok(*id),
        [] => anyhow::bail!("Target '{target}' encodes to no tokens"),
        many => anyhow::bail!(
            "Target '{target}' is not a single token ({} tokens)",
            many.len()
        ),
    }
}

/// Left-pad `ids` to exactly `len` tokens
pub fn pad_left(ids: &[u32], len: usize, pad_id: u32) -> Result<Vec<u32>> {
    if ids.len() > len {
        anyhow::bail!(
            "Prompt has {} tokens, longer than the padded length {len}",
            ids.len()
        );
    }
    let mut out = vec![pad_id; len - ids.len()];
    out.extend_from_slice(ids);
    Ok(out)
}

fn encode_padded(codec: &dyn TokenCodec, text: &str, pad_to: usize) -> Result<Vec<u32>> {
    pad_left(&codec.encode(text, true)?, pad_to, codec.pad_id())
}

/// Encode plain prompts (used for the prealign check)
pub fn encode_prompts(
    codec: &dyn TokenCodec,
    examples: &[TextExample],
    pad_to: usize,
) -> Result<Vec<PromptExample>> {
    examples
        .iter()
        .map(|ex| {
            Ok(PromptExample {
                input_ids: encode_padded(codec, &ex.prompt, pad_to)?,
                target_label: label_token(codec, &ex.target)?,
            })
        })
        .collect()
}

/// Encode interchange examples; every example must carry a source prompt
pub fn encode_interventions(
    codec: &dyn TokenCodec,
    examples: &[TextExample],
    pad_to: usize,
) -> Result<Vec<InterventionExample>> {
    examples
        .iter()
        .map(|ex| {
            let source = ex
                .source_prompt
                .as_deref()
                .context("Interchange example is missing its source prompt")?;
            Ok(InterventionExample {
                base_input_ids: encode_padded(codec, &ex.prompt, pad_to)?,
                source_input_ids: encode_padded(codec, source, pad_to)?,
                intervention_id: ex.intervention_id,
                target_label: label_token(codec, &ex.target)?,
            })
        })
        .collect()
}

/// A collated batch on one device
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[b, s]` u32
    pub input_ids: Tensor,
    /// `[b, s]` i64, target at the last position, [`IGNORE_INDEX`] elsewhere
    pub labels: Tensor,
    /// `[b, 1]` i64
    pub output_only_labels: Tensor,
    /// `[b, s]` u32
    pub source_input_ids: Option<Tensor>,
    pub intervention_ids: Option<Vec<usize>>,
}

impl Batch {
    /// Collate plain prompts
    pub fn from_prompts(examples: &[PromptExample], device: &Device) -> Result<Self> {
        let rows: Vec<(&[u32], u32)> = examples
            .iter()
            .map(|ex| (ex.input_ids.as_slice(), ex.target_label))
            .collect();
        let (input_ids, labels, output_only_labels) = collate_rows(&rows, device)?;
        Ok(Self {
            input_ids,
            labels,
            output_only_labels,
            source_input_ids: None,
            intervention_ids: None,
        })
    }

    /// Collate interchange examples
    pub fn from_interventions(examples: &[InterventionExample], device: &Device) -> Result<Self> {
        let rows: Vec<(&[u32], u32)> = examples
            .iter()
            .map(|ex| (ex.base_input_ids.as_slice(), ex.target_label))
            .collect();
        let (input_ids, labels, output_only_labels) = collate_rows(&rows, device)?;

        let sources: Vec<&[u32]> = examples
            .iter()
            .map(|ex| ex.source_input_ids.as_slice())
            .collect();
        let source_input_ids = stack_ids(&sources, device)?;

        Ok(Self {
            input_ids,
            labels,
            output_only_labels,
            source_input_ids: Some(source_input_ids),
            intervention_ids: Some(examples.iter().map(|ex| ex.intervention_id).collect()),
        })
    }

    /// Number of examples
    pub fn len(&self) -> usize {
        self.input_ids.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move every tensor to `device`
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            input_ids: self.input_ids.to_device(device)?,
            labels: self.labels.to_device(device)?,
            output_only_labels: self.output_only_labels.to_device(device)?,
            source_input_ids: self
                .source_input_ids
                .as_ref()
                .map(|t| t.to_device(device))
                .transpose()?,
            intervention_ids: self.intervention_ids.clone(),
        })
    }

    /// Source ids, required for interchange passes
    pub fn require_source(&self) -> Result<&Tensor> {
        self.source_input_ids
            .as_ref()
            .context("Batch has no source_input_ids")
    }

    /// Intervention ids, required for interchange passes
    pub fn require_intervention_ids(&self) -> Result<&[usize]> {
        self.intervention_ids
            .as_deref()
            .context("Batch has no intervention_ids")
    }
}

fn stack_ids(rows: &[&[u32]], device: &Device) -> Result<Tensor> {
    let seq_len = rows.first().map(|r| r.len()).unwrap_or(0);
    if let Some(bad) = rows.iter().find(|r| r.len() != seq_len) {
        anyhow::bail!(
            "Ragged batch: sequence of length {} among length {seq_len}",
            bad.len()
        );
    }
    let flat: Vec<u32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
    Ok(Tensor::from_vec(flat, (rows.len(), seq_len), device)?)
}

fn collate_rows(rows: &[(&[u32], u32)], device: &Device) -> Result<(Tensor, Tensor, Tensor)> {
    anyhow::ensure!(!rows.is_empty(), "Cannot collate an empty batch");
    let ids: Vec<&[u32]> = rows.iter().map(|(ids, _)| *ids).collect();
    let input_ids = stack_ids(&ids, device)?;
    let seq_len = input_ids.dim(1)?;
    anyhow::ensure!(seq_len > 0, "Cannot collate empty sequences");

    let mut labels = vec![IGNORE_INDEX; rows.len() * seq_len];
    let mut output_only = Vec::with_capacity(rows.len());
    for (row, (_, target)) in rows.iter().enumerate() {
        labels[row * seq_len + seq_len - 1] = *target as i64;
        output_only.push(*target as i64);
    }

    Ok((
        input_ids,
        Tensor::from_vec(labels, (rows.len(), seq_len), device)?,
        Tensor::from_vec(output_only, (rows.len(), 1), device)?,
    ))
}

/// Chunk plain prompts into batches, preserving order
pub fn prompt_batches(
    examples: &[PromptExample],
    batch_size: usize,
    device: &Device,
) -> Result<Vec<Batch>> {
    anyhow::ensure!(batch_size > 0, "Batch size must be positive");
    let batches = examples
        .chunks(batch_size)
        .map(|chunk| Batch::from_prompts(chunk, device))
        .collect::<Result<Vec<_>>>()?;
    debug!("Collated {} prompts into {} batches", examples.len(), batches.len());
    Ok(batches)
}

/// Chunk interchange examples into batches, preserving order
pub fn intervention_batches(
    examples: &[InterventionExample],
    batch_size: usize,
    device: &Device,
) -> Result<Vec<Batch>> {
    anyhow::ensure!(batch_size > 0, "Batch size must be positive");
    let batches = examples
        .chunks(batch_size)
        .map(|chunk| Batch::from_interventions(chunk, device))
        .collect::<Result<Vec<_>>>()?;
    debug!(
        "Collated {} interchange examples into {} batches",
        examples.len(),
        batches.len()
    );
    Ok(batches)
}
