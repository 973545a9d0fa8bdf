//! Task collaborators
//!
//! A task samples text examples for the four phases of a run: the prealign
//! check (plain prompts), and train/dev/test interchange examples whose
//! target is the counterfactual answer predicted by the task's causal model.

use anyhow::Result;
use rand::rngs::StdRng;
use tracing::info;

use crate::data::{encode_interventions, encode_prompts, InterventionExample, PromptExample, TextExample, TokenCodec};
use crate::model::ModelFamily;

pub mod continent_matching;
pub mod price_tagging;

pub use continent_matching::ContinentMatching;
pub use price_tagging::PriceTagging;

pub const YES_LABEL: &str = "Yes";
pub const NO_LABEL: &str = "No";

pub fn yes_no(value: bool) -> &'static str {
    if value {
        YES_LABEL
    } else {
        NO_LABEL
    }
}

/// How prompts are rendered for a model family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptStyle {
    /// Alpaca-style instruction template (decoder-only models)
    Instruction,
    /// Bare prompt (encoder-decoder models)
    Plain,
}

impl PromptStyle {
    pub fn for_family(family: ModelFamily) -> Self {
        match family {
            ModelFamily::DecoderOnly => Self::Instruction,
            ModelFamily::EncoderDecoder => Self::Plain,
        }
    }

    /// Render an instruction with an optional input
    pub fn render(&self, instruction: &str, input: Option<&str>) -> String {
        match (self, input) {
            (Self::Instruction, None) => format!(
                "Below is an instruction that describes a task. \
                 Write a response that appropriately completes the request.\n\n\
                 ### Instruction:\n{instruction}\n\n### Response:\n"
            ),
            (Self::Instruction, Some(input)) => format!(
                "Below is an instruction that describes a task, paired with an input \
                 that provides further context. Write a response that appropriately \
                 completes the request.\n\n\
                 ### Instruction:\n{instruction}\n\n### Input:\n{input}\n\n### Response:\n"
            ),
            (Self::Plain, None) => instruction.to_string(),
            (Self::Plain, Some(input)) => format!("{instruction}\n{input}"),
        }
    }
}

/// How many examples to sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSizes {
    pub n_train: usize,
    /// Dev and test sets each get this many; the prealign set about as many
    pub n_eval: usize,
}

/// Sampled text examples for one run
#[derive(Debug, Clone, Default)]
pub struct TaskData {
    pub prealign: Vec<TextExample>,
    pub train: Vec<TextExample>,
    pub dev: Vec<TextExample>,
    pub test: Vec<TextExample>,
}

/// Token-level version of [`TaskData`]
#[derive(Debug, Clone, Default)]
pub struct EncodedTaskData {
    pub prealign: Vec<PromptExample>,
    pub train: Vec<InterventionExample>,
    pub dev: Vec<InterventionExample>,
    pub test: Vec<InterventionExample>,
}

impl TaskData {
    /// Tokenize every split, left-padding prompts to `pad_to`
    pub fn encode(&self, codec: &dyn TokenCodec, pad_to: usize) -> Result<EncodedTaskData> {
        let encoded = EncodedTaskData {
            prealign: encode_prompts(codec, &self.prealign, pad_to)?,
            train: encode_interventions(codec, &self.train, pad_to)?,
            dev: encode_interventions(codec, &self.dev, pad_to)?,
            test: encode_interventions(codec, &self.test, pad_to)?,
        };
        info!(
            "Encoded task data: {} prealign, {} train, {} dev, {} test (padded to {pad_to})",
            encoded.prealign.len(),
            encoded.train.len(),
            encoded.dev.len(),
            encoded.test.len()
        );
        Ok(encoded)
    }
}

/// Splits one sampled pool into train/dev/test
fn split_pool(mut pool: Vec<TextExample>, sizes: TaskSizes) -> (Vec<TextExample>, Vec<TextExample>, Vec<TextExample>) {
    let test = pool.split_off(sizes.n_train + sizes.n_eval);
    let dev = pool.split_off(sizes.n_train);
    (pool, dev, test)
}

/// A source of examples with a known causal model
pub trait Task {
    fn name(&self) -> &str;

    /// Fixed prompt length after left padding
    fn pad_to(&self) -> usize;

    fn sample(&self, sizes: TaskSizes, rng: &mut StdRng) -> Result<TaskData>;
}

/// Resolve a task by name for a model family; unknown names fail fast
pub fn task_for(name: &str, family: ModelFamily) -> Result<Box<dyn Task>> {
    let style = PromptStyle::for_family(family);
    if name.contains("price_tagging") {
        Ok(Box::new(PriceTagging::new(name, style)?))
    } else if name.contains("continent_matching") {
        Ok(Box::new(ContinentMatching::new(name, style)?))
    } else {
        anyhow::bail!("Unsupported task_name: {name}")
    }
}
