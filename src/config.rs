//! Alignment site configuration
//!
//! An [`AlignmentConfig`] fixes where the searched subspace lives: one layer
//! of the residual stream and a contiguous range of token positions. It is
//! resolved once from a persisted [`DasConfig`] plus CLI overrides and is
//! read-only afterwards.

use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use hf_hub::{api::sync::Api, Repo, RepoType};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Directory (relative to a model or run directory) holding the DAS config
pub const DAS_CONFIG_DIR: &str = "das_config";

/// File name of the DAS config inside [`DAS_CONFIG_DIR`]
pub const DAS_CONFIG_FILE: &str = "config.json";

/// Half-open range of token positions `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenRange {
    pub start: usize,
    pub end: usize,
}

impl TokenRange {
    /// Create a range, rejecting empty or inverted spans
    pub fn new(start: usize, end: usize) -> Result<Self> {
        anyhow::ensure!(
            start < end,
            "Invalid token range: start {start} must be < end {end}"
        );
        Ok(Self { start, end })
    }

    /// Number of positions covered
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Always false for a validated range
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn as_range(&self) -> Range<usize> {
        self.start..self.end
    }
}

impl fmt::Display for TokenRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.start, self.end)
    }
}

/// Where the intervention subspace lives: `(layer, token_range)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlignmentConfig {
    layer: usize,
    token_range: TokenRange,
}

impl AlignmentConfig {
    pub fn new(layer: usize, start: usize, end: usize) -> Result<Self> {
        Ok(Self {
            layer,
            token_range: TokenRange::new(start, end)?,
        })
    }

    pub fn layer(&self) -> usize {
        self.layer
    }

    pub fn token_range(&self) -> TokenRange {
        self.token_range
    }

    /// Check the site against model dimensions
    pub fn validate(&self, n_layers: usize, max_seq_len: usize) -> Result<()> {
        if self.layer >= n_layers {
            anyhow::bail!(
                "Alignment layer {} out of range (model has {n_layers} layers)",
                self.layer
            );
        }
        if self.token_range.end > max_seq_len {
            anyhow::bail!(
                "Token range end {} exceeds max sequence length {max_seq_len}",
                self.token_range.end
            );
        }
        Ok(())
    }
}

impl fmt::Display for AlignmentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "layer {} tokens [{})", self.layer, self.token_range)
    }
}

/// CLI overrides; a field is applied only when non-negative
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignmentOverrides {
    pub layer: i64,
    pub token_start: i64,
    pub token_end: i64,
}

impl Default for AlignmentOverrides {
    fn default() -> Self {
        Self {
            layer: -1,
            token_start: -1,
            token_end: -1,
        }
    }
}

/// Persisted DAS configuration (stored next to the model and in every run dir)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DasConfig {
    #[serde(default = "default_das_layer")]
    pub das_layer: usize,
    #[serde(default = "default_das_token_range")]
    pub das_token_range: [usize; 2],
}

fn default_das_layer() -> usize {
    15
}

fn default_das_token_range() -> [usize; 2] {
    [80, 81]
}

impl Default for DasConfig {
    fn default() -> Self {
        Self {
            das_layer: default_das_layer(),
            das_token_range: default_das_token_range(),
        }
    }
}

impl DasConfig {
    /// Load from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read DAS config {}", path.display()))?;
        let config: DasConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse DAS config {}", path.display()))?;
        Ok(config)
    }

    /// Write `<dir>/das_config/config.json`, creating directories as needed
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        let config_dir = dir.join(DAS_CONFIG_DIR);
        std::fs::create_dir_all(&config_dir)
            .with_context(|| format!("Failed to create {}", config_dir.display()))?;
        let path = config_dir.join(DAS_CONFIG_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }

    /// Find the DAS config that ships with a model.
    ///
    /// Local model directories are checked first, then the HuggingFace repo.
    /// Falls back to defaults (with a warning) when neither has one.
    pub fn locate(model_id: &str) -> Result<Self> {
        let local = Path::new(model_id).join(DAS_CONFIG_DIR).join(DAS_CONFIG_FILE);
        if local.is_file() {
            info!("Loading DAS config from {}", local.display());
            return Self::load(&local);
        }

        if !Path::new(model_id).is_dir() {
            let api = Api::new()?;
            let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));
            if let Ok(path) = repo.get(&format!("{DAS_CONFIG_DIR}/{DAS_CONFIG_FILE}")) {
                info!("Loading DAS config from hub: {}", path.display());
                return Self::load(&path);
            }
        }

        let config = Self::default();
        warn!(
            "No DAS config found for '{}', using defaults (layer {}, tokens {:?})",
            model_id, config.das_layer, config.das_token_range
        );
        Ok(config)
    }

    /// Apply CLI overrides and validate the resulting site
    pub fn resolve(&self, overrides: &AlignmentOverrides) -> Result<AlignmentConfig> {
        let layer = pick(self.das_layer, overrides.layer);
        let start = pick(self.das_token_range[0], overrides.token_start);
        let end = pick(self.das_token_range[1], overrides.token_end);
        AlignmentConfig::new(layer, start, end)
    }

    /// The config that reproduces a resolved alignment site
    pub fn from_alignment(alignment: &AlignmentConfig) -> Self {
        let range = alignment.token_range();
        Self {
            das_layer: alignment.layer(),
            das_token_range: [range.start, range.end],
        }
    }
}

fn pick(base: usize, override_value: i64) -> usize {
    if override_value >= 0 {
        override_value as usize
    } else {
        base
    }
}

/// Base name of a model path or hub id (`"../alpaca_7b/"` -> `"alpaca_7b"`)
pub fn model_base_name(model_id: &str) -> String {
    let trimmed = model_id.trim_end_matches(['/', '\\']);
    Path::new(trimmed)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| trimmed.to_string())
}

/// Deterministic run identity, used as checkpoint directory and tracker run name
pub fn run_name(model_id: &str, task_name: &str, seed: u64, alignment: &AlignmentConfig) -> String {
    let range = alignment.token_range();
    format!(
        "model:{}_task:{}_seed:{}_intl:{}_intr:{},{}",
        model_base_name(model_id),
        task_name,
        seed,
        alignment.layer(),
        range.start,
        range.end
    )
}
