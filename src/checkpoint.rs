//! Alignment checkpoints
//!
//! Only the learnable alignment parameters are stored, as a small
//! safetensors file per checkpoint:
//!
//! | tensor                    | shape    |
//! |---------------------------|----------|
//! | `rotate_layer.generator`  | `[D, D]` |
//! | `intervention_boundaries` | `[2]`    |
//! | `temperature`             | `[1]`    |
//!
//! The header metadata records the run name, hidden size and the clamped
//! boundaries so a checkpoint can be inspected without loading tensors.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use safetensors::tensor::{SafeTensors, TensorView};
use tracing::info;

use crate::rotation::BoundaryMaskedRotation;

pub const BEST_CHECKPOINT: &str = "rotate-best.safetensors";
pub const LAST_CHECKPOINT: &str = "rotate-last.safetensors";

pub const GENERATOR_TENSOR: &str = "rotate_layer.generator";
pub const BOUNDARIES_TENSOR: &str = "intervention_boundaries";
pub const TEMPERATURE_TENSOR: &str = "temperature";

/// Checkpoint locations for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPaths {
    dir: PathBuf,
}

impl CheckpointPaths {
    /// `<output_dir>/<run_name>`
    pub fn for_run(output_dir: &Path, run_name: &str) -> Self {
        Self {
            dir: output_dir.join(run_name),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn best(&self) -> PathBuf {
        self.dir.join(BEST_CHECKPOINT)
    }

    pub fn last(&self) -> PathBuf {
        self.dir.join(LAST_CHECKPOINT)
    }

    /// A finished run leaves `rotate-last` behind
    pub fn has_last(&self) -> bool {
        self.last().is_file()
    }
}

/// Parameters read back from a checkpoint
#[derive(Debug, Clone)]
pub struct AlignmentCheckpoint {
    pub generator: Tensor,
    pub boundaries: Tensor,
    pub temperature: f64,
    pub metadata: HashMap<String, String>,
}

impl AlignmentCheckpoint {
    /// Overwrite a rotation's parameters with the stored ones
    pub fn apply_to(&self, rotation: &mut BoundaryMaskedRotation) -> Result<()> {
        rotation.restore(&self.generator, &self.boundaries, self.temperature)
    }
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Write the rotation's parameters to `path`
pub fn save_alignment(path: &Path, rotation: &BoundaryMaskedRotation, run_name: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let d = rotation.hidden_size();

    let generator: Vec<f32> = rotation
        .rotation_var()
        .as_tensor()
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1()?;
    let boundaries = rotation.boundaries()?;
    let temperature = [rotation.temperature() as f32];

    let generator_bytes = f32_bytes(&generator);
    let boundary_bytes = f32_bytes(&boundaries);
    let temperature_bytes = f32_bytes(&temperature);

    let tensors = vec![
        (
            GENERATOR_TENSOR,
            TensorView::new(safetensors::Dtype::F32, vec![d, d], &generator_bytes)?,
        ),
        (
            BOUNDARIES_TENSOR,
            TensorView::new(
                safetensors::Dtype::F32,
                vec![boundaries.len()],
                &boundary_bytes,
            )?,
        ),
        (
            TEMPERATURE_TENSOR,
            TensorView::new(safetensors::Dtype::F32, vec![1], &temperature_bytes)?,
        ),
    ];

    let clamped = rotation.clamped_boundaries()?;
    let metadata: HashMap<String, String> = [
        ("run_name".to_string(), run_name.to_string()),
        ("hidden_size".to_string(), d.to_string()),
        ("boundary0".to_string(), clamped[0].to_string()),
        ("boundary1".to_string(), clamped[1].to_string()),
        ("temperature".to_string(), rotation.temperature().to_string()),
    ]
    .into_iter()
    .collect();

    safetensors::serialize_to_file(tensors, &Some(metadata), path)
        .with_context(|| format!("Failed to write checkpoint {}", path.display()))?;
    info!("Saved alignment checkpoint to {}", path.display());
    Ok(())
}

fn f32_tensor(st: &SafeTensors<'_>, name: &str, device: &Device) -> Result<Tensor> {
    let view = st
        .tensor(name)
        .with_context(|| format!("Tensor '{name}' not found in checkpoint"))?;
    let dtype = match view.dtype() {
        safetensors::Dtype::F32 => DType::F32,
        safetensors::Dtype::BF16 => DType::BF16,
        safetensors::Dtype::F16 => DType::F16,
        other => anyhow::bail!("Unsupported checkpoint tensor dtype: {other:?}"),
    };
    let tensor = Tensor::from_raw_buffer(view.data(), dtype, view.shape(), device)?;
    Ok(tensor.to_dtype(DType::F32)?)
}

/// Read a checkpoint written by [`save_alignment`]
pub fn load_alignment(path: &Path, device: &Device) -> Result<AlignmentCheckpoint> {
    let data = std::fs::read(path)
        .with_context(|| format!("Failed to read checkpoint {}", path.display()))?;
    let st = SafeTensors::deserialize(&data)
        .with_context(|| format!("Failed to deserialize checkpoint {}", path.display()))?;

    let generator = f32_tensor(&st, GENERATOR_TENSOR, device)?;
    let boundaries = f32_tensor(&st, BOUNDARIES_TENSOR, device)?;
    let temperature = f32_tensor(&st, TEMPERATURE_TENSOR, device)?
        .flatten_all()?
        .to_vec1::<f32>()?
        .first()
        .copied()
        .context("Empty temperature tensor")? as f64;

    let (_, header) = SafeTensors::read_metadata(&data)?;
    let metadata = header.metadata().clone().unwrap_or_default();

    Ok(AlignmentCheckpoint {
        generator,
        boundaries,
        temperature,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rotation::RotationInit;

    #[test]
    fn test_paths() {
        let paths = CheckpointPaths::for_run(Path::new("/tmp/out"), "run");
        assert_eq!(paths.best(), Path::new("/tmp/out/run/rotate-best.safetensors"));
        assert_eq!(paths.last(), Path::new("/tmp/out/run/rotate-last.safetensors"));
    }

    #[test]
    fn test_save_then_restore_into_fresh_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let device = Device::Cpu;
        let mut rotation =
            BoundaryMaskedRotation::new(6, RotationInit::Random { seed: 5 }, &device).unwrap();
        rotation.set_boundaries([0.2, 1.4]).unwrap();
        rotation.set_temperature(3.5);

        let paths = CheckpointPaths::for_run(dir.path(), "toy");
        assert!(!paths.has_last());
        save_alignment(&paths.last(), &rotation, "toy").unwrap();
        assert!(paths.has_last());

        let checkpoint = load_alignment(&paths.last(), &device).unwrap();
        assert_eq!(checkpoint.temperature, 3.5);
        assert_eq!(checkpoint.metadata["run_name"], "toy");
        assert_eq!(checkpoint.metadata["hidden_size"], "6");
        // Metadata carries clamped values, tensors the raw ones
        assert_eq!(checkpoint.metadata["boundary1"], "1");
        let raw: Vec<f32> = checkpoint.boundaries.to_vec1().unwrap();
        assert_eq!(raw, vec![0.2, 1.4]);

        let mut fresh = BoundaryMaskedRotation::new(6, RotationInit::Identity, &device).unwrap();
        checkpoint.apply_to(&mut fresh).unwrap();
        let a: Vec<f32> = fresh.rotation_matrix().unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = rotation.rotation_matrix().unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
        assert_eq!(fresh.temperature(), 3.5);
    }

    #[test]
    fn test_missing_checkpoint_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_alignment(&dir.path().join("nope.safetensors"), &Device::Cpu).is_err());
    }
}
