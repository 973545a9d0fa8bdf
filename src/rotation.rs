//! Boundary-masked rotation
//!
//! Owns the learnable alignment parameters:
//!
//! - an orthogonal rotation `Q` (`D x D`), parametrized as the matrix
//!   exponential of the skew-symmetric part of an unconstrained generator
//!   `W`: `Q = exp((W - W^T) / 2)`. Any generator yields an orthogonal `Q`,
//!   so the optimizer can update `W` freely;
//! - two boundary scalars `(b0, b1)`, read as fractions of `D`;
//! - a temperature controlling how sharp the soft boundary mask is.
//!
//! ## Soft mask
//!
//! Rotated index `i` is treated as the unit cell centred at `i + 0.5`.
//! For intervention 0 the weight is `sigmoid((b0*D - (i + 0.5)) / t)`, a
//! smooth version of `i < b0*D`. Intervention 1 covers `[b0*D, b1*D)`.
//! As `t -> 0` the weights approach a hard 0/1 step while the gradient with
//! respect to the boundaries stays defined for every `t > 0`.

use anyhow::Result;
use candle_core::{DType, Device, IndexOp, Tensor, Var};
use rand::{Rng, SeedableRng};

/// Lower clamp applied to boundaries when reporting them
pub const BOUNDARY_MIN: f32 = 1e-3;

/// Upper clamp applied to boundaries when reporting them
pub const BOUNDARY_MAX: f32 = 1.0;

/// Initial value of both boundaries
pub const INITIAL_BOUNDARY: f32 = 0.5;

/// Temperature before the first optimizer step
pub const DEFAULT_TEMPERATURE: f64 = 50.0;

/// Number of simultaneous interventions the boundary pair can describe
pub const MAX_INTERVENTIONS: usize = 2;

/// Taylor terms for the matrix exponential (after scaling to norm <= 0.5)
const EXP_TAYLOR_TERMS: usize = 12;

/// Target norm before squaring in the scaling-and-squaring exponential
const EXP_SCALE_NORM: f32 = 0.5;

/// How the rotation starts out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationInit {
    /// Zero generator, `Q = I`
    #[default]
    Identity,
    /// Seeded random generator, `Q` a random rotation
    Random { seed: u64 },
}

/// Learnable rotation, boundaries and temperature
pub struct BoundaryMaskedRotation {
    generator: Var,
    boundaries: Var,
    /// Unit-cell centres `i + 0.5` for every rotated index, shape `[D]`
    population: Tensor,
    temperature: f64,
    hidden_size: usize,
    training: bool,
}

impl BoundaryMaskedRotation {
    /// Create the alignment parameters for a `hidden_size`-dimensional stream
    pub fn new(hidden_size: usize, init: RotationInit, device: &Device) -> Result<Self> {
        anyhow::ensure!(hidden_size > 0, "Hidden size must be positive");

        let generator = match init {
            RotationInit::Identity => {
                Tensor::zeros((hidden_size, hidden_size), DType::F32, device)?
            }
            RotationInit::Random { seed } => {
                let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
                let scale = 1.0 / (hidden_size as f32).sqrt();
                let values: Vec<f32> = (0..hidden_size * hidden_size)
                    .map(|_| rng.gen_range(-scale..scale))
                    .collect();
                Tensor::from_vec(values, (hidden_size, hidden_size), device)?
            }
        };
        let boundaries = Tensor::new(&[INITIAL_BOUNDARY; MAX_INTERVENTIONS], device)?;

        Self::from_parts(&generator, &boundaries, DEFAULT_TEMPERATURE)
    }

    /// Rebuild from stored tensors (generator `[D, D]`, boundaries `[2]`)
    pub fn from_parts(generator: &Tensor, boundaries: &Tensor, temperature: f64) -> Result<Self> {
        let (rows, cols) = generator.dims2()?;
        anyhow::ensure!(
            rows == cols,
            "Rotation generator must be square, got {rows}x{cols}"
        );
        anyhow::ensure!(
            boundaries.dims() == [MAX_INTERVENTIONS],
            "Expected {MAX_INTERVENTIONS} boundaries, got shape {:?}",
            boundaries.dims()
        );
        let device = generator.device();
        let centres: Vec<f32> = (0..rows).map(|i| i as f32 + 0.5).collect();

        Ok(Self {
            generator: Var::from_tensor(&generator.to_dtype(DType::F32)?)?,
            boundaries: Var::from_tensor(&boundaries.to_dtype(DType::F32)?.to_device(device)?)?,
            population: Tensor::from_vec(centres, rows, device)?,
            temperature,
            hidden_size: rows,
            training: true,
        })
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn device(&self) -> &Device {
        self.generator.device()
    }

    /// Switch between training (graph recorded) and eval (detached reads)
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Trainable handles: rotation generator first, then boundaries
    pub fn trainable_vars(&self) -> Vec<(&'static str, Var)> {
        vec![
            ("rotate_layer.generator", self.generator.clone()),
            ("intervention_boundaries", self.boundaries.clone()),
        ]
    }

    pub fn rotation_var(&self) -> &Var {
        &self.generator
    }

    pub fn boundary_var(&self) -> &Var {
        &self.boundaries
    }

    fn read(&self, var: &Var) -> Tensor {
        if self.training {
            var.as_tensor().clone()
        } else {
            var.as_detached_tensor()
        }
    }

    /// The orthogonal matrix `Q = exp(skew(W))`, shape `[D, D]`
    pub fn rotation_matrix(&self) -> Result<Tensor> {
        let w = self.read(&self.generator);
        let skew = ((&w - w.t()?)? * 0.5)?;
        matrix_exp(&skew)
    }

    /// `hidden @ Q`
    pub fn rotate(&self, hidden: &Tensor) -> Result<Tensor> {
        rotate_with(&self.rotation_matrix()?, hidden)
    }

    /// `hidden @ Q^T`, the inverse of [`rotate`](Self::rotate)
    pub fn unrotate(&self, hidden: &Tensor) -> Result<Tensor> {
        unrotate_with(&self.rotation_matrix()?, hidden)
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn set_temperature(&mut self, temperature: f64) {
        self.temperature = temperature;
    }

    /// Soft mask for an intervention at the current temperature, shape `[D]`
    pub fn mask(&self, intervention_id: usize) -> Result<Tensor> {
        self.mask_at(intervention_id, self.temperature)
    }

    /// Soft mask for an intervention at an explicit temperature, shape `[D]`
    pub fn mask_at(&self, intervention_id: usize, temperature: f64) -> Result<Tensor> {
        anyhow::ensure!(
            temperature > 0.0,
            "Temperature must be positive, got {temperature}"
        );
        let boundaries = self.read(&self.boundaries);
        let d = self.hidden_size as f64;

        match intervention_id {
            0 => {
                let upper = (boundaries.i(0)? * d)?;
                soft_below(&self.population, &upper, temperature)
            }
            1 => {
                let lower = (boundaries.i(0)? * d)?;
                let upper = (boundaries.i(1)? * d)?;
                let above = soft_below(&self.population, &lower, temperature)?.affine(-1.0, 1.0)?;
                let below = soft_below(&self.population, &upper, temperature)?;
                Ok((above * below)?)
            }
            other => anyhow::bail!(
                "Intervention id {other} out of range (supports {MAX_INTERVENTIONS})"
            ),
        }
    }

    /// One mask row per example, shape `[batch, D]`
    pub fn batch_mask(&self, intervention_ids: &[usize]) -> Result<Tensor> {
        anyhow::ensure!(!intervention_ids.is_empty(), "Empty intervention id list");
        let mut per_id: [Option<Tensor>; MAX_INTERVENTIONS] = [None, None];
        let mut rows = Vec::with_capacity(intervention_ids.len());
        for &id in intervention_ids {
            anyhow::ensure!(
                id < MAX_INTERVENTIONS,
                "Intervention id {id} out of range (supports {MAX_INTERVENTIONS})"
            );
            if per_id[id].is_none() {
                per_id[id] = Some(self.mask(id)?);
            }
            if let Some(mask) = &per_id[id] {
                rows.push(mask.clone());
            }
        }
        Ok(Tensor::stack(&rows, 0)?)
    }

    /// Raw (unclamped) boundary values
    pub fn boundaries(&self) -> Result<Vec<f32>> {
        Ok(self.boundaries.as_tensor().to_vec1::<f32>()?)
    }

    /// Boundaries clamped to `[BOUNDARY_MIN, BOUNDARY_MAX]`
    pub fn clamped_boundaries(&self) -> Result<[f32; MAX_INTERVENTIONS]> {
        let raw = self.boundaries()?;
        let mut out = [0.0; MAX_INTERVENTIONS];
        for (slot, value) in out.iter_mut().zip(raw) {
            *slot = value.clamp(BOUNDARY_MIN, BOUNDARY_MAX);
        }
        Ok(out)
    }

    pub fn set_boundaries(&self, values: [f32; MAX_INTERVENTIONS]) -> Result<()> {
        let tensor = Tensor::new(&values, self.device())?;
        self.boundaries.set(&tensor)?;
        Ok(())
    }

    /// Overwrite all parameters from stored values
    pub fn restore(&mut self, generator: &Tensor, boundaries: &Tensor, temperature: f64) -> Result<()> {
        anyhow::ensure!(
            generator.dims() == [self.hidden_size, self.hidden_size],
            "Stored rotation is {:?}, expected [{}, {}]",
            generator.dims(),
            self.hidden_size,
            self.hidden_size
        );
        let device = self.device().clone();
        self.generator
            .set(&generator.to_dtype(DType::F32)?.to_device(&device)?)?;
        self.boundaries
            .set(&boundaries.to_dtype(DType::F32)?.to_device(&device)?)?;
        self.temperature = temperature;
        Ok(())
    }
}

/// `hidden @ q`, computed in f32 and returned in f32
pub(crate) fn rotate_with(q: &Tensor, hidden: &Tensor) -> Result<Tensor> {
    Ok(hidden.to_dtype(DType::F32)?.broadcast_matmul(q)?)
}

/// `rotated @ q^T`
pub(crate) fn unrotate_with(q: &Tensor, rotated: &Tensor) -> Result<Tensor> {
    Ok(rotated
        .to_dtype(DType::F32)?
        .broadcast_matmul(&q.t()?.contiguous()?)?)
}

/// `sigmoid((cut - population) / t)`, evaluated through tanh for stability
fn soft_below(population: &Tensor, cut: &Tensor, temperature: f64) -> Result<Tensor> {
    let x = (cut.broadcast_sub(population)? / temperature)?;
    Ok((((x * 0.5)?.tanh()? + 1.0)? * 0.5)?)
}

fn identity(n: usize, device: &Device) -> Result<Tensor> {
    let mut values = vec![0f32; n * n];
    for i in 0..n {
        values[i * n + i] = 1.0;
    }
    Ok(Tensor::from_vec(values, (n, n), device)?)
}

/// Matrix exponential by scaling and squaring with a truncated Taylor series.
///
/// Built only from matmul and elementwise ops, so gradients flow through it.
fn matrix_exp(a: &Tensor) -> Result<Tensor> {
    let n = a.dim(0)?;
    let norm = a.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()?;
    let squarings = if norm > EXP_SCALE_NORM {
        (norm / EXP_SCALE_NORM).log2().ceil() as i32
    } else {
        0
    };
    let scaled = (a / 2f64.powi(squarings))?;

    let eye = identity(n, a.device())?;
    let mut result = eye.clone();
    let mut term = eye;
    for k in 1..=EXP_TAYLOR_TERMS {
        term = (term.matmul(&scaled)? / k as f64)?;
        result = (result + &term)?;
    }
    for _ in 0..squarings {
        result = result.matmul(&result)?;
    }
    Ok(result)
}
