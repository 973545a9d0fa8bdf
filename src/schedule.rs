//! Training schedules: temperature annealing and learning-rate warmup

/// Linearly spaced temperatures, one per training step
#[derive(Debug, Clone)]
pub struct TemperatureSchedule {
    values: Vec<f64>,
}

impl TemperatureSchedule {
    /// `n_steps` values from `start` to `end`, inclusive of both ends.
    ///
    /// A single-step schedule holds only `end`; zero steps is empty.
    pub fn linear(start: f64, end: f64, n_steps: usize) -> Self {
        let values = match n_steps {
            0 => Vec::new(),
            1 => vec![end],
            n => {
                let last = (n - 1) as f64;
                (0..n)
                    .map(|i| {
                        if i == n - 1 {
                            end
                        } else {
                            start + (end - start) * i as f64 / last
                        }
                    })
                    .collect()
            }
        };
        Self { values }
    }

    /// Temperature for `step`; steps past the end hold the final value
    pub fn at(&self, step: usize) -> Option<f64> {
        self.values
            .get(step)
            .or_else(|| self.values.last())
            .copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }
}

/// Linear warmup then linear decay to zero, as a multiplier on the base lr
#[derive(Debug, Clone, Copy)]
pub struct LinearWarmup {
    warmup_steps: usize,
    total_steps: usize,
}

impl LinearWarmup {
    pub fn new(warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            warmup_steps,
            total_steps,
        }
    }

    /// Warmup given as a fraction of the total update count
    pub fn from_fraction(fraction: f64, total_steps: usize) -> Self {
        let warmup = (fraction.max(0.0) * total_steps as f64) as usize;
        Self::new(warmup, total_steps)
    }

    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }

    /// Multiplier after `step` optimizer updates
    pub fn factor(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return step as f64 / self.warmup_steps.max(1) as f64;
        }
        let decay_span = self.total_steps.saturating_sub(self.warmup_steps).max(1);
        let remaining = self.total_steps.saturating_sub(step);
        (remaining as f64 / decay_span as f64).max(0.0)
    }
}
