//! Boundless DAS training loop
//!
//! Trains the rotation and the interval boundaries against counterfactual
//! labels while the backend stays frozen. A run walks through
//! `Init → PrealignEval → (TrainStep ⇄ PeriodicEval)* → FinalEval → Done`.
//!
//! ## Update rule
//!
//! Each step back-propagates `loss / gradient_accumulation_steps` right away
//! and adds the resulting gradients to a running sum, so only one forward
//! graph is alive at a time. Every `gradient_accumulation_steps` steps (and at
//! the last step) two Adam optimizers step on the summed gradients: one over
//! the rotation generator (`lr`) and one over the boundaries (`boundary_lr`).
//! Both learning rates follow a linear warmup/decay, and the mask temperature
//! is pushed down the linear annealing schedule.

use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::checkpoint::{save_alignment, CheckpointPaths};
use crate::data::{Batch, TokenCodec};
use crate::metrics::{
    Accuracy, MetricSink, EVAL_ACCURACY, PREALIGN_ACCURACY, TEST_ACCURACY, TRAIN_BOUNDARY0,
    TRAIN_BOUNDARY1, TRAIN_LOSS, TRAIN_STEP_ACCURACY, TRAIN_TEMPERATURE,
};
use crate::model::AlignableModel;
use crate::schedule::{LinearWarmup, TemperatureSchedule};

/// Optimization hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingArgs {
    /// Learning rate of the rotation generator
    pub lr: f64,
    /// Learning rate of the interval boundaries
    pub boundary_lr: f64,
    /// Fraction of optimizer updates spent warming up
    pub warm_up: f64,
    pub epochs: usize,
    pub gradient_accumulation_steps: usize,
    pub log_step: usize,
    pub valid_steps: usize,
    pub temperature_start: f64,
    pub temperature_end: f64,
    /// Tokens generated per evaluation example
    pub max_new_tokens: usize,
}

impl Default for TrainingArgs {
    fn default() -> Self {
        Self {
            lr: 0.01,
            boundary_lr: 1e-2,
            warm_up: 0.1,
            epochs: 10,
            gradient_accumulation_steps: 1,
            log_step: 10,
            valid_steps: 500,
            temperature_start: 50.0,
            temperature_end: 0.1,
            max_new_tokens: 1,
        }
    }
}

impl TrainingArgs {
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.gradient_accumulation_steps > 0,
            "gradient_accumulation_steps must be positive"
        );
        anyhow::ensure!(self.log_step > 0, "log_step must be positive");
        anyhow::ensure!(self.valid_steps > 0, "valid_steps must be positive");
        anyhow::ensure!(self.max_new_tokens > 0, "max_new_tokens must be positive");
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.warm_up),
            "warm_up must be a fraction in [0, 1], got {}",
            self.warm_up
        );
        anyhow::ensure!(
            self.temperature_end > 0.0 && self.temperature_start >= self.temperature_end,
            "Temperature must anneal downwards to a positive value ({} -> {})",
            self.temperature_start,
            self.temperature_end
        );
        Ok(())
    }
}

/// Where a run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignerPhase {
    Init,
    PrealignEval,
    TrainStep,
    PeriodicEval,
    FinalEval,
    Done,
}

/// Summary of a finished training run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainReport {
    pub total_steps: usize,
    pub optimizer_steps: usize,
    pub last_loss: Option<f64>,
    pub best_dev_accuracy: Option<f64>,
    pub test_accuracy: f64,
    pub boundaries: [f32; 2],
    pub temperature: f64,
}

/// Drives prealign evaluation, training and final evaluation for one run
pub struct Aligner<'a> {
    model: &'a mut AlignableModel,
    codec: &'a dyn TokenCodec,
    sink: &'a mut dyn MetricSink,
    checkpoints: CheckpointPaths,
    run_name: String,
    max_new_tokens: usize,
    phase: AlignerPhase,
}

impl<'a> Aligner<'a> {
    pub fn new(
        model: &'a mut AlignableModel,
        codec: &'a dyn TokenCodec,
        sink: &'a mut dyn MetricSink,
        checkpoints: CheckpointPaths,
        run_name: impl Into<String>,
    ) -> Self {
        Self {
            model,
            codec,
            sink,
            checkpoints,
            run_name: run_name.into(),
            max_new_tokens: 1,
            phase: AlignerPhase::Init,
        }
    }

    /// Tokens generated per evaluation example (default 1)
    pub fn with_max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens.max(1);
        self
    }

    pub fn phase(&self) -> AlignerPhase {
        self.phase
    }

    pub fn model(&self) -> &AlignableModel {
        self.model
    }

    /// Task accuracy of the unmodified model on plain prompts
    ///
    /// A low number means the alignment search has nothing to find, but the
    /// run continues either way.
    pub fn prealign_eval(&mut self, batches: &[Batch]) -> Result<f64> {
        self.phase = AlignerPhase::PrealignEval;
        self.model.set_training(false);
        let result = self.prealign_batches(batches);
        self.model.set_training(true);
        let accuracy = result?;

        if accuracy.is_empty() {
            warn!("Prealign evaluation set is empty");
        }
        let value = accuracy.rounded();
        warn!("[WARNING: THIS NEEDS TO BE GOOD!] prealign task accuracy: {value}");
        self.sink.log_metric(PREALIGN_ACCURACY, value, 0)?;
        Ok(value)
    }

    fn prealign_batches(&self, batches: &[Batch]) -> Result<Accuracy> {
        let mut accuracy = Accuracy::default();
        for batch in batches {
            let batch = batch.to_device(self.model.device())?;
            let predictions = self
                .model
                .generate_plain(&batch.input_ids, self.max_new_tokens)?;
            let targets = self.model.target_tokens(&batch)?;
            accuracy.merge(score(self.codec, &predictions, &targets)?);
        }
        Ok(accuracy)
    }

    /// Interchange accuracy with the current alignment, in eval mode
    pub fn evaluate(&mut self, batches: &[Batch]) -> Result<Accuracy> {
        self.model.set_training(false);
        let result = self.evaluate_batches(batches);
        self.model.set_training(true);
        let accuracy = result?;
        if accuracy.is_empty() {
            warn!("Evaluation set is empty");
        }
        Ok(accuracy)
    }

    fn evaluate_batches(&self, batches: &[Batch]) -> Result<Accuracy> {
        let mut accuracy = Accuracy::default();
        for batch in batches {
            let batch = batch.to_device(self.model.device())?;
            let source = self.model.forward_source(batch.require_source()?)?;
            let predictions = self.model.generate_intervened(
                &batch.input_ids,
                &source,
                batch.require_intervention_ids()?,
                self.max_new_tokens,
            )?;
            let targets = self.model.target_tokens(&batch)?;
            accuracy.merge(score(self.codec, &predictions, &targets)?);
        }
        Ok(accuracy)
    }

    /// Train the alignment, then score it on `test` and save `rotate-last`
    pub fn train(
        &mut self,
        train: &[Batch],
        dev: &[Batch],
        test: &[Batch],
        args: &TrainingArgs,
    ) -> Result<TrainReport> {
        args.validate()?;
        self.max_new_tokens = args.max_new_tokens;
        self.sink.start_training()?;
        self.model.set_training(true);

        let target_total_step = train.len() * args.epochs;
        let schedule = TemperatureSchedule::linear(
            args.temperature_start,
            args.temperature_end,
            target_total_step,
        );
        let warmup = LinearWarmup::from_fraction(args.warm_up, target_total_step);
        self.model
            .rotation_mut()
            .set_temperature(args.temperature_start);

        let rotation = self.model.rotation();
        let mut rotation_opt = AdamW::new(
            vec![rotation.rotation_var().clone()],
            ParamsAdamW {
                lr: args.lr,
                weight_decay: 0.0,
                ..Default::default()
            },
        )?;
        let mut boundary_opt = AdamW::new(
            vec![rotation.boundary_var().clone()],
            ParamsAdamW {
                lr: args.boundary_lr,
                weight_decay: 0.0,
                ..Default::default()
            },
        )?;

        info!(
            "Training {} batches x {} epochs = {} steps ({} warmup updates, accumulation {})",
            train.len(),
            args.epochs,
            target_total_step,
            warmup.warmup_steps(),
            args.gradient_accumulation_steps
        );

        let gacc = args.gradient_accumulation_steps;
        let mut total_step = 0usize;
        let mut optimizer_steps = 0usize;
        let mut accumulated = GradAccumulator::new(
            self.model
                .trainable_parameters()
                .into_iter()
                .map(|(_, var)| var)
                .collect(),
        );
        let mut last_loss = None;
        let mut best_dev: Option<f64> = None;

        for epoch in 0..args.epochs {
            debug!("Epoch {epoch}");
            for batch in train {
                self.phase = AlignerPhase::TrainStep;
                let batch = batch.to_device(self.model.device())?;
                let source = self.model.forward_source(batch.require_source()?)?;
                let output = self.model.forward_intervened(
                    &batch.input_ids,
                    &source,
                    batch.require_intervention_ids()?,
                    Some(self.model.training_labels(&batch)),
                )?;
                let loss = output.loss.context("Intervened forward returned no loss")?;
                let loss_value = loss.to_scalar::<f32>()? as f64;
                last_loss = Some(loss_value);
                accumulated.add(&loss, gacc)?;

                if total_step % args.log_step == 0 {
                    let predictions = self.model.step_predictions(&output.logits)?;
                    let targets = self.model.target_tokens(&batch)?;
                    let step_accuracy = score(self.codec, &predictions, &targets)?.rounded();
                    self.log_train_metrics(total_step, loss_value, step_accuracy)?;
                }

                if total_step > 0 && total_step % args.valid_steps == 0 {
                    self.phase = AlignerPhase::PeriodicEval;
                    let accuracy = self.evaluate(dev)?.rounded();
                    self.sink.log_metric(EVAL_ACCURACY, accuracy, total_step)?;
                    if best_dev.map_or(true, |best| accuracy > best) {
                        info!("New best dev accuracy {accuracy} at step {total_step}");
                        best_dev = Some(accuracy);
                        save_alignment(&self.checkpoints.best(), self.model.rotation(), &self.run_name)?;
                    }
                    self.phase = AlignerPhase::TrainStep;
                }

                let is_last = total_step + 1 == target_total_step;
                if (total_step + 1) % gacc == 0 || is_last {
                    if let Some(grads) = accumulated.take() {
                        let factor = warmup.factor(optimizer_steps);
                        rotation_opt.set_learning_rate(args.lr * factor);
                        boundary_opt.set_learning_rate(args.boundary_lr * factor);
                        rotation_opt.step(&grads)?;
                        boundary_opt.step(&grads)?;
                        optimizer_steps += 1;
                    }
                    if let Some(temperature) = schedule.at(total_step) {
                        self.model.rotation_mut().set_temperature(temperature);
                    }
                }
                total_step += 1;
            }
        }
        info!("Training is finished after {total_step} steps ({optimizer_steps} updates)");

        self.phase = AlignerPhase::FinalEval;
        let test_accuracy = self.evaluate(test)?.rounded();
        self.sink.log_metric(TEST_ACCURACY, test_accuracy, total_step)?;
        info!("Test accuracy: {test_accuracy}");

        save_alignment(&self.checkpoints.last(), self.model.rotation(), &self.run_name)?;
        info!("Saved final alignment to {}", self.checkpoints.last().display());
        self.sink.finish()?;
        self.phase = AlignerPhase::Done;

        Ok(TrainReport {
            total_steps: total_step,
            optimizer_steps,
            last_loss,
            best_dev_accuracy: best_dev,
            test_accuracy,
            boundaries: self.model.rotation().clamped_boundaries()?,
            temperature: self.model.rotation().temperature(),
        })
    }

    fn log_train_metrics(&mut self, step: usize, loss: f64, accuracy: f64) -> Result<()> {
        let [b0, b1] = self.model.rotation().clamped_boundaries()?;
        let temperature = self.model.rotation().temperature();
        debug!(
            "step {step}: loss {loss:.4} acc {accuracy} temperature {temperature:.3} boundaries [{b0:.3}, {b1:.3}]"
        );
        self.sink.log_train_step(step, loss, accuracy)?;
        self.sink.log_metric(TRAIN_LOSS, loss, step)?;
        self.sink.log_metric(TRAIN_STEP_ACCURACY, accuracy, step)?;
        self.sink.log_metric(TRAIN_TEMPERATURE, temperature, step)?;
        self.sink.log_metric(TRAIN_BOUNDARY0, b0 as f64, step)?;
        self.sink.log_metric(TRAIN_BOUNDARY1, b1 as f64, step)?;
        Ok(())
    }
}

/// Running sum of the trainable vars' gradients between optimizer updates
struct GradAccumulator {
    vars: Vec<Var>,
    grads: Option<GradStore>,
}

impl GradAccumulator {
    fn new(vars: Vec<Var>) -> Self {
        Self { vars, grads: None }
    }

    /// Back-propagate `loss / scale` now and add its gradients to the sum
    fn add(&mut self, loss: &Tensor, scale: usize) -> Result<()> {
        let mut step = (loss / scale as f64)?.backward()?;
        let merged = match self.grads.take() {
            None => step,
            Some(mut sum) => {
                for var in &self.vars {
                    let Some(grad) = step.remove(var.as_tensor()) else {
                        continue;
                    };
                    let total = match sum.get(var.as_tensor()) {
                        Some(prev) => prev.add(&grad)?,
                        None => grad,
                    };
                    sum.insert(var.as_tensor(), total);
                }
                sum
            }
        };
        self.grads = Some(merged);
        Ok(())
    }

    /// Summed gradients since the last call, if any step was added
    fn take(&mut self) -> Option<GradStore> {
        self.grads.take()
    }
}

/// Exact-match accuracy of decoded predictions against decoded targets
pub fn score(codec: &dyn TokenCodec, predictions: &[Vec<u32>], targets: &[u32]) -> Result<Accuracy> {
    anyhow::ensure!(
        predictions.len() == targets.len(),
        "{} predictions for {} targets",
        predictions.len(),
        targets.len()
    );
    let mut accuracy = Accuracy::default();
    for (prediction, &target) in predictions.iter().zip(targets) {
        let predicted = codec.decode(prediction, true)?;
        let expected = codec.decode(&[target], true)?;
        accuracy.record_pairs([(predicted.as_str(), expected.as_str())]);
    }
    Ok(accuracy)
}
