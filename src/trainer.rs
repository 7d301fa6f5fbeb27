//! Host training loop
//!
//! The loop is fixed; per-batch customization goes through
//! [`crate::hooks::LoopHooks`] and coarse control through
//! [`crate::callbacks::Callback`]. Per batch the trainer calls
//! `process_batch` → `forward_call`, computes the loss, runs backward,
//! calls `prepare_for_optimizer_step`, steps the optimizer, then runs
//! `prepare_for_metrics_update` and `cache_for_epoch_metrics` so epoch
//! metrics can be aggregated over detached, host-resident tensors.
//!
//! Two training modes, as in the classic Keras-style loops:
//! - fast (default): train metrics come from the predictions cached during
//!   the optimization pass;
//! - precise: a second forward pass over the training set after the epoch's
//!   updates, so train metrics reflect the post-update parameters.
//!
//! When the loader carries per-sample weights, the trailing weight column is
//! stripped before batch decomposition; the per-sample loss is multiplied by
//! the weights before reduction and backward, and the loss metric is weighted
//! the same way. This requires a loss that keeps the batch dimension
//! (`Reduction::None`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use candle_core::{Device, Tensor, Var};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, info};

use crate::callbacks::{Callback, CallbackAction, CallbackContext, Event};
use crate::data::DataLoader;
use crate::error::{Error, Result};
use crate::hooks::{Forward, HookContext, LoopHooks, Phase};
use crate::losses::Loss;
use crate::metrics::Metric;
use crate::optimizers::NamedOptimizer;

/// Per-epoch metric rows collected over a training run.
///
/// Column order is fixed on the first epoch: train metrics, then validation
/// metrics under a `val_` prefix, then `lr`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct History {
    columns: Vec<String>,
    rows: Vec<HashMap<String, f64>>,
}

impl History {
    /// Ordered column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// One metrics row per completed epoch.
    pub fn rows(&self) -> &[HashMap<String, f64>] {
        &self.rows
    }

    /// Number of completed epochs.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True before the first epoch completes.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The latest epoch's row.
    pub fn last(&self) -> Option<&HashMap<String, f64>> {
        self.rows.last()
    }

    /// A metric value at a given epoch (0-based row index).
    pub fn get(&self, epoch: usize, column: &str) -> Option<f64> {
        self.rows.get(epoch).and_then(|row| row.get(column)).copied()
    }

    /// Serialize the history as pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    fn push(&mut self, ordered: Vec<(String, f64)>) {
        if self.columns.is_empty() {
            self.columns = ordered.iter().map(|(k, _)| k.clone()).collect();
        }
        self.rows.push(ordered.into_iter().collect());
    }
}

/// Drives epochs and batches over an externally-owned model.
pub struct Trainer {
    model: Arc<dyn Forward>,
    vars: Vec<Var>,
    optimizer: NamedOptimizer,
    loss: Arc<dyn Loss>,
    metrics: Vec<(String, Box<dyn Metric>)>,
    device: Device,
    hooks: Box<dyn LoopHooks>,
    rng: StdRng,
    phase: Phase,
}

/// Options for one [`Trainer::run`] invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Number of epochs to train.
    pub max_epochs: usize,
    /// 0: silent, 1: one log line per epoch, 2: compact line per epoch.
    pub verbose: u8,
    /// Recompute train metrics with a second pass after each epoch.
    pub precise_train_metrics: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_epochs: 1,
            verbose: 1,
            precise_train_metrics: false,
        }
    }
}

impl Trainer {
    /// Assemble a trainer from the compile step's parts. The metric list
    /// must already contain the loss column.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model: Arc<dyn Forward>,
        vars: Vec<Var>,
        optimizer: NamedOptimizer,
        loss: Arc<dyn Loss>,
        metrics: Vec<(String, Box<dyn Metric>)>,
        device: Device,
        hooks: Box<dyn LoopHooks>,
        seed: u64,
    ) -> Self {
        Self {
            model,
            vars,
            optimizer,
            loss,
            metrics,
            device,
            hooks,
            rng: StdRng::seed_from_u64(seed),
            phase: Phase::Eval,
        }
    }

    /// The phase most recently set by the loop.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Current learning rate.
    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// The device batches are moved to.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Run the training loop.
    pub fn run(
        &mut self,
        train_loader: &DataLoader,
        val_loader: Option<&DataLoader>,
        options: &RunOptions,
        callbacks: &mut [Box<dyn Callback>],
    ) -> Result<History> {
        let mut history = History::default();

        if options.verbose > 0 {
            match val_loader {
                Some(val) => info!(
                    "Train on {} samples, validate on {} samples",
                    train_loader.num_samples(),
                    val.num_samples()
                ),
                None => info!("Train on {} samples", train_loader.num_samples()),
            }
        }

        self.fire(Event::TrainBegin, 0, options.max_epochs, &mut history, callbacks)?;

        for epoch in 1..=options.max_epochs {
            let epoch_start = Instant::now();

            self.phase = Phase::Train;
            let ctx = HookContext::new(Phase::Train, epoch);
            self.hooks.on_epoch_begin(&ctx)?;
            let stop = self.fire(Event::EpochBegin, epoch, options.max_epochs, &mut history, callbacks)?;
            if stop {
                break;
            }

            let train_metrics = if options.precise_train_metrics {
                self.train_precise(train_loader, epoch)?
            } else {
                self.train_fast(train_loader, epoch)?
            };

            let val_metrics = match val_loader {
                Some(loader) => Some(self.eval_pass(loader, epoch)?),
                None => None,
            };

            let mut row = train_metrics;
            if let Some(val) = val_metrics {
                row.extend(val.into_iter().map(|(k, v)| (format!("val_{k}"), v)));
            }
            row.push(("lr".to_string(), self.optimizer.learning_rate()));

            self.log_epoch(epoch, options.max_epochs, epoch_start.elapsed().as_secs_f64(), &row, options.verbose);
            history.push(row);

            let stop = self.fire(Event::EpochEnd, epoch, options.max_epochs, &mut history, callbacks)?;
            if stop {
                break;
            }
        }

        self.fire(Event::TrainEnd, history.len(), options.max_epochs, &mut history, callbacks)?;
        Ok(history)
    }

    /// Evaluate loss and metrics over a loader without touching parameters.
    /// The hook context carries epoch 0, marking a pass outside a fit run.
    pub fn evaluate(&mut self, loader: &DataLoader) -> Result<HashMap<String, f64>> {
        Ok(self.eval_pass(loader, 0)?.into_iter().collect())
    }

    /// One optimization pass; train metrics come from cached predictions.
    fn train_fast(&mut self, loader: &DataLoader, epoch: usize) -> Result<Vec<(String, f64)>> {
        self.phase = Phase::Train;
        let ctx = HookContext::new(Phase::Train, epoch);
        let weighted = loader.has_sample_weights();
        let batches: Vec<Vec<Tensor>> = loader.epoch_iter(&mut self.rng)?.collect::<Result<_>>()?;

        let mut cached_preds = Vec::with_capacity(batches.len());
        let mut cached_targets = Vec::with_capacity(batches.len());
        let mut cached_weights = Vec::with_capacity(batches.len());

        for batch in batches {
            let (batch, weights) = split_weight_column(batch, weighted)?;
            let (y_pred, y_true) = self.train_step(&ctx, batch, weights.as_ref())?;
            let (y_pred, y_true) = self.hooks.prepare_for_metrics_update(&ctx, y_pred, y_true)?;
            let (p, t) = self.hooks.cache_for_epoch_metrics(&ctx, &y_pred, &y_true)?;
            cached_preds.push(p);
            cached_targets.push(t);
            if let Some(w) = weights {
                cached_weights.push(w.detach().to_device(&Device::Cpu)?);
            }
        }

        let y_pred = concat_cached(&cached_preds)?;
        let y_true = concat_cached(&cached_targets)?;
        let weights = if weighted {
            Some(concat_cached(&cached_weights)?)
        } else {
            None
        };
        self.compute_metrics(&y_pred, &y_true, weights.as_ref())
    }

    /// One optimization pass, then a dedicated metrics pass over the same
    /// loader so metrics reflect the post-update parameters.
    fn train_precise(&mut self, loader: &DataLoader, epoch: usize) -> Result<Vec<(String, f64)>> {
        self.phase = Phase::Train;
        let ctx = HookContext::new(Phase::Train, epoch);
        let weighted = loader.has_sample_weights();
        let batches: Vec<Vec<Tensor>> = loader.epoch_iter(&mut self.rng)?.collect::<Result<_>>()?;
        for batch in batches {
            let (batch, weights) = split_weight_column(batch, weighted)?;
            self.train_step(&ctx, batch, weights.as_ref())?;
        }
        self.eval_pass(loader, epoch)
    }

    /// Forward, loss, backward, optimizer step for one batch.
    fn train_step(
        &mut self,
        ctx: &HookContext,
        batch: Vec<Tensor>,
        weights: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor)> {
        let batch = self.to_device(batch)?;
        let (inputs, y_true) = self.hooks.process_batch(ctx, batch)?;
        let y_pred = self.hooks.forward_call(ctx, self.model.as_ref(), &inputs)?;

        let loss = self.loss.compute(&y_pred, &y_true)?;
        let loss = match weights {
            Some(w) => {
                if loss.dims().is_empty() {
                    return Err(Error::data(
                        "sample weights require a loss configured with Reduction::None",
                    ));
                }
                (loss * w.to_device(&self.device)?)?.mean_all()?
            }
            // Reduce to a scalar in case the loss is configured per-sample.
            None => loss.mean_all()?,
        };
        let mut grads = loss.backward()?;
        self.hooks.prepare_for_optimizer_step(ctx, &self.vars, &mut grads)?;
        self.optimizer.step(&grads)?;

        debug!(epoch = ctx.epoch(), loss = loss.to_scalar::<f32>()? as f64, "step");
        Ok((y_pred, y_true))
    }

    /// Forward-only pass: loss and metrics, no parameter updates.
    fn eval_pass(&mut self, loader: &DataLoader, epoch: usize) -> Result<Vec<(String, f64)>> {
        self.phase = Phase::Eval;
        let ctx = HookContext::new(Phase::Eval, epoch);
        let weighted = loader.has_sample_weights();
        let batches: Vec<Vec<Tensor>> = loader.epoch_iter(&mut self.rng)?.collect::<Result<_>>()?;

        let mut cached_preds = Vec::with_capacity(batches.len());
        let mut cached_targets = Vec::with_capacity(batches.len());
        let mut cached_weights = Vec::with_capacity(batches.len());

        for batch in batches {
            let batch = self.to_device(batch)?;
            let (batch, weights) = split_weight_column(batch, weighted)?;
            let (inputs, y_true) = self.hooks.process_batch(&ctx, batch)?;
            let y_pred = self.hooks.forward_call(&ctx, self.model.as_ref(), &inputs)?;
            let (y_pred, y_true) = self.hooks.prepare_for_metrics_update(&ctx, y_pred, y_true)?;
            let (p, t) = self.hooks.cache_for_epoch_metrics(&ctx, &y_pred, &y_true)?;
            cached_preds.push(p);
            cached_targets.push(t);
            if let Some(w) = weights {
                cached_weights.push(w.detach().to_device(&Device::Cpu)?);
            }
        }

        let y_pred = concat_cached(&cached_preds)?;
        let y_true = concat_cached(&cached_targets)?;
        let weights = if weighted {
            Some(concat_cached(&cached_weights)?)
        } else {
            None
        };
        self.compute_metrics(&y_pred, &y_true, weights.as_ref())
    }

    fn compute_metrics(
        &self,
        y_pred: &Tensor,
        y_true: &Tensor,
        weights: Option<&Tensor>,
    ) -> Result<Vec<(String, f64)>> {
        self.metrics
            .iter()
            .map(|(name, metric)| {
                let value = match weights {
                    Some(w) => metric.compute_weighted(y_pred, y_true, w)?,
                    None => metric.compute(y_pred, y_true)?,
                };
                Ok((name.clone(), value))
            })
            .collect()
    }

    fn to_device(&self, batch: Vec<Tensor>) -> Result<Vec<Tensor>> {
        batch
            .into_iter()
            .map(|t| Ok(t.to_device(&self.device)?))
            .collect()
    }

    fn fire(
        &mut self,
        event: Event,
        epoch: usize,
        max_epochs: usize,
        history: &mut History,
        callbacks: &mut [Box<dyn Callback>],
    ) -> Result<bool> {
        let empty = HashMap::new();
        let mut requested_lr = None;
        let mut stop = false;
        for callback in callbacks.iter_mut() {
            let ctx = CallbackContext {
                epoch,
                max_epochs,
                metrics: history.last().unwrap_or(&empty),
                learning_rate: self.optimizer.learning_rate(),
            };
            match callback.on_event(event, &ctx)? {
                CallbackAction::Continue => {}
                CallbackAction::Stop => stop = true,
                CallbackAction::SetLearningRate(lr) => requested_lr = Some(lr),
            }
        }
        if let Some(lr) = requested_lr {
            self.optimizer.set_learning_rate(lr);
        }
        Ok(stop)
    }

    fn log_epoch(&self, epoch: usize, max_epochs: usize, seconds: f64, row: &[(String, f64)], verbose: u8) {
        if verbose == 0 {
            return;
        }
        let time_str = if seconds < 10.0 {
            format!("{:.1}s", seconds)
        } else {
            format!("{}s", (seconds + 0.5) as u64)
        };
        let mut parts = vec![format!("Epoch {epoch}/{max_epochs}"), time_str];
        for (key, value) in row {
            if key == "lr" {
                parts.push(format!("lr: {value:.0e}"));
            } else {
                parts.push(format!("{key}: {value:.4}"));
            }
        }
        if verbose == 1 {
            info!("{}", parts.join(" - "));
        } else {
            info!("{}", parts.join("|").replace(' ', "").replace("Epoch", ""));
        }
    }
}

/// Pop the trailing weight column off a weighted batch; pass unweighted
/// batches through untouched.
fn split_weight_column(
    mut batch: Vec<Tensor>,
    weighted: bool,
) -> Result<(Vec<Tensor>, Option<Tensor>)> {
    if !weighted {
        return Ok((batch, None));
    }
    let weights = batch
        .pop()
        .ok_or_else(|| Error::data("weighted batch is empty"))?;
    Ok((batch, Some(weights)))
}

fn concat_cached(parts: &[Tensor]) -> Result<Tensor> {
    if parts.is_empty() {
        return Err(Error::data("epoch produced no batches"));
    }
    Ok(Tensor::cat(parts, 0)?)
}
