//! Keras-style model wrapper
//!
//! [`Learner`] wraps an externally-owned model and its `VarMap` with a
//! compile/fit/evaluate/predict surface. The compile step resolves losses,
//! metrics and optimizers given by name through the fixed lookup tables and
//! retains the caller's hook set for the rest of the model's training
//! lifetime.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use tracing::info;

use crate::callbacks::Callback;
use crate::data::{random_split, DataLoader, TensorDataset};
use crate::error::{Error, Result};
use crate::hooks::{DefaultHooks, Forward, LoopHooks, Phase};
use crate::losses::{create_loss_by_name, Loss};
use crate::metrics::{create_metric_by_name, LossMetric, Metric};
use crate::optimizers::{create_optimizer_by_name, NamedOptimizer, OptimizerConfig};
use crate::trainer::{History, RunOptions, Trainer};

/// Optimizer given by name or explicit hyperparameters.
pub enum OptimizerSpec {
    /// Lookup-table name (`sgd`, `adam`, `adamw`).
    Named(String),
    /// Explicit configuration.
    Config(OptimizerConfig),
}

impl From<&str> for OptimizerSpec {
    fn from(name: &str) -> Self {
        Self::Named(name.to_string())
    }
}

impl From<OptimizerConfig> for OptimizerSpec {
    fn from(config: OptimizerConfig) -> Self {
        Self::Config(config)
    }
}

/// Loss given by name or as an instance.
pub enum LossSpec {
    /// Lookup-table name (`mse`, `mae`, `ce`, `bce`).
    Named(String),
    /// A caller-supplied loss.
    Instance(Box<dyn Loss>),
}

impl From<&str> for LossSpec {
    fn from(name: &str) -> Self {
        Self::Named(name.to_string())
    }
}

impl LossSpec {
    /// Wrap a concrete loss instance.
    pub fn custom(loss: impl Loss + 'static) -> Self {
        Self::Instance(Box::new(loss))
    }
}

/// Metric given by name or as a named instance.
pub enum MetricSpec {
    /// Lookup-table name; the column uses the metric's abbreviation.
    Named(String),
    /// A caller-supplied metric under an explicit column name.
    Instance(String, Box<dyn Metric>),
}

impl From<&str> for MetricSpec {
    fn from(name: &str) -> Self {
        Self::Named(name.to_string())
    }
}

impl MetricSpec {
    /// Wrap a concrete metric under the given column name.
    pub fn custom(name: impl Into<String>, metric: impl Metric + 'static) -> Self {
        Self::Instance(name.into(), Box::new(metric))
    }
}

/// Configuration for the compile step.
pub struct CompileOptions {
    optimizer: OptimizerSpec,
    loss: LossSpec,
    metrics: Vec<MetricSpec>,
    device: Option<Device>,
    hooks: Option<Box<dyn LoopHooks>>,
    seed: u64,
}

impl CompileOptions {
    /// Compile with the given optimizer and loss; metrics and hooks are
    /// added through the builder methods.
    pub fn new(optimizer: impl Into<OptimizerSpec>, loss: impl Into<LossSpec>) -> Self {
        Self {
            optimizer: optimizer.into(),
            loss: loss.into(),
            metrics: Vec::new(),
            device: None,
            hooks: None,
            seed: 42,
        }
    }

    /// Track an additional metric during training and evaluation.
    pub fn with_metric(mut self, metric: impl Into<MetricSpec>) -> Self {
        self.metrics.push(metric.into());
        self
    }

    /// Pin the device instead of inferring it from the model's vars.
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    /// Install a hook set; defaults to [`DefaultHooks`].
    pub fn with_hooks(mut self, hooks: impl LoopHooks + 'static) -> Self {
        self.hooks = Some(Box::new(hooks));
        self
    }

    /// Seed for batch shuffling.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// How `fit` obtains validation data.
#[derive(Default)]
pub enum Validation {
    /// No validation pass.
    #[default]
    None,
    /// Hold out this fraction of the training data, seeded split.
    Split(f64),
    /// Explicit `(x, y)` validation set.
    Data(Tensor, Tensor),
}

/// Options for one `fit` call.
pub struct FitOptions {
    /// Number of epochs.
    pub epochs: usize,
    /// Samples per batch.
    pub batch_size: usize,
    /// Reshuffle the training data every epoch.
    pub shuffle: bool,
    /// Validation source.
    pub validation: Validation,
    /// Per-sample loss weights, aligned with `x` along the first dimension.
    /// Requires a loss configured with a per-sample reduction.
    pub sample_weight: Option<Tensor>,
    /// Seed for the validation split.
    pub val_split_seed: u64,
    /// Callbacks for this run.
    pub callbacks: Vec<Box<dyn Callback>>,
    /// 0: silent, 1: per-epoch log line, 2: compact.
    pub verbose: u8,
    /// Recompute train metrics after each epoch's updates.
    pub precise_train_metrics: bool,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            epochs: 1,
            batch_size: 32,
            shuffle: true,
            validation: Validation::None,
            sample_weight: None,
            val_split_seed: 7,
            callbacks: Vec::new(),
            verbose: 1,
            precise_train_metrics: false,
        }
    }
}

impl FitOptions {
    /// Train for this many epochs.
    pub fn epochs(epochs: usize) -> Self {
        Self {
            epochs,
            ..Self::default()
        }
    }

    /// Set the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Enable or disable per-epoch shuffling.
    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// Choose the validation source.
    pub fn with_validation(mut self, validation: Validation) -> Self {
        self.validation = validation;
        self
    }

    /// Weight each sample's loss contribution.
    pub fn with_sample_weight(mut self, weights: Tensor) -> Self {
        self.sample_weight = Some(weights);
        self
    }

    /// Add a callback.
    pub fn with_callback(mut self, callback: impl Callback + 'static) -> Self {
        self.callbacks.push(Box::new(callback));
        self
    }

    /// Set log verbosity.
    pub fn with_verbose(mut self, verbose: u8) -> Self {
        self.verbose = verbose;
        self
    }

    /// Recompute train metrics with a second pass per epoch.
    pub fn with_precise_train_metrics(mut self, precise: bool) -> Self {
        self.precise_train_metrics = precise;
        self
    }
}

/// Wraps a model with training and inference conveniences.
///
/// The model stays externally owned: the learner invokes it, it never
/// constructs it, mutates its parameters directly, or destroys it.
pub struct Learner<M: Forward + 'static> {
    model: Arc<M>,
    varmap: VarMap,
    trainer: Option<Trainer>,
}

impl<M: Forward + 'static> Learner<M> {
    /// Wrap a model and the `VarMap` its parameters were built from.
    pub fn new(model: M, varmap: VarMap) -> Self {
        Self {
            model: Arc::new(model),
            varmap,
            trainer: None,
        }
    }

    /// The wrapped model.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Whether `compile` has been called.
    pub fn is_compiled(&self) -> bool {
        self.trainer.is_some()
    }

    /// Total number of scalars composing the weights.
    pub fn count_params(&self) -> usize {
        self.varmap
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().elem_count())
            .sum()
    }

    /// Configure the learner for training.
    ///
    /// Resolves names through the loss/metric/optimizer lookup tables,
    /// installs the hook set (default hooks when none is given) and binds
    /// the optimizer to the model's vars. The device defaults to wherever
    /// the model's vars live, or CPU for a parameterless model.
    pub fn compile(&mut self, options: CompileOptions) -> Result<()> {
        let vars = self.varmap.all_vars();

        let device = match options.device {
            Some(device) => device,
            None => vars
                .first()
                .map(|v| v.as_tensor().device().clone())
                .unwrap_or(Device::Cpu),
        };

        let loss: Arc<dyn Loss> = match options.loss {
            LossSpec::Named(name) => Arc::from(create_loss_by_name(&name)?),
            LossSpec::Instance(loss) => Arc::from(loss),
        };

        let optimizer = match options.optimizer {
            OptimizerSpec::Named(name) => create_optimizer_by_name(&name, vars.clone())?,
            OptimizerSpec::Config(config) => NamedOptimizer::from_config(&config, vars.clone())?,
        };

        // The loss always occupies the first history column.
        let mut metrics: Vec<(String, Box<dyn Metric>)> =
            vec![("loss".to_string(), Box::new(LossMetric::new(loss.clone())))];
        for spec in options.metrics {
            match spec {
                MetricSpec::Named(name) => {
                    let metric = create_metric_by_name(&name)?;
                    metrics.push((metric.abbr().to_string(), metric));
                }
                MetricSpec::Instance(name, metric) => metrics.push((name, metric)),
            }
        }

        let hooks = options.hooks.unwrap_or_else(|| Box::new(DefaultHooks));

        info!(
            params = self.count_params(),
            device = ?device,
            loss = loss.name(),
            "compiled learner"
        );

        self.trainer = Some(Trainer::new(
            self.model.clone(),
            vars,
            optimizer,
            loss,
            metrics,
            device,
            hooks,
            options.seed,
        ));
        Ok(())
    }

    /// Train for a fixed number of epochs (iterations over the dataset).
    pub fn fit(&mut self, x: Tensor, y: Tensor, mut options: FitOptions) -> Result<History> {
        let trainer = self
            .trainer
            .as_mut()
            .ok_or_else(|| Error::compile("call compile() before fit()"))?;

        let dataset = match options.sample_weight.take() {
            Some(weights) => TensorDataset::from_xyw(x, y, weights)?,
            None => TensorDataset::from_xy(x, y)?,
        };
        let (train_set, val_set) = match std::mem::take(&mut options.validation) {
            Validation::None => (dataset, None),
            Validation::Split(fraction) => {
                let (train, val) = random_split(&dataset, fraction, options.val_split_seed)?;
                (train, Some(val))
            }
            Validation::Data(x_val, y_val) => {
                (dataset, Some(TensorDataset::from_xy(x_val, y_val)?))
            }
        };

        let train_loader =
            DataLoader::new(train_set, options.batch_size)?.with_shuffle(options.shuffle);
        let val_loader = val_set
            .map(|set| DataLoader::new(set, options.batch_size))
            .transpose()?;

        let run = RunOptions {
            max_epochs: options.epochs,
            verbose: options.verbose,
            precise_train_metrics: options.precise_train_metrics,
        };
        trainer.run(&train_loader, val_loader.as_ref(), &run, &mut options.callbacks)
    }

    /// Loss and metric values over `(x, y)` in eval mode, batched.
    pub fn evaluate(
        &mut self,
        x: Tensor,
        y: Tensor,
        batch_size: usize,
    ) -> Result<HashMap<String, f64>> {
        let trainer = self
            .trainer
            .as_mut()
            .ok_or_else(|| Error::compile("call compile() before evaluate()"))?;
        let loader = DataLoader::new(TensorDataset::from_xy(x, y)?, batch_size)?;
        trainer.evaluate(&loader)
    }

    /// Generate predictions for the input samples, batched; the result is
    /// detached and lives in host memory.
    pub fn predict(&self, x: Tensor, batch_size: usize) -> Result<Tensor> {
        let dataset = TensorDataset::new(vec![x])?;
        let device = match &self.trainer {
            Some(trainer) => trainer.device().clone(),
            None => self
                .varmap
                .all_vars()
                .first()
                .map(|v| v.as_tensor().device().clone())
                .unwrap_or(Device::Cpu),
        };

        let mut outputs = Vec::new();
        let mut start = 0;
        let n = dataset.len();
        while start < n {
            let count = batch_size.min(n - start);
            let batch = dataset.columns()[0].narrow(0, start, count)?.to_device(&device)?;
            let out = self.model.forward(&[batch])?;
            outputs.push(out.detach().to_device(&Device::Cpu)?);
            start += count;
        }
        if outputs.is_empty() {
            return Err(Error::data("predict called with no samples"));
        }
        Ok(Tensor::cat(&outputs, 0)?)
    }

    /// The phase most recently set by the training loop.
    pub fn phase(&self) -> Option<Phase> {
        self.trainer.as_ref().map(|t| t.phase())
    }

    /// Save the model weights as safetensors.
    pub fn save_weights(&self, path: impl AsRef<Path>) -> Result<()> {
        self.varmap.save(path.as_ref())?;
        Ok(())
    }

    /// Load model weights saved with [`Learner::save_weights`].
    pub fn load_weights(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.varmap.load(path.as_ref())?;
        Ok(())
    }
}
