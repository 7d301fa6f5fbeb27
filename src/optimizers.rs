//! Optimizer construction over the model's trainable vars
//!
//! The optimizer math itself lives in candle-nn; this module only resolves a
//! name or an [`OptimizerConfig`] into a ready optimizer bound to the vars
//! the compile step collected.

use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::{AdamW, Optimizer as CandleOptimizer, ParamsAdamW, SGD};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Supported optimizer names, in lookup-table order.
pub const SUPPORTED_OPTIMIZERS: &[&str] = &["sgd", "adam", "adamw"];

/// Optimizer family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    /// Stochastic gradient descent.
    Sgd,
    /// Adam (AdamW with zero decoupled weight decay).
    Adam,
    /// AdamW with decoupled weight decay.
    AdamW,
}

/// Hyperparameters for explicit optimizer construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Optimizer family.
    pub kind: OptimizerKind,
    /// Learning rate.
    pub learning_rate: f64,
    /// Decoupled weight decay (AdamW only).
    pub weight_decay: f64,
    /// First-moment decay (Adam family).
    pub beta1: f64,
    /// Second-moment decay (Adam family).
    pub beta2: f64,
    /// Numerical stability epsilon (Adam family).
    pub eps: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::Adam,
            learning_rate: 1e-3,
            weight_decay: 0.0,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

impl OptimizerConfig {
    /// Config with the default hyperparameters of the given family.
    pub fn for_kind(kind: OptimizerKind) -> Self {
        let learning_rate = match kind {
            OptimizerKind::Sgd => 1e-2,
            OptimizerKind::Adam | OptimizerKind::AdamW => 1e-3,
        };
        let weight_decay = match kind {
            OptimizerKind::AdamW => 1e-2,
            _ => 0.0,
        };
        Self {
            kind,
            learning_rate,
            weight_decay,
            ..Self::default()
        }
    }
}

enum Inner {
    Sgd(SGD),
    AdamW(AdamW),
}

/// An optimizer bound to a set of trainable vars.
pub struct NamedOptimizer {
    inner: Inner,
    kind: OptimizerKind,
}

impl NamedOptimizer {
    /// Build an optimizer from a config and the vars it updates.
    pub fn from_config(config: &OptimizerConfig, vars: Vec<Var>) -> Result<Self> {
        let inner = match config.kind {
            OptimizerKind::Sgd => Inner::Sgd(SGD::new(vars, config.learning_rate)?),
            OptimizerKind::Adam | OptimizerKind::AdamW => {
                let params = ParamsAdamW {
                    lr: config.learning_rate,
                    beta1: config.beta1,
                    beta2: config.beta2,
                    eps: config.eps,
                    weight_decay: config.weight_decay,
                };
                Inner::AdamW(AdamW::new(vars, params)?)
            }
        };
        Ok(Self {
            inner,
            kind: config.kind,
        })
    }

    /// Which family this optimizer belongs to.
    pub fn kind(&self) -> OptimizerKind {
        self.kind
    }

    /// Apply one update from the given gradients.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        match &mut self.inner {
            Inner::Sgd(sgd) => sgd.step(grads)?,
            Inner::AdamW(adamw) => adamw.step(grads)?,
        }
        Ok(())
    }

    /// Current learning rate.
    pub fn learning_rate(&self) -> f64 {
        match &self.inner {
            Inner::Sgd(sgd) => sgd.learning_rate(),
            Inner::AdamW(adamw) => adamw.learning_rate(),
        }
    }

    /// Replace the learning rate, e.g. from a schedule callback.
    pub fn set_learning_rate(&mut self, lr: f64) {
        match &mut self.inner {
            Inner::Sgd(sgd) => sgd.set_learning_rate(lr),
            Inner::AdamW(adamw) => adamw.set_learning_rate(lr),
        }
    }
}

/// Resolve an optimizer by name with that family's default hyperparameters.
/// Names are case-insensitive.
pub fn create_optimizer_by_name(name: &str, vars: Vec<Var>) -> Result<NamedOptimizer> {
    let kind = match name.to_lowercase().as_str() {
        "sgd" => OptimizerKind::Sgd,
        "adam" => OptimizerKind::Adam,
        "adamw" => OptimizerKind::AdamW,
        _ => {
            return Err(Error::UnknownOptimizer {
                name: name.to_string(),
                supported: SUPPORTED_OPTIMIZERS.to_vec(),
            })
        }
    };
    NamedOptimizer::from_config(&OptimizerConfig::for_kind(kind), vars)
}
