//! taper - Keras-style training loops for candle models
//!
//! This crate wraps an externally-owned candle model with a
//! compile/fit/evaluate/predict workflow. The training loop itself is fixed;
//! per-batch behavior is customized through the [`hooks::LoopHooks`] strategy
//! trait and coarse control (early stopping, learning-rate schedules) through
//! [`callbacks::Callback`].

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod callbacks;
pub mod data;
pub mod error;
pub mod hooks;
pub mod learner;
pub mod losses;
pub mod metrics;
pub mod optimizers;
pub mod trainer;

// Re-exports
pub use callbacks::{Callback, CallbackAction, CallbackContext, EarlyStopping, Event, LrSchedule};
pub use data::{random_split, tensor_from_f32, tensor_from_u32, DataLoader, TensorDataset};
pub use error::{Error, Result};
pub use hooks::{DefaultHooks, Forward, HookContext, LoopHooks, Phase};
pub use learner::{CompileOptions, FitOptions, Learner, LossSpec, MetricSpec, OptimizerSpec, Validation};
pub use losses::{create_loss_by_name, Loss, SUPPORTED_LOSSES};
pub use metrics::{create_metric_by_name, Metric, SUPPORTED_METRICS};
pub use optimizers::{
    create_optimizer_by_name, NamedOptimizer, OptimizerConfig, OptimizerKind, SUPPORTED_OPTIMIZERS,
};
pub use trainer::{History, RunOptions, Trainer};
