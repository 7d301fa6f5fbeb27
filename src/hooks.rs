//! Lifecycle hooks for the training loop
//!
//! The training loop is fixed; customization happens at a small set of named
//! extension points. [`LoopHooks`] declares one method per extension point,
//! each with a default implementation, so an implementor overrides only the
//! phases it cares about and inherits the rest. The loop invokes the hooks
//! synchronously, in a fixed order, once per batch (or once per epoch for
//! [`LoopHooks::on_epoch_begin`]).
//!
//! Every hook receives a [`HookContext`] describing where in the loop it is
//! being called: the current [`Phase`] (train or eval) and the epoch number.
//! The context is constructed by the loop at each phase boundary, so a hook
//! can never observe a stale phase.
//!
//! # Overriding a single hook
//!
//! ```rust,ignore
//! use taper::hooks::{LoopHooks, HookContext};
//! use candle_core::{Tensor, Var};
//! use candle_core::backprop::GradStore;
//!
//! struct ClippedHooks { max_grad: f64 }
//!
//! impl LoopHooks for ClippedHooks {
//!     fn prepare_for_optimizer_step(
//!         &self,
//!         _ctx: &HookContext,
//!         vars: &[Var],
//!         grads: &mut GradStore,
//!     ) -> taper::Result<()> {
//!         for var in vars {
//!             if let Some(grad) = grads.remove(var) {
//!                 let clipped = grad.clamp(-self.max_grad, self.max_grad)?;
//!                 grads.insert(var, clipped);
//!             }
//!         }
//!         Ok(())
//!     }
//! }
//! ```

use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};

use crate::error::{Error, Result};

/// Whether the current pass updates model parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Forward, backward and optimizer step; gradients are tracked.
    Train,
    /// Forward only; no parameter updates.
    Eval,
}

impl Phase {
    /// True for [`Phase::Train`].
    pub fn is_training(&self) -> bool {
        matches!(self, Phase::Train)
    }
}

/// Per-invocation context handed to every hook.
///
/// Built by the host loop at each phase boundary; hooks read it, never
/// write it.
#[derive(Debug, Clone, Copy)]
pub struct HookContext {
    phase: Phase,
    epoch: usize,
}

impl HookContext {
    /// Create a context for the given phase and epoch. Epochs are 1-based;
    /// the loop uses 0 for passes outside a fit run.
    pub fn new(phase: Phase, epoch: usize) -> Self {
        Self { phase, epoch }
    }

    /// The phase the loop is currently in.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Whether the current pass updates model parameters.
    pub fn is_training(&self) -> bool {
        self.phase.is_training()
    }

    /// Current epoch, 1-based. Zero marks a standalone evaluation outside
    /// a fit run.
    pub fn epoch(&self) -> usize {
        self.epoch
    }
}

/// An externally-owned model the loop invokes but does not own.
///
/// Inputs are passed as a slice so multi-input models are expressible; a
/// blanket impl adapts any single-input [`candle_nn::Module`].
pub trait Forward: Send + Sync {
    /// Run a forward pass over the given inputs.
    fn forward(&self, inputs: &[Tensor]) -> Result<Tensor>;
}

impl<M: candle_nn::Module + Send + Sync> Forward for M {
    fn forward(&self, inputs: &[Tensor]) -> Result<Tensor> {
        match inputs {
            [x] => Ok(candle_nn::Module::forward(self, x)?),
            _ => Err(Error::data(format!(
                "single-input module invoked with {} inputs",
                inputs.len()
            ))),
        }
    }
}

/// Overridable extension points of the training loop.
///
/// All methods have defaults; overriding any subset changes only that
/// phase's behavior. The loop calls them in this order per batch:
/// [`process_batch`](LoopHooks::process_batch) →
/// [`forward_call`](LoopHooks::forward_call) → loss and backward (owned by
/// the loop) → [`prepare_for_optimizer_step`](LoopHooks::prepare_for_optimizer_step) →
/// optimizer step → [`prepare_for_metrics_update`](LoopHooks::prepare_for_metrics_update) →
/// [`cache_for_epoch_metrics`](LoopHooks::cache_for_epoch_metrics).
pub trait LoopHooks: Send {
    /// Called once at the start of every epoch. Default: no-op.
    fn on_epoch_begin(&mut self, _ctx: &HookContext) -> Result<()> {
        Ok(())
    }

    /// Decompose a raw batch into `(inputs, target)`.
    ///
    /// Default: all-but-last tensors are inputs, the last is the target.
    /// A batch with fewer than two tensors is a data error.
    fn process_batch(
        &self,
        _ctx: &HookContext,
        mut batch: Vec<Tensor>,
    ) -> Result<(Vec<Tensor>, Tensor)> {
        let target = batch
            .pop()
            .ok_or_else(|| Error::data("batch is empty, expected (inputs..., target)"))?;
        if batch.is_empty() {
            return Err(Error::data(
                "batch has no input tensors, expected (inputs..., target)",
            ));
        }
        Ok((batch, target))
    }

    /// Produce a prediction from the model and the decomposed inputs.
    ///
    /// Default: invoke the model with the full input slice.
    fn forward_call(
        &self,
        _ctx: &HookContext,
        model: &dyn Forward,
        inputs: &[Tensor],
    ) -> Result<Tensor> {
        model.forward(inputs)
    }

    /// Called after backward, before the optimizer step.
    ///
    /// Default: no-op. Extension point for gradient clipping and similar
    /// gradient surgery; `grads` holds the gradients the optimizer will
    /// consume.
    fn prepare_for_optimizer_step(
        &self,
        _ctx: &HookContext,
        _vars: &[Var],
        _grads: &mut GradStore,
    ) -> Result<()> {
        Ok(())
    }

    /// Adjust `(prediction, target)` before running metrics on them.
    ///
    /// Default: identity passthrough.
    fn prepare_for_metrics_update(
        &self,
        _ctx: &HookContext,
        y_pred: Tensor,
        y_true: Tensor,
    ) -> Result<(Tensor, Tensor)> {
        Ok((y_pred, y_true))
    }

    /// Produce copies of `(prediction, target)` safe to hold until the end
    /// of the epoch: detached from the computation graph and resident in
    /// host memory.
    fn cache_for_epoch_metrics(
        &self,
        _ctx: &HookContext,
        y_pred: &Tensor,
        y_true: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let y_pred = y_pred.detach().to_device(&Device::Cpu)?;
        let y_true = y_true.detach().to_device(&Device::Cpu)?;
        Ok((y_pred, y_true))
    }
}

/// The default hook set: every extension point keeps its documented default.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl LoopHooks for DefaultHooks {}
