//! Training callbacks — observation and control of the epoch loop
//!
//! Callbacks sit outside the per-batch hook set: they fire on coarse loop
//! events (train begin/end, epoch begin/end) and can ask the loop to stop
//! early or adjust the learning rate. Per-batch customization belongs in
//! [`crate::hooks::LoopHooks`] instead.

use std::collections::HashMap;

use tracing::info;

use crate::error::Result;

/// Loop events callbacks can react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Fired once before the first epoch.
    TrainBegin,
    /// Fired at the start of every epoch.
    EpochBegin,
    /// Fired after every epoch's metrics are in.
    EpochEnd,
    /// Fired once after the last epoch (also after an early stop).
    TrainEnd,
}

/// Action a callback requests from the loop.
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackAction {
    /// Keep going.
    Continue,
    /// End training after the current epoch.
    Stop,
    /// Replace the optimizer's learning rate.
    SetLearningRate(f64),
}

/// Read-only snapshot of loop state passed to callbacks.
#[derive(Debug)]
pub struct CallbackContext<'a> {
    /// Current epoch, 1-based. Zero for [`Event::TrainBegin`].
    pub epoch: usize,
    /// Total epochs requested.
    pub max_epochs: usize,
    /// Latest completed epoch's metrics row. Empty until the first
    /// [`Event::EpochEnd`].
    pub metrics: &'a HashMap<String, f64>,
    /// Current learning rate.
    pub learning_rate: f64,
}

/// Trait for training callbacks.
pub trait Callback: Send {
    /// React to a loop event.
    fn on_event(&mut self, event: Event, ctx: &CallbackContext<'_>) -> Result<CallbackAction>;
}

/// Stop training when a monitored metric stops improving.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    monitor: String,
    min_delta: f64,
    patience: usize,
    higher_is_better: bool,
    best: Option<f64>,
    epochs_since_best: usize,
}

impl EarlyStopping {
    /// Monitor a metric (e.g. `"val_loss"`) with the given patience.
    /// Lower values count as improvement.
    pub fn new(monitor: impl Into<String>, patience: usize) -> Self {
        Self {
            monitor: monitor.into(),
            min_delta: 0.0,
            patience,
            higher_is_better: false,
            best: None,
            epochs_since_best: 0,
        }
    }

    /// Require at least this much improvement to reset patience.
    pub fn with_min_delta(mut self, min_delta: f64) -> Self {
        self.min_delta = min_delta;
        self
    }

    /// Treat higher metric values as improvement (e.g. accuracy).
    pub fn with_higher_is_better(mut self, higher_is_better: bool) -> Self {
        self.higher_is_better = higher_is_better;
        self
    }

    fn improved(&self, current: f64) -> bool {
        match self.best {
            None => true,
            Some(best) => {
                if self.higher_is_better {
                    current > best + self.min_delta
                } else {
                    current < best - self.min_delta
                }
            }
        }
    }
}

impl Callback for EarlyStopping {
    fn on_event(&mut self, event: Event, ctx: &CallbackContext<'_>) -> Result<CallbackAction> {
        if event != Event::EpochEnd {
            return Ok(CallbackAction::Continue);
        }
        let Some(&current) = ctx.metrics.get(&self.monitor) else {
            // Monitored metric absent from this run's columns.
            return Ok(CallbackAction::Continue);
        };
        if self.improved(current) {
            self.best = Some(current);
            self.epochs_since_best = 0;
            Ok(CallbackAction::Continue)
        } else {
            self.epochs_since_best += 1;
            if self.epochs_since_best >= self.patience {
                info!(
                    monitor = %self.monitor,
                    patience = self.patience,
                    "early stopping: no improvement"
                );
                Ok(CallbackAction::Stop)
            } else {
                Ok(CallbackAction::Continue)
            }
        }
    }
}

/// Set the learning rate from a schedule at the start of every epoch.
pub struct LrSchedule {
    schedule: Box<dyn Fn(usize, f64) -> f64 + Send>,
}

impl LrSchedule {
    /// `schedule(epoch, current_lr)` returns the learning rate to use for
    /// that epoch (1-based).
    pub fn new(schedule: impl Fn(usize, f64) -> f64 + Send + 'static) -> Self {
        Self {
            schedule: Box::new(schedule),
        }
    }
}

impl Callback for LrSchedule {
    fn on_event(&mut self, event: Event, ctx: &CallbackContext<'_>) -> Result<CallbackAction> {
        if event == Event::EpochBegin {
            let lr = (self.schedule)(ctx.epoch, ctx.learning_rate);
            Ok(CallbackAction::SetLearningRate(lr))
        } else {
            Ok(CallbackAction::Continue)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch_end(metrics: &HashMap<String, f64>, epoch: usize) -> CallbackContext<'_> {
        CallbackContext {
            epoch,
            max_epochs: 10,
            metrics,
            learning_rate: 1e-3,
        }
    }

    #[test]
    fn early_stopping_waits_out_patience() {
        let mut cb = EarlyStopping::new("val_loss", 2);
        let rows = [0.5, 0.4, 0.4, 0.4];
        let mut actions = Vec::new();
        for (i, loss) in rows.iter().enumerate() {
            let metrics = HashMap::from([("val_loss".to_string(), *loss)]);
            actions.push(cb.on_event(Event::EpochEnd, &epoch_end(&metrics, i + 1)).unwrap());
        }
        assert_eq!(
            actions,
            vec![
                CallbackAction::Continue, // sets best = 0.5
                CallbackAction::Continue, // improves, best = 0.4
                CallbackAction::Continue, // stall 1
                CallbackAction::Stop,     // stall 2 = patience
            ]
        );
    }

    #[test]
    fn early_stopping_respects_min_delta() {
        let mut cb = EarlyStopping::new("val_loss", 1).with_min_delta(0.1);
        let metrics = HashMap::from([("val_loss".to_string(), 0.5)]);
        assert_eq!(
            cb.on_event(Event::EpochEnd, &epoch_end(&metrics, 1)).unwrap(),
            CallbackAction::Continue
        );
        // 0.45 is better, but not by min_delta.
        let metrics = HashMap::from([("val_loss".to_string(), 0.45)]);
        assert_eq!(
            cb.on_event(Event::EpochEnd, &epoch_end(&metrics, 2)).unwrap(),
            CallbackAction::Stop
        );
    }

    #[test]
    fn early_stopping_can_monitor_accuracy() {
        let mut cb = EarlyStopping::new("val_acc", 1).with_higher_is_better(true);
        let metrics = HashMap::from([("val_acc".to_string(), 0.8)]);
        assert_eq!(
            cb.on_event(Event::EpochEnd, &epoch_end(&metrics, 1)).unwrap(),
            CallbackAction::Continue
        );
        let metrics = HashMap::from([("val_acc".to_string(), 0.9)]);
        assert_eq!(
            cb.on_event(Event::EpochEnd, &epoch_end(&metrics, 2)).unwrap(),
            CallbackAction::Continue
        );
        let metrics = HashMap::from([("val_acc".to_string(), 0.85)]);
        assert_eq!(
            cb.on_event(Event::EpochEnd, &epoch_end(&metrics, 3)).unwrap(),
            CallbackAction::Stop
        );
    }

    #[test]
    fn missing_monitor_metric_is_ignored() {
        let mut cb = EarlyStopping::new("val_loss", 1);
        let metrics = HashMap::from([("loss".to_string(), 0.5)]);
        for epoch in 1..=5 {
            assert_eq!(
                cb.on_event(Event::EpochEnd, &epoch_end(&metrics, epoch)).unwrap(),
                CallbackAction::Continue
            );
        }
    }

    #[test]
    fn lr_schedule_fires_on_epoch_begin_only() {
        let mut cb = LrSchedule::new(|epoch, lr| if epoch > 1 { lr * 0.1 } else { lr });
        let metrics = HashMap::new();
        let ctx = CallbackContext {
            epoch: 2,
            max_epochs: 5,
            metrics: &metrics,
            learning_rate: 1e-2,
        };
        assert_eq!(
            cb.on_event(Event::EpochBegin, &ctx).unwrap(),
            CallbackAction::SetLearningRate(1e-3)
        );
        assert_eq!(
            cb.on_event(Event::EpochEnd, &ctx).unwrap(),
            CallbackAction::Continue
        );
    }
}
