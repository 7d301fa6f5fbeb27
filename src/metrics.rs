//! Evaluation metrics and the named metric lookup table
//!
//! Metrics are computed once per epoch over the cached (detached,
//! host-resident) predictions, so they can stay simple: a pure function from
//! a prediction/target pair to a scalar.

use candle_core::{DType, Tensor, D};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::losses::Loss;

/// A scalar score over a prediction/target tensor pair.
pub trait Metric: Send + Sync {
    /// Abbreviation used as the history column name.
    fn abbr(&self) -> &'static str;

    /// Compute the metric value.
    fn compute(&self, y_pred: &Tensor, y_true: &Tensor) -> Result<f64>;

    /// Variant used when the loader carries per-sample weights. Only the
    /// loss column honors them; plain metrics stay unweighted.
    fn compute_weighted(
        &self,
        y_pred: &Tensor,
        y_true: &Tensor,
        _weights: &Tensor,
    ) -> Result<f64> {
        self.compute(y_pred, y_true)
    }
}

/// Categorical accuracy: argmax over the last dim against integer labels.
#[derive(Debug, Default, Clone, Copy)]
pub struct Accuracy;

impl Metric for Accuracy {
    fn abbr(&self) -> &'static str {
        "acc"
    }

    fn compute(&self, y_pred: &Tensor, y_true: &Tensor) -> Result<f64> {
        let predicted = y_pred.argmax(D::Minus1)?;
        let truth = y_true.to_dtype(DType::U32)?;
        let fraction = predicted
            .eq(&truth)?
            .to_dtype(DType::F32)?
            .mean_all()?
            .to_scalar::<f32>()?;
        Ok(fraction as f64)
    }
}

/// Binary accuracy: predictions are probabilities, rounded to {0, 1}.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryAccuracy;

impl Metric for BinaryAccuracy {
    fn abbr(&self) -> &'static str {
        "acc"
    }

    fn compute(&self, y_pred: &Tensor, y_true: &Tensor) -> Result<f64> {
        let rounded = y_pred.round()?;
        let truth = y_true.to_dtype(rounded.dtype())?;
        let fraction = rounded
            .eq(&truth)?
            .to_dtype(DType::F32)?
            .mean_all()?
            .to_scalar::<f32>()?;
        Ok(fraction as f64)
    }
}

/// Mean squared error.
#[derive(Debug, Default, Clone, Copy)]
pub struct MeanSquaredError;

impl Metric for MeanSquaredError {
    fn abbr(&self) -> &'static str {
        "mse"
    }

    fn compute(&self, y_pred: &Tensor, y_true: &Tensor) -> Result<f64> {
        Ok(candle_nn::loss::mse(y_pred, y_true)?.to_scalar::<f32>()? as f64)
    }
}

/// Mean absolute error.
#[derive(Debug, Default, Clone, Copy)]
pub struct MeanAbsoluteError;

impl Metric for MeanAbsoluteError {
    fn abbr(&self) -> &'static str {
        "mae"
    }

    fn compute(&self, y_pred: &Tensor, y_true: &Tensor) -> Result<f64> {
        let mae = (y_pred - y_true)?.abs()?.mean_all()?.to_scalar::<f32>()?;
        Ok(mae as f64)
    }
}

/// Root mean squared error.
#[derive(Debug, Default, Clone, Copy)]
pub struct RootMeanSquaredError;

impl Metric for RootMeanSquaredError {
    fn abbr(&self) -> &'static str {
        "rmse"
    }

    fn compute(&self, y_pred: &Tensor, y_true: &Tensor) -> Result<f64> {
        let mse = candle_nn::loss::mse(y_pred, y_true)?.to_scalar::<f32>()? as f64;
        Ok(mse.sqrt())
    }
}

/// Adapter that reports a [`Loss`] as an epoch metric.
///
/// The compiled loss always occupies the `loss` column of the history.
pub struct LossMetric {
    loss: Arc<dyn Loss>,
}

impl LossMetric {
    /// Wrap a loss for metric reporting.
    pub fn new(loss: Arc<dyn Loss>) -> Self {
        Self { loss }
    }
}

impl Metric for LossMetric {
    fn abbr(&self) -> &'static str {
        "loss"
    }

    fn compute(&self, y_pred: &Tensor, y_true: &Tensor) -> Result<f64> {
        let value = self.loss.compute(y_pred, y_true)?.mean_all()?;
        Ok(value.to_scalar::<f32>()? as f64)
    }

    fn compute_weighted(
        &self,
        y_pred: &Tensor,
        y_true: &Tensor,
        weights: &Tensor,
    ) -> Result<f64> {
        let per_sample = self.loss.compute(y_pred, y_true)?;
        if per_sample.dims().is_empty() {
            return Err(Error::data(
                "sample weights require a loss configured with Reduction::None",
            ));
        }
        let value = (per_sample * weights)?.mean_all()?;
        Ok(value.to_scalar::<f32>()? as f64)
    }
}

type MetricCtor = fn() -> Box<dyn Metric>;

/// Supported metric names, in lookup-table order.
pub const SUPPORTED_METRICS: &[&str] = &["mse", "mae", "rmse", "acc", "binary_acc"];

static METRIC_TABLE: Lazy<HashMap<&'static str, MetricCtor>> = Lazy::new(|| {
    let mut table: HashMap<&'static str, MetricCtor> = HashMap::new();
    table.insert("mse", || Box::new(MeanSquaredError));
    table.insert("mae", || Box::new(MeanAbsoluteError));
    table.insert("rmse", || Box::new(RootMeanSquaredError));
    table.insert("acc", || Box::new(Accuracy));
    table.insert("binary_acc", || Box::new(BinaryAccuracy));
    table
});

/// Resolve a metric by name. Names are case-insensitive.
pub fn create_metric_by_name(name: &str) -> Result<Box<dyn Metric>> {
    let lowered = name.to_lowercase();
    match METRIC_TABLE.get(lowered.as_str()) {
        Some(ctor) => Ok(ctor()),
        None => Err(Error::UnknownMetric {
            name: name.to_string(),
            supported: SUPPORTED_METRICS.to_vec(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::Device;
    use test_case::test_case;

    #[test]
    fn accuracy_counts_argmax_matches() {
        let logits = Tensor::from_slice(
            &[5.0f32, 0.0, 0.0, 0.0, 5.0, 0.0, 0.0, 0.0, 5.0, 5.0, 0.0, 0.0],
            (4, 3),
            &Device::Cpu,
        )
        .unwrap();
        let labels = Tensor::from_slice(&[0u32, 1, 2, 2], 4, &Device::Cpu).unwrap();
        let acc = Accuracy.compute(&logits, &labels).unwrap();
        assert_relative_eq!(acc, 0.75, epsilon = 1e-6);
    }

    #[test]
    fn binary_accuracy_rounds_probabilities() {
        let probs = Tensor::from_slice(&[0.9f32, 0.2, 0.6, 0.4], 4, &Device::Cpu).unwrap();
        let labels = Tensor::from_slice(&[1.0f32, 0.0, 0.0, 0.0], 4, &Device::Cpu).unwrap();
        let acc = BinaryAccuracy.compute(&probs, &labels).unwrap();
        assert_relative_eq!(acc, 0.75, epsilon = 1e-6);
    }

    #[test]
    fn rmse_is_sqrt_of_mse() {
        let pred = Tensor::from_slice(&[3.0f32, 3.0], 2, &Device::Cpu).unwrap();
        let truth = Tensor::from_slice(&[0.0f32, 0.0], 2, &Device::Cpu).unwrap();
        let mse = MeanSquaredError.compute(&pred, &truth).unwrap();
        let rmse = RootMeanSquaredError.compute(&pred, &truth).unwrap();
        assert_relative_eq!(rmse, mse.sqrt(), epsilon = 1e-9);
        assert_relative_eq!(rmse, 3.0, epsilon = 1e-6);
    }

    #[test]
    fn loss_metric_reports_loss_column() {
        let loss: Arc<dyn Loss> = Arc::new(crate::losses::MeanSquaredError);
        let metric = LossMetric::new(loss);
        assert_eq!(metric.abbr(), "loss");
        let pred = Tensor::from_slice(&[1.0f32, 2.0], 2, &Device::Cpu).unwrap();
        let truth = Tensor::from_slice(&[0.0f32, 0.0], 2, &Device::Cpu).unwrap();
        assert_relative_eq!(metric.compute(&pred, &truth).unwrap(), 2.5, epsilon = 1e-6);
    }

    #[test]
    fn weighted_loss_metric_scales_per_sample_losses() {
        #[derive(Debug)]
        struct PerSampleAbs;
        impl Loss for PerSampleAbs {
            fn name(&self) -> &'static str {
                "abs"
            }
            fn compute(&self, y_pred: &Tensor, y_true: &Tensor) -> Result<Tensor> {
                Ok((y_pred - y_true)?.abs()?)
            }
        }

        let metric = LossMetric::new(Arc::new(PerSampleAbs));
        let pred = Tensor::from_slice(&[3.0f32, 4.0], 2, &Device::Cpu).unwrap();
        let truth = Tensor::from_slice(&[0.0f32, 0.0], 2, &Device::Cpu).unwrap();
        let weights = Tensor::from_slice(&[1.0f32, 0.0], 2, &Device::Cpu).unwrap();
        // (3*1 + 4*0) / 2
        assert_relative_eq!(
            metric.compute_weighted(&pred, &truth, &weights).unwrap(),
            1.5,
            epsilon = 1e-6
        );
    }

    #[test]
    fn weighted_loss_metric_rejects_reduced_losses() {
        let metric = LossMetric::new(Arc::new(crate::losses::MeanSquaredError));
        let pred = Tensor::from_slice(&[1.0f32, 2.0], 2, &Device::Cpu).unwrap();
        let truth = Tensor::from_slice(&[0.0f32, 0.0], 2, &Device::Cpu).unwrap();
        let weights = Tensor::from_slice(&[1.0f32, 1.0], 2, &Device::Cpu).unwrap();
        assert!(matches!(
            metric.compute_weighted(&pred, &truth, &weights),
            Err(Error::Data(_))
        ));
    }

    #[test_case("mse")]
    #[test_case("mae")]
    #[test_case("rmse")]
    #[test_case("acc")]
    #[test_case("binary_acc")]
    fn lookup_resolves(name: &str) {
        assert!(create_metric_by_name(name).is_ok());
    }

    #[test]
    fn lookup_rejects_unknown_names() {
        assert!(matches!(
            create_metric_by_name("auc"),
            Err(Error::UnknownMetric { .. })
        ));
    }
}
