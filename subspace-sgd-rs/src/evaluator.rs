//! Test-set evaluation.

use candle_core::{DType, D};
use serde::{Deserialize, Serialize};

use crate::dataset::{DataLoader, Dataset};
use crate::error::Result;
use crate::metrics::{RunLog, TEST_ACCURACY, TEST_LOSS};
use crate::model::Classifier;

/// Loss and accuracy over a whole dataset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Mean cross-entropy per example.
    pub loss: f64,
    /// Fraction of correctly classified examples.
    pub accuracy: f64,
}

/// Evaluates a classifier on a fixed test set.
#[derive(Debug, Clone)]
pub struct Evaluator {
    loader: DataLoader,
}

impl Evaluator {
    /// Evaluate on `test` in unshuffled batches of `batch_size`.
    #[must_use]
    pub fn new(test: Dataset, batch_size: usize) -> Self {
        Self {
            loader: DataLoader::new(test, batch_size, false, 0),
        }
    }

    /// Compute loss and accuracy.
    ///
    /// # Errors
    ///
    /// Returns an error if a forward pass fails.
    #[allow(clippy::cast_precision_loss)]
    pub fn evaluate<M: Classifier + ?Sized>(&self, model: &M) -> Result<Evaluation> {
        let total = self.loader.dataset().len();
        if total == 0 {
            return Ok(Evaluation {
                loss: 0.0,
                accuracy: 0.0,
            });
        }

        let mut loss_sum = 0.0f64;
        let mut correct = 0.0f64;
        for batch in self.loader.iter(0) {
            let batch = batch?;
            let logits = model.forward(&batch.inputs)?.detach();
            let loss = candle_nn::loss::cross_entropy(&logits, &batch.labels)?;
            loss_sum += f64::from(loss.to_scalar::<f32>()?) * batch.len() as f64;

            let hits = logits
                .argmax(D::Minus1)?
                .eq(&batch.labels)?
                .to_dtype(DType::F32)?
                .sum_all()?
                .to_scalar::<f32>()?;
            correct += f64::from(hits);
        }

        Ok(Evaluation {
            loss: loss_sum / total as f64,
            accuracy: correct / total as f64,
        })
    }

    /// Evaluate and log `test loss` and `test accuracy`.
    ///
    /// # Errors
    ///
    /// Returns an error if evaluation or logging fails.
    pub fn eval_model<M: Classifier + ?Sized>(
        &self,
        model: &M,
        log: &mut RunLog,
    ) -> Result<Evaluation> {
        let evaluation = self.evaluate(model)?;
        log.log(TEST_LOSS, evaluation.loss)?;
        log.log(TEST_ACCURACY, evaluation.accuracy)?;
        Ok(evaluation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SubspaceError;
    use candle_core::{Device, Tensor};
    use candle_nn::VarMap;

    /// Returns the inputs as logits.
    struct Identity(VarMap);

    impl Classifier for Identity {
        fn name(&self) -> &str {
            "Identity"
        }

        fn forward(&self, inputs: &Tensor) -> Result<Tensor> {
            Ok(inputs.clone())
        }

        fn var_map(&self) -> &VarMap {
            &self.0
        }
    }

    fn dataset() -> std::result::Result<Dataset, SubspaceError> {
        let inputs = Tensor::new(
            &[[5.0f32, 0.0], [0.0, 5.0], [5.0, 0.0], [0.0, 5.0]],
            &Device::Cpu,
        )?;
        let labels = Tensor::new(&[0u32, 1, 1, 1], &Device::Cpu)?;
        Dataset::new(inputs, labels)
    }

    #[test]
    fn test_accuracy_counts_argmax_hits() {
        let evaluator = Evaluator::new(dataset().unwrap(), 3);
        let evaluation = evaluator.evaluate(&Identity(VarMap::new())).unwrap();
        assert!((evaluation.accuracy - 0.75).abs() < 1e-9);
        assert!(evaluation.loss > 0.0);
    }

    #[test]
    fn test_eval_model_logs_both_metrics() {
        let evaluator = Evaluator::new(dataset().unwrap(), 2);
        let mut log = RunLog::new();
        let evaluation = evaluator
            .eval_model(&Identity(VarMap::new()), &mut log)
            .unwrap();
        assert_eq!(log.history().last(TEST_ACCURACY), Some(evaluation.accuracy));
        assert_eq!(log.history().last(TEST_LOSS), Some(evaluation.loss));
    }

    #[test]
    fn test_loss_is_batch_size_independent() {
        let model = Identity(VarMap::new());
        let a = Evaluator::new(dataset().unwrap(), 1).evaluate(&model).unwrap();
        let b = Evaluator::new(dataset().unwrap(), 4).evaluate(&model).unwrap();
        assert!((a.loss - b.loss).abs() < 1e-5);
    }
}
