//! Loss functions

use thiserror::Error;

use crate::value::Value;

/// Errors for loss functions
#[derive(Debug, Error)]
pub enum LossError {
    #[error("Cannot compute a loss over an empty input")]
    EmptyInput,
    #[error("Target class {target} is out of range for {n_classes} classes")]
    TargetOutOfRange { target: usize, n_classes: usize },
    #[error("Prediction and target lengths differ: {pred_len} vs {true_len}")]
    LengthMismatch { pred_len: usize, true_len: usize },
}

/// A classification criterion scoring one sample's network output against its class index.
/// Mirrors the torch.nn loss modules taking `(input, target)`.
pub trait Criterion {
    fn call(&self, output: &[Value], target: usize) -> Result<Value, LossError>;

    fn name(&self) -> &'static str;
}

fn check_target(output: &[Value], target: usize) -> Result<(), LossError> {
    if output.is_empty() {
        return Err(LossError::EmptyInput);
    }
    if target >= output.len() {
        return Err(LossError::TargetOutOfRange {
            target,
            n_classes: output.len(),
        });
    }
    Ok(())
}

/// Cross entropy on raw logits: `-log(softmax(logits)[target])`.
///
/// Computed as `logsumexp(logits) - logits[target]` with the max subtracted first, so
/// large logits don't overflow.
#[derive(Debug, Default, Clone, Copy)]
pub struct CrossEntropyLoss;

impl Criterion for CrossEntropyLoss {
    fn call(&self, logits: &[Value], target: usize) -> Result<Value, LossError> {
        check_target(logits, target)?;
        let max = logits
            .iter()
            .map(|v| v.data())
            .fold(f32::NEG_INFINITY, f32::max);
        let max = Value::new(max);
        let exps = logits
            .iter()
            .map(|v| (v - &max).exp())
            .collect::<Vec<_>>();
        let log_sum_exp = &Value::sum(&exps).ln() + &max;
        Ok(&log_sum_exp - &logits[target])
    }

    fn name(&self) -> &'static str {
        "CrossEntropyLoss"
    }
}

/// Negative log likelihood on log-probabilities: `-log_probs[target]`
#[derive(Debug, Default, Clone, Copy)]
pub struct NLLLoss;

impl Criterion for NLLLoss {
    fn call(&self, log_probs: &[Value], target: usize) -> Result<Value, LossError> {
        check_target(log_probs, target)?;
        Ok(-&log_probs[target])
    }

    fn name(&self) -> &'static str {
        "NLLLoss"
    }
}

/// Mean of the per-sample losses over a batch, the default `reduction='mean'`
pub fn batch_mean<C, T>(criterion: &C, outputs: &[T], targets: &[usize]) -> Result<Value, LossError>
where
    C: Criterion + ?Sized,
    T: AsRef<[Value]>,
{
    if outputs.is_empty() {
        return Err(LossError::EmptyInput);
    }
    if outputs.len() != targets.len() {
        return Err(LossError::LengthMismatch {
            pred_len: outputs.len(),
            true_len: targets.len(),
        });
    }
    let losses = outputs
        .iter()
        .zip(targets.iter())
        .map(|(o, t)| criterion.call(o.as_ref(), *t))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Value::mean(&losses))
}

/// Mean Squared Error Loss between two vectors of values
pub struct MSELoss;

impl MSELoss {
    pub fn call<T, U>(y_pred: &[T], y_true: &[U]) -> Result<Value, LossError>
    where
        T: AsRef<Value>,
        U: AsRef<Value>,
    {
        if y_pred.is_empty() {
            return Err(LossError::EmptyInput);
        }
        if y_pred.len() != y_true.len() {
            return Err(LossError::LengthMismatch {
                pred_len: y_pred.len(),
                true_len: y_true.len(),
            });
        }
        let squares = y_pred
            .iter()
            .zip(y_true.iter())
            .map(|(a, b)| (a.as_ref() - b.as_ref()).powf(2.0))
            .collect::<Vec<_>>();
        Ok(Value::mean(&squares))
    }
}
