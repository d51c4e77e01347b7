//! The training loop, evaluation and single sample inference

use std::time::Instant;

use thiserror::Error;

use crate::{
    dataloader::{Batch, DataLoader},
    loss::{Criterion, LossError},
    nn::{Head, Module, NNError},
    optim::Optim,
    value::Value,
};

/// Errors raised while training or evaluating a model
#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    NN(#[from] NNError),
    #[error(transparent)]
    Loss(#[from] LossError),
    #[error("The data loader yielded no batches")]
    EmptyLoader,
}

/// Knobs for [`fit`]
#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub epochs: usize,
    /// Seed for the per-epoch shuffle, `None` uses thread randomness
    pub seed: Option<u64>,
    /// Log the running loss every this many batches, 0 disables it
    pub log_every: usize,
}

/// Statistics for one pass over the training data
#[derive(Debug, Clone, PartialEq)]
pub struct EpochStats {
    /// 1-based epoch number
    pub epoch: usize,
    /// Mean of the batch losses, `running_loss / n_batches`
    pub loss: f32,
    /// Fraction of training samples classified correctly during the pass
    pub accuracy: f32,
    pub n_batches: usize,
    pub elapsed_ms: u128,
}

/// Index of the largest value, ties broken by the first index
pub fn argmax(values: &[f32]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (i, &v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

fn should_log(n_batches: usize, log_every: usize) -> bool {
    log_every > 0 && n_batches % log_every == 0
}

fn predicted_class(output: &[Value]) -> Option<usize> {
    argmax(&output.iter().map(Value::data).collect::<Vec<_>>())
}

/// Forward and backward over one batch, returns `(mean batch loss, n_correct)`.
///
/// Each sample's loss is scaled by `1 / batch_len` before backprop so the accumulated
/// gradient equals the gradient of the batch mean, without holding the whole batch's
/// graph in memory at once.
pub fn backward_batch(
    model: &dyn Module,
    criterion: &dyn Criterion,
    batch: &Batch,
) -> Result<(f32, usize), TrainError> {
    let scale = Value::new(1.0 / batch.len() as f32);
    let mut batch_loss = 0.0;
    let mut n_correct = 0;
    for (input, &target) in batch.inputs.iter().zip(batch.targets.iter()) {
        // once `output` and `loss` are dropped, every intermediate node of the sample's
        // graph is freed, only the parameters keep their accumulated gradients
        let output = model.forward(input)?;
        let loss = &criterion.call(&output, target)? * &scale;
        loss.backward();
        batch_loss += loss.data();
        if predicted_class(&output) == Some(target) {
            n_correct += 1;
        }
    }
    Ok((batch_loss, n_correct))
}

/// Runs one pass over `loader`, stepping the optimizer after every batch
pub fn train_epoch(
    model: &dyn Module,
    criterion: &dyn Criterion,
    optim: &mut dyn Optim,
    loader: &DataLoader,
    epoch: usize,
    config: &TrainConfig,
) -> Result<EpochStats, TrainError> {
    let start = Instant::now();
    let batches: Box<dyn Iterator<Item = Batch> + '_> = match config.seed {
        Some(seed) => Box::new(loader.seeded_iter(seed.wrapping_add(epoch as u64))),
        None => Box::new(loader.iter()),
    };

    let mut running_loss = 0.0;
    let mut n_correct = 0;
    let mut n_seen = 0;
    let mut n_batches = 0;
    for batch in batches {
        let (loss, correct) = backward_batch(model, criterion, &batch)?;
        optim.step();
        optim.zero_grad();

        running_loss += loss;
        n_correct += correct;
        n_seen += batch.len();
        n_batches += 1;
        log::debug!("epoch {} batch {}: loss {}", epoch, n_batches, loss);
        if should_log(n_batches, config.log_every) {
            log::info!(
                "Epoch {} [{}/{}] running loss: {:.4}",
                epoch,
                n_batches,
                loader.len(),
                running_loss / n_batches as f32
            );
        }
    }
    if n_batches == 0 {
        return Err(TrainError::EmptyLoader);
    }

    Ok(EpochStats {
        epoch,
        loss: running_loss / n_batches as f32,
        accuracy: n_correct as f32 / n_seen as f32,
        n_batches,
        elapsed_ms: start.elapsed().as_millis(),
    })
}

/// Trains for `config.epochs` passes, returning the per-epoch history
pub fn fit(
    model: &dyn Module,
    criterion: &dyn Criterion,
    optim: &mut dyn Optim,
    loader: &DataLoader,
    config: &TrainConfig,
) -> Result<Vec<EpochStats>, TrainError> {
    log::info!(
        "Training {} parameters for {} epochs on {} samples ({} batches of {}) with {}",
        model.parameters().len(),
        config.epochs,
        loader.n_samples(),
        loader.len(),
        loader.batch_size(),
        criterion.name()
    );
    let mut history = Vec::with_capacity(config.epochs);
    for epoch in 1..=config.epochs {
        let stats = train_epoch(model, criterion, optim, loader, epoch, config)?;
        log::info!(
            "Epoch {}/{} - Training loss: {:.4} - accuracy: {:.3} ({} ms)",
            epoch,
            config.epochs,
            stats.loss,
            stats.accuracy,
            stats.elapsed_ms
        );
        history.push(stats);
    }
    Ok(history)
}

/// Fraction of samples in `loader` whose most likely class matches the label
pub fn evaluate(model: &dyn Module, loader: &DataLoader) -> Result<f32, TrainError> {
    let mut n_correct = 0;
    let mut n_seen = 0;
    for batch in loader.iter() {
        for (input, &target) in batch.inputs.iter().zip(batch.targets.iter()) {
            let output = model.forward(input)?;
            if predicted_class(&output) == Some(target) {
                n_correct += 1;
            }
            n_seen += 1;
        }
    }
    if n_seen == 0 {
        return Err(TrainError::EmptyLoader);
    }
    Ok(n_correct as f32 / n_seen as f32)
}

/// Class probabilities for a single flattened image
pub fn predict_proba(model: &dyn Module, head: Head, pixels: &[f32]) -> Result<Vec<f32>, TrainError> {
    let input = pixels.iter().map(|p| Value::new(*p)).collect::<Vec<_>>();
    let output = model.forward(&input)?;
    let probs = match head {
        Head::LogSoftmax => output.iter().map(|v| v.data().exp()).collect(),
        Head::Logits => {
            let max = output
                .iter()
                .map(|v| v.data())
                .fold(f32::NEG_INFINITY, f32::max);
            let exps = output
                .iter()
                .map(|v| (v.data() - max).exp())
                .collect::<Vec<_>>();
            let sum: f32 = exps.iter().sum();
            exps.into_iter().map(|e| e / sum).collect()
        }
    };
    Ok(probs)
}
