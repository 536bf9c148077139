//! Fixed-epoch training loop with per-epoch validation accuracy.

use anyhow::Result;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};

use crate::dataset::{BatchIterator, DataSplit, FraudDataset};
use crate::model::FraudModel;

/// Training configuration. Defaults match the CLI defaults.
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub lr: f64,
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 64,
            lr: 1e-3,
            seed: 42,
        }
    }
}

/// Per-epoch metrics, returned for inspection after training.
#[derive(Debug, Clone)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_accuracy: f64,
}

/// Train for exactly `config.epochs` epochs: shuffled mini-batches, binary
/// cross-entropy loss, Adam updates. No early stopping, no checkpointing,
/// no schedule. `epochs == 0` performs no training work at all.
///
/// The loss is computed from the logits for stability; it equals
/// sigmoid-then-BCE up to float rounding.
pub fn train(model: &FraudModel, split: &DataSplit, config: &TrainConfig) -> Result<Vec<EpochMetrics>> {
    let mut optimizer = AdamW::new(
        model.trainable_vars(),
        ParamsAdamW {
            lr: config.lr,
            weight_decay: 0.0,
            ..Default::default()
        },
    )?;

    let train_len = split.train.len();
    let mut batch_iter = BatchIterator::new(split.train.clone(), config.batch_size);
    let mut history = Vec::with_capacity(config.epochs);

    for epoch in 1..=config.epochs {
        batch_iter.reshuffle(config.seed, epoch);

        let mut total_loss = 0.0;
        while let Some((countries, amounts, labels)) = batch_iter.next_batch() {
            let logits = model.forward_logits(&countries, &amounts)?;
            let loss = candle_nn::loss::binary_cross_entropy_with_logit(&logits, &labels)?;
            optimizer.backward_step(&loss)?;

            // Size-weighted so the short final batch counts proportionally.
            let batch_len = countries.dims()[0] as f64;
            total_loss += f64::from(loss.to_scalar::<f32>()?) * batch_len;
        }

        let train_loss = if train_len > 0 {
            total_loss / train_len as f64
        } else {
            0.0
        };
        let val_accuracy = validation_accuracy(model, &split.val)?;

        println!(
            "Epoch {}/{} - Loss: {:.4}, Val Accuracy: {:.4}",
            epoch, config.epochs, train_loss, val_accuracy
        );

        history.push(EpochMetrics {
            epoch,
            train_loss,
            val_accuracy,
        });
    }

    Ok(history)
}

/// Forward-only pass over the validation split; predictions thresholded
/// at 0.5.
pub fn validation_accuracy(model: &FraudModel, val: &FraudDataset) -> Result<f64> {
    let n = val.len();
    if n == 0 {
        return Ok(0.0);
    }

    let probs: Vec<f32> = model.forward(&val.countries, &val.amounts)?.to_vec1()?;
    let labels: Vec<f32> = val.labels.to_vec1()?;

    let correct = probs
        .iter()
        .zip(labels.iter())
        .filter(|(&p, &l)| (p > 0.5) == (l > 0.5))
        .count();

    Ok(correct as f64 / n as f64)
}
