//! Tensor dataset, seeded train/validation split, and mini-batch iteration.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::encoder::Encoded;

/// Encoded rows held as CPU tensors: country indices `[N]` (u32), raw
/// amounts `[N]` (f32), labels `[N]` (f32).
#[derive(Debug, Clone)]
pub struct FraudDataset {
    pub countries: Tensor,
    pub amounts: Tensor,
    pub labels: Tensor,
}

impl FraudDataset {
    pub fn from_encoded(encoded: &Encoded, device: &Device) -> Result<Self> {
        let amounts: Vec<f32> = encoded.amounts.iter().map(|&a| a as f32).collect();
        Ok(Self {
            countries: Tensor::new(encoded.countries.as_slice(), device)?,
            amounts: Tensor::new(amounts.as_slice(), device)?,
            labels: Tensor::new(encoded.labels.as_slice(), device)?,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Disjoint train/validation partitions.
pub struct DataSplit {
    pub train: FraudDataset,
    pub val: FraudDataset,
}

/// Shuffled (not stratified) split, deterministic under the seed. With
/// `val_ratio = 0.2` this is the 80/20 partition the trainer expects.
pub fn split(data: &FraudDataset, val_ratio: f64, seed: u64) -> Result<DataSplit> {
    let n = data.len();
    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let val_len = (n as f64 * val_ratio).round() as usize;
    let (val_idx, train_idx) = indices.split_at(val_len);

    Ok(DataSplit {
        train: take_rows(data, train_idx)?,
        val: take_rows(data, val_idx)?,
    })
}

fn take_rows(data: &FraudDataset, indices: &[usize]) -> Result<FraudDataset> {
    let device = data.countries.device().clone();
    if indices.is_empty() {
        return Ok(FraudDataset {
            countries: Tensor::zeros(0usize, DType::U32, &device)?,
            amounts: Tensor::zeros(0usize, DType::F32, &device)?,
            labels: Tensor::zeros(0usize, DType::F32, &device)?,
        });
    }
    let idx: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
    let idx_tensor = Tensor::new(idx.as_slice(), &device)?;
    Ok(FraudDataset {
        countries: data.countries.index_select(&idx_tensor, 0)?,
        amounts: data.amounts.index_select(&idx_tensor, 0)?,
        labels: data.labels.index_select(&idx_tensor, 0)?,
    })
}

/// Mini-batch iterator over a pre-loaded dataset. Reshuffles indices each
/// epoch; the final short batch is included.
pub struct BatchIterator {
    data: FraudDataset,
    indices: Vec<usize>,
    batch_size: usize,
    pos: usize,
}

impl BatchIterator {
    pub fn new(data: FraudDataset, batch_size: usize) -> Self {
        let n = data.len();
        Self {
            data,
            indices: (0..n).collect(),
            batch_size,
            pos: 0,
        }
    }

    /// Reshuffle for a new epoch using a seeded RNG derived from base seed + epoch.
    pub fn reshuffle(&mut self, seed: u64, epoch: usize) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(epoch as u64));
        self.indices.shuffle(&mut rng);
        self.pos = 0;
    }

    /// Returns the next mini-batch `(countries, amounts, labels)`, or None
    /// if the epoch is exhausted.
    pub fn next_batch(&mut self) -> Option<(Tensor, Tensor, Tensor)> {
        let n = self.indices.len();
        if self.pos >= n {
            return None;
        }

        let end = (self.pos + self.batch_size).min(n);
        let batch_idx: Vec<u32> = self.indices[self.pos..end]
            .iter()
            .map(|&i| i as u32)
            .collect();
        self.pos = end;

        let device = self.data.countries.device().clone();
        let idx_tensor = Tensor::new(batch_idx.as_slice(), &device).ok()?;
        let countries = self.data.countries.index_select(&idx_tensor, 0).ok()?;
        let amounts = self.data.amounts.index_select(&idx_tensor, 0).ok()?;
        let labels = self.data.labels.index_select(&idx_tensor, 0).ok()?;

        Some((countries, amounts, labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(n: usize) -> FraudDataset {
        let encoded = Encoded {
            countries: vec![0; n],
            amounts: (0..n).map(|i| i as f64).collect(),
            labels: vec![0.0; n],
        };
        FraudDataset::from_encoded(&encoded, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_batch_iterator_exhausts() {
        let mut iter = BatchIterator::new(dataset(10), 3);
        iter.reshuffle(42, 0);

        let mut count = 0;
        let mut rows = 0;
        while let Some((countries, _, _)) = iter.next_batch() {
            count += 1;
            rows += countries.dims()[0];
        }
        assert_eq!(count, 4); // ceil(10/3) = 4
        assert_eq!(rows, 10);
    }

    #[test]
    fn test_split_proportions() {
        let split = split(&dataset(100), 0.2, 42).unwrap();
        assert_eq!(split.val.len(), 20);
        assert_eq!(split.train.len(), 80);
    }

    #[test]
    fn test_split_is_disjoint_and_complete() {
        let split = split(&dataset(50), 0.2, 7).unwrap();
        // Amounts are unique row ids, so the union of both partitions'
        // amounts must be exactly 0..50.
        let mut seen: Vec<f32> = split.train.amounts.to_vec1().unwrap();
        seen.extend(split.val.amounts.to_vec1::<f32>().unwrap());
        seen.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let expected: Vec<f32> = (0..50).map(|i| i as f32).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_split_is_deterministic() {
        let a = split(&dataset(40), 0.2, 42).unwrap();
        let b = split(&dataset(40), 0.2, 42).unwrap();
        assert_eq!(
            a.val.amounts.to_vec1::<f32>().unwrap(),
            b.val.amounts.to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn test_tiny_dataset_yields_empty_validation() {
        // round(2 * 0.2) = 0 rows held out
        let split = split(&dataset(2), 0.2, 42).unwrap();
        assert!(split.val.is_empty());
        assert_eq!(split.train.len(), 2);
    }
}
