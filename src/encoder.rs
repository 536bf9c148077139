use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::csv_reader::Transaction;

/// Dense index assignment for country strings, in first-seen order.
/// Covers exactly the distinct values present in the training data;
/// countries unseen at training time have no index.
#[derive(Debug, Default, Clone)]
pub struct Vocabulary {
    index: HashMap<String, u32>,
    names: Vec<String>,
}

impl Vocabulary {
    fn get_or_insert(&mut self, country: &str) -> u32 {
        if let Some(&idx) = self.index.get(country) {
            return idx;
        }
        let idx = self.names.len() as u32;
        self.index.insert(country.to_string(), idx);
        self.names.push(country.to_string());
        idx
    }

    pub fn index_of(&self, country: &str) -> Option<u32> {
        self.index.get(country).copied()
    }

    /// Country names ordered by their assigned index.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Per-row encoded columns: country index, raw amount, binary label.
#[derive(Debug, Clone)]
pub struct Encoded {
    pub countries: Vec<u32>,
    pub amounts: Vec<f64>,
    pub labels: Vec<f32>,
}

impl Encoded {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Build the country vocabulary and encode every row. No validation of
/// negative amounts or labels outside {0, 1}; such rows propagate as-is.
pub fn encode(rows: &[Transaction]) -> (Vocabulary, Encoded) {
    let mut vocab = Vocabulary::default();
    let mut countries = Vec::with_capacity(rows.len());
    let mut amounts = Vec::with_capacity(rows.len());
    let mut labels = Vec::with_capacity(rows.len());

    for row in rows {
        countries.push(vocab.get_or_insert(&row.shipping_country));
        amounts.push(row.amount_units);
        labels.push(f32::from(row.label_suspicious));
    }

    (
        vocab,
        Encoded {
            countries,
            amounts,
            labels,
        },
    )
}

/// Mean and sample standard deviation of `log1p(amount_units)`, computed
/// over the entire dataset before splitting. Baked into the model as
/// fixed constants and duplicated in the stats sidecar for serving.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NormStats {
    pub mean: f64,
    pub std: f64,
}

impl NormStats {
    /// A single-row dataset yields a NaN std (ddof = 1), and a constant
    /// amount column yields std = 0; neither is guarded here.
    pub fn from_amounts(amounts: &[f64]) -> Self {
        let logged = Array1::from_iter(amounts.iter().map(|&a| a.ln_1p()));
        NormStats {
            mean: logged.mean().unwrap_or(f64::NAN),
            std: logged.std(1.0),
        }
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        serde_json::to_writer(file, self)
            .with_context(|| format!("failed to write stats to {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(country: &str, amount: f64, label: u8) -> Transaction {
        Transaction {
            shipping_country: country.to_string(),
            amount_units: amount,
            label_suspicious: label,
        }
    }

    #[test]
    fn test_vocabulary_first_seen_order() {
        let rows = vec![
            row("US", 10.0, 0),
            row("DE", 20.0, 0),
            row("US", 30.0, 1),
            row("FR", 40.0, 1),
        ];
        let (vocab, encoded) = encode(&rows);

        assert_eq!(vocab.len(), 3);
        assert_eq!(vocab.index_of("US"), Some(0));
        assert_eq!(vocab.index_of("DE"), Some(1));
        assert_eq!(vocab.index_of("FR"), Some(2));
        assert_eq!(vocab.index_of("GB"), None);
        assert_eq!(encoded.countries, vec![0, 1, 0, 2]);
    }

    #[test]
    fn test_vocabulary_is_bijection() {
        let rows: Vec<Transaction> = ["US", "DE", "FR", "DE", "NG", "US", "BR"]
            .iter()
            .map(|c| row(c, 1.0, 0))
            .collect();
        let (vocab, _) = encode(&rows);

        // Every distinct name maps to a distinct index in 0..n-1.
        let mut seen = vec![false; vocab.len()];
        for name in vocab.names() {
            let idx = vocab.index_of(name).unwrap() as usize;
            assert!(idx < vocab.len());
            assert!(!seen[idx], "duplicate index {idx}");
            seen[idx] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_encode_columns() {
        let rows = vec![row("US", 12.5, 0), row("DE", 99.0, 1)];
        let (_, encoded) = encode(&rows);
        assert_eq!(encoded.len(), 2);
        assert_eq!(encoded.amounts, vec![12.5, 99.0]);
        assert_eq!(encoded.labels, vec![0.0, 1.0]);
    }

    #[test]
    fn test_norm_stats_match_hand_computation() {
        // mean/std of log1p([1, 9, 99]) = mean/std of [ln 2, ln 10, ln 100]
        let amounts = [1.0, 9.0, 99.0];
        let logged: Vec<f64> = amounts.iter().map(|&a| f64::ln_1p(a)).collect();
        let mean = logged.iter().sum::<f64>() / 3.0;
        let var = logged.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / 2.0;

        let stats = NormStats::from_amounts(&amounts);
        assert!((stats.mean - mean).abs() < 1e-12);
        assert!((stats.std - var.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_norm_stats_zero_std_for_constant_amounts() {
        let stats = NormStats::from_amounts(&[50.0, 50.0, 50.0]);
        assert_eq!(stats.std, 0.0);
    }

    #[test]
    fn test_write_json_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        let stats = NormStats::from_amounts(&[1.0, 9.0, 99.0]);
        stats.write_json(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: NormStats = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed.mean, stats.mean);
        assert_eq!(parsed.std, stats.std);
    }

    #[test]
    fn test_write_json_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.json");
        let b = dir.path().join("b.json");
        let stats = NormStats::from_amounts(&[3.0, 17.0, 250.0, 8000.0]);
        stats.write_json(&a).unwrap();
        stats.write_json(&b).unwrap();
        assert_eq!(
            std::fs::read(&a).unwrap(),
            std::fs::read(&b).unwrap()
        );
    }
}
