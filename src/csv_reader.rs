use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// One row of the training CSV. Required columns: `shipping_country`,
/// `amount_units`, `label_suspicious`. A missing column or malformed
/// value fails the whole load.
#[derive(Debug, Deserialize, Clone)]
pub struct Transaction {
    pub shipping_country: String,
    pub amount_units: f64,
    pub label_suspicious: u8,
}

pub fn read_transactions(file_path: &Path) -> Result<Vec<Transaction>> {
    let file = File::open(file_path)
        .with_context(|| format!("failed to open {}", file_path.display()))?;
    let mut rdr = csv::Reader::from_reader(file);

    let transactions: Vec<Transaction> = rdr
        .deserialize()
        .collect::<Result<Vec<Transaction>, csv::Error>>()
        .with_context(|| format!("failed to parse {}", file_path.display()))?;

    Ok(transactions)
}
