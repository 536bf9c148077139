// Offline training utility for the transaction fraud model. Loads the
// transactions CSV, encodes features, fits the classifier, and exports
// the result as an ONNX graph plus a JSON normalization-stats sidecar.
use std::path::PathBuf;

use anyhow::Result;
use candle_core::Device;
use clap::Parser;

use csv_reader::read_transactions;
use dataset::FraudDataset;
use model::FraudModel;
use trainer::TrainConfig;

mod csv_reader;
mod dataset;
mod encoder;
mod model;
mod onnx;
mod trainer;

const VAL_RATIO: f64 = 0.2;

#[derive(Parser)]
#[command(
    name = "fraud_trainer",
    about = "Train the transaction fraud model and export it to ONNX"
)]
struct Cli {
    /// Path to the CSV dataset.
    #[arg(long, default_value = "fraud_data.csv")]
    data: PathBuf,

    /// Number of training epochs.
    #[arg(long, default_value_t = 10)]
    epochs: usize,

    /// Mini-batch size.
    #[arg(long = "batch_size", default_value_t = 64)]
    batch_size: usize,

    /// Learning rate.
    #[arg(long, default_value_t = 1e-3)]
    lr: f64,

    /// Output ONNX model file.
    #[arg(long, default_value = "fraud_model.onnx")]
    output: PathBuf,

    /// Output JSON file for the normalization mean/std.
    #[arg(long = "stats_out", default_value = "stats.json")]
    stats_out: PathBuf,

    /// Random seed for the split, batch shuffling, and weight init.
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let rows = read_transactions(&cli.data)?;
    let (vocab, encoded) = encoder::encode(&rows);
    println!(
        "Loaded {} transactions, {} countries",
        encoded.len(),
        vocab.len()
    );

    // Stats cover the full dataset and must exist before the split and
    // before model construction; the sidecar duplicates what gets baked
    // into the exported graph.
    let stats = encoder::NormStats::from_amounts(&encoded.amounts);
    stats.write_json(&cli.stats_out)?;

    let device = Device::Cpu;
    let data = FraudDataset::from_encoded(&encoded, &device)?;
    let split = dataset::split(&data, VAL_RATIO, cli.seed)?;

    let model = FraudModel::new(vocab.len(), stats, cli.seed, &device)?;
    let config = TrainConfig {
        epochs: cli.epochs,
        batch_size: cli.batch_size,
        lr: cli.lr,
        seed: cli.seed,
    };
    trainer::train(&model, &split, &config)?;

    onnx::export_model(&model, &cli.output)?;
    println!("Model exported to {}", cli.output.display());

    Ok(())
}
