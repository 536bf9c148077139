//! The fraud classifier: country embedding concatenated with the
//! normalized log1p amount, through two dense layers to a probability.
//!
//! ```text
//! embed(country) ++ (log1p(amount) - mean) / std -> Linear(16) -> ReLU -> Linear(1) -> Sigmoid
//! ```
//!
//! The normalization stats are fixed constants baked in at construction,
//! not learned, so they must be computed before the model is built.

use anyhow::Result;
use candle_core::{Device, Tensor, Var};
use candle_nn::{Embedding, Linear, Module};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::encoder::NormStats;

/// Width of the country embedding vectors.
pub const EMBEDDING_DIM: usize = 4;

/// Units in the hidden dense layer.
pub const HIDDEN_DIM: usize = 16;

pub struct FraudModel {
    emb_weight: Var,
    fc1_weight: Var,
    fc1_bias: Var,
    fc2_weight: Var,
    fc2_bias: Var,
    embedding: Embedding,
    fc1: Linear,
    fc2: Linear,
    stats: NormStats,
    num_countries: usize,
}

impl FraudModel {
    /// Build a model with freshly initialized weights: embedding ~ N(0, 1),
    /// dense layers uniform in (-1/sqrt(fan_in), 1/sqrt(fan_in)). All
    /// sampling comes from a seeded RNG so reruns start from the same
    /// weights.
    pub fn new(
        num_countries: usize,
        stats: NormStats,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let emb_weight = Var::from_tensor(&Tensor::from_vec(
            randn_vec(&mut rng, num_countries * EMBEDDING_DIM),
            (num_countries, EMBEDDING_DIM),
            device,
        )?)?;

        let in_dim = EMBEDDING_DIM + 1;
        let bound1 = 1.0 / (in_dim as f64).sqrt();
        let fc1_weight = Var::from_tensor(&Tensor::from_vec(
            uniform_vec(&mut rng, HIDDEN_DIM * in_dim, bound1),
            (HIDDEN_DIM, in_dim),
            device,
        )?)?;
        let fc1_bias = Var::from_tensor(&Tensor::from_vec(
            uniform_vec(&mut rng, HIDDEN_DIM, bound1),
            HIDDEN_DIM,
            device,
        )?)?;

        let bound2 = 1.0 / (HIDDEN_DIM as f64).sqrt();
        let fc2_weight = Var::from_tensor(&Tensor::from_vec(
            uniform_vec(&mut rng, HIDDEN_DIM, bound2),
            (1, HIDDEN_DIM),
            device,
        )?)?;
        let fc2_bias = Var::from_tensor(&Tensor::from_vec(
            uniform_vec(&mut rng, 1, bound2),
            1usize,
            device,
        )?)?;

        // The layers hold clones of the Var tensors; clones share storage,
        // so optimizer updates to the Vars are visible in the layers.
        let embedding = Embedding::new(emb_weight.as_tensor().clone(), EMBEDDING_DIM);
        let fc1 = Linear::new(
            fc1_weight.as_tensor().clone(),
            Some(fc1_bias.as_tensor().clone()),
        );
        let fc2 = Linear::new(
            fc2_weight.as_tensor().clone(),
            Some(fc2_bias.as_tensor().clone()),
        );

        Ok(Self {
            emb_weight,
            fc1_weight,
            fc1_bias,
            fc2_weight,
            fc2_bias,
            embedding,
            fc1,
            fc2,
            stats,
            num_countries,
        })
    }

    /// The trainable parameters, for the optimizer. The normalization
    /// constants are not among them.
    pub fn trainable_vars(&self) -> Vec<Var> {
        vec![
            self.emb_weight.clone(),
            self.fc1_weight.clone(),
            self.fc1_bias.clone(),
            self.fc2_weight.clone(),
            self.fc2_bias.clone(),
        ]
    }

    /// Forward pass up to the final pre-sigmoid activation, `[batch]`.
    ///
    /// `countries` are u32 indices `[batch]`, `amounts` raw units `[batch]`.
    /// A zero std divides by zero here and produces non-finite outputs.
    pub fn forward_logits(&self, countries: &Tensor, amounts: &Tensor) -> Result<Tensor> {
        let emb = self.embedding.forward(countries)?; // [batch, EMBEDDING_DIM]

        let amount = amounts.unsqueeze(1)?; // [batch, 1]
        let logged = amount.affine(1.0, 1.0)?.log()?; // log1p
        let normalized = logged.affine(1.0 / self.stats.std, -self.stats.mean / self.stats.std)?;

        let x = Tensor::cat(&[&emb, &normalized], 1)?; // [batch, EMBEDDING_DIM + 1]
        let hidden = self.fc1.forward(&x)?.relu()?;
        let logits = self.fc2.forward(&hidden)?; // [batch, 1]
        Ok(logits.squeeze(1)?)
    }

    /// Fraud probability in (0, 1) for each row, `[batch]`.
    pub fn forward(&self, countries: &Tensor, amounts: &Tensor) -> Result<Tensor> {
        let logits = self.forward_logits(countries, amounts)?;
        Ok(candle_nn::ops::sigmoid(&logits)?)
    }

    pub fn num_countries(&self) -> usize {
        self.num_countries
    }

    pub fn stats(&self) -> NormStats {
        self.stats
    }

    /// Copy the trained parameters to host memory for export.
    pub fn export_params(&self) -> Result<ModelParams> {
        Ok(ModelParams {
            embedding: host_vec(self.emb_weight.as_tensor())?,
            fc1_weight: host_vec(self.fc1_weight.as_tensor())?,
            fc1_bias: host_vec(self.fc1_bias.as_tensor())?,
            fc2_weight: host_vec(self.fc2_weight.as_tensor())?,
            fc2_bias: host_vec(self.fc2_bias.as_tensor())?,
        })
    }
}

/// Trained parameters in row-major host vectors.
pub struct ModelParams {
    /// `[num_countries, EMBEDDING_DIM]`
    pub embedding: Vec<f32>,
    /// `[HIDDEN_DIM, EMBEDDING_DIM + 1]`
    pub fc1_weight: Vec<f32>,
    /// `[HIDDEN_DIM]`
    pub fc1_bias: Vec<f32>,
    /// `[1, HIDDEN_DIM]`
    pub fc2_weight: Vec<f32>,
    /// `[1]`
    pub fc2_bias: Vec<f32>,
}

fn host_vec(t: &Tensor) -> Result<Vec<f32>> {
    Ok(t.flatten_all()?.to_vec1()?)
}

/// Standard normal samples via Box-Muller (the pack carries no normal
/// distribution crate).
fn randn_vec(rng: &mut ChaCha8Rng, n: usize) -> Vec<f32> {
    (0..n)
        .map(|_| {
            let u1: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
            let u2: f64 = rng.gen();
            ((-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()) as f32
        })
        .collect()
}

fn uniform_vec(rng: &mut ChaCha8Rng, n: usize, bound: f64) -> Vec<f32> {
    (0..n).map(|_| rng.gen_range(-bound..bound) as f32).collect()
}
