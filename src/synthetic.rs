// Seeded synthetic inputs for smoke runs and tests: vocabulary, embedding matrix,
// selector parameters, batches.

use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::batch::{Batch, Example};
use crate::config::ModelConfig;
use crate::selector::{
    SelectorParams, BILINEAR_MAT, FC1_BIASES, FC1_WEIGHTS, FC2_BIASES, FC2_WEIGHTS,
};
use crate::vocab::{with_reserved_symbols, NONE_SYMBOL};

/// Reserved symbols followed by `w4, w5, ...` up to `vocab_size` entries.
pub fn vocabulary(vocab_size: usize) -> Vec<String> {
    let reserved = with_reserved_symbols::<&str>(&[]).len();
    let words: Vec<String> = (reserved..vocab_size).map(|i| format!("w{i}")).collect();
    with_reserved_symbols(&words)
}

pub fn kd_types() -> Vec<String> {
    [NONE_SYMBOL, "IsA", "RelatedTo", "PartOf", "Synonym", "AtLocation"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn uniform(rng: &mut StdRng, n: usize, scale: f32) -> Vec<f32> {
    (0..n).map(|_| rng.gen_range(-scale..scale)).collect()
}

pub fn embedding(vocab_size: usize, dim_emb: usize, seed: u64, device: &Device) -> Result<Tensor> {
    let mut rng = StdRng::seed_from_u64(seed);
    let data = uniform(&mut rng, vocab_size * dim_emb, 0.5);
    Tensor::from_vec(data, (vocab_size, dim_emb), device).map_err(Into::into)
}

pub fn bilinear_params(cfg: &ModelConfig, seed: u64, device: &Device) -> Result<SelectorParams> {
    let mut rng = StdRng::seed_from_u64(seed);
    let (e, h) = (cfg.dim_emb, cfg.num_units);
    let mut p = SelectorParams::new();
    p.insert(
        BILINEAR_MAT.into(),
        Tensor::from_vec(uniform(&mut rng, e * h, 0.1), (e, h), device)?,
    );
    Ok(p)
}

pub fn mlp_params(cfg: &ModelConfig, hidden: usize, seed: u64, device: &Device) -> Result<SelectorParams> {
    let mut rng = StdRng::seed_from_u64(seed);
    let d_in = cfg.num_units + cfg.dim_emb;
    let mut p = SelectorParams::new();
    p.insert(
        FC1_WEIGHTS.into(),
        Tensor::from_vec(uniform(&mut rng, d_in * hidden, 0.1), (d_in, hidden), device)?,
    );
    p.insert(FC1_BIASES.into(), Tensor::from_vec(uniform(&mut rng, hidden, 0.1), hidden, device)?);
    p.insert(
        FC2_WEIGHTS.into(),
        Tensor::from_vec(uniform(&mut rng, hidden, 0.1), (hidden, 1), device)?,
    );
    p.insert(FC2_BIASES.into(), Tensor::from_vec(vec![0.0f32], 1, device)?);
    Ok(p)
}

fn sentence(rng: &mut StdRng, words: &[String], max_len: usize) -> Vec<String> {
    let len = rng.gen_range(1..=max_len);
    (0..len)
        .map(|_| words[rng.gen_range(0..words.len())].clone())
        .collect()
}

/// Random examples over the non-reserved part of `vocab`, padded into a batch.
pub fn batch(vocab: &[String], batch_size: usize, seed: u64) -> Batch {
    let reserved = with_reserved_symbols::<&str>(&[]).len();
    let words = if vocab.len() > reserved { &vocab[reserved..] } else { vocab };
    let mut rng = StdRng::seed_from_u64(seed);

    let examples: Vec<Example> = (0..batch_size)
        .map(|_| {
            let n_triples = rng.gen_range(1..=3);
            Example {
                post: sentence(&mut rng, words, 6),
                response: sentence(&mut rng, words, 5),
                corr_responses: (0..2).map(|_| sentence(&mut rng, words, 4)).collect(),
                triples: (0..n_triples)
                    .map(|_| {
                        let t = sentence(&mut rng, words, 1);
                        [t[0].clone(), words[0].clone(), words[words.len() - 1].clone()]
                    })
                    .collect(),
            }
        })
        .collect();
    Batch::from_examples(&examples)
}

/// External representations (batch, k, dim_trans).
pub fn trans_reprs(cfg: &ModelConfig, batch: usize, k: usize, seed: u64, device: &Device) -> Result<Tensor> {
    let mut rng = StdRng::seed_from_u64(seed);
    let data = uniform(&mut rng, batch * k * cfg.dim_trans, 0.5);
    Tensor::from_vec(data, (batch, k, cfg.dim_trans), device).map_err(Into::into)
}
