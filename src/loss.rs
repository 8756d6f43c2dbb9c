use anyhow::Result;
use candle_core::{DType, Device, Tensor, D};

use crate::error::ModelError;

/// Mask (batch, max_len): 1.0 where `t < lengths[b]`, else 0.0.
/// Same values as the reversed cumulative sum of `one_hot(len - 1)`; a length
/// of zero yields an all-zero row.
pub fn sequence_mask(lengths: &[usize], max_len: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![0.0f32; lengths.len() * max_len];
    for (b, &len) in lengths.iter().enumerate() {
        for t in 0..len.min(max_len) {
            data[b * max_len + t] = 1.0;
        }
    }
    Tensor::from_vec(data, (lengths.len(), max_len), device).map_err(Into::into)
}

/// Per-position cross-entropy (batch, seq) for logits (batch, seq, vocab)
/// and integer targets (batch, seq).
pub fn token_cross_entropy(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let (b, s, v) = logits.dims3()?;
    if targets.dims() != [b, s] {
        return Err(ModelError::shape("targets", &[b, s], targets.dims()).into());
    }
    let log_probs = candle_nn::ops::log_softmax(&logits.reshape((b * s, v))?, D::Minus1)?;
    let idx = targets
        .to_dtype(DType::U32)?
        .reshape((b * s, 1))?
        .contiguous()?;
    let picked = log_probs.gather(&idx, 1)?; // (b*s, 1)
    picked.neg()?.reshape((b, s)).map_err(Into::into)
}

/// Mean masked cross-entropy over all unmasked positions in the batch.
pub fn sequence_loss(logits: &Tensor, targets: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let ce = token_cross_entropy(logits, targets)?;
    let total = (ce * mask)?.sum_all()?;
    let count = (mask.sum_all()? + 1e-12)?;
    (total / count).map_err(Into::into)
}

/// Per-sentence perplexity (batch,): exp of the masked mean cross-entropy of each row.
pub fn sentence_ppx(logits: &Tensor, targets: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let ce = token_cross_entropy(logits, targets)?;
    let per_row = (ce * mask)?.sum(1)?;
    let count = (mask.sum(1)? + 1e-12)?;
    (per_row / count)?.exp().map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar(t: &Tensor) -> Result<f32> {
        Ok(t.to_scalar::<f32>()?)
    }

    #[test]
    fn test_sequence_mask_values() -> Result<()> {
        let m = sequence_mask(&[3, 0, 5], 4, &Device::Cpu)?.to_vec2::<f32>()?;
        assert_eq!(m[0], vec![1.0, 1.0, 1.0, 0.0]);
        assert_eq!(m[1], vec![0.0; 4]);
        assert_eq!(m[2], vec![1.0; 4]);
        Ok(())
    }

    #[test]
    fn test_full_mask_equals_unmasked_cross_entropy() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::randn(0f32, 1.0, (2, 4, 7), &device)?;
        let targets = Tensor::new(&[[0u32, 1, 2, 3], [4, 5, 6, 0]], &device)?;
        let mask = sequence_mask(&[4, 4], 4, &device)?;

        let masked = scalar(&sequence_loss(&logits, &targets, &mask)?)?;
        let plain = scalar(&candle_nn::loss::cross_entropy(
            &logits.reshape((8, 7))?,
            &targets.reshape(8)?,
        )?)?;
        assert!((masked - plain).abs() < 1e-5, "{masked} vs {plain}");

        let ppx = sentence_ppx(&logits, &targets, &mask)?.to_vec1::<f32>()?;
        let ce = token_cross_entropy(&logits, &targets)?.mean(1)?.exp()?.to_vec1::<f32>()?;
        for (a, b) in ppx.iter().zip(&ce) {
            assert!((a - b).abs() / b < 1e-5, "{a} vs {b}");
        }
        Ok(())
    }

    #[test]
    fn test_positions_past_length_contribute_nothing() -> Result<()> {
        let device = Device::Cpu;
        let head = Tensor::randn(0f32, 1.0, (1, 2, 5), &device)?;
        let tail_a = Tensor::randn(0f32, 1.0, (1, 3, 5), &device)?;
        let tail_b = Tensor::randn(0f32, 10.0, (1, 3, 5), &device)?;
        let la = Tensor::cat(&[&head, &tail_a], 1)?;
        let lb = Tensor::cat(&[&head, &tail_b], 1)?;
        let ta = Tensor::new(&[[1u32, 2, 3, 4, 0]], &device)?;
        let tb = Tensor::new(&[[1u32, 2, 0, 0, 4]], &device)?;
        let mask = sequence_mask(&[2], 5, &device)?;

        let loss_a = scalar(&sequence_loss(&la, &ta, &mask)?)?;
        let loss_b = scalar(&sequence_loss(&lb, &tb, &mask)?)?;
        assert!((loss_a - loss_b).abs() < 1e-6);

        let ppx_a = sentence_ppx(&la, &ta, &mask)?.to_vec1::<f32>()?;
        let ppx_b = sentence_ppx(&lb, &tb, &mask)?.to_vec1::<f32>()?;
        assert!((ppx_a[0] - ppx_b[0]).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_uniform_logits_give_vocab_perplexity() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::zeros((1, 3, 9), DType::F32, &device)?;
        let targets = Tensor::new(&[[1u32, 2, 3]], &device)?;
        let mask = sequence_mask(&[3], 3, &device)?;
        let ppx = sentence_ppx(&logits, &targets, &mask)?.to_vec1::<f32>()?;
        assert!((ppx[0] - 9.0).abs() < 1e-3, "ppx = {}", ppx[0]);
        Ok(())
    }

    #[test]
    fn test_rejects_misaligned_targets() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::zeros((1, 3, 4), DType::F32, &device)?;
        let targets = Tensor::new(&[[1u32, 2]], &device)?;
        assert!(token_cross_entropy(&logits, &targets).is_err());
        Ok(())
    }
}
