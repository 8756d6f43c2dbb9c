use anyhow::Result;
use candle_core::{Module, Tensor};
use candle_nn::Embedding;

use crate::error::ModelError;

/// Pretrained word embedding. The matrix is held as a plain tensor, outside
/// the `VarMap`, so no optimizer ever sees it.
pub struct WordEmbedding {
    table: Embedding,
    dim_emb: usize,
}

impl WordEmbedding {
    pub fn new(matrix: Tensor, vocab_size: usize, dim_emb: usize) -> Result<Self> {
        let dims = matrix.dims();
        if dims != [vocab_size, dim_emb] {
            return Err(ModelError::shape("word_embed", &[vocab_size, dim_emb], dims).into());
        }
        // Drop any autograd history the caller's tensor may carry.
        let matrix = matrix.detach();
        Ok(Self {
            table: Embedding::new(matrix, dim_emb),
            dim_emb,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim_emb
    }

    pub fn matrix(&self) -> &Tensor {
        self.table.embeddings()
    }

    /// Gather rows for `ids` of any rank: (..., ) -> (..., dim_emb).
    pub fn embed(&self, ids: &Tensor) -> Result<Tensor> {
        self.table.forward(ids).map_err(Into::into)
    }

    /// Triple ids (batch, n, 3) -> (batch, n, 3 * dim_emb): the three component
    /// vectors laid side by side, grouped at width 3*dim_emb and averaged per group.
    pub fn embed_triples(&self, ids: &Tensor) -> Result<Tensor> {
        let (b, n, parts) = ids.dims3()?;
        if parts != 3 {
            return Err(ModelError::shape("triples", &[b, n, 3], &[b, n, parts]).into());
        }
        let emb = self.embed(ids)?; // (b, n, 3, e)
        let e = self.dim_emb;
        let grouped = emb.reshape((b, n, parts / 3, 3 * e))?;
        grouped.mean(2).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn table(device: &Device) -> Result<WordEmbedding> {
        // row i = [i, 10 + i]
        let data: Vec<f32> = (0..5).flat_map(|i| [i as f32, 10.0 + i as f32]).collect();
        let m = Tensor::from_vec(data, (5, 2), device)?;
        WordEmbedding::new(m, 5, 2)
    }

    #[test]
    fn test_embed_preserves_leading_dims() -> Result<()> {
        let device = Device::Cpu;
        let emb = table(&device)?;
        let ids2 = Tensor::zeros((3, 4), DType::U32, &device)?;
        assert_eq!(emb.embed(&ids2)?.dims(), &[3, 4, 2]);
        let ids4 = Tensor::zeros((2, 3, 4, 3), DType::U32, &device)?;
        assert_eq!(emb.embed(&ids4)?.dims(), &[2, 3, 4, 3, 2]);
        Ok(())
    }

    #[test]
    fn test_embed_gathers_rows() -> Result<()> {
        let device = Device::Cpu;
        let emb = table(&device)?;
        let ids = Tensor::new(&[[4u32, 1]], &device)?;
        let out = emb.embed(&ids)?.squeeze(0)?.to_vec2::<f32>()?;
        assert_eq!(out, vec![vec![4.0, 14.0], vec![1.0, 11.0]]);
        Ok(())
    }

    #[test]
    fn test_triples_concatenate_components() -> Result<()> {
        let device = Device::Cpu;
        let emb = table(&device)?;
        let ids = Tensor::new(&[[[1u32, 2, 3]]], &device)?; // (1, 1, 3)
        let out = emb.embed_triples(&ids)?;
        assert_eq!(out.dims(), &[1, 1, 6]);
        let v = out.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(v, vec![1.0, 11.0, 2.0, 12.0, 3.0, 13.0]);
        Ok(())
    }

    #[test]
    fn test_rejects_wrong_matrix_shape() -> Result<()> {
        let device = Device::Cpu;
        let m = Tensor::zeros((4, 2), DType::F32, &device)?;
        assert!(WordEmbedding::new(m, 5, 2).is_err());
        Ok(())
    }
}
