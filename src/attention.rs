use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{linear, linear_no_bias, Init, Linear, VarBuilder};

use crate::error::ModelError;

// ---------------------------------------------------------------------------
// Gradient-safe softmax (built from basic ops so backward stays intact)
// ---------------------------------------------------------------------------

pub fn softmax_last_dim(x: &Tensor) -> Result<Tensor> {
    let max = x.max_keepdim(D::Minus1)?;
    let shifted = x.broadcast_sub(&max)?;
    let exp = shifted.exp()?;
    let sum = exp.sum_keepdim(D::Minus1)?;
    exp.broadcast_div(&sum).map_err(Into::into)
}

/// Additive alignment `sum_h v_h * tanh(keys + query)`; inputs broadcast
/// against each other, the last axis is reduced.
pub fn additive_scores(keys: &Tensor, query: &Tensor, v: &Tensor) -> Result<Tensor> {
    keys.broadcast_add(query)?
        .tanh()?
        .broadcast_mul(v)?
        .sum(D::Minus1)
        .map_err(Into::into)
}

pub(crate) fn attention_vector(num_units: usize, name: &str, vb: &VarBuilder) -> Result<Tensor> {
    let stdev = (num_units as f64).sqrt().recip();
    vb.get_with_hints(num_units, name, Init::Randn { mean: 0.0, stdev })
        .map_err(Into::into)
}

// ---------------------------------------------------------------------------
// Attention memory
// ---------------------------------------------------------------------------

/// Keys/values prepared once per batch and reused at every decoder step.
pub struct AttentionMemory {
    keys: Tensor,
    values: Tensor,
    kd_context: Option<Tensor>,
}

impl AttentionMemory {
    pub fn len(&self) -> usize {
        self.values.dim(1).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kd_context(&self) -> Option<&Tensor> {
        self.kd_context.as_ref()
    }
}

// ---------------------------------------------------------------------------
// Bahdanau attention
// ---------------------------------------------------------------------------

pub struct BahdanauAttention {
    key_proj: Linear,
    query_proj: Linear,
    v: Tensor,
    construct: Linear,
    num_units: usize,
    kd_dim: Option<usize>,
}

impl BahdanauAttention {
    /// `kd_dim` is the width of the knowledge context fused into the attention
    /// vector, `None` when knowledge selection is off.
    pub fn new(num_units: usize, kd_dim: Option<usize>, vb: VarBuilder) -> Result<Self> {
        let construct_in = 2 * num_units + kd_dim.unwrap_or(0);
        Ok(Self {
            key_proj: linear_no_bias(num_units, num_units, vb.pp("attention_keys"))?,
            query_proj: linear_no_bias(num_units, num_units, vb.pp("attention_query"))?,
            v: attention_vector(num_units, "attention_v", &vb)?,
            construct: linear(construct_in, num_units, vb.pp("attention_construct"))?,
            num_units,
            kd_dim,
        })
    }

    pub fn prepare(&self, states: &Tensor, kd_context: Option<&Tensor>) -> Result<AttentionMemory> {
        let kd_context = match (self.kd_dim, kd_context) {
            (Some(dim), Some(kd)) => {
                let b = states.dim(0)?;
                if kd.dims() != [b, dim] {
                    return Err(ModelError::shape("kd_context", &[b, dim], kd.dims()).into());
                }
                Some(kd.clone())
            }
            (None, None) => None,
            (Some(_), None) => anyhow::bail!("attention expects a knowledge context"),
            (None, Some(_)) => anyhow::bail!("attention built without knowledge context"),
        };
        Ok(AttentionMemory {
            keys: self.key_proj.forward(states)?,
            values: states.clone(),
            kd_context,
        })
    }

    /// Attention vector before the first step.
    pub fn init_attention(&self, batch: usize, device: &Device) -> Result<Tensor> {
        Tensor::zeros((batch, self.num_units), DType::F32, device).map_err(Into::into)
    }

    /// Softmax-normalized alignments (batch, steps) for a query (batch, num_units).
    pub fn alignments(&self, query: &Tensor, memory: &AttentionMemory) -> Result<Tensor> {
        let q = self.query_proj.forward(query)?.unsqueeze(1)?; // (b, 1, h)
        let scores = additive_scores(&memory.keys, &q, &self.v)?; // (b, t)
        softmax_last_dim(&scores)
    }

    /// Attention vector: `construct([query; context; kd_context])`.
    pub fn construct(&self, query: &Tensor, memory: &AttentionMemory) -> Result<Tensor> {
        let align = self.alignments(query, memory)?;
        let context = align.unsqueeze(1)?.matmul(&memory.values)?.squeeze(1)?; // (b, h)
        let mut parts = vec![query.clone(), context];
        if let Some(kd) = &memory.kd_context {
            parts.push(kd.clone());
        }
        let fused = Tensor::cat(&parts, 1)?;
        self.construct.forward(&fused).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    #[test]
    fn test_softmax_rows_sum_to_one() -> Result<()> {
        let x = Tensor::randn(0f32, 3.0, (4, 6), &Device::Cpu)?;
        let sums = softmax_last_dim(&x)?.sum(1)?.to_vec1::<f32>()?;
        for s in sums {
            assert!((s - 1.0).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_construct_shapes_with_and_without_kd() -> Result<()> {
        let device = Device::Cpu;
        for kd_dim in [None, Some(5)] {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
            let attn = BahdanauAttention::new(8, kd_dim, vb)?;
            let states = Tensor::randn(0f32, 1.0, (3, 7, 8), &device)?;
            let kd = match kd_dim {
                Some(d) => Some(Tensor::randn(0f32, 1.0, (3, d), &device)?),
                None => None,
            };
            let mem = attn.prepare(&states, kd.as_ref())?;
            assert_eq!(mem.len(), 7);
            let q = attn.init_attention(3, &device)?;
            let align = attn.alignments(&q, &mem)?;
            assert_eq!(align.dims(), &[3, 7]);
            assert_eq!(attn.construct(&q, &mem)?.dims(), &[3, 8]);
        }
        Ok(())
    }

    #[test]
    fn test_prepare_rejects_missing_kd() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let attn = BahdanauAttention::new(4, Some(3), vb)?;
        let states = Tensor::zeros((1, 2, 4), DType::F32, &device)?;
        assert!(attn.prepare(&states, None).is_err());
        Ok(())
    }
}
