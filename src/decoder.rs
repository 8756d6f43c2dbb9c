// Attention decoder. Each step feeds [token embedding; previous attention] to the
// stacked RNN, builds a new attention vector from the top-layer output, and
// projects it to vocabulary logits. Training and greedy inference share weights.

use anyhow::Result;
use candle_core::{IndexOp, Module, Tensor, D};
use candle_nn::{linear, Linear, VarBuilder};

use crate::attention::{AttentionMemory, BahdanauAttention};
use crate::config::ModelConfig;
use crate::embedding::WordEmbedding;
use crate::rnn::{RnnState, StackedRnn};
use crate::vocab::{EOS_ID, GO_ID};

pub struct Decoder {
    rnn: StackedRnn,
    attention: BahdanauAttention,
    output_projection: Linear,
    max_length: usize,
}

impl Decoder {
    /// `kd_dim`: width of the knowledge context fused into attention, if any.
    pub fn new(cfg: &ModelConfig, kd_dim: Option<usize>, vb: VarBuilder) -> Result<Self> {
        let h = cfg.num_units;
        Ok(Self {
            rnn: StackedRnn::new(cfg.cell_class, cfg.dim_emb + h, h, cfg.num_layers, vb.pp("rnn"))?,
            attention: BahdanauAttention::new(h, kd_dim, vb.pp("attention"))?,
            output_projection: linear(h, cfg.vocab_size, vb.pp("output_projection"))?,
            max_length: cfg.max_length,
        })
    }

    pub fn prepare(&self, encoder_outputs: &Tensor, kd_context: Option<&Tensor>) -> Result<AttentionMemory> {
        self.attention.prepare(encoder_outputs, kd_context)
    }

    fn step(
        &self,
        input_emb: &Tensor,
        attention: &Tensor,
        state: &RnnState,
        memory: &AttentionMemory,
    ) -> Result<(Tensor, RnnState)> {
        let x = Tensor::cat(&[input_emb, attention], 1)?;
        let (h, state) = self.rnn.step(&x, state)?;
        let attention = self.attention.construct(&h, memory)?;
        Ok((attention, state))
    }

    /// Teacher-forced pass. `inputs` are the embedded decoder inputs
    /// (GO followed by the shifted targets), (batch, len, dim_emb).
    /// Returns logits (batch, len, vocab).
    pub fn train(&self, memory: &AttentionMemory, init_state: RnnState, inputs: &Tensor) -> Result<Tensor> {
        let (b, t, _) = inputs.dims3()?;
        let mut attention = self.attention.init_attention(b, inputs.device())?;
        let mut state = init_state;
        let mut outputs = Vec::with_capacity(t);
        for step in 0..t {
            let x = inputs.i((.., step, ..))?.contiguous()?;
            let (a, s) = self.step(&x, &attention, &state, memory)?;
            outputs.push(a.clone());
            attention = a;
            state = s;
        }
        let outputs = Tensor::stack(&outputs, 1)?; // (b, t, h)
        self.output_projection.forward(&outputs).map_err(Into::into)
    }

    /// Greedy decoding from GO. A row is finished once it emits EOS (kept in its
    /// output); decoding stops when every row is finished or after `max_length` steps.
    pub fn infer(
        &self,
        memory: &AttentionMemory,
        init_state: RnnState,
        embed: &WordEmbedding,
    ) -> Result<Vec<Vec<u32>>> {
        let b = init_state
            .first()
            .map(|s| s.h().dim(0))
            .transpose()?
            .unwrap_or(0);
        let device = embed.matrix().device().clone();

        let mut attention = self.attention.init_attention(b, &device)?;
        let mut state = init_state;
        let mut next_ids = vec![GO_ID; b];
        let mut generated: Vec<Vec<u32>> = vec![Vec::new(); b];
        let mut done = vec![false; b];

        for _ in 0..self.max_length {
            let ids = Tensor::new(next_ids.as_slice(), &device)?;
            let x = embed.embed(&ids)?;
            let (a, s) = self.step(&x, &attention, &state, memory)?;
            let logits = self.output_projection.forward(&a)?;
            next_ids = logits.argmax(D::Minus1)?.to_vec1::<u32>()?;

            for (row, &id) in next_ids.iter().enumerate() {
                if done[row] {
                    continue;
                }
                generated[row].push(id);
                if id == EOS_ID {
                    done[row] = true;
                }
            }
            attention = a;
            state = s;
            if done.iter().all(|&d| d) {
                break;
            }
        }
        Ok(generated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn setup(cfg: &ModelConfig, device: &Device) -> Result<(Decoder, WordEmbedding, VarMap)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let dec = Decoder::new(cfg, None, vb.pp("decoder"))?;
        let m = Tensor::randn(0f32, 1.0, (cfg.vocab_size, cfg.dim_emb), device)?;
        let emb = WordEmbedding::new(m, cfg.vocab_size, cfg.dim_emb)?;
        Ok((dec, emb, varmap))
    }

    #[test]
    fn test_train_logits_shape() -> Result<()> {
        let device = Device::Cpu;
        let cfg = ModelConfig::tiny();
        let (dec, _emb, _vm) = setup(&cfg, &device)?;
        let enc = Tensor::randn(0f32, 1.0, (2, 6, cfg.num_units), &device)?;
        let mem = dec.prepare(&enc, None)?;
        let state = dec.rnn.zero_state(2)?;
        let inputs = Tensor::randn(0f32, 1.0, (2, 4, cfg.dim_emb), &device)?;
        let logits = dec.train(&mem, state, &inputs)?;
        assert_eq!(logits.dims(), &[2, 4, cfg.vocab_size]);
        Ok(())
    }

    #[test]
    fn test_infer_respects_max_length() -> Result<()> {
        let device = Device::Cpu;
        let mut cfg = ModelConfig::tiny();
        cfg.max_length = 7;
        let (dec, emb, varmap) = setup(&cfg, &device)?;

        // Bias the projection away from EOS so decoding never stops early.
        let data = varmap.data().lock().map_err(|e| anyhow::anyhow!("{e}"))?;
        let bias = data
            .get("decoder.output_projection.bias")
            .ok_or_else(|| anyhow::anyhow!("bias missing"))?;
        let mut b = vec![0f32; cfg.vocab_size];
        b[EOS_ID as usize] = -1e4;
        bias.set(&Tensor::from_vec(b, cfg.vocab_size, &device)?)?;
        drop(data);

        let enc = Tensor::randn(0f32, 1.0, (3, 4, cfg.num_units), &device)?;
        let mem = dec.prepare(&enc, None)?;
        let out = dec.infer(&mem, dec.rnn.zero_state(3)?, &emb)?;
        assert_eq!(out.len(), 3);
        for row in out {
            assert_eq!(row.len(), 7);
            assert!(!row.contains(&EOS_ID));
        }
        Ok(())
    }

    #[test]
    fn test_infer_stops_at_eos() -> Result<()> {
        let device = Device::Cpu;
        let cfg = ModelConfig::tiny();
        let (dec, emb, varmap) = setup(&cfg, &device)?;

        let data = varmap.data().lock().map_err(|e| anyhow::anyhow!("{e}"))?;
        let bias = data
            .get("decoder.output_projection.bias")
            .ok_or_else(|| anyhow::anyhow!("bias missing"))?;
        let mut b = vec![0f32; cfg.vocab_size];
        b[EOS_ID as usize] = 1e4;
        bias.set(&Tensor::from_vec(b, cfg.vocab_size, &device)?)?;
        drop(data);

        let enc = Tensor::randn(0f32, 1.0, (2, 4, cfg.num_units), &device)?;
        let mem = dec.prepare(&enc, None)?;
        let out = dec.infer(&mem, dec.rnn.zero_state(2)?, &emb)?;
        assert_eq!(out, vec![vec![EOS_ID], vec![EOS_ID]]);
        Ok(())
    }
}
