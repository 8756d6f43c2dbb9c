// Post encoder: stacked RNN over the post, then mutual attention against the
// exemplar responses. The mutual context (and optional external representations)
// is appended to the encoder outputs as extra steps.

use anyhow::Result;
use candle_core::{DType, Module, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

use crate::attention::{additive_scores, attention_vector, softmax_last_dim};
use crate::config::ModelConfig;
use crate::error::ModelError;
use crate::rnn::{RnnState, StackedRnn};

pub struct EncoderOutput {
    /// (batch, post_len + 1 [+ k], num_units)
    pub outputs: Tensor,
    /// Final recurrent state, untouched by the appended steps.
    pub state: RnnState,
}

pub struct Encoder {
    rnn: StackedRnn,
    encoder_out_transform: Linear,
    corr_response_transform: Linear,
    attention_v: Tensor,
    trans_reprs_transform: Option<Linear>,
    num_units: usize,
    dim_emb: usize,
    dim_trans: usize,
}

impl Encoder {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let h = cfg.num_units;
        let rnn = StackedRnn::new(cfg.cell_class, cfg.dim_emb, h, cfg.num_layers, vb.pp("encoder"))?;

        let mvb = vb.pp("mutual_attention");
        let encoder_out_transform = linear(h, h, mvb.pp("encoder_out_transform"))?;
        let corr_response_transform = linear(cfg.dim_emb, h, mvb.pp("corr_response_transform"))?;
        let attention_v = attention_vector(h, "attention_v", &mvb)?;

        let trans_reprs_transform = if cfg.use_trans_repr {
            Some(linear(cfg.dim_trans, h, vb.pp("trans_reprs_transform"))?)
        } else {
            None
        };

        Ok(Self {
            rnn,
            encoder_out_transform,
            corr_response_transform,
            attention_v,
            trans_reprs_transform,
            num_units: h,
            dim_emb: cfg.dim_emb,
            dim_trans: cfg.dim_trans,
        })
    }

    /// Mutual attention context (batch, num_units).
    ///
    /// Every exemplar token attends over the encoder steps independently
    /// (`v . tanh(Wenc enc + Wcorr corr)`, softmax over steps); the resulting
    /// contexts are averaged over all exemplar tokens.
    pub fn mutual_context(&self, encoder_out: &Tensor, corr_emb: &Tensor) -> Result<Tensor> {
        let (b, k, l, e) = corr_emb.dims4()?;
        if e != self.dim_emb {
            return Err(ModelError::shape("corr_responses", &[b, k, l, self.dim_emb], &[b, k, l, e]).into());
        }
        let m = k * l;
        if m == 0 {
            return Tensor::zeros((b, self.num_units), DType::F32, encoder_out.device())
                .map_err(Into::into);
        }
        let corr = corr_emb.reshape((b, m, e))?;

        let enc_t = self.encoder_out_transform.forward(encoder_out)?.unsqueeze(1)?; // (b, 1, t, h)
        let corr_t = self.corr_response_transform.forward(&corr)?.unsqueeze(2)?; // (b, m, 1, h)
        let scores = additive_scores(&enc_t, &corr_t, &self.attention_v)?; // (b, m, t)
        let align = softmax_last_dim(&scores)?;

        let contexts = align.matmul(&encoder_out.contiguous()?)?; // (b, m, h)
        contexts.mean(1).map_err(Into::into)
    }

    pub fn forward(
        &self,
        post_emb: &Tensor,
        post_len: &[usize],
        corr_emb: &Tensor,
        trans_reprs: Option<&Tensor>,
    ) -> Result<EncoderOutput> {
        let (outputs, state) = self.rnn.run(post_emb, post_len)?;
        let mutual = self.mutual_context(&outputs, corr_emb)?;
        let mut parts = vec![outputs, mutual.unsqueeze(1)?];

        if let Some(transform) = &self.trans_reprs_transform {
            let reprs = trans_reprs.ok_or(ModelError::MissingTransReprs)?;
            let (b, k, d) = reprs.dims3()?;
            if d != self.dim_trans || b != post_emb.dim(0)? {
                return Err(ModelError::shape(
                    "trans_reprs",
                    &[post_emb.dim(0)?, k, self.dim_trans],
                    &[b, k, d],
                )
                .into());
            }
            parts.push(transform.forward(reprs)?);
        }

        Ok(EncoderOutput {
            outputs: Tensor::cat(&parts, 1)?,
            state,
        })
    }
}
