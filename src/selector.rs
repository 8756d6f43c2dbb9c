// Knowledge selection ("transfer matching"): score each knowledge triple against
// the dialogue context and blend the triples into one knowledge context vector.
//
// Selector weights come pretrained from outside. Which scorer is used depends only
// on the keys present in the parameter mapping.

use anyhow::{anyhow, Result};
use candle_core::{Module, Tensor, Var};
use candle_nn::{linear, Linear, VarBuilder, VarMap};
use std::collections::HashMap;
use std::fmt;

use crate::error::ModelError;

pub type SelectorParams = HashMap<String, Tensor>;

pub const BILINEAR_MAT: &str = "bilinear_mat";
pub const FC1_WEIGHTS: &str = "fc1_weights";
pub const FC1_BIASES: &str = "fc1_biases";
pub const FC2_WEIGHTS: &str = "fc2_weights";
pub const FC2_BIASES: &str = "fc2_biases";

/// VarMap prefix for selector weights when they are trainable.
const SELECT_SCOPE: &str = "select";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    Bilinear,
    Mlp,
}

impl fmt::Display for SelectMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bilinear => write!(f, "bilinear"),
            Self::Mlp => write!(f, "mlp"),
        }
    }
}

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

pub enum KnowledgeSelector {
    Bilinear {
        mat: Tensor,
    },
    Mlp {
        fc1_w: Tensor,
        fc1_b: Tensor,
        fc2_w: Tensor,
        fc2_b: Tensor,
    },
}

fn take<'a>(params: &'a SelectorParams, key: &'static str) -> Result<&'a Tensor> {
    params
        .get(key)
        .ok_or_else(|| ModelError::MissingSelectorParam(key).into())
}

fn check_dims(key: &'static str, t: &Tensor, expected: &[usize]) -> Result<()> {
    if t.dims() != expected {
        return Err(ModelError::shape(key, expected, t.dims()).into());
    }
    Ok(())
}

/// Constant unless `trainable`, in which case the tensor becomes a `Var` in `varmap`.
fn register(varmap: &VarMap, key: &str, t: &Tensor, trainable: bool) -> Result<Tensor> {
    if !trainable {
        return Ok(t.detach());
    }
    let var = Var::from_tensor(t)?;
    let tensor = var.as_tensor().clone();
    varmap
        .data()
        .lock()
        .map_err(|e| anyhow!("parameter map poisoned: {e}"))?
        .insert(format!("{SELECT_SCOPE}.{key}"), var);
    Ok(tensor)
}

impl KnowledgeSelector {
    /// `bilinear_mat` present selects the bilinear scorer, anything else the MLP.
    pub fn from_params(
        params: &SelectorParams,
        num_units: usize,
        dim_emb: usize,
        trainable: bool,
        varmap: &VarMap,
    ) -> Result<Self> {
        if let Some(mat) = params.get(BILINEAR_MAT) {
            check_dims(BILINEAR_MAT, mat, &[dim_emb, num_units])?;
            return Ok(Self::Bilinear {
                mat: register(varmap, BILINEAR_MAT, mat, trainable)?,
            });
        }

        let fc1_w = take(params, FC1_WEIGHTS)?;
        let fc1_b = take(params, FC1_BIASES)?;
        let fc2_w = take(params, FC2_WEIGHTS)?;
        let fc2_b = take(params, FC2_BIASES)?;
        let hidden = fc1_w.dims().last().copied().unwrap_or(0);
        check_dims(FC1_WEIGHTS, fc1_w, &[num_units + dim_emb, hidden])?;
        check_dims(FC1_BIASES, fc1_b, &[hidden])?;
        check_dims(FC2_WEIGHTS, fc2_w, &[hidden, 1])?;
        check_dims(FC2_BIASES, fc2_b, &[1])?;

        Ok(Self::Mlp {
            fc1_w: register(varmap, FC1_WEIGHTS, fc1_w, trainable)?,
            fc1_b: register(varmap, FC1_BIASES, fc1_b, trainable)?,
            fc2_w: register(varmap, FC2_WEIGHTS, fc2_w, trainable)?,
            fc2_b: register(varmap, FC2_BIASES, fc2_b, trainable)?,
        })
    }

    pub fn mode(&self) -> SelectMode {
        match self {
            Self::Bilinear { .. } => SelectMode::Bilinear,
            Self::Mlp { .. } => SelectMode::Mlp,
        }
    }

    /// Scores (n,) for context rows (n, num_units) against knowledge rows (n, dim_emb).
    pub fn score(&self, context: &Tensor, knowledge: &Tensor) -> Result<Tensor> {
        match self {
            Self::Bilinear { mat } => {
                let proj = knowledge.matmul(mat)?; // (n, num_units)
                (context * proj)?.sum(1).map_err(Into::into)
            }
            Self::Mlp {
                fc1_w,
                fc1_b,
                fc2_w,
                fc2_b,
            } => {
                let x = Tensor::cat(&[context, knowledge], 1)?;
                let h = x.matmul(fc1_w)?.broadcast_add(fc1_b)?.relu()?;
                let s = h.matmul(fc2_w)?.broadcast_add(fc2_b)?; // (n, 1)
                s.squeeze(1).map_err(Into::into)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Transfer matching
// ---------------------------------------------------------------------------

pub struct TransferMatching {
    knowledge_transform: Linear,
    selector: KnowledgeSelector,
    num_units: usize,
    dim_emb: usize,
}

impl TransferMatching {
    pub fn new(
        selector: KnowledgeSelector,
        num_units: usize,
        dim_emb: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            knowledge_transform: linear(3 * dim_emb, dim_emb, vb.pp("knowledge_transform"))?,
            selector,
            num_units,
            dim_emb,
        })
    }

    pub fn mode(&self) -> SelectMode {
        self.selector.mode()
    }

    pub fn output_dim(&self) -> usize {
        self.dim_emb
    }

    /// Raw relevance scores (batch, n_triples) and the transformed knowledge
    /// (batch, n_triples, dim_emb).
    pub fn scores(&self, context_repr: &Tensor, knowledge_repr: &Tensor) -> Result<(Tensor, Tensor)> {
        let (b, n, _) = knowledge_repr.dims3()?;
        let context = context_repr.mean(1)?; // (b, num_units)
        let context_tile = context
            .unsqueeze(1)?
            .broadcast_as((b, n, self.num_units))?
            .contiguous()?
            .reshape((b * n, self.num_units))?;
        let knowledge = self.knowledge_transform.forward(knowledge_repr)?; // (b, n, e)
        let flat = knowledge.reshape((b * n, self.dim_emb))?;
        let scores = self.selector.score(&context_tile, &flat)?.reshape((b, n))?;
        Ok((scores, knowledge))
    }

    /// Knowledge context (batch, dim_emb): triples weighted by their raw scores.
    pub fn forward(&self, context_repr: &Tensor, knowledge_repr: &Tensor) -> Result<Tensor> {
        let (scores, knowledge) = self.scores(context_repr, knowledge_repr)?;
        scores
            .unsqueeze(1)?
            .matmul(&knowledge)?
            .squeeze(1)
            .map_err(Into::into)
    }
}
