use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use tracing::debug;

// ---------------------------------------------------------------------------
// Training Config
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct TrainingConfig {
    pub lr: f64,
    pub max_grad_norm: f64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            lr: 1e-4,
            max_grad_norm: 5.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Gradient clipping
// ---------------------------------------------------------------------------

/// Global L2 norm over the gradients of `vars`.
pub fn global_norm(vars: &[Var], grads: &GradStore) -> Result<f64> {
    let mut sq = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            sq += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    Ok(sq.sqrt())
}

/// Scale all gradients by `max_norm / max(global_norm, max_norm)`.
/// Returns the norm measured before clipping.
pub fn clip_grad_norm(vars: &[Var], grads: &mut GradStore, max_norm: f64) -> Result<f64> {
    let norm = global_norm(vars, grads)?;
    if norm > max_norm {
        let scale = max_norm / norm;
        for var in vars {
            if let Some(g) = grads.remove(var.as_tensor()) {
                grads.insert(var.as_tensor(), (g * scale)?);
            }
        }
    }
    Ok(norm)
}

// ---------------------------------------------------------------------------
// Trainer
// ---------------------------------------------------------------------------

/// Adam with a fixed learning rate and global-norm clipping over a parameter
/// set fixed at construction.
pub struct Trainer {
    optimizer: AdamW,
    vars: Vec<Var>,
    config: TrainingConfig,
    step_count: usize,
}

impl Trainer {
    pub fn new(vars: Vec<Var>, config: TrainingConfig) -> Result<Self> {
        // AdamW without decay is plain Adam.
        let params = ParamsAdamW {
            lr: config.lr,
            weight_decay: 0.0,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        };
        let optimizer = AdamW::new(vars.clone(), params)?;
        Ok(Self {
            optimizer,
            vars,
            config,
            step_count: 0,
        })
    }

    /// Backward, clip, update. Returns the new step count.
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<usize> {
        let mut grads = loss.backward()?;
        let norm = clip_grad_norm(&self.vars, &mut grads, self.config.max_grad_norm)?;
        self.optimizer.step(&grads)?;
        self.step_count += 1;
        debug!(step = self.step_count, grad_norm = norm, "optimizer step");
        Ok(self.step_count)
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }

    pub fn num_vars(&self) -> usize {
        self.vars.len()
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
