// Stacked recurrent network: GRU / LSTM from candle_nn::rnn, plus a plain tanh cell.
// Length-aware: once an example runs past its length its state is frozen and
// its outputs are zero.

use anyhow::Result;
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::rnn::{gru, lstm, GRUConfig, GRUState, LSTMConfig, LSTMState, GRU, LSTM};
use candle_nn::{linear, Linear, VarBuilder, RNN};

use crate::config::CellClass;
use crate::loss::sequence_mask;

// ---------------------------------------------------------------------------
// Cell state
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub enum CellState {
    Gru(GRUState),
    Lstm(LSTMState),
    Vanilla(Tensor),
}

impl CellState {
    /// Hidden output of the cell.
    pub fn h(&self) -> &Tensor {
        match self {
            Self::Gru(s) => &s.h,
            Self::Lstm(s) => &s.h,
            Self::Vanilla(h) => h,
        }
    }

    /// `prev + mask * (self - prev)`, mask is (batch, 1) of 0/1.
    fn select(&self, prev: &CellState, mask: &Tensor) -> Result<CellState> {
        let mix = |new: &Tensor, old: &Tensor| -> Result<Tensor> {
            Ok(old.add(&(new - old)?.broadcast_mul(mask)?)?)
        };
        Ok(match (self, prev) {
            (Self::Gru(n), Self::Gru(o)) => Self::Gru(GRUState { h: mix(&n.h, &o.h)? }),
            (Self::Lstm(n), Self::Lstm(o)) => Self::Lstm(LSTMState {
                h: mix(&n.h, &o.h)?,
                c: mix(&n.c, &o.c)?,
            }),
            (Self::Vanilla(n), Self::Vanilla(o)) => Self::Vanilla(mix(n, o)?),
            _ => anyhow::bail!("cell state kinds differ between steps"),
        })
    }
}

/// One `CellState` per layer, bottom first.
pub type RnnState = Vec<CellState>;

// ---------------------------------------------------------------------------
// Vanilla cell
// ---------------------------------------------------------------------------

struct VanillaCell {
    proj: Linear,
    hidden: usize,
    device: Device,
}

impl VanillaCell {
    fn new(in_dim: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            proj: linear(in_dim + hidden, hidden, vb.pp("proj"))?,
            hidden,
            device: vb.device().clone(),
        })
    }

    fn step(&self, x: &Tensor, h: &Tensor) -> Result<Tensor> {
        let xh = Tensor::cat(&[x, h], 1)?;
        self.proj.forward(&xh)?.tanh().map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// Cell
// ---------------------------------------------------------------------------

enum Cell {
    Gru(GRU),
    Lstm(LSTM),
    Vanilla(VanillaCell),
}

impl Cell {
    fn new(class: CellClass, in_dim: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        Ok(match class {
            CellClass::Gru => Self::Gru(gru(in_dim, hidden, GRUConfig::default(), vb)?),
            CellClass::Lstm => Self::Lstm(lstm(in_dim, hidden, LSTMConfig::default(), vb)?),
            CellClass::Vanilla => Self::Vanilla(VanillaCell::new(in_dim, hidden, vb)?),
        })
    }

    fn zero_state(&self, batch: usize) -> Result<CellState> {
        Ok(match self {
            Self::Gru(c) => CellState::Gru(c.zero_state(batch)?),
            Self::Lstm(c) => CellState::Lstm(c.zero_state(batch)?),
            Self::Vanilla(c) => CellState::Vanilla(Tensor::zeros(
                (batch, c.hidden),
                DType::F32,
                &c.device,
            )?),
        })
    }

    fn step(&self, x: &Tensor, state: &CellState) -> Result<CellState> {
        Ok(match (self, state) {
            (Self::Gru(c), CellState::Gru(s)) => CellState::Gru(c.step(x, s)?),
            (Self::Lstm(c), CellState::Lstm(s)) => CellState::Lstm(c.step(x, s)?),
            (Self::Vanilla(c), CellState::Vanilla(h)) => CellState::Vanilla(c.step(x, h)?),
            _ => anyhow::bail!("state does not match cell type"),
        })
    }
}

// ---------------------------------------------------------------------------
// StackedRnn
// ---------------------------------------------------------------------------

pub struct StackedRnn {
    cells: Vec<Cell>,
    hidden: usize,
}

impl StackedRnn {
    /// Layer `i` lives under `vb.pp("cell_{i}")`.
    pub fn new(
        class: CellClass,
        input_dim: usize,
        hidden: usize,
        num_layers: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut cells = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            let in_dim = if i == 0 { input_dim } else { hidden };
            cells.push(Cell::new(class, in_dim, hidden, vb.pp(format!("cell_{i}")))?);
        }
        Ok(Self { cells, hidden })
    }

    pub fn hidden(&self) -> usize {
        self.hidden
    }

    pub fn num_layers(&self) -> usize {
        self.cells.len()
    }

    pub fn zero_state(&self, batch: usize) -> Result<RnnState> {
        self.cells.iter().map(|c| c.zero_state(batch)).collect()
    }

    /// One step through every layer. Returns the top layer's output and the new state.
    pub fn step(&self, input: &Tensor, state: &RnnState) -> Result<(Tensor, RnnState)> {
        if state.len() != self.cells.len() {
            anyhow::bail!(
                "state has {} layers, network has {}",
                state.len(),
                self.cells.len()
            );
        }
        let mut x = input.clone();
        let mut next = Vec::with_capacity(self.cells.len());
        for (cell, s) in self.cells.iter().zip(state) {
            let ns = cell.step(&x, s)?;
            x = ns.h().clone();
            next.push(ns);
        }
        Ok((x, next))
    }

    /// Run over (batch, time, dim) honoring per-example lengths.
    /// Returns outputs (batch, time, hidden), zero past each length, and the
    /// state at each example's last valid step.
    pub fn run(&self, inputs: &Tensor, lengths: &[usize]) -> Result<(Tensor, RnnState)> {
        let (b, t, _) = inputs.dims3()?;
        let device = inputs.device();
        let mut state = self.zero_state(b)?;
        if t == 0 {
            let empty = Tensor::zeros((b, 0, self.hidden), DType::F32, device)?;
            return Ok((empty, state));
        }

        let mask = sequence_mask(lengths, t, device)?; // (b, t)
        let mut outputs = Vec::with_capacity(t);
        for step in 0..t {
            let x = inputs.i((.., step, ..))?.contiguous()?;
            let m = mask.i((.., step))?.unsqueeze(1)?; // (b, 1)
            let (h, proposed) = self.step(&x, &state)?;
            state = proposed
                .iter()
                .zip(&state)
                .map(|(n, o)| n.select(o, &m))
                .collect::<Result<Vec<_>>>()?;
            outputs.push(h.broadcast_mul(&m)?);
        }
        Tensor::stack(&outputs, 1)
            .map(|o| (o, state))
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn build(class: CellClass, varmap: &VarMap, device: &Device) -> Result<StackedRnn> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
        StackedRnn::new(class, 4, 6, 2, vb.pp("rnn"))
    }

    #[test]
    fn test_run_shapes_all_cells() -> Result<()> {
        let device = Device::Cpu;
        for class in [CellClass::Gru, CellClass::Lstm, CellClass::Vanilla] {
            let varmap = VarMap::new();
            let rnn = build(class, &varmap, &device)?;
            let x = Tensor::randn(0f32, 1.0, (3, 5, 4), &device)?;
            let (out, state) = rnn.run(&x, &[5, 3, 1])?;
            assert_eq!(out.dims(), &[3, 5, 6]);
            assert_eq!(state.len(), 2);
            assert_eq!(state[1].h().dims(), &[3, 6]);
        }
        Ok(())
    }

    #[test]
    fn test_padding_does_not_touch_final_state() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let rnn = build(CellClass::Lstm, &varmap, &device)?;

        let prefix = Tensor::randn(0f32, 1.0, (1, 2, 4), &device)?;
        let pad_a = Tensor::zeros((1, 3, 4), DType::F32, &device)?;
        let pad_b = Tensor::randn(0f32, 5.0, (1, 3, 4), &device)?;
        let xa = Tensor::cat(&[&prefix, &pad_a], 1)?;
        let xb = Tensor::cat(&[&prefix, &pad_b], 1)?;

        let (out_a, sa) = rnn.run(&xa, &[2])?;
        let (out_b, sb) = rnn.run(&xb, &[2])?;

        for (a, b) in sa.iter().zip(&sb) {
            let diff = (a.h() - b.h())?.abs()?.max_all()?.to_scalar::<f32>()?;
            assert!(diff < 1e-6, "final state leaked padding: {diff}");
        }
        let tail = out_b.narrow(1, 2, 3)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert_eq!(tail, 0.0, "outputs past length must be zero");
        let head = (out_a.narrow(1, 0, 2)? - out_b.narrow(1, 0, 2)?)?
            .abs()?
            .max_all()?
            .to_scalar::<f32>()?;
        assert!(head < 1e-6);
        Ok(())
    }

    #[test]
    fn test_final_state_matches_last_valid_output() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let rnn = build(CellClass::Gru, &varmap, &device)?;
        let x = Tensor::randn(0f32, 1.0, (2, 4, 4), &device)?;
        let (out, state) = rnn.run(&x, &[4, 2])?;
        let last0 = out.i((0, 3))?;
        let last1 = out.i((1, 1))?;
        let top = state[1].h();
        let d0 = (top.i(0)? - last0)?.abs()?.max_all()?.to_scalar::<f32>()?;
        let d1 = (top.i(1)? - last1)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(d0 < 1e-6 && d1 < 1e-6);
        Ok(())
    }
}
