use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ModelError;

// ---------------------------------------------------------------------------
// Cell class
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellClass {
    Gru,
    Lstm,
    /// Plain tanh recurrence.
    Vanilla,
}

impl CellClass {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GRU" => Some(Self::Gru),
            "LSTM" => Some(Self::Lstm),
            "RNN" | "VANILLA" => Some(Self::Vanilla),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Model Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Append projected external representations to the encoder output.
    pub use_trans_repr: bool,
    /// Blend selected knowledge triples into decoder attention.
    pub use_trans_select: bool,
    pub vocab_size: usize,
    pub dim_emb: usize,
    /// Width of the external representation vectors.
    pub dim_trans: usize,
    pub cell_class: CellClass,
    pub num_units: usize,
    pub num_layers: usize,
    /// Greedy decoding step cap.
    pub max_length: usize,
    pub lr_rate: f64,
    pub max_grad_norm: f64,
    /// Accepted for compatibility; not applied to any layer.
    pub drop_rate: f64,
    /// Accepted for compatibility; decoding is greedy.
    pub beam_size: usize,
    /// Put the selector weights into the trainable set.
    #[serde(default)]
    pub train_select_layer: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            use_trans_repr: true,
            use_trans_select: true,
            vocab_size: 30000,
            dim_emb: 300,
            dim_trans: 100,
            cell_class: CellClass::Gru,
            num_units: 512,
            num_layers: 2,
            max_length: 60,
            lr_rate: 1e-4,
            max_grad_norm: 5.0,
            drop_rate: 0.2,
            beam_size: 1,
            train_select_layer: false,
        }
    }
}

impl ModelConfig {
    /// Small config for tests and CPU smoke runs.
    pub fn tiny() -> Self {
        Self {
            use_trans_repr: false,
            use_trans_select: true,
            vocab_size: 24,
            dim_emb: 8,
            dim_trans: 6,
            cell_class: CellClass::Gru,
            num_units: 16,
            num_layers: 2,
            max_length: 10,
            lr_rate: 1e-2,
            max_grad_norm: 5.0,
            drop_rate: 0.0,
            beam_size: 1,
            train_select_layer: false,
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        let widths = [
            ("vocab_size", self.vocab_size),
            ("dim_emb", self.dim_emb),
            ("num_units", self.num_units),
            ("num_layers", self.num_layers),
            ("max_length", self.max_length),
        ];
        for (name, v) in widths {
            if v == 0 {
                return Err(ModelError::InvalidConfig(format!("{name} must be > 0")));
            }
        }
        if self.use_trans_repr && self.dim_trans == 0 {
            return Err(ModelError::InvalidConfig(
                "dim_trans must be > 0 when use_trans_repr is set".into(),
            ));
        }
        // UNK/GO/EOS must fit in the table.
        if self.vocab_size <= crate::vocab::EOS_ID as usize {
            return Err(ModelError::InvalidConfig(
                "vocab_size must leave room for the reserved symbols".into(),
            ));
        }
        if !(self.lr_rate > 0.0) {
            return Err(ModelError::InvalidConfig("lr_rate must be > 0".into()));
        }
        if !(self.max_grad_norm > 0.0) {
            return Err(ModelError::InvalidConfig("max_grad_norm must be > 0".into()));
        }
        if !(0.0..1.0).contains(&self.drop_rate) {
            return Err(ModelError::InvalidConfig("drop_rate must be in [0, 1)".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        assert!(ModelConfig::default().validate().is_ok());
        assert!(ModelConfig::tiny().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut cfg = ModelConfig::tiny();
        cfg.num_units = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = ModelConfig::tiny();
        cfg.drop_rate = 1.0;
        assert!(cfg.validate().is_err());

        let mut cfg = ModelConfig::tiny();
        cfg.vocab_size = 3;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_cell_class_parse() {
        assert_eq!(CellClass::parse("GRU"), Some(CellClass::Gru));
        assert_eq!(CellClass::parse("lstm"), Some(CellClass::Lstm));
        assert_eq!(CellClass::parse("RNN"), Some(CellClass::Vanilla));
        assert_eq!(CellClass::parse("transformer"), None);
    }

    #[test]
    fn test_json_round_trip_defaults_train_select() -> Result<()> {
        let mut value = serde_json::to_value(ModelConfig::tiny())?;
        value
            .as_object_mut()
            .map(|o| o.remove("train_select_layer"));
        let cfg: ModelConfig = serde_json::from_value(value)?;
        assert!(!cfg.train_select_layer);
        assert_eq!(cfg.cell_class, CellClass::Gru);
        Ok(())
    }
}
