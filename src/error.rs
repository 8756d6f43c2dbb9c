use thiserror::Error;

/// Contract violations detected by the model itself.
/// Everything else (tensor shape errors inside candle) propagates as `anyhow::Error`.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("vocabulary not set: call set_vocabs before processing batches")]
    VocabularyNotSet,

    #[error("vocabulary has {got} words, model expects {expected}")]
    VocabularySize { expected: usize, got: usize },

    #[error("selector parameter '{0}' missing from parameter mapping")]
    MissingSelectorParam(&'static str),

    #[error("external representations enabled but none supplied")]
    MissingTransReprs,

    #[error("shape mismatch for {what}: expected {expected:?}, got {got:?}")]
    Shape {
        what: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl ModelError {
    pub fn shape(what: &'static str, expected: &[usize], got: &[usize]) -> Self {
        Self::Shape {
            what,
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }
}
