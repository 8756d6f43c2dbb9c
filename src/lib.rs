#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(unused_variables)]

pub mod attention;
pub mod batch;
pub mod config;
pub mod decoder;
pub mod embedding;
pub mod encoder;
pub mod error;
pub mod loss;
pub mod model;
pub mod rnn;
pub mod selector;
pub mod synthetic;
pub mod training;
pub mod vocab;

pub use batch::{Batch, Example};
pub use config::{CellClass, ModelConfig};
pub use error::ModelError;
pub use model::{BatchLoss, Decoded, ParamInfo, TransDgModel};
pub use selector::{SelectMode, SelectorParams};
