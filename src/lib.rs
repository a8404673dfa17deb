// src/lib.rs
//! Hierarchical recurrent encoder-decoder for multi-turn response generation.
//!
//! Every prior turn is encoded by one shared encoder, a context network runs
//! over the per-turn summaries, and its final state seeds the decoder that
//! produces the response.

pub mod checkpoint;
pub mod data_loader;
pub mod device;
pub mod error;
pub mod hparams;
pub mod iterator;
pub mod metrics;
pub mod model;
pub mod rnn;
pub mod training;
pub mod vocab;

pub use error::ModelError;
pub use hparams::HParams;
pub use iterator::BatchedInput;
pub use model::{HredModel, HredNetwork, Mode};
