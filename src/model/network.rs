// src/model/network.rs
use std::path::Path;

use anyhow::{Context, Result};
use tch::{nn, Tensor};

use crate::device::{DeviceManager, ParamStores, RoundRobin};
use crate::error::ModelError;
use crate::hparams::{HParams, NetworkType};
use crate::iterator::BatchedInput;
use crate::model::beam::{beam_search, BeamSearchOutput};
use crate::model::context::ContextAggregator;
use crate::model::decoder::{Decoder, GreedyOutput};
use crate::model::encoder::TurnEncoder;
use crate::model::loss::masked_cross_entropy;
use crate::rnn::LayerState;

/// Every parameterised component of the hierarchical model.
///
/// Built once and shared (`Rc`) by the train, eval and infer instances so they
/// all read the same weights.
pub struct HredNetwork {
    hparams: HParams,
    context_type: NetworkType,
    embedding: nn::Embedding,
    encoder: TurnEncoder,
    context: ContextAggregator,
    decoder: Decoder,
}

fn load_pretrained(path: &Path) -> Result<Tensor> {
    let tensor = match path.extension().and_then(|e| e.to_str()) {
        Some("npy") => Tensor::read_npy(path),
        _ => Tensor::load(path),
    };
    tensor.with_context(|| format!("Cannot load pretrained embeddings '{}'", path.display()))
}

impl HredNetwork {
    pub fn new(stores: &ParamStores, devices: &DeviceManager, hparams: &HParams) -> Result<Self> {
        hparams.validate()?;
        if let Some(seed) = hparams.random_seed {
            tch::manual_seed(seed);
        }

        let vocab_size = hparams.vocab_size as i64;
        let embedding_dim = hparams.embedding_dim() as i64;
        let mut placement = RoundRobin::new(devices);

        let embedding = nn::embedding(
            stores.scoped(devices.head(), "hred_graph/embeddings") / "embedding",
            vocab_size,
            embedding_dim,
            Default::default(),
        );
        if let Some(path) = &hparams.vocab_h5 {
            let pretrained = load_pretrained(path)?;
            if pretrained.size() != [vocab_size, embedding_dim] {
                return Err(ModelError::config(format!(
                    "pretrained embeddings are {:?}, expected [{}, {}]",
                    pretrained.size(),
                    vocab_size,
                    embedding_dim
                ))
                .into());
            }
            let mut ws = embedding.ws.shallow_clone();
            tch::no_grad(|| ws.copy_(&pretrained.to_device(ws.device())));
            tracing::info!("  loaded pretrained embeddings from {}", path.display());
        }

        let n = hparams.num_layers;
        let encoder = TurnEncoder::new(stores, "hred_graph/encoder", hparams, &placement.assign(n, Some(0)))?;
        let context = ContextAggregator::new(
            stores,
            "hred_graph/context",
            hparams,
            encoder.summary_size(),
            &placement.assign(n, None),
        )?;
        let decoder = Decoder::new(stores, "hred_graph/decoder", hparams, &placement.assign(n, None), devices.tail())?;

        tracing::info!("# Trainable variables");
        for (name, shape, device) in stores.describe() {
            tracing::info!("  {}, {:?}, {:?}", name, shape, device);
        }
        tracing::info!("  total parameters: {}", stores.num_parameters());

        Ok(Self { hparams: hparams.clone(), context_type: hparams.context()?, embedding, encoder, context, decoder })
    }

    pub fn hparams(&self) -> &HParams {
        &self.hparams
    }

    /// Prior turns a batch must carry.
    pub fn num_source_turns(&self) -> usize {
        self.hparams.num_turns.saturating_sub(1)
    }

    /// Encodes all prior turns and aggregates them into the decoder's initial state.
    pub fn context_state(&self, batch: &BatchedInput, train: bool) -> Result<Vec<LayerState>, ModelError> {
        let (results, initial) = self.encoder.encode(
            &self.embedding,
            &batch.sources,
            &batch.source_sequence_lengths,
            self.context_type,
            train,
        )?;
        let summaries: Vec<Tensor> = results.iter().map(|r| r.summary.shallow_clone()).collect();
        self.context.forward(&summaries, initial, train)
    }

    /// Teacher-forced logits `[batch, time, vocab]`.
    pub fn logits(&self, batch: &BatchedInput, sampling_probability: f64, train: bool) -> Result<Tensor, ModelError> {
        let (target_input, lengths) = match (&batch.target_input, &batch.target_sequence_length) {
            (Some(input), Some(lengths)) => (input, lengths),
            _ => return Err(ModelError::shape("batch carries no target utterance")),
        };
        let state = self.context_state(batch, train)?;
        Ok(self.decoder.train_forward(&self.embedding, target_input, lengths, state, sampling_probability, train))
    }

    /// Batch-normalised masked cross-entropy.
    pub fn loss(&self, batch: &BatchedInput, sampling_probability: f64, train: bool) -> Result<Tensor, ModelError> {
        let logits = self.logits(batch, sampling_probability, train)?;
        match (&batch.target_output, &batch.target_sequence_length) {
            (Some(output), Some(lengths)) => masked_cross_entropy(&logits, output, lengths),
            _ => Err(ModelError::shape("batch carries no target utterance")),
        }
    }

    pub fn greedy(&self, batch: &BatchedInput, max_iterations: i64) -> Result<GreedyOutput, ModelError> {
        let state = self.context_state(batch, false)?;
        Ok(self.decoder.greedy(&self.embedding, state, batch.batch_size(), max_iterations))
    }

    pub fn beam(&self, batch: &BatchedInput, max_iterations: i64) -> Result<BeamSearchOutput> {
        let state = self.context_state(batch, false)?;
        beam_search(
            &self.decoder,
            &self.embedding,
            state,
            batch.batch_size(),
            self.hparams.beam_width,
            max_iterations,
            self.hparams.length_penalty_weight,
        )
    }
}
