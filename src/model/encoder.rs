// src/model/encoder.rs
use tch::{nn, nn::Module, Device, Tensor};

use crate::device::ParamStores;
use crate::error::ModelError;
use crate::hparams::{HParams, NetworkType};
use crate::rnn::{reshape_state, CellConfig, RecurrentNetwork, RnnState};

/// Encoding of one prior turn.
#[derive(Debug)]
pub struct EncoderResult {
    /// Time-major `[time, batch, output_size]`, zero past each length.
    pub outputs: Tensor,
    /// `[batch, output_size]` top-layer final state.
    pub summary: Tensor,
}

/// One encoder whose weights are shared by every turn of the dialogue.
pub struct TurnEncoder {
    network: RecurrentNetwork,
}

impl TurnEncoder {
    pub fn new(stores: &ParamStores, scope: &str, hparams: &HParams, devices: &[Device]) -> Result<Self, ModelError> {
        let kind = hparams.encoder()?;
        let config = CellConfig {
            cell_type: hparams.cell()?,
            input_size: hparams.embedding_dim() as i64,
            hidden_units: hparams.hidden_units as i64,
            num_layers: hparams.num_layers,
            residual: hparams.residual,
            input_keep_prob: 1.0 - hparams.encoder_dropout_rate,
        };
        tracing::info!("# build {} encoder: {} layers of {:?}", kind, config.num_layers, config.cell_type);
        Ok(Self { network: RecurrentNetwork::new(stores, scope, kind, &config, devices) })
    }

    /// Width of a turn summary: `H` for uni, `2H` for bi.
    pub fn summary_size(&self) -> i64 {
        self.network.output_size()
    }

    /// Encodes one `[batch, time]` turn.
    pub fn encode_turn(
        &self,
        embedding: &nn::Embedding,
        source: &Tensor,
        lengths: &Tensor,
        train: bool,
    ) -> Result<(EncoderResult, RnnState), ModelError> {
        let device = embedding.ws.device();
        let embedded = embedding.forward(&source.to_device(device)).transpose(0, 1); // [T,B,E]
        let (outputs, state) = self.network.run(&embedded, lengths, None, train)?;
        let summary = RecurrentNetwork::summary(&state);
        Ok((EncoderResult { outputs, summary }, state))
    }

    /// Encodes every prior turn in order.
    ///
    /// Returns the per-turn results and the final state of turn 0 reshaped for a
    /// `context_type` network.
    pub fn encode(
        &self,
        embedding: &nn::Embedding,
        sources: &[Tensor],
        lengths: &[Tensor],
        context_type: NetworkType,
        train: bool,
    ) -> Result<(Vec<EncoderResult>, RnnState), ModelError> {
        if sources.is_empty() || sources.len() != lengths.len() {
            return Err(ModelError::shape(format!(
                "{} source turns with {} length vectors",
                sources.len(),
                lengths.len()
            )));
        }

        let mut results = Vec::with_capacity(sources.len());
        let mut first_state = None;
        for (source, len) in sources.iter().zip(lengths) {
            let (result, state) = self.encode_turn(embedding, source, len, train)?;
            if first_state.is_none() {
                first_state = Some(state);
            }
            results.push(result);
        }

        let initial = first_state.map(|s| reshape_state(s, context_type));
        let initial = initial.ok_or_else(|| ModelError::shape("no source turns"))?;
        Ok((results, initial))
    }
}
