// src/model/context.rs
use tch::{Device, Kind, Tensor};

use crate::device::ParamStores;
use crate::error::ModelError;
use crate::hparams::HParams;
use crate::rnn::{CellConfig, LayerState, RecurrentNetwork, RnnState};

/// Runs over the sequence of turn summaries and hands its final state to the
/// decoder, always as a `num_layers`-deep stack.
pub struct ContextAggregator {
    network: RecurrentNetwork,
}

impl ContextAggregator {
    pub fn new(
        stores: &ParamStores,
        scope: &str,
        hparams: &HParams,
        summary_size: i64,
        devices: &[Device],
    ) -> Result<Self, ModelError> {
        let kind = hparams.context()?;
        let config = CellConfig {
            cell_type: hparams.cell()?,
            input_size: summary_size,
            hidden_units: hparams.hidden_units as i64,
            num_layers: hparams.num_layers,
            residual: hparams.residual,
            input_keep_prob: 1.0 - hparams.context_dropout_rate,
        };
        tracing::info!("# build {} context network over {}-wide summaries", kind, summary_size);
        Ok(Self { network: RecurrentNetwork::new(stores, scope, kind, &config, devices) })
    }

    pub fn forward(&self, summaries: &[Tensor], initial: RnnState, train: bool) -> Result<Vec<LayerState>, ModelError> {
        let first = summaries.first().ok_or_else(|| ModelError::shape("context needs at least one turn"))?;
        let batch = first.size()[0];
        let device = first.device();
        if let Some(bad) = summaries.iter().find(|s| s.size() != first.size()) {
            return Err(ModelError::shape(format!("turn summaries {:?} and {:?} differ", first.size(), bad.size())));
        }

        let inputs: Vec<Tensor> = summaries.iter().map(|s| s.to_device(device)).collect();
        let inputs = Tensor::stack(&inputs, 0); // [turns,B,D]
        let lengths = Tensor::full(&[batch], summaries.len() as i64, (Kind::Int64, device));

        let (_, state) = self.network.run(&inputs, &lengths, Some(initial), train)?;
        Ok(state.into_uni())
    }
}
