// src/rnn/network.rs
use tch::{Device, Tensor};

use crate::device::ParamStores;
use crate::error::ModelError;
use crate::hparams::NetworkType;
use crate::rnn::cell::{create_cell, CellConfig, StackedCell};
use crate::rnn::dynamic::{bidirectional_dynamic_rnn, dynamic_rnn, top_output};
use crate::rnn::state::{reshape_state, LayerState, RnnState};

/// A uni- or bidirectional stack, the building block of the encoder and the
/// context network.
pub enum RecurrentNetwork {
    Uni(StackedCell),
    /// Each direction holds half of the configured layers.
    Bi { fw: StackedCell, bw: StackedCell },
}

impl RecurrentNetwork {
    pub fn new(stores: &ParamStores, scope: &str, kind: NetworkType, config: &CellConfig, devices: &[Device]) -> Self {
        match kind {
            NetworkType::Uni => RecurrentNetwork::Uni(create_cell(stores, scope, config, devices)),
            NetworkType::Bi => {
                let half = CellConfig { num_layers: config.num_layers / 2, ..*config };
                RecurrentNetwork::Bi {
                    fw: create_cell(stores, &format!("{}/fw", scope), &half, devices),
                    bw: create_cell(stores, &format!("{}/bw", scope), &half, &backward_devices(devices)),
                }
            }
        }
    }

    pub fn kind(&self) -> NetworkType {
        match self {
            RecurrentNetwork::Uni(_) => NetworkType::Uni,
            RecurrentNetwork::Bi { .. } => NetworkType::Bi,
        }
    }

    /// Width of the per-step outputs and of [`RecurrentNetwork::summary`].
    pub fn output_size(&self) -> i64 {
        match self {
            RecurrentNetwork::Uni(cell) => cell.output_size(),
            RecurrentNetwork::Bi { fw, bw } => fw.output_size() + bw.output_size(),
        }
    }

    /// Runs over time-major `inputs`. A provided initial state is first
    /// reshaped into this network's layout.
    pub fn run(
        &self,
        inputs: &Tensor,
        lengths: &Tensor,
        initial: Option<RnnState>,
        train: bool,
    ) -> Result<(Tensor, RnnState), ModelError> {
        let initial = initial.map(|s| reshape_state(s, self.kind()));
        match (self, initial) {
            (RecurrentNetwork::Uni(cell), None) => {
                let (out, state) = dynamic_rnn(cell, inputs, lengths, None, train);
                Ok((out, RnnState::Uni(state)))
            }
            (RecurrentNetwork::Uni(cell), Some(RnnState::Uni(stack))) => {
                check_depth(cell, &stack)?;
                let (out, state) = dynamic_rnn(cell, inputs, lengths, Some(stack), train);
                Ok((out, RnnState::Uni(state)))
            }
            (RecurrentNetwork::Bi { fw, bw }, None) => {
                let (out, (f, b)) = bidirectional_dynamic_rnn(fw, bw, inputs, lengths, None, None, train);
                Ok((out, RnnState::Bi { fw: f, bw: b }))
            }
            (RecurrentNetwork::Bi { fw, bw }, Some(RnnState::Bi { fw: init_fw, bw: init_bw })) => {
                check_depth(fw, &init_fw)?;
                check_depth(bw, &init_bw)?;
                let (out, (f, b)) =
                    bidirectional_dynamic_rnn(fw, bw, inputs, lengths, Some(init_fw), Some(init_bw), train);
                Ok((out, RnnState::Bi { fw: f, bw: b }))
            }
            (_, Some(state)) => Err(ModelError::shape(format!(
                "a {} state cannot seed a {} network",
                state.kind(),
                self.kind()
            ))),
        }
    }

    /// Top-layer output of a final state; forward and backward are concatenated.
    pub fn summary(state: &RnnState) -> Tensor {
        match state {
            RnnState::Uni(stack) => top_output(stack),
            RnnState::Bi { fw, bw } => {
                let f = top_output(fw);
                let b = top_output(bw).to_device(f.device());
                Tensor::cat(&[f, b], -1)
            }
        }
    }
}

/// Distinct devices of `devices`, rotated so the backward stack starts on the
/// last one instead of sharing the forward stack's first device.
fn backward_devices(devices: &[Device]) -> Vec<Device> {
    let mut distinct: Vec<Device> = Vec::with_capacity(devices.len());
    for device in devices {
        if !distinct.contains(device) {
            distinct.push(*device);
        }
    }
    if let Some(last) = distinct.pop() {
        distinct.insert(0, last);
    }
    distinct
}

fn check_depth(cell: &StackedCell, stack: &[LayerState]) -> Result<(), ModelError> {
    if stack.len() != cell.num_layers() {
        return Err(ModelError::shape(format!(
            "initial state has {} layers, network has {}",
            stack.len(),
            cell.num_layers()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hparams::CellType;
    use tch::Kind;

    fn config(input_size: i64) -> CellConfig {
        CellConfig {
            cell_type: CellType::Gru,
            input_size,
            hidden_units: 5,
            num_layers: 4,
            residual: false,
            input_keep_prob: 1.0,
        }
    }

    #[test]
    fn test_backward_stack_starts_on_last_device() {
        let gpus = [Device::Cuda(0), Device::Cuda(1), Device::Cuda(2), Device::Cuda(0)];
        assert_eq!(backward_devices(&gpus), vec![Device::Cuda(2), Device::Cuda(0), Device::Cuda(1)]);
        assert_eq!(backward_devices(&[Device::Cpu, Device::Cpu]), vec![Device::Cpu]);
        assert!(backward_devices(&[]).is_empty());
    }

    #[test]
    fn test_bi_network_halves_layers() {
        let stores = ParamStores::cpu();
        let net = RecurrentNetwork::new(&stores, "enc", NetworkType::Bi, &config(3), &[Device::Cpu]);
        assert_eq!(net.output_size(), 10);
        let inputs = Tensor::randn(&[4, 2, 3], (Kind::Float, Device::Cpu));
        let lengths = Tensor::from_slice(&[4i64, 2]);
        let (out, state) = net.run(&inputs, &lengths, None, false).unwrap();
        assert_eq!(out.size(), vec![4, 2, 10]);
        assert_eq!(state.depth(), 4);
        assert_eq!(RecurrentNetwork::summary(&state).size(), vec![2, 10]);
    }

    #[test]
    fn test_uni_state_seeds_bi_network() {
        let stores = ParamStores::cpu();
        let uni = RecurrentNetwork::new(&stores, "a", NetworkType::Uni, &config(3), &[Device::Cpu]);
        let bi = RecurrentNetwork::new(&stores, "b", NetworkType::Bi, &config(3), &[Device::Cpu]);
        let inputs = Tensor::randn(&[2, 3, 3], (Kind::Float, Device::Cpu));
        let lengths = Tensor::from_slice(&[2i64, 2, 1]);
        let (_, state) = uni.run(&inputs, &lengths, None, false).unwrap();
        let (_, state) = bi.run(&inputs, &lengths, Some(state), false).unwrap();
        assert_eq!(state.kind(), NetworkType::Bi);
        assert_eq!(state.into_uni().len(), 4);
    }

    #[test]
    fn test_wrong_depth_is_rejected() {
        let stores = ParamStores::cpu();
        let net = RecurrentNetwork::new(&stores, "a", NetworkType::Uni, &config(3), &[Device::Cpu]);
        let inputs = Tensor::randn(&[2, 1, 3], (Kind::Float, Device::Cpu));
        let lengths = Tensor::from_slice(&[2i64]);
        let shallow = RnnState::Uni(vec![LayerState::zeros(CellType::Gru, 1, 5, Device::Cpu)]);
        assert!(matches!(net.run(&inputs, &lengths, Some(shallow), false), Err(ModelError::ShapeMismatch(_))));
    }
}
