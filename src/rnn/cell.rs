// src/rnn/cell.rs
use tch::{nn, nn::Module, Device, Tensor};

use crate::device::ParamStores;
use crate::hparams::CellType;
use crate::rnn::state::LayerState;

/// Shape and regularisation of one stacked cell.
#[derive(Debug, Clone, Copy)]
pub struct CellConfig {
    pub cell_type: CellType,
    pub input_size: i64,
    pub hidden_units: i64,
    pub num_layers: usize,
    pub residual: bool,
    /// Keep-probability of the input dropout, applied on training passes only.
    pub input_keep_prob: f64,
}

enum Kernel {
    Rnn {
        kernel: nn::Linear,
    },
    Gru {
        gates: nn::Linear,
        candidate: nn::Linear,
    },
    Lstm {
        kernel: nn::Linear,
    },
    LayerNormLstm {
        kernel: nn::Linear,
        gate_norms: Vec<nn::LayerNorm>,
        cell_norm: nn::LayerNorm,
    },
}

const FORGET_BIAS: f64 = 1.0;

/// A single recurrent layer pinned to one device.
pub struct LayerCell {
    kernel: Kernel,
    cell_type: CellType,
    hidden_units: i64,
    residual: bool,
    input_keep_prob: f64,
    device: Device,
}

impl LayerCell {
    fn new(vs: &nn::Path, cell_type: CellType, input_size: i64, hidden_units: i64) -> Kernel {
        let fan_in = input_size + hidden_units;
        match cell_type {
            CellType::Rnn => Kernel::Rnn {
                kernel: nn::linear(vs / "kernel", fan_in, hidden_units, Default::default()),
            },
            CellType::Gru => Kernel::Gru {
                gates: nn::linear(vs / "gates", fan_in, 2 * hidden_units, Default::default()),
                candidate: nn::linear(vs / "candidate", fan_in, hidden_units, Default::default()),
            },
            CellType::Lstm => Kernel::Lstm {
                kernel: nn::linear(vs / "kernel", fan_in, 4 * hidden_units, Default::default()),
            },
            CellType::LayerNormLstm => Kernel::LayerNormLstm {
                kernel: nn::linear(vs / "kernel", fan_in, 4 * hidden_units, Default::default()),
                gate_norms: (0..4)
                    .map(|i| nn::layer_norm(vs / format!("gate_norm_{}", i), vec![hidden_units], Default::default()))
                    .collect(),
                cell_norm: nn::layer_norm(vs / "cell_norm", vec![hidden_units], Default::default()),
            },
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn zero_state(&self, batch: i64) -> LayerState {
        LayerState::zeros(self.cell_type, batch, self.hidden_units, self.device)
    }

    /// One time step: `input` is `[batch, input_size]`.
    pub fn step(&self, input: &Tensor, state: &LayerState, train: bool) -> (Tensor, LayerState) {
        let input = input.to_device(self.device);
        let x = if train && self.input_keep_prob < 1.0 {
            input.dropout(1.0 - self.input_keep_prob, true)
        } else {
            input.shallow_clone()
        };
        let state = state.map(|t| t.to_device(self.device));

        let (output, next) = match (&self.kernel, &state) {
            (Kernel::Rnn { kernel }, LayerState::Hidden(h)) => {
                let h_new = kernel.forward(&Tensor::cat(&[&x, h], -1)).tanh();
                (h_new.shallow_clone(), LayerState::Hidden(h_new))
            }
            (Kernel::Gru { gates, candidate }, LayerState::Hidden(h)) => {
                let ru = gates.forward(&Tensor::cat(&[&x, h], -1)).sigmoid().chunk(2, -1);
                let (r, u) = (&ru[0], &ru[1]);
                let c = candidate.forward(&Tensor::cat(&[&x, &(r * h)], -1)).tanh();
                let h_new: Tensor = u * h + (1.0 - u) * c;
                (h_new.shallow_clone(), LayerState::Hidden(h_new))
            }
            (Kernel::Lstm { kernel }, LayerState::Lstm { c, h }) => {
                let gates = kernel.forward(&Tensor::cat(&[&x, h], -1)).chunk(4, -1);
                let (i, j, f, o) = (&gates[0], &gates[1], &gates[2], &gates[3]);
                let c_new = c * (f + FORGET_BIAS).sigmoid() + i.sigmoid() * j.tanh();
                let h_new = c_new.tanh() * o.sigmoid();
                (h_new.shallow_clone(), LayerState::Lstm { c: c_new, h: h_new })
            }
            (Kernel::LayerNormLstm { kernel, gate_norms, cell_norm }, LayerState::Lstm { c, h }) => {
                let gates: Vec<Tensor> = kernel
                    .forward(&Tensor::cat(&[&x, h], -1))
                    .chunk(4, -1)
                    .iter()
                    .zip(gate_norms)
                    .map(|(g, norm)| norm.forward(g))
                    .collect();
                let (i, j, f, o) = (&gates[0], &gates[1], &gates[2], &gates[3]);
                let c_new = cell_norm.forward(&(c * (f + FORGET_BIAS).sigmoid() + i.sigmoid() * j.tanh()));
                let h_new = c_new.tanh() * o.sigmoid();
                (h_new.shallow_clone(), LayerState::Lstm { c: c_new, h: h_new })
            }
            _ => unreachable!("state kind always matches the cell kind"),
        };

        let output = if self.residual { output + input } else { output };
        (output, next)
    }
}

/// `num_layers` recurrent layers applied bottom-up at every time step.
pub struct StackedCell {
    layers: Vec<LayerCell>,
    hidden_units: i64,
}

impl StackedCell {
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn output_size(&self) -> i64 {
        self.hidden_units
    }

    pub fn layers(&self) -> &[LayerCell] {
        &self.layers
    }

    pub fn zero_state(&self, batch: i64) -> Vec<LayerState> {
        self.layers.iter().map(|l| l.zero_state(batch)).collect()
    }

    pub fn step(&self, input: &Tensor, state: &[LayerState], train: bool) -> (Tensor, Vec<LayerState>) {
        debug_assert_eq!(state.len(), self.layers.len());
        let mut x = input.shallow_clone();
        let mut next = Vec::with_capacity(self.layers.len());
        for (layer, s) in self.layers.iter().zip(state) {
            let (out, new_state) = layer.step(&x, s, train);
            next.push(new_state);
            x = out;
        }
        (x, next)
    }
}

/// Builds a stacked cell under `scope`.
///
/// Layer `i` is created in the parameter store of `devices[i]` (wrapping). The
/// first layer is never residual since its input width may differ.
pub fn create_cell(stores: &ParamStores, scope: &str, config: &CellConfig, devices: &[Device]) -> StackedCell {
    let layers = (0..config.num_layers)
        .map(|i| {
            let requested = devices.get(i % devices.len().max(1)).copied().unwrap_or(Device::Cpu);
            let vs = stores.scoped(requested, scope).sub(format!("cell_{}", i));
            let input_size = if i == 0 { config.input_size } else { config.hidden_units };
            let kernel = LayerCell::new(&vs, config.cell_type, input_size, config.hidden_units);
            tracing::debug!("  {}/cell_{}: {:?} {} -> {} on {:?}", scope, i, config.cell_type, input_size, config.hidden_units, vs.device());
            LayerCell {
                kernel,
                cell_type: config.cell_type,
                hidden_units: config.hidden_units,
                residual: config.residual && i > 0,
                input_keep_prob: config.input_keep_prob,
                device: vs.device(),
            }
        })
        .collect();

    StackedCell { layers, hidden_units: config.hidden_units }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;

    fn config(cell_type: CellType, residual: bool) -> CellConfig {
        CellConfig {
            cell_type,
            input_size: 6,
            hidden_units: 4,
            num_layers: 3,
            residual,
            input_keep_prob: 1.0,
        }
    }

    #[test]
    fn test_every_cell_type_steps() {
        for cell_type in [CellType::Rnn, CellType::Gru, CellType::Lstm, CellType::LayerNormLstm] {
            let stores = ParamStores::cpu();
            let cell = create_cell(&stores, "enc", &config(cell_type, false), &[Device::Cpu]);
            assert_eq!(cell.num_layers(), 3);

            let x = Tensor::randn(&[2, 6], (Kind::Float, Device::Cpu));
            let (out, state) = cell.step(&x, &cell.zero_state(2), false);
            assert_eq!(out.size(), vec![2, 4]);
            assert_eq!(state.len(), 3);
            assert!(state.iter().all(|s| s.output().size() == vec![2, 4]));
        }
    }

    #[test]
    fn test_residual_skips_first_layer() {
        let stores = ParamStores::cpu();
        let cell = create_cell(&stores, "dec", &config(CellType::Gru, true), &[Device::Cpu]);
        assert!(!cell.layers()[0].residual);
        assert!(cell.layers()[1].residual);
        assert!(cell.layers()[2].residual);
    }

    #[test]
    fn test_dropout_only_on_training_passes() {
        let stores = ParamStores::cpu();
        let cfg = CellConfig { input_keep_prob: 0.5, ..config(CellType::Lstm, false) };
        let cell = create_cell(&stores, "enc", &cfg, &[Device::Cpu]);
        let x = Tensor::randn(&[3, 6], (Kind::Float, Device::Cpu));
        let (a, _) = cell.step(&x, &cell.zero_state(3), false);
        let (b, _) = cell.step(&x, &cell.zero_state(3), false);
        assert!(a.allclose(&b, 1e-6, 1e-6, false));
    }

    #[test]
    fn test_layers_are_named_per_scope() {
        let stores = ParamStores::cpu();
        let _cell = create_cell(&stores, "hred/context", &config(CellType::Rnn, false), &[Device::Cpu]);
        let names: Vec<String> = stores.describe().into_iter().map(|(n, _, _)| n).collect();
        assert!(names.contains(&"hred.context.cell_0.kernel.weight".to_string()));
        assert!(names.contains(&"hred.context.cell_2.kernel.bias".to_string()));
    }
}
