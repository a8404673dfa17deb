// src/rnn/state.rs
use tch::{Device, Kind, Tensor};

use crate::hparams::{CellType, NetworkType};

/// Recurrent state of a single layer.
#[derive(Debug)]
pub enum LayerState {
    Hidden(Tensor),
    Lstm { c: Tensor, h: Tensor },
}

impl LayerState {
    pub fn zeros(cell_type: CellType, batch: i64, hidden: i64, device: Device) -> Self {
        let z = || Tensor::zeros(&[batch, hidden], (Kind::Float, device));
        match cell_type {
            CellType::Lstm | CellType::LayerNormLstm => LayerState::Lstm { c: z(), h: z() },
            CellType::Rnn | CellType::Gru => LayerState::Hidden(z()),
        }
    }

    /// The layer output, `h` for LSTM layers.
    pub fn output(&self) -> &Tensor {
        match self {
            LayerState::Hidden(h) => h,
            LayerState::Lstm { h, .. } => h,
        }
    }

    pub fn map(&self, f: impl Fn(&Tensor) -> Tensor) -> Self {
        match self {
            LayerState::Hidden(h) => LayerState::Hidden(f(h)),
            LayerState::Lstm { c, h } => LayerState::Lstm { c: f(c), h: f(h) },
        }
    }

    /// Rows where `mask` is true come from `self`, the others from `previous`.
    pub fn select(&self, mask: &Tensor, previous: &LayerState) -> Self {
        let pick = |new: &Tensor, old: &Tensor| {
            let m = mask.to_device(new.device()).unsqueeze(-1);
            new.where_self(&m, &old.to_device(new.device()))
        };
        match (self, previous) {
            (LayerState::Hidden(n), LayerState::Hidden(o)) => LayerState::Hidden(pick(n, o)),
            (LayerState::Lstm { c: nc, h: nh }, LayerState::Lstm { c: oc, h: oh }) => {
                LayerState::Lstm { c: pick(nc, oc), h: pick(nh, oh) }
            }
            _ => unreachable!("layer state kinds never change within a cell"),
        }
    }

    pub fn batch_size(&self) -> i64 {
        self.output().size()[0]
    }

    pub fn width(&self) -> i64 {
        self.output().size()[1]
    }
}

/// State handed between the encoder, the context network and the decoder.
#[derive(Debug)]
pub enum RnnState {
    Uni(Vec<LayerState>),
    Bi { fw: Vec<LayerState>, bw: Vec<LayerState> },
}

impl RnnState {
    pub fn depth(&self) -> usize {
        match self {
            RnnState::Uni(stack) => stack.len(),
            RnnState::Bi { fw, bw } => fw.len() + bw.len(),
        }
    }

    pub fn kind(&self) -> NetworkType {
        match self {
            RnnState::Uni(_) => NetworkType::Uni,
            RnnState::Bi { .. } => NetworkType::Bi,
        }
    }

    pub fn into_uni(self) -> Vec<LayerState> {
        match reshape_state(self, NetworkType::Uni) {
            RnnState::Uni(stack) => stack,
            RnnState::Bi { .. } => unreachable!(),
        }
    }
}

/// Interleaves forward and backward layers: `fw0, bw0, fw1, bw1, ...`.
pub fn merge_bidirectional(fw: Vec<LayerState>, bw: Vec<LayerState>) -> Vec<LayerState> {
    debug_assert_eq!(fw.len(), bw.len());
    fw.into_iter().zip(bw).flat_map(|(f, b)| [f, b]).collect()
}

/// Inverse of [`merge_bidirectional`]: even layers forward, odd layers backward.
pub fn split_bidirectional(stack: Vec<LayerState>) -> (Vec<LayerState>, Vec<LayerState>) {
    let mut fw = Vec::with_capacity(stack.len() / 2);
    let mut bw = Vec::with_capacity(stack.len() / 2);
    for (i, layer) in stack.into_iter().enumerate() {
        if i % 2 == 0 {
            fw.push(layer);
        } else {
            bw.push(layer);
        }
    }
    (fw, bw)
}

/// Brings a state into the layout expected by a `target` network.
///
/// Used identically for the encoder → context hand-off and for the context →
/// decoder hand-off, so every directionality combination yields the same depth.
pub fn reshape_state(state: RnnState, target: NetworkType) -> RnnState {
    match (state, target) {
        (RnnState::Uni(stack), NetworkType::Uni) => RnnState::Uni(stack),
        (RnnState::Uni(stack), NetworkType::Bi) => {
            let (fw, bw) = split_bidirectional(stack);
            RnnState::Bi { fw, bw }
        }
        (RnnState::Bi { fw, bw }, NetworkType::Uni) => RnnState::Uni(merge_bidirectional(fw, bw)),
        (bi @ RnnState::Bi { .. }, NetworkType::Bi) => bi,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged(tags: &[f64]) -> Vec<LayerState> {
        tags.iter()
            .map(|&v| LayerState::Hidden(Tensor::full(&[1, 1], v, (Kind::Float, Device::Cpu))))
            .collect()
    }

    fn tags(stack: &[LayerState]) -> Vec<f64> {
        stack.iter().map(|l| l.output().double_value(&[0, 0])).collect()
    }

    #[test]
    fn test_merge_interleaves() {
        let merged = merge_bidirectional(tagged(&[0.0, 2.0]), tagged(&[1.0, 3.0]));
        assert_eq!(tags(&merged), vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_split_inverts_merge() {
        let (fw, bw) = split_bidirectional(tagged(&[0.0, 1.0, 2.0, 3.0]));
        assert_eq!(tags(&fw), vec![0.0, 2.0]);
        assert_eq!(tags(&bw), vec![1.0, 3.0]);
    }

    #[test]
    fn test_reshape_keeps_depth_for_every_combination() {
        for target in [NetworkType::Uni, NetworkType::Bi] {
            let uni = reshape_state(RnnState::Uni(tagged(&[0.0, 1.0, 2.0, 3.0])), target);
            assert_eq!(uni.depth(), 4);
            assert_eq!(uni.kind(), target);

            let bi = reshape_state(RnnState::Bi { fw: tagged(&[0.0, 2.0]), bw: tagged(&[1.0, 3.0]) }, target);
            assert_eq!(bi.depth(), 4);
            assert_eq!(bi.kind(), target);
        }
    }

    #[test]
    fn test_select_keeps_finished_rows() {
        let old = LayerState::Hidden(Tensor::zeros(&[2, 3], (Kind::Float, Device::Cpu)));
        let new = LayerState::Hidden(Tensor::ones(&[2, 3], (Kind::Float, Device::Cpu)));
        let mask = Tensor::from_slice(&[true, false]);
        let picked = new.select(&mask, &old);
        assert_eq!(picked.output().get(0).sum(Kind::Float).double_value(&[]), 3.0);
        assert_eq!(picked.output().get(1).sum(Kind::Float).double_value(&[]), 0.0);
    }

    #[test]
    fn test_lstm_zeros_have_two_parts() {
        let s = LayerState::zeros(CellType::Lstm, 4, 8, Device::Cpu);
        assert!(matches!(s, LayerState::Lstm { .. }));
        assert_eq!(s.batch_size(), 4);
        assert_eq!(s.width(), 8);
    }
}
