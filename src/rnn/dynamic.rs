// src/rnn/dynamic.rs
use tch::{Kind, Tensor};

use crate::rnn::cell::StackedCell;
use crate::rnn::state::LayerState;

/// Unrolls `cell` over time-major `inputs` `[T, B, D]`.
///
/// Example `b` only advances for `t < lengths[b]`: past its length the state is
/// carried unchanged and the output is zero, so the returned state is the state
/// at each example's last valid step.
pub fn dynamic_rnn(
    cell: &StackedCell,
    inputs: &Tensor,
    lengths: &Tensor,
    initial_state: Option<Vec<LayerState>>,
    train: bool,
) -> (Tensor, Vec<LayerState>) {
    let size = inputs.size();
    let (max_time, batch) = (size[0], size[1]);
    let mut state = initial_state.unwrap_or_else(|| cell.zero_state(batch));
    let lengths = lengths.to_kind(Kind::Int64);

    let mut outputs = Vec::with_capacity(max_time as usize);
    for t in 0..max_time {
        let (out, next) = cell.step(&inputs.get(t), &state, train);
        let mask = lengths.gt(t);
        let out_mask = mask.to_device(out.device()).unsqueeze(-1).to_kind(out.kind());
        outputs.push(out * out_mask);
        state = next.iter().zip(&state).map(|(n, o)| n.select(&mask, o)).collect();
    }

    let outputs = if outputs.is_empty() {
        Tensor::zeros(&[0, batch, cell.output_size()], (Kind::Float, inputs.device()))
    } else {
        let device = outputs[0].device();
        let outputs: Vec<Tensor> = outputs.iter().map(|o| o.to_device(device)).collect();
        Tensor::stack(&outputs, 0)
    };
    (outputs, state)
}

/// Reverses the first `lengths[b]` steps of each example, leaving padding in place.
pub fn reverse_sequence(inputs: &Tensor, lengths: &Tensor) -> Tensor {
    let max_time = inputs.size()[0];
    let device = inputs.device();
    let t = Tensor::arange(max_time, (Kind::Int64, device)).unsqueeze(1); // [T,1]
    let l = lengths.to_device(device).to_kind(Kind::Int64).unsqueeze(0); // [1,B]
    let reversed = (&l - 1 - &t).where_self(&t.lt_tensor(&l), &t); // [T,B]

    let mut index = reversed;
    for _ in 2..inputs.dim() {
        index = index.unsqueeze(-1);
    }
    inputs.gather(0, &index.expand_as(inputs), false)
}

/// Forward and backward unrolling; outputs are concatenated on the last axis.
pub fn bidirectional_dynamic_rnn(
    fw_cell: &StackedCell,
    bw_cell: &StackedCell,
    inputs: &Tensor,
    lengths: &Tensor,
    initial_fw: Option<Vec<LayerState>>,
    initial_bw: Option<Vec<LayerState>>,
    train: bool,
) -> (Tensor, (Vec<LayerState>, Vec<LayerState>)) {
    let (fw_out, fw_state) = dynamic_rnn(fw_cell, inputs, lengths, initial_fw, train);
    let reversed = reverse_sequence(inputs, lengths);
    let (bw_rev, bw_state) = dynamic_rnn(bw_cell, &reversed, lengths, initial_bw, train);
    let bw_out = reverse_sequence(&bw_rev.to_device(fw_out.device()), lengths);
    (Tensor::cat(&[fw_out, bw_out], -1), (fw_state, bw_state))
}

/// Top-layer output of a non-empty state stack.
pub fn top_output(state: &[LayerState]) -> Tensor {
    state[state.len() - 1].output().shallow_clone()
}
