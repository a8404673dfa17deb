// src/rnn/mod.rs
pub mod cell;
pub mod dynamic;
pub mod network;
pub mod state;

pub use cell::{create_cell, CellConfig, StackedCell};
pub use dynamic::{bidirectional_dynamic_rnn, dynamic_rnn, reverse_sequence, top_output};
pub use network::RecurrentNetwork;
pub use state::{merge_bidirectional, reshape_state, split_bidirectional, LayerState, RnnState};
