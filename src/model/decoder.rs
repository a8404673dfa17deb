// src/model/decoder.rs
use tch::{nn, nn::Module, Device, Kind, Tensor};

use crate::device::ParamStores;
use crate::error::ModelError;
use crate::hparams::HParams;
use crate::iterator::BatchedInput;
use crate::rnn::{create_cell, dynamic_rnn, CellConfig, LayerState, StackedCell};
use crate::vocab::{EOS_ID, SOS_ID};

/// Greedy decoding result.
#[derive(Debug)]
pub struct GreedyOutput {
    /// `[batch, time, vocab]`
    pub logits: Tensor,
    /// `[batch, time]`, EOS-padded after each example stops.
    pub sample_ids: Tensor,
}

/// Recurrent decoder seeded with the context state, plus the bias-free output
/// projection shared by every decoding mode.
pub struct Decoder {
    cell: StackedCell,
    output_layer: nn::Linear,
    vocab_size: i64,
}

/// Decode budget for a batch: `round(longest source turn × factor)`, halves to even.
pub fn maximum_iterations(batch: &BatchedInput, decoding_length_factor: f64) -> i64 {
    (batch.max_source_length() as f64 * decoding_length_factor).round_ties_even() as i64
}

impl Decoder {
    pub fn new(
        stores: &ParamStores,
        scope: &str,
        hparams: &HParams,
        devices: &[Device],
        output_device: Device,
    ) -> Result<Self, ModelError> {
        let config = CellConfig {
            cell_type: hparams.cell()?,
            input_size: hparams.embedding_dim() as i64,
            hidden_units: hparams.hidden_units as i64,
            num_layers: hparams.num_layers,
            residual: hparams.residual,
            input_keep_prob: 1.0 - hparams.decoder_dropout_rate,
        };
        let cell = create_cell(stores, scope, &config, devices);
        let vocab_size = hparams.vocab_size as i64;
        let output_layer = nn::linear(
            stores.scoped(output_device, scope) / "output_projection",
            config.hidden_units,
            vocab_size,
            nn::LinearConfig { bias: false, ..Default::default() },
        );
        Ok(Self { cell, output_layer, vocab_size })
    }

    pub fn vocab_size(&self) -> i64 {
        self.vocab_size
    }

    /// Hidden outputs to vocabulary logits.
    pub fn project(&self, outputs: &Tensor) -> Tensor {
        self.output_layer.forward(&outputs.to_device(self.output_layer.ws.device()))
    }

    /// One step from token ids `[n]`; returns `[n, vocab]` logits.
    pub fn step(
        &self,
        embedding: &nn::Embedding,
        tokens: &Tensor,
        state: &[LayerState],
        train: bool,
    ) -> (Tensor, Vec<LayerState>) {
        let inputs = embedding.forward(&tokens.to_device(embedding.ws.device()));
        let (out, next) = self.cell.step(&inputs, state, train);
        (self.project(&out), next)
    }

    /// Teacher-forced logits `[batch, time, vocab]` over `target_input`.
    ///
    /// With `sampling_probability > 0` every step after the first feeds, per
    /// example and with that probability, a token drawn from the previous
    /// step's distribution instead of the ground truth.
    pub fn train_forward(
        &self,
        embedding: &nn::Embedding,
        target_input: &Tensor,
        lengths: &Tensor,
        initial_state: Vec<LayerState>,
        sampling_probability: f64,
        train: bool,
    ) -> Tensor {
        let device = embedding.ws.device();
        let target_input = target_input.to_device(device);

        if sampling_probability <= 0.0 {
            let inputs = embedding.forward(&target_input).transpose(0, 1); // [T,B,E]
            let (outputs, _) = dynamic_rnn(&self.cell, &inputs, lengths, Some(initial_state), train);
            return self.project(&outputs).transpose(0, 1);
        }

        let (batch, max_time) = (target_input.size()[0], target_input.size()[1]);
        let lengths = lengths.to_device(device).to_kind(Kind::Int64);
        let mut state = initial_state;
        let mut logits: Vec<Tensor> = Vec::with_capacity(max_time as usize);
        for t in 0..max_time {
            let truth = target_input.select(1, t);
            let tokens = match logits.last() {
                Some(previous) => {
                    let sampled = previous
                        .detach()
                        .softmax(-1, Kind::Float)
                        .multinomial(1, true)
                        .squeeze_dim(-1)
                        .to_device(device);
                    let coin = Tensor::rand(&[batch], (Kind::Float, device)).lt(sampling_probability);
                    sampled.where_self(&coin, &truth)
                }
                None => truth,
            };
            let inputs = embedding.forward(&tokens);
            let (out, next) = self.cell.step(&inputs, &state, train);
            let valid = lengths.gt(t).to_device(out.device()).unsqueeze(-1).to_kind(out.kind());
            logits.push(self.project(&(out * valid)));
            state = next;
        }

        if logits.is_empty() {
            return Tensor::zeros(&[batch, 0, self.vocab_size], (Kind::Float, device));
        }
        Tensor::stack(&logits, 1)
    }

    /// Arg-max decoding from SOS.
    ///
    /// Stops once every example has emitted EOS or after `max_iterations` steps.
    pub fn greedy(
        &self,
        embedding: &nn::Embedding,
        initial_state: Vec<LayerState>,
        batch: i64,
        max_iterations: i64,
    ) -> GreedyOutput {
        let device = embedding.ws.device();
        let mut tokens = Tensor::full(&[batch], SOS_ID, (Kind::Int64, device));
        let mut finished = Tensor::zeros(&[batch], (Kind::Bool, device));
        let eos = Tensor::full(&[batch], EOS_ID, (Kind::Int64, device));
        let mut state = initial_state;

        let mut logits = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..max_iterations {
            let (step_logits, next) = self.step(embedding, &tokens, &state, false);
            let step_logits = step_logits.to_device(device);
            let chosen = step_logits.argmax(-1, false).where_self(&finished.logical_not(), &eos);
            finished = finished.logical_or(&chosen.eq(EOS_ID));
            logits.push(step_logits);
            ids.push(chosen.shallow_clone());
            tokens = chosen;
            state = next;
            if finished.all().int64_value(&[]) != 0 {
                break;
            }
        }

        if ids.is_empty() {
            return GreedyOutput {
                logits: Tensor::zeros(&[batch, 0, self.vocab_size], (Kind::Float, device)),
                sample_ids: Tensor::zeros(&[batch, 0], (Kind::Int64, device)),
            };
        }
        GreedyOutput { logits: Tensor::stack(&logits, 1), sample_ids: Tensor::stack(&ids, 1) }
    }
}
