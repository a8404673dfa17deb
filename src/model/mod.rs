// src/model/mod.rs
pub mod beam;
pub mod context;
pub mod decoder;
pub mod encoder;
pub mod loss;
pub mod network;
pub mod optimizer;
pub mod schedule;

use std::fmt;
use std::rc::Rc;

use anyhow::Result;
use tch::{Device, Tensor};

use crate::device::ParamStores;
use crate::error::ModelError;
use crate::iterator::BatchedInput;
use crate::vocab::{Vocab, EOS_ID};

pub use decoder::maximum_iterations;
pub use network::HredNetwork;
pub use optimizer::StepOptimizer;
pub use schedule::{LearningRateSchedule, SamplingProbability, TrainingState};

/// What an instance was built for. Fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
    Infer,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Train => write!(f, "train"),
            Mode::Eval => write!(f, "eval"),
            Mode::Infer => write!(f, "infer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainSummary {
    pub learning_rate: f64,
    pub train_loss: f64,
    pub grad_norm: f64,
    pub clipped_grad_norm: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainOutput {
    pub loss: f64,
    pub predict_count: i64,
    pub summary: TrainSummary,
    /// Step count after this update.
    pub global_step: i64,
    pub word_count: i64,
    pub batch_size: i64,
    pub grad_norm: f64,
    pub learning_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalOutput {
    pub loss: f64,
    pub predict_count: i64,
    pub batch_size: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferSummary {
    pub maximum_iterations: i64,
    pub beam_width: i64,
    /// `[batch][beam]` scores, beam search only.
    pub beam_scores: Option<Vec<Vec<f64>>>,
}

#[derive(Debug)]
pub struct InferOutput {
    /// `[batch, time, vocab]` for greedy decoding, `None` for beam search.
    pub logits: Option<Tensor>,
    pub summary: InferSummary,
    /// `[batch, time]` greedy or `[batch, time, beam]` beam ids.
    pub sample_ids: Tensor,
    /// `[beam][batch][time]` raw reverse lookup of `sample_ids`.
    pub sample_words: Option<Vec<Vec<Vec<String>>>>,
}

#[derive(Debug)]
pub struct DecodeOutput {
    /// `[beam][batch][time]`, each hypothesis cut before its first EOS.
    pub words: Vec<Vec<Vec<String>>>,
    pub summary: InferSummary,
}

/// Resources that only exist in one mode.
enum Resources {
    Train(Box<Trainer>),
    Eval,
    Infer { rev_vocab: Option<Vocab> },
}

struct Trainer {
    optimizer: StepOptimizer,
    lr_schedule: LearningRateSchedule,
    sampling: SamplingProbability,
}

/// Execution facade over a shared [`HredNetwork`].
pub struct HredModel {
    network: Rc<HredNetwork>,
    resources: Resources,
    state: TrainingState,
}

impl HredModel {
    /// `stores` must be the stores `network` was built in; the train instance
    /// builds its optimizer over them.
    pub fn new(mode: Mode, network: Rc<HredNetwork>, stores: &ParamStores, rev_vocab: Option<Vocab>) -> Result<Self> {
        let hparams = network.hparams();
        let resources = match mode {
            Mode::Train => {
                let lr_schedule = LearningRateSchedule::from_hparams(hparams)?;
                let optimizer = StepOptimizer::new(
                    hparams.optimizer_kind()?,
                    stores,
                    lr_schedule.at(0),
                    hparams.max_gradient_norm,
                )?;
                let sampling = SamplingProbability::from_hparams(hparams)?;
                if sampling.enabled() {
                    tracing::info!(
                        "  scheduled sampling ({}) up to {}",
                        hparams.sampling_schedule,
                        hparams.scheduled_sampling_prob
                    );
                }
                Resources::Train(Box::new(Trainer { optimizer, lr_schedule, sampling }))
            }
            Mode::Eval => Resources::Eval,
            Mode::Infer => Resources::Infer { rev_vocab },
        };
        tracing::info!("# created {} model ({} source turns)", mode, network.num_source_turns());
        let state = TrainingState { global_step: 0, learning_rate: hparams.learning_rate };
        Ok(Self { network, resources, state })
    }

    pub fn mode(&self) -> Mode {
        match self.resources {
            Resources::Train(_) => Mode::Train,
            Resources::Eval => Mode::Eval,
            Resources::Infer { .. } => Mode::Infer,
        }
    }

    pub fn network(&self) -> &Rc<HredNetwork> {
        &self.network
    }

    pub fn training_state(&self) -> TrainingState {
        self.state
    }

    pub fn restore_state(&mut self, state: TrainingState) {
        self.state = state;
    }

    fn expect_mode(&self, expected: Mode) -> Result<(), ModelError> {
        let actual = self.mode();
        if actual != expected {
            return Err(ModelError::ModeMismatch { expected, actual });
        }
        Ok(())
    }

    /// One optimisation step.
    pub fn train(&mut self, batch: &BatchedInput) -> Result<TrainOutput> {
        let actual = self.mode();
        let trainer = match &mut self.resources {
            Resources::Train(trainer) => trainer,
            _ => return Err(ModelError::ModeMismatch { expected: Mode::Train, actual }.into()),
        };
        batch.validate(self.network.num_source_turns(), true)?;

        let step = self.state.global_step;
        let learning_rate = trainer.lr_schedule.at(step);
        trainer.optimizer.set_lr(learning_rate);

        let loss = self.network.loss(batch, trainer.sampling.at(step), true)?;
        let stats = trainer.optimizer.minimize(&loss);
        let train_loss = loss.double_value(&[]);

        self.state = TrainingState { global_step: step + 1, learning_rate };
        Ok(TrainOutput {
            loss: train_loss,
            predict_count: batch.predict_count(),
            summary: TrainSummary {
                learning_rate,
                train_loss,
                grad_norm: stats.grad_norm,
                clipped_grad_norm: stats.clipped_norm,
            },
            global_step: self.state.global_step,
            word_count: batch.word_count(),
            batch_size: batch.batch_size(),
            grad_norm: stats.grad_norm,
            learning_rate,
        })
    }

    pub fn eval(&self, batch: &BatchedInput) -> Result<EvalOutput> {
        self.expect_mode(Mode::Eval)?;
        batch.validate(self.network.num_source_turns(), true)?;
        let loss = tch::no_grad(|| self.network.loss(batch, 0.0, false))?;
        Ok(EvalOutput {
            loss: loss.double_value(&[]),
            predict_count: batch.predict_count(),
            batch_size: batch.batch_size(),
        })
    }

    pub fn infer(&self, batch: &BatchedInput) -> Result<InferOutput> {
        self.expect_mode(Mode::Infer)?;
        batch.validate(self.network.num_source_turns(), false)?;
        let hparams = self.network.hparams();
        let max_iter = maximum_iterations(batch, hparams.decoding_length_factor);

        let (logits, sample_ids, beam_scores) = tch::no_grad(|| -> Result<_> {
            if hparams.beam_width > 0 {
                let out = self.network.beam(batch, max_iter)?;
                Ok((None, out.predicted_ids, Some(out.scores)))
            } else {
                let out = self.network.greedy(batch, max_iter)?;
                Ok((Some(out.logits), out.sample_ids, None))
            }
        })?;

        let sample_words = match &self.resources {
            Resources::Infer { rev_vocab: Some(vocab) } => Some(
                ids_by_beam(&sample_ids)?
                    .iter()
                    .map(|beam| beam.iter().map(|ids| vocab.lookup(ids)).collect())
                    .collect(),
            ),
            _ => None,
        };

        Ok(InferOutput {
            logits,
            summary: InferSummary { maximum_iterations: max_iter, beam_width: hparams.beam_width.max(0), beam_scores },
            sample_ids,
            sample_words,
        })
    }

    /// Inference followed by reverse lookup, hypotheses truncated at EOS.
    pub fn decode(&self, batch: &BatchedInput) -> Result<DecodeOutput> {
        let vocab = match &self.resources {
            Resources::Infer { rev_vocab: Some(vocab) } => vocab,
            Resources::Infer { rev_vocab: None } => {
                return Err(ModelError::config("decoding to words needs a reverse vocabulary").into())
            }
            _ => return Err(ModelError::ModeMismatch { expected: Mode::Infer, actual: self.mode() }.into()),
        };
        let out = self.infer(batch)?;
        let words = ids_by_beam(&out.sample_ids)?
            .iter()
            .map(|beam| {
                beam.iter()
                    .map(|ids| {
                        let end = ids.iter().position(|&id| id == EOS_ID).unwrap_or(ids.len());
                        vocab.lookup(&ids[..end])
                    })
                    .collect()
            })
            .collect();
        Ok(DecodeOutput { words, summary: out.summary })
    }
}

/// `[batch, time]` or `[batch, time, beam]` ids as `[beam][batch][time]`.
pub fn ids_by_beam(sample_ids: &Tensor) -> Result<Vec<Vec<Vec<i64>>>> {
    let ids = if sample_ids.dim() == 2 { sample_ids.unsqueeze(-1) } else { sample_ids.shallow_clone() };
    let size = ids.size();
    if size.len() != 3 {
        return Err(ModelError::shape(format!("sample ids {:?} are neither 2-D nor 3-D", size)).into());
    }
    let (batch, time, beams) = (size[0] as usize, size[1] as usize, size[2] as usize);
    let flat = Vec::<i64>::try_from(&ids.permute([2, 0, 1]).contiguous().view([-1]).to_device(Device::Cpu))?;
    Ok((0..beams)
        .map(|k| (0..batch).map(|b| flat[(k * batch + b) * time..(k * batch + b + 1) * time].to_vec()).collect())
        .collect())
}
