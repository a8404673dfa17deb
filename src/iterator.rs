// src/iterator.rs
use rayon::prelude::*;
use tch::{Kind, Tensor};

use crate::error::ModelError;
use crate::vocab::{Vocab, EOS_ID, PAD_ID, SOS_ID};

/// One padded batch of dialogues.
///
/// `sources[t]` is `[batch, time_t]` (int64) with lengths `[batch]` for every
/// prior turn. The target tensors are present in train/eval batches and absent
/// in inference batches.
#[derive(Debug)]
pub struct BatchedInput {
    pub sources: Vec<Tensor>,
    pub source_sequence_lengths: Vec<Tensor>,
    pub target_input: Option<Tensor>,
    pub target_output: Option<Tensor>,
    pub target_sequence_length: Option<Tensor>,
}

fn pad(rows: &[Vec<i64>], width: usize) -> Tensor {
    let data: Vec<i64> = rows
        .iter()
        .flat_map(|r| r.iter().copied().chain(std::iter::repeat(PAD_ID)).take(width))
        .collect();
    Tensor::from_slice(&data).view([rows.len() as i64, width as i64])
}

fn lengths(rows: &[Vec<i64>]) -> Tensor {
    let lens: Vec<i64> = rows.iter().map(|r| r.len() as i64).collect();
    Tensor::from_slice(&lens)
}

impl BatchedInput {
    /// Pads token-id dialogues into a batch.
    ///
    /// Each dialogue is a list of turns. With `with_target` the last turn is the
    /// response: its input gets a leading SOS and its output a trailing EOS.
    /// All dialogues must have the same number of turns.
    pub fn from_dialogues(dialogues: &[Vec<Vec<i64>>], with_target: bool) -> Result<Self, ModelError> {
        let turns = dialogues.first().map(|d| d.len()).unwrap_or(0);
        if let Some((i, d)) = dialogues.iter().enumerate().find(|(_, d)| d.len() != turns) {
            return Err(ModelError::shape(format!(
                "dialogue {} has {} turns, expected {}",
                i,
                d.len(),
                turns
            )));
        }
        let num_sources = if with_target { turns.saturating_sub(1) } else { turns };

        let mut sources = Vec::with_capacity(num_sources);
        let mut source_sequence_lengths = Vec::with_capacity(num_sources);
        for t in 0..num_sources {
            let rows: Vec<Vec<i64>> = dialogues.iter().map(|d| d[t].clone()).collect();
            let width = rows.iter().map(Vec::len).max().unwrap_or(0);
            sources.push(pad(&rows, width));
            source_sequence_lengths.push(lengths(&rows));
        }

        let (target_input, target_output, target_sequence_length) = if with_target && turns > 0 {
            let inputs: Vec<Vec<i64>> = dialogues
                .iter()
                .map(|d| std::iter::once(SOS_ID).chain(d[turns - 1].iter().copied()).collect())
                .collect();
            let outputs: Vec<Vec<i64>> = dialogues
                .iter()
                .map(|d| d[turns - 1].iter().copied().chain(std::iter::once(EOS_ID)).collect())
                .collect();
            let width = outputs.iter().map(Vec::len).max().unwrap_or(0);
            (Some(pad(&inputs, width)), Some(pad(&outputs, width)), Some(lengths(&outputs)))
        } else {
            (None, None, None)
        };

        Ok(Self { sources, source_sequence_lengths, target_input, target_output, target_sequence_length })
    }

    /// Encodes whitespace-tokenised turns with `vocab`, truncating each turn to `max_len`.
    pub fn from_texts(
        dialogues: &[Vec<String>],
        vocab: &Vocab,
        max_len: usize,
        with_target: bool,
    ) -> Result<Self, ModelError> {
        let encoded: Vec<Vec<Vec<i64>>> = dialogues
            .par_iter()
            .map(|turns| {
                turns
                    .iter()
                    .map(|text| {
                        let mut ids = vocab.encode(text);
                        ids.truncate(max_len);
                        ids
                    })
                    .collect()
            })
            .collect();
        Self::from_dialogues(&encoded, with_target)
    }

    pub fn num_source_turns(&self) -> usize {
        self.sources.len()
    }

    pub fn batch_size(&self) -> i64 {
        self.source_sequence_lengths
            .first()
            .or(self.target_sequence_length.as_ref())
            .map(|l| l.size()[0])
            .unwrap_or(0)
    }

    pub fn has_targets(&self) -> bool {
        self.target_input.is_some() && self.target_output.is_some() && self.target_sequence_length.is_some()
    }

    /// Checks the iterator invariants for a model encoding `num_source_turns` turns.
    pub fn validate(&self, num_source_turns: usize, need_targets: bool) -> Result<(), ModelError> {
        if self.sources.len() != num_source_turns || self.source_sequence_lengths.len() != num_source_turns {
            return Err(ModelError::shape(format!(
                "expected {} source turns, got {} sources and {} length vectors",
                num_source_turns,
                self.sources.len(),
                self.source_sequence_lengths.len()
            )));
        }
        let batch = self.batch_size();
        for (t, (src, len)) in self.sources.iter().zip(&self.source_sequence_lengths).enumerate() {
            if src.dim() != 2 || src.size()[0] != batch {
                return Err(ModelError::shape(format!(
                    "turn {} source has shape {:?}, expected [{}, time]",
                    t,
                    src.size(),
                    batch
                )));
            }
            if len.size() != [batch] {
                return Err(ModelError::shape(format!(
                    "turn {} lengths have shape {:?}, expected [{}]",
                    t,
                    len.size(),
                    batch
                )));
            }
        }

        if need_targets {
            let (input, output, len) = match (&self.target_input, &self.target_output, &self.target_sequence_length) {
                (Some(i), Some(o), Some(l)) => (i, o, l),
                _ => return Err(ModelError::shape("batch carries no target utterance")),
            };
            if input.dim() != 2 || input.size()[0] != batch || input.size() != output.size() {
                return Err(ModelError::shape(format!(
                    "target input {:?} and output {:?} must both be [{}, time]",
                    input.size(),
                    output.size(),
                    batch
                )));
            }
            if len.size() != [batch] {
                return Err(ModelError::shape(format!(
                    "target lengths have shape {:?}, expected [{}]",
                    len.size(),
                    batch
                )));
            }
        }
        Ok(())
    }

    /// Longest source utterance over all turns.
    pub fn max_source_length(&self) -> i64 {
        self.source_sequence_lengths
            .iter()
            .filter(|l| l.numel() > 0)
            .map(|l| l.max().int64_value(&[]))
            .max()
            .unwrap_or(0)
    }

    /// Σ target lengths, the number of predicted tokens.
    pub fn predict_count(&self) -> i64 {
        self.target_sequence_length
            .as_ref()
            .map(|l| l.sum(Kind::Int64).int64_value(&[]))
            .unwrap_or(0)
    }

    /// Σ of all source and target lengths.
    pub fn word_count(&self) -> i64 {
        let sources: i64 = self
            .source_sequence_lengths
            .iter()
            .map(|l| l.sum(Kind::Int64).int64_value(&[]))
            .sum();
        sources + self.predict_count()
    }

    /// Reorders the examples of every tensor by `order`.
    pub fn select_examples(&self, order: &[i64]) -> Self {
        let index = Tensor::from_slice(order);
        self.map(|t| t.index_select(0, &index.to_device(t.device())))
    }

    fn map(&self, f: impl Fn(&Tensor) -> Tensor) -> Self {
        Self {
            sources: self.sources.iter().map(&f).collect(),
            source_sequence_lengths: self.source_sequence_lengths.iter().map(&f).collect(),
            target_input: self.target_input.as_ref().map(&f),
            target_output: self.target_output.as_ref().map(&f),
            target_sequence_length: self.target_sequence_length.as_ref().map(&f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dialogues() -> Vec<Vec<Vec<i64>>> {
        vec![
            vec![vec![4, 5], vec![6], vec![7, 8, 9, 10]],
            vec![vec![4], vec![6, 7, 8], vec![9, 10, 11, 12, 13, 14]],
        ]
    }

    #[test]
    fn test_from_dialogues_pads_each_turn() {
        let batch = BatchedInput::from_dialogues(&dialogues(), true).unwrap();
        assert_eq!(batch.num_source_turns(), 2);
        assert_eq!(batch.batch_size(), 2);
        assert_eq!(batch.sources[0].size(), vec![2, 2]);
        assert_eq!(batch.sources[1].size(), vec![2, 3]);
        assert_eq!(Vec::<i64>::try_from(&batch.sources[1].view([-1])).unwrap(), vec![6, PAD_ID, PAD_ID, 6, 7, 8]);
        assert!(batch.validate(2, true).is_ok());
    }

    #[test]
    fn test_target_gets_sos_and_eos() {
        let batch = BatchedInput::from_dialogues(&dialogues(), true).unwrap();
        let input = batch.target_input.as_ref().unwrap();
        let output = batch.target_output.as_ref().unwrap();
        assert_eq!(input.size(), vec![2, 7]);
        assert_eq!(input.int64_value(&[0, 0]), SOS_ID);
        assert_eq!(output.int64_value(&[0, 4]), EOS_ID);
        assert_eq!(output.int64_value(&[1, 6]), EOS_ID);
        // lengths 5 and 7
        assert_eq!(batch.predict_count(), 12);
        assert_eq!(batch.word_count(), 2 + 1 + 1 + 3 + 12);
        assert_eq!(batch.max_source_length(), 3);
    }

    #[test]
    fn test_inference_batch_has_no_targets() {
        let prior: Vec<Vec<Vec<i64>>> = dialogues().into_iter().map(|d| d[..2].to_vec()).collect();
        let batch = BatchedInput::from_dialogues(&prior, false).unwrap();
        assert!(!batch.has_targets());
        assert!(batch.validate(2, false).is_ok());
        assert!(matches!(batch.validate(2, true), Err(ModelError::ShapeMismatch(_))));
    }

    #[test]
    fn test_inconsistent_dimensions_are_rejected() {
        let mut ragged = dialogues();
        ragged[1].pop();
        assert!(BatchedInput::from_dialogues(&ragged, true).is_err());

        let mut batch = BatchedInput::from_dialogues(&dialogues(), true).unwrap();
        batch.sources[1] = batch.sources[1].narrow(0, 0, 1);
        assert!(matches!(batch.validate(2, true), Err(ModelError::ShapeMismatch(_))));
        assert!(batch.validate(3, true).is_err());
    }

    #[test]
    fn test_from_texts_uses_vocab() {
        let vocab = Vocab::from_tokens(["hi", "there", "bye"]);
        let texts = vec![vec!["hi there".to_string(), "hi".to_string(), "bye".to_string()]];
        let batch = BatchedInput::from_texts(&texts, &vocab, 1, true).unwrap();
        assert_eq!(batch.sources[0].size(), vec![1, 1]);
        assert_eq!(batch.sources[0].int64_value(&[0, 0]), vocab.id("hi"));
    }

    #[test]
    fn test_select_examples_reorders_everything() {
        let batch = BatchedInput::from_dialogues(&dialogues(), true).unwrap();
        let swapped = batch.select_examples(&[1, 0]);
        assert_eq!(swapped.source_sequence_lengths[1].int64_value(&[0]), 3);
        assert_eq!(swapped.target_sequence_length.as_ref().unwrap().int64_value(&[1]), 5);
    }
}
