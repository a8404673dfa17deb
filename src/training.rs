// src/training.rs
use std::path::Path;
use std::rc::Rc;

use anyhow::{bail, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::checkpoint::CheckpointManager;
use crate::device::{DeviceManager, ParamStores};
use crate::hparams::HParams;
use crate::iterator::BatchedInput;
use crate::metrics::{average_bleu, Perplexity};
use crate::model::{EvalOutput, HredModel, HredNetwork, Mode};
use crate::vocab::Vocab;

/// Running statistics over one epoch of training steps.
#[derive(Debug, Clone, Copy, Default)]
pub struct EpochStats {
    pub steps: usize,
    pub mean_loss: f64,
    pub train_ppl: f64,
    pub words: i64,
    pub global_step: i64,
}

/// A decoded dev example.
#[derive(Debug, Clone)]
pub struct SampleDecode {
    pub context: Vec<String>,
    pub reference: String,
    pub hypothesis: String,
}

/// Owns the parameters and the three model instances that share them.
pub struct DialogueTrainer {
    stores: ParamStores,
    train_model: HredModel,
    eval_model: HredModel,
    infer_model: HredModel,
    vocab: Vocab,
    checkpoints: CheckpointManager,
    batch_size: usize,
    max_len: usize,
}

impl DialogueTrainer {
    /// Builds the network, resumes from the newest checkpoint in `out_dir` if any.
    pub fn new(hparams: &HParams, vocab: Vocab, out_dir: &Path, max_len: usize) -> Result<Self> {
        if vocab.size() != hparams.vocab_size {
            bail!("vocabulary has {} entries but vocab_size is {}", vocab.size(), hparams.vocab_size);
        }
        let devices = DeviceManager::new(hparams.num_gpus);
        let mut stores = ParamStores::new(&devices);
        let network = Rc::new(HredNetwork::new(&stores, &devices, hparams)?);

        let mut train_model = HredModel::new(Mode::Train, network.clone(), &stores, None)?;
        let mut eval_model = HredModel::new(Mode::Eval, network.clone(), &stores, None)?;
        let mut infer_model = HredModel::new(Mode::Infer, network, &stores, Some(vocab.clone()))?;

        let checkpoints = CheckpointManager::new(out_dir, CheckpointManager::DEFAULT_MAX_TO_KEEP)?;
        checkpoints.save_hparams(hparams)?;
        if let Some(state) = checkpoints.restore_latest(&mut stores)? {
            train_model.restore_state(state);
            eval_model.restore_state(state);
            infer_model.restore_state(state);
        }

        Ok(Self {
            stores,
            train_model,
            eval_model,
            infer_model,
            vocab,
            checkpoints,
            batch_size: hparams.batch_size.max(1),
            max_len,
        })
    }

    pub fn global_step(&self) -> i64 {
        self.train_model.training_state().global_step
    }

    fn progress_bar(len: usize) -> Result<ProgressBar> {
        let pb = ProgressBar::new(len as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")?
                .progress_chars("=>-"),
        );
        Ok(pb)
    }

    pub fn train_epoch(&mut self, data: &[Vec<String>]) -> Result<EpochStats> {
        let num_batches = (data.len() + self.batch_size - 1) / self.batch_size;
        let pb = Self::progress_bar(num_batches)?;

        let mut total_loss = 0.0f64;
        let mut ppl = Perplexity::default();
        let mut stats = EpochStats::default();

        for chunk in data.chunks(self.batch_size) {
            let batch = BatchedInput::from_texts(chunk, &self.vocab, self.max_len, true)?;
            let out = self.train_model.train(&batch)?;

            total_loss += out.loss;
            ppl.update(&EvalOutput {
                loss: out.loss,
                predict_count: out.predict_count,
                batch_size: out.batch_size,
            });
            stats.steps += 1;
            stats.words += out.word_count;
            stats.global_step = out.global_step;

            tracing::debug!(
                "  step {} lr {:.6} loss {:.4} gN {:.2} clipped {:.2}",
                out.global_step,
                out.summary.learning_rate,
                out.summary.train_loss,
                out.summary.grad_norm,
                out.summary.clipped_grad_norm
            );
            pb.set_message(format!("loss {:.4} lr {:.2e}", out.loss, out.learning_rate));
            pb.inc(1);
        }
        pb.finish_with_message("epoch complete");

        if stats.steps > 0 {
            stats.mean_loss = total_loss / stats.steps as f64;
        }
        stats.train_ppl = ppl.value();
        Ok(stats)
    }

    /// Dev perplexity with the current weights.
    pub fn evaluate(&mut self, data: &[Vec<String>]) -> Result<Perplexity> {
        self.eval_model.restore_state(self.train_model.training_state());
        let mut ppl = Perplexity::default();
        for chunk in data.chunks(self.batch_size) {
            let batch = BatchedInput::from_texts(chunk, &self.vocab, self.max_len, true)?;
            ppl.update(&self.eval_model.eval(&batch)?);
        }
        Ok(ppl)
    }

    /// Decodes the best response for each dialogue from its prior turns.
    pub fn decode(&mut self, data: &[Vec<String>]) -> Result<Vec<SampleDecode>> {
        self.infer_model.restore_state(self.train_model.training_state());
        let mut samples = Vec::with_capacity(data.len());
        for chunk in data.chunks(self.batch_size) {
            let prior: Vec<Vec<String>> =
                chunk.iter().map(|d| d[..d.len().saturating_sub(1)].to_vec()).collect();
            let batch = BatchedInput::from_texts(&prior, &self.vocab, self.max_len, false)?;
            let decoded = self.infer_model.decode(&batch)?;
            let best = decoded.words.first().cloned().unwrap_or_default();
            for (dialogue, words) in chunk.iter().zip(best) {
                samples.push(SampleDecode {
                    context: dialogue[..dialogue.len().saturating_sub(1)].to_vec(),
                    reference: dialogue.last().cloned().unwrap_or_default(),
                    hypothesis: words.join(" "),
                });
            }
        }
        Ok(samples)
    }

    /// Full loop: shuffle, train, dev perplexity and BLEU, checkpoint.
    pub fn run<R: Rng>(
        &mut self,
        train: &mut [Vec<String>],
        dev: &[Vec<String>],
        epochs: usize,
        num_samples: usize,
        rng: &mut R,
    ) -> Result<()> {
        if self.stores.num_parameters() == 0 {
            bail!("No trainable variables found");
        }
        let mut best_ppl = f64::INFINITY;

        for epoch in 1..=epochs {
            tracing::info!("# epoch {}/{} (global step {})", epoch, epochs, self.global_step());
            train.shuffle(rng);

            let stats = self.train_epoch(train)?;
            tracing::info!(
                "  train: steps {} loss {:.4} ppl {:.2} words {}",
                stats.steps,
                stats.mean_loss,
                stats.train_ppl,
                stats.words
            );

            if !dev.is_empty() {
                let ppl = self.evaluate(dev)?;
                tracing::info!("  dev: ppl {:.2} over {} tokens", ppl.value(), ppl.predict_count());
                if ppl.value() < best_ppl {
                    best_ppl = ppl.value();
                    tracing::info!("  new best dev ppl {:.2}", best_ppl);
                }

                let shown = &dev[..num_samples.min(dev.len())];
                let samples = self.decode(shown)?;
                let references: Vec<Vec<String>> = samples
                    .iter()
                    .map(|s| s.reference.split_whitespace().map(str::to_string).collect())
                    .collect();
                let hypotheses: Vec<Vec<String>> = samples
                    .iter()
                    .map(|s| s.hypothesis.split_whitespace().map(str::to_string).collect())
                    .collect();
                tracing::info!("  sample bleu {:.4}", average_bleu(&references, &hypotheses));
                for s in &samples {
                    tracing::info!("    context: {}", s.context.join(" | "));
                    tracing::info!("    ref: {}", s.reference);
                    tracing::info!("    nmt: {}", s.hypothesis);
                }
            }

            self.checkpoints.save(&self.stores, self.train_model.training_state())?;
        }

        tracing::info!("# done, global step {}, best dev ppl {:.2}", self.global_step(), best_ppl);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn corpus() -> Vec<Vec<String>> {
        let lines = [
            ["hi", "hello there", "how are you"],
            ["how are you", "fine thanks", "good to hear"],
            ["what is up", "not much", "same here"],
            ["good morning", "morning", "nice day"],
        ];
        lines.iter().map(|d| d.iter().map(|s| s.to_string()).collect()).collect()
    }

    fn setup() -> (HParams, Vocab) {
        let data = corpus();
        let vocab = Vocab::fit_from_texts(data.iter().flatten(), 100);
        let hp = HParams {
            vocab_size: vocab.size(),
            hidden_units: 8,
            num_layers: 1,
            batch_size: 2,
            num_turns: 3,
            optimizer: "sgd".into(),
            learning_rate: 0.1,
            random_seed: Some(3),
            ..HParams::default()
        };
        (hp, vocab)
    }

    #[test]
    fn test_run_writes_checkpoints_and_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let (hp, vocab) = setup();
        let mut data = corpus();
        let dev = data.split_off(3);
        let mut rng = rand::rngs::StdRng::seed_from_u64(0);

        let mut trainer = DialogueTrainer::new(&hp, vocab.clone(), dir.path(), 10).unwrap();
        trainer.run(&mut data, &dev, 2, 1, &mut rng).unwrap();
        // 3 dialogues in batches of 2
        assert_eq!(trainer.global_step(), 4);
        assert!(dir.path().join("hparams.json").exists());

        let resumed = DialogueTrainer::new(&hp, vocab, dir.path(), 10).unwrap();
        assert_eq!(resumed.global_step(), 4);
    }

    #[test]
    fn test_decode_returns_one_sample_per_dialogue() {
        let dir = tempfile::tempdir().unwrap();
        let (hp, vocab) = setup();
        let mut trainer = DialogueTrainer::new(&hp, vocab, dir.path(), 10).unwrap();
        let samples = trainer.decode(&corpus()).unwrap();
        assert_eq!(samples.len(), 4);
        assert_eq!(samples[1].reference, "good to hear");
        assert_eq!(samples[1].context, vec!["how are you".to_string(), "fine thanks".to_string()]);
    }

    #[test]
    fn test_vocab_size_must_match() {
        let dir = tempfile::tempdir().unwrap();
        let (hp, vocab) = setup();
        let hp = HParams { vocab_size: hp.vocab_size + 1, ..hp };
        assert!(DialogueTrainer::new(&hp, vocab, dir.path(), 10).is_err());
    }
}
