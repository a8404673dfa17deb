// src/data_loader.rs
use std::path::Path;

use anyhow::{Context, Result};
use csv::ReaderBuilder;
use rand::seq::SliceRandom;
use rand::Rng;

/// Multi-turn dialogues from a CSV file.
/// Expected format: one utterance per column, `num_turns` columns per row,
/// the last column being the response.
pub struct DialogueLoader {
    dialogues: Vec<Vec<String>>,
    num_turns: usize,
}

impl DialogueLoader {
    /// Rows with fewer than `num_turns` non-empty utterances, or with any
    /// utterance longer than `max_len` words, are skipped.
    pub fn new(csv_path: impl AsRef<Path>, num_turns: usize, max_len: usize, has_headers: bool) -> Result<Self> {
        let csv_path = csv_path.as_ref();
        let mut reader = ReaderBuilder::new()
            .has_headers(has_headers)
            .flexible(true)
            .from_path(csv_path)
            .with_context(|| format!("Failed to open CSV file '{}'", csv_path.display()))?;

        let mut dialogues = Vec::new();
        let mut skipped = 0usize;
        for result in reader.records() {
            let record = result.context("Failed to read CSV record")?;
            let turns: Vec<String> = record.iter().take(num_turns).map(|t| t.trim().to_string()).collect();

            let complete = turns.len() == num_turns && turns.iter().all(|t| !t.is_empty());
            if !complete || turns.iter().any(|t| t.split_whitespace().count() > max_len) {
                skipped += 1;
                continue;
            }
            dialogues.push(turns);
        }

        tracing::info!(
            "# loaded {} dialogues of {} turns from {} ({} skipped)",
            dialogues.len(),
            num_turns,
            csv_path.display(),
            skipped
        );
        Ok(Self { dialogues, num_turns })
    }

    pub fn from_dialogues(dialogues: Vec<Vec<String>>, num_turns: usize) -> Self {
        Self { dialogues, num_turns }
    }

    pub fn num_samples(&self) -> usize {
        self.dialogues.len()
    }

    pub fn num_turns(&self) -> usize {
        self.num_turns
    }

    pub fn dialogues(&self) -> &[Vec<String>] {
        &self.dialogues
    }

    /// Every utterance, for fitting a vocabulary.
    pub fn texts(&self) -> impl Iterator<Item = &String> {
        self.dialogues.iter().flatten()
    }

    pub fn shuffle<R: Rng>(&mut self, rng: &mut R) {
        self.dialogues.shuffle(rng);
    }

    /// First `train_ratio` of the rows for training, the rest for dev.
    pub fn train_dev_split(&self, train_ratio: f64) -> (Vec<Vec<String>>, Vec<Vec<String>>) {
        let split_idx = ((self.dialogues.len() as f64 * train_ratio) as usize).min(self.dialogues.len());
        (self.dialogues[..split_idx].to_vec(), self.dialogues[split_idx..].to_vec())
    }
}
