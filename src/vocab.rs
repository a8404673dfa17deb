// src/vocab.rs
use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};

pub const PAD_TOKEN: &str = "<PAD>";
pub const UNK_TOKEN: &str = "<UNK>";
pub const SOS_TOKEN: &str = "<SOS>";
pub const EOS_TOKEN: &str = "<EOS>";

pub const PAD_ID: i64 = 0;
pub const UNK_ID: i64 = 1;
pub const SOS_ID: i64 = 2;
pub const EOS_ID: i64 = 3;

const SPECIALS: [&str; 4] = [PAD_TOKEN, UNK_TOKEN, SOS_TOKEN, EOS_TOKEN];

/// Word ↔ id table shared by the encoder, the decoder and the reverse lookup
/// used to turn sampled ids back into words.
#[derive(Debug, Clone)]
pub struct Vocab {
    word2idx: HashMap<String, i64>,
    idx2word: Vec<String>,
}

impl Vocab {
    /// Special tokens first, then `tokens` in order (duplicates and specials skipped).
    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut vocab = Self { word2idx: HashMap::new(), idx2word: Vec::new() };
        for special in SPECIALS {
            vocab.push(special.to_string());
        }
        for token in tokens {
            vocab.push(token.into());
        }
        vocab
    }

    fn push(&mut self, word: String) {
        if !self.word2idx.contains_key(&word) {
            self.word2idx.insert(word.clone(), self.idx2word.len() as i64);
            self.idx2word.push(word);
        }
    }

    /// One token per line.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read vocabulary '{}'", path.display()))?;
        Ok(Self::from_tokens(text.lines().map(str::trim).filter(|l| !l.is_empty())))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.idx2word.join("\n"))
            .with_context(|| format!("Cannot write vocabulary '{}'", path.display()))?;
        Ok(())
    }

    /// Most frequent words first, capped at `max_vocab_size` entries in total.
    pub fn fit_from_texts<'a, I>(texts: I, max_vocab_size: usize) -> Self
    where
        I: Iterator<Item = &'a String>,
    {
        let word_counts: HashMap<&str, usize> = texts
            .flat_map(|text| text.split_whitespace())
            .fold(HashMap::new(), |mut acc, word| {
                *acc.entry(word).or_insert(0) += 1;
                acc
            });

        // frequency, then alphabetical so equal counts are stable
        let mut word_freq: Vec<_> = word_counts.into_iter().collect();
        word_freq.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));

        let max_words = max_vocab_size.saturating_sub(SPECIALS.len());
        Self::from_tokens(word_freq.into_iter().take(max_words).map(|(w, _)| w.to_string()))
    }

    pub fn size(&self) -> usize {
        self.idx2word.len()
    }

    pub fn id(&self, word: &str) -> i64 {
        self.word2idx.get(word).copied().unwrap_or(UNK_ID)
    }

    /// Reverse lookup; out-of-range ids map to the unknown token.
    pub fn word(&self, id: i64) -> &str {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.idx2word.get(i))
            .map(String::as_str)
            .unwrap_or(UNK_TOKEN)
    }

    pub fn encode(&self, text: &str) -> Vec<i64> {
        text.split_whitespace().map(|w| self.id(w)).collect()
    }

    pub fn lookup(&self, ids: &[i64]) -> Vec<String> {
        ids.iter().map(|&id| self.word(id).to_string()).collect()
    }
}
