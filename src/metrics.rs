// src/metrics.rs
use std::collections::HashMap;

use crate::model::EvalOutput;

/// Running perplexity over eval batches.
///
/// Losses are batch-normalised, so each is scaled back by its batch size before
/// dividing by the number of predicted tokens.
#[derive(Clone, Copy, Debug, Default)]
pub struct Perplexity {
    total_loss: f64,
    total_predict_count: i64,
}

impl Perplexity {
    pub fn update(&mut self, out: &EvalOutput) {
        self.total_loss += out.loss * out.batch_size as f64;
        self.total_predict_count += out.predict_count;
    }

    pub fn predict_count(&self) -> i64 {
        self.total_predict_count
    }

    /// Mean per-token loss.
    pub fn loss(&self) -> f64 {
        if self.total_predict_count == 0 {
            return 0.0;
        }
        self.total_loss / self.total_predict_count as f64
    }

    pub fn value(&self) -> f64 {
        self.loss().exp()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BleuScore {
    pub bleu_1: f64,
    pub bleu_2: f64,
    pub bleu_3: f64,
    pub bleu_4: f64,
    pub bleu: f64, // geometric mean of 1-4 grams
}

fn ngrams(tokens: &[String], n: usize) -> HashMap<&[String], usize> {
    let mut map = HashMap::new();
    if n == 0 || tokens.len() < n {
        return map;
    }
    for window in tokens.windows(n) {
        *map.entry(window).or_insert(0) += 1;
    }
    map
}

/// Clipped n-gram precision.
fn modified_precision(reference: &[String], candidate: &[String], n: usize) -> f64 {
    let ref_ngrams = ngrams(reference, n);
    let cand_ngrams = ngrams(candidate, n);

    let total: usize = cand_ngrams.values().sum();
    if total == 0 {
        return 0.0;
    }
    let clipped: usize = cand_ngrams
        .iter()
        .map(|(ng, &count)| count.min(ref_ngrams.get(ng).copied().unwrap_or(0)))
        .sum();
    clipped as f64 / total as f64
}

/// BLEU of one decoded response against its reference, both already tokenised.
pub fn bleu_score(reference: &[String], candidate: &[String]) -> BleuScore {
    if reference.is_empty() || candidate.is_empty() {
        return BleuScore::default();
    }

    let p: Vec<f64> = (1..=4).map(|n| modified_precision(reference, candidate, n)).collect();

    let c = candidate.len() as f64;
    let r = reference.len() as f64;
    let bp = if c > r { 1.0 } else { (1.0 - r / c).exp() };

    let bleu = if p.iter().all(|&x| x > 0.0) { bp * (p[0] * p[1] * p[2] * p[3]).powf(0.25) } else { 0.0 };

    BleuScore { bleu_1: p[0], bleu_2: p[1], bleu_3: p[2], bleu_4: p[3], bleu }
}

pub fn sentence_bleu(reference: &[String], candidate: &[String]) -> f64 {
    bleu_score(reference, candidate).bleu
}

/// Mean sentence BLEU over aligned references and hypotheses.
pub fn average_bleu(references: &[Vec<String>], candidates: &[Vec<String>]) -> f64 {
    let n = references.len().min(candidates.len());
    if n == 0 {
        return 0.0;
    }
    references.iter().zip(candidates).map(|(r, c)| sentence_bleu(r, c)).sum::<f64>() / n as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(s: &str) -> Vec<String> {
        s.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn test_perplexity_uses_token_counts() {
        let mut ppl = Perplexity::default();
        // batch-normalised losses: 2 examples with 6 tokens at ln(4) each
        let loss = 6.0 * 4f64.ln() / 2.0;
        ppl.update(&EvalOutput { loss, predict_count: 6, batch_size: 2 });
        ppl.update(&EvalOutput { loss, predict_count: 6, batch_size: 2 });
        assert_eq!(ppl.predict_count(), 12);
        assert!((ppl.value() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_perplexity_is_one() {
        assert_eq!(Perplexity::default().value(), 1.0);
    }

    #[test]
    fn test_identical_sentences_score_one() {
        let s = toks("how are you doing today");
        assert!((sentence_bleu(&s, &s) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_short_candidates_are_penalised() {
        let reference = toks("i am fine thank you very much");
        let candidate = toks("i am fine thank you");
        let score = bleu_score(&reference, &candidate);
        assert_eq!(score.bleu_1, 1.0);
        assert!(score.bleu < 1.0 && score.bleu > 0.0);
    }

    #[test]
    fn test_no_overlap_scores_zero() {
        assert_eq!(sentence_bleu(&toks("a b c d"), &toks("w x y z")), 0.0);
        assert_eq!(average_bleu(&[], &[]), 0.0);
    }
}
