// src/model/beam.rs
use anyhow::Result;
use tch::{nn, Device, Kind, Tensor};

use crate::model::decoder::Decoder;
use crate::rnn::LayerState;
use crate::vocab::{EOS_ID, SOS_ID};

/// Beam search result, hypotheses ordered best first.
#[derive(Debug)]
pub struct BeamSearchOutput {
    /// `[batch, time, beam]`
    pub predicted_ids: Tensor,
    /// `[batch][beam]` length-penalised scores, descending.
    pub scores: Vec<Vec<f64>>,
}

/// GNMT length penalty `((5 + len) / 6) ^ weight`.
pub fn length_penalty(lengths: &Tensor, weight: f64) -> Tensor {
    ((lengths.to_kind(Kind::Float) + 5.0) / 6.0).pow_tensor_scalar(weight)
}

/// Repeats every example `beam_width` times along the batch axis.
fn tile(t: &Tensor, beam_width: i64) -> Tensor {
    let size = t.size();
    let (batch, width) = (size[0], size[1]);
    t.unsqueeze(1).expand(&[batch, beam_width, width], false).reshape(&[batch * beam_width, width])
}

/// Keeps `beam_width` hypotheses per example.
///
/// Scores are cumulative log-probabilities divided by the length penalty.
/// Finished hypotheses can only be extended with EOS at zero cost, so they keep
/// their score and length. Back-pointers are resolved once decoding stops.
pub fn beam_search(
    decoder: &Decoder,
    embedding: &nn::Embedding,
    initial_state: Vec<LayerState>,
    batch: i64,
    beam_width: i64,
    max_iterations: i64,
    length_penalty_weight: f64,
) -> Result<BeamSearchOutput> {
    let device = embedding.ws.device();
    let (k, vocab) = (beam_width, decoder.vocab_size());

    let mut state: Vec<LayerState> = initial_state.iter().map(|s| s.map(|t| tile(t, k))).collect();
    // only the first beam is live at the start so the k copies do not all survive
    let mut log_probs = Tensor::cat(
        &[
            Tensor::zeros(&[batch, 1], (Kind::Float, device)),
            Tensor::full(&[batch, k - 1], f64::NEG_INFINITY, (Kind::Float, device)),
        ],
        1,
    );
    let mut finished = Tensor::zeros(&[batch, k], (Kind::Bool, device));
    let mut lengths = Tensor::zeros(&[batch, k], (Kind::Int64, device));
    let mut tokens = Tensor::full(&[batch * k], SOS_ID, (Kind::Int64, device));

    let eos_only = Tensor::full(&[vocab], f64::NEG_INFINITY, (Kind::Float, device))
        .index_fill(0, &Tensor::from_slice(&[EOS_ID]).to_device(device), 0.0);
    let batch_offsets = (Tensor::arange(batch, (Kind::Int64, device)) * k).unsqueeze(1); // [B,1]

    let mut parents_history: Vec<Vec<i64>> = Vec::new();
    let mut tokens_history: Vec<Vec<i64>> = Vec::new();

    for _ in 0..max_iterations {
        let (logits, next) = decoder.step(embedding, &tokens, &state, false);
        let step_lp = logits.to_device(device).log_softmax(-1, Kind::Float).view([batch, k, vocab]);
        let step_lp = step_lp.where_self(&finished.logical_not().unsqueeze(-1), &eos_only);

        let total = log_probs.unsqueeze(-1) + step_lp; // [B,K,V]
        let new_lengths = &lengths + finished.logical_not().to_kind(Kind::Int64);
        let scores = &total / length_penalty(&new_lengths, length_penalty_weight).unsqueeze(-1);

        let (_, top) = scores.view([batch, k * vocab]).topk(k, -1, true, true); // [B,K]
        let parent = (top.to_kind(Kind::Double) / vocab as f64).floor().to_kind(Kind::Int64);
        let token = &top - &parent * vocab;

        log_probs = total.view([batch, k * vocab]).gather(1, &top, false);
        lengths = new_lengths.gather(1, &parent, false);
        finished = finished.gather(1, &parent, false).logical_or(&token.eq(EOS_ID));

        let flat = (&parent + &batch_offsets).view([-1]);
        state = next.iter().map(|s| s.map(|t| t.index_select(0, &flat.to_device(t.device())))).collect();
        tokens = token.view([-1]);

        parents_history.push(Vec::<i64>::try_from(&parent.view([-1]).to_device(Device::Cpu))?);
        tokens_history.push(Vec::<i64>::try_from(&tokens.to_device(Device::Cpu))?);

        if finished.all().int64_value(&[]) != 0 {
            break;
        }
    }

    let final_scores = (&log_probs / length_penalty(&lengths, length_penalty_weight)).to_device(Device::Cpu);
    let final_scores = Vec::<f64>::try_from(&final_scores.to_kind(Kind::Double).view([-1]))?;
    Ok(backtrack(&parents_history, &tokens_history, &final_scores, batch, k, device))
}

/// Follows back-pointers from the last step and orders beams by score
/// (descending, ties keep the lower beam index first).
fn backtrack(
    parents: &[Vec<i64>],
    tokens: &[Vec<i64>],
    scores: &[f64],
    batch: i64,
    k: i64,
    device: Device,
) -> BeamSearchOutput {
    let steps = tokens.len();
    let (b_n, k_n) = (batch as usize, k as usize);
    // ids[b][beam][t]
    let mut ids = vec![vec![vec![EOS_ID; steps]; k_n]; b_n];
    for b in 0..b_n {
        for beam in 0..k_n {
            let mut cursor = beam;
            for t in (0..steps).rev() {
                let at = b * k_n + cursor;
                ids[b][beam][t] = tokens[t][at];
                cursor = parents[t][at] as usize;
            }
        }
    }

    let mut data = Vec::with_capacity(b_n * steps * k_n);
    let mut ordered_scores = Vec::with_capacity(b_n);
    for (b, beams) in ids.iter().enumerate() {
        let row = &scores[b * k_n..(b + 1) * k_n];
        let mut order: Vec<usize> = (0..k_n).collect();
        order.sort_by(|&x, &y| row[y].partial_cmp(&row[x]).unwrap_or(std::cmp::Ordering::Equal));
        for t in 0..steps {
            data.extend(order.iter().map(|&beam| beams[beam][t]));
        }
        ordered_scores.push(order.iter().map(|&beam| row[beam]).collect());
    }

    let predicted_ids = Tensor::from_slice(&data).view([batch, steps as i64, k]).to_device(device);
    BeamSearchOutput { predicted_ids, scores: ordered_scores }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ParamStores;
    use crate::hparams::HParams;

    fn setup(stores: &ParamStores) -> (nn::Embedding, Decoder) {
        let hp = HParams { vocab_size: 9, embedding_size: Some(4), hidden_units: 6, num_layers: 1, ..HParams::default() };
        let emb = nn::embedding(stores.scoped(Device::Cpu, "emb"), 9, 4, Default::default());
        let dec = Decoder::new(stores, "dec", &hp, &[Device::Cpu], Device::Cpu).unwrap();
        (emb, dec)
    }

    fn state(batch: i64) -> Vec<LayerState> {
        tch::manual_seed(11);
        vec![LayerState::Lstm {
            c: Tensor::randn(&[batch, 6], (Kind::Float, Device::Cpu)),
            h: Tensor::randn(&[batch, 6], (Kind::Float, Device::Cpu)),
        }]
    }

    #[test]
    fn test_length_penalty() {
        let p = length_penalty(&Tensor::from_slice(&[1i64, 7]), 1.0);
        assert!((p.double_value(&[0]) - 1.0).abs() < 1e-6);
        assert!((p.double_value(&[1]) - 2.0).abs() < 1e-6);
        let flat = length_penalty(&Tensor::from_slice(&[3i64]), 0.0);
        assert_eq!(flat.double_value(&[0]), 1.0);
    }

    #[test]
    fn test_k_hypotheses_in_descending_order() {
        tch::manual_seed(2);
        let stores = ParamStores::cpu();
        let (emb, dec) = setup(&stores);
        let out = beam_search(&dec, &emb, state(2), 2, 3, 6, 0.6).unwrap();
        let size = out.predicted_ids.size();
        assert_eq!((size[0], size[2]), (2, 3));
        assert!(size[1] <= 6);
        for row in &out.scores {
            assert_eq!(row.len(), 3);
            assert!(row.windows(2).all(|w| w[0] >= w[1]));
        }
    }

    #[test]
    fn test_single_beam_matches_greedy() {
        tch::manual_seed(4);
        let stores = ParamStores::cpu();
        let (emb, dec) = setup(&stores);
        let beam = beam_search(&dec, &emb, state(2), 2, 1, 8, 0.0).unwrap();
        let greedy = dec.greedy(&emb, state(2), 2, 8);
        assert_eq!(beam.predicted_ids.squeeze_dim(-1), greedy.sample_ids);
    }

    #[test]
    fn test_backtrack_follows_parents() {
        // one example, two beams, two steps: beam 0 at t=1 came from beam 1 at t=0
        let parents = vec![vec![0, 0], vec![1, 0]];
        let tokens = vec![vec![5, 6], vec![7, 8]];
        let out = backtrack(&parents, &tokens, &[-1.0, -0.5], 1, 2, Device::Cpu);
        let ids = Vec::<i64>::try_from(&out.predicted_ids.view([-1])).unwrap();
        // beam 1 reads 5, 8 and scores best; beam 0 reads 6, 7
        assert_eq!(ids, vec![5, 6, 8, 7]);
        assert_eq!(out.scores[0], vec![-0.5, -1.0]);
    }
}
