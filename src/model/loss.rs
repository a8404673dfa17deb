// src/model/loss.rs
use tch::{Kind, Tensor};

use crate::error::ModelError;

/// `[batch, max_len]` float mask, 1.0 for `t < lengths[b]`.
pub fn sequence_mask(lengths: &Tensor, max_len: i64) -> Tensor {
    let device = lengths.device();
    Tensor::arange(max_len, (Kind::Int64, device))
        .unsqueeze(0)
        .lt_tensor(&lengths.to_kind(Kind::Int64).unsqueeze(1))
        .to_kind(Kind::Float)
}

/// Token cross-entropy summed over valid positions and divided by the batch size.
///
/// Normalising by batch size rather than by token count is deliberate: it keeps
/// the training dynamics (and learning-rate tuning) of the original models.
/// Perplexity is computed from the summed loss and `predict_count` instead.
pub fn masked_cross_entropy(logits: &Tensor, targets: &Tensor, lengths: &Tensor) -> Result<Tensor, ModelError> {
    let (ls, ts) = (logits.size(), targets.size());
    if ls.len() != 3 || ts.len() != 2 || ls[0] != ts[0] || ls[1] != ts[1] {
        return Err(ModelError::shape(format!(
            "logits {:?} do not line up with targets {:?}",
            ls, ts
        )));
    }
    let device = logits.device();
    let targets = targets.to_device(device).to_kind(Kind::Int64);

    let crossent = -logits
        .log_softmax(-1, Kind::Float)
        .gather(2, &targets.unsqueeze(-1), false)
        .squeeze_dim(-1); // [B,T]
    let weights = sequence_mask(&lengths.to_device(device), ts[1]);

    Ok((crossent * weights).sum(Kind::Float) / ts[0] as f64)
}
