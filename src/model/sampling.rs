use tch::{Kind, Tensor};

use crate::model::SamplingParams;

/// Draws the next token id from last-position logits of shape `[vocab]`.
///
/// Logits are processed the way the Hugging Face sampler does it: temperature
/// first, then top-k, then nucleus (top-p) filtering over what is left.
pub fn sample_next_token(logits: &Tensor, params: &SamplingParams) -> i64 {
    let (filtered, order) = filter_logits(logits, params);
    let probs = filtered.softmax(-1, Kind::Float);
    let picked = probs.multinomial(1, false).int64_value(&[0]);
    order.int64_value(&[picked])
}

/// Returns logits sorted in descending order with rejected entries set to
/// `-inf`, together with the vocabulary index of every sorted position.
pub fn filter_logits(logits: &Tensor, params: &SamplingParams) -> (Tensor, Tensor) {
    let scaled = logits.to_kind(Kind::Float) / params.temperature;
    let (sorted, order) = scaled.sort(-1, true);
    let vocab = sorted.size()[0];

    let mut sorted = sorted;
    if params.top_k > 0 && (params.top_k as i64) < vocab {
        let rank = Tensor::arange(vocab, (Kind::Int64, sorted.device()));
        sorted = sorted.masked_fill(&rank.ge(params.top_k as i64), f64::NEG_INFINITY);
    }

    if params.top_p < 1.0 {
        let probs = sorted.softmax(-1, Kind::Float);
        // Probability mass strictly before each position; the top token always survives.
        let preceding = probs.cumsum(-1, Kind::Float) - &probs;
        sorted = sorted.masked_fill(&preceding.gt(params.top_p), f64::NEG_INFINITY);
    }

    (sorted, order)
}
