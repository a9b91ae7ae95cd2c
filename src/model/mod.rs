mod types;

pub mod hub;

#[cfg(feature = "tch-backend")]
pub mod gpt2;
#[cfg(feature = "tch-backend")]
pub mod llama;
#[cfg(feature = "tch-backend")]
mod loader;
#[cfg(feature = "tch-backend")]
pub mod sampling;
#[cfg(feature = "tch-backend")]
pub mod weights;

#[cfg(feature = "tch-backend")]
pub use loader::LoadedModel;
pub use types::{GENERATION_SEED, GenerationRequest, GenerationResult, ModelMetadata, SamplingParams};

#[cfg(feature = "tch-backend")]
use tch::{Device, Kind, Tensor};

/// A decoder-only network mapping token ids `[batch, seq]` to logits
/// `[batch, seq, vocab]`.
#[cfg(feature = "tch-backend")]
pub trait CausalLm: Send {
    fn forward(&self, input_ids: &Tensor) -> Tensor;

    /// Maximum number of positions the network can attend over.
    fn context_length(&self) -> usize;

    fn architecture(&self) -> &'static str;
}

/// `true` above the diagonal, i.e. where a query must not see a key.
#[cfg(feature = "tch-backend")]
pub(crate) fn causal_mask(t: i64, device: Device) -> Tensor {
    Tensor::ones([t, t], (Kind::Float, device)).triu(1).eq(1.0)
}
