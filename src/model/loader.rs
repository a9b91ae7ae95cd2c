use std::{
    fs,
    panic::{AssertUnwindSafe, catch_unwind},
    time::Instant,
};

use parking_lot::Mutex;
use serde_json::Value;
use tch::{Device, Kind, Tensor, no_grad};
use tokenizers::{
    AddedToken, PaddingDirection, PaddingParams, Tokenizer, TruncationParams,
    decoders::DecoderWrapper,
    models::bpe::BPE,
    pre_tokenizers::{PreTokenizerWrapper, byte_level::ByteLevel},
};
use tracing::{debug, info};

use crate::{
    adapter::TextBackend,
    config::AppConfig,
    error::{LlmError, panic_message},
    model::{
        CausalLm, ModelMetadata, SamplingParams,
        gpt2::{Gpt2, Gpt2Config},
        hub::ModelSource,
        llama::{Llama, LlamaConfig},
        sampling::sample_next_token,
        weights::WeightMap,
    },
};

/// Tokenizer and network for one model name, resident on one device.
pub struct LoadedModel {
    model_name: String,
    tokenizer: Tokenizer,
    network: Mutex<Box<dyn CausalLm>>,
    eos_token_ids: Vec<i64>,
    fallback_token_id: i64,
    device: Device,
    kind: Kind,
    size_bytes: u64,
}

impl LoadedModel {
    pub fn load(model_name: &str, config: &AppConfig) -> Result<Self, LlmError> {
        let device = config.device;
        // CPUs lack fast fp16 kernels; keep full precision there.
        let kind = if device.is_cuda() {
            Kind::Half
        } else {
            Kind::Float
        };
        info!(model = %model_name, device = ?device, dtype = dtype_name(kind), "loading model");
        let start = Instant::now();

        let source = ModelSource::resolve(model_name, config)?;
        let raw_config = fs::read_to_string(source.get("config.json")?)?;
        let model_config: Value = serde_json::from_str(&raw_config)?;
        let eos_token_ids = token_ids(&model_config, "eos_token_id");
        let fallback_token_id = token_ids(&model_config, "bos_token_id")
            .first()
            .or(eos_token_ids.first())
            .copied()
            .unwrap_or(0);

        let weights = WeightMap::from_files(&source.weight_files()?, device, kind)?;
        let size_bytes = weights.size_bytes();
        let network = build_network(&model_config, weights, device)?;

        let eos = eos_token_ids.first().copied();
        let tokenizer = load_tokenizer(&source, eos, network.context_length())?;

        info!(
            model = %model_name,
            architecture = network.architecture(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "model loaded"
        );

        Ok(Self {
            model_name: model_name.to_string(),
            tokenizer,
            network: Mutex::new(network),
            eos_token_ids,
            fallback_token_id,
            device,
            kind,
            size_bytes,
        })
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn metadata(&self) -> ModelMetadata {
        let network = self.network.lock();
        ModelMetadata {
            name: self.model_name.clone(),
            architecture: network.architecture().to_string(),
            dtype: dtype_name(self.kind).to_string(),
            device: format!("{:?}", self.device),
            context_length: network.context_length(),
            size_bytes: self.size_bytes,
        }
    }

    /// Samples a continuation and returns the prompt followed by it, the way
    /// the Hugging Face text-generation pipeline reports `generated_text`.
    fn sample_text(&self, prompt: &str, params: &SamplingParams) -> Result<String, LlmError> {
        tch::manual_seed(params.seed);

        let encoding = self.tokenizer.encode(prompt, true)?;
        let mut input_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        if input_ids.is_empty() {
            input_ids.push(self.fallback_token_id);
        }
        let prompt_token_len = input_ids.len();

        let network = self.network.lock();
        let limit = params.max_length.min(network.context_length());
        let budget = limit.saturating_sub(prompt_token_len);
        let start = Instant::now();

        no_grad(|| {
            for _ in 0..budget {
                let input = Tensor::from_slice(&input_ids)
                    .reshape([1, input_ids.len() as i64])
                    .to(self.device);
                let logits = network.forward(&input);
                let last_logits = logits.select(1, -1).squeeze_dim(0);
                let next_token_id = sample_next_token(&last_logits, params);
                input_ids.push(next_token_id);
                if self.eos_token_ids.contains(&next_token_id) {
                    break;
                }
            }
        });
        drop(network);

        let tokens_generated = input_ids.len() - prompt_token_len;
        debug!(
            prompt_tokens = prompt_token_len,
            tokens_generated,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "sampling finished"
        );

        let all_ids: Vec<u32> = input_ids.iter().map(|&id| id as u32).collect();
        let full_text = self.tokenizer.decode(&all_ids, true)?;
        let prompt_text = self.tokenizer.decode(&all_ids[..prompt_token_len], true)?;
        let continuation = full_text.get(prompt_text.len()..).unwrap_or_default();
        Ok(format!("{prompt}{continuation}"))
    }
}

impl TextBackend for LoadedModel {
    fn generate_text(&self, prompt: &str, params: &SamplingParams) -> Result<String, LlmError> {
        // libtorch reports kernel failures by panicking; keep those on the
        // recoverable path.
        catch_unwind(AssertUnwindSafe(|| self.sample_text(prompt, params)))
            .map_err(|payload| LlmError::Inference(panic_message(payload.as_ref())))?
    }
}

fn build_network(
    model_config: &Value,
    weights: WeightMap,
    device: Device,
) -> Result<Box<dyn CausalLm>, LlmError> {
    let model_type = model_config
        .get("model_type")
        .and_then(Value::as_str)
        .ok_or_else(|| LlmError::Config("config.json has no model_type".into()))?;

    match model_type {
        "gpt2" => {
            let cfg: Gpt2Config = serde_json::from_value(model_config.clone())?;
            let weights = weights.with_alias_prefix("transformer.");
            Ok(Box::new(Gpt2::load(weights, &cfg, device)?))
        }
        "llama" => {
            let cfg: LlamaConfig = serde_json::from_value(model_config.clone())?;
            Ok(Box::new(Llama::load(weights, &cfg, device)?))
        }
        other => Err(LlmError::UnsupportedArchitecture(other.to_string())),
    }
}

/// Reads a token id field that may hold a single id or a list of ids.
fn token_ids(model_config: &Value, key: &str) -> Vec<i64> {
    match model_config.get(key) {
        Some(Value::Number(n)) => n.as_i64().into_iter().collect(),
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_i64).collect(),
        _ => Vec::new(),
    }
}

fn load_tokenizer(
    source: &ModelSource,
    eos_token_id: Option<i64>,
    context_length: usize,
) -> Result<Tokenizer, LlmError> {
    let mut tokenizer = match source.get_optional("tokenizer.json") {
        Some(path) => Tokenizer::from_file(path)?,
        None => byte_level_bpe(source)?,
    };

    if tokenizer.get_padding().is_none() {
        if let Some(eos) = eos_token_id {
            let pad_token = tokenizer.id_to_token(eos as u32).unwrap_or_default();
            debug!(%pad_token, pad_id = eos, "using eos token for padding");
            tokenizer.with_padding(Some(PaddingParams {
                direction: PaddingDirection::Left,
                pad_id: eos as u32,
                pad_token,
                ..Default::default()
            }));
        }
    }

    tokenizer.with_truncation(Some(TruncationParams {
        max_length: context_length,
        ..Default::default()
    }))?;
    Ok(tokenizer)
}

/// GPT-2 style repositories without `tokenizer.json` ship `vocab.json` and
/// `merges.txt` for a byte-level BPE.
fn byte_level_bpe(source: &ModelSource) -> Result<Tokenizer, LlmError> {
    let vocab = source.get("vocab.json")?;
    let merges = source.get("merges.txt")?;
    let bpe = BPE::from_file(&vocab.to_string_lossy(), &merges.to_string_lossy()).build()?;

    let mut tokenizer = Tokenizer::new(bpe);
    // GPT-2 does not prepend a space to the first word.
    let pre_tokenizer = PreTokenizerWrapper::ByteLevel(ByteLevel::new(false, true, true));
    let decoder = DecoderWrapper::ByteLevel(ByteLevel::default());
    tokenizer.with_pre_tokenizer(pre_tokenizer);
    tokenizer.with_decoder(decoder);
    tokenizer.add_special_tokens(&[AddedToken::from("<|endoftext|>", true)]);
    Ok(tokenizer)
}

fn dtype_name(kind: Kind) -> &'static str {
    match kind {
        Kind::Half => "float16",
        Kind::BFloat16 => "bfloat16",
        _ => "float32",
    }
}
