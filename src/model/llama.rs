use serde::Deserialize;
use tch::{Device, Kind, Tensor};

use crate::{
    error::LlmError,
    model::{CausalLm, causal_mask, weights::WeightMap},
};

#[derive(Debug, Clone, Deserialize)]
pub struct LlamaConfig {
    pub vocab_size: i64,
    pub hidden_size: i64,
    pub intermediate_size: i64,
    pub num_hidden_layers: i64,
    pub num_attention_heads: i64,
    #[serde(default)]
    pub num_key_value_heads: Option<i64>,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: i64,
    #[serde(default)]
    pub tie_word_embeddings: bool,
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn default_max_position_embeddings() -> i64 {
    2048
}

impl LlamaConfig {
    fn kv_heads(&self) -> i64 {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    fn head_dim(&self) -> i64 {
        self.hidden_size / self.num_attention_heads
    }
}

struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    fn load(weights: &mut WeightMap, name: &str, dim: i64, eps: f64) -> Result<Self, LlmError> {
        Ok(Self {
            weight: weights.take(name, &[dim])?,
            eps,
        })
    }

    fn forward(&self, xs: &Tensor) -> Tensor {
        let xs_f = xs.to_kind(Kind::Float);
        let variance = (&xs_f * &xs_f).mean_dim(-1, true, Kind::Float);
        let normed = xs_f * (variance + self.eps).rsqrt();
        normed.to_kind(xs.kind()) * &self.weight
    }
}

/// Linear layer without bias, weight stored as `[out, in]`.
fn linear(xs: &Tensor, weight: &Tensor) -> Tensor {
    xs.matmul(&weight.tr())
}

struct Attention {
    q_proj: Tensor,
    k_proj: Tensor,
    v_proj: Tensor,
    o_proj: Tensor,
    n_head: i64,
    n_kv_head: i64,
    head_dim: i64,
}

impl Attention {
    fn forward(&self, xs: &Tensor, rope: &Rope, mask: &Tensor) -> Tensor {
        let size = xs.size();
        let (b, t, c) = (size[0], size[1], size[2]);
        let split = |w: &Tensor, heads: i64| {
            linear(xs, w)
                .view([b, t, heads, self.head_dim])
                .transpose(1, 2)
        };
        let q = rope.apply(&split(&self.q_proj, self.n_head));
        let k = rope.apply(&split(&self.k_proj, self.n_kv_head));
        let v = split(&self.v_proj, self.n_kv_head);

        let n_rep = self.n_head / self.n_kv_head;
        let (k, v) = (repeat_kv(k, n_rep), repeat_kv(v, n_rep));

        let att = q.matmul(&k.transpose(-2, -1)) * (1.0 / (self.head_dim as f64).sqrt());
        let att = att
            .masked_fill(mask, f64::NEG_INFINITY)
            .softmax(-1, Kind::Float)
            .to_kind(v.kind());
        let ys = att
            .matmul(&v)
            .transpose(1, 2)
            .contiguous()
            .view([b, t, c]);
        linear(&ys, &self.o_proj)
    }
}

fn repeat_kv(xs: Tensor, n_rep: i64) -> Tensor {
    if n_rep == 1 {
        return xs;
    }
    let size = xs.size();
    let (b, h, t, d) = (size[0], size[1], size[2], size[3]);
    xs.unsqueeze(2)
        .expand([b, h, n_rep, t, d], false)
        .reshape([b, h * n_rep, t, d])
}

struct Mlp {
    gate_proj: Tensor,
    up_proj: Tensor,
    down_proj: Tensor,
}

impl Mlp {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let gated = linear(xs, &self.gate_proj).silu() * linear(xs, &self.up_proj);
        linear(&gated, &self.down_proj)
    }
}

struct Layer {
    input_layernorm: RmsNorm,
    self_attn: Attention,
    post_attention_layernorm: RmsNorm,
    mlp: Mlp,
}

impl Layer {
    fn load(weights: &mut WeightMap, idx: i64, cfg: &LlamaConfig) -> Result<Self, LlmError> {
        let p = format!("model.layers.{idx}");
        let c = cfg.hidden_size;
        let d = cfg.head_dim();
        let kv = cfg.kv_heads() * d;
        let i = cfg.intermediate_size;
        let eps = cfg.rms_norm_eps;
        Ok(Self {
            input_layernorm: RmsNorm::load(weights, &format!("{p}.input_layernorm.weight"), c, eps)?,
            self_attn: Attention {
                q_proj: weights.take(&format!("{p}.self_attn.q_proj.weight"), &[c, c])?,
                k_proj: weights.take(&format!("{p}.self_attn.k_proj.weight"), &[kv, c])?,
                v_proj: weights.take(&format!("{p}.self_attn.v_proj.weight"), &[kv, c])?,
                o_proj: weights.take(&format!("{p}.self_attn.o_proj.weight"), &[c, c])?,
                n_head: cfg.num_attention_heads,
                n_kv_head: cfg.kv_heads(),
                head_dim: d,
            },
            post_attention_layernorm: RmsNorm::load(
                weights,
                &format!("{p}.post_attention_layernorm.weight"),
                c,
                eps,
            )?,
            mlp: Mlp {
                gate_proj: weights.take(&format!("{p}.mlp.gate_proj.weight"), &[i, c])?,
                up_proj: weights.take(&format!("{p}.mlp.up_proj.weight"), &[i, c])?,
                down_proj: weights.take(&format!("{p}.mlp.down_proj.weight"), &[c, i])?,
            },
        })
    }

    fn forward(&self, xs: &Tensor, rope: &Rope, mask: &Tensor) -> Tensor {
        let xs = xs + self
            .self_attn
            .forward(&self.input_layernorm.forward(xs), rope, mask);
        let mlp = self.mlp.forward(&self.post_attention_layernorm.forward(&xs));
        xs + mlp
    }
}

/// Rotary position tables for one sequence length.
struct Rope {
    cos: Tensor,
    sin: Tensor,
}

impl Rope {
    fn new(inv_freq: &Tensor, t: i64, kind: Kind, device: Device) -> Self {
        let positions = Tensor::arange(t, (Kind::Float, device)).unsqueeze(1);
        let freqs = positions * inv_freq.unsqueeze(0);
        let emb = Tensor::cat(&[&freqs, &freqs], -1);
        Self {
            cos: emb.cos().to_kind(kind),
            sin: emb.sin().to_kind(kind),
        }
    }

    fn apply(&self, xs: &Tensor) -> Tensor {
        let half = xs.size()[3] / 2;
        let x1 = xs.narrow(-1, 0, half);
        let x2 = xs.narrow(-1, half, half);
        let rotated = Tensor::cat(&[-x2, x1], -1);
        xs * &self.cos + rotated * &self.sin
    }
}

pub struct Llama {
    embed_tokens: Tensor,
    layers: Vec<Layer>,
    norm: RmsNorm,
    lm_head: Tensor,
    inv_freq: Tensor,
    context_length: usize,
    device: Device,
}

impl Llama {
    pub fn load(mut weights: WeightMap, cfg: &LlamaConfig, device: Device) -> Result<Self, LlmError> {
        let heads = cfg.num_attention_heads;
        if heads <= 0 || cfg.hidden_size % heads != 0 {
            return Err(LlmError::Config(format!(
                "hidden_size {} is not divisible by num_attention_heads {heads}",
                cfg.hidden_size
            )));
        }
        if cfg.kv_heads() <= 0 || heads % cfg.kv_heads() != 0 {
            return Err(LlmError::Config(format!(
                "num_attention_heads {heads} is not a multiple of num_key_value_heads {}",
                cfg.kv_heads()
            )));
        }

        let c = cfg.hidden_size;
        let embed_tokens = weights.take("model.embed_tokens.weight", &[cfg.vocab_size, c])?;
        let layers = (0..cfg.num_hidden_layers)
            .map(|idx| Layer::load(&mut weights, idx, cfg))
            .collect::<Result<Vec<_>, _>>()?;
        let norm = RmsNorm::load(&mut weights, "model.norm.weight", c, cfg.rms_norm_eps)?;
        let lm_head = match weights.take_optional("lm_head.weight", &[cfg.vocab_size, c])? {
            Some(head) => head,
            None if cfg.tie_word_embeddings => embed_tokens.shallow_clone(),
            None => return Err(LlmError::Weights("missing tensor `lm_head.weight`".into())),
        };

        let head_dim = cfg.head_dim();
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| (1.0 / cfg.rope_theta.powf(i as f64 / head_dim as f64)) as f32)
            .collect();

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            inv_freq: Tensor::from_slice(&inv_freq).to_device(device),
            context_length: cfg.max_position_embeddings as usize,
            device,
        })
    }
}

impl CausalLm for Llama {
    fn forward(&self, input_ids: &Tensor) -> Tensor {
        let size = input_ids.size();
        let (b, t) = (size[0], size[1]);
        let c = self.embed_tokens.size()[1];
        let mut xs = self
            .embed_tokens
            .index_select(0, &input_ids.view([-1]))
            .view([b, t, c]);

        let rope = Rope::new(&self.inv_freq, t, xs.kind(), self.device);
        let mask = causal_mask(t, self.device);
        for layer in &self.layers {
            xs = layer.forward(&xs, &rope, &mask);
        }
        linear(&self.norm.forward(&xs), &self.lm_head)
    }

    fn context_length(&self) -> usize {
        self.context_length
    }

    fn architecture(&self) -> &'static str {
        "llama"
    }
}
