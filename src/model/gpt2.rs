use serde::Deserialize;
use tch::{Device, Kind, Tensor};

use crate::{
    error::LlmError,
    model::{CausalLm, causal_mask, weights::WeightMap},
};

#[derive(Debug, Clone, Deserialize)]
pub struct Gpt2Config {
    pub vocab_size: i64,
    pub n_positions: i64,
    pub n_embd: i64,
    pub n_layer: i64,
    pub n_head: i64,
    #[serde(default)]
    pub n_inner: Option<i64>,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
}

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    dim: i64,
    eps: f64,
}

impl LayerNorm {
    fn load(weights: &mut WeightMap, prefix: &str, dim: i64, eps: f64) -> Result<Self, LlmError> {
        Ok(Self {
            weight: weights.take(&format!("{prefix}.weight"), &[dim])?,
            bias: weights.take(&format!("{prefix}.bias"), &[dim])?,
            dim,
            eps,
        })
    }

    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.layer_norm(
            [self.dim],
            Some(&self.weight),
            Some(&self.bias),
            self.eps,
            true,
        )
    }
}

/// GPT-2 "Conv1D": weight stored as `[in, out]`.
struct Conv1D {
    weight: Tensor,
    bias: Tensor,
}

impl Conv1D {
    fn load(weights: &mut WeightMap, prefix: &str, nin: i64, nout: i64) -> Result<Self, LlmError> {
        Ok(Self {
            weight: weights.take(&format!("{prefix}.weight"), &[nin, nout])?,
            bias: weights.take(&format!("{prefix}.bias"), &[nout])?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.matmul(&self.weight) + &self.bias
    }
}

struct Block {
    ln_1: LayerNorm,
    c_attn: Conv1D,
    attn_proj: Conv1D,
    ln_2: LayerNorm,
    c_fc: Conv1D,
    mlp_proj: Conv1D,
    n_head: i64,
}

impl Block {
    fn load(weights: &mut WeightMap, idx: i64, cfg: &Gpt2Config) -> Result<Self, LlmError> {
        let p = format!("h.{idx}");
        let c = cfg.n_embd;
        let inner = cfg.n_inner.unwrap_or(4 * c);
        let eps = cfg.layer_norm_epsilon;
        Ok(Self {
            ln_1: LayerNorm::load(weights, &format!("{p}.ln_1"), c, eps)?,
            c_attn: Conv1D::load(weights, &format!("{p}.attn.c_attn"), c, 3 * c)?,
            attn_proj: Conv1D::load(weights, &format!("{p}.attn.c_proj"), c, c)?,
            ln_2: LayerNorm::load(weights, &format!("{p}.ln_2"), c, eps)?,
            c_fc: Conv1D::load(weights, &format!("{p}.mlp.c_fc"), c, inner)?,
            mlp_proj: Conv1D::load(weights, &format!("{p}.mlp.c_proj"), inner, c)?,
            n_head: cfg.n_head,
        })
    }

    fn attention(&self, xs: &Tensor, mask: &Tensor) -> Tensor {
        let size = xs.size();
        let (b, t, c) = (size[0], size[1], size[2]);
        let head_dim = c / self.n_head;
        let qkv = self.c_attn.forward(xs).split(c, -1);
        let heads = |x: &Tensor| x.view([b, t, self.n_head, head_dim]).transpose(1, 2);
        let (q, k, v) = (heads(&qkv[0]), heads(&qkv[1]), heads(&qkv[2]));

        let att = q.matmul(&k.transpose(-2, -1)) * (1.0 / (head_dim as f64).sqrt());
        let att = att
            .masked_fill(mask, f64::NEG_INFINITY)
            .softmax(-1, Kind::Float)
            .to_kind(v.kind());
        let ys = att
            .matmul(&v)
            .transpose(1, 2)
            .contiguous()
            .view([b, t, c]);
        self.attn_proj.forward(&ys)
    }

    fn forward(&self, xs: &Tensor, mask: &Tensor) -> Tensor {
        let xs = xs + self.attention(&self.ln_1.forward(xs), mask);
        let mlp = self
            .mlp_proj
            .forward(&self.c_fc.forward(&self.ln_2.forward(&xs)).gelu("tanh"));
        xs + mlp
    }
}

pub struct Gpt2 {
    wte: Tensor,
    wpe: Tensor,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    lm_head: Tensor,
    context_length: usize,
    device: Device,
}

impl Gpt2 {
    pub fn load(mut weights: WeightMap, cfg: &Gpt2Config, device: Device) -> Result<Self, LlmError> {
        if cfg.n_head <= 0 || cfg.n_embd % cfg.n_head != 0 {
            return Err(LlmError::Config(format!(
                "n_embd {} is not divisible by n_head {}",
                cfg.n_embd, cfg.n_head
            )));
        }
        let wte = weights.take("wte.weight", &[cfg.vocab_size, cfg.n_embd])?;
        let wpe = weights.take("wpe.weight", &[cfg.n_positions, cfg.n_embd])?;
        let blocks = (0..cfg.n_layer)
            .map(|idx| Block::load(&mut weights, idx, cfg))
            .collect::<Result<Vec<_>, _>>()?;
        let ln_f = LayerNorm::load(&mut weights, "ln_f", cfg.n_embd, cfg.layer_norm_epsilon)?;
        let lm_head = weights
            .take_optional("lm_head.weight", &[cfg.vocab_size, cfg.n_embd])?
            .unwrap_or_else(|| wte.shallow_clone());

        Ok(Self {
            wte,
            wpe,
            blocks,
            ln_f,
            lm_head,
            context_length: cfg.n_positions as usize,
            device,
        })
    }
}

impl CausalLm for Gpt2 {
    fn forward(&self, input_ids: &Tensor) -> Tensor {
        let size = input_ids.size();
        let (b, t) = (size[0], size[1]);
        let c = self.wte.size()[1];
        let positions = Tensor::arange(t, (Kind::Int64, self.device));
        let tokens = self.wte.index_select(0, &input_ids.view([-1])).view([b, t, c]);
        let mut xs = tokens + self.wpe.index_select(0, &positions);

        let mask = causal_mask(t, self.device);
        for block in &self.blocks {
            xs = block.forward(&xs, &mask);
        }
        self.ln_f.forward(&xs).matmul(&self.lm_head.tr())
    }

    fn context_length(&self) -> usize {
        self.context_length
    }

    fn architecture(&self) -> &'static str {
        "gpt2"
    }
}
