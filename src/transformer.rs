// Bidirectional transformer blocks shared by both signal encoders.
//
// Pre-norm blocks: layer norm -> multi-head self-attention with RoPE ->
// residual, layer norm -> GELU MLP -> residual. No causal mask: every token
// sees the whole signal window.

use anyhow::Result;
use candle_core::{Device, Module, Tensor, D};
use candle_nn::{linear, linear_no_bias, Linear, VarBuilder};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Layer norm written out in tensor ops so its backward pass is exact
// ---------------------------------------------------------------------------

pub struct GradLayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl GradLayerNorm {
    pub fn new(d_model: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(d_model, "weight", candle_nn::Init::Const(1.0))?;
        let bias = vb.get_with_hints(d_model, "bias", candle_nn::Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let centered = x.broadcast_sub(&x.mean_keepdim(D::Minus1)?)?;
        let std = (centered.sqr()?.mean_keepdim(D::Minus1)? + self.eps)?.sqrt()?;
        centered
            .broadcast_div(&std)?
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
            .map_err(Into::into)
    }
}

fn grad_softmax_last_dim(x: &Tensor) -> Result<Tensor> {
    let max = x.max_keepdim(D::Minus1)?;
    let shifted = x.broadcast_sub(&max)?;
    let exp = shifted.exp()?;
    let sum = exp.sum_keepdim(D::Minus1)?;
    exp.broadcast_div(&sum).map_err(Into::into)
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformerConfig {
    pub d_model: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub d_ff: usize,
    pub max_seq_len: usize,
}

impl TransformerConfig {
    pub fn tiny() -> Self {
        Self {
            d_model: 16,
            n_layers: 1,
            n_heads: 2,
            d_ff: 32,
            max_seq_len: 12,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.d_model / self.n_heads
    }
}

// ---------------------------------------------------------------------------
// RoPE
// ---------------------------------------------------------------------------

fn precompute_rope(seq_len: usize, head_dim: usize, device: &Device) -> Result<(Tensor, Tensor)> {
    let half = head_dim / 2;
    let theta: Vec<f32> = (0..half)
        .map(|i| 1.0f32 / 10000f32.powf(2.0 * i as f32 / head_dim as f32))
        .collect();
    let theta = Tensor::new(theta, device)?;
    let positions: Vec<f32> = (0..seq_len).map(|p| p as f32).collect();
    let positions = Tensor::new(positions, device)?;
    let freqs = positions.unsqueeze(1)?.matmul(&theta.unsqueeze(0)?)?;
    Ok((freqs.cos()?, freqs.sin()?))
}

fn apply_rope(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    // x: (batch, heads, seq, head_dim)
    let half = x.dim(D::Minus1)? / 2;
    let x1 = x.narrow(D::Minus1, 0, half)?;
    let x2 = x.narrow(D::Minus1, half, half)?;

    let seq_len = x.dim(2)?;
    let cos = cos.narrow(0, 0, seq_len)?.unsqueeze(0)?.unsqueeze(0)?;
    let sin = sin.narrow(0, 0, seq_len)?.unsqueeze(0)?.unsqueeze(0)?;

    let rotated_x1 = (x1.broadcast_mul(&cos)? - x2.broadcast_mul(&sin)?)?;
    let rotated_x2 = (x2.broadcast_mul(&cos)? + x1.broadcast_mul(&sin)?)?;
    Tensor::cat(&[rotated_x1, rotated_x2], D::Minus1).map_err(Into::into)
}

// ---------------------------------------------------------------------------
// Attention
// ---------------------------------------------------------------------------

struct Attention {
    qkv: Linear,
    proj: Linear,
    n_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn new(cfg: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        let d = cfg.d_model;
        Ok(Self {
            qkv: linear_no_bias(d, 3 * d, vb.pp("qkv"))?,
            proj: linear(d, d, vb.pp("proj"))?,
            n_heads: cfg.n_heads,
            head_dim: cfg.head_dim(),
        })
    }

    fn split_heads(&self, t: &Tensor, b: usize, s: usize) -> Result<Tensor> {
        t.reshape((b, s, self.n_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
            .map_err(Into::into)
    }

    fn forward(&self, x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let (b, s, d) = x.dims3()?;
        let qkv = self.qkv.forward(x)?;
        let q = self.split_heads(&qkv.narrow(D::Minus1, 0, d)?, b, s)?;
        let k = self.split_heads(&qkv.narrow(D::Minus1, d, d)?, b, s)?;
        let v = self.split_heads(&qkv.narrow(D::Minus1, 2 * d, d)?, b, s)?;

        let q = apply_rope(&q, cos, sin)?;
        let k = apply_rope(&k, cos, sin)?;

        let scale = (self.head_dim as f64).sqrt();
        let attn = (q.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)? / scale)?;
        let attn = grad_softmax_last_dim(&attn)?;

        let out = attn.matmul(&v)?;
        let out = out.transpose(1, 2)?.reshape((b, s, d))?;
        self.proj.forward(&out).map_err(Into::into)
    }
}

struct Mlp {
    fc1: Linear,
    fc2: Linear,
}

impl Mlp {
    fn new(d_model: usize, d_ff: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: linear(d_model, d_ff, vb.pp("fc1"))?,
            fc2: linear(d_ff, d_model, vb.pp("fc2"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.fc1.forward(x)?.gelu()?;
        self.fc2.forward(&h).map_err(Into::into)
    }
}

struct Block {
    norm1: GradLayerNorm,
    attn: Attention,
    norm2: GradLayerNorm,
    mlp: Mlp,
}

impl Block {
    fn new(cfg: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm1: GradLayerNorm::new(cfg.d_model, 1e-6, vb.pp("norm1"))?,
            attn: Attention::new(cfg, vb.pp("attn"))?,
            norm2: GradLayerNorm::new(cfg.d_model, 1e-6, vb.pp("norm2"))?,
            mlp: Mlp::new(cfg.d_model, cfg.d_ff, vb.pp("mlp"))?,
        })
    }

    fn forward(&self, x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let h = self.attn.forward(&self.norm1.forward(x)?, cos, sin)?;
        let x = (x + h)?;
        let h = self.mlp.forward(&self.norm2.forward(&x)?)?;
        (x + h).map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// TransformerStack
// ---------------------------------------------------------------------------

/// `n_layers` blocks plus a final norm over `(batch, seq, d_model)` inputs.
pub struct TransformerStack {
    pub config: TransformerConfig,
    blocks: Vec<Block>,
    norm: GradLayerNorm,
    rope_cos: Tensor,
    rope_sin: Tensor,
}

impl TransformerStack {
    pub fn new(cfg: TransformerConfig, vb: VarBuilder) -> Result<Self> {
        let mut blocks = Vec::with_capacity(cfg.n_layers);
        for i in 0..cfg.n_layers {
            blocks.push(Block::new(&cfg, vb.pp(format!("blocks.{i}")))?);
        }
        let norm = GradLayerNorm::new(cfg.d_model, 1e-6, vb.pp("norm"))?;
        let (rope_cos, rope_sin) = precompute_rope(cfg.max_seq_len, cfg.head_dim(), vb.device())?;
        Ok(Self {
            config: cfg,
            blocks,
            norm,
            rope_cos,
            rope_sin,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = x.clone();
        for block in &self.blocks {
            x = block.forward(&x, &self.rope_cos, &self.rope_sin)?;
        }
        self.norm.forward(&x)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::VarMap;

    fn stack(varmap: &VarMap) -> Result<TransformerStack> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        TransformerStack::new(TransformerConfig::tiny(), vb)
    }

    #[test]
    fn test_forward_shapes() -> Result<()> {
        let varmap = VarMap::new();
        let model = stack(&varmap)?;
        let x = Tensor::randn(0f32, 1.0, (2, 7, 16), &Device::Cpu)?;
        assert_eq!(model.forward(&x)?.dims3()?, (2, 7, 16));
        Ok(())
    }

    #[test]
    fn test_rope_positions() -> Result<()> {
        let (cos, sin) = precompute_rope(4, 8, &Device::Cpu)?;
        assert_eq!(cos.dims2()?, (4, 4));
        for &v in &cos.get(0)?.to_vec1::<f32>()? {
            assert!((v - 1.0).abs() < 1e-5, "cos(0) should be 1.0, got {v}");
        }
        for &v in &sin.get(0)?.to_vec1::<f32>()? {
            assert!(v.abs() < 1e-5, "sin(0) should be 0.0, got {v}");
        }
        Ok(())
    }

    #[test]
    fn test_attention_is_bidirectional() -> Result<()> {
        // Changing the last token must change the first token's output.
        let varmap = VarMap::new();
        let model = stack(&varmap)?;
        let x = Tensor::randn(0f32, 1.0, (1, 5, 16), &Device::Cpu)?;
        let last = Tensor::randn(0f32, 1.0, (1, 1, 16), &Device::Cpu)?;
        let y = Tensor::cat(&[x.narrow(1, 0, 4)?, last], 1)?;

        let a = model.forward(&x)?.narrow(1, 0, 1)?;
        let b = model.forward(&y)?.narrow(1, 0, 1)?;
        let diff = (a - b)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(diff > 1e-6, "first token ignored later tokens (diff={diff})");
        Ok(())
    }

    #[test]
    fn test_backward_reaches_all_vars() -> Result<()> {
        let varmap = VarMap::new();
        let model = stack(&varmap)?;
        let x = Tensor::randn(0f32, 1.0, (2, 6, 16), &Device::Cpu)?;
        let loss = model.forward(&x)?.sqr()?.mean_all()?;
        let grads = loss.backward()?;
        for var in varmap.all_vars() {
            let g = grads.get(var.as_tensor());
            assert!(g.is_some(), "var without gradient");
            if let Some(g) = g {
                let max_val = g.abs()?.max_all()?.to_scalar::<f32>()?;
                assert!(max_val.is_finite(), "non-finite gradient detected");
            }
        }
        Ok(())
    }
}
