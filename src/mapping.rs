// Heads on the raw encoder latent and the pairwise contrastive loss.
//
// Both heads pool the token axis with a 1x1 conv (tokens as channels) and then
// project the latent dimension: into the shared image-embedding space for the
// mapping head, into class logits for the classification head.

use anyhow::Result;
use candle_core::{Module, Tensor, D};
use candle_nn::{conv1d, linear, Conv1d, Conv1dConfig, Linear, VarBuilder};

struct TokenPoolProjection {
    pool: Conv1d,
    fc: Linear,
}

impl TokenPoolProjection {
    fn new(seq_len: usize, latent_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            pool: conv1d(seq_len, 1, 1, Conv1dConfig::default(), vb.pp("pool"))?,
            fc: linear(latent_dim, out_dim, vb.pp("fc"))?,
        })
    }

    /// (B, seq_len, latent_dim) -> (B, out_dim)
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let pooled = self.pool.forward(x)?.squeeze(1)?;
        self.fc.forward(&pooled).map_err(Into::into)
    }
}

/// Projects the raw latent into the image-embedding space.
pub struct MappingHead(TokenPoolProjection);

impl MappingHead {
    pub fn new(seq_len: usize, latent_dim: usize, clip_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self(TokenPoolProjection::new(seq_len, latent_dim, clip_dim, vb)?))
    }

    pub fn forward(&self, raw_latent: &Tensor) -> Result<Tensor> {
        self.0.forward(raw_latent)
    }
}

/// Auxiliary classifier over the raw latent.
pub struct ClassifyHead(TokenPoolProjection);

impl ClassifyHead {
    pub fn new(seq_len: usize, latent_dim: usize, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self(TokenPoolProjection::new(seq_len, latent_dim, num_classes, vb)?))
    }

    pub fn forward(&self, raw_latent: &Tensor) -> Result<Tensor> {
        self.0.forward(raw_latent)
    }
}

/// Cosine similarity along the last dim: a.b / max(|a||b|, 1e-8).
pub fn cosine_similarity(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let dot = (a * b)?.sum(D::Minus1)?;
    let na = a.sqr()?.sum(D::Minus1)?.sqrt()?;
    let nb = b.sqr()?.sum(D::Minus1)?.sqrt()?;
    let denom = (na * nb)?.maximum(1e-8)?;
    (dot / denom).map_err(Into::into)
}

/// `1 - mean(cos(mapped_i, image_i))` over matched pairs only. An image
/// embedding with batch 1 is broadcast over the mapped batch.
pub fn contrastive_loss(mapped: &Tensor, image_embeds: &Tensor) -> Result<Tensor> {
    let image_embeds = if image_embeds.dims() != mapped.dims() {
        image_embeds.broadcast_as(mapped.shape())?.contiguous()?
    } else {
        image_embeds.clone()
    };
    let cos = cosine_similarity(mapped, &image_embeds)?;
    cos.mean_all()?.affine(-1.0, 1.0).map_err(Into::into)
}
