// Configuration for the conditioning stage, the diffusion backbone and fine-tuning.
//
// Everything is serde so it can come from JSON; presets follow the
// default() / tiny() pattern used across the crate. The backbone config is
// loaded once per orchestrator and only `use_time_cond` / `global_pool` are
// overridden before the backbone is built.

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::EldmError;

/// Token count the channel mapper remaps encoder sequences to.
pub const TARGET_TOKENS: usize = 77;

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
}

// ---------------------------------------------------------------------------
// Signal encoders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderKind {
    /// Patch-based transformer over the raw signal.
    Patch,
    /// Strided convolutions followed by a transformer contextualizer.
    ConvContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchEncoderConfig {
    pub time_len: usize,
    pub in_chans: usize,
    pub patch_size: usize,
    pub embed_dim: usize,
    pub depth: usize,
    pub num_heads: usize,
    pub mlp_ratio: f64,
}

impl Default for PatchEncoderConfig {
    fn default() -> Self {
        Self {
            time_len: 512,
            in_chans: 128,
            patch_size: 4,
            embed_dim: 1024,
            depth: 24,
            num_heads: 16,
            mlp_ratio: 1.0,
        }
    }
}

impl PatchEncoderConfig {
    /// Small config for tests.
    pub fn tiny() -> Self {
        Self {
            time_len: 32,
            in_chans: 4,
            patch_size: 4,
            embed_dim: 32,
            depth: 1,
            num_heads: 2,
            mlp_ratio: 2.0,
        }
    }

    pub fn num_patches(&self) -> usize {
        self.time_len / self.patch_size
    }

    pub fn d_ff(&self) -> usize {
        ((self.embed_dim as f64) * self.mlp_ratio).round() as usize
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvEncoderConfig {
    pub in_features: usize,
    pub encoder_h: usize,
    /// Kernel widths per block. Even widths are bumped to the next odd value.
    pub enc_width: Vec<usize>,
    pub enc_downsample: Vec<usize>,
    /// Signal length in samples.
    pub samples: usize,
    pub context_layers: usize,
    pub context_heads: usize,
    pub context_ff: usize,
}

impl Default for ConvEncoderConfig {
    /// 888 samples through strides 3, 2, 2 gives 74 steps; with the start
    /// token that is 75 x 1536.
    fn default() -> Self {
        Self {
            in_features: 128,
            encoder_h: 512,
            enc_width: vec![3, 2, 2],
            enc_downsample: vec![3, 2, 2],
            samples: 888,
            context_layers: 8,
            context_heads: 8,
            context_ff: 3076,
        }
    }
}

impl ConvEncoderConfig {
    pub fn tiny() -> Self {
        Self {
            in_features: 4,
            encoder_h: 16,
            enc_width: vec![3, 2],
            enc_downsample: vec![2, 2],
            samples: 32,
            context_layers: 1,
            context_heads: 2,
            context_ff: 64,
        }
    }

    /// Length after the strided convolutions (each block is a ceil division).
    pub fn encoded_len(&self) -> usize {
        self.enc_downsample
            .iter()
            .fold(self.samples, |len, &s| len.div_ceil(s.max(1)))
    }

    /// Output sequence length, start token included.
    pub fn seq_len(&self) -> usize {
        self.encoded_len() + 1
    }

    pub fn latent_dim(&self) -> usize {
        3 * self.encoder_h
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EncoderConfig {
    Patch(PatchEncoderConfig),
    ConvContext(ConvEncoderConfig),
}

impl EncoderConfig {
    pub fn kind(&self) -> EncoderKind {
        match self {
            Self::Patch(_) => EncoderKind::Patch,
            Self::ConvContext(_) => EncoderKind::ConvContext,
        }
    }
}

// ---------------------------------------------------------------------------
// Conditioning stage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CondStageConfig {
    pub encoder: EncoderConfig,
    pub global_pool: bool,
    pub clip_tune: bool,
    pub cls_tune: bool,
    /// Width of the shared image embedding space.
    pub clip_dim: usize,
    pub num_classes: usize,
}

impl Default for CondStageConfig {
    fn default() -> Self {
        Self {
            encoder: EncoderConfig::ConvContext(ConvEncoderConfig::default()),
            global_pool: false,
            clip_tune: true,
            cls_tune: false,
            clip_dim: 768,
            num_classes: 40,
        }
    }
}

impl CondStageConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        read_json(path)
    }

    pub fn tiny(encoder: EncoderConfig) -> Self {
        Self {
            encoder,
            global_pool: false,
            clip_tune: true,
            cls_tune: true,
            clip_dim: 8,
            num_classes: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Backbone
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnetParams {
    pub block_out_channels: Vec<usize>,
    /// The first `cross_attention_blocks` down/up blocks carry cross-attention.
    pub cross_attention_blocks: usize,
    pub attention_head_dim: usize,
    pub layers_per_block: usize,
    pub norm_num_groups: usize,
    pub norm_eps: f64,
    pub use_linear_projection: bool,
    pub sliced_attention_size: Option<usize>,
}

impl Default for UnetParams {
    fn default() -> Self {
        Self {
            block_out_channels: vec![320, 640, 1280, 1280],
            cross_attention_blocks: 3,
            attention_head_dim: 8,
            layers_per_block: 2,
            norm_num_groups: 32,
            norm_eps: 1e-5,
            use_linear_projection: false,
            sliced_attention_size: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirstStageParams {
    pub base_channels: usize,
    pub ch_mult: Vec<usize>,
    pub layers_per_block: usize,
    pub norm_num_groups: usize,
}

impl Default for FirstStageParams {
    fn default() -> Self {
        Self {
            base_channels: 128,
            ch_mult: vec![1, 2, 4, 4],
            layers_per_block: 2,
            norm_num_groups: 32,
        }
    }
}

impl FirstStageParams {
    pub fn block_out_channels(&self) -> Vec<usize> {
        self.ch_mult.iter().map(|m| m * self.base_channels).collect()
    }
}

/// Backbone configuration, paired with the backbone checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LdmConfig {
    /// Latent channels.
    pub channels: usize,
    /// Latent spatial size.
    pub image_size: usize,
    pub context_dim: usize,
    pub scale_factor: f64,
    pub num_timesteps: usize,
    pub use_time_cond: bool,
    pub global_pool: bool,
    pub use_ema: bool,
    pub ema_decay: f64,
    pub unet: UnetParams,
    pub first_stage: FirstStageParams,
}

impl Default for LdmConfig {
    fn default() -> Self {
        Self {
            channels: 4,
            image_size: 64,
            context_dim: 768,
            scale_factor: 0.18215,
            num_timesteps: 1000,
            use_time_cond: false,
            global_pool: false,
            use_ema: true,
            ema_decay: 0.9999,
            unet: UnetParams::default(),
            first_stage: FirstStageParams::default(),
        }
    }
}

impl LdmConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let cfg: Self = read_json(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Two-level UNet and VAE small enough for CPU tests (8x8 latents,
    /// 16x16 pixels).
    pub fn tiny() -> Self {
        Self {
            channels: 4,
            image_size: 8,
            context_dim: 16,
            num_timesteps: 1000,
            use_ema: true,
            unet: UnetParams {
                block_out_channels: vec![32, 64],
                cross_attention_blocks: 1,
                attention_head_dim: 8,
                layers_per_block: 1,
                ..UnetParams::default()
            },
            first_stage: FirstStageParams {
                base_channels: 32,
                ch_mult: vec![1, 2],
                layers_per_block: 1,
                norm_num_groups: 32,
            },
            ..Self::default()
        }
    }

    /// Returns a copy with the two fields callers may override before
    /// instantiation.
    pub fn with_overrides(mut self, use_time_cond: bool, global_pool: bool) -> Self {
        self.use_time_cond = use_time_cond;
        self.global_pool = global_pool;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.first_stage.ch_mult.is_empty() {
            return Err(EldmError::InvalidConfig("first_stage.ch_mult is empty".into()).into());
        }
        if self.unet.block_out_channels.is_empty() {
            return Err(
                EldmError::InvalidConfig("unet.block_out_channels is empty".into()).into(),
            );
        }
        if self.context_dim == 0 || self.channels == 0 {
            return Err(EldmError::InvalidConfig(
                "context_dim and channels must be positive".into(),
            )
            .into());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// Backbone file locations. Defaults are the conventional pretrain layout;
/// every path can be overridden.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EldmPaths {
    pub backbone_config: PathBuf,
    pub unet_weights: PathBuf,
    pub vae_weights: PathBuf,
}

impl Default for EldmPaths {
    fn default() -> Self {
        let root = PathBuf::from("pretrains/models");
        Self {
            backbone_config: root.join("config15.json"),
            unet_weights: root.join("v1-5-unet.safetensors"),
            vae_weights: root.join("v1-5-vae.safetensors"),
        }
    }
}

// ---------------------------------------------------------------------------
// Fine-tuning
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinetuneConfig {
    pub batch_size: usize,
    pub lr: f64,
    pub min_lr: f64,
    pub weight_decay: f64,
    pub warmup_fraction: f64,
    pub num_epochs: usize,
    pub val_every_epochs: usize,
    /// Train the conditioning module plus the denoiser's cross-attention only.
    pub train_cond_stage_only: bool,
    pub clip_weight: f64,
    pub cls_weight: f64,
    pub use_ema: bool,
    pub shuffle: bool,
    pub seed: u64,
    /// 0.0 disables threshold stopping.
    pub early_stop_threshold: f32,
    pub early_stop_patience: usize,
    /// Also stop when validation loss has not improved for
    /// `early_stop_patience` checks.
    pub early_stop_on_plateau: bool,
}

impl Default for FinetuneConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            lr: 5.3e-5,
            min_lr: 1e-6,
            weight_decay: 0.01,
            warmup_fraction: 0.0,
            num_epochs: 500,
            val_every_epochs: 2,
            train_cond_stage_only: true,
            clip_weight: 1.0,
            cls_weight: 1.0,
            use_ema: true,
            shuffle: true,
            seed: 2022,
            early_stop_threshold: 0.0,
            early_stop_patience: 10,
            early_stop_on_plateau: false,
        }
    }
}

impl FinetuneConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        read_json(path)
    }

    pub fn tiny() -> Self {
        Self {
            batch_size: 2,
            lr: 1e-3,
            num_epochs: 2,
            val_every_epochs: 1,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conv_default_shape_constants() {
        let cfg = ConvEncoderConfig::default();
        assert_eq!(cfg.encoded_len(), 74);
        assert_eq!(cfg.seq_len(), 75);
        assert_eq!(cfg.latent_dim(), 1536);
    }

    #[test]
    fn test_patch_derived_constants() {
        let cfg = PatchEncoderConfig::default();
        assert_eq!(cfg.num_patches(), 128);
        assert_eq!(cfg.d_ff(), 1024);
    }

    #[test]
    fn test_partial_ldm_config_fills_defaults() -> Result<()> {
        let cfg: LdmConfig = serde_json::from_str(r#"{"context_dim": 16, "channels": 4}"#)?;
        assert_eq!(cfg.context_dim, 16);
        assert_eq!(cfg.first_stage.ch_mult, vec![1, 2, 4, 4]);
        assert_eq!(cfg.scale_factor, 0.18215);
        cfg.validate()?;
        Ok(())
    }

    #[test]
    fn test_overrides_only_touch_two_fields() {
        let base = LdmConfig::default();
        let cfg = base.clone().with_overrides(true, true);
        assert!(cfg.use_time_cond);
        assert!(cfg.global_pool);
        assert_eq!(cfg.context_dim, base.context_dim);
        assert_eq!(cfg.unet, base.unet);
    }

    #[test]
    fn test_empty_ch_mult_rejected() {
        let mut cfg = LdmConfig::default();
        cfg.first_stage.ch_mult.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_encoder_config_tagged_json() -> Result<()> {
        let json = r#"{"kind": "patch", "time_len": 64, "in_chans": 8, "patch_size": 8,
                       "embed_dim": 16, "depth": 1, "num_heads": 2, "mlp_ratio": 1.0}"#;
        let cfg: EncoderConfig = serde_json::from_str(json)?;
        assert_eq!(cfg.kind(), EncoderKind::Patch);
        match cfg {
            EncoderConfig::Patch(p) => assert_eq!(p.num_patches(), 8),
            EncoderConfig::ConvContext(_) => panic!("wrong variant"),
        }
        Ok(())
    }
}
