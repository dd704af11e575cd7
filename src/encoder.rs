// Signal encoders: raw brain signal (B, C, T) -> latent sequence.
//
//   PatchEncoder:       conv1d patch embedding -> transformer -> (B, N, D)
//                       (or (B, 1, D) with global pooling)
//   ConvContextEncoder: strided conv blocks -> contextualizer with start token
//                       -> (L + 1, B, 3h), sequence-first
//
// Both build their variables through the VarBuilder they are given. Pretrained
// weights are applied afterwards through `weights::WeightFile`, so parsing,
// device placement and assignment stay separate steps.

use anyhow::Result;
use candle_core::{Device, Module, Tensor};
use candle_nn::{conv1d, group_norm, linear, Conv1d, Conv1dConfig, GroupNorm, Linear, VarBuilder, VarMap};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::{ConvEncoderConfig, EncoderConfig, EncoderKind, PatchEncoderConfig};
use crate::error::EldmError;
use crate::transformer::{TransformerConfig, TransformerStack};
use crate::weights::{LoadMode, LoadReport, WeightFile};

fn expect_dims(x: &Tensor, expected: &[usize], what: &str) -> Result<()> {
    if x.dims() != expected {
        return Err(EldmError::ShapeMismatch {
            key: what.to_string(),
            expected: expected.to_vec(),
            got: x.dims().to_vec(),
        }
        .into());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Variant A: patch transformer
// ---------------------------------------------------------------------------

pub struct PatchEncoder {
    pub config: PatchEncoderConfig,
    patch_embed: Conv1d,
    transformer: TransformerStack,
    global_pool: bool,
}

impl PatchEncoder {
    pub fn new(cfg: PatchEncoderConfig, global_pool: bool, vb: VarBuilder) -> Result<Self> {
        if cfg.patch_size == 0 || cfg.time_len % cfg.patch_size != 0 {
            return Err(EldmError::InvalidConfig(format!(
                "time_len {} is not a multiple of patch_size {}",
                cfg.time_len, cfg.patch_size
            ))
            .into());
        }
        let conv_cfg = Conv1dConfig {
            stride: cfg.patch_size,
            ..Default::default()
        };
        let patch_embed = conv1d(
            cfg.in_chans,
            cfg.embed_dim,
            cfg.patch_size,
            conv_cfg,
            vb.pp("patch_embed"),
        )?;
        let transformer = TransformerStack::new(
            TransformerConfig {
                d_model: cfg.embed_dim,
                n_layers: cfg.depth,
                n_heads: cfg.num_heads,
                d_ff: cfg.d_ff(),
                max_seq_len: cfg.num_patches(),
            },
            vb.pp("transformer"),
        )?;
        Ok(Self {
            config: cfg,
            patch_embed,
            transformer,
            global_pool,
        })
    }

    pub fn num_patches(&self) -> usize {
        self.config.num_patches()
    }

    pub fn embed_dim(&self) -> usize {
        self.config.embed_dim
    }

    /// (B, in_chans, time_len) -> (B, num_patches, embed_dim), or
    /// (B, 1, embed_dim) when pooling.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let b = x.dim(0)?;
        expect_dims(x, &[b, self.config.in_chans, self.config.time_len], "signal")?;
        let tokens = self.patch_embed.forward(x)?.transpose(1, 2)?.contiguous()?;
        let h = self.transformer.forward(&tokens)?;
        if self.global_pool {
            h.mean_keepdim(1).map_err(Into::into)
        } else {
            Ok(h)
        }
    }

    /// Apply a pretrained checkpoint to the variables under `prefix`.
    pub fn load_pretrained(
        varmap: &VarMap,
        prefix: &str,
        path: &Path,
        mode: LoadMode,
        device: &Device,
    ) -> Result<LoadReport> {
        info!("[ELDM] Loading patch encoder from {}", path.display());
        WeightFile::load(path)?
            .to_device(device)?
            .apply(varmap, prefix, mode)
    }
}

// ---------------------------------------------------------------------------
// Variant B: conv encoder + contextualizer
// ---------------------------------------------------------------------------

struct ConvBlock {
    conv: Conv1d,
    norm: GroupNorm,
}

impl ConvBlock {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.conv.forward(x)?;
        self.norm.forward(&h)?.gelu().map_err(Into::into)
    }
}

pub struct ConvContextEncoder {
    pub config: ConvEncoderConfig,
    blocks: Vec<ConvBlock>,
    input_proj: Linear,
    start_token: Tensor,
    context: TransformerStack,
}

impl ConvContextEncoder {
    pub fn new(cfg: ConvEncoderConfig, vb: VarBuilder) -> Result<Self> {
        if cfg.enc_width.len() != cfg.enc_downsample.len() || cfg.enc_width.is_empty() {
            return Err(EldmError::InvalidConfig(
                "enc_width and enc_downsample must be non-empty and of equal length".into(),
            )
            .into());
        }
        let h = cfg.encoder_h;
        let conv_vb = vb.pp("conv");
        let mut blocks = Vec::with_capacity(cfg.enc_width.len());
        let mut in_ch = cfg.in_features;
        for (i, (&width, &stride)) in cfg.enc_width.iter().zip(&cfg.enc_downsample).enumerate() {
            let width = if width % 2 == 0 { width + 1 } else { width };
            let conv_cfg = Conv1dConfig {
                padding: width / 2,
                stride,
                ..Default::default()
            };
            let block_vb = conv_vb.pp(format!("blocks.{i}"));
            blocks.push(ConvBlock {
                conv: conv1d(in_ch, h, width, conv_cfg, block_vb.pp("conv"))?,
                norm: group_norm(h / 2, h, 1e-5, block_vb.pp("norm"))?,
            });
            in_ch = h;
        }

        let ctx_vb = vb.pp("context");
        let dim = cfg.latent_dim();
        let input_proj = linear(h, dim, ctx_vb.pp("input_proj"))?;
        let start_token = ctx_vb.get_with_hints(
            (1, 1, dim),
            "start_token",
            candle_nn::Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        )?;
        let context = TransformerStack::new(
            TransformerConfig {
                d_model: dim,
                n_layers: cfg.context_layers,
                n_heads: cfg.context_heads,
                d_ff: cfg.context_ff,
                max_seq_len: cfg.seq_len(),
            },
            ctx_vb.pp("transformer"),
        )?;
        Ok(Self {
            config: cfg,
            blocks,
            input_proj,
            start_token,
            context,
        })
    }

    pub fn seq_len(&self) -> usize {
        self.config.seq_len()
    }

    pub fn latent_dim(&self) -> usize {
        self.config.latent_dim()
    }

    /// (B, in_features, samples) -> (seq_len, B, latent_dim).
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let b = x.dim(0)?;
        expect_dims(x, &[b, self.config.in_features, self.config.samples], "signal")?;
        let mut h = x.clone();
        for block in &self.blocks {
            h = block.forward(&h)?;
        }
        let h = self.input_proj.forward(&h.transpose(1, 2)?.contiguous()?)?;
        let start = self
            .start_token
            .broadcast_as((b, 1, self.latent_dim()))?
            .contiguous()?;
        let h = Tensor::cat(&[start, h], 1)?;
        let h = self.context.forward(&h)?;
        h.transpose(0, 1)?.contiguous().map_err(Into::into)
    }

    /// Strict load of the encoder file and its paired contextualizer file.
    pub fn load_pretrained(
        varmap: &VarMap,
        prefix: &str,
        encoder_path: &Path,
        device: &Device,
    ) -> Result<(LoadReport, LoadReport)> {
        let context_path = contextualizer_path(encoder_path)?;
        info!(
            "[ELDM] Loading conv encoder from {} and contextualizer from {}",
            encoder_path.display(),
            context_path.display()
        );
        let enc = WeightFile::load(encoder_path)?.to_device(device)?.apply(
            varmap,
            &format!("{prefix}conv."),
            LoadMode::Strict,
        )?;
        let ctx = WeightFile::load(&context_path)?.to_device(device)?.apply(
            varmap,
            &format!("{prefix}context."),
            LoadMode::Strict,
        )?;
        Ok((enc, ctx))
    }
}

/// Contextualizer checkpoint path: every "encoder" in the encoder path becomes
/// "contextualizer".
pub fn contextualizer_path(encoder_path: &Path) -> Result<PathBuf> {
    let raw = encoder_path.to_string_lossy();
    if !raw.contains("encoder") {
        return Err(EldmError::InvalidConfig(format!(
            "cannot derive contextualizer path from {raw}: no \"encoder\" in path"
        ))
        .into());
    }
    Ok(PathBuf::from(raw.replace("encoder", "contextualizer")))
}

// ---------------------------------------------------------------------------
// SignalEncoder
// ---------------------------------------------------------------------------

pub enum SignalEncoder {
    Patch(PatchEncoder),
    ConvContext(ConvContextEncoder),
}

impl SignalEncoder {
    pub fn new(cfg: &EncoderConfig, global_pool: bool, vb: VarBuilder) -> Result<Self> {
        Ok(match cfg {
            EncoderConfig::Patch(c) => Self::Patch(PatchEncoder::new(c.clone(), global_pool, vb)?),
            EncoderConfig::ConvContext(c) => Self::ConvContext(ConvContextEncoder::new(c.clone(), vb)?),
        })
    }

    pub fn kind(&self) -> EncoderKind {
        match self {
            Self::Patch(_) => EncoderKind::Patch,
            Self::ConvContext(_) => EncoderKind::ConvContext,
        }
    }

    /// Token count of the batch-first output.
    pub fn seq_len(&self) -> usize {
        match self {
            Self::Patch(e) if e.global_pool => 1,
            Self::Patch(e) => e.num_patches(),
            Self::ConvContext(e) => e.seq_len(),
        }
    }

    pub fn latent_dim(&self) -> usize {
        match self {
            Self::Patch(e) => e.embed_dim(),
            Self::ConvContext(e) => e.latent_dim(),
        }
    }

    /// Native output ordering of the variant.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Patch(e) => e.forward(x),
            Self::ConvContext(e) => e.forward(x),
        }
    }

    /// Apply pretrained weights to this encoder's variables. The conv variant
    /// is always strict; `mode` only applies to the patch variant.
    pub fn load_pretrained(
        &self,
        varmap: &VarMap,
        prefix: &str,
        path: &Path,
        mode: LoadMode,
        device: &Device,
    ) -> Result<()> {
        match self {
            Self::Patch(_) => {
                PatchEncoder::load_pretrained(varmap, prefix, path, mode, device)?;
            }
            Self::ConvContext(_) => {
                ConvContextEncoder::load_pretrained(varmap, prefix, path, device)?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
