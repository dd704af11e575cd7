// Conditioning module: signal encoder + adapter + optional heads.
//
// The unit the orchestrator plugs into the backbone's conditioning slot:
//   signal -> encoder -> raw latent (B, seq, latent_dim)
//          -> [channel mapper: seq -> seq/2 -> 77 tokens, only without pooling]
//          -> dim mapper: latent_dim -> context_dim
// The raw latent is returned alongside the conditioning tensor so the
// contrastive loss works in the encoder's own space.

use anyhow::Result;
use candle_core::{Module, Tensor};
use candle_nn::{conv1d, linear, Conv1d, Conv1dConfig, Linear, VarBuilder};

use crate::config::{CondStageConfig, EncoderKind, TARGET_TOKENS};
use crate::encoder::SignalEncoder;
use crate::error::EldmError;
use crate::mapping::{contrastive_loss, ClassifyHead, MappingHead};

/// Two 1x1 convs over the token axis: seq -> seq/2 -> 77.
pub struct ChannelMapper {
    first: Conv1d,
    second: Conv1d,
}

impl ChannelMapper {
    pub fn new(seq_len: usize, vb: VarBuilder) -> Result<Self> {
        let half = (seq_len / 2).max(1);
        Ok(Self {
            first: conv1d(seq_len, half, 1, Conv1dConfig::default(), vb.pp("0"))?,
            second: conv1d(half, TARGET_TOKENS, 1, Conv1dConfig::default(), vb.pp("1"))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.first.forward(x)?;
        self.second.forward(&h).map_err(Into::into)
    }
}

pub struct ConditioningModule {
    pub config: CondStageConfig,
    pub context_dim: usize,
    encoder: SignalEncoder,
    channel_mapper: Option<ChannelMapper>,
    dim_mapper: Linear,
    mapping: Option<MappingHead>,
    cls_net: Option<ClassifyHead>,
}

impl ConditioningModule {
    /// Builds every sub-module under `vb`: `encoder.*`, `channel_mapper.*`,
    /// `dim_mapper.*`, `mapping.*`, `cls_net.*`.
    pub fn new(cfg: CondStageConfig, context_dim: usize, vb: VarBuilder) -> Result<Self> {
        let encoder = SignalEncoder::new(&cfg.encoder, cfg.global_pool, vb.pp("encoder"))?;
        let seq_len = encoder.seq_len();
        let latent_dim = encoder.latent_dim();

        let channel_mapper = if cfg.global_pool {
            None
        } else {
            Some(ChannelMapper::new(seq_len, vb.pp("channel_mapper"))?)
        };
        let dim_mapper = linear(latent_dim, context_dim, vb.pp("dim_mapper"))?;
        let mapping = if cfg.clip_tune {
            Some(MappingHead::new(seq_len, latent_dim, cfg.clip_dim, vb.pp("mapping"))?)
        } else {
            None
        };
        let cls_net = if cfg.cls_tune {
            Some(ClassifyHead::new(seq_len, latent_dim, cfg.num_classes, vb.pp("cls_net"))?)
        } else {
            None
        };

        Self::from_parts(cfg, context_dim, encoder, channel_mapper, dim_mapper, mapping, cls_net)
    }

    /// Assemble from already built parts, checking the pooling contract.
    pub fn from_parts(
        cfg: CondStageConfig,
        context_dim: usize,
        encoder: SignalEncoder,
        channel_mapper: Option<ChannelMapper>,
        dim_mapper: Linear,
        mapping: Option<MappingHead>,
        cls_net: Option<ClassifyHead>,
    ) -> Result<Self> {
        if !cfg.global_pool && channel_mapper.is_none() {
            return Err(EldmError::MissingChannelMapper.into());
        }
        Ok(Self {
            config: cfg,
            context_dim,
            encoder,
            channel_mapper,
            dim_mapper,
            mapping,
            cls_net,
        })
    }

    pub fn encoder(&self) -> &SignalEncoder {
        &self.encoder
    }

    pub fn clip_enabled(&self) -> bool {
        self.mapping.is_some()
    }

    pub fn cls_enabled(&self) -> bool {
        self.cls_net.is_some()
    }

    /// Batch-first raw latent. The conv variant emits sequence-first and is
    /// permuted here.
    fn encode(&self, signal: &Tensor) -> Result<Tensor> {
        let latent = self.encoder.forward(signal)?;
        match self.encoder.kind() {
            EncoderKind::Patch => Ok(latent),
            EncoderKind::ConvContext => latent.permute((1, 0, 2))?.contiguous().map_err(Into::into),
        }
    }

    /// Returns `(conditioning, raw_latent)`.
    pub fn forward(&self, signal: &Tensor) -> Result<(Tensor, Tensor)> {
        let raw_latent = self.encode(signal)?;
        let mut h = raw_latent.clone();
        if !self.config.global_pool {
            let mapper = self
                .channel_mapper
                .as_ref()
                .ok_or(EldmError::MissingChannelMapper)?;
            h = mapper.forward(&h)?;
        }
        let cond = self.dim_mapper.forward(&h)?;
        Ok((cond, raw_latent))
    }

    pub fn contrastive_loss(&self, raw_latent: &Tensor, image_embeds: &Tensor) -> Result<Tensor> {
        let mapping = self.mapping.as_ref().ok_or(EldmError::HeadDisabled("mapping"))?;
        let mapped = mapping.forward(raw_latent)?;
        contrastive_loss(&mapped, image_embeds)
    }

    pub fn classify(&self, signal: &Tensor) -> Result<Tensor> {
        let raw_latent = self.encode(signal)?;
        self.classify_latent(&raw_latent)
    }

    pub fn classify_latent(&self, raw_latent: &Tensor) -> Result<Tensor> {
        let cls = self.cls_net.as_ref().ok_or(EldmError::HeadDisabled("classification"))?;
        cls.forward(raw_latent)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
