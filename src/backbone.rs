// Latent diffusion backbone: denoiser + first-stage autoencoder.
//
// `LatentDiffusion` is the seam the orchestrator and the samplers work against.
// `StableDiffusion` fills it with the candle-transformers UNet and VAE, built
// inside a VarMap so the denoiser can be fine-tuned. The forward (noising)
// process reuses the DDIM schedule's `add_noise`.

use anyhow::Result;
use candle_core::{Device, DType, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use candle_transformers::models::stable_diffusion::{
    ddim::DDIMSchedulerConfig,
    schedulers::{Scheduler, SchedulerConfig},
    unet_2d::{BlockConfig, UNet2DConditionModel, UNet2DConditionModelConfig},
    vae::{AutoEncoderKL, AutoEncoderKLConfig},
};
use tracing::info;

use crate::config::{EldmPaths, LdmConfig};
use crate::error::EldmError;
use crate::rng::SeededRng;
use crate::weights::{LoadMode, WeightFile};

const UNET_PREFIX: &str = "unet.";
const FIRST_STAGE_PREFIX: &str = "first_stage.";

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatentShape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl LatentShape {
    pub fn batched(&self, batch: usize) -> (usize, usize, usize, usize) {
        (batch, self.channels, self.height, self.width)
    }
}

/// Cached backbone geometry: latent channels, default latent size and the
/// first stage's channel multipliers.
#[derive(Debug, Clone, PartialEq)]
pub struct BackboneGeometry {
    pub channels: usize,
    pub image_size: usize,
    pub ch_mult: Vec<usize>,
    pub context_dim: usize,
}

impl BackboneGeometry {
    pub fn from_config(cfg: &LdmConfig) -> Self {
        Self {
            channels: cfg.channels,
            image_size: cfg.image_size,
            ch_mult: cfg.first_stage.ch_mult.clone(),
            context_dim: cfg.context_dim,
        }
    }

    /// Pixel-to-latent spatial factor, 2^(len(ch_mult) - 1).
    pub fn downsample_factor(&self) -> usize {
        1 << self.ch_mult.len().saturating_sub(1)
    }

    /// Latent shape for a requested pixel size, or the backbone default.
    pub fn latent_shape(&self, image_hw: Option<(usize, usize)>) -> LatentShape {
        let (height, width) = match image_hw {
            Some((h, w)) => {
                let f = self.downsample_factor();
                (h / f, w / f)
            }
            None => (self.image_size, self.image_size),
        };
        LatentShape {
            channels: self.channels,
            height,
            width,
        }
    }
}

// ---------------------------------------------------------------------------
// Forward process
// ---------------------------------------------------------------------------

/// Training-time noise schedule over `num_timesteps` steps.
pub struct NoiseSchedule {
    scheduler: Box<dyn Scheduler>,
    num_timesteps: usize,
}

impl NoiseSchedule {
    pub fn new(num_timesteps: usize) -> Result<Self> {
        let scheduler = DDIMSchedulerConfig {
            train_timesteps: num_timesteps,
            ..Default::default()
        }
        .build(num_timesteps)?;
        Ok(Self {
            scheduler,
            num_timesteps,
        })
    }

    pub fn num_timesteps(&self) -> usize {
        self.num_timesteps
    }

    /// x_t = sqrt(abar_t) x_0 + sqrt(1 - abar_t) noise
    pub fn q_sample(&self, x0: &Tensor, noise: &Tensor, t: usize) -> Result<Tensor> {
        self.scheduler
            .add_noise(x0, noise.clone(), t)
            .map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// LatentDiffusion trait
// ---------------------------------------------------------------------------

pub trait LatentDiffusion {
    fn geometry(&self) -> &BackboneGeometry;

    fn device(&self) -> &Device;

    fn schedule(&self) -> &NoiseSchedule;

    /// Noise prediction for latents `x` at timestep `t` under `cond`.
    fn apply_model(&self, x: &Tensor, t: usize, cond: &Tensor) -> Result<Tensor>;

    /// (B, 3, H, W) in [-1, 1] -> scaled latents.
    fn encode_first_stage(&self, images: &Tensor) -> Result<Tensor>;

    /// Scaled latents -> (B, 3, H, W), roughly in [-1, 1].
    fn decode_first_stage(&self, latents: &Tensor) -> Result<Tensor>;

    /// Every backbone variable with its full name.
    fn named_vars(&self) -> Vec<(String, Var)>;

    fn is_first_stage(&self, name: &str) -> bool;

    fn is_cross_attention(&self, name: &str) -> bool;

    /// Epsilon-prediction MSE for a batch of (B, H, W, 3) images in [-1, 1].
    /// One timestep is drawn per batch.
    fn denoising_loss(&self, images: &Tensor, cond: &Tensor, rng: &mut SeededRng) -> Result<Tensor> {
        let images = images.permute((0, 3, 1, 2))?.contiguous()?;
        let z = self.encode_first_stage(&images)?;
        let t = rng.gen_range(self.schedule().num_timesteps());
        let noise = rng.randn(z.shape().clone(), z.device())?.to_dtype(z.dtype())?;
        let noisy = self.schedule().q_sample(&z, &noise, t)?;
        let eps = self.apply_model(&noisy, t, cond)?;
        candle_nn::loss::mse(&eps, &noise).map_err(Into::into)
    }

    /// Denoiser variables (first stage excluded).
    fn denoiser_vars(&self) -> Vec<(String, Var)> {
        self.named_vars()
            .into_iter()
            .filter(|(name, _)| !self.is_first_stage(name))
            .collect()
    }
}

/// Sorted (name, var) pairs of a VarMap.
pub fn varmap_entries(varmap: &VarMap) -> Vec<(String, Var)> {
    let mut entries: Vec<(String, Var)> = match varmap.data().lock() {
        Ok(data) => data.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        Err(_) => Vec::new(),
    };
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}

// ---------------------------------------------------------------------------
// StableDiffusion
// ---------------------------------------------------------------------------

pub struct StableDiffusion {
    pub config: LdmConfig,
    geometry: BackboneGeometry,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
    varmap: VarMap,
    schedule: NoiseSchedule,
    device: Device,
}

impl StableDiffusion {
    /// Builds a randomly initialised UNet and VAE.
    pub fn new(config: LdmConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        if config.use_time_cond {
            return Err(EldmError::Unsupported(
                "use_time_cond: the UNet has no time-conditioning path".into(),
            )
            .into());
        }
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let u = &config.unet;
        let blocks = u
            .block_out_channels
            .iter()
            .enumerate()
            .map(|(i, &out_channels)| BlockConfig {
                out_channels,
                use_cross_attn: (i < u.cross_attention_blocks).then_some(1),
                attention_head_dim: u.attention_head_dim,
            })
            .collect();
        let unet_cfg = UNet2DConditionModelConfig {
            center_input_sample: false,
            flip_sin_to_cos: true,
            freq_shift: 0.,
            blocks,
            layers_per_block: u.layers_per_block,
            downsample_padding: 1,
            mid_block_scale_factor: 1.,
            norm_num_groups: u.norm_num_groups,
            norm_eps: u.norm_eps,
            cross_attention_dim: config.context_dim,
            sliced_attention_size: u.sliced_attention_size,
            use_linear_projection: u.use_linear_projection,
        };
        let unet = UNet2DConditionModel::new(
            vb.pp("unet"),
            config.channels,
            config.channels,
            false,
            unet_cfg,
        )?;

        let fs = &config.first_stage;
        let vae_cfg = AutoEncoderKLConfig {
            block_out_channels: fs.block_out_channels(),
            layers_per_block: fs.layers_per_block,
            latent_channels: config.channels,
            norm_num_groups: fs.norm_num_groups,
            ..Default::default()
        };
        let vae = AutoEncoderKL::new(vb.pp("first_stage"), 3, 3, vae_cfg)?;

        let schedule = NoiseSchedule::new(config.num_timesteps)?;
        let n_params: usize = varmap.all_vars().iter().map(|v| v.elem_count()).sum();
        info!(
            "[ELDM] Backbone built: {} tensors, {:.1}M params",
            varmap.all_vars().len(),
            n_params as f64 / 1e6
        );
        Ok(Self {
            geometry: BackboneGeometry::from_config(&config),
            config,
            unet,
            vae,
            varmap,
            schedule,
            device: device.clone(),
        })
    }

    /// Builds the backbone and applies the UNet and VAE weight files
    /// tolerantly.
    pub fn load(config: LdmConfig, paths: &EldmPaths, device: &Device) -> Result<Self> {
        let model = Self::new(config, device)?;
        WeightFile::load(&paths.unet_weights)?
            .to_device(device)?
            .apply(&model.varmap, UNET_PREFIX, LoadMode::Tolerant)?;
        WeightFile::load(&paths.vae_weights)?
            .to_device(device)?
            .apply(&model.varmap, FIRST_STAGE_PREFIX, LoadMode::Tolerant)?;
        Ok(model)
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }
}

impl LatentDiffusion for StableDiffusion {
    fn geometry(&self) -> &BackboneGeometry {
        &self.geometry
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    fn apply_model(&self, x: &Tensor, t: usize, cond: &Tensor) -> Result<Tensor> {
        self.unet.forward(x, t as f64, cond).map_err(Into::into)
    }

    fn encode_first_stage(&self, images: &Tensor) -> Result<Tensor> {
        let dist = self.vae.encode(images)?;
        (dist.sample()? * self.config.scale_factor).map_err(Into::into)
    }

    fn decode_first_stage(&self, latents: &Tensor) -> Result<Tensor> {
        let z = (latents / self.config.scale_factor)?;
        self.vae.decode(&z).map_err(Into::into)
    }

    fn named_vars(&self) -> Vec<(String, Var)> {
        varmap_entries(&self.varmap)
    }

    fn is_first_stage(&self, name: &str) -> bool {
        name.starts_with(FIRST_STAGE_PREFIX)
    }

    /// Cross-attention projections (`attn2`) and the norm that feeds them.
    fn is_cross_attention(&self, name: &str) -> bool {
        name.starts_with(UNET_PREFIX)
            && (name.contains(".attn2.")
                || (name.contains("transformer_blocks.") && name.contains(".norm2.")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
