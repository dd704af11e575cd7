// Shared fixtures: a toy backbone with 1x1 convolutions and in-memory data.

#![allow(dead_code)]

use anyhow::Result;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Conv2d, Conv2dConfig, Linear, Module, VarBuilder, VarMap};

use eldm::backbone::{varmap_entries, BackboneGeometry, LatentDiffusion, NoiseSchedule};
use eldm::cond::ConditioningModule;
use eldm::config::{CondStageConfig, EncoderConfig, LdmConfig, PatchEncoderConfig};
use eldm::data::{SignalDataset, SignalSample};
use eldm::ldm::{Eldm, COND_PREFIX};
use eldm::logger::ExperimentLogger;

pub const CONTEXT_DIM: usize = 16;
pub const PIXELS: usize = 16;

/// Latents are 4x8x8; the first stage is a 1x1 conv plus 2x pooling.
pub struct ToyBackbone {
    geometry: BackboneGeometry,
    varmap: VarMap,
    eps: Conv2d,
    ctx: Linear,
    enc: Conv2d,
    dec: Conv2d,
    schedule: NoiseSchedule,
    device: Device,
}

impl ToyBackbone {
    pub fn new(device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let cfg = Conv2dConfig::default();
        Ok(Self {
            geometry: BackboneGeometry {
                channels: 4,
                image_size: 8,
                ch_mult: vec![1, 2],
                context_dim: CONTEXT_DIM,
            },
            eps: candle_nn::conv2d(4, 4, 1, cfg, vb.pp("model.eps"))?,
            ctx: candle_nn::linear(CONTEXT_DIM, 4, vb.pp("model.ctx"))?,
            enc: candle_nn::conv2d(3, 4, 1, cfg, vb.pp("first_stage.enc"))?,
            dec: candle_nn::conv2d(4, 3, 1, cfg, vb.pp("first_stage.dec"))?,
            schedule: NoiseSchedule::new(1000)?,
            varmap,
            device: device.clone(),
        })
    }
}

impl LatentDiffusion for ToyBackbone {
    fn geometry(&self) -> &BackboneGeometry {
        &self.geometry
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    fn apply_model(&self, x: &Tensor, _t: usize, cond: &Tensor) -> Result<Tensor> {
        let (b, c, _, _) = x.dims4()?;
        let bias = self.ctx.forward(&cond.mean(1)?)?.reshape((b, c, 1, 1))?;
        Ok(self.eps.forward(x)?.broadcast_add(&bias)?)
    }

    fn encode_first_stage(&self, images: &Tensor) -> Result<Tensor> {
        Ok(self.enc.forward(images)?.avg_pool2d(2)?)
    }

    fn decode_first_stage(&self, latents: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = latents.dims4()?;
        Ok(self.dec.forward(latents)?.upsample_nearest2d(h * 2, w * 2)?)
    }

    fn named_vars(&self) -> Vec<(String, Var)> {
        varmap_entries(&self.varmap)
    }

    fn is_first_stage(&self, name: &str) -> bool {
        name.starts_with("first_stage.")
    }

    fn is_cross_attention(&self, name: &str) -> bool {
        name.starts_with("model.ctx.")
    }
}

pub fn toy_eldm(seed: u64, logger: Option<Box<dyn ExperimentLogger>>) -> Result<Eldm<ToyBackbone>> {
    let device = Device::Cpu;
    let backbone = ToyBackbone::new(&device)?;
    let cond_varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&cond_varmap, DType::F32, &device);
    let cond = ConditioningModule::new(
        CondStageConfig::tiny(EncoderConfig::Patch(PatchEncoderConfig::tiny())),
        CONTEXT_DIM,
        vb.pp(COND_PREFIX.trim_end_matches('.')),
    )?;
    Eldm::from_parts(backbone, cond, cond_varmap, LdmConfig::tiny(), seed, logger)
}

pub fn sample(index: usize) -> Result<SignalSample> {
    let device = Device::Cpu;
    let level = index as f64 * 0.25 - 0.5;
    Ok(SignalSample {
        signal: Tensor::randn(0f32, 1.0, (4, 32), &device)?,
        image: (Tensor::ones((PIXELS, PIXELS, 3), DType::F32, &device)? * level)?,
        image_raw: Tensor::randn(0f32, 1.0, 8usize, &device)?,
        label: Some((index % 5) as u32),
    })
}

pub struct InMemory(pub Vec<SignalSample>);

impl InMemory {
    pub fn new(n: usize) -> Result<Self> {
        Ok(Self((0..n).map(sample).collect::<Result<_>>()?))
    }
}

impl SignalDataset for InMemory {
    fn len(&self) -> usize {
        self.0.len()
    }

    fn get(&self, index: usize) -> Result<Option<SignalSample>> {
        Ok(self.0.get(index).cloned())
    }
}
