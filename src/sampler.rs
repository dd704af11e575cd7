// Iterative denoising samplers.
//
// A sampler turns conditioning into latents by running a scheduler against
// the backbone's noise prediction. Initial noise always comes from the
// caller's RNG so runs are reproducible from an `RngState`.

use anyhow::Result;
use candle_core::Tensor;
use candle_transformers::models::stable_diffusion::{
    ddim::DDIMSchedulerConfig, schedulers::SchedulerConfig,
};
use tracing::debug;

use crate::backbone::{LatentDiffusion, LatentShape};
use crate::rng::SeededRng;

pub struct SampleRequest<'a> {
    pub steps: usize,
    pub batch_size: usize,
    pub shape: LatentShape,
    /// (B, tokens, context_dim)
    pub conditioning: &'a Tensor,
    /// Blends `uncond + scale * (cond - uncond)` when != 1 and an
    /// unconditional context is given.
    pub guidance_scale: f64,
    pub unconditional: Option<&'a Tensor>,
}

pub trait Sampler {
    fn sample(
        &self,
        model: &dyn LatentDiffusion,
        request: &SampleRequest<'_>,
        rng: &mut SeededRng,
    ) -> Result<Tensor>;
}

/// Deterministic DDIM (eta = 0). Latents are detached after every step, so
/// the result carries no gradient graph.
#[derive(Debug, Clone, Default)]
pub struct DdimSampler {
    pub config: DDIMSchedulerConfig,
}

impl DdimSampler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Sampler for DdimSampler {
    fn sample(
        &self,
        model: &dyn LatentDiffusion,
        request: &SampleRequest<'_>,
        rng: &mut SeededRng,
    ) -> Result<Tensor> {
        let mut scheduler = self.config.build(request.steps)?;
        let shape = request.shape.batched(request.batch_size);
        let mut latents = (rng.randn(shape, model.device())? * scheduler.init_noise_sigma())?;

        let guided = request.guidance_scale != 1.0 && request.unconditional.is_some();
        let context = match request.unconditional {
            Some(uncond) if guided => Tensor::cat(&[uncond, request.conditioning], 0)?,
            _ => request.conditioning.clone(),
        };

        let timesteps: Vec<usize> = scheduler.timesteps().to_vec();
        for (i, t) in timesteps.into_iter().enumerate() {
            let input = if guided {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let input = scheduler.scale_model_input(input, t)?;
            let eps = model.apply_model(&input, t, &context)?.detach();
            let eps = if guided {
                let chunks = eps.chunk(2, 0)?;
                let (uncond, cond) = (&chunks[0], &chunks[1]);
                (uncond + ((cond - uncond)? * request.guidance_scale)?)?
            } else {
                eps
            };
            latents = scheduler.step(&eps, t, &latents)?.detach();
            debug!("[ELDM] ddim step {}/{} t={t}", i + 1, request.steps);
        }
        Ok(latents)
    }
}
