// Diffusion orchestrator: backbone + conditioning module + EMA + RNG.
//
//   constructed -> finetune() -> checkpoint persisted -> generate()
//
// finetune() and generate() can be called in any order and repeatedly. The
// backbone's own text conditioning is never built; conditioning always comes
// from the ConditioningModule, whose variables live in a separate VarMap
// under `cond_stage_model.`.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::backbone::{varmap_entries, BackboneGeometry, LatentDiffusion, StableDiffusion};
use crate::cond::ConditioningModule;
use crate::config::{CondStageConfig, EldmPaths, FinetuneConfig, LdmConfig};
use crate::data::{ImageEmbedder, PrecomputedEmbedder, SignalDataset, SignalSample};
use crate::ema::Ema;
use crate::error::EldmError;
use crate::grid::{make_grid, quantize, save_png, to_hwc};
use crate::logger::ExperimentLogger;
use crate::rng::{RngState, SeededRng};
use crate::sampler::{SampleRequest, Sampler};
use crate::training::{select_trainable, FinetuneSession, FitReport, TrainingDriver};
use crate::weights::{save_tensors, LoadMode, WeightFile};

pub const COND_PREFIX: &str = "cond_stage_model.";
const EMA_PREFIX: &str = "model_ema.";
const CHECKPOINT_WEIGHTS: &str = "checkpoint.safetensors";
const CHECKPOINT_META: &str = "checkpoint.json";

pub struct EldmOptions {
    pub paths: EldmPaths,
    pub cond_stage: CondStageConfig,
    /// Pretrained signal encoder. For the conv encoder the contextualizer
    /// file is derived from this path.
    pub encoder_weights: Option<PathBuf>,
    pub encoder_load_mode: LoadMode,
    pub use_time_cond: bool,
    pub ddim_steps: usize,
    pub seed: u64,
    pub device: Device,
}

impl Default for EldmOptions {
    fn default() -> Self {
        Self {
            paths: EldmPaths::default(),
            cond_stage: CondStageConfig::default(),
            encoder_weights: None,
            encoder_load_mode: LoadMode::Strict,
            use_time_cond: false,
            ddim_steps: 250,
            seed: 2022,
            device: Device::Cpu,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub num_samples: usize,
    /// Falls back to the orchestrator's default step count.
    pub ddim_steps: Option<usize>,
    /// Pixel height/width; the backbone default when absent.
    pub image_hw: Option<(usize, usize)>,
    pub limit: Option<usize>,
    pub rng_state: Option<RngState>,
    pub output_dir: Option<PathBuf>,
}

pub struct GenerationOutput {
    /// (H, W, 3) u8: one row per item, ground truth first.
    pub grid: Tensor,
    /// (items, num_samples + 1, 3, H, W) u8
    pub samples: Tensor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub config: Option<FinetuneConfig>,
    pub ldm_config: LdmConfig,
    pub cond_stage: CondStageConfig,
    pub rng_state: RngState,
    pub ema_updates: Option<usize>,
}

pub struct Eldm<B: LatentDiffusion> {
    backbone: B,
    cond_stage: ConditioningModule,
    cond_varmap: VarMap,
    ldm_config: LdmConfig,
    geometry: BackboneGeometry,
    device: Device,
    rng: SeededRng,
    ema: Option<Ema>,
    logger: Option<Box<dyn ExperimentLogger>>,
    image_embedder: Box<dyn ImageEmbedder>,
    ddim_steps: usize,
    finetune_config: Option<FinetuneConfig>,
}

impl Eldm<StableDiffusion> {
    /// Load the backbone config and weights from `options.paths`, build the
    /// conditioning module and (optionally) its pretrained encoder.
    pub fn new(options: EldmOptions, logger: Option<Box<dyn ExperimentLogger>>) -> Result<Self> {
        let device = options.device.clone();
        let ldm_config = LdmConfig::from_file(&options.paths.backbone_config)?
            .with_overrides(options.use_time_cond, options.cond_stage.global_pool);
        info!(
            "[ELDM] Backbone config {} (use_time_cond={}, global_pool={})",
            options.paths.backbone_config.display(),
            ldm_config.use_time_cond,
            ldm_config.global_pool
        );
        let backbone = StableDiffusion::load(ldm_config.clone(), &options.paths, &device)?;

        let cond_varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&cond_varmap, DType::F32, &device);
        let cond_stage = ConditioningModule::new(
            options.cond_stage.clone(),
            ldm_config.context_dim,
            vb.pp(COND_PREFIX.trim_end_matches('.')),
        )?;
        if let Some(path) = &options.encoder_weights {
            cond_stage.encoder().load_pretrained(
                &cond_varmap,
                &format!("{COND_PREFIX}encoder."),
                path,
                options.encoder_load_mode,
                &device,
            )?;
        }

        let mut eldm = Self::from_parts(backbone, cond_stage, cond_varmap, ldm_config, options.seed, logger)?;
        eldm.ddim_steps = options.ddim_steps;
        Ok(eldm)
    }
}

impl<B: LatentDiffusion> Eldm<B> {
    /// Assemble from a built backbone and a conditioning module whose
    /// variables live in `cond_varmap` under `cond_stage_model.`.
    pub fn from_parts(
        backbone: B,
        cond_stage: ConditioningModule,
        cond_varmap: VarMap,
        ldm_config: LdmConfig,
        seed: u64,
        logger: Option<Box<dyn ExperimentLogger>>,
    ) -> Result<Self> {
        let geometry = backbone.geometry().clone();
        let device = backbone.device().clone();
        let ema = if ldm_config.use_ema {
            Some(Ema::new(ldm_config.ema_decay, backbone.denoiser_vars())?)
        } else {
            None
        };
        let n_params: usize = backbone
            .named_vars()
            .iter()
            .chain(varmap_entries(&cond_varmap).iter())
            .map(|(_, v)| v.elem_count())
            .sum();
        if let Some(logger) = &logger {
            logger.watch("eldm", n_params)?;
        }
        info!(
            "[ELDM] Ready: {:.1}M params, latent {}x{}x{}, context_dim {}",
            n_params as f64 / 1e6,
            geometry.channels,
            geometry.image_size,
            geometry.image_size,
            geometry.context_dim
        );
        Ok(Self {
            backbone,
            cond_stage,
            cond_varmap,
            ldm_config,
            geometry,
            device,
            rng: SeededRng::new(seed),
            ema,
            logger,
            image_embedder: Box::new(PrecomputedEmbedder),
            ddim_steps: 250,
            finetune_config: None,
        })
    }

    pub fn with_image_embedder(mut self, embedder: Box<dyn ImageEmbedder>) -> Self {
        self.image_embedder = embedder;
        self
    }

    pub fn with_ddim_steps(mut self, steps: usize) -> Self {
        self.ddim_steps = steps;
        self
    }

    pub fn backbone(&self) -> &B {
        &self.backbone
    }

    pub fn cond_stage(&self) -> &ConditioningModule {
        &self.cond_stage
    }

    pub fn geometry(&self) -> &BackboneGeometry {
        &self.geometry
    }

    pub fn ldm_config(&self) -> &LdmConfig {
        &self.ldm_config
    }

    pub fn rng_state(&self) -> RngState {
        self.rng.state()
    }

    pub fn ema(&self) -> Option<&Ema> {
        self.ema.as_ref()
    }

    fn cond_vars(&self) -> Vec<(String, Var)> {
        varmap_entries(&self.cond_varmap)
    }

    // -----------------------------------------------------------------------
    // Fine-tuning
    // -----------------------------------------------------------------------

    /// One fine-tuning stage, then the checkpoint is written to `output_dir`.
    pub fn finetune(
        &mut self,
        driver: &mut dyn TrainingDriver,
        train: &dyn SignalDataset,
        eval: Option<&dyn SignalDataset>,
        config: &FinetuneConfig,
        output_dir: &Path,
    ) -> Result<FitReport> {
        let cond_vars = self.cond_vars();
        let trainable = select_trainable(&self.backbone, &cond_vars, config);
        info!(
            "[TRAIN] Fine-tuning {} tensors (cond_stage_only={}, {} train / {} eval samples)",
            trainable.len(),
            config.train_cond_stage_only,
            train.len(),
            eval.map(|e| e.len()).unwrap_or(0)
        );
        let ema = if config.use_ema { self.ema.as_mut() } else { None };

        let mut session = FinetuneSession {
            backbone: &self.backbone,
            cond_stage: &self.cond_stage,
            trainable,
            embedder: self.image_embedder.as_ref(),
            ema,
            rng: &mut self.rng,
            logger: self.logger.as_deref(),
            config: config.clone(),
        };
        let report = driver.fit(&mut session, train, eval)?;
        if !config.use_ema {
            if let Some(ema) = &self.ema {
                ema.copy_from_params()?;
            }
        }
        info!(
            "[TRAIN] Done: {} epochs, {} steps{}",
            report.epochs_run,
            report.steps,
            if report.stopped_early { " (early stop)" } else { "" }
        );

        self.finetune_config = Some(config.clone());
        self.save_checkpoint(output_dir)?;
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Generation
    // -----------------------------------------------------------------------

    /// Sample `num_samples` images per item (up to `limit` items) with the EMA
    /// weights active.
    pub fn generate(
        &mut self,
        items: &[SignalSample],
        sampler: &dyn Sampler,
        request: &GenerateRequest,
    ) -> Result<GenerationOutput> {
        let count = request.limit.unwrap_or(items.len()).min(items.len());
        if count == 0 || request.num_samples == 0 {
            return Err(EldmError::EmptyInput.into());
        }
        if let Some(state) = request.rng_state {
            self.rng.restore(state);
        }

        let stash = match &self.ema {
            Some(ema) => Some(ema.swap_in()?),
            None => None,
        };
        let result = self.generate_items(&items[..count], sampler, request);
        if let (Some(ema), Some(stash)) = (&self.ema, stash) {
            ema.restore(stash)?;
        }
        result
    }

    fn generate_items(
        &mut self,
        items: &[SignalSample],
        sampler: &dyn Sampler,
        request: &GenerateRequest,
    ) -> Result<GenerationOutput> {
        let k = request.num_samples;
        let steps = request.ddim_steps.unwrap_or(self.ddim_steps);
        let shape = self.geometry.latent_shape(request.image_hw);
        if let Some(dir) = &request.output_dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }

        let mut rows = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            info!("[ELDM] rendering {k} examples in {steps} steps (item {i})");
            let signal = item.signal.to_device(&self.device)?.unsqueeze(0)?;
            let (_, c, t) = signal.dims3()?;
            let batch = signal.broadcast_as((k, c, t))?.contiguous()?;
            let (cond, raw_latent) = self.cond_stage.forward(&batch)?;
            let (cond, raw_latent) = (cond.detach(), raw_latent.detach());

            if self.cond_stage.clip_enabled() {
                let image_raw = item.image_raw.to_device(&self.device)?.unsqueeze(0)?;
                let image_embeds = self.image_embedder.embed(&image_raw)?;
                let clip = self
                    .cond_stage
                    .contrastive_loss(&raw_latent, &image_embeds)?
                    .to_scalar::<f32>()?;
                debug!("[ELDM] item {i} clip_loss={clip:.6}");
                if let Some(logger) = &self.logger {
                    logger.log_scalar("clip_loss", clip as f64, i)?;
                }
            }

            let sample_request = SampleRequest {
                steps,
                batch_size: k,
                shape,
                conditioning: &cond,
                guidance_scale: 1.0,
                unconditional: None,
            };
            let latents = sampler.sample(&self.backbone, &sample_request, &mut self.rng)?;
            let decoded = self.backbone.decode_first_stage(&latents)?.detach();
            let generated = to_unit_range(&decoded)?.to_device(&Device::Cpu)?;
            let (_, _, h, w) = generated.dims4()?;

            let gt = item.image.to_device(&Device::Cpu)?.permute((2, 0, 1))?.unsqueeze(0)?;
            let gt = if (gt.dim(2)?, gt.dim(3)?) != (h, w) {
                gt.contiguous()?.interpolate2d(h, w)?
            } else {
                gt
            };
            let row = Tensor::cat(&[to_unit_range(&gt)?, generated], 0)?;

            if let Some(dir) = &request.output_dir {
                let bytes = quantize(&row)?;
                for j in 0..=k {
                    save_png(&bytes.get(j)?, &dir.join(format!("test{i}-{j}.png")))?;
                }
            }
            rows.push(row);
        }

        let all = Tensor::stack(&rows, 0)?;
        let (n, cols, c, h, w) = all.dims5()?;
        let grid = make_grid(&all.reshape((n * cols, c, h, w))?, cols, 2)?;
        Ok(GenerationOutput {
            grid: to_hwc(&quantize(&grid)?)?,
            samples: quantize(&all)?,
        })
    }

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    fn checkpoint_vars(&self) -> Vec<(String, Var)> {
        let mut vars = self.backbone.named_vars();
        vars.extend(self.cond_vars());
        if let Some(ema) = &self.ema {
            vars.extend(
                ema.shadow_vars()
                    .into_iter()
                    .map(|(name, v)| (format!("{EMA_PREFIX}{name}"), v)),
            );
        }
        vars
    }

    /// Writes `checkpoint.safetensors` and `checkpoint.json` into `dir`.
    pub fn save_checkpoint(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        let tensors: HashMap<String, Tensor> = self
            .checkpoint_vars()
            .into_iter()
            .map(|(name, v)| (name, v.as_tensor().clone()))
            .collect();
        save_tensors(&tensors, &dir.join(CHECKPOINT_WEIGHTS))?;

        let meta = CheckpointMeta {
            config: self.finetune_config.clone(),
            ldm_config: self.ldm_config.clone(),
            cond_stage: self.cond_stage.config.clone(),
            rng_state: self.rng.state(),
            ema_updates: self.ema.as_ref().map(Ema::num_updates),
        };
        let meta_path = dir.join(CHECKPOINT_META);
        std::fs::write(&meta_path, serde_json::to_string_pretty(&meta)?)
            .with_context(|| format!("writing {}", meta_path.display()))?;
        info!("[CHECKPOINT] Saved fine-tuned model to {}", dir.display());
        Ok(())
    }

    /// Restores weights, EMA shadow and RNG state written by `save_checkpoint`.
    pub fn load_checkpoint(&mut self, dir: &Path) -> Result<CheckpointMeta> {
        let meta_path = dir.join(CHECKPOINT_META);
        let text = std::fs::read_to_string(&meta_path)
            .with_context(|| format!("reading {}", meta_path.display()))?;
        let meta: CheckpointMeta = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", meta_path.display()))?;

        // The signal encoder must match exactly; everything else is tolerant.
        let file = WeightFile::load(&dir.join(CHECKPOINT_WEIGHTS))?.to_device(&self.device)?;
        let encoder_prefix = format!("{COND_PREFIX}encoder.");
        let (encoder_vars, other_vars): (Vec<_>, Vec<_>) = self
            .checkpoint_vars()
            .into_iter()
            .partition(|(name, _)| name.starts_with(&encoder_prefix));
        file.subset(|k| k.starts_with(&encoder_prefix))
            .apply_named(encoder_vars, LoadMode::Strict)?;
        file.subset(|k| !k.starts_with(&encoder_prefix))
            .apply_named(other_vars, LoadMode::Tolerant)?;

        self.rng.restore(meta.rng_state);
        if let (Some(ema), Some(n)) = (self.ema.as_mut(), meta.ema_updates) {
            ema.set_num_updates(n);
        }
        self.finetune_config = meta.config.clone();
        Ok(meta)
    }
}

/// [-1, 1] -> [0, 1], clamped.
fn to_unit_range(x: &Tensor) -> Result<Tensor> {
    x.affine(0.5, 0.5)?.clamp(0f32, 1f32).map_err(Into::into)
}
