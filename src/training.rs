use anyhow::Result;
use candle_core::{Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use std::time::Instant;
use tracing::{info, warn};

use crate::backbone::LatentDiffusion;
use crate::cond::ConditioningModule;
use crate::config::FinetuneConfig;
use crate::data::{Batch, DataLoader, ImageEmbedder, SignalDataset};
use crate::ema::Ema;
use crate::logger::ExperimentLogger;
use crate::rng::SeededRng;

// ---------------------------------------------------------------------------
// Learning-rate schedule
// ---------------------------------------------------------------------------

/// Linear warmup to `base_lr`, then cosine decay to `min_lr` at
/// `total_steps`. Steps past the end stay at `min_lr`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CosineSchedule {
    pub base_lr: f64,
    pub min_lr: f64,
    pub warmup_steps: usize,
    pub total_steps: usize,
}

impl CosineSchedule {
    pub fn from_config(cfg: &FinetuneConfig, total_steps: usize) -> Self {
        Self {
            base_lr: cfg.lr,
            min_lr: cfg.min_lr,
            warmup_steps: (total_steps as f64 * cfg.warmup_fraction) as usize,
            total_steps,
        }
    }

    /// Rate used for optimiser step `step` (0-based).
    pub fn lr_at(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * (step + 1) as f64 / self.warmup_steps as f64;
        }
        let span = self.total_steps.saturating_sub(self.warmup_steps).max(1);
        let progress = ((step - self.warmup_steps) as f64 / span as f64).min(1.0);
        let cosine = 0.5 * (1.0 + (std::f64::consts::PI * progress).cos());
        self.min_lr + (self.base_lr - self.min_lr) * cosine
    }
}

// ---------------------------------------------------------------------------
// Trainer: AdamW over an explicit variable list
// ---------------------------------------------------------------------------

pub struct Trainer {
    pub optimizer: AdamW,
    pub schedule: CosineSchedule,
    step_count: usize,
    timer_start: Instant,
}

impl Trainer {
    /// Only `vars` are updated; everything else in the graph stays frozen.
    pub fn new(vars: Vec<Var>, cfg: &FinetuneConfig, total_steps: usize) -> Result<Self> {
        let schedule = CosineSchedule::from_config(cfg, total_steps);
        let params = ParamsAdamW {
            lr: schedule.lr_at(0),
            weight_decay: cfg.weight_decay,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        };
        let optimizer = AdamW::new(vars, params)?;
        Ok(Self {
            optimizer,
            schedule,
            step_count: 0,
            timer_start: Instant::now(),
        })
    }

    pub fn backward_step(&mut self, loss: &Tensor) -> Result<usize> {
        self.optimizer.backward_step(loss)?;
        self.step_count += 1;
        self.optimizer.set_learning_rate(self.schedule.lr_at(self.step_count));
        Ok(self.step_count)
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }

    pub fn current_lr(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.timer_start.elapsed().as_secs_f64()
    }

    pub fn log_timer(&self, label: &str) {
        let elapsed = self.elapsed_secs();
        info!(
            "[TIMER] {label}: {elapsed:.1}s ({} steps, {:.2} steps/sec)",
            self.step_count,
            self.step_count as f64 / elapsed.max(0.001)
        );
    }
}

// ---------------------------------------------------------------------------
// Early Stopping
// ---------------------------------------------------------------------------

/// Tracks validation loss. Call `check()` after each validation pass; the
/// caller decides what to do with `NewBest`.
pub struct EarlyStopping {
    threshold: f32,
    patience: usize,
    below_count: usize,
    stale_count: usize,
    stale_stop: bool,
    best_loss: f32,
    best_step: usize,
}

#[derive(Debug, PartialEq)]
pub enum EarlyStopAction {
    Continue,
    NewBest,
    Stop,
}

impl EarlyStopping {
    /// threshold=0.0 disables threshold stopping (best loss is still tracked).
    pub fn new(threshold: f32, patience: usize) -> Self {
        Self {
            threshold,
            patience,
            below_count: 0,
            stale_count: 0,
            stale_stop: false,
            best_loss: f32::MAX,
            best_step: 0,
        }
    }

    pub fn disabled() -> Self {
        Self::new(0.0, usize::MAX)
    }

    pub fn from_config(cfg: &FinetuneConfig) -> Self {
        let es = Self::new(cfg.early_stop_threshold, cfg.early_stop_patience.max(1));
        if cfg.early_stop_on_plateau {
            es.with_stale_stop()
        } else {
            es
        }
    }

    /// Stop when the best loss hasn't improved for `patience` consecutive checks.
    pub fn with_stale_stop(mut self) -> Self {
        self.stale_stop = true;
        self
    }

    pub fn check(&mut self, avg_loss: f32, step: usize) -> EarlyStopAction {
        let mut action = EarlyStopAction::Continue;

        if avg_loss < self.best_loss {
            self.best_loss = avg_loss;
            self.best_step = step;
            info!("[BEST] New best val loss={avg_loss:.6} at step {step}");
            action = EarlyStopAction::NewBest;
        }

        if self.threshold > 0.0 {
            if avg_loss < self.threshold {
                self.below_count += 1;
                if self.below_count >= self.patience {
                    info!(
                        "[EARLY STOP] Loss {avg_loss:.6} < threshold {:.6} for {} consecutive checks. \
                         Stopping at step {step} (best was {:.6} at step {}).",
                        self.threshold, self.patience, self.best_loss, self.best_step
                    );
                    return EarlyStopAction::Stop;
                }
            } else {
                self.below_count = 0;
            }
        }

        if self.stale_stop {
            if action == EarlyStopAction::NewBest {
                self.stale_count = 0;
            } else {
                self.stale_count += 1;
                if self.stale_count >= self.patience {
                    info!(
                        "[EARLY STOP] No improvement for {} consecutive checks. \
                         Stopping at step {step} (best was {:.6} at step {}).",
                        self.patience, self.best_loss, self.best_step
                    );
                    return EarlyStopAction::Stop;
                }
            }
        }

        action
    }

    pub fn best_loss(&self) -> f32 {
        self.best_loss
    }

    pub fn best_step(&self) -> usize {
        self.best_step
    }
}

// ---------------------------------------------------------------------------
// Session / driver seam
// ---------------------------------------------------------------------------

/// Scalar loss plus its named parts, for logging.
pub struct LossBreakdown {
    pub total: Tensor,
    pub parts: Vec<(&'static str, f32)>,
}

/// What a training driver needs from the model being fine-tuned.
pub trait FitSession {
    fn device(&self) -> &Device;

    fn trainable_vars(&self) -> Vec<Var>;

    fn loss(&mut self, batch: &Batch) -> Result<LossBreakdown>;

    fn validation_loss(&mut self, batch: &Batch) -> Result<f32>;

    /// Runs after every optimiser step.
    fn after_step(&mut self) -> Result<()>;

    fn log_scalar(&self, _key: &str, _value: f64, _step: usize) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FitReport {
    pub epochs_run: usize,
    pub steps: usize,
    pub last_train_loss: Option<f32>,
    pub best_val_loss: Option<f32>,
    pub stopped_early: bool,
}

pub trait TrainingDriver {
    fn fit(
        &mut self,
        session: &mut dyn FitSession,
        train: &dyn SignalDataset,
        val: Option<&dyn SignalDataset>,
    ) -> Result<FitReport>;
}

/// Epoch loop: AdamW with cosine LR, per-step loss logging, validation every
/// `val_every_epochs`, early stopping on validation loss.
pub struct EpochDriver {
    pub config: FinetuneConfig,
}

impl EpochDriver {
    pub fn new(config: FinetuneConfig) -> Self {
        Self { config }
    }

    fn validate(
        &self,
        session: &mut dyn FitSession,
        val: &dyn SignalDataset,
    ) -> Result<Option<f32>> {
        let mut loader = DataLoader::new(val, self.config.batch_size);
        let mut total = 0.0f32;
        let mut count = 0usize;
        for batch in loader.epoch() {
            let batch = batch?.to_device(session.device())?;
            total += session.validation_loss(&batch)?;
            count += 1;
        }
        Ok((count > 0).then(|| total / count as f32))
    }
}

impl TrainingDriver for EpochDriver {
    fn fit(
        &mut self,
        session: &mut dyn FitSession,
        train: &dyn SignalDataset,
        val: Option<&dyn SignalDataset>,
    ) -> Result<FitReport> {
        let cfg = self.config.clone();
        let mut loader = DataLoader::new(train, cfg.batch_size);
        if cfg.shuffle {
            loader = loader.with_shuffle(cfg.seed);
        }
        let total_steps = cfg.num_epochs * loader.num_batches();
        let vars = session.trainable_vars();
        let n_params: usize = vars.iter().map(|v| v.elem_count()).sum();
        info!(
            "[TRAIN] {} epochs, {} steps, {} trainable tensors ({:.2}M params)",
            cfg.num_epochs,
            total_steps,
            vars.len(),
            n_params as f64 / 1e6
        );
        let mut trainer = Trainer::new(vars, &cfg, total_steps)?;
        let mut early = EarlyStopping::from_config(&cfg);
        let mut report = FitReport::default();

        for epoch in 0..cfg.num_epochs {
            let mut epoch_loss = 0.0f32;
            let mut epoch_batches = 0usize;
            for batch in loader.epoch() {
                let batch = batch?.to_device(session.device())?;
                let loss = session.loss(&batch)?;
                let value = loss.total.to_scalar::<f32>()?;
                if !value.is_finite() {
                    warn!("[TRAIN] Non-finite loss at step {}", trainer.step_count());
                }
                let step = trainer.backward_step(&loss.total)?;
                session.after_step()?;

                session.log_scalar("train/loss", value as f64, step)?;
                for (name, part) in &loss.parts {
                    session.log_scalar(&format!("train/{name}"), *part as f64, step)?;
                }
                session.log_scalar("train/lr", trainer.current_lr(), step)?;
                epoch_loss += value;
                epoch_batches += 1;
                report.last_train_loss = Some(value);
            }
            report.epochs_run = epoch + 1;
            report.steps = trainer.step_count();
            if epoch_batches > 0 {
                info!(
                    "[TRAIN] epoch {}/{} loss={:.6} lr={:.2e}",
                    epoch + 1,
                    cfg.num_epochs,
                    epoch_loss / epoch_batches as f32,
                    trainer.current_lr()
                );
            }

            let every = cfg.val_every_epochs.max(1);
            if let Some(val) = val.filter(|_| (epoch + 1) % every == 0) {
                if let Some(val_loss) = self.validate(session, val)? {
                    session.log_scalar("val/loss", val_loss as f64, report.steps)?;
                    info!("[TRAIN] epoch {} val_loss={val_loss:.6}", epoch + 1);
                    let action = early.check(val_loss, report.steps);
                    report.best_val_loss = Some(early.best_loss());
                    if action == EarlyStopAction::Stop {
                        report.stopped_early = true;
                        break;
                    }
                }
            }
        }
        trainer.log_timer("finetune");
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Fine-tuning session for the conditioning path
// ---------------------------------------------------------------------------

/// Variables to optimise. The first stage is always frozen; with
/// `train_cond_stage_only` the denoiser contributes only its cross-attention.
pub fn select_trainable<B: LatentDiffusion>(
    backbone: &B,
    cond_vars: &[(String, Var)],
    cfg: &FinetuneConfig,
) -> Vec<(String, Var)> {
    let mut selected: Vec<(String, Var)> = backbone
        .named_vars()
        .into_iter()
        .filter(|(name, _)| !backbone.is_first_stage(name))
        .filter(|(name, _)| !cfg.train_cond_stage_only || backbone.is_cross_attention(name))
        .collect();
    selected.extend(cond_vars.iter().cloned());
    selected
}

pub struct FinetuneSession<'a, B: LatentDiffusion> {
    pub backbone: &'a B,
    pub cond_stage: &'a ConditioningModule,
    pub trainable: Vec<(String, Var)>,
    pub embedder: &'a dyn ImageEmbedder,
    pub ema: Option<&'a mut Ema>,
    pub rng: &'a mut SeededRng,
    pub logger: Option<&'a dyn ExperimentLogger>,
    pub config: FinetuneConfig,
}

impl<B: LatentDiffusion> FinetuneSession<'_, B> {
    fn compute_loss(&mut self, batch: &Batch) -> Result<LossBreakdown> {
        let (cond, raw_latent) = self.cond_stage.forward(&batch.signal)?;
        let denoise = self.backbone.denoising_loss(&batch.image, &cond, self.rng)?;
        let mut parts = vec![("denoise", denoise.to_scalar::<f32>()?)];
        let mut total = denoise;

        if self.cond_stage.clip_enabled() && self.config.clip_weight > 0.0 {
            let image_embeds = self.embedder.embed(&batch.image_raw)?;
            let clip = self.cond_stage.contrastive_loss(&raw_latent, &image_embeds)?;
            parts.push(("clip", clip.to_scalar::<f32>()?));
            total = (total + (clip * self.config.clip_weight)?)?;
        }
        if let (true, Some(labels)) = (self.cond_stage.cls_enabled(), batch.label.as_ref()) {
            if self.config.cls_weight > 0.0 {
                let logits = self.cond_stage.classify_latent(&raw_latent)?;
                let ce = candle_nn::loss::cross_entropy(&logits, labels)?;
                parts.push(("cls", ce.to_scalar::<f32>()?));
                total = (total + (ce * self.config.cls_weight)?)?;
            }
        }
        Ok(LossBreakdown { total, parts })
    }
}

impl<B: LatentDiffusion> FitSession for FinetuneSession<'_, B> {
    fn device(&self) -> &Device {
        self.backbone.device()
    }

    fn trainable_vars(&self) -> Vec<Var> {
        self.trainable.iter().map(|(_, v)| v.clone()).collect()
    }

    fn loss(&mut self, batch: &Batch) -> Result<LossBreakdown> {
        self.compute_loss(batch)
    }

    fn validation_loss(&mut self, batch: &Batch) -> Result<f32> {
        let loss = self.compute_loss(batch)?;
        Ok(loss.total.to_scalar::<f32>()?)
    }

    fn after_step(&mut self) -> Result<()> {
        if let Some(ema) = self.ema.as_deref_mut() {
            ema.update()?;
        }
        Ok(())
    }

    fn log_scalar(&self, key: &str, value: f64, step: usize) -> Result<()> {
        match self.logger {
            Some(logger) => logger.log_scalar(key, value, step),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
