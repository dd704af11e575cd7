// eldm binary
//
// Commands:
//   eldm generate --data DATA.safetensors --output DIR [--checkpoint DIR]
//   eldm finetune --train TRAIN.safetensors [--eval EVAL.safetensors] --output DIR
//
// GPU: used when compiled with --features cuda and a device is available,
// unless --cpu is given.

use anyhow::Result;
use candle_core::Device;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use eldm::backbone::StableDiffusion;
use eldm::config::{CondStageConfig, EldmPaths, FinetuneConfig};
use eldm::data::{SafetensorsDataset, SignalDataset};
use eldm::grid::save_png;
use eldm::ldm::{Eldm, EldmOptions, GenerateRequest};
use eldm::logger::{ExperimentLogger, SqliteLogger, TracingLogger};
use eldm::sampler::DdimSampler;
use eldm::training::EpochDriver;
use eldm::weights::LoadMode;

#[derive(Parser, Debug)]
#[command(name = "eldm")]
#[command(version, about = "Brain-signal conditioned latent diffusion", long_about = None)]
struct Cli {
    /// Logging verbosity level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct ModelArgs {
    /// Backbone config JSON
    #[arg(long, default_value = "pretrains/models/config15.json")]
    backbone_config: PathBuf,

    #[arg(long, default_value = "pretrains/models/v1-5-unet.safetensors")]
    unet_weights: PathBuf,

    #[arg(long, default_value = "pretrains/models/v1-5-vae.safetensors")]
    vae_weights: PathBuf,

    /// Conditioning stage config JSON (defaults to the conv encoder)
    #[arg(long)]
    cond_config: Option<PathBuf>,

    /// Pretrained signal encoder weights
    #[arg(long)]
    encoder_weights: Option<PathBuf>,

    /// Skip missing/mis-shaped encoder keys instead of failing
    #[arg(long)]
    tolerant_encoder: bool,

    #[arg(long)]
    use_time_cond: bool,

    #[arg(long, default_value = "2022")]
    seed: u64,

    /// Force CPU even when CUDA is available
    #[arg(long)]
    cpu: bool,

    /// Persist metrics to this SQLite file instead of the log
    #[arg(long)]
    metrics_db: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sample images for the items of a dataset
    Generate {
        #[command(flatten)]
        model: ModelArgs,

        #[arg(long)]
        data: PathBuf,

        /// Fine-tuned checkpoint directory to load
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        #[arg(long)]
        output: PathBuf,

        #[arg(long, default_value = "5")]
        num_samples: usize,

        #[arg(long, default_value = "250")]
        ddim_steps: usize,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Fine-tune the conditioning stage (and optionally the denoiser)
    Finetune {
        #[command(flatten)]
        model: ModelArgs,

        #[arg(long)]
        train: PathBuf,

        #[arg(long)]
        eval: Option<PathBuf>,

        /// Fine-tuning config JSON
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        output: PathBuf,
    },
}

/// CUDA if built with the feature and available, else CPU.
fn select_device(force_cpu: bool) -> Device {
    if force_cpu {
        return Device::Cpu;
    }

    #[cfg(feature = "cuda")]
    {
        if candle_core::utils::cuda_is_available() {
            match Device::new_cuda(0) {
                Ok(dev) => {
                    info!("[ELDM] Using CUDA device 0");
                    return dev;
                }
                Err(e) => {
                    warn!("[ELDM] CUDA init failed, falling back to CPU: {}", e);
                }
            }
        } else {
            info!("[ELDM] CUDA not available, using CPU");
        }
    }

    #[cfg(not(feature = "cuda"))]
    {
        warn!("[ELDM] Built without CUDA feature, using CPU (rebuild with --features cuda for GPU)");
    }

    Device::Cpu
}

fn build(model: &ModelArgs, ddim_steps: usize) -> Result<Eldm<StableDiffusion>> {
    let cond_stage = match &model.cond_config {
        Some(path) => CondStageConfig::from_file(path)?,
        None => CondStageConfig::default(),
    };
    let logger: Box<dyn ExperimentLogger> = match &model.metrics_db {
        Some(path) => Box::new(SqliteLogger::open(path, "eldm")?),
        None => Box::new(TracingLogger),
    };
    let options = EldmOptions {
        paths: EldmPaths {
            backbone_config: model.backbone_config.clone(),
            unet_weights: model.unet_weights.clone(),
            vae_weights: model.vae_weights.clone(),
        },
        cond_stage,
        encoder_weights: model.encoder_weights.clone(),
        encoder_load_mode: if model.tolerant_encoder { LoadMode::Tolerant } else { LoadMode::Strict },
        use_time_cond: model.use_time_cond,
        ddim_steps,
        seed: model.seed,
        device: select_device(model.cpu),
    };
    Eldm::new(options, Some(logger))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Generate {
            model,
            data,
            checkpoint,
            output,
            num_samples,
            ddim_steps,
            limit,
        } => {
            let mut eldm = build(&model, ddim_steps)?;
            if let Some(dir) = &checkpoint {
                eldm.load_checkpoint(dir)?;
            }
            let dataset = SafetensorsDataset::open(&data)?;
            let mut items = Vec::with_capacity(dataset.len());
            for i in 0..dataset.len() {
                match dataset.get(i)? {
                    Some(item) => items.push(item),
                    None => debug!("[ELDM] Skipping malformed item {i}"),
                }
            }
            let request = GenerateRequest {
                num_samples,
                limit,
                output_dir: Some(output.clone()),
                ..Default::default()
            };
            let out = eldm.generate(&items, &DdimSampler::new(), &request)?;
            let (h, w, _) = out.grid.dims3()?;
            save_png(&out.grid.permute((2, 0, 1))?, &output.join("samples.png"))?;
            info!("[ELDM] Wrote {h}x{w} grid to {}", output.join("samples.png").display());
        }
        Commands::Finetune {
            model,
            train,
            eval,
            config,
            output,
        } => {
            let config = match &config {
                Some(path) => FinetuneConfig::from_file(path)?,
                None => FinetuneConfig::default(),
            };
            let mut eldm = build(&model, 250)?;
            let train = SafetensorsDataset::open(&train)?;
            let eval = eval.as_deref().map(SafetensorsDataset::open).transpose()?;
            let mut driver = EpochDriver::new(config.clone());
            eldm.finetune(
                &mut driver,
                &train,
                eval.as_ref().map(|d| d as &dyn SignalDataset),
                &config,
                &output,
            )?;
        }
    }
    Ok(())
}
