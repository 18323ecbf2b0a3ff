use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Parser, Subcommand};

use qat_common::{Cifar10Provider, DatasetProvider, LoaderPurpose, ModelConfig};
use qat_core::{FloatModel, QatQuantizer};
use qat_export::MobileConverter;
use qat_pipeline::{PipelineConfig, QatCoordinator};
use qat_train::{report_accuracy, run_validation, TrainingContext};

#[derive(Parser, Debug)]
#[command(name = "qatflow", about = "Quantization-aware training and mobile export")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full pipeline: validate, (prune, fine-tune,) QAT, freeze, export.
    Run(RunArgs),
    /// Write a randomly initialised float model directory.
    InitModel(InitModelArgs),
    /// Report a float model's top-1 accuracy on the CIFAR-10 test split.
    Validate(ValidateArgs),
}

// ── Run ─────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct RunArgs {
    /// Pipeline JSON; flags below override its fields.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Float model directory (model.json + model.safetensors).
    #[arg(long)]
    model_path: Option<PathBuf>,
    #[arg(long)]
    data_path: Option<PathBuf>,
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    parallel: Option<bool>,
    #[arg(long)]
    warmup: Option<bool>,
    #[arg(long)]
    distillation: Option<bool>,
    #[arg(long)]
    finetune: Option<bool>,
    #[arg(long)]
    work_dir: Option<PathBuf>,
    /// Exported `.qmdl` path.
    #[arg(long)]
    output: Option<PathBuf>,
    /// QAT epochs.
    #[arg(long)]
    epochs: Option<usize>,
    /// QAT learning rate.
    #[arg(long)]
    lr: Option<f64>,
    #[arg(long)]
    replicas: Option<usize>,
    #[arg(long)]
    freeze_observer_epoch: Option<usize>,
    /// Also write the artifact as a C array header.
    #[arg(long)]
    emit_c_array: bool,
    /// Write the effective configuration here before running.
    #[arg(long)]
    save_config: Option<PathBuf>,
}

impl RunArgs {
    fn into_config(self) -> Result<(PipelineConfig, Option<PathBuf>)> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)
                .with_context(|| format!("loading pipeline config {}", path.display()))?,
            None => PipelineConfig::default(),
        };
        if self.model_path.is_some() {
            config.model_path = self.model_path;
        }
        if let Some(v) = self.data_path {
            config.data.data_path = v;
        }
        if let Some(v) = self.workers {
            config.data.workers = v;
        }
        if let Some(v) = self.batch_size {
            config.data.batch_size = v;
        }
        if let Some(v) = self.parallel {
            config.features.parallel = v;
        }
        if let Some(v) = self.warmup {
            config.features.warmup = v;
        }
        if let Some(v) = self.distillation {
            config.features.distillation = v;
        }
        if let Some(v) = self.finetune {
            config.features.finetune = v;
        }
        if let Some(v) = self.work_dir {
            config.work_dir = v;
        }
        if self.output.is_some() {
            config.output_path = self.output;
        }
        if let Some(v) = self.epochs {
            config.qat.max_epoch = v;
        }
        if let Some(v) = self.lr {
            config.qat.lr = v;
        }
        if self.replicas.is_some() {
            config.replicas = self.replicas;
        }
        if self.freeze_observer_epoch.is_some() {
            config.freeze_observer_epoch = self.freeze_observer_epoch;
        }
        config.export.emit_c_array |= self.emit_c_array;
        Ok((config, self.save_config))
    }
}

// ── Init-model / Validate ───────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct InitModelArgs {
    /// Model architecture JSON; the small CIFAR CNN when omitted.
    #[arg(long)]
    model_config: Option<PathBuf>,
    #[arg(long, default_value = "float_model")]
    output: PathBuf,
}

#[derive(Parser, Debug)]
struct ValidateArgs {
    #[arg(long)]
    model_path: PathBuf,
    #[arg(long, default_value = "./cifar10")]
    data_path: PathBuf,
    #[arg(long, default_value_t = 256)]
    batch_size: usize,
    #[arg(long, default_value_t = 8)]
    workers: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => cmd_run(args),
        Command::InitModel(args) => cmd_init_model(args),
        Command::Validate(args) => cmd_validate(args),
    }
}

// ── Command implementations ─────────────────────────────────────────────────

fn provider(config: &PipelineConfig) -> Cifar10Provider {
    let mut provider = Cifar10Provider::new(&config.data.data_path, config.data.image_size, config.data.batch_size);
    provider.workers = config.data.workers;
    provider.download = config.data.download;
    provider.seed = config.data.seed;
    provider
}

fn cmd_run(args: RunArgs) -> Result<()> {
    let (config, save_config) = args.into_config()?;
    if let Some(path) = save_config {
        config.save(&path)?;
        tracing::info!(path = %path.display(), "Wrote pipeline config");
    }

    let device = Device::cuda_if_available(0)?;
    let data = provider(&config);
    let mut coordinator = QatCoordinator::new(config, QatQuantizer, MobileConverter, data, device);
    let report = coordinator.run()?;

    tracing::info!(
        float = format!("{:.2}%", report.float_accuracy * 100.0),
        frozen = format!("{:.2}%", report.frozen_accuracy * 100.0),
        artifact = %report.export.path.display(),
        bytes = report.export.bytes,
        "Pipeline finished"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn cmd_init_model(args: InitModelArgs) -> Result<()> {
    let config = match &args.model_config {
        Some(path) => ModelConfig::load(path)?,
        None => ModelConfig::default(),
    };
    let model = FloatModel::new(&config, &Device::Cpu)?;
    model.save_dir(&args.output)?;
    eprintln!(
        "Wrote {} ({} parameters) to {}",
        config.name,
        model.num_params(),
        args.output.display()
    );
    Ok(())
}

fn cmd_validate(args: ValidateArgs) -> Result<()> {
    let device = Device::cuda_if_available(0)?;
    let mut model = FloatModel::load_dir(&args.model_path, &device)?;
    let [_, size, _] = model.config().input_shape;
    let mut data = Cifar10Provider::new(args.data_path, size, args.batch_size);
    data.workers = args.workers;
    let (_, val) = data.loaders(LoaderPurpose::Float)?;
    let mut ctx = TrainingContext::new(device);
    ctx.val_loader = Some(val);
    let accuracy = run_validation(&mut model, &ctx)?;
    report_accuracy("float", accuracy);
    println!("{:.4}", accuracy);
    Ok(())
}
