//! Pipeline configuration, states and the run report.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use qat_common::{ExportOptions, QatError, QuantizerConfig, Result};
use qat_export::ExportSummary;
use qat_train::{Criterion, EpochRecord, Granularity, WarmupPolicy};

// ── States ──────────────────────────────────────────────────────────────────

/// Lifecycle of the model the coordinator drives. `Converted` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Float,
    Instrumented,
    Training,
    Frozen,
    Converted,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Float => "float",
            Self::Instrumented => "instrumented",
            Self::Training => "training",
            Self::Frozen => "frozen",
            Self::Converted => "converted",
        };
        f.write_str(name)
    }
}

// ── Configuration ───────────────────────────────────────────────────────────

/// Optional branches of the pipeline. Every combination is valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    #[serde(default)]
    pub pruning: bool,
    #[serde(default)]
    pub finetune: bool,
    #[serde(default = "default_true")]
    pub warmup: bool,
    #[serde(default = "default_true")]
    pub distillation: bool,
    #[serde(default = "default_true")]
    pub parallel: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            pruning: false,
            finetune: false,
            warmup: true,
            distillation: true,
            parallel: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    AdamW,
    Sgd,
}

/// Hyper-parameters of one training phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub max_epoch: usize,
    pub optimizer: OptimizerKind,
    pub lr: f64,
    pub weight_decay: f64,
    /// SGD only.
    #[serde(default)]
    pub momentum: f64,
    #[serde(default)]
    pub criterion: Criterion,
    /// Floor of the cosine schedule.
    #[serde(default)]
    pub eta_min: f64,
    #[serde(default)]
    pub granularity: Granularity,
    #[serde(default)]
    pub grad_clip: Option<f64>,
    /// Ramp the LR up before the main schedule (needs `features.warmup`).
    #[serde(default)]
    pub warmup: bool,
    /// Distil from the float model (needs `features.distillation`).
    #[serde(default)]
    pub distillation: bool,
}

impl PhaseConfig {
    /// Float fine-tuning after pruning: SGD, BCE, five epochs.
    pub fn finetune() -> Self {
        Self {
            max_epoch: 5,
            optimizer: OptimizerKind::Sgd,
            lr: 0.1,
            weight_decay: 5e-4,
            momentum: 0.9,
            criterion: Criterion::BceWithLogits,
            eta_min: 0.0,
            granularity: Granularity::Epoch,
            grad_clip: None,
            warmup: true,
            distillation: true,
        }
    }

    /// Quantization-aware training: AdamW, cross-entropy, twenty epochs,
    /// no warmup or distillation.
    pub fn qat() -> Self {
        Self {
            max_epoch: 20,
            optimizer: OptimizerKind::AdamW,
            lr: 1e-3,
            weight_decay: 5e-4,
            momentum: 0.0,
            criterion: Criterion::CrossEntropy,
            eta_min: 0.0,
            granularity: Granularity::Epoch,
            grad_clip: None,
            warmup: false,
            distillation: false,
        }
    }
}

/// Learning-rate warmup ahead of the main schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmupConfig {
    #[serde(default = "default_warmup_epochs")]
    pub epochs: usize,
    #[serde(default)]
    pub policy: WarmupPolicy,
    #[serde(default)]
    pub base_lr: f64,
    /// Peak learning rate; the phase LR when unset.
    #[serde(default)]
    pub max_lr: Option<f64>,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            epochs: default_warmup_epochs(),
            policy: WarmupPolicy::Cyclic,
            base_lr: 0.0,
            max_lr: None,
        }
    }
}

/// Knowledge-distillation weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistillConfig {
    /// Weight `A` of the KL term.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// Softmax temperature `T`.
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

impl Default for DistillConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            temperature: default_temperature(),
        }
    }
}

/// Where the CLI finds CIFAR-10 and how it batches it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
    #[serde(default = "default_image_size")]
    pub image_size: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_true")]
    pub download: bool,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_path: default_data_path(),
            image_size: default_image_size(),
            batch_size: default_batch_size(),
            workers: default_workers(),
            download: true,
            seed: default_seed(),
        }
    }
}

/// Everything a pipeline run needs. Loaded from JSON, overridden by CLI flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Directory holding `model.json` + `model.safetensors`. Required.
    #[serde(default)]
    pub model_path: Option<PathBuf>,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Exported artifact; `work_dir/qat_model.qmdl` when unset.
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub features: FeatureFlags,
    #[serde(default = "PhaseConfig::finetune")]
    pub finetune: PhaseConfig,
    #[serde(default = "PhaseConfig::qat")]
    pub qat: PhaseConfig,
    #[serde(default)]
    pub warmup: WarmupConfig,
    #[serde(default)]
    pub distillation: DistillConfig,
    #[serde(default)]
    pub quantizer: QuantizerConfig,
    #[serde(default)]
    pub export: ExportOptions,
    /// Data-parallel shards; the number of available cores when unset.
    #[serde(default)]
    pub replicas: Option<usize>,
    /// Stop updating observers after this many QAT epochs.
    #[serde(default)]
    pub freeze_observer_epoch: Option<usize>,
    /// Warn when frozen accuracy falls more than this below float accuracy.
    #[serde(default)]
    pub max_accuracy_drop: Option<f64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            work_dir: default_work_dir(),
            output_path: None,
            data: DataConfig::default(),
            features: FeatureFlags::default(),
            finetune: PhaseConfig::finetune(),
            qat: PhaseConfig::qat(),
            warmup: WarmupConfig::default(),
            distillation: DistillConfig::default(),
            quantizer: QuantizerConfig::default(),
            export: ExportOptions::default(),
            replicas: None,
            freeze_observer_epoch: None,
            max_accuracy_drop: None,
        }
    }
}

impl PipelineConfig {
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| QatError::config(format!("cannot read {}: {e}", path.display())))?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn output_path(&self) -> PathBuf {
        self.output_path
            .clone()
            .unwrap_or_else(|| self.work_dir.join("qat_model.qmdl"))
    }

    pub fn replicas(&self) -> usize {
        if !self.features.parallel {
            return 1;
        }
        self.replicas
            .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, |n| n.get()))
            .max(1)
    }
}

fn default_true() -> bool {
    true
}
fn default_warmup_epochs() -> usize {
    10
}
fn default_alpha() -> f64 {
    0.3
}
fn default_temperature() -> f64 {
    6.0
}
fn default_data_path() -> PathBuf {
    PathBuf::from("./cifar10")
}
fn default_image_size() -> usize {
    32
}
fn default_batch_size() -> usize {
    256
}
fn default_workers() -> usize {
    8
}
fn default_seed() -> u64 {
    42
}
fn default_work_dir() -> PathBuf {
    PathBuf::from("out")
}

// ── Report ──────────────────────────────────────────────────────────────────

/// FLOP counts around a pruning pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PruningReport {
    pub flops_before: u64,
    pub flops_after: u64,
    pub accuracy: f64,
}

impl PruningReport {
    /// Relative FLOP reduction in percent.
    pub fn reduction(&self) -> f64 {
        if self.flops_before == 0 {
            return 0.0;
        }
        100.0 * (self.flops_before as f64 - self.flops_after as f64) / self.flops_before as f64
    }
}

/// Outcome of a full [`run`](crate::QatCoordinator::run).
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    /// States in the order they were entered.
    pub states: Vec<PipelineState>,
    pub float_accuracy: f64,
    pub pruning: Option<PruningReport>,
    pub finetune_history: Vec<EpochRecord>,
    pub qat_history: Vec<EpochRecord>,
    pub frozen_accuracy: f64,
    pub plan_path: PathBuf,
    pub metrics_path: PathBuf,
    pub qat_weights_path: PathBuf,
    pub export: ExportSummary,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_cifar_recipe() {
        let config = PipelineConfig::default();
        assert!(config.model_path.is_none());
        assert_eq!(config.data.batch_size, 256);
        assert_eq!(config.data.workers, 8);
        assert!(config.features.parallel && config.features.warmup && config.features.distillation);
        assert_eq!(config.qat.max_epoch, 20);
        assert_eq!(config.finetune.optimizer, OptimizerKind::Sgd);
        assert!(config.finetune.warmup && config.finetune.distillation);
        assert!(!config.qat.warmup && !config.qat.distillation);
        assert_eq!(config.distillation.alpha, 0.3);
        assert_eq!(config.output_path(), PathBuf::from("out").join("qat_model.qmdl"));
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"model_path": "m", "features": {"parallel": false}}"#).unwrap();
        assert_eq!(config.model_path, Some(PathBuf::from("m")));
        assert!(!config.features.parallel);
        assert!(config.features.warmup);
        assert_eq!(config.replicas(), 1);
        assert_eq!(config.qat, PhaseConfig::qat());
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        let mut config = PipelineConfig::default();
        config.freeze_observer_epoch = Some(3);
        config.save(&path).unwrap();
        assert_eq!(PipelineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn pruning_reduction_percent() {
        let report = PruningReport {
            flops_before: 200,
            flops_after: 150,
            accuracy: 0.5,
        };
        assert!((report.reduction() - 25.0).abs() < 1e-12);
    }
}
