//! Per-phase training context.

use std::collections::HashMap;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_nn::{loss, ops};
use serde::{Deserialize, Serialize};

use qat_common::{DataLoader, QatError, Result};
use qat_core::Classifier;

use crate::optimizer::Optim;
use crate::scheduler::ScheduleComposer;

/// Distillation weight of the KL term.
pub const DISTILL_ALPHA: &str = "distill_A";
/// Distillation temperature.
pub const DISTILL_TEMPERATURE: &str = "distill_T";
/// Frozen teacher model.
pub const DISTILL_TEACHER: &str = "distill_teacher";

/// Loss function of a phase: a pure function of `(logits, labels)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    #[default]
    CrossEntropy,
    /// Binary cross-entropy on logits against one-hot targets.
    BceWithLogits,
}

impl Criterion {
    pub fn loss(&self, logits: &Tensor, labels: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::CrossEntropy => loss::cross_entropy(logits, labels),
            Self::BceWithLogits => {
                let classes = logits.dim(1)?;
                let targets = one_hot(labels, classes)?;
                loss::binary_cross_entropy_with_logit(logits, &targets)
            }
        }
    }
}

fn one_hot(labels: &Tensor, classes: usize) -> candle_core::Result<Tensor> {
    let ids = Tensor::arange(0u32, classes as u32, labels.device())?.unsqueeze(0)?;
    labels
        .to_dtype(DType::U32)?
        .unsqueeze(1)?
        .broadcast_eq(&ids)?
        .to_dtype(DType::F32)
}

/// `KL(softmax(teacher/T) ‖ softmax(student/T))`, mean over the batch.
pub fn distillation_kl(student: &Tensor, teacher: &Tensor, temperature: f64) -> candle_core::Result<Tensor> {
    let log_p_student = ops::log_softmax(&student.affine(1.0 / temperature, 0.0)?, 1)?;
    let log_p_teacher = ops::log_softmax(&teacher.affine(1.0 / temperature, 0.0)?, 1)?;
    let p_teacher = log_p_teacher.exp()?;
    let batch = student.dim(0)? as f64;
    (p_teacher * (log_p_teacher - log_p_student)?)?
        .sum_all()?
        .affine(1.0 / batch, 0.0)
}

/// Opaque extra argument keyed by name in [`TrainingContext::custom_args`].
#[derive(Clone)]
pub enum CustomArg {
    Scalar(f64),
    Model(Arc<dyn Classifier>),
}

/// Resolved distillation settings.
pub struct Distillation {
    pub alpha: f64,
    pub temperature: f64,
    pub teacher: Arc<dyn Classifier>,
}

/// Everything one training phase needs. Created by the coordinator for the
/// phase and dropped after it.
pub struct TrainingContext {
    pub device: Device,
    pub train_loader: Option<Box<dyn DataLoader>>,
    pub val_loader: Option<Box<dyn DataLoader>>,
    pub criterion: Criterion,
    pub optimizer: Option<Optim>,
    pub schedule: Option<ScheduleComposer>,
    pub max_epoch: usize,
    /// Clip the global gradient L2 norm to this value before each step.
    pub grad_clip: Option<f64>,
    /// Data-parallel shard count; the coordinator wraps the model in
    /// `DataParallel` when this exceeds 1.
    pub replicas: usize,
    pub custom_args: HashMap<String, CustomArg>,
}

impl TrainingContext {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            train_loader: None,
            val_loader: None,
            criterion: Criterion::default(),
            optimizer: None,
            schedule: None,
            max_epoch: 0,
            grad_clip: None,
            replicas: 1,
            custom_args: HashMap::new(),
        }
    }

    pub fn train_loader(&self) -> Result<&dyn DataLoader> {
        self.train_loader
            .as_deref()
            .ok_or_else(|| QatError::config("training loader is not set"))
    }

    pub fn val_loader(&self) -> Result<&dyn DataLoader> {
        self.val_loader
            .as_deref()
            .ok_or_else(|| QatError::config("validation loader is not set"))
    }

    /// Register distillation against `teacher`.
    pub fn set_distillation(&mut self, alpha: f64, temperature: f64, teacher: Arc<dyn Classifier>) {
        self.custom_args.insert(DISTILL_ALPHA.into(), CustomArg::Scalar(alpha));
        self.custom_args
            .insert(DISTILL_TEMPERATURE.into(), CustomArg::Scalar(temperature));
        self.custom_args
            .insert(DISTILL_TEACHER.into(), CustomArg::Model(teacher));
    }

    fn scalar(&self, key: &str) -> Result<f64> {
        match self.custom_args.get(key) {
            Some(CustomArg::Scalar(v)) => Ok(*v),
            Some(CustomArg::Model(_)) => Err(QatError::config(format!("custom arg {key} must be a number"))),
            None => Err(QatError::config(format!("custom arg {key} is missing"))),
        }
    }

    /// Distillation settings from `custom_args`.
    pub fn distillation(&self) -> Result<Distillation> {
        let alpha = self.scalar(DISTILL_ALPHA)?;
        let temperature = self.scalar(DISTILL_TEMPERATURE)?;
        if !(0.0..=1.0).contains(&alpha) {
            return Err(QatError::config(format!("{DISTILL_ALPHA} must lie in [0, 1], got {alpha}")));
        }
        if temperature <= 0.0 {
            return Err(QatError::config(format!("{DISTILL_TEMPERATURE} must be positive, got {temperature}")));
        }
        let teacher = match self.custom_args.get(DISTILL_TEACHER) {
            Some(CustomArg::Model(m)) => Arc::clone(m),
            _ => return Err(QatError::config(format!("custom arg {DISTILL_TEACHER} must be a model"))),
        };
        Ok(Distillation {
            alpha,
            temperature,
            teacher,
        })
    }
}
