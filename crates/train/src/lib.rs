//! # qat-train: Epoch Runner
//!
//! Everything a training phase needs besides the model:
//!
//! * **[`TrainingContext`]** - loaders, criterion, optimiser, schedule and
//!   named custom arguments (distillation settings) for one phase.
//! * **[`ScheduleComposer`]** - routes steps to a warmup schedule first,
//!   then to the main schedule.
//! * **[`Optim`]** - AdamW or SGD with momentum.
//! * **[`train`]** - the epoch loop over [`run_train_epoch`] (or the
//!   distilled variant) and [`run_validation`].

pub mod context;
pub mod optimizer;
pub mod runner;
pub mod scheduler;

pub use context::{
    distillation_kl, Criterion, CustomArg, Distillation, TrainingContext, DISTILL_ALPHA,
    DISTILL_TEACHER, DISTILL_TEMPERATURE,
};
pub use optimizer::{Optim, ParamsSgd, SgdMomentum};
pub use runner::{
    clip_grad_norm, grad_norm, report_accuracy, run_train_epoch, run_train_epoch_distill,
    run_validation, train, EpochRecord, TrainFn, ValidateFn,
};
pub use scheduler::{
    ConstantLr, CosineAnnealing, CyclicLr, Granularity, LinearWarmup, LrSchedule, Route,
    ScheduleComposer, WarmupPolicy,
};
