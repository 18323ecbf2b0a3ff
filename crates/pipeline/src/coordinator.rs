//! QAT lifecycle coordinator.
//!
//! Drives one model through `Float → Instrumented → Training → Frozen →
//! Converted`. The quantizer, converter, dataset provider and optional pruner
//! are injected; each transition is a public method and [`run`] chains them.
//!
//! [`run`]: QatCoordinator::run

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{Device, Tensor};

use qat_common::{DataLoader, DatasetProvider, LoaderPurpose, QatError, Result};
use qat_core::{
    Classifier, DataParallel, FloatModel, FrozenModel, InstrumentedModel, Mode, Quantizer, PLAN_FILE,
};
use qat_export::{Converter, ExportSummary};
use qat_train::{
    report_accuracy, run_train_epoch, run_train_epoch_distill, run_validation, train, CosineAnnealing,
    EpochRecord, Granularity, Optim, ParamsSgd, ScheduleComposer, TrainFn, TrainingContext,
};

use crate::types::{OptimizerKind, PhaseConfig, PipelineConfig, PipelineReport, PipelineState, PruningReport};

/// Metrics of every epoch, one CSV row each.
pub const METRICS_FILE: &str = "metrics.csv";
/// Trained QAT parameters.
pub const QAT_WEIGHTS_FILE: &str = "qat_model.safetensors";

/// Structured pruning collaborator. No implementation ships with the crate.
pub trait Pruner {
    fn calc_flops(&self, model: &FloatModel) -> Result<u64>;
    fn prune(&mut self, model: &mut FloatModel) -> Result<()>;
}

fn unwrap_parallel(model: &DataParallel<InstrumentedModel>) -> &InstrumentedModel {
    model.inner()
}

fn identity(model: &InstrumentedModel) -> &InstrumentedModel {
    model
}

/// Per-epoch QAT hook: log metrics, then stop observers once `freeze_at`
/// epochs have run.
fn qat_hook<'a, M: 'a>(
    observers: fn(&M) -> &InstrumentedModel,
    freeze_at: Option<usize>,
    mut metrics: Option<&'a mut MetricsWriter>,
) -> impl FnMut(&mut M, &EpochRecord) -> Result<()> + 'a {
    move |model, record| {
        if let Some(writer) = metrics.as_deref_mut() {
            writer.append("qat", record)?;
        }
        if freeze_at == Some(record.epoch + 1) {
            observers(model).set_observers_enabled(false);
            tracing::info!(epoch = record.epoch, "Froze activation observers");
        }
        Ok(())
    }
}

/// Run a phase's epochs through the plain or distilled trainer.
fn run_phase<M, H>(model: &mut M, ctx: &mut TrainingContext, distill: bool, hook: H) -> Result<Vec<EpochRecord>>
where
    M: Classifier,
    H: FnMut(&mut M, &EpochRecord) -> Result<()>,
{
    let train_fn: TrainFn<M> = if distill {
        run_train_epoch_distill::<M>
    } else {
        run_train_epoch::<M>
    };
    train(model, ctx, train_fn, run_validation::<M>, hook)
}

// ── Metrics ─────────────────────────────────────────────────────────────────

struct MetricsWriter {
    file: File,
}

impl MetricsWriter {
    fn create(path: &Path) -> Result<Self> {
        let mut file = File::create(path)?;
        writeln!(file, "phase,epoch,train_loss,val_accuracy,lr")?;
        Ok(Self { file })
    }

    fn append(&mut self, phase: &str, record: &EpochRecord) -> Result<()> {
        writeln!(
            self.file,
            "{phase},{},{:.6},{:.6},{:.6e}",
            record.epoch, record.train_loss, record.val_accuracy, record.lr
        )?;
        self.file.flush()?;
        Ok(())
    }
}

// ── Coordinator ─────────────────────────────────────────────────────────────

pub struct QatCoordinator<Q, C, D> {
    config: PipelineConfig,
    quantizer: Q,
    converter: C,
    provider: D,
    pruner: Option<Box<dyn Pruner>>,
    device: Device,
    states: Vec<PipelineState>,
    metrics: Option<MetricsWriter>,
}

impl<Q: Quantizer, C: Converter, D: DatasetProvider> QatCoordinator<Q, C, D> {
    pub fn new(config: PipelineConfig, quantizer: Q, converter: C, provider: D, device: Device) -> Self {
        Self {
            config,
            quantizer,
            converter,
            provider,
            pruner: None,
            device,
            states: Vec::new(),
            metrics: None,
        }
    }

    pub fn with_pruner(mut self, pruner: Box<dyn Pruner>) -> Self {
        self.pruner = Some(pruner);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Current state, `None` before a model is loaded.
    pub fn state(&self) -> Option<PipelineState> {
        self.states.last().copied()
    }

    /// States entered so far, in order.
    pub fn visited(&self) -> &[PipelineState] {
        &self.states
    }

    fn advance(&mut self, from: PipelineState, to: PipelineState) -> Result<()> {
        if self.state() != Some(from) {
            return Err(QatError::precondition(format!(
                "cannot enter {to} from {}",
                self.state().map_or_else(|| "unloaded".to_string(), |s| s.to_string())
            )));
        }
        tracing::info!(%from, %to, "State transition");
        self.states.push(to);
        Ok(())
    }

    // ── Config and loading ──────────────────────────────────────────────────

    /// Validate inputs before any stage runs. Returns the model directory.
    ///
    /// Touches nothing but the work directory: no loaders are built and no
    /// model is placed on a device.
    pub fn check_config(&self) -> Result<PathBuf> {
        let model_path = self
            .config
            .model_path
            .clone()
            .ok_or_else(|| QatError::config("no model path given; pass --model-path"))?;
        if self.config.features.pruning && self.pruner.is_none() {
            return Err(QatError::config("pruning is enabled but no pruner was supplied"));
        }
        let work_dir = &self.config.work_dir;
        std::fs::create_dir_all(work_dir)
            .map_err(|e| QatError::config(format!("cannot create work dir {}: {e}", work_dir.display())))?;
        let marker = work_dir.join(".writable");
        File::create(&marker)
            .and_then(|_| std::fs::remove_file(&marker))
            .map_err(|e| QatError::config(format!("work dir {} is not writable: {e}", work_dir.display())))?;
        Ok(model_path)
    }

    /// Load the float model onto the device and enter `Float`.
    pub fn load_float(&mut self, model_path: &Path) -> Result<FloatModel> {
        if !self.states.is_empty() {
            return Err(QatError::precondition("a model was already loaded"));
        }
        let model = FloatModel::load_dir(model_path, &self.device)?;
        self.states.push(PipelineState::Float);
        tracing::info!(state = %PipelineState::Float, model = %model.config().name, "Loaded model");
        Ok(model)
    }

    /// Random input in `[0, 1)` with the model's sample shape, on CPU.
    pub fn representative_input(&self, model: &FloatModel) -> Result<Tensor> {
        let [c, h, w] = model.config().input_shape;
        Ok(Tensor::rand(0f32, 1f32, (1, c, h, w), &Device::Cpu)?)
    }

    fn validation_context(&self, purpose: LoaderPurpose, device: &Device) -> Result<TrainingContext> {
        let (_, val) = self.provider.loaders(purpose)?;
        let mut ctx = TrainingContext::new(device.clone());
        ctx.val_loader = Some(val);
        Ok(ctx)
    }

    /// Top-1 accuracy of a float model on the float validation split.
    pub fn validate_float(&self, model: &mut FloatModel) -> Result<f64> {
        let ctx = self.validation_context(LoaderPurpose::Float, &self.device)?;
        let accuracy = run_validation(model, &ctx)?;
        report_accuracy("float", accuracy);
        Ok(accuracy)
    }

    // ── Optional float stages ───────────────────────────────────────────────

    /// Prune with the supplied pruner, then validate (not gated).
    pub fn prune(&mut self, model: &mut FloatModel) -> Result<PruningReport> {
        let pruner = self
            .pruner
            .as_mut()
            .ok_or_else(|| QatError::config("pruning is enabled but no pruner was supplied"))?;
        let flops_before = pruner.calc_flops(model)?;
        pruner.prune(model)?;
        let flops_after = pruner.calc_flops(model)?;
        let ctx = self.validation_context(LoaderPurpose::Float, &self.device)?;
        let accuracy = run_validation(model, &ctx)?;
        report_accuracy("pruned", accuracy);
        let report = PruningReport {
            flops_before,
            flops_after,
            accuracy,
        };
        tracing::info!(
            flops_before,
            flops_after,
            reduction = format!("{:.2}%", report.reduction()),
            "Pruning complete"
        );
        Ok(report)
    }

    fn phase_context(
        &self,
        phase: &PhaseConfig,
        purpose: LoaderPurpose,
        vars: Vec<candle_core::Var>,
        teacher: Option<Arc<dyn Classifier>>,
    ) -> Result<TrainingContext> {
        let (train_loader, val_loader) = self.provider.loaders(purpose)?;
        let batches = train_loader.num_batches().max(1);
        let steps_per_epoch = match phase.granularity {
            Granularity::Batch => batches,
            Granularity::Epoch => 1,
        };

        let mut ctx = TrainingContext::new(self.device.clone());
        ctx.train_loader = Some(train_loader);
        ctx.val_loader = Some(val_loader);
        ctx.criterion = phase.criterion;
        ctx.max_epoch = phase.max_epoch;
        ctx.grad_clip = phase.grad_clip;
        ctx.optimizer = Some(match phase.optimizer {
            OptimizerKind::AdamW => Optim::adamw(vars, phase.lr, phase.weight_decay)?,
            OptimizerKind::Sgd => Optim::sgd(
                vars,
                ParamsSgd {
                    lr: phase.lr,
                    momentum: phase.momentum,
                    weight_decay: phase.weight_decay,
                },
            )?,
        });

        let main = CosineAnnealing::new(phase.lr, phase.eta_min, (phase.max_epoch + 1) * steps_per_epoch);
        let cfg = &self.config.warmup;
        let warmup = (self.config.features.warmup && phase.warmup && cfg.epochs > 0).then(|| {
            let steps = cfg.epochs * batches;
            let schedule = cfg.policy.build(cfg.base_lr, cfg.max_lr.unwrap_or(phase.lr), steps);
            tracing::info!(steps, policy = ?cfg.policy, "Using warmup");
            (schedule, steps)
        });
        ctx.schedule = Some(ScheduleComposer::new(warmup, Box::new(main), phase.granularity));

        if let Some(teacher) = teacher {
            let d = &self.config.distillation;
            tracing::info!(alpha = d.alpha, temperature = d.temperature, "Using distillation");
            ctx.set_distillation(d.alpha, d.temperature, teacher);
        }
        Ok(ctx)
    }

    /// Float training phase, optionally distilled from `teacher`.
    pub fn finetune(
        &mut self,
        model: &mut FloatModel,
        teacher: Option<Arc<dyn Classifier>>,
    ) -> Result<Vec<EpochRecord>> {
        let phase = self.config.finetune.clone();
        let distill = teacher.is_some();
        let mut ctx = self.phase_context(&phase, LoaderPurpose::Float, model.trainable_vars(), teacher)?;
        tracing::info!(epochs = phase.max_epoch, "Fine-tuning float model");
        let metrics = self.metrics.as_mut();
        let history = match metrics {
            Some(writer) => run_phase(model, &mut ctx, distill, |_, rec| writer.append("finetune", rec))?,
            None => run_phase(model, &mut ctx, distill, |_, _| Ok(()))?,
        };
        Ok(history)
    }

    // ── Transitions ─────────────────────────────────────────────────────────

    /// `Float → Instrumented`: rewrite the float model for QAT.
    pub fn instrument(&mut self, model: &FloatModel, repr: &Tensor) -> Result<InstrumentedModel> {
        if self.state() != Some(PipelineState::Float) {
            return Err(QatError::precondition("instrumentation needs a loaded float model"));
        }
        let instrumented = self
            .quantizer
            .quantize(model, repr, &self.config.work_dir, &self.config.quantizer)?;
        self.advance(PipelineState::Float, PipelineState::Instrumented)?;
        Ok(instrumented)
    }

    /// `Instrumented → Training`: run the QAT epochs and save the trained
    /// parameters. Returns the unwrapped instrumented model.
    pub fn train_qat(
        &mut self,
        model: InstrumentedModel,
        teacher: Option<Arc<dyn Classifier>>,
    ) -> Result<(InstrumentedModel, Vec<EpochRecord>)> {
        self.advance(PipelineState::Instrumented, PipelineState::Training)?;
        let phase = self.config.qat.clone();
        let distill = teacher.is_some();
        let model = model.to_device(&self.device)?;
        let mut ctx = self.phase_context(&phase, LoaderPurpose::Quantization, model.trainable_vars(), teacher)?;
        ctx.replicas = self.config.replicas();

        let freeze_at = self.config.freeze_observer_epoch;
        let replicas = ctx.replicas;
        tracing::info!(epochs = phase.max_epoch, replicas, distill, "Quantization-aware training");

        let (mut model, history) = if replicas > 1 {
            let mut parallel = DataParallel::new(model, replicas);
            let hook = qat_hook(unwrap_parallel, freeze_at, self.metrics.as_mut());
            let history = run_phase(&mut parallel, &mut ctx, distill, hook)?;
            (parallel.into_inner(), history)
        } else {
            let mut model = model;
            let hook = qat_hook(identity, freeze_at, self.metrics.as_mut());
            let history = run_phase(&mut model, &mut ctx, distill, hook)?;
            (model, history)
        };

        let path = self.config.work_dir.join(QAT_WEIGHTS_FILE);
        model.save(&path)?;
        tracing::info!(path = %path.display(), "Saved QAT parameters");
        model.set_grad_enabled(false)?;
        Ok((model, history))
    }

    /// `Training → Frozen`: evaluation mode, no gradients, CPU, then convert.
    pub fn freeze(&mut self, model: InstrumentedModel) -> Result<FrozenModel> {
        if self.state() != Some(PipelineState::Training) {
            return Err(QatError::precondition("freezing needs a trained instrumented model"));
        }
        let mut model = model.to_device(&Device::Cpu)?;
        model.set_mode(Mode::Eval)?;
        model.set_grad_enabled(false)?;
        let frozen = self.quantizer.convert(model)?;
        self.advance(PipelineState::Training, PipelineState::Frozen)?;
        Ok(frozen)
    }

    /// Accuracy of the frozen model on the quantization validation split,
    /// compared against `float_accuracy`.
    pub fn validate_frozen(&self, model: &mut FrozenModel, float_accuracy: f64) -> Result<f64> {
        let ctx = self.validation_context(LoaderPurpose::Quantization, &Device::Cpu)?;
        let accuracy = run_validation(model, &ctx)?;
        report_accuracy("frozen", accuracy);
        let drop = float_accuracy - accuracy;
        tracing::info!(
            float = format!("{:.2}%", float_accuracy * 100.0),
            frozen = format!("{:.2}%", accuracy * 100.0),
            drop = format!("{:.2}%", drop * 100.0),
            "Quantization accuracy change"
        );
        if let Some(limit) = self.config.max_accuracy_drop {
            if drop > limit {
                tracing::warn!(drop, limit, "Frozen model lost more accuracy than allowed");
            }
        }
        Ok(accuracy)
    }

    /// `Frozen → Converted`: lower and write the mobile artifact.
    pub fn export(&mut self, model: &FrozenModel, repr: &Tensor) -> Result<ExportSummary> {
        if self.state() != Some(PipelineState::Frozen) {
            return Err(QatError::precondition("export needs a frozen model"));
        }
        let summary = self
            .converter
            .convert(model, repr, &self.config.output_path(), &self.config.export)?;
        self.advance(PipelineState::Frozen, PipelineState::Converted)?;
        Ok(summary)
    }

    // ── Full run ────────────────────────────────────────────────────────────

    pub fn run(&mut self) -> Result<PipelineReport> {
        let model_path = self.check_config()?;
        let metrics_path = self.config.work_dir.join(METRICS_FILE);
        self.metrics = Some(MetricsWriter::create(&metrics_path)?);
        let features = self.config.features;

        let mut float = self.load_float(&model_path)?;
        let finetune_teacher = if features.finetune {
            self.distillation_teacher(&self.config.finetune, &float)?
        } else {
            None
        };
        let mut float_accuracy = self.validate_float(&mut float)?;

        let pruning = if features.pruning {
            Some(self.prune(&mut float)?)
        } else {
            None
        };
        let finetune_history = if features.finetune {
            let history = self.finetune(&mut float, finetune_teacher)?;
            if let Some(last) = history.last() {
                float_accuracy = last.val_accuracy;
            }
            history
        } else {
            Vec::new()
        };

        let repr = self.representative_input(&float)?;
        let instrumented = self.instrument(&float, &repr)?;
        let qat_teacher = self.distillation_teacher(&self.config.qat, &float)?;
        let (trained, qat_history) = self.train_qat(instrumented, qat_teacher)?;
        let mut frozen = self.freeze(trained)?;
        let frozen_accuracy = self.validate_frozen(&mut frozen, float_accuracy)?;
        let export = self.export(&frozen, &repr)?;

        Ok(PipelineReport {
            states: self.states.clone(),
            float_accuracy,
            pruning,
            finetune_history,
            qat_history,
            frozen_accuracy,
            plan_path: self.config.work_dir.join(PLAN_FILE),
            metrics_path,
            qat_weights_path: self.config.work_dir.join(QAT_WEIGHTS_FILE),
            export,
        })
    }

    /// Frozen copy of `float` for `phase` to distil from, when both the
    /// feature flag and the phase ask for one.
    fn distillation_teacher(&self, phase: &PhaseConfig, float: &FloatModel) -> Result<Option<Arc<dyn Classifier>>> {
        if !(self.config.features.distillation && phase.distillation) {
            return Ok(None);
        }
        let mut teacher = float.deep_copy()?;
        teacher.set_mode(Mode::Eval)?;
        teacher.set_grad_enabled(false)?;
        Ok(Some(Arc::new(teacher)))
    }
}
