//! Epoch runner: one pass of training (plain or distilled), validation, and
//! the multi-epoch [`train`] loop.
//!
//! Each training step runs forward, loss, backward, optional gradient
//! clipping, sets the optimiser LR from the schedule, steps the optimiser,
//! and advances the schedule when it is warming up or stepped per batch.
//! Warmup always advances per batch; an epoch-granular main schedule only
//! advances at the end of epochs that began past warmup.

use candle_core::{backprop::GradStore, DType, Device, Tensor, Var};
use indicatif::{ProgressBar, ProgressStyle};

use qat_common::{DataLoader, QatError, Result};
use qat_core::{Classifier, Mode};

use crate::context::{distillation_kl, TrainingContext};
use crate::scheduler::Granularity;

/// Metrics of one finished epoch.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_accuracy: f64,
    /// Learning rate the next step would use.
    pub lr: f64,
}

/// Signature of an epoch trainer (`run_train_epoch` or the distilled one).
pub type TrainFn<M> = fn(&mut M, &mut TrainingContext) -> Result<f64>;
/// Signature of a validation pass.
pub type ValidateFn<M> = fn(&mut M, &TrainingContext) -> Result<f64>;

fn progress_bar(len: usize, label: &str) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    let style = ProgressStyle::with_template("[{elapsed_precise}] {prefix} {bar:40} {pos}/{len} {msg}")
        .map(|s| s.progress_chars("=>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_prefix(label.to_string());
    pb
}

// ── Training ────────────────────────────────────────────────────────────────

/// One epoch with the context's criterion. Returns the mean batch loss.
pub fn run_train_epoch<M: Classifier + ?Sized>(model: &mut M, ctx: &mut TrainingContext) -> Result<f64> {
    let criterion = ctx.criterion;
    train_epoch_with(model, ctx, "train", move |logits, _images, labels| {
        Ok(criterion.loss(logits, labels)?)
    })
}

/// One epoch of knowledge distillation:
/// `(1 - A)·criterion + A·T²·KL(teacher ‖ student)` at temperature `T`.
///
/// The teacher runs with detached outputs and is never updated.
pub fn run_train_epoch_distill<M: Classifier + ?Sized>(model: &mut M, ctx: &mut TrainingContext) -> Result<f64> {
    let criterion = ctx.criterion;
    let distill = ctx.distillation()?;
    if distill.teacher.mode() != Mode::Eval {
        tracing::warn!("Distillation teacher is not in evaluation mode");
    }
    let t = distill.temperature;
    let alpha = distill.alpha;
    train_epoch_with(model, ctx, "distill", move |logits, images, labels| {
        let hard = criterion.loss(logits, labels)?;
        let teacher_logits = distill.teacher.forward(images)?.detach();
        let soft = distillation_kl(logits, &teacher_logits, t)?;
        Ok(((hard * (1.0 - alpha))? + (soft * (alpha * t * t))?)?)
    })
}

fn train_epoch_with<M, F>(model: &mut M, ctx: &mut TrainingContext, label: &str, loss_fn: F) -> Result<f64>
where
    M: Classifier + ?Sized,
    F: Fn(&Tensor, &Tensor, &Tensor) -> Result<Tensor>,
{
    model.set_mode(Mode::Train)?;
    model.set_grad_enabled(true)?;

    let TrainingContext {
        device,
        train_loader,
        optimizer,
        schedule,
        grad_clip,
        ..
    } = ctx;
    let loader = train_loader
        .as_deref()
        .ok_or_else(|| QatError::config("training loader is not set"))?;
    let optimizer = optimizer
        .as_mut()
        .ok_or_else(|| QatError::config("optimizer is not set"))?;
    let vars = model.trainable_vars();

    let warm_at_start = schedule.as_ref().is_some_and(|s| s.in_warmup());
    let pb = progress_bar(loader.num_batches(), label);
    let mut total = 0.0f64;
    let mut batches = 0usize;
    for batch in loader.batches() {
        let (images, labels) = batch?.to_tensors(device)?;
        let logits = model.forward(&images)?;
        let loss = loss_fn(&logits, &images, &labels)?;
        let mut grads = loss.backward()?;
        if let Some(max_norm) = *grad_clip {
            clip_grad_norm(&mut grads, &vars, max_norm)?;
        }
        if let Some(schedule) = schedule.as_ref() {
            optimizer.set_learning_rate(schedule.current_lr());
        }
        optimizer.step(&grads)?;
        if let Some(schedule) = schedule.as_mut() {
            if schedule.in_warmup() || schedule.granularity() == Granularity::Batch {
                schedule.step();
            }
        }

        let loss = loss.to_scalar::<f32>()? as f64;
        total += loss;
        batches += 1;
        tracing::debug!(batch = batches, loss, lr = optimizer.learning_rate(), "Train step");
        pb.set_message(format!("loss {loss:.4}"));
        pb.inc(1);
    }
    if let Some(schedule) = schedule.as_mut() {
        if schedule.granularity() == Granularity::Epoch && !warm_at_start {
            schedule.step();
        }
    }
    pb.finish_and_clear();

    if batches == 0 {
        return Err(QatError::config("training loader yielded no batches"));
    }
    Ok(total / batches as f64)
}

// ── Validation ──────────────────────────────────────────────────────────────

/// Top-1 accuracy over the validation loader in evaluation mode.
///
/// Gradient tracking is off for the pass and restored afterwards; nothing
/// else in the model or context changes.
pub fn run_validation<M: Classifier + ?Sized>(model: &mut M, ctx: &TrainingContext) -> Result<f64> {
    let loader = ctx.val_loader()?;
    if loader.num_samples() == 0 {
        return Err(QatError::config("validation set is empty"));
    }
    let grad_was_enabled = model.grad_enabled();
    model.set_mode(Mode::Eval)?;
    model.set_grad_enabled(false)?;
    let accuracy = top1_accuracy(&*model, loader, &ctx.device);
    model.set_grad_enabled(grad_was_enabled)?;
    accuracy
}

fn top1_accuracy<M: Classifier + ?Sized>(model: &M, loader: &dyn DataLoader, device: &Device) -> Result<f64> {
    let mut correct = 0u64;
    let mut seen = 0u64;
    for batch in loader.batches() {
        let batch = batch?;
        let (images, labels) = batch.to_tensors(device)?;
        let preds = model.forward(&images)?.argmax(1)?;
        correct += preds
            .eq(&labels)?
            .to_dtype(DType::U32)?
            .sum_all()?
            .to_scalar::<u32>()? as u64;
        seen += batch.len() as u64;
    }
    if seen == 0 {
        return Err(QatError::config("validation set is empty"));
    }
    Ok(correct as f64 / seen as f64)
}

/// Log an accuracy under a label.
pub fn report_accuracy(label: &str, accuracy: f64) {
    tracing::info!(
        stage = label,
        accuracy = format!("{:.2}%", accuracy * 100.0),
        "Validation accuracy"
    );
}

// ── Loop ────────────────────────────────────────────────────────────────────

/// Run epochs `0..max_epoch`, validating after each. No early stopping.
///
/// `on_epoch_end` sees the model after validation and can adjust it (the
/// coordinator uses it to freeze observers) or persist metrics.
pub fn train<M, H>(
    model: &mut M,
    ctx: &mut TrainingContext,
    train_fn: TrainFn<M>,
    validate_fn: ValidateFn<M>,
    mut on_epoch_end: H,
) -> Result<Vec<EpochRecord>>
where
    M: Classifier + ?Sized,
    H: FnMut(&mut M, &EpochRecord) -> Result<()>,
{
    ctx.train_loader()?;
    ctx.val_loader()?;
    let mut history = Vec::with_capacity(ctx.max_epoch);
    for epoch in 0..ctx.max_epoch {
        let train_loss = train_fn(model, ctx)?;
        let val_accuracy = validate_fn(model, ctx)?;
        let lr = ctx
            .schedule
            .as_ref()
            .map(|s| s.current_lr())
            .or_else(|| ctx.optimizer.as_ref().map(|o| o.learning_rate()))
            .unwrap_or_default();
        let record = EpochRecord {
            epoch,
            train_loss,
            val_accuracy,
            lr,
        };
        tracing::info!(
            epoch,
            max_epoch = ctx.max_epoch,
            train_loss = format!("{train_loss:.4}"),
            val_accuracy = format!("{:.2}%", val_accuracy * 100.0),
            lr,
            "Epoch complete"
        );
        on_epoch_end(model, &record)?;
        history.push(record);
    }
    Ok(history)
}

// ── Gradient utilities ──────────────────────────────────────────────────────

/// Total L2 norm of gradients.
pub fn grad_norm(grads: &GradStore, vars: &[Var]) -> Result<f64> {
    let mut total = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    Ok(total.sqrt().max(1e-12))
}

/// Clip gradients so their global L2 norm ≤ `max_norm`.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<()> {
    let norm = grad_norm(grads, vars)?;
    if norm <= max_norm {
        return Ok(());
    }
    let scale = max_norm / norm;
    for var in vars {
        if let Some(g) = grads.remove(var.as_tensor()) {
            grads.insert(var.as_tensor(), g.affine(scale, 0.0)?);
        }
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────
