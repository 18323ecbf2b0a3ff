//! The [`Quantizer`] seam: float → instrumented → frozen.

use std::path::Path;

use candle_core::Tensor;

use qat_common::{QatError, QuantizerConfig, Result};

use crate::frozen::FrozenModel;
use crate::model::{check_input, Classifier, FloatModel, Mode};
use crate::qat::{InstrumentedModel, QatPlan};

/// Rewrite plan artifact written into the work directory.
pub const PLAN_FILE: &str = "qat_plan.json";

pub trait Quantizer {
    /// Build an instrumented copy of `model`, traced with `repr`.
    ///
    /// Deterministic for identical configuration and representative shape.
    fn quantize(
        &self,
        model: &FloatModel,
        repr: &Tensor,
        work_dir: &Path,
        config: &QuantizerConfig,
    ) -> Result<InstrumentedModel>;

    /// Freeze a trained instrumented model. Requires evaluation mode,
    /// gradient tracking off and CPU placement.
    fn convert(&self, model: InstrumentedModel) -> Result<FrozenModel>;
}

/// Fake-quant quantizer for sequential CNN / MLP graphs.
#[derive(Debug, Clone, Copy, Default)]
pub struct QatQuantizer;

impl QatQuantizer {
    fn resolve_plan(&self, plan: QatPlan, work_dir: &Path, config: &QuantizerConfig) -> Result<QatPlan> {
        let path = work_dir.join(PLAN_FILE);
        if path.is_file() && !config.force_overwrite {
            let existing = QatPlan::load(&path)
                .map_err(|e| QatError::rewrite(format!("unreadable plan {}: {e}", path.display())))?;
            if existing != plan {
                return Err(QatError::rewrite(format!(
                    "{} was produced for a different model or configuration; enable force_overwrite to replace it",
                    path.display()
                )));
            }
            tracing::info!(path = %path.display(), "Reusing existing rewrite plan");
            return Ok(existing);
        }
        plan.save(&path)?;
        tracing::debug!(path = %path.display(), ops = plan.ops.len(), "Wrote rewrite plan");
        Ok(plan)
    }
}

impl Quantizer for QatQuantizer {
    fn quantize(
        &self,
        model: &FloatModel,
        repr: &Tensor,
        work_dir: &Path,
        config: &QuantizerConfig,
    ) -> Result<InstrumentedModel> {
        check_input(repr, &model.config().input_shape)?;
        let plan = QatPlan::build(model.config(), config)?;
        let plan = self.resolve_plan(plan, work_dir, config)?;

        let instrumented = InstrumentedModel::from_float(model, plan, config)?;
        if config.set_quantizable_op_stats {
            instrumented.calibrate(&repr.to_device(model.device())?)?;
        }
        tracing::info!(
            model = %model.config().name,
            backend = ?config.backend,
            ops = instrumented.plan().ops.len(),
            calibrated = config.set_quantizable_op_stats,
            "Instrumented float model"
        );
        Ok(instrumented)
    }

    fn convert(&self, model: InstrumentedModel) -> Result<FrozenModel> {
        if model.mode() != Mode::Eval {
            return Err(QatError::precondition("model must be in evaluation mode to freeze"));
        }
        if model.grad_enabled() {
            return Err(QatError::precondition("gradient tracking must be off to freeze"));
        }
        if !model.device().is_cpu() {
            return Err(QatError::precondition(format!(
                "model must be on CPU to freeze, found {:?}",
                model.device()
            )));
        }
        FrozenModel::from_instrumented(&model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{dataset_tensors, tiny_mlp};
    use candle_core::{DType, Device};
    use qat_common::{ErrorKind, ImageDataset, LayerSpec};

    fn setup() -> (tempfile::TempDir, FloatModel, Tensor) {
        let dir = tempfile::tempdir().unwrap();
        let model = FloatModel::new(&tiny_mlp(), &Device::Cpu).unwrap();
        let repr = Tensor::randn(0f32, 1.0, (4, 1, 2, 2), &Device::Cpu).unwrap();
        (dir, model, repr)
    }

    #[test]
    fn quantize_writes_plan_and_calibrates() {
        let (dir, model, repr) = setup();
        let q = QatQuantizer.quantize(&model, &repr, dir.path(), &QuantizerConfig::default()).unwrap();
        assert!(dir.path().join(PLAN_FILE).is_file());
        assert!(q.observer_ranges().iter().all(|(_, r)| r.is_some()));
    }

    #[test]
    fn skipping_stats_leaves_observers_empty() {
        let (dir, model, repr) = setup();
        let config = QuantizerConfig {
            set_quantizable_op_stats: false,
            ..Default::default()
        };
        let q = QatQuantizer.quantize(&model, &repr, dir.path(), &config).unwrap();
        assert!(q.observer_ranges().iter().all(|(_, r)| r.is_none()));
    }

    #[test]
    fn representative_shape_mismatch() {
        let (dir, model, _) = setup();
        let repr = Tensor::zeros((1, 3, 32, 32), DType::F32, &Device::Cpu).unwrap();
        let err = QatQuantizer
            .quantize(&model, &repr, dir.path(), &QuantizerConfig::default())
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::ShapeMismatch);
    }

    #[test]
    fn stale_plan_requires_force_overwrite() {
        let (dir, model, repr) = setup();
        QatQuantizer.quantize(&model, &repr, dir.path(), &QuantizerConfig::default()).unwrap();

        let mut other = tiny_mlp();
        other.layers[1] = LayerSpec::Linear {
            out_features: 16,
            bias: true,
        };
        let other = FloatModel::new(&other, &Device::Cpu).unwrap();
        let keep = QuantizerConfig {
            force_overwrite: false,
            ..Default::default()
        };
        // Same layer kinds, same plan: reused.
        assert!(QatQuantizer.quantize(&other, &repr, dir.path(), &keep).is_ok());

        let symmetric = QuantizerConfig {
            force_overwrite: false,
            asymmetric: false,
            ..Default::default()
        };
        let err = QatQuantizer.quantize(&model, &repr, dir.path(), &symmetric).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::GraphRewrite);

        let overwrite = QuantizerConfig {
            asymmetric: false,
            ..Default::default()
        };
        assert!(QatQuantizer.quantize(&model, &repr, dir.path(), &overwrite).is_ok());
    }

    #[test]
    fn convert_checks_mode_and_grad() {
        let (dir, model, repr) = setup();
        let mut q = QatQuantizer.quantize(&model, &repr, dir.path(), &QuantizerConfig::default()).unwrap();
        q.set_mode(Mode::Train).unwrap();
        assert_eq!(QatQuantizer.convert(q).unwrap_err().kind(), ErrorKind::Precondition);

        let mut q = QatQuantizer.quantize(&model, &repr, dir.path(), &QuantizerConfig::default()).unwrap();
        q.set_mode(Mode::Eval).unwrap();
        assert_eq!(QatQuantizer.convert(q).unwrap_err().kind(), ErrorKind::Precondition);

        let mut q = QatQuantizer.quantize(&model, &repr, dir.path(), &QuantizerConfig::default()).unwrap();
        q.set_mode(Mode::Eval).unwrap();
        q.set_grad_enabled(false).unwrap();
        assert!(QatQuantizer.convert(q).is_ok());
    }

    #[test]
    fn frozen_logits_track_float() {
        let ds = ImageDataset::synthetic(2, 16, [1, 2, 2], 3).unwrap();
        let (x, y) = dataset_tensors(&ds);
        let dir = tempfile::tempdir().unwrap();
        let model = FloatModel::new(&tiny_mlp(), &Device::Cpu).unwrap();
        let mut q = QatQuantizer.quantize(&model, &x, dir.path(), &QuantizerConfig::default()).unwrap();
        q.set_mode(Mode::Eval).unwrap();
        q.set_grad_enabled(false).unwrap();
        let frozen = QatQuantizer.convert(q).unwrap();

        let a = model.forward(&x).unwrap();
        let b = frozen.forward(&x).unwrap();
        assert_eq!(b.dims(), &[32, 2]);
        let err = (a - b).unwrap().abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(err < 0.1, "max abs logit error {err}");
        assert_eq!(y.dims(), &[32]);
    }
}
