//! The [`Converter`] seam and the shipped [`MobileConverter`].

use std::path::{Path, PathBuf};

use candle_core::Tensor;
use serde::Serialize;

use qat_common::{ExportOptions, QatError, Result, TargetType};
use qat_core::model::check_input;
use qat_core::{Classifier, FrozenModel};

use crate::graph::LoweringGraph;
use crate::writer::{c_array, c_symbol, encode, ModelMeta};

/// Lowers a frozen model into a deployable artifact at `output_path`.
pub trait Converter {
    fn convert(
        &self,
        model: &FrozenModel,
        repr: &Tensor,
        output_path: &Path,
        options: &ExportOptions,
    ) -> Result<ExportSummary>;
}

/// What a conversion produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportSummary {
    pub path: PathBuf,
    pub c_array_path: Option<PathBuf>,
    pub bytes: u64,
    pub num_tensors: usize,
    pub num_ops: usize,
    pub opcodes: Vec<String>,
    pub fused_quant_dequant: usize,
    pub lut_rewrites: usize,
    pub dropped_reshapes: usize,
}

/// Int8 / uint8 `.qmdl` converter for mobile and micro runtimes.
#[derive(Debug, Clone, Copy, Default)]
pub struct MobileConverter;

impl MobileConverter {
    fn check(model: &FrozenModel, repr: &Tensor, options: &ExportOptions) -> Result<()> {
        if model.backend() != options.backend {
            return Err(QatError::conversion(format!(
                "model was quantized for {:?} but export targets {:?}",
                model.backend(),
                options.backend
            )));
        }
        if options.quantize_target_type == TargetType::Uint8 && model.has_per_channel_weights() {
            return Err(QatError::conversion(
                "per-channel weights require the int8 target type",
            ));
        }
        check_input(repr, &model.input_shape())?;
        Ok(())
    }
}

impl Converter for MobileConverter {
    fn convert(
        &self,
        model: &FrozenModel,
        repr: &Tensor,
        output_path: &Path,
        options: &ExportOptions,
    ) -> Result<ExportSummary> {
        Self::check(model, repr, options)?;
        let traced = model.forward(repr)?;
        tracing::debug!(shape = ?traced.dims(), "Traced representative input");

        let mut graph = LoweringGraph::from_frozen(model);
        let fused_quant_dequant = if options.fuse_quant_dequant {
            graph.fuse_quant_dequant()
        } else {
            0
        };
        let lut_rewrites = if options.rewrite_quantizable {
            graph.rewrite_quantizable()
        } else {
            0
        };
        let dropped_reshapes = if options.micro_runtime_rewrite {
            graph.micro_runtime_rewrite()?
        } else {
            0
        };
        let lowered = graph.lower(options.quantize_target_type)?;

        let meta = ModelMeta {
            name: model.name().to_string(),
            input_shape: model.input_shape(),
            num_classes: model.num_classes(),
            backend: model.backend(),
            target: options.quantize_target_type,
            inputs: lowered.inputs.clone(),
            outputs: lowered.outputs.clone(),
        };
        let bytes = encode(&lowered, &meta)?;
        if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(output_path, &bytes)?;

        let c_array_path = if options.emit_c_array {
            let path = output_path.with_extension("h");
            let stem = output_path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            std::fs::write(&path, c_array(&bytes, &c_symbol(&stem)))?;
            Some(path)
        } else {
            None
        };

        let summary = ExportSummary {
            path: output_path.to_path_buf(),
            c_array_path,
            bytes: bytes.len() as u64,
            num_tensors: lowered.tensors.len(),
            num_ops: lowered.ops.len(),
            opcodes: lowered.ops.iter().map(|op| op.opcode.name().to_string()).collect(),
            fused_quant_dequant,
            lut_rewrites,
            dropped_reshapes,
        };
        tracing::info!(
            path = %output_path.display(),
            bytes = summary.bytes,
            ops = summary.num_ops,
            tensors = summary.num_tensors,
            target = ?options.quantize_target_type,
            "Exported model"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{frozen_model, gelu_head_config, mlp_config, representative};
    use crate::writer::read_qmdl;
    use candle_core::{DType, Device};
    use qat_common::{ErrorKind, QuantBackend};

    #[test]
    fn exports_mlp_with_default_options() {
        let dir = tempfile::tempdir().unwrap();
        let config = mlp_config();
        let frozen = frozen_model(&config, false);
        let path = dir.path().join("out").join("mlp.qmdl");
        let summary = MobileConverter
            .convert(&frozen, &representative(&config), &path, &ExportOptions::default())
            .unwrap();
        assert!(path.is_file());
        assert_eq!(summary.dropped_reshapes, 1);
        assert_eq!(
            summary.opcodes,
            vec!["QUANTIZE", "FULLY_CONNECTED", "FULLY_CONNECTED", "DEQUANTIZE"]
        );
        let file = read_qmdl(&path).unwrap();
        assert_eq!(file.meta.name, "mlp");
        assert_eq!(file.ops.len(), summary.num_ops);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), summary.bytes);
    }

    #[test]
    fn gelu_model_exports_through_lookup_table() {
        let dir = tempfile::tempdir().unwrap();
        let config = gelu_head_config();
        let frozen = frozen_model(&config, false);
        let options = ExportOptions {
            emit_c_array: true,
            ..Default::default()
        };
        let path = dir.path().join("gelu.qmdl");
        let summary = MobileConverter
            .convert(&frozen, &representative(&config), &path, &options)
            .unwrap();
        assert_eq!(summary.lut_rewrites, 1);
        assert!(summary.opcodes.contains(&"LUT".to_string()));
        let header = summary.c_array_path.unwrap();
        assert!(std::fs::read_to_string(header).unwrap().contains("gelu_len"));
    }

    #[test]
    fn backend_mismatch_is_a_conversion_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = mlp_config();
        let frozen = frozen_model(&config, false);
        let options = ExportOptions {
            backend: QuantBackend::Fbgemm,
            ..Default::default()
        };
        let err = MobileConverter
            .convert(&frozen, &representative(&config), &dir.path().join("m.qmdl"), &options)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conversion);
    }

    #[test]
    fn per_channel_uint8_is_a_conversion_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = mlp_config();
        let frozen = frozen_model(&config, false);
        let options = ExportOptions {
            quantize_target_type: TargetType::Uint8,
            ..Default::default()
        };
        let err = MobileConverter
            .convert(&frozen, &representative(&config), &dir.path().join("m.qmdl"), &options)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conversion);

        let per_tensor = frozen_model(&config, true);
        MobileConverter
            .convert(&per_tensor, &representative(&config), &dir.path().join("u.qmdl"), &options)
            .unwrap();
    }

    #[test]
    fn representative_shape_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let frozen = frozen_model(&mlp_config(), false);
        let repr = Tensor::zeros((1, 3, 8, 8), DType::F32, &Device::Cpu).unwrap();
        let err = MobileConverter
            .convert(&frozen, &repr, &dir.path().join("m.qmdl"), &ExportOptions::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ShapeMismatch);
        assert!(!dir.path().join("m.qmdl").exists());
    }

    #[test]
    fn float_op_without_rewrites_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = gelu_head_config();
        let frozen = frozen_model(&config, false);
        let options = ExportOptions {
            rewrite_quantizable: false,
            micro_runtime_rewrite: false,
            ..Default::default()
        };
        let err = MobileConverter
            .convert(&frozen, &representative(&config), &dir.path().join("g.qmdl"), &options)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conversion);
    }
}
