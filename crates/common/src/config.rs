//! Model, quantizer and export configuration.
//!
//! Serialised as JSON. Every optional field has a `#[serde(default)]` so
//! hand-written configs can stay short.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{QatError, Result};

// ── Model ───────────────────────────────────────────────────────────────────

/// One layer of a sequential classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerSpec {
    Conv2d {
        out_channels: usize,
        kernel_size: usize,
        #[serde(default = "default_one")]
        stride: usize,
        #[serde(default)]
        padding: usize,
        #[serde(default = "default_true")]
        bias: bool,
    },
    Linear {
        out_features: usize,
        #[serde(default = "default_true")]
        bias: bool,
    },
    Relu,
    Gelu,
    Flatten,
}

impl LayerSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Conv2d { .. } => "conv2d",
            Self::Linear { .. } => "linear",
            Self::Relu => "relu",
            Self::Gelu => "gelu",
            Self::Flatten => "flatten",
        }
    }
}

/// Architecture of a sequential image classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_name")]
    pub name: String,
    /// Per-sample input shape `(channels, height, width)`.
    pub input_shape: [usize; 3],
    pub num_classes: usize,
    pub layers: Vec<LayerSpec>,
}

fn default_model_name() -> String {
    "model".to_string()
}
fn default_one() -> usize {
    1
}
fn default_true() -> bool {
    true
}

impl Default for ModelConfig {
    /// Small three-stage CNN for 32×32 RGB inputs (CIFAR-10).
    fn default() -> Self {
        let conv = |out_channels, stride| LayerSpec::Conv2d {
            out_channels,
            kernel_size: 3,
            stride,
            padding: 1,
            bias: true,
        };
        Self {
            name: "cifar_cnn".to_string(),
            input_shape: [3, 32, 32],
            num_classes: 10,
            layers: vec![
                conv(16, 1),
                LayerSpec::Relu,
                conv(32, 2),
                LayerSpec::Relu,
                conv(64, 2),
                LayerSpec::Relu,
                LayerSpec::Flatten,
                LayerSpec::Linear {
                    out_features: 10,
                    bias: true,
                },
            ],
        }
    }
}

impl ModelConfig {
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.infer_shapes()?;
        Ok(config)
    }

    /// Propagate the per-sample shape through every layer.
    ///
    /// Returns `layers.len() + 1` shapes: the input of each layer followed by
    /// the model output. Fails if a layer receives a rank it cannot consume or
    /// the output is not `[num_classes]`.
    pub fn infer_shapes(&self) -> Result<Vec<Vec<usize>>> {
        let mut shapes = Vec::with_capacity(self.layers.len() + 1);
        let mut cur = self.input_shape.to_vec();
        for (i, layer) in self.layers.iter().enumerate() {
            shapes.push(cur.clone());
            let next = match (layer, cur.as_slice()) {
                (
                    LayerSpec::Conv2d {
                        out_channels,
                        kernel_size,
                        stride,
                        padding,
                        ..
                    },
                    [_, h, w],
                ) => {
                    if *stride == 0 || h + 2 * padding < *kernel_size || w + 2 * padding < *kernel_size
                    {
                        return Err(QatError::config(format!(
                            "layer {i}: conv2d kernel {kernel_size} does not fit input {h}x{w}"
                        )));
                    }
                    let oh = (h + 2 * padding - kernel_size) / stride + 1;
                    let ow = (w + 2 * padding - kernel_size) / stride + 1;
                    vec![*out_channels, oh, ow]
                }
                (LayerSpec::Linear { out_features, .. }, [_]) => vec![*out_features],
                (LayerSpec::Flatten, dims) => vec![dims.iter().product()],
                (LayerSpec::Relu | LayerSpec::Gelu, dims) => dims.to_vec(),
                (layer, dims) => {
                    return Err(QatError::config(format!(
                        "layer {i}: {} cannot consume an input of rank {}",
                        layer.kind(),
                        dims.len()
                    )))
                }
            };
            cur = next;
        }
        if cur != [self.num_classes] {
            return Err(QatError::config(format!(
                "model output {cur:?} does not match num_classes {}",
                self.num_classes
            )));
        }
        shapes.push(cur);
        Ok(shapes)
    }
}

// ── Quantizer ───────────────────────────────────────────────────────────────

/// Quantized-kernel backend the instrumented graph targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantBackend {
    /// Mobile kernels; full 8-bit activation range.
    Qnnpack,
    /// Server kernels; activations use a reduced 7-bit range.
    Fbgemm,
}

impl QuantBackend {
    pub fn reduce_range(&self) -> bool {
        matches!(self, Self::Fbgemm)
    }
}

/// Options for the float → QAT rewrite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizerConfig {
    #[serde(default = "default_backend")]
    pub backend: QuantBackend,
    /// Discard an instrumentation artifact left in the work directory.
    #[serde(default = "default_true")]
    pub force_overwrite: bool,
    /// Activations may use a non-zero zero point.
    #[serde(default = "default_true")]
    pub asymmetric: bool,
    /// Share one weight scale per tensor instead of one per output channel.
    #[serde(default)]
    pub per_tensor: bool,
    /// Run one calibration pass over the representative input so every
    /// observer starts with a range.
    #[serde(default = "default_true")]
    pub set_quantizable_op_stats: bool,
    /// Moving-average factor of the activation observers.
    #[serde(default = "default_averaging_constant")]
    pub averaging_constant: f64,
}

fn default_backend() -> QuantBackend {
    QuantBackend::Qnnpack
}
fn default_averaging_constant() -> f64 {
    0.01
}

impl Default for QuantizerConfig {
    fn default() -> Self {
        Self {
            backend: QuantBackend::Qnnpack,
            force_overwrite: true,
            asymmetric: true,
            per_tensor: false,
            set_quantizable_op_stats: true,
            averaging_constant: 0.01,
        }
    }
}

// ── Export ──────────────────────────────────────────────────────────────────

/// Element type of the exported quantized tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Int8,
    Uint8,
}

impl TargetType {
    /// Zero-point shift applied when re-encoding int8 data.
    pub fn offset(&self) -> i32 {
        match self {
            Self::Int8 => 0,
            Self::Uint8 => 128,
        }
    }
}

/// Options for lowering a frozen model into the mobile format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportOptions {
    /// Backend the frozen model must have been quantized for.
    #[serde(default = "default_backend")]
    pub backend: QuantBackend,
    #[serde(default = "default_target_type")]
    pub quantize_target_type: TargetType,
    /// Collapse adjacent QUANTIZE → DEQUANTIZE pairs into identity.
    #[serde(default = "default_true")]
    pub fuse_quant_dequant: bool,
    /// Lower DEQUANTIZE → float op → QUANTIZE chains into integer ops.
    #[serde(default = "default_true")]
    pub rewrite_quantizable: bool,
    /// Extra rewrites for constrained embedded runtimes.
    #[serde(default = "default_true")]
    pub micro_runtime_rewrite: bool,
    /// Also write the artifact as a C byte array next to it.
    #[serde(default)]
    pub emit_c_array: bool,
}

fn default_target_type() -> TargetType {
    TargetType::Int8
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            backend: QuantBackend::Qnnpack,
            quantize_target_type: TargetType::Int8,
            fuse_quant_dequant: true,
            rewrite_quantizable: true,
            micro_runtime_rewrite: true,
            emit_c_array: false,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_model_shapes() {
        let config = ModelConfig::default();
        let shapes = config.infer_shapes().unwrap();
        assert_eq!(shapes[0], vec![3, 32, 32]);
        assert_eq!(shapes[2], vec![16, 32, 32]);
        assert_eq!(shapes[4], vec![32, 16, 16]);
        assert_eq!(shapes[7], vec![64 * 8 * 8]);
        assert_eq!(shapes.last().unwrap(), &vec![10]);
    }

    #[test]
    fn linear_on_feature_map_is_rejected() {
        let config = ModelConfig {
            name: "bad".into(),
            input_shape: [1, 4, 4],
            num_classes: 2,
            layers: vec![LayerSpec::Linear {
                out_features: 2,
                bias: true,
            }],
        };
        let err = config.infer_shapes().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
    }

    #[test]
    fn output_must_match_classes() {
        let config = ModelConfig {
            name: "bad".into(),
            input_shape: [1, 2, 2],
            num_classes: 3,
            layers: vec![
                LayerSpec::Flatten,
                LayerSpec::Linear {
                    out_features: 2,
                    bias: false,
                },
            ],
        };
        assert!(config.infer_shapes().is_err());
    }

    #[test]
    fn layer_json_defaults() {
        let json = r#"{
            "input_shape": [1, 8, 8],
            "num_classes": 2,
            "layers": [
                {"type": "conv2d", "out_channels": 4, "kernel_size": 3},
                {"type": "relu"},
                {"type": "flatten"},
                {"type": "linear", "out_features": 2}
            ]
        }"#;
        let config: ModelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.name, "model");
        match &config.layers[0] {
            LayerSpec::Conv2d {
                stride,
                padding,
                bias,
                ..
            } => {
                assert_eq!(*stride, 1);
                assert_eq!(*padding, 0);
                assert!(*bias);
            }
            other => panic!("unexpected layer {other:?}"),
        }
        assert_eq!(config.infer_shapes().unwrap().last().unwrap(), &vec![2]);
    }

    #[test]
    fn quantizer_config_matches_mobile_defaults() {
        let config: QuantizerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, QuantizerConfig::default());
        assert_eq!(config.backend, QuantBackend::Qnnpack);
        assert!(!config.backend.reduce_range());
        assert!(QuantBackend::Fbgemm.reduce_range());
    }

    #[test]
    fn export_options_backward_compat() {
        let options: ExportOptions =
            serde_json::from_str(r#"{"quantize_target_type": "uint8"}"#).unwrap();
        assert_eq!(options.quantize_target_type, TargetType::Uint8);
        assert!(options.fuse_quant_dequant);
        assert!(!options.emit_c_array);
        assert_eq!(options.quantize_target_type.offset(), 128);
    }
}
