//! Frozen integer model produced by converting an instrumented model.
//!
//! The graph is a flat op list running on CPU. Activations flow between
//! ops as int8 with per-tensor affine parameters; the only float section is
//! a GELU bracketed by explicit `Dequantize` / `Quantize` ops.

use candle_core::{Device, Tensor, Var};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use qat_common::{QatError, QuantBackend, Result};

use crate::kernels::{conv2d_i8, fully_connected_i8, ConvGeometry, Requant};
use crate::model::{check_input, Classifier, Mode};
use crate::qat::{InstrumentedModel, QatOpKind};
use crate::quantize::{weight_qparams, FixedMultiplier, QuantParams};

/// Int8 weights with their (per-channel or per-tensor) parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizedWeights {
    pub data: Vec<i8>,
    pub shape: Vec<usize>,
    pub params: QuantParams,
}

impl QuantizedWeights {
    fn from_tensor(w: &Tensor, per_tensor: bool) -> Result<Self> {
        let w = w.to_device(&Device::Cpu)?;
        let params = weight_qparams(&w, per_tensor)?;
        let shape = w.dims().to_vec();
        let row = shape[1..].iter().product::<usize>();
        let values = w.flatten_all()?.to_vec1::<f32>()?;
        let data = values
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                let channel = if params.is_per_channel() { i / row } else { 0 };
                params.quantize_value(v, channel) as i8
            })
            .collect();
        Ok(Self {
            data,
            shape,
            params,
        })
    }

    fn scale(&self, channel: usize) -> f32 {
        if self.params.is_per_channel() {
            self.params.scales[channel]
        } else {
            self.params.scales[0]
        }
    }
}

/// One op of a [`FrozenModel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FrozenOp {
    Quantize {
        params: QuantParams,
    },
    Dequantize {
        params: QuantParams,
    },
    QConv2d {
        weights: QuantizedWeights,
        bias: Vec<i32>,
        geometry: ConvGeometry,
        input: QuantParams,
        output: QuantParams,
        requant: Requant,
        fused_relu: bool,
    },
    QLinear {
        weights: QuantizedWeights,
        bias: Vec<i32>,
        input: QuantParams,
        output: QuantParams,
        requant: Requant,
        fused_relu: bool,
    },
    /// `max(q, zero_point)`; parameters pass through unchanged.
    QRelu {
        params: QuantParams,
    },
    Flatten,
    /// Float GELU (tanh approximation).
    Gelu,
}

impl FrozenOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Quantize { .. } => "quantize",
            Self::Dequantize { .. } => "dequantize",
            Self::QConv2d { .. } => "qconv2d",
            Self::QLinear { .. } => "qlinear",
            Self::QRelu { .. } => "qrelu",
            Self::Flatten => "flatten",
            Self::Gelu => "gelu",
        }
    }
}

/// Tanh-approximated GELU, matching the float models.
pub fn gelu(x: f32) -> f32 {
    const SQRT_2_OVER_PI: f32 = 0.797_884_6;
    0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + 0.044_715 * x * x * x)).tanh())
}

enum Activation {
    Float(Vec<f32>),
    Quant(Vec<i8>),
}

fn integer_op(
    weights: &QuantizedWeights,
    bias: Option<&Tensor>,
    input: &QuantParams,
    output: &QuantParams,
    fused_relu: bool,
) -> Result<(Vec<i32>, Requant)> {
    let out_channels = weights.shape[0];
    let s_in = input.scale() as f64;
    let s_out = output.scale() as f64;
    let bias = match bias {
        Some(b) => {
            let b = b.to_device(&Device::Cpu)?.to_vec1::<f32>()?;
            b.iter()
                .enumerate()
                .map(|(c, &v)| (v as f64 / (s_in * weights.scale(c) as f64)).round() as i32)
                .collect()
        }
        None => vec![0; out_channels],
    };
    let multipliers = (0..out_channels)
        .map(|c| FixedMultiplier::from_real(s_in * weights.scale(c) as f64 / s_out))
        .collect();
    let requant = Requant {
        input_offset: -input.zero_point(),
        output_offset: output.zero_point(),
        multipliers,
        act_min: if fused_relu {
            output.qmin.max(output.zero_point())
        } else {
            output.qmin
        },
        act_max: output.qmax,
    };
    Ok((bias, requant))
}

// ── FrozenModel ─────────────────────────────────────────────────────────────

/// Integer-only classifier; always in evaluation mode on CPU.
#[derive(Debug, Clone)]
pub struct FrozenModel {
    name: String,
    input_shape: [usize; 3],
    num_classes: usize,
    backend: QuantBackend,
    ops: Vec<FrozenOp>,
    device: Device,
}

impl FrozenModel {
    /// Fold observer statistics and weights into integer ops.
    ///
    /// Fails with `Precondition` if any observer never saw data.
    pub fn from_instrumented(model: &InstrumentedModel) -> Result<Self> {
        let config = model.config();
        let plan = model.plan();
        let shapes = config.infer_shapes()?;
        let empty = |name: &str| {
            QatError::precondition(format!("observer {name} has no statistics; run calibration or training first"))
        };

        let mut current = model.input_observer.qparams().ok_or_else(|| empty("input"))?;
        let mut ops = vec![FrozenOp::Quantize {
            params: current.clone(),
        }];
        for op in &model.ops {
            let observed = match &op.observer {
                Some(observer) => Some(observer.qparams().ok_or_else(|| empty(&op.name()))?),
                None => None,
            };
            match &op.kind {
                QatOpKind::Conv2d {
                    weight,
                    bias,
                    stride,
                    padding,
                    fused_relu,
                } => {
                    let output = observed.ok_or_else(|| empty(&op.name()))?;
                    let weights = QuantizedWeights::from_tensor(weight, plan.per_tensor)?;
                    let (bias, requant) = integer_op(&weights, bias.as_ref(), &current, &output, *fused_relu)?;
                    let in_shape = &shapes[op.layer];
                    let geometry = ConvGeometry {
                        in_channels: in_shape[0],
                        in_h: in_shape[1],
                        in_w: in_shape[2],
                        out_channels: weights.shape[0],
                        kernel: weights.shape[2],
                        stride: *stride,
                        padding: *padding,
                    };
                    ops.push(FrozenOp::QConv2d {
                        weights,
                        bias,
                        geometry,
                        input: current,
                        output: output.clone(),
                        requant,
                        fused_relu: *fused_relu,
                    });
                    current = output;
                }
                QatOpKind::Linear {
                    weight,
                    bias,
                    fused_relu,
                } => {
                    let output = observed.ok_or_else(|| empty(&op.name()))?;
                    let weights = QuantizedWeights::from_tensor(weight, plan.per_tensor)?;
                    let (bias, requant) = integer_op(&weights, bias.as_ref(), &current, &output, *fused_relu)?;
                    ops.push(FrozenOp::QLinear {
                        weights,
                        bias,
                        input: current,
                        output: output.clone(),
                        requant,
                        fused_relu: *fused_relu,
                    });
                    current = output;
                }
                QatOpKind::Relu => ops.push(FrozenOp::QRelu {
                    params: current.clone(),
                }),
                QatOpKind::Flatten => ops.push(FrozenOp::Flatten),
                QatOpKind::Gelu => {
                    let output = observed.ok_or_else(|| empty(&op.name()))?;
                    ops.push(FrozenOp::Dequantize {
                        params: current,
                    });
                    ops.push(FrozenOp::Gelu);
                    ops.push(FrozenOp::Quantize {
                        params: output.clone(),
                    });
                    current = output;
                }
            }
        }
        ops.push(FrozenOp::Dequantize { params: current });

        tracing::info!(
            model = %config.name,
            ops = ops.len(),
            backend = ?plan.backend,
            "Froze instrumented model"
        );
        Ok(Self {
            name: config.name.clone(),
            input_shape: config.input_shape,
            num_classes: config.num_classes,
            backend: plan.backend,
            ops,
            device: Device::Cpu,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_shape(&self) -> [usize; 3] {
        self.input_shape
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn backend(&self) -> QuantBackend {
        self.backend
    }

    pub fn ops(&self) -> &[FrozenOp] {
        &self.ops
    }

    /// Whether any weight tensor carries per-channel parameters.
    pub fn has_per_channel_weights(&self) -> bool {
        self.ops.iter().any(|op| match op {
            FrozenOp::QConv2d { weights, .. } | FrozenOp::QLinear { weights, .. } => {
                weights.params.is_per_channel()
            }
            _ => false,
        })
    }

    fn run_sample(&self, input: &[f32]) -> Result<Vec<f32>> {
        let mut act = Activation::Float(input.to_vec());
        for op in &self.ops {
            act = match (op, act) {
                (FrozenOp::Quantize { params }, Activation::Float(v)) => {
                    Activation::Quant(v.iter().map(|&x| params.quantize_value(x, 0) as i8).collect())
                }
                (FrozenOp::Dequantize { params }, Activation::Quant(q)) => Activation::Float(
                    q.iter().map(|&v| params.dequantize_value(v as i32, 0)).collect(),
                ),
                (
                    FrozenOp::QConv2d {
                        weights,
                        bias,
                        geometry,
                        requant,
                        ..
                    },
                    Activation::Quant(q),
                ) => Activation::Quant(conv2d_i8(&q, &weights.data, bias, geometry, requant)),
                (
                    FrozenOp::QLinear {
                        weights,
                        bias,
                        requant,
                        ..
                    },
                    Activation::Quant(q),
                ) => Activation::Quant(fully_connected_i8(&q, &weights.data, bias, weights.shape[0], requant)),
                (FrozenOp::QRelu { params }, Activation::Quant(q)) => {
                    let zp = params.zero_point() as i8;
                    Activation::Quant(q.into_iter().map(|v| v.max(zp)).collect())
                }
                (FrozenOp::Flatten, act) => act,
                (FrozenOp::Gelu, Activation::Float(v)) => Activation::Float(v.into_iter().map(gelu).collect()),
                (op, _) => {
                    return Err(QatError::precondition(format!(
                        "{} received an activation in the wrong domain",
                        op.name()
                    )))
                }
            };
        }
        match act {
            Activation::Float(v) => Ok(v),
            Activation::Quant(_) => Err(QatError::precondition("frozen graph does not end in dequantize")),
        }
    }
}

impl Classifier for FrozenModel {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        check_input(x, &self.input_shape)?;
        let n = x.dim(0)?;
        let flat = x.to_device(&Device::Cpu)?.flatten_from(1)?.to_vec2::<f32>()?;
        let rows = flat
            .par_iter()
            .map(|sample| self.run_sample(sample))
            .collect::<Result<Vec<_>>>()?;
        let logits: Vec<f32> = rows.into_iter().flatten().collect();
        Ok(Tensor::from_vec(logits, (n, self.num_classes), &self.device)?)
    }

    fn mode(&self) -> Mode {
        Mode::Eval
    }

    fn set_mode(&mut self, mode: Mode) -> Result<()> {
        match mode {
            Mode::Eval => Ok(()),
            Mode::Train => Err(QatError::precondition("a frozen model cannot enter training mode")),
        }
    }

    fn grad_enabled(&self) -> bool {
        false
    }

    fn set_grad_enabled(&mut self, enabled: bool) -> Result<()> {
        if enabled {
            return Err(QatError::precondition("a frozen model has no gradients"));
        }
        Ok(())
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn trainable_vars(&self) -> Vec<Var> {
        Vec::new()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FloatModel;
    use crate::qat::QatPlan;
    use crate::testing::{tiny_cnn, tiny_mlp};
    use qat_common::{ErrorKind, QuantizerConfig};

    fn instrument(config: &qat_common::ModelConfig, qconfig: &QuantizerConfig) -> (FloatModel, InstrumentedModel) {
        let float = FloatModel::new(config, &Device::Cpu).unwrap();
        let plan = QatPlan::build(float.config(), qconfig).unwrap();
        let model = InstrumentedModel::from_float(&float, plan, qconfig).unwrap();
        (float, model)
    }

    #[test]
    fn empty_observers_block_freezing() {
        let (_, model) = instrument(&tiny_mlp(), &QuantizerConfig::default());
        let err = FrozenModel::from_instrumented(&model).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[test]
    fn gelu_is_bracketed_by_dequant_quant() {
        let (_, model) = instrument(&tiny_cnn(), &QuantizerConfig::default());
        let x = Tensor::randn(0f32, 1.0, (2, 2, 6, 6), &Device::Cpu).unwrap();
        model.calibrate(&x).unwrap();
        let frozen = FrozenModel::from_instrumented(&model).unwrap();
        let names: Vec<&str> = frozen.ops().iter().map(|op| op.name()).collect();
        assert_eq!(
            names,
            vec![
                "quantize",
                "qconv2d",
                "qconv2d",
                "dequantize",
                "gelu",
                "quantize",
                "flatten",
                "qrelu",
                "qlinear",
                "dequantize"
            ]
        );
        assert!(frozen.has_per_channel_weights());
    }

    #[test]
    fn frozen_matches_instrumented_eval() {
        for per_tensor in [false, true] {
            let qconfig = QuantizerConfig {
                per_tensor,
                ..Default::default()
            };
            let (_, mut model) = instrument(&tiny_cnn(), &qconfig);
            let x = Tensor::randn(0f32, 1.0, (4, 2, 6, 6), &Device::Cpu).unwrap();
            model.calibrate(&x).unwrap();
            model.set_mode(Mode::Eval).unwrap();
            let frozen = FrozenModel::from_instrumented(&model).unwrap();
            let a = model.forward(&x).unwrap();
            let b = frozen.forward(&x).unwrap();
            let err = (a - b).unwrap().abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
            assert!(err < 0.1, "per_tensor={per_tensor}: max abs error {err}");
        }
    }

    #[test]
    fn reduced_range_bounds_activations() {
        let qconfig = QuantizerConfig {
            backend: QuantBackend::Fbgemm,
            ..Default::default()
        };
        let (_, model) = instrument(&tiny_mlp(), &qconfig);
        model.calibrate(&Tensor::randn(0f32, 1.0, (4, 1, 2, 2), &Device::Cpu).unwrap()).unwrap();
        let frozen = FrozenModel::from_instrumented(&model).unwrap();
        match &frozen.ops()[0] {
            FrozenOp::Quantize { params } => assert_eq!((params.qmin, params.qmax), (-64, 63)),
            other => panic!("unexpected first op {other:?}"),
        }
        assert_eq!(frozen.backend(), QuantBackend::Fbgemm);
    }

    #[test]
    fn frozen_rejects_training() {
        let (_, model) = instrument(&tiny_mlp(), &QuantizerConfig::default());
        model.calibrate(&Tensor::ones((1, 1, 2, 2), candle_core::DType::F32, &Device::Cpu).unwrap()).unwrap();
        let mut frozen = FrozenModel::from_instrumented(&model).unwrap();
        assert_eq!(frozen.set_mode(Mode::Train).unwrap_err().kind(), ErrorKind::Precondition);
        assert_eq!(frozen.set_grad_enabled(true).unwrap_err().kind(), ErrorKind::Precondition);
        assert!(frozen.set_mode(Mode::Eval).is_ok());
        assert!(frozen.trainable_vars().is_empty());
    }

    #[test]
    fn gelu_matches_candle() {
        let xs = [-3.0f32, -0.5, 0.0, 0.7, 2.5];
        let t = Tensor::new(&xs, &Device::Cpu).unwrap().gelu().unwrap();
        let expected: Vec<f32> = t.to_vec1().unwrap();
        for (x, e) in xs.iter().zip(expected) {
            assert!((gelu(*x) - e).abs() < 1e-5);
        }
    }
}
