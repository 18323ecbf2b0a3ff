//! Quantization-aware (instrumented) model.
//!
//! The float graph is rewritten into a [`QatPlan`]: an input quant stub,
//! then one op per layer where `Conv2d|Linear` absorb an immediately
//! following `Relu`. Weighted ops fake-quantize their weights on every
//! forward; ops that produce a new activation range carry a
//! [`MinMaxObserver`] whose range drives the fake quantization of their
//! output.
//!
//! Observers only update in [`Mode::Train`] (or through
//! [`InstrumentedModel::calibrate`]), so evaluation passes are repeatable.

use std::path::Path;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use qat_common::{LayerSpec, ModelConfig, QatError, QuantBackend, QuantizerConfig, Result};

use crate::model::{check_input, copy_vars, Classifier, FloatModel, Mode};
use crate::observer::MinMaxObserver;
use crate::quantize::{activation_range, fake_quantize, weight_qparams};

// ── Plan ────────────────────────────────────────────────────────────────────

/// One op of the rewritten graph; `layer` indexes [`ModelConfig::layers`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PlanOp {
    QuantStub,
    Conv2d { layer: usize, fused_relu: bool },
    Linear { layer: usize, fused_relu: bool },
    Relu { layer: usize },
    Gelu { layer: usize },
    Flatten { layer: usize },
}

impl PlanOp {
    /// Whether the op owns an output activation observer.
    pub fn is_observed(&self) -> bool {
        matches!(self, Self::Conv2d { .. } | Self::Linear { .. } | Self::Gelu { .. })
    }
}

/// The rewrite plan, persisted as `qat_plan.json` in the work directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QatPlan {
    pub model: String,
    pub input_shape: [usize; 3],
    pub num_classes: usize,
    pub backend: QuantBackend,
    pub asymmetric: bool,
    pub per_tensor: bool,
    pub ops: Vec<PlanOp>,
}

impl QatPlan {
    pub fn build(config: &ModelConfig, qconfig: &QuantizerConfig) -> Result<Self> {
        if config.layers.is_empty() {
            return Err(QatError::rewrite(format!(
                "model {} has no layers to instrument",
                config.name
            )));
        }
        config
            .infer_shapes()
            .map_err(|e| QatError::rewrite(format!("cannot trace model {}: {e}", config.name)))?;

        let mut ops = vec![PlanOp::QuantStub];
        let mut i = 0;
        while i < config.layers.len() {
            let fused_relu = matches!(config.layers.get(i + 1), Some(LayerSpec::Relu));
            let op = match &config.layers[i] {
                LayerSpec::Conv2d { .. } => PlanOp::Conv2d { layer: i, fused_relu },
                LayerSpec::Linear { .. } => PlanOp::Linear { layer: i, fused_relu },
                LayerSpec::Relu => PlanOp::Relu { layer: i },
                LayerSpec::Gelu => PlanOp::Gelu { layer: i },
                LayerSpec::Flatten => PlanOp::Flatten { layer: i },
            };
            let consumed = match op {
                PlanOp::Conv2d { fused_relu: true, .. } | PlanOp::Linear { fused_relu: true, .. } => 2,
                _ => 1,
            };
            ops.push(op);
            i += consumed;
        }

        Ok(Self {
            model: config.name.clone(),
            input_shape: config.input_shape,
            num_classes: config.num_classes,
            backend: qconfig.backend,
            asymmetric: qconfig.asymmetric,
            per_tensor: qconfig.per_tensor,
            ops,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }
}

// ── Ops ─────────────────────────────────────────────────────────────────────

pub(crate) enum QatOpKind {
    Conv2d {
        weight: Tensor,
        bias: Option<Tensor>,
        stride: usize,
        padding: usize,
        fused_relu: bool,
    },
    Linear {
        weight: Tensor,
        bias: Option<Tensor>,
        fused_relu: bool,
    },
    Relu,
    Gelu,
    Flatten,
}

pub(crate) struct QatOp {
    pub(crate) layer: usize,
    pub(crate) kind: QatOpKind,
    pub(crate) observer: Option<MinMaxObserver>,
}

impl QatOp {
    pub(crate) fn name(&self) -> String {
        let kind = match self.kind {
            QatOpKind::Conv2d { .. } => "conv2d",
            QatOpKind::Linear { .. } => "linear",
            QatOpKind::Relu => "relu",
            QatOpKind::Gelu => "gelu",
            QatOpKind::Flatten => "flatten",
        };
        format!("layers.{}.{kind}", self.layer)
    }
}

fn add_bias(y: Tensor, bias: &Option<Tensor>, rank: usize) -> candle_core::Result<Tensor> {
    match bias {
        None => Ok(y),
        Some(b) if rank == 4 => y.broadcast_add(&b.reshape((1, b.dim(0)?, 1, 1))?),
        Some(b) => y.broadcast_add(b),
    }
}

// ── InstrumentedModel ───────────────────────────────────────────────────────

/// Float model with fake-quant weights and observed activations.
///
/// Owns its own parameters: training it never touches the float model it
/// was built from.
pub struct InstrumentedModel {
    plan: QatPlan,
    config: ModelConfig,
    qconfig: QuantizerConfig,
    varmap: VarMap,
    pub(crate) input_observer: MinMaxObserver,
    pub(crate) ops: Vec<QatOp>,
    device: Device,
    mode: Mode,
    grad_enabled: bool,
}

impl InstrumentedModel {
    /// Instrument `float` according to `plan`, copying its parameters.
    pub fn from_float(float: &FloatModel, plan: QatPlan, qconfig: &QuantizerConfig) -> Result<Self> {
        let model = Self::build(float.config(), plan, qconfig, float.device())?;
        copy_vars(float.varmap(), &model.varmap, float.device())?;
        Ok(model)
    }

    fn build(
        config: &ModelConfig,
        plan: QatPlan,
        qconfig: &QuantizerConfig,
        device: &Device,
    ) -> Result<Self> {
        let shapes = config.infer_shapes()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let (qmin, qmax) = activation_range(plan.backend.reduce_range());
        let symmetric = !plan.asymmetric;
        let averaging = qconfig.averaging_constant;
        let observer = || MinMaxObserver::new(averaging, qmin, qmax, symmetric);

        let mut ops = Vec::with_capacity(plan.ops.len());
        for op in &plan.ops {
            let (layer, kind) = match *op {
                PlanOp::QuantStub => continue,
                PlanOp::Conv2d { layer, fused_relu } => {
                    let LayerSpec::Conv2d {
                        out_channels,
                        kernel_size,
                        stride,
                        padding,
                        bias,
                    } = config.layers[layer]
                    else {
                        return Err(QatError::rewrite(format!("plan op {layer} is not a conv2d")));
                    };
                    let vb = vb.pp(format!("layers.{layer}"));
                    let in_channels = shapes[layer][0];
                    let weight =
                        vb.get((out_channels, in_channels, kernel_size, kernel_size), "weight")?;
                    let bias = if bias { Some(vb.get(out_channels, "bias")?) } else { None };
                    (
                        layer,
                        QatOpKind::Conv2d {
                            weight,
                            bias,
                            stride,
                            padding,
                            fused_relu,
                        },
                    )
                }
                PlanOp::Linear { layer, fused_relu } => {
                    let LayerSpec::Linear { out_features, bias } = config.layers[layer] else {
                        return Err(QatError::rewrite(format!("plan op {layer} is not a linear")));
                    };
                    let vb = vb.pp(format!("layers.{layer}"));
                    let weight = vb.get((out_features, shapes[layer][0]), "weight")?;
                    let bias = if bias { Some(vb.get(out_features, "bias")?) } else { None };
                    (
                        layer,
                        QatOpKind::Linear {
                            weight,
                            bias,
                            fused_relu,
                        },
                    )
                }
                PlanOp::Relu { layer } => (layer, QatOpKind::Relu),
                PlanOp::Gelu { layer } => (layer, QatOpKind::Gelu),
                PlanOp::Flatten { layer } => (layer, QatOpKind::Flatten),
            };
            ops.push(QatOp {
                layer,
                kind,
                observer: op.is_observed().then(observer),
            });
        }

        Ok(Self {
            input_observer: observer(),
            plan,
            config: config.clone(),
            qconfig: qconfig.clone(),
            varmap,
            ops,
            device: device.clone(),
            mode: Mode::Train,
            grad_enabled: true,
        })
    }

    fn fake_quant_activation(
        &self,
        x: &Tensor,
        observer: &MinMaxObserver,
        observe: bool,
    ) -> Result<Tensor> {
        if observe {
            observer.observe(x)?;
        }
        match observer.qparams() {
            Some(params) => Ok(fake_quantize(x, &params)?),
            None => Ok(x.clone()),
        }
    }

    fn run(&self, x: &Tensor, observe: bool) -> Result<Tensor> {
        check_input(x, &self.config.input_shape)?;
        let mut h = self.fake_quant_activation(x, &self.input_observer, observe)?;
        for op in &self.ops {
            h = match &op.kind {
                QatOpKind::Conv2d {
                    weight,
                    bias,
                    stride,
                    padding,
                    fused_relu,
                } => {
                    let w = fake_quantize(weight, &weight_qparams(weight, self.plan.per_tensor)?)?;
                    let y = add_bias(h.conv2d(&w, *padding, *stride, 1, 1)?, bias, 4)?;
                    if *fused_relu {
                        y.relu()?
                    } else {
                        y
                    }
                }
                QatOpKind::Linear {
                    weight,
                    bias,
                    fused_relu,
                } => {
                    let w = fake_quantize(weight, &weight_qparams(weight, self.plan.per_tensor)?)?;
                    let y = add_bias(h.matmul(&w.t()?)?, bias, 2)?;
                    if *fused_relu {
                        y.relu()?
                    } else {
                        y
                    }
                }
                QatOpKind::Relu => h.relu()?,
                QatOpKind::Gelu => h.gelu()?,
                QatOpKind::Flatten => h.flatten_from(1)?,
            };
            if let Some(observer) = &op.observer {
                h = self.fake_quant_activation(&h, observer, observe)?;
            }
        }
        Ok(h)
    }

    /// Forward pass that updates every enabled observer regardless of mode.
    pub fn calibrate(&self, x: &Tensor) -> Result<()> {
        self.run(&x.detach(), true)?;
        Ok(())
    }

    /// Freeze (or resume) all activation range tracking.
    pub fn set_observers_enabled(&self, enabled: bool) {
        self.input_observer.set_enabled(enabled);
        for observer in self.ops.iter().filter_map(|op| op.observer.as_ref()) {
            observer.set_enabled(enabled);
        }
    }

    /// `(name, range)` of every observer, input stub first.
    pub fn observer_ranges(&self) -> Vec<(String, Option<(f32, f32)>)> {
        let mut out = vec![("input".to_string(), self.input_observer.range())];
        for op in &self.ops {
            if let Some(observer) = &op.observer {
                out.push((op.name(), observer.range()));
            }
        }
        out
    }

    pub fn plan(&self) -> &QatPlan {
        &self.plan
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn quantizer_config(&self) -> &QuantizerConfig {
        &self.qconfig
    }

    /// Save the trained (latent float) weights as safetensors.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.varmap.save(path)?;
        Ok(())
    }

    /// Move parameters and observer state to `device`.
    pub fn to_device(self, device: &Device) -> Result<Self> {
        if self.device.same_device(device) {
            return Ok(self);
        }
        let mut moved = Self::build(&self.config, self.plan.clone(), &self.qconfig, device)?;
        copy_vars(&self.varmap, &moved.varmap, device)?;
        moved.input_observer = self.input_observer.clone();
        for (dst, src) in moved.ops.iter_mut().zip(&self.ops) {
            dst.observer = src.observer.clone();
        }
        moved.mode = self.mode;
        moved.grad_enabled = self.grad_enabled;
        tracing::debug!(device = ?device, "Moved instrumented model");
        Ok(moved)
    }
}

impl Classifier for InstrumentedModel {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let y = self.run(x, self.mode == Mode::Train)?;
        Ok(if self.grad_enabled { y } else { y.detach() })
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn set_mode(&mut self, mode: Mode) -> Result<()> {
        self.mode = mode;
        Ok(())
    }

    fn grad_enabled(&self) -> bool {
        self.grad_enabled
    }

    fn set_grad_enabled(&mut self, enabled: bool) -> Result<()> {
        self.grad_enabled = enabled;
        Ok(())
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn trainable_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    fn observe_batch(&self, x: &Tensor) -> Result<()> {
        if self.mode == Mode::Train {
            self.calibrate(x)?;
        }
        Ok(())
    }

    fn forward_fixed_stats(&self, x: &Tensor) -> Result<Tensor> {
        let y = self.run(x, false)?;
        Ok(if self.grad_enabled { y } else { y.detach() })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
