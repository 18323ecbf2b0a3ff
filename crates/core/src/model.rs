//! The [`Classifier`] abstraction and the float sequential model.
//!
//! A [`FloatModel`] is built from a [`ModelConfig`]: `Conv2d`, `Linear`,
//! `Relu`, `Gelu` and `Flatten` layers applied in order. Parameters live in
//! a [`VarMap`] under `layers.{i}.weight` / `layers.{i}.bias`, so the same
//! names are reused by the instrumented model.

use std::path::Path;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Conv2d, Conv2dConfig, Linear, Module, VarBuilder, VarMap};

use qat_common::{LayerSpec, ModelConfig, QatError, Result};

/// File names inside a model directory.
pub const MODEL_CONFIG_FILE: &str = "model.json";
pub const MODEL_WEIGHTS_FILE: &str = "model.safetensors";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

/// An image classifier mapping `(N, C, H, W)` images to `(N, classes)` logits.
///
/// Gradient tracking is a model-level switch: with it off, `forward` returns
/// detached outputs so no autograd graph is retained.
pub trait Classifier: Send + Sync {
    fn forward(&self, x: &Tensor) -> Result<Tensor>;
    fn mode(&self) -> Mode;
    fn set_mode(&mut self, mode: Mode) -> Result<()>;
    fn grad_enabled(&self) -> bool;
    fn set_grad_enabled(&mut self, enabled: bool) -> Result<()>;
    fn device(&self) -> &Device;
    /// Parameters an optimiser should update (empty for frozen models).
    fn trainable_vars(&self) -> Vec<Var>;

    /// Fold a whole batch into the model's activation statistics, as the
    /// training-mode forward would. No-op for models without observers.
    fn observe_batch(&self, _x: &Tensor) -> Result<()> {
        Ok(())
    }

    /// Forward pass that reads activation statistics but never updates them.
    fn forward_fixed_stats(&self, x: &Tensor) -> Result<Tensor> {
        self.forward(x)
    }
}

/// Reject inputs that are not `(N, C, H, W)` with the configured sample shape.
pub fn check_input(x: &Tensor, input_shape: &[usize; 3]) -> Result<()> {
    let dims = x.dims();
    if dims.len() != 4 || dims[1..] != input_shape[..] {
        let mut expected = vec![dims.first().copied().unwrap_or(1)];
        expected.extend_from_slice(input_shape);
        return Err(QatError::ShapeMismatch {
            expected,
            actual: dims.to_vec(),
        });
    }
    Ok(())
}

/// Copy every variable of `src` into the same-named variable of `dst`,
/// moving values to `dst`'s device.
pub(crate) fn copy_vars(src: &VarMap, dst: &VarMap, device: &Device) -> Result<()> {
    let src_vars = src
        .data()
        .lock()
        .map_err(|_| QatError::precondition("source parameters are poisoned"))?;
    let dst_vars = dst
        .data()
        .lock()
        .map_err(|_| QatError::precondition("target parameters are poisoned"))?;
    for (name, var) in src_vars.iter() {
        let target = dst_vars
            .get(name)
            .ok_or_else(|| QatError::rewrite(format!("no parameter named {name} in target model")))?;
        target.set(&var.as_tensor().to_device(device)?)?;
    }
    Ok(())
}

// ── FloatModel ──────────────────────────────────────────────────────────────

enum FloatLayer {
    Conv2d(Conv2d),
    Linear(Linear),
    Relu,
    Gelu,
    Flatten,
}

impl FloatLayer {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Conv2d(conv) => conv.forward(x),
            Self::Linear(linear) => linear.forward(x),
            Self::Relu => x.relu(),
            Self::Gelu => x.gelu(),
            Self::Flatten => x.flatten_from(1),
        }
    }
}

/// Floating-point sequential classifier.
pub struct FloatModel {
    config: ModelConfig,
    varmap: VarMap,
    layers: Vec<FloatLayer>,
    device: Device,
    mode: Mode,
    grad_enabled: bool,
}

impl FloatModel {
    /// Build a freshly initialised model.
    pub fn new(config: &ModelConfig, device: &Device) -> Result<Self> {
        let shapes = config.infer_shapes()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let mut layers = Vec::with_capacity(config.layers.len());
        for (i, (spec, in_shape)) in config.layers.iter().zip(&shapes).enumerate() {
            let vb = vb.pp(format!("layers.{i}"));
            let layer = match spec {
                LayerSpec::Conv2d {
                    out_channels,
                    kernel_size,
                    stride,
                    padding,
                    bias,
                } => {
                    let cfg = Conv2dConfig {
                        padding: *padding,
                        stride: *stride,
                        ..Default::default()
                    };
                    let conv = if *bias {
                        candle_nn::conv2d(in_shape[0], *out_channels, *kernel_size, cfg, vb)?
                    } else {
                        candle_nn::conv2d_no_bias(in_shape[0], *out_channels, *kernel_size, cfg, vb)?
                    };
                    FloatLayer::Conv2d(conv)
                }
                LayerSpec::Linear { out_features, bias } => {
                    let linear = if *bias {
                        candle_nn::linear(in_shape[0], *out_features, vb)?
                    } else {
                        candle_nn::linear_no_bias(in_shape[0], *out_features, vb)?
                    };
                    FloatLayer::Linear(linear)
                }
                LayerSpec::Relu => FloatLayer::Relu,
                LayerSpec::Gelu => FloatLayer::Gelu,
                LayerSpec::Flatten => FloatLayer::Flatten,
            };
            layers.push(layer);
        }

        Ok(Self {
            config: config.clone(),
            varmap,
            layers,
            device: device.clone(),
            mode: Mode::Train,
            grad_enabled: true,
        })
    }

    /// Load `model.json` + `model.safetensors` from a model directory.
    pub fn load_dir(dir: &Path, device: &Device) -> Result<Self> {
        let config_path = dir.join(MODEL_CONFIG_FILE);
        let weights_path = dir.join(MODEL_WEIGHTS_FILE);
        for path in [&config_path, &weights_path] {
            if !path.is_file() {
                return Err(QatError::config(format!(
                    "model directory is missing {}",
                    path.display()
                )));
            }
        }
        let config = ModelConfig::load(&config_path)?;
        let mut model = Self::new(&config, device)?;
        model.varmap.load(&weights_path)?;
        tracing::info!(
            model = %config.name,
            params = model.num_params(),
            path = %dir.display(),
            "Loaded float model"
        );
        Ok(model)
    }

    /// Write `model.json` + `model.safetensors` into `dir`.
    pub fn save_dir(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        self.config.save(&dir.join(MODEL_CONFIG_FILE))?;
        self.varmap.save(dir.join(MODEL_WEIGHTS_FILE))?;
        Ok(())
    }

    /// Independent copy with its own parameters.
    pub fn deep_copy(&self) -> Result<Self> {
        self.copy_to(&self.device)
    }

    pub fn to_device(self, device: &Device) -> Result<Self> {
        if self.device.same_device(device) {
            return Ok(self);
        }
        self.copy_to(device)
    }

    fn copy_to(&self, device: &Device) -> Result<Self> {
        let mut copy = Self::new(&self.config, device)?;
        copy_vars(&self.varmap, &copy.varmap, device)?;
        copy.mode = self.mode;
        copy.grad_enabled = self.grad_enabled;
        Ok(copy)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Parameters with their names, sorted by name.
    pub fn named_vars(&self) -> Result<Vec<(String, Var)>> {
        let vars = self
            .varmap
            .data()
            .lock()
            .map_err(|_| QatError::precondition("model parameters are poisoned"))?;
        let mut named: Vec<(String, Var)> =
            vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(named)
    }

    pub fn num_params(&self) -> usize {
        self.varmap.all_vars().iter().map(|v| v.elem_count()).sum()
    }
}

impl Classifier for FloatModel {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        check_input(x, &self.config.input_shape)?;
        let mut h = x.clone();
        for layer in &self.layers {
            h = layer.forward(&h)?;
        }
        Ok(if self.grad_enabled { h } else { h.detach() })
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
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::tiny_mlp;

    #[test]
    fn forward_produces_logits() {
        let model = FloatModel::new(&ModelConfig::default(), &Device::Cpu).unwrap();
        let x = Tensor::zeros((2, 3, 32, 32), DType::F32, &Device::Cpu).unwrap();
        let y = model.forward(&x).unwrap();
        assert_eq!(y.dims(), &[2, 10]);
    }

    #[test]
    fn wrong_input_shape_is_reported() {
        let model = FloatModel::new(&tiny_mlp(), &Device::Cpu).unwrap();
        let x = Tensor::zeros((3, 1, 4, 4), DType::F32, &Device::Cpu).unwrap();
        match model.forward(&x) {
            Err(QatError::ShapeMismatch { expected, actual }) => {
                assert_eq!(expected, vec![3, 1, 2, 2]);
                assert_eq!(actual, vec![3, 1, 4, 4]);
            }
            other => panic!("expected shape mismatch, got {:?}", other.map(|t| t.dims().to_vec())),
        }
    }

    #[test]
    fn save_and_load_directory() {
        let dir = tempfile::tempdir().unwrap();
        let model = FloatModel::new(&tiny_mlp(), &Device::Cpu).unwrap();
        model.save_dir(dir.path()).unwrap();
        let loaded = FloatModel::load_dir(dir.path(), &Device::Cpu).unwrap();
        let x = Tensor::ones((1, 1, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let a: Vec<f32> = model.forward(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = loaded.forward(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn missing_weights_are_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        tiny_mlp().save(&dir.path().join(MODEL_CONFIG_FILE)).unwrap();
        let err = FloatModel::load_dir(dir.path(), &Device::Cpu).err().unwrap();
        assert_eq!(err.kind(), qat_common::ErrorKind::Configuration);
    }

    #[test]
    fn deep_copy_is_independent() {
        let model = FloatModel::new(&tiny_mlp(), &Device::Cpu).unwrap();
        let copy = model.deep_copy().unwrap();
        for (_, var) in copy.named_vars().unwrap() {
            var.set(&var.as_tensor().zeros_like().unwrap()).unwrap();
        }
        assert!(model.named_vars().unwrap().iter().any(|(_, v)| {
            v.as_tensor().abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap() > 0.0
        }));
    }

    #[test]
    fn grad_off_detaches_output() {
        let mut model = FloatModel::new(&tiny_mlp(), &Device::Cpu).unwrap();
        model.set_grad_enabled(false).unwrap();
        let x = Tensor::ones((1, 1, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let y = model.forward(&x).unwrap();
        assert!(!y.track_op());
    }
}
