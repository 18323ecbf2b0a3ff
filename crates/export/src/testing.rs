//! Frozen fixtures for the export tests.

use candle_core::{Device, Tensor};

use qat_common::{LayerSpec, ModelConfig, QuantizerConfig};
use qat_core::{Classifier, FloatModel, FrozenModel, Mode, QatQuantizer, Quantizer};

/// `flatten → linear(8) → relu → linear(2)` over `1×2×2` inputs.
pub fn mlp_config() -> ModelConfig {
    ModelConfig {
        name: "mlp".into(),
        input_shape: [1, 2, 2],
        num_classes: 2,
        layers: vec![
            LayerSpec::Flatten,
            LayerSpec::Linear {
                out_features: 8,
                bias: true,
            },
            LayerSpec::Relu,
            LayerSpec::Linear {
                out_features: 2,
                bias: true,
            },
        ],
    }
}

/// `conv(4) → gelu → flatten → linear(3)` over `2×4×4` inputs.
pub fn gelu_head_config() -> ModelConfig {
    ModelConfig {
        name: "gelu_head".into(),
        input_shape: [2, 4, 4],
        num_classes: 3,
        layers: vec![
            LayerSpec::Conv2d {
                out_channels: 4,
                kernel_size: 3,
                stride: 1,
                padding: 1,
                bias: true,
            },
            LayerSpec::Gelu,
            LayerSpec::Flatten,
            LayerSpec::Linear {
                out_features: 3,
                bias: true,
            },
        ],
    }
}

pub fn representative(config: &ModelConfig) -> Tensor {
    let [c, h, w] = config.input_shape;
    Tensor::randn(0f32, 1.0, (8, c, h, w), &Device::Cpu).unwrap()
}

/// Instrument, calibrate and freeze a freshly initialised model.
pub fn frozen_model(config: &ModelConfig, per_tensor: bool) -> FrozenModel {
    let dir = tempfile::tempdir().unwrap();
    let float = FloatModel::new(config, &Device::Cpu).unwrap();
    let qconfig = QuantizerConfig {
        per_tensor,
        ..Default::default()
    };
    let mut model = QatQuantizer
        .quantize(&float, &representative(config), dir.path(), &qconfig)
        .unwrap();
    model.set_mode(Mode::Eval).unwrap();
    model.set_grad_enabled(false).unwrap();
    QatQuantizer.convert(model).unwrap()
}
