//! Shared fixtures for the unit tests of this crate.

use candle_core::{Device, Tensor};

use qat_common::{ImageDataset, LayerSpec, ModelConfig};

/// `Flatten → Linear(4→8) → Relu → Linear(8→2)` over `1×2×2` inputs.
pub fn tiny_mlp() -> ModelConfig {
    ModelConfig {
        name: "tiny".into(),
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

/// Conv + GELU + standalone ReLU, covering every frozen op kind.
pub fn tiny_cnn() -> ModelConfig {
    ModelConfig {
        name: "tiny_cnn".into(),
        input_shape: [2, 6, 6],
        num_classes: 3,
        layers: vec![
            LayerSpec::Conv2d {
                out_channels: 4,
                kernel_size: 3,
                stride: 1,
                padding: 1,
                bias: true,
            },
            LayerSpec::Relu,
            LayerSpec::Conv2d {
                out_channels: 4,
                kernel_size: 3,
                stride: 2,
                padding: 0,
                bias: false,
            },
            LayerSpec::Gelu,
            LayerSpec::Flatten,
            LayerSpec::Relu,
            LayerSpec::Linear {
                out_features: 3,
                bias: true,
            },
        ],
    }
}

/// Whole synthetic dataset as one `(images, labels)` batch.
pub fn dataset_tensors(ds: &ImageDataset) -> (Tensor, Tensor) {
    let [c, h, w] = ds.sample_shape();
    let mut images = Vec::new();
    let mut labels = Vec::new();
    for i in 0..ds.len() {
        let (px, label) = ds.sample(i);
        images.extend_from_slice(px);
        labels.push(label);
    }
    let x = Tensor::from_vec(images, (ds.len(), c, h, w), &Device::Cpu).unwrap();
    let y = Tensor::from_vec(labels, ds.len(), &Device::Cpu).unwrap();
    (x, y)
}
