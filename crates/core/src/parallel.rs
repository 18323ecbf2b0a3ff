//! Data-parallel wrapper: split a batch into shards, run them concurrently,
//! concatenate the outputs.
//!
//! Every shard shares the wrapped model's parameters, so the autograd graph
//! of the concatenated output reaches the same variables and one backward
//! pass yields the gradient of the whole logical batch.

use candle_core::{Device, Tensor, Var};
use rayon::prelude::*;

use qat_common::Result;

use crate::model::{Classifier, Mode};

pub struct DataParallel<M> {
    inner: M,
    replicas: usize,
}

impl<M: Classifier> DataParallel<M> {
    pub fn new(inner: M, replicas: usize) -> Self {
        Self {
            inner,
            replicas: replicas.max(1),
        }
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }

    /// Drop the wrapper, returning the model it drove.
    pub fn into_inner(self) -> M {
        self.inner
    }
}

impl<M: Classifier> DataParallel<M> {
    fn sharded(&self, x: &Tensor) -> Result<Tensor> {
        let n = x.dim(0)?;
        let shard = (n + self.replicas - 1) / self.replicas;
        let shards = (0..n)
            .step_by(shard)
            .map(|start| x.narrow(0, start, shard.min(n - start)))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let outputs = shards
            .par_iter()
            .map(|s| self.inner.forward_fixed_stats(s))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&outputs, 0)?)
    }
}

impl<M: Classifier> Classifier for DataParallel<M> {
    /// Statistics are updated once from the whole batch before the shards
    /// run, so observer ranges match an unsharded forward.
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        if self.replicas == 1 || x.dim(0)? < 2 {
            return self.inner.forward(x);
        }
        self.inner.observe_batch(x)?;
        self.sharded(x)
    }

    fn observe_batch(&self, x: &Tensor) -> Result<()> {
        self.inner.observe_batch(x)
    }

    fn forward_fixed_stats(&self, x: &Tensor) -> Result<Tensor> {
        if self.replicas == 1 || x.dim(0)? < 2 {
            return self.inner.forward_fixed_stats(x);
        }
        self.sharded(x)
    }

    fn mode(&self) -> Mode {
        self.inner.mode()
    }

    fn set_mode(&mut self, mode: Mode) -> Result<()> {
        self.inner.set_mode(mode)
    }

    fn grad_enabled(&self) -> bool {
        self.inner.grad_enabled()
    }

    fn set_grad_enabled(&mut self, enabled: bool) -> Result<()> {
        self.inner.set_grad_enabled(enabled)
    }

    fn device(&self) -> &Device {
        self.inner.device()
    }

    fn trainable_vars(&self) -> Vec<Var> {
        self.inner.trainable_vars()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use qat_common::QuantizerConfig;

    use crate::model::FloatModel;
    use crate::qat::{InstrumentedModel, QatPlan};
    use crate::testing::tiny_mlp;

    #[test]
    fn sharded_forward_matches_single() {
        let model = FloatModel::new(&tiny_mlp(), &Device::Cpu).unwrap();
        let x = Tensor::randn(0f32, 1.0, (7, 1, 2, 2), &Device::Cpu).unwrap();
        let expected: Vec<Vec<f32>> = model.forward(&x).unwrap().to_vec2().unwrap();
        let dp = DataParallel::new(model, 3);
        let got: Vec<Vec<f32>> = dp.forward(&x).unwrap().to_vec2().unwrap();
        for (a, b) in expected.iter().flatten().zip(got.iter().flatten()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn sharding_leaves_observer_statistics_unchanged() {
        let float = FloatModel::new(&tiny_mlp(), &Device::Cpu).unwrap();
        let qconfig = QuantizerConfig::default();
        let plan = QatPlan::build(&tiny_mlp(), &qconfig).unwrap();
        let single = InstrumentedModel::from_float(&float, plan.clone(), &qconfig).unwrap();
        let sharded =
            DataParallel::new(InstrumentedModel::from_float(&float, plan, &qconfig).unwrap(), 2);
        let x = Tensor::randn(0f32, 1.0, (8, 1, 2, 2), &Device::Cpu).unwrap();

        let expected: Vec<Vec<f32>> = single.forward(&x).unwrap().to_vec2().unwrap();
        let got: Vec<Vec<f32>> = sharded.forward(&x).unwrap().to_vec2().unwrap();

        assert_eq!(single.observer_ranges(), sharded.inner().observer_ranges());
        for (a, b) in expected.iter().flatten().zip(got.iter().flatten()) {
            assert!((a - b).abs() < 1e-5, "{a} vs {b}");
        }
    }

    #[test]
    fn gradients_reach_shared_parameters() {
        let model = FloatModel::new(&tiny_mlp(), &Device::Cpu).unwrap();
        let dp = DataParallel::new(model, 2);
        let x = Tensor::randn(0f32, 1.0, (4, 1, 2, 2), &Device::Cpu).unwrap();
        let loss = dp.forward(&x).unwrap().sqr().unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        for var in dp.trainable_vars() {
            assert!(grads.get(var.as_tensor()).is_some());
        }
        let inner = dp.into_inner();
        assert_eq!(inner.trainable_vars().len(), 4);
    }
}
