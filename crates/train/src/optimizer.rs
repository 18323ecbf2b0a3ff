//! Optimisers: candle's AdamW plus SGD with momentum and weight decay.

use candle_core::{backprop::GradStore, Result, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};

/// SGD hyper-parameters (PyTorch semantics: `d = g + wd·p`,
/// `v = μ·v + d`, `p -= lr·v`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamsSgd {
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
}

impl Default for ParamsSgd {
    fn default() -> Self {
        Self {
            lr: 0.1,
            momentum: 0.9,
            weight_decay: 5e-4,
        }
    }
}

pub struct SgdMomentum {
    vars: Vec<Var>,
    velocity: Vec<Option<Tensor>>,
    params: ParamsSgd,
}

impl Optimizer for SgdMomentum {
    type Config = ParamsSgd;

    fn new(vars: Vec<Var>, params: ParamsSgd) -> Result<Self> {
        let velocity = vec![None; vars.len()];
        Ok(Self {
            vars,
            velocity,
            params,
        })
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        for (var, velocity) in self.vars.iter().zip(self.velocity.iter_mut()) {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let mut d = grad.clone();
            if self.params.weight_decay != 0.0 {
                d = (d + var.as_tensor().affine(self.params.weight_decay, 0.0)?)?;
            }
            let v = match velocity.take() {
                Some(prev) if self.params.momentum != 0.0 => (prev.affine(self.params.momentum, 0.0)? + d)?,
                _ => d,
            };
            var.set(&(var.as_tensor() - v.affine(self.params.lr, 0.0)?)?)?;
            *velocity = Some(v.detach());
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}

/// The optimiser a training phase uses.
pub enum Optim {
    AdamW(AdamW),
    Sgd(SgdMomentum),
}

impl Optim {
    pub fn adamw(vars: Vec<Var>, lr: f64, weight_decay: f64) -> Result<Self> {
        let params = ParamsAdamW {
            lr,
            weight_decay,
            ..Default::default()
        };
        Ok(Self::AdamW(AdamW::new(vars, params)?))
    }

    pub fn sgd(vars: Vec<Var>, params: ParamsSgd) -> Result<Self> {
        Ok(Self::Sgd(SgdMomentum::new(vars, params)?))
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        match self {
            Self::AdamW(opt) => opt.step(grads),
            Self::Sgd(opt) => opt.step(grads),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::AdamW(opt) => opt.learning_rate(),
            Self::Sgd(opt) => opt.learning_rate(),
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            Self::AdamW(opt) => opt.set_learning_rate(lr),
            Self::Sgd(opt) => opt.set_learning_rate(lr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn sgd_momentum_accumulates_velocity() {
        let w = Var::new(&[1.0f32], &Device::Cpu).unwrap();
        let mut opt = SgdMomentum::new(
            vec![w.clone()],
            ParamsSgd {
                lr: 0.1,
                momentum: 0.5,
                weight_decay: 0.0,
            },
        )
        .unwrap();
        // loss = w → grad 1
        for _ in 0..2 {
            let grads = w.as_tensor().sum_all().unwrap().backward().unwrap();
            opt.step(&grads).unwrap();
        }
        // v1 = 1, w = 0.9; v2 = 0.5 + 1 = 1.5, w = 0.75
        let v: Vec<f32> = w.as_tensor().to_vec1().unwrap();
        assert!((v[0] - 0.75).abs() < 1e-6);
    }

    #[test]
    fn sgd_weight_decay_pulls_towards_zero() {
        let w = Var::new(&[2.0f32], &Device::Cpu).unwrap();
        let mut opt = Optim::sgd(
            vec![w.clone()],
            ParamsSgd {
                lr: 0.1,
                momentum: 0.0,
                weight_decay: 0.5,
            },
        )
        .unwrap();
        let grads = w.as_tensor().affine(0.0, 0.0).unwrap().sum_all().unwrap().backward().unwrap();
        opt.step(&grads).unwrap();
        // d = 0 + 0.5·2 = 1 → w = 2 - 0.1
        let v: Vec<f32> = w.as_tensor().to_vec1().unwrap();
        assert!((v[0] - 1.9).abs() < 1e-6);
    }

    #[test]
    fn learning_rate_is_settable() {
        let w = Var::new(&[1.0f32], &Device::Cpu).unwrap();
        let mut opt = Optim::adamw(vec![w], 1e-3, 5e-4).unwrap();
        opt.set_learning_rate(0.5);
        assert_eq!(opt.learning_rate(), 0.5);
    }
}
