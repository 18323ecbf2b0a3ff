//! # qat-core: Models and Quantisation
//!
//! Everything needed to take a float classifier through quantization-aware
//! training and freeze it to integers:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`model`] | `Classifier` trait, `Mode`, `FloatModel` |
//! | [`quantize`] | affine parameters, fake-quant with STE, fixed-point multipliers |
//! | [`observer`] | moving-average min/max activation observers |
//! | [`qat`] | `QatPlan`, `InstrumentedModel` |
//! | [`kernels`] | reference int8 conv / fully-connected kernels |
//! | [`frozen`] | `FrozenModel` and its integer ops |
//! | [`quantizer`] | `Quantizer` trait, `QatQuantizer` |
//! | [`parallel`] | `DataParallel` wrapper |
//!
//! ## Design principles
//!
//! 1. **Owned stages.** Each stage consumes or copies its input and returns
//!    a new model; no two models share mutable parameters.
//! 2. **`Send + Sync`.** Observer state uses `parking_lot::Mutex`, so models
//!    can be driven from rayon shards.
//! 3. **Repeatable evaluation.** Observers only move in training mode.

pub mod frozen;
pub mod kernels;
pub mod model;
pub mod observer;
pub mod parallel;
pub mod qat;
pub mod quantize;
pub mod quantizer;

#[cfg(test)]
mod testing;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use frozen::{FrozenModel, FrozenOp, QuantizedWeights};
pub use kernels::{ConvGeometry, Requant};
pub use model::{Classifier, FloatModel, Mode};
pub use observer::MinMaxObserver;
pub use parallel::DataParallel;
pub use qat::{InstrumentedModel, PlanOp, QatPlan};
pub use quantize::{FixedMultiplier, QuantParams};
pub use quantizer::{QatQuantizer, Quantizer, PLAN_FILE};
