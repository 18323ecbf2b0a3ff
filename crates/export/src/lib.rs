//! # qat-export: Mobile Lowering
//!
//! Converts a [`FrozenModel`](qat_core::FrozenModel) into the packed
//! `.qmdl` format:
//!
//! 1. [`graph`] builds a petgraph lowering graph and runs the rewrite
//!    passes (QDQ fusion, lookup-table rewrite, micro-runtime rewrite).
//! 2. The lowering rules turn it into tensor and op tables.
//! 3. [`writer`] serialises the tables and optionally a C array.

pub mod converter;
pub mod graph;
pub mod writer;

#[cfg(test)]
mod testing;

pub use converter::{Converter, ExportSummary, MobileConverter};
pub use graph::{LoweredModel, LoweredOp, LoweringGraph, Opcode, TensorEntry, TensorType};
pub use writer::{decode, encode, read_qmdl, ModelMeta, QmdlFile};
