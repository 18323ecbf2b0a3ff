//! # qat-pipeline: Lifecycle Coordinator
//!
//! Takes a trained float classifier through quantization-aware training to a
//! mobile artifact:
//!
//! ```text
//! Float → Instrumented → Training → Frozen → Converted
//! ```
//!
//! * **[`QatCoordinator`]** owns the state machine and runs every stage.
//! * **[`PipelineConfig`]** is the JSON-serialisable run configuration.
//! * **[`PipelineReport`]** summarises a finished run.

pub mod coordinator;
pub mod types;

pub use coordinator::{Pruner, QatCoordinator, METRICS_FILE, QAT_WEIGHTS_FILE};
pub use types::{
    DataConfig, DistillConfig, FeatureFlags, OptimizerKind, PhaseConfig, PipelineConfig,
    PipelineReport, PipelineState, PruningReport, WarmupConfig,
};
