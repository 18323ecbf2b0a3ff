//! # qat-common: Shared Primitives
//!
//! Types shared across every crate in the workspace:
//!
//! * **[`QatError`]** / **[`Result`]** - the error taxonomy of the pipeline.
//! * **[`ModelConfig`]**, **[`QuantizerConfig`]**, **[`ExportOptions`]** -
//!   JSON-serialisable configuration.
//! * **[`ImageDataset`]** / **[`BatchLoader`]** - data loading & batching.
//! * **[`DatasetProvider`]** - `(train, val)` loaders per training phase.

pub mod config;
pub mod data;
pub mod error;

pub use config::{
    ExportOptions, LayerSpec, ModelConfig, QuantBackend, QuantizerConfig, TargetType,
};
pub use data::{
    BatchLoader, Cifar10Provider, DataLoader, DatasetProvider, ImageBatch, ImageDataset,
    InMemoryProvider, LoaderPair, LoaderPurpose, Normalization,
};
pub use error::{ErrorKind, QatError, Result};
