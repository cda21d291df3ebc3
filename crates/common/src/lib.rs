//! # curve-common — Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`ModelConfig`]** — architecture + curve hyper-parameters (JSON).
//! * **[`LabeledDataset`]** / **[`DataLoader`]** — data loading & batching.
//! * **[`DeviceSpec`]** — explicit compute placement, resolved once.

pub mod config;
pub mod data;
pub mod device;

pub use config::{CurveKind, ModelConfig};
pub use data::{
    batch_to_tensors, gaussian_blobs, write_dataset_file, AnyDataset, DataLoader,
    InMemoryDataset, LabeledDataset, MmapDataset,
};
pub use device::{place_batch, DeviceSpec};
