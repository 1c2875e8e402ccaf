//! # tidal-runtime
//!
//! Runs models that do not fit in accelerator memory by streaming one stage's
//! weights at a time from pinned host memory, overlapping each copy with the
//! previous stage's compute, while many requests share the device.
//!
//! - [`Runtime`]: submission entry point (`submit`, `run`, `submit_async`)
//! - [`AsyncHandle`]: per-request future; handles can be passed as inputs to
//!   later submissions to chain requests
//! - [`Scheduler`]: single actor thread ordering work by shortest remaining
//!   workload, with per-stage pipeline depth limits
//! - [`TransferEngine`]: pinned staging regions and a double-buffered device
//!   slot pool guarded by landed/reusable events
//! - [`PipelineModel`], [`Stage`], [`Partitioner`]: what gets streamed
//! - [`Value`], [`BatchCodec`]: nested inputs and microbatch splitting

pub mod batch;
pub mod config;
pub mod event;
pub mod handle;
pub mod model;
mod ready;
pub mod runtime;
pub mod scheduler;
pub mod stage;
pub mod stream;
pub mod transfer;
pub mod value;

pub use batch::{Batch, BatchCodec, DefaultBatchCodec, FlatMicrobatch};
pub use config::RuntimeConfig;
pub use event::Event;
pub use handle::{AsyncHandle, HandleId};
pub use model::{
    BalancedPartitioner, Layer, LayerStack, ModelId, Partitioner, PipelineModel, SplitHints,
    SplitPoint,
};
pub use runtime::{Runtime, SubmitOptions, Submitted};
pub use scheduler::{Scheduler, SchedulerStats};
pub use stage::{
    weights_from_f32, DeviceParams, LayerExecutor, LayerWeights, ParamEntry, Stage, StageContext,
};
pub use stream::Stream;
pub use transfer::{
    DeviceBackend, DeviceTag, PinnedRegion, SimulatedDevice, SlotState, TransferEngine,
    TransferStats,
};
pub use value::{TreeSpec, Value};
