//! # tidal-core
//!
//! Core types shared by the tidal layer-streaming runtime:
//! - [`Device`]: host or accelerator memory space
//! - [`Shape`] and [`Tensor`]: the activations that flow between stages
//! - [`TidalError`]: the error kinds every crate reports

pub mod device;
pub mod error;
pub mod prelude;
pub mod shape;
pub mod tensor;

pub use device::Device;
pub use error::TidalError;
pub use shape::Shape;
pub use tensor::Tensor;

pub type Result<T> = std::result::Result<T, TidalError>;
