//! Convenience re-exports for common tidal-core types.
//!
//! ```rust
//! use tidal_core::prelude::*;
//! ```

pub use crate::Device;
pub use crate::Result;
pub use crate::Shape;
pub use crate::Tensor;
pub use crate::TidalError;
