//! Control Plane Module
//!
//! Cloud-side volume lifecycle: the registry adapters, the attachment state
//! machine with its polling loops, the driver facade and its API.

pub mod api;
pub mod attachment;
pub mod driver;
pub mod polling;
pub mod registry;

pub use api::*;
pub use attachment::*;
pub use driver::*;
pub use polling::*;
pub use registry::*;
