//! Node Module
//!
//! Everything that runs against the local compute node: device discovery,
//! instance metadata, node identity, and stage/publish mounts.

pub mod discovery;
pub mod identity;
pub mod metadata;
pub mod mount;

pub use discovery::*;
pub use identity::*;
pub use metadata::*;
pub use mount::*;
