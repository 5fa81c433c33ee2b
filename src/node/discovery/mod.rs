//! Device Discovery Module
//!
//! Locates the local block device of an attached volume and waits for device
//! nodes to appear.

pub mod resolver;
pub mod scanner;

pub use resolver::*;
pub use scanner::*;
