//! API Module
//!
//! REST surface over the driver operations.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
