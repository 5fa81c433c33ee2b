//! Domain layer - Core types and port definitions
//!
//! This module defines the volume model and the traits (ports) that cloud and
//! OS adapters implement, following hexagonal architecture principles.

pub mod ports;

pub use ports::*;
