//! Volume Registry Adapters
//!
//! Provides the cloud-side volume registry:
//! - OpenStack (Keystone + Cinder + Nova)
//! - In-memory (standalone runs and tests)

pub mod memory;
pub mod openstack;

pub use memory::*;
pub use openstack::*;

use crate::domain::ports::VolumeRegistryRef;
use crate::error::{Error, Result};
use std::str::FromStr;
use std::sync::Arc;

/// Registry implementation to run against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryKind {
    OpenStack,
    Memory,
}

impl FromStr for RegistryKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openstack" | "cinder" => Ok(RegistryKind::OpenStack),
            "memory" | "standalone" => Ok(RegistryKind::Memory),
            other => Err(Error::Configuration(format!(
                "unknown volume registry: {}",
                other
            ))),
        }
    }
}

/// Factory for creating volume registries
pub struct RegistryFactory;

impl RegistryFactory {
    pub fn create(kind: RegistryKind, config: OpenStackConfig) -> Result<VolumeRegistryRef> {
        match kind {
            RegistryKind::OpenStack => Ok(Arc::new(OpenStackRegistry::new(config)?)),
            RegistryKind::Memory => Ok(Arc::new(InMemoryRegistry::new())),
        }
    }
}
