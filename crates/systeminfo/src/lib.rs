//! Gather the processor description the sampling engine needs: logical CPU
//! topology and each CPU's family, model and feature flags.
//!

#[macro_use]
extern crate serde;

mod error;
pub mod hwinfo;

pub use crate::error::{Error, Result};
pub use crate::hwinfo::Cpu;

/// Read the [`SystemInfo`] for the current system.
pub fn systeminfo() -> Result<SystemInfo> {
    SystemInfo::new()
}

#[non_exhaustive]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SystemInfo {
    pub hwinfo: crate::hwinfo::HwInfo,
}

impl SystemInfo {
    pub fn new() -> Result<Self> {
        Ok(Self {
            hwinfo: crate::hwinfo::HwInfo::new()?,
        })
    }
}
