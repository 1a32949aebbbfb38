//! Logical CPU layout: which package each CPU belongs to and which
//! hardware thread of its core it is.

use crate::backend::{self, Family};
use crate::error::{Result, SamplingError};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LogicalCpu {
    pub id: usize,
    pub package: usize,
    pub thread: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Topology {
    cpus: Vec<LogicalCpu>,
    packages: usize,
    family: Option<Family>,
}

impl Topology {
    /// `packages` packages of `threads` logical CPUs each, numbered so
    /// that siblings are adjacent.
    pub fn synthetic(packages: usize, threads: usize) -> Self {
        let threads = threads.max(1);

        let cpus = (0..packages.max(1) * threads)
            .map(|id| LogicalCpu {
                id,
                package: id / threads,
                thread: id % threads,
            })
            .collect();

        Self {
            cpus,
            packages: packages.max(1),
            family: None,
        }
    }

    /// Read the running system's layout.
    pub fn detect() -> Result<Self> {
        let info = systeminfo::systeminfo()
            .map_err(|e| SamplingError::unsupported(format!("cannot read cpu topology: {e}")))?;

        let hw = &info.hwinfo;

        // dense ids, the engine indexes per-cpu state by position
        let cpus: Vec<LogicalCpu> = hw
            .get_cpus()
            .iter()
            .enumerate()
            .map(|(id, cpu)| LogicalCpu {
                id,
                package: cpu.package(),
                thread: cpu.thread(),
            })
            .collect();

        if cpus.is_empty() {
            return Err(SamplingError::unsupported("no online cpus"));
        }

        let family = hw
            .get_cpus()
            .first()
            .and_then(backend::detect);

        Ok(Self {
            cpus,
            packages: hw.packages().max(1),
            family,
        })
    }

    /// The backend family of the detected processor.
    pub fn family(&self) -> Option<Family> {
        self.family
    }

    pub fn cpus(&self) -> &[LogicalCpu] {
        &self.cpus
    }

    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    pub fn packages(&self) -> usize {
        self.packages
    }
}
