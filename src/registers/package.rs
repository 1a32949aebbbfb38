use crate::backend::{RegisterFault, RegisterFile, RegisterId};
use crate::trace;
use crate::wake::NonBlocking;

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

const UNSAVED: u8 = 0;
const SAVING: u8 = 1;
const SAVED: u8 = 2;

#[derive(Default)]
struct Package {
    status: AtomicU8,
    members: AtomicUsize,
    saved: spin::Mutex<Vec<(RegisterId, u64)>>,
}

/// Saves registers shared by every logical CPU of a package exactly once
/// per session and restores them when the last sibling leaves.
pub struct PackageCoordinator {
    packages: Box<[Package]>,
    saves: AtomicU64,
}

impl NonBlocking for PackageCoordinator {}

impl PackageCoordinator {
    pub fn new(packages: usize) -> Self {
        Self {
            packages: (0..packages.max(1)).map(|_| Package::default()).collect(),
            saves: AtomicU64::new(0),
        }
    }

    /// Register `cpu` as an active member of `package`. The first member
    /// saves and clears the shared registers; the others wait until the
    /// save is visible.
    pub fn join(
        &self,
        package: usize,
        regs: &dyn RegisterFile,
        cpu: usize,
        shared: &[RegisterId],
    ) -> Result<(), RegisterFault> {
        let pkg = self
            .packages
            .get(package)
            .ok_or(RegisterFault::NoSuchCpu(cpu))?;

        pkg.members.fetch_add(1, Ordering::AcqRel);

        if shared.is_empty() {
            return Ok(());
        }

        if pkg
            .status
            .compare_exchange(UNSAVED, SAVING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // bounded by the saver's register count
            while pkg.status.load(Ordering::Acquire) == SAVING {
                std::hint::spin_loop();
            }
            return Ok(());
        }

        let result = save(regs, cpu, shared, &mut pkg.saved.lock());

        pkg.status.store(SAVED, Ordering::Release);
        self.saves.fetch_add(1, Ordering::Relaxed);

        trace!("cpu {cpu} saved {} shared registers of package {package}", shared.len());

        result
    }

    /// Drop `cpu` from `package`. The last member out writes the saved
    /// values back.
    pub fn leave(
        &self,
        package: usize,
        regs: &dyn RegisterFile,
        cpu: usize,
    ) -> Result<(), RegisterFault> {
        let pkg = self
            .packages
            .get(package)
            .ok_or(RegisterFault::NoSuchCpu(cpu))?;

        if pkg.members.fetch_sub(1, Ordering::AcqRel) != 1 {
            return Ok(());
        }

        if pkg.status.load(Ordering::Acquire) != SAVED {
            return Ok(());
        }

        let mut saved = pkg.saved.lock();
        let mut result = Ok(());

        for (reg, value) in saved.drain(..) {
            if let Err(e) = regs.write(cpu, reg, value) {
                result = result.and(Err(e));
            }
        }

        pkg.status.store(UNSAVED, Ordering::Release);

        trace!("cpu {cpu} restored shared registers of package {package}");

        result
    }

    /// Number of shared-register saves performed, across all packages.
    pub fn saves(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    pub fn members(&self, package: usize) -> usize {
        self.packages
            .get(package)
            .map(|p| p.members.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}

fn save(
    regs: &dyn RegisterFile,
    cpu: usize,
    shared: &[RegisterId],
    saved: &mut Vec<(RegisterId, u64)>,
) -> Result<(), RegisterFault> {
    saved.clear();

    for reg in shared {
        let value = regs.read(cpu, *reg)?;
        saved.push((*reg, value));
        regs.write(cpu, *reg, 0)?;
    }

    Ok(())
}
