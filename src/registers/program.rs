use super::{PackageCoordinator, RegisterSet};
use crate::backend::{HardwareBackend, Overflow, RegisterFault, RegisterFile};
use crate::wake::NonBlocking;

/// Applies register sets to logical CPUs. Every method here runs on the
/// CPU it programs, either from a start/stop fan-out or from the overflow
/// interrupt.
pub struct Programmer<'a> {
    backend: &'a dyn HardwareBackend,
    regs: &'a dyn RegisterFile,
    packages: &'a PackageCoordinator,
}

impl NonBlocking for Programmer<'_> {}

impl<'a> Programmer<'a> {
    pub fn new(
        backend: &'a dyn HardwareBackend,
        regs: &'a dyn RegisterFile,
        packages: &'a PackageCoordinator,
    ) -> Self {
        Self {
            backend,
            regs,
            packages,
        }
    }

    /// Freeze, clear overflow state, write globals, controls (quiesced) and
    /// counter start values, then unfreeze. The first apply of a session
    /// (`joined` still false) also joins the CPU's package, saving the
    /// shared registers if it is the first sibling there.
    pub fn apply(
        &self,
        cpu: usize,
        package: usize,
        set: &RegisterSet,
        joined: &mut bool,
    ) -> Result<(), RegisterFault> {
        self.backend.freeze(self.regs, cpu, set)?;
        self.backend.clear_overflow(self.regs, cpu, set)?;

        if !*joined {
            *joined = true;
            self.packages
                .join(package, self.regs, cpu, self.backend.shared_registers())?;
        }

        for global in set.globals() {
            self.regs.write(cpu, global.id, global.value)?;
        }

        for control in set.controls() {
            self.regs
                .write(cpu, control.id, self.backend.quiesced(control.value))?;
        }

        for counter in set.counters() {
            self.regs.write(cpu, counter.id, counter.value)?;
            counter.set_overflowed(cpu, false);
        }

        self.backend.unfreeze(self.regs, cpu, set)
    }

    /// Reload only the counters that overflowed and resume counting.
    pub fn rearm(
        &self,
        cpu: usize,
        set: &RegisterSet,
        overflow: Overflow,
    ) -> Result<(), RegisterFault> {
        for bit in overflow.bits() {
            if let Some(counter) = set.counter(bit) {
                self.regs.write(cpu, counter.id, counter.value)?;
                counter.set_overflowed(cpu, false);
            }
        }

        self.backend.unfreeze(self.regs, cpu, set)
    }

    /// Stop counting on `cpu` and, if it joined, leave its package. The
    /// package is left even when freezing fails.
    pub fn restore(
        &self,
        cpu: usize,
        package: usize,
        set: &RegisterSet,
        joined: bool,
    ) -> Result<(), RegisterFault> {
        let frozen = self
            .backend
            .freeze(self.regs, cpu, set)
            .and_then(|_| self.backend.clear_overflow(self.regs, cpu, set));

        let left = if joined {
            self.packages.leave(package, self.regs, cpu)
        } else {
            Ok(())
        };

        frozen.and(left)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::SimulatedPmu;
    use crate::backend::{select, Family, RegisterId};
    use crate::params::{EventRequest, SessionParams};
    use crate::registers::configure;

    use parking_lot::Mutex;

    /// Records every write on its way to the simulated registers.
    struct Recording {
        pmu: SimulatedPmu,
        writes: Mutex<Vec<(RegisterId, u64)>>,
    }

    impl NonBlocking for Recording {}

    impl RegisterFile for Recording {
        fn read(&self, cpu: usize, reg: RegisterId) -> Result<u64, RegisterFault> {
            self.pmu.read(cpu, reg)
        }

        fn write(&self, cpu: usize, reg: RegisterId, value: u64) -> Result<(), RegisterFault> {
            self.writes.lock().push((reg, value));
            self.pmu.write(cpu, reg, value)
        }
    }

    #[test]
    fn apply_then_restore() {
        let backend = select(Family::P6);
        let pmu = SimulatedPmu::new(backend.as_ref(), 1);
        let packages = PackageCoordinator::new(1);

        let params = SessionParams {
            events: vec![
                EventRequest::control(0x186, 0x5300c0, 0xc1, 1),
                EventRequest::counter(0xc1, 10),
            ],
            ..Default::default()
        };
        let config = configure(backend.as_ref(), &pmu, &params, 1).unwrap();
        let set = config.tables.set_for(0);
        let programmer = Programmer::new(backend.as_ref(), &pmu, &packages);

        let mut joined = false;
        programmer.apply(0, 0, set, &mut joined).unwrap();
        assert!(joined);
        assert_eq!(packages.members(0), 1);
        assert_eq!(pmu.read(0, RegisterId(0x186)).unwrap(), 0x5300c0);
        assert_eq!(pmu.read(0, RegisterId(0xc1)).unwrap(), 0xff_ffff_fff6);

        // later applies do not join again
        programmer.apply(0, 0, set, &mut joined).unwrap();
        assert_eq!(packages.members(0), 1);

        programmer.restore(0, 0, set, joined).unwrap();
        // enable bit cleared
        assert_eq!(pmu.read(0, RegisterId(0x186)).unwrap(), 0x1300c0);
        assert_eq!(packages.members(0), 0);
    }

    #[test]
    fn rearm_reloads_only_overflowed() {
        let backend = select(Family::P6);
        let pmu = SimulatedPmu::new(backend.as_ref(), 1);
        let packages = PackageCoordinator::new(1);

        let params = SessionParams {
            events: vec![
                EventRequest::control(0x186, 0x5300c0, 0xc1, 1),
                EventRequest::counter(0xc1, 10),
                EventRequest::control(0x187, 0x53003c, 0xc2, 2),
                EventRequest::counter(0xc2, 20),
            ],
            ..Default::default()
        };
        let config = configure(backend.as_ref(), &pmu, &params, 1).unwrap();
        let set = config.tables.set_for(0);
        let programmer = Programmer::new(backend.as_ref(), &pmu, &packages);

        programmer.apply(0, 0, set, &mut true).unwrap();
        pmu.write(0, RegisterId(0xc1), 5).unwrap();
        pmu.write(0, RegisterId(0xc2), 7).unwrap();

        let overflow = Overflow {
            bitmap: 0b01,
            deferred: 0,
        };
        programmer.rearm(0, set, overflow).unwrap();

        assert_eq!(pmu.read(0, RegisterId(0xc1)).unwrap(), set.counter(0).unwrap().value);
        assert_eq!(pmu.read(0, RegisterId(0xc2)).unwrap(), 7);
    }

    #[test]
    fn apply_write_order() {
        let backend = select(Family::Itanium);
        let regs = Recording {
            pmu: SimulatedPmu::new(backend.as_ref(), 1),
            writes: Mutex::new(Vec::new()),
        };
        let packages = PackageCoordinator::new(1);

        let params = SessionParams {
            events: vec![
                EventRequest::raw(0x100a, 0x3),
                EventRequest::control(0x1004, 0x12, 0x2004, 1),
                EventRequest::counter(0x2004, 10),
            ],
            ..Default::default()
        };
        let config = configure(backend.as_ref(), &regs, &params, 1).unwrap();
        let set = config.tables.set_for(0);
        let programmer = Programmer::new(backend.as_ref(), &regs, &packages);

        regs.writes.lock().clear();
        programmer.apply(0, 0, set, &mut false).unwrap();

        let writes = regs.writes.lock().clone();
        let order: Vec<u32> = writes.iter().map(|(reg, _)| reg.0).collect();

        // freeze, clear overflow, globals, controls, counters, unfreeze
        assert_eq!(order, vec![0x1000, 0x1000, 0x100a, 0x1004, 0x2004, 0x1000]);
        assert_eq!(writes[0].1 & 1, 1);
        assert_eq!(writes[1].1 & 0xf0, 0);
        assert_eq!(writes[2].1, 0x3);
        assert_eq!(writes[3].1, 0x12);
        assert_eq!(writes[4].1, set.counters().next().unwrap().value);
        assert_eq!(writes[5].1 & 1, 0);
    }
}
