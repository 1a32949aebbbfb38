//! Software model of a family's performance-monitoring registers.
//!
//! Counters advance one event at a time through [`SimulatedPmu::tick`],
//! following the family's [`CounterModel`]: enable and freeze bits gate
//! counting, wrapping sets the family's overflow flag and raises the
//! interrupt either on the wrap or one event later.

use super::*;

use std::collections::{HashMap, HashSet};

type Bank = spin::Mutex<HashMap<RegisterId, u64>>;

pub struct SimulatedPmu {
    models: HashMap<RegisterId, CounterModel>,
    shared: HashSet<RegisterId>,
    mask: u64,
    threads: usize,
    cpus: Box<[Bank]>,
    packages: Box<[Bank]>,
    /// Counters that wrapped to zero without raising the interrupt yet.
    late: Box<[spin::Mutex<HashSet<RegisterId>>]>,
    poisoned: spin::Mutex<HashSet<RegisterId>>,
}

impl NonBlocking for SimulatedPmu {}

impl SimulatedPmu {
    /// Registers for `cpus` logical CPUs, numbered so that consecutive
    /// CPUs are the hardware threads of one package.
    pub fn new(backend: &dyn HardwareBackend, cpus: usize) -> Self {
        let implemented = backend.implemented();
        let shared: HashSet<RegisterId> = backend.shared_registers().iter().copied().collect();
        let threads = backend.threads().max(1);

        let bank = |private: bool| -> Bank {
            spin::Mutex::new(
                implemented
                    .iter()
                    .filter(|r| shared.contains(r) != private)
                    .map(|r| (*r, 0))
                    .collect(),
            )
        };

        let models = implemented
            .iter()
            .filter_map(|r| backend.counter_model(*r).map(|m| (*r, m)))
            .collect();

        Self {
            models,
            mask: backend.counter_mask(),
            threads,
            cpus: (0..cpus).map(|_| bank(true)).collect(),
            packages: (0..cpus.div_ceil(threads)).map(|_| bank(false)).collect(),
            late: (0..cpus).map(|_| spin::Mutex::new(HashSet::new())).collect(),
            poisoned: spin::Mutex::new(HashSet::new()),
            shared,
        }
    }

    pub fn cpus(&self) -> usize {
        self.cpus.len()
    }

    /// Make every access to `reg` fail.
    pub fn poison(&self, reg: RegisterId) {
        self.poisoned.lock().insert(reg);
    }

    fn bank(&self, cpu: usize, reg: RegisterId) -> Result<&Bank, RegisterFault> {
        if self.poisoned.lock().contains(&reg) {
            return Err(RegisterFault::Unimplemented(reg));
        }

        let bank = if self.shared.contains(&reg) {
            self.packages.get(cpu / self.threads)
        } else {
            self.cpus.get(cpu)
        };

        bank.ok_or(RegisterFault::NoSuchCpu(cpu))
    }

    /// Count one event on `counter`. Returns whether the overflow
    /// interrupt was raised.
    pub fn tick(&self, cpu: usize, counter: RegisterId) -> Result<bool, RegisterFault> {
        let model = *self
            .models
            .get(&counter)
            .ok_or(RegisterFault::Unimplemented(counter))?;

        let mut regs = self.bank(cpu, counter)?.lock();
        let control = regs.get(&model.control).copied().unwrap_or(0);

        let enabled = match model.enable {
            Enable::ControlBit(bit) => control & (1 << bit) != 0,
            Enable::Unfrozen { register, bit } => {
                regs.get(&register).copied().unwrap_or(0) & (1 << bit) == 0
            }
        };

        if !enabled {
            return Ok(false);
        }

        let next = regs.get(&counter).copied().unwrap_or(0).wrapping_add(1) & self.mask;
        regs.insert(counter, next);

        let forced = model
            .force_bit
            .map(|bit| control & (1 << bit) != 0)
            .unwrap_or(false);

        let mut late = self.late[cpu].lock();

        if next == 0 || forced {
            match model.overflow {
                OverflowFlag::Inferred => {}
                OverflowFlag::ControlBit(bit) => {
                    regs.insert(model.control, control | 1 << bit);
                }
                OverflowFlag::StatusBit { register, bit } => {
                    let status = regs.get(&register).copied().unwrap_or(0);
                    regs.insert(register, status | 1 << bit);
                }
            }

            if model.interrupt_at_zero || forced {
                late.remove(&counter);
                return Ok(true);
            }

            late.insert(counter);
            return Ok(false);
        }

        Ok(late.remove(&counter))
    }

    /// Count `events` events, stopping early at the first interrupt.
    /// Returns the events consumed and whether an interrupt was raised.
    pub fn advance(
        &self,
        cpu: usize,
        counter: RegisterId,
        events: u64,
    ) -> Result<(u64, bool), RegisterFault> {
        for n in 1..=events {
            if self.tick(cpu, counter)? {
                return Ok((n, true));
            }
        }
        Ok((events, false))
    }
}

impl RegisterFile for SimulatedPmu {
    fn read(&self, cpu: usize, reg: RegisterId) -> Result<u64, RegisterFault> {
        self.bank(cpu, reg)?
            .lock()
            .get(&reg)
            .copied()
            .ok_or(RegisterFault::Unimplemented(reg))
    }

    fn write(&self, cpu: usize, reg: RegisterId, value: u64) -> Result<(), RegisterFault> {
        let mut regs = self.bank(cpu, reg)?.lock();

        let Some(slot) = regs.get_mut(&reg) else {
            return Err(RegisterFault::Unimplemented(reg));
        };

        if self.models.contains_key(&reg) {
            *slot = value & self.mask;
            if let Some(late) = self.late.get(cpu) {
                late.lock().remove(&reg);
            }
        } else {
            *slot = value;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn armed(family: Family, control: u32, value: u64, counter: u32, start: u64) -> SimulatedPmu {
        let backend = select(family);
        let pmu = SimulatedPmu::new(backend.as_ref(), 2);
        pmu.write(0, RegisterId(control), value).unwrap();
        pmu.write(0, RegisterId(counter), start).unwrap();
        pmu
    }

    #[test]
    fn unimplemented_and_poisoned() {
        let pmu = SimulatedPmu::new(select(Family::P6).as_ref(), 1);
        assert_eq!(
            pmu.read(0, RegisterId(0x300)),
            Err(RegisterFault::Unimplemented(RegisterId(0x300)))
        );
        assert_eq!(pmu.read(4, RegisterId(0xc1)), Err(RegisterFault::NoSuchCpu(4)));

        assert!(pmu.probe(0, RegisterId(0xc1)).is_ok());
        pmu.poison(RegisterId(0xc1));
        assert!(pmu.probe(0, RegisterId(0xc1)).is_err());
    }

    #[test]
    fn disabled_counter_does_not_count() {
        let pmu = armed(Family::P6, 0x186, 0x1300c0, 0xc1, 5);
        assert!(!pmu.tick(0, RegisterId(0xc1)).unwrap());
        assert_eq!(pmu.read(0, RegisterId(0xc1)).unwrap(), 5);
    }

    #[test]
    fn p6_interrupts_on_wrap() {
        let mask = width_mask(40);
        let pmu = armed(Family::P6, 0x186, 0x5300c0, 0xc1, mask - 2);
        assert_eq!(pmu.advance(0, RegisterId(0xc1), 10).unwrap(), (3, true));
        assert_eq!(pmu.read(0, RegisterId(0xc1)).unwrap(), 0);
    }

    #[test]
    fn pentium4_interrupts_one_event_late() {
        let mask = width_mask(40);
        let pmu = armed(Family::Pentium4, 0x360, 1 << 12, 0x300, mask);

        // lands on zero: flagged but silent
        assert!(!pmu.tick(0, RegisterId(0x300)).unwrap());
        assert_ne!(pmu.read(0, RegisterId(0x360)).unwrap() & (1 << 31), 0);

        assert!(pmu.tick(0, RegisterId(0x300)).unwrap());
        assert_eq!(pmu.read(0, RegisterId(0x300)).unwrap(), 1);
    }

    #[test]
    fn pentium4_force_overflow() {
        let pmu = armed(Family::Pentium4, 0x360, 1 << 12 | 1 << 25, 0x300, 0);
        assert!(pmu.tick(0, RegisterId(0x300)).unwrap());
        assert_ne!(pmu.read(0, RegisterId(0x360)).unwrap() & (1 << 31), 0);
    }

    #[test]
    fn pentium4_shared_registers_per_package() {
        let pmu = SimulatedPmu::new(select(Family::Pentium4).as_ref(), 4);
        pmu.write(0, RegisterId(0x3a0), 7).unwrap();
        assert_eq!(pmu.read(1, RegisterId(0x3a0)).unwrap(), 7);
        assert_eq!(pmu.read(2, RegisterId(0x3a0)).unwrap(), 0);
        // counters stay private
        pmu.write(0, RegisterId(0x300), 7).unwrap();
        assert_eq!(pmu.read(1, RegisterId(0x300)).unwrap(), 0);
    }

    #[test]
    fn itanium_freeze_gates_counting() {
        let pmu = SimulatedPmu::new(select(Family::Itanium).as_ref(), 1);
        let status = RegisterId(0x1000);
        let counter = RegisterId(0x2005);

        pmu.write(0, status, 1).unwrap();
        pmu.write(0, counter, width_mask(47)).unwrap();
        assert!(!pmu.tick(0, counter).unwrap());

        pmu.write(0, status, 0).unwrap();
        assert!(pmu.tick(0, counter).unwrap());
        assert_eq!(pmu.read(0, status).unwrap(), 1 << 5);
    }
}
