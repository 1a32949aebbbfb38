use super::*;

const PMC_BASE: u32 = 0x1000;
const PMD_BASE: u32 = 0x2000;
const PMV: u32 = 0x3000;
const PMV_TARGET: u32 = 0x3001;

const fn pmc(n: u32) -> RegisterId {
    RegisterId(PMC_BASE + n)
}

const fn pmd(n: u32) -> RegisterId {
    RegisterId(PMD_BASE + n)
}

/// PMC0: freeze bit and per-counter overflow bits.
const STATUS: RegisterId = pmc(0);
const FREEZE: u64 = 1;
const OVERFLOW_SHIFT: u32 = 4;
const OVERFLOW_MASK: u64 = 0xf << OVERFLOW_SHIFT;

const COUNTERS: std::ops::RangeInclusive<u32> = 4..=7;
const GLOBALS: [u32; 3] = [10, 11, 12];

const BTB: [(RegisterId, RegisterId); 4] = [
    (pmd(8), pmd(9)),
    (pmd(10), pmd(11)),
    (pmd(12), pmd(13)),
    (pmd(14), pmd(15)),
];

const ADDRESS: AddressRegisters = AddressRegisters {
    instruction: pmd(17),
    data: pmd(2),
    latency: pmd(3),
};

/// Four 47-bit counters stopped and started together by the freeze bit in
/// PMC0, which also holds the overflow status.
pub struct Itanium {
    _private: (),
}

impl NonBlocking for Itanium {}

impl Itanium {
    pub fn new() -> Self {
        Self { _private: () }
    }
}

impl Default for Itanium {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareBackend for Itanium {
    fn family(&self) -> Family {
        Family::Itanium
    }

    fn counter_width(&self) -> u32 {
        47
    }

    fn classify(&self, reg: RegisterId) -> Option<RegisterRole> {
        match reg.0 {
            r if r >= PMD_BASE && COUNTERS.contains(&(r - PMD_BASE)) => Some(RegisterRole::Counter),
            r if r >= PMC_BASE && COUNTERS.contains(&(r - PMC_BASE)) => Some(RegisterRole::Control),
            r if r >= PMC_BASE && GLOBALS.contains(&(r - PMC_BASE)) => Some(RegisterRole::Global),
            _ => None,
        }
    }

    fn capabilities(&self) -> Capture {
        Capture::ADDRESS | Capture::BRANCH
    }

    fn counter_model(&self, counter: RegisterId) -> Option<CounterModel> {
        let n = counter.0.checked_sub(PMD_BASE).filter(|n| COUNTERS.contains(n))?;

        Some(CounterModel {
            control: pmc(n),
            enable: Enable::Unfrozen {
                register: STATUS,
                bit: 0,
            },
            overflow: OverflowFlag::StatusBit {
                register: STATUS,
                bit: n,
            },
            force_bit: None,
            interrupt_at_zero: true,
        })
    }

    fn implemented(&self) -> Vec<RegisterId> {
        let mut regs = vec![STATUS];

        regs.extend(COUNTERS.flat_map(|n| [pmc(n), pmd(n)]));
        regs.extend(GLOBALS.iter().map(|n| pmc(*n)));
        regs.extend([ADDRESS.instruction, ADDRESS.data, ADDRESS.latency]);

        for (from, to) in BTB {
            regs.push(from);
            regs.push(to);
        }

        regs.extend(route_registers(self.interrupt_route()));
        regs
    }

    fn freeze(
        &self,
        regs: &dyn RegisterFile,
        cpu: usize,
        _set: &RegisterSet,
    ) -> Result<(), RegisterFault> {
        let status = regs.read(cpu, STATUS)?;
        regs.write(cpu, STATUS, status | FREEZE)
    }

    fn unfreeze(
        &self,
        regs: &dyn RegisterFile,
        cpu: usize,
        _set: &RegisterSet,
    ) -> Result<(), RegisterFault> {
        let status = regs.read(cpu, STATUS)?;
        regs.write(cpu, STATUS, status & !FREEZE)
    }

    fn clear_overflow(
        &self,
        regs: &dyn RegisterFile,
        cpu: usize,
        _set: &RegisterSet,
    ) -> Result<(), RegisterFault> {
        let status = regs.read(cpu, STATUS)?;
        regs.write(cpu, STATUS, status & !OVERFLOW_MASK)
    }

    fn check_overflow(
        &self,
        regs: &dyn RegisterFile,
        cpu: usize,
        set: &RegisterSet,
    ) -> Result<Overflow, RegisterFault> {
        let status = regs.read(cpu, STATUS)?;
        let mut overflow = Overflow::default();

        for (bit, counter) in set.counters().enumerate() {
            let Some(n) = counter.id.0.checked_sub(PMD_BASE) else {
                continue;
            };

            if status & (1 << n) != 0 || counter.take_forced(cpu) {
                overflow.bitmap |= 1 << bit;
            }
        }

        if status & OVERFLOW_MASK != 0 {
            regs.write(cpu, STATUS, status & !OVERFLOW_MASK)?;
        }

        Ok(overflow)
    }

    fn address_registers(&self) -> Option<AddressRegisters> {
        Some(ADDRESS)
    }

    fn address_ip(&self, capture: &AddressCapture) -> Option<u64> {
        // bundle address, the low bits select the slot
        (capture.instruction != 0).then_some(capture.instruction & !0xf)
    }

    fn branch_registers(&self) -> &[(RegisterId, RegisterId)] {
        &BTB
    }

    fn interrupt_route(&self) -> InterruptRoute {
        InterruptRoute {
            lvt: RegisterId(PMV),
            lvt_value: PMI_VECTOR,
            vector_target: RegisterId(PMV_TARGET),
        }
    }
}
