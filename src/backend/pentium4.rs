use super::*;

const CCCR_BASE: u32 = 0x360;
const COUNTER_BASE: u32 = 0x300;
const COUNTERS: u32 = 18;

const ESCR_FIRST: u32 = 0x3a0;
const ESCR_LAST: u32 = 0x3e1;
const PEBS_ENABLE: u32 = 0x3f1;
const PEBS_MATRIX_VERT: u32 = 0x3f2;

// CCCR bits
const ENABLE: u32 = 12;
const FORCE_OVF: u32 = 25;
const OVF_PMI_T0: u32 = 26;
const OVF_PMI_T1: u32 = 27;
const OVF: u64 = 1 << 31;

const LBR_FROM: u32 = 0x680;
const LBR_TO: u32 = 0x6c0;

const LBR: [(RegisterId, RegisterId); 4] = [
    (RegisterId(LBR_FROM), RegisterId(LBR_TO)),
    (RegisterId(LBR_FROM + 1), RegisterId(LBR_TO + 1)),
    (RegisterId(LBR_FROM + 2), RegisterId(LBR_TO + 2)),
    (RegisterId(LBR_FROM + 3), RegisterId(LBR_TO + 3)),
];

/// Eighteen 40-bit counters, each with a CCCR, selecting events through
/// ESCRs that both hardware threads of a package share.
///
/// A counter's OVF bit may be set while the counter still reads zero; the
/// interrupt for it only arrives with the next event. Such counters are
/// not sampled yet but forced to overflow on their next event instead.
pub struct Pentium4 {
    shared: Vec<RegisterId>,
    zero_policy: ZeroOverflowPolicy,
}

impl NonBlocking for Pentium4 {}

impl Pentium4 {
    pub fn new() -> Self {
        let shared = (ESCR_FIRST..=ESCR_LAST)
            .chain([PEBS_ENABLE, PEBS_MATRIX_VERT])
            .map(RegisterId)
            .collect();

        Self {
            shared,
            zero_policy: ZeroOverflowPolicy::DeferToNextEvent,
        }
    }

    /// Replace the handling of counters that overflowed but read zero.
    pub fn with_zero_policy(mut self, policy: ZeroOverflowPolicy) -> Self {
        self.zero_policy = policy;
        self
    }

    /// CCCR bits routing the overflow interrupt to one thread.
    pub fn pmi_bit(thread: usize) -> u64 {
        if thread == 0 {
            1 << OVF_PMI_T0
        } else {
            1 << OVF_PMI_T1
        }
    }
}

impl Default for Pentium4 {
    fn default() -> Self {
        Self::new()
    }
}

fn index(reg: RegisterId, base: u32) -> Option<u32> {
    reg.0
        .checked_sub(base)
        .filter(|i| *i < COUNTERS)
}

impl HardwareBackend for Pentium4 {
    fn family(&self) -> Family {
        Family::Pentium4
    }

    fn counter_width(&self) -> u32 {
        40
    }

    fn threads(&self) -> usize {
        2
    }

    fn classify(&self, reg: RegisterId) -> Option<RegisterRole> {
        if index(reg, CCCR_BASE).is_some() {
            Some(RegisterRole::Control)
        } else if index(reg, COUNTER_BASE).is_some() {
            Some(RegisterRole::Counter)
        } else if self.shared.contains(&reg) {
            Some(RegisterRole::Global)
        } else {
            None
        }
    }

    fn capabilities(&self) -> Capture {
        Capture::PRECISE | Capture::BRANCH
    }

    fn counter_model(&self, counter: RegisterId) -> Option<CounterModel> {
        let i = index(counter, COUNTER_BASE)?;

        Some(CounterModel {
            control: RegisterId(CCCR_BASE + i),
            enable: Enable::ControlBit(ENABLE),
            overflow: OverflowFlag::ControlBit(31),
            force_bit: Some(FORCE_OVF),
            interrupt_at_zero: false,
        })
    }

    fn shared_registers(&self) -> &[RegisterId] {
        &self.shared
    }

    fn implemented(&self) -> Vec<RegisterId> {
        let mut regs: Vec<RegisterId> = (0..COUNTERS)
            .flat_map(|i| [RegisterId(CCCR_BASE + i), RegisterId(COUNTER_BASE + i)])
            .collect();

        regs.extend(self.shared.iter().copied());

        for (from, to) in LBR {
            regs.push(from);
            regs.push(to);
        }

        regs.extend(route_registers(self.interrupt_route()));
        regs
    }

    fn zero_policy(&self) -> ZeroOverflowPolicy {
        self.zero_policy
    }

    fn quiesced(&self, control: u64) -> u64 {
        control & !(1 << ENABLE)
    }

    fn forced(&self, control: u64) -> u64 {
        control | 1 << FORCE_OVF
    }

    fn clear_overflow(
        &self,
        regs: &dyn RegisterFile,
        cpu: usize,
        set: &RegisterSet,
    ) -> Result<(), RegisterFault> {
        for control in set.controls() {
            let cccr = regs.read(cpu, control.id)?;
            if cccr & OVF != 0 {
                regs.write(cpu, control.id, cccr & !OVF)?;
            }
        }
        Ok(())
    }

    fn check_overflow(
        &self,
        regs: &dyn RegisterFile,
        cpu: usize,
        set: &RegisterSet,
    ) -> Result<Overflow, RegisterFault> {
        let mut overflow = Overflow::default();

        for (bit, (control, counter)) in set.pairs().enumerate() {
            let cccr = regs.read(cpu, control.id)?;

            if cccr & OVF == 0 {
                continue;
            }

            regs.write(cpu, control.id, cccr & !OVF)?;

            let defer = self.zero_policy == ZeroOverflowPolicy::DeferToNextEvent;

            if defer && regs.read(cpu, counter.id)? == 0 {
                counter.set_forced(cpu, true);
                overflow.deferred |= 1 << bit;
            } else {
                counter.set_forced(cpu, false);
                overflow.bitmap |= 1 << bit;
            }
        }

        Ok(overflow)
    }

    fn branch_registers(&self) -> &[(RegisterId, RegisterId)] {
        &LBR
    }

    fn interrupt_route(&self) -> InterruptRoute {
        apic_route()
    }
}
