use super::*;

const EVTSEL: [u32; 2] = [0x186, 0x187];
const PERFCTR: [u32; 2] = [0xc1, 0xc2];
const DEBUGCTL: u32 = 0x1d9;
const ENABLE: u32 = 22;

const LBR: [(RegisterId, RegisterId); 2] = [
    (RegisterId(0x1db), RegisterId(0x1dc)),
    (RegisterId(0x1dd), RegisterId(0x1de)),
];

/// Two 40-bit counters, each enabled by its own event select. Nothing
/// flags an overflow, so it is inferred from the counter having wrapped
/// below its start value.
pub struct P6 {
    zero_policy: ZeroOverflowPolicy,
}

impl NonBlocking for P6 {}

impl P6 {
    pub fn new() -> Self {
        Self {
            zero_policy: ZeroOverflowPolicy::Sample,
        }
    }

    /// Replace the handling of counters that wrapped but still read zero.
    pub fn with_zero_policy(mut self, policy: ZeroOverflowPolicy) -> Self {
        self.zero_policy = policy;
        self
    }
}

impl Default for P6 {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareBackend for P6 {
    fn family(&self) -> Family {
        Family::P6
    }

    fn counter_width(&self) -> u32 {
        40
    }

    fn classify(&self, reg: RegisterId) -> Option<RegisterRole> {
        if EVTSEL.contains(&reg.0) {
            Some(RegisterRole::Control)
        } else if PERFCTR.contains(&reg.0) {
            Some(RegisterRole::Counter)
        } else if reg.0 == DEBUGCTL {
            Some(RegisterRole::Global)
        } else {
            None
        }
    }

    fn capabilities(&self) -> Capture {
        Capture::BRANCH
    }

    fn counter_model(&self, counter: RegisterId) -> Option<CounterModel> {
        let index = PERFCTR.iter().position(|c| *c == counter.0)?;

        Some(CounterModel {
            control: RegisterId(EVTSEL[index]),
            enable: Enable::ControlBit(ENABLE),
            overflow: OverflowFlag::Inferred,
            force_bit: None,
            interrupt_at_zero: true,
        })
    }

    fn implemented(&self) -> Vec<RegisterId> {
        let mut regs: Vec<RegisterId> = EVTSEL
            .iter()
            .chain(PERFCTR.iter())
            .chain(std::iter::once(&DEBUGCTL))
            .map(|r| RegisterId(*r))
            .collect();

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

    fn check_overflow(
        &self,
        regs: &dyn RegisterFile,
        cpu: usize,
        set: &RegisterSet,
    ) -> Result<Overflow, RegisterFault> {
        let mut overflow = Overflow::default();

        let defer = self.zero_policy == ZeroOverflowPolicy::DeferToNextEvent;

        for (bit, counter) in set.counters().enumerate() {
            let value = regs.read(cpu, counter.id)?;
            let forced = counter.take_forced(cpu);

            if value >= counter.value && !forced {
                continue;
            }

            // a deferred counter is sampled on its next check whatever it reads
            if defer && value == 0 && !forced {
                counter.set_forced(cpu, true);
                overflow.deferred |= 1 << bit;
            } else {
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
