//! Processor-family backends.
//!
//! A backend knows one family's register namespace and how that family
//! freezes counters, reports overflow and exposes extra capture registers.
//! The variant is picked once by [`select`]; nothing on the interrupt path
//! branches on the family after that.

use crate::params::Capture;
use crate::registers::RegisterSet;
use crate::sample::{AddressCapture, InterruptFrame, SampleRecord};
use crate::wake::NonBlocking;

use serde::{Deserialize, Serialize};

use core::fmt;

mod itanium;
mod p6;
mod pentium4;
pub mod sim;

pub use itanium::Itanium;
pub use p6::P6;
pub use pentium4::Pentium4;

/// Vector the performance-monitor interrupt is routed to.
pub const PMI_VECTOR: u64 = 0xee;

/// Token written to the vector target while a session owns the interrupt.
pub const HANDLER_TOKEN: u64 = 0x4542_5348;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegisterId(pub u32);

impl fmt::Display for RegisterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterRole {
    /// Chooses the event a counter observes.
    Control,
    /// Counts events and overflows.
    Counter,
    /// Architecture-wide register, possibly shared by sibling threads.
    Global,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegisterFault {
    #[error("register {0} is not implemented")]
    Unimplemented(RegisterId),
    #[error("register {0} did not hold its value")]
    Unstable(RegisterId),
    #[error("logical cpu {0} is out of range")]
    NoSuchCpu(usize),
}

/// Raw access to a logical CPU's registers.
pub trait RegisterFile: NonBlocking + Send + Sync {
    fn read(&self, cpu: usize, reg: RegisterId) -> Result<u64, RegisterFault>;
    fn write(&self, cpu: usize, reg: RegisterId, value: u64) -> Result<(), RegisterFault>;

    /// Read-modify-restore check that `reg` is implemented and stable.
    fn probe(&self, cpu: usize, reg: RegisterId) -> Result<(), RegisterFault> {
        let original = self.read(cpu, reg)?;
        self.write(cpu, reg, original)?;
        let readback = self.read(cpu, reg)?;
        self.write(cpu, reg, original)?;

        if readback != original {
            return Err(RegisterFault::Unstable(reg));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    P6,
    Pentium4,
    Itanium,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::P6 => f.write_str("p6"),
            Self::Pentium4 => f.write_str("pentium4"),
            Self::Itanium => f.write_str("itanium"),
        }
    }
}

/// What to do with a counter that is flagged overflowed but still reads
/// exactly zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroOverflowPolicy {
    /// Record it like any other overflow.
    Sample,
    /// The interrupt for it has not been raised yet; force an overflow on
    /// the next event and record it then.
    DeferToNextEvent,
}

/// Result of an overflow check, bit `n` is the `n`th counter of the set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Overflow {
    pub bitmap: u64,
    pub deferred: u64,
}

impl Overflow {
    /// Set bits, lowest counter first.
    pub fn bits(&self) -> impl Iterator<Item = usize> {
        let bitmap = self.bitmap;
        (0..64).filter(move |bit| bitmap & (1u64 << *bit) != 0)
    }

    pub fn is_empty(&self) -> bool {
        self.bitmap == 0
    }
}

/// Where the performance-monitor interrupt is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptRoute {
    pub lvt: RegisterId,
    pub lvt_value: u64,
    pub vector_target: RegisterId,
}

/// Values the route registers held before a session took them over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedRoute {
    pub lvt: u64,
    pub vector_target: u64,
}

/// Event address registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRegisters {
    pub instruction: RegisterId,
    pub data: RegisterId,
    pub latency: RegisterId,
}

/// How a counter is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enable {
    /// A bit in the paired control register.
    ControlBit(u32),
    /// Counting whenever a global freeze bit is clear.
    Unfrozen { register: RegisterId, bit: u32 },
}

/// Where a counter's overflow is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowFlag {
    /// Nothing records it; software infers it from the value.
    Inferred,
    ControlBit(u32),
    StatusBit { register: RegisterId, bit: u32 },
}

/// Description of one counter, used to emulate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterModel {
    pub control: RegisterId,
    pub enable: Enable,
    pub overflow: OverflowFlag,
    pub force_bit: Option<u32>,
    /// The interrupt fires on the wrap to zero rather than one event later.
    pub interrupt_at_zero: bool,
}

pub trait HardwareBackend: NonBlocking + Send + Sync {
    fn family(&self) -> Family;

    fn counter_width(&self) -> u32;

    fn counter_mask(&self) -> u64 {
        width_mask(self.counter_width())
    }

    /// Number of register sets, one per hardware thread of a core.
    fn threads(&self) -> usize {
        1
    }

    fn classify(&self, reg: RegisterId) -> Option<RegisterRole>;

    fn capabilities(&self) -> Capture;

    fn counter_model(&self, counter: RegisterId) -> Option<CounterModel>;

    /// Whether `control` can drive `counter`.
    fn pairs(&self, control: RegisterId, counter: RegisterId) -> bool {
        self.counter_model(counter)
            .map(|model| model.control == control)
            .unwrap_or(false)
    }

    /// Registers physically shared by every logical CPU of a package.
    fn shared_registers(&self) -> &[RegisterId] {
        &[]
    }

    /// Every register the family implements, including internal ones.
    fn implemented(&self) -> Vec<RegisterId>;

    fn zero_policy(&self) -> ZeroOverflowPolicy {
        ZeroOverflowPolicy::Sample
    }

    /// A control value with counting disabled.
    fn quiesced(&self, control: u64) -> u64 {
        control
    }

    /// A control value that overflows on the next event.
    fn forced(&self, control: u64) -> u64 {
        control
    }

    /// Stop all counters of the set without losing overflow state.
    fn freeze(
        &self,
        regs: &dyn RegisterFile,
        cpu: usize,
        set: &RegisterSet,
    ) -> Result<(), RegisterFault> {
        for control in set.controls() {
            let current = regs.read(cpu, control.id)?;
            regs.write(cpu, control.id, self.quiesced(current))?;
        }
        Ok(())
    }

    /// Restart counting with the configured control values.
    fn unfreeze(
        &self,
        regs: &dyn RegisterFile,
        cpu: usize,
        set: &RegisterSet,
    ) -> Result<(), RegisterFault> {
        for (control, counter) in set.pairs() {
            let value = if counter.forced(cpu) {
                self.forced(control.value)
            } else {
                control.value
            };
            regs.write(cpu, control.id, value)?;
        }
        Ok(())
    }

    fn clear_overflow(
        &self,
        _regs: &dyn RegisterFile,
        _cpu: usize,
        _set: &RegisterSet,
    ) -> Result<(), RegisterFault> {
        Ok(())
    }

    /// Which counters overflowed since they were armed. Explicit status
    /// bits are cleared as they are read.
    fn check_overflow(
        &self,
        regs: &dyn RegisterFile,
        cpu: usize,
        set: &RegisterSet,
    ) -> Result<Overflow, RegisterFault>;

    /// Full context capture for the first record of an interrupt.
    fn build_sample(&self, frame: &InterruptFrame, cpu: u16) -> SampleRecord {
        SampleRecord {
            ip: frame.ip,
            flags: frame.flags,
            cs: frame.cs,
            cpu,
            pid: frame.pid,
            tid: frame.tid,
            ..Default::default()
        }
    }

    fn address_registers(&self) -> Option<AddressRegisters> {
        None
    }

    /// Instruction pointer implied by an address capture, if the family
    /// reports a more exact one there than in the interrupt frame.
    fn address_ip(&self, _capture: &AddressCapture) -> Option<u64> {
        None
    }

    /// Branch history as (from, to) register pairs, most recent first.
    fn branch_registers(&self) -> &[(RegisterId, RegisterId)] {
        &[]
    }

    fn interrupt_route(&self) -> InterruptRoute;

    fn arm_interrupt(&self, regs: &dyn RegisterFile, cpu: usize) -> Result<SavedRoute, RegisterFault> {
        let route = self.interrupt_route();
        let saved = SavedRoute {
            lvt: regs.read(cpu, route.lvt)?,
            vector_target: regs.read(cpu, route.vector_target)?,
        };

        regs.write(cpu, route.vector_target, HANDLER_TOKEN)?;
        regs.write(cpu, route.lvt, route.lvt_value)?;

        Ok(saved)
    }

    /// Delivery masks the local vector; this opens it again.
    fn unmask_interrupt(&self, regs: &dyn RegisterFile, cpu: usize) -> Result<(), RegisterFault> {
        let route = self.interrupt_route();
        regs.write(cpu, route.lvt, route.lvt_value)
    }

    fn restore_interrupt(
        &self,
        regs: &dyn RegisterFile,
        cpu: usize,
        saved: SavedRoute,
    ) -> Result<(), RegisterFault> {
        let route = self.interrupt_route();
        regs.write(cpu, route.lvt, saved.lvt)?;
        regs.write(cpu, route.vector_target, saved.vector_target)
    }
}

pub fn width_mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

pub fn select(family: Family) -> Box<dyn HardwareBackend> {
    match family {
        Family::P6 => Box::new(P6::new()),
        Family::Pentium4 => Box::new(Pentium4::new()),
        Family::Itanium => Box::new(Itanium::new()),
    }
}

/// Map a detected processor to the backend family that drives it.
pub fn detect(cpu: &systeminfo::Cpu) -> Option<Family> {
    if cpu.is_ia64() {
        return Some(Family::Itanium);
    }

    match cpu.family()? {
        6 => Some(Family::P6),
        15 => Some(Family::Pentium4),
        _ => None,
    }
}

/// Both registers of a route, for register namespaces.
pub(crate) fn route_registers(route: InterruptRoute) -> [RegisterId; 2] {
    [route.lvt, route.vector_target]
}

/// x86 route shared by the P6 and Pentium 4 backends.
pub(crate) fn apic_route() -> InterruptRoute {
    InterruptRoute {
        lvt: RegisterId(0x834),
        lvt_value: PMI_VECTOR,
        vector_target: RegisterId(0x1_0000 + PMI_VECTOR as u32),
    }
}
