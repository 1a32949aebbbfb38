//! Counter-overflow interrupt handler.
//!
//! Everything reachable from here is [`NonBlocking`]: register access, the
//! sample arena, the package coordinator, per-CPU state behind a spin lock
//! and the interrupt side of the consumer doorbell.

use crate::backend::{HardwareBackend, Overflow, RegisterFault, RegisterFile};
use crate::buffer::SampleArena;
use crate::params::Capture;
use crate::percpu::{CpuLocal, CpuState, HandlerState};
use crate::registers::{PackageCoordinator, Programmer, RegisterSet, SessionConfig};
use crate::sample::{
    set_event_index, AddressCapture, BranchEntry, InterruptFrame, SampleRecord, BRANCH_ENTRIES,
    MAX_RECORD_LEN,
};
use crate::session::HandlerStats;
use crate::wake::{NonBlocking, Waker};

use std::sync::atomic::{AtomicU32, Ordering};

/// Collaborators of the interrupt path.
pub struct InterruptPath<'a> {
    backend: &'a dyn HardwareBackend,
    regs: &'a dyn RegisterFile,
    packages: &'a PackageCoordinator,
    arena: &'a SampleArena,
    waker: Waker<'a>,
    cpus: &'a [CpuState],
    stats: &'a HandlerStats,
    paused: &'a AtomicU32,
}

impl NonBlocking for InterruptPath<'_> {}

const fn non_blocking<T: NonBlocking + ?Sized>() {}

const _: () = {
    non_blocking::<dyn HardwareBackend>();
    non_blocking::<dyn RegisterFile>();
    non_blocking::<PackageCoordinator>();
    non_blocking::<SampleArena>();
    non_blocking::<Waker<'static>>();
    non_blocking::<CpuState>();
    non_blocking::<HandlerStats>();
};

/// Extensions read from hardware at most once per interrupt.
#[derive(Default)]
struct Extensions {
    address: Option<Option<AddressCapture>>,
    branches: Option<Option<[BranchEntry; BRANCH_ENTRIES]>>,
}

impl<'a> InterruptPath<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: &'a dyn HardwareBackend,
        regs: &'a dyn RegisterFile,
        packages: &'a PackageCoordinator,
        arena: &'a SampleArena,
        waker: Waker<'a>,
        cpus: &'a [CpuState],
        stats: &'a HandlerStats,
        paused: &'a AtomicU32,
    ) -> Self {
        Self {
            backend,
            regs,
            packages,
            arena,
            waker,
            cpus,
            stats,
            paused,
        }
    }

    fn programmer(&self) -> Programmer<'a> {
        Programmer::new(self.backend, self.regs, self.packages)
    }

    /// Handle one overflow interrupt on `cpu`.
    pub fn handle_overflow(&self, config: &SessionConfig, cpu: usize, frame: &InterruptFrame) {
        self.stats.interrupts.increment();

        let Some(state) = self.cpus.get(cpu) else {
            self.stats.dropped.increment();
            self.unmask(cpu);
            return;
        };

        let mut local = state.lock();

        if local.handler != HandlerState::Armed {
            self.stats.skipped.increment();
            self.unmask(cpu);
            return;
        }

        local.handler = HandlerState::Handling;

        let set = config.tables.set_for(state.thread());

        local.handler = match self.overflow(config, state, &mut local, set, frame) {
            Ok(next) => next,
            Err(_) => {
                self.stats.anomalies.increment();
                HandlerState::Armed
            }
        };

        self.unmask(cpu);
    }

    fn overflow(
        &self,
        config: &SessionConfig,
        state: &CpuState,
        local: &mut CpuLocal,
        set: &RegisterSet,
        frame: &InterruptFrame,
    ) -> Result<HandlerState, RegisterFault> {
        let cpu = state.id();

        self.backend.freeze(self.regs, cpu, set)?;

        let overflow = self.backend.check_overflow(self.regs, cpu, set)?;
        self.stats
            .deferred
            .add(overflow.deferred.count_ones() as u64);

        for bit in overflow.bits() {
            if let Some(counter) = set.counter(bit) {
                counter.set_overflowed(cpu, true);
                counter.add_total(cpu, counter.sample_after);
            }
        }

        if self.paused.load(Ordering::Acquire) > 0 {
            self.stats
                .skipped
                .add(overflow.bitmap.count_ones() as u64);
        } else if !overflow.is_empty() {
            self.record(config, cpu, local, set, overflow, frame);
        }

        if !self.arena.is_active() && !overflow.is_empty() {
            // leave the counters frozen until the consumer resumes sampling
            return Ok(HandlerState::Suspended);
        }

        self.rearm(state, local, set, overflow)?;

        Ok(HandlerState::Armed)
    }

    fn rearm(
        &self,
        state: &CpuState,
        local: &mut CpuLocal,
        set: &RegisterSet,
        overflow: Overflow,
    ) -> Result<(), RegisterFault> {
        let programmer = self.programmer();

        if state.take_start_all() {
            programmer.apply(state.id(), state.package(), set, &mut local.joined)
        } else {
            programmer.rearm(state.id(), set, overflow)
        }
    }

    fn record(
        &self,
        config: &SessionConfig,
        cpu: usize,
        local: &CpuLocal,
        set: &RegisterSet,
        overflow: Overflow,
        frame: &InterruptFrame,
    ) {
        let layout = config.layout;
        let len = layout.len();

        let mut first = [0u8; MAX_RECORD_LEN];
        let mut first_capture: Option<Capture> = None;
        let mut base: Option<SampleRecord> = None;
        let mut extensions = Extensions::default();

        for bit in overflow.bits() {
            let Some(counter) = set.counter(bit) else {
                continue;
            };

            let acquired = self.arena.acquire(len);

            if acquired.wake {
                self.waker.ring();
            }

            let Some(slot) = acquired.slot else {
                self.stats.lost.increment();
                break;
            };

            match first_capture {
                Some(capture) if capture == counter.capture => {
                    let mut copy = [0u8; MAX_RECORD_LEN];
                    copy[..len].copy_from_slice(&first[..len]);
                    set_event_index(&mut copy[..len], counter.event_index);
                    self.arena.commit(slot, &copy[..len]);
                }
                _ => {
                    let base = base.get_or_insert_with(|| {
                        self.stats.captures.increment();
                        self.capture(config, cpu, frame)
                    });

                    let mut record = base.clone();
                    record.event_index = counter.event_index;
                    self.extend(&mut record, counter.capture, cpu, local, &mut extensions);

                    let mut buf = [0u8; MAX_RECORD_LEN];
                    record.encode_into(layout, &mut buf[..len]);
                    self.arena.commit(slot, &buf[..len]);

                    if first_capture.is_none() {
                        first = buf;
                        first_capture = Some(counter.capture);
                    }
                }
            }
        }
    }

    /// Full context capture.
    fn capture(&self, config: &SessionConfig, cpu: usize, frame: &InterruptFrame) -> SampleRecord {
        let mut record = self.backend.build_sample(frame, cpu as u16);

        if config.layout.timestamp {
            record.timestamp = Some(frame.timestamp);
        }

        record
    }

    /// Append the extensions `capture` asks for. A more exact instruction
    /// pointer replaces the one from the interrupt frame.
    fn extend(
        &self,
        record: &mut SampleRecord,
        capture: Capture,
        cpu: usize,
        local: &CpuLocal,
        extensions: &mut Extensions,
    ) {
        if capture.contains(Capture::PRECISE) {
            match local.precise.as_ref().and_then(|area| area.take()) {
                Some(ip) => {
                    record.ip = ip;
                    record.precise = true;
                }
                None => {
                    self.stats.precise_errors.increment();
                }
            }
        }

        if capture.contains(Capture::ADDRESS) {
            let address = *extensions
                .address
                .get_or_insert_with(|| self.read_address(cpu));

            if let Some(address) = address {
                if let Some(ip) = self.backend.address_ip(&address) {
                    record.ip = ip;
                    record.precise = true;
                }
                record.address = Some(address);
            }
        }

        if capture.contains(Capture::BRANCH) {
            let branches = *extensions
                .branches
                .get_or_insert_with(|| self.read_branches(cpu));

            record.branches = branches;
        }
    }

    fn read_address(&self, cpu: usize) -> Option<AddressCapture> {
        let regs = self.backend.address_registers()?;

        let read = || -> Result<AddressCapture, RegisterFault> {
            Ok(AddressCapture {
                instruction: self.regs.read(cpu, regs.instruction)?,
                data: self.regs.read(cpu, regs.data)?,
                latency: self.regs.read(cpu, regs.latency)?,
            })
        };

        match read() {
            Ok(address) => Some(address),
            Err(_) => {
                self.stats.anomalies.increment();
                None
            }
        }
    }

    fn read_branches(&self, cpu: usize) -> Option<[BranchEntry; BRANCH_ENTRIES]> {
        let pairs = self.backend.branch_registers();

        if pairs.is_empty() {
            return None;
        }

        let mut branches = [BranchEntry::default(); BRANCH_ENTRIES];

        for (entry, (from, to)) in branches.iter_mut().zip(pairs) {
            match (self.regs.read(cpu, *from), self.regs.read(cpu, *to)) {
                (Ok(from), Ok(to)) => *entry = BranchEntry { from, to },
                _ => {
                    self.stats.anomalies.increment();
                    return None;
                }
            }
        }

        Some(branches)
    }

    /// Time-based sample for the session's timer pseudo-event.
    pub fn handle_timer_tick(&self, config: &SessionConfig, cpu: usize, frame: &InterruptFrame) {
        let Some(timer) = config.timer else {
            return;
        };

        self.stats.timer_ticks.increment();

        let Some(state) = self.cpus.get(cpu) else {
            self.stats.dropped.increment();
            return;
        };

        let mut local = state.lock();

        if local.handler != HandlerState::Armed || self.paused.load(Ordering::Acquire) > 0 {
            self.stats.skipped.increment();
            return;
        }

        let len = config.layout.len();
        let acquired = self.arena.acquire(len);

        if acquired.wake {
            self.waker.ring();
        }

        match acquired.slot {
            Some(slot) => {
                self.stats.captures.increment();
                let mut record = self.capture(config, cpu, frame);
                record.event_index = timer.event_index;

                let mut buf = [0u8; MAX_RECORD_LEN];
                record.encode_into(config.layout, &mut buf[..len]);
                self.arena.commit(slot, &buf[..len]);
            }
            None => {
                self.stats.lost.increment();
            }
        }

        if !self.arena.is_active() {
            self.backend
                .freeze(self.regs, cpu, config.tables.set_for(state.thread()))
                .unwrap_or_else(|_| {
                    self.stats.anomalies.increment();
                });
            local.handler = HandlerState::Suspended;
        }
    }

    /// Acknowledge the interrupt. A CPU outside the topology has no
    /// registers of its own, so failing to reach them is not an anomaly.
    fn unmask(&self, cpu: usize) {
        match self.backend.unmask_interrupt(self.regs, cpu) {
            Ok(()) | Err(RegisterFault::NoSuchCpu(_)) => {}
            Err(_) => {
                self.stats.anomalies.increment();
            }
        }
    }
}
