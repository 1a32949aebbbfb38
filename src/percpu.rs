//! State owned by each logical CPU.

use crate::backend::SavedRoute;
use crate::topology::LogicalCpu;
use crate::wake::NonBlocking;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// Counting, the next overflow interrupt will be handled.
    Armed,
    Handling,
    /// Counters left frozen until the consumer resumes sampling.
    Suspended,
    /// No session is running on this CPU.
    Disabled,
}

/// Where precise-event hardware deposits the exact instruction pointer of
/// the most recent sampled event.
#[derive(Debug, Default)]
pub struct PreciseArea {
    ip: AtomicU64,
    valid: AtomicBool,
}

impl NonBlocking for PreciseArea {}

impl PreciseArea {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self, ip: u64) {
        self.ip.store(ip, Ordering::Relaxed);
        self.valid.store(true, Ordering::Release);
    }

    /// The posted address, consumed.
    pub fn take(&self) -> Option<u64> {
        self.valid
            .swap(false, Ordering::AcqRel)
            .then(|| self.ip.load(Ordering::Relaxed))
    }
}

#[derive(Debug)]
pub struct CpuLocal {
    pub handler: HandlerState,
    pub saved_route: Option<SavedRoute>,
    pub precise: Option<Arc<PreciseArea>>,
    /// Joined the package shared-register save this session.
    pub joined: bool,
}

pub struct CpuState {
    cpu: LogicalCpu,
    start_all: AtomicBool,
    local: spin::Mutex<CpuLocal>,
}

impl NonBlocking for CpuState {}

impl CpuState {
    pub fn new(cpu: LogicalCpu) -> Self {
        Self {
            cpu,
            start_all: AtomicBool::new(false),
            local: spin::Mutex::new(CpuLocal {
                handler: HandlerState::Disabled,
                saved_route: None,
                precise: None,
                joined: false,
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.cpu.id
    }

    pub fn package(&self) -> usize {
        self.cpu.package
    }

    pub fn thread(&self) -> usize {
        self.cpu.thread
    }

    /// Held for the whole of an interrupt, which serializes interrupts on
    /// this CPU with each other and with fan-out work targeting it.
    pub fn lock(&self) -> spin::MutexGuard<'_, CpuLocal> {
        self.local.lock()
    }

    pub fn handler_state(&self) -> HandlerState {
        self.local.lock().handler
    }

    /// The next re-arm on this CPU reprograms every register.
    pub fn request_start_all(&self) {
        self.start_all.store(true, Ordering::Release);
    }

    pub fn take_start_all(&self) -> bool {
        self.start_all.swap(false, Ordering::AcqRel)
    }

    pub fn precise_area(&self) -> Option<Arc<PreciseArea>> {
        self.local.lock().precise.clone()
    }
}
