//! Register programming.
//!
//! Turns a session's event requests into per-thread register descriptor
//! tables, and applies or restores those tables on a logical CPU.

use crate::backend::{HardwareBackend, RegisterFile, RegisterId, RegisterRole};
use crate::counters::CounterGroup;
use crate::error::{Result, SamplingError};
use crate::params::{Capture, Command, EventRequest, Method, SessionParams};
use crate::sample::{EventIdTable, RecordLayout};
use crate::{debug, warn};

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

mod package;
mod program;

pub use package::PackageCoordinator;
pub use program::Programmer;

/// Maximum number of register descriptors in one session.
pub const MAX_REGISTERS: usize = 64;

/// One register written during a session.
#[derive(Debug)]
pub struct RegisterDescriptor {
    pub id: RegisterId,
    /// Control value, raw global value, or a counter's negated start value.
    pub value: u64,
    pub role: RegisterRole,
    /// For controls, the index of the driven counter within the set.
    pub counter: Option<usize>,
    pub event_index: u16,
    /// Events between samples, counters only.
    pub sample_after: u64,
    pub capture: Capture,
    totals: CounterGroup,
    overflowed: Box<[AtomicBool]>,
    force: Box<[AtomicBool]>,
}

impl RegisterDescriptor {
    fn new(id: RegisterId, value: u64, role: RegisterRole, cpus: usize) -> Self {
        let per_cpu = if role == RegisterRole::Counter { cpus } else { 0 };

        Self {
            id,
            value,
            role,
            counter: None,
            event_index: 0,
            sample_after: 0,
            capture: Capture::empty(),
            totals: CounterGroup::new(per_cpu),
            overflowed: (0..per_cpu).map(|_| AtomicBool::new(false)).collect(),
            force: (0..per_cpu).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    /// Events counted on `cpu` across all overflows so far.
    pub fn total(&self, cpu: usize) -> u64 {
        self.totals.value(cpu).unwrap_or(0)
    }

    pub fn add_total(&self, cpu: usize, events: u64) {
        // controls carry no totals
        let _ = self.totals.add(cpu, events);
    }

    pub fn overflowed(&self, cpu: usize) -> bool {
        self.overflowed
            .get(cpu)
            .map(|f| f.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn set_overflowed(&self, cpu: usize, value: bool) {
        if let Some(flag) = self.overflowed.get(cpu) {
            flag.store(value, Ordering::Release);
        }
    }

    /// A sample is owed on the next event.
    pub fn forced(&self, cpu: usize) -> bool {
        self.force
            .get(cpu)
            .map(|f| f.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn set_forced(&self, cpu: usize, value: bool) {
        if let Some(flag) = self.force.get(cpu) {
            flag.store(value, Ordering::Release);
        }
    }

    pub fn take_forced(&self, cpu: usize) -> bool {
        self.force
            .get(cpu)
            .map(|f| f.swap(false, Ordering::AcqRel))
            .unwrap_or(false)
    }
}

/// Descriptors for one hardware thread of a core.
#[derive(Debug, Default)]
pub struct RegisterSet {
    thread: usize,
    descriptors: Vec<RegisterDescriptor>,
    /// (counter index, control index), position is the overflow bit
    counters: Vec<(usize, usize)>,
}

impl RegisterSet {
    pub fn thread(&self) -> usize {
        self.thread
    }

    pub fn descriptors(&self) -> &[RegisterDescriptor] {
        &self.descriptors
    }

    pub fn globals(&self) -> impl Iterator<Item = &RegisterDescriptor> {
        self.descriptors
            .iter()
            .filter(|d| d.role == RegisterRole::Global)
    }

    pub fn controls(&self) -> impl Iterator<Item = &RegisterDescriptor> {
        self.descriptors
            .iter()
            .filter(|d| d.role == RegisterRole::Control)
    }

    /// Counters in overflow-bit order.
    pub fn counters(&self) -> impl Iterator<Item = &RegisterDescriptor> {
        self.counters.iter().map(|(counter, _)| &self.descriptors[*counter])
    }

    pub fn counter(&self, bit: usize) -> Option<&RegisterDescriptor> {
        self.counters
            .get(bit)
            .map(|(counter, _)| &self.descriptors[*counter])
    }

    /// The control driving the counter at `bit`.
    pub fn control_of(&self, bit: usize) -> Option<&RegisterDescriptor> {
        self.counters
            .get(bit)
            .map(|(_, control)| &self.descriptors[*control])
    }

    /// (control, counter) pairs in overflow-bit order.
    pub fn pairs(&self) -> impl Iterator<Item = (&RegisterDescriptor, &RegisterDescriptor)> {
        self.counters
            .iter()
            .map(|(counter, control)| (&self.descriptors[*control], &self.descriptors[*counter]))
    }

    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// Register sets partitioned by hardware thread.
#[derive(Debug, Default)]
pub struct RegisterTables {
    sets: Vec<RegisterSet>,
}

impl RegisterTables {
    /// The set programmed on a logical CPU that is hardware thread `thread`
    /// of its core.
    pub fn set_for(&self, thread: usize) -> &RegisterSet {
        &self.sets[thread % self.sets.len()]
    }

    pub fn sets(&self) -> &[RegisterSet] {
        &self.sets
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEvent {
    pub interval: Duration,
    pub event_index: u16,
}

/// Everything a configure call produces.
#[derive(Debug)]
pub struct SessionConfig {
    pub method: Method,
    pub samples_per_buffer: usize,
    pub max_samples: Option<u64>,
    pub max_duration: Option<Duration>,
    pub start_delay: Option<Duration>,
    pub tables: RegisterTables,
    pub layout: RecordLayout,
    pub events: EventIdTable,
    pub timer: Option<TimerEvent>,
}

impl SessionConfig {
    pub fn record_len(&self) -> usize {
        self.layout.len()
    }

    pub fn buffer_len(&self) -> usize {
        self.samples_per_buffer * self.record_len()
    }
}

/// The events between samples actually used for a requested count: zero
/// means a full counter period and counts wider than the counter saturate.
pub fn effective_count(sample_after: u64, mask: u64) -> u64 {
    if sample_after == 0 {
        mask
    } else {
        sample_after.min(mask)
    }
}

/// Start value that makes a counter reach zero after `sample_after` events.
pub fn initial_count(sample_after: u64, mask: u64) -> u64 {
    effective_count(sample_after, mask).wrapping_neg() & mask
}

fn expected_role(command: Command) -> Option<RegisterRole> {
    match command {
        Command::Control => Some(RegisterRole::Control),
        Command::Counter => Some(RegisterRole::Counter),
        Command::Raw => Some(RegisterRole::Global),
        Command::TimerInterval => None,
    }
}

/// Validate `params` against the backend and build the session tables.
pub fn configure(
    backend: &dyn HardwareBackend,
    regs: &dyn RegisterFile,
    params: &SessionParams,
    cpus: usize,
) -> Result<SessionConfig> {
    params.validate()?;

    let family = backend.family();
    let threads = backend.threads();
    let mask = backend.counter_mask();
    let capabilities = backend.capabilities();

    let requests: Vec<&EventRequest> = params
        .events
        .iter()
        .filter(|e| e.command != Command::TimerInterval)
        .collect();

    if requests.len() > MAX_REGISTERS {
        return Err(SamplingError::exhausted(format!(
            "{} register requests exceed the limit of {MAX_REGISTERS}",
            requests.len()
        )));
    }

    let has_controls = requests.iter().any(|r| r.command == Command::Control);

    if params.method.contains(Method::EVENT_BASED) && !has_controls {
        return Err(SamplingError::invalid("event-based sampling without any counter"));
    }

    if !params.method.contains(Method::EVENT_BASED) && !requests.is_empty() {
        return Err(SamplingError::invalid(
            "register requests without event-based sampling",
        ));
    }

    let mut seen = BTreeSet::new();

    for request in &requests {
        if request.thread as usize >= threads {
            return Err(SamplingError::invalid(format!(
                "thread {} is out of range for {family} ({threads} per core)",
                request.thread
            )));
        }

        let role = backend.classify(request.register).ok_or_else(|| {
            SamplingError::invalid(format!(
                "register {} is outside the {family} register namespace",
                request.register
            ))
        })?;

        if Some(role) != expected_role(request.command) {
            return Err(SamplingError::invalid(format!(
                "{:?} request cannot target {:?} register {}",
                request.command, role, request.register
            )));
        }

        if !seen.insert((request.thread, request.register)) {
            return Err(SamplingError::invalid(format!(
                "register {} is programmed twice",
                request.register
            )));
        }

        if !capabilities.contains(request.capture) {
            return Err(SamplingError::unsupported(format!(
                "{family} cannot capture {:?}",
                request.capture.difference(capabilities)
            )));
        }
    }

    // every counter needs exactly one control and every control a counter
    for request in &requests {
        match request.command {
            Command::Counter => {
                let controls = requests
                    .iter()
                    .filter(|r| {
                        r.command == Command::Control
                            && r.thread == request.thread
                            && r.counter == Some(request.register)
                    })
                    .count();

                if controls != 1 {
                    return Err(SamplingError::unsupported(format!(
                        "unsupported configuration: counter {} is driven by {controls} controls",
                        request.register
                    )));
                }
            }
            Command::Control => {
                let Some(counter) = request.counter else {
                    return Err(SamplingError::unsupported(format!(
                        "unsupported configuration: control {} drives no counter",
                        request.register
                    )));
                };

                if !seen.contains(&(request.thread, counter))
                    || backend.classify(counter) != Some(RegisterRole::Counter)
                {
                    return Err(SamplingError::unsupported(format!(
                        "unsupported configuration: control {} refers to unconfigured counter {counter}",
                        request.register
                    )));
                }

                if !backend.pairs(request.register, counter) {
                    return Err(SamplingError::unsupported(format!(
                        "unsupported configuration: control {} cannot drive counter {counter}",
                        request.register
                    )));
                }
            }
            _ => {}
        }
    }

    let mut probed = BTreeSet::new();

    for request in &requests {
        if probed.insert(request.register) {
            regs.probe(0, request.register).map_err(|e| {
                SamplingError::unsupported(format!("register {} failed probe: {e}", request.register))
            })?;
        }
    }

    let mut events = EventIdTable::default();
    let mut captures = Capture::empty();
    let mut event_of = HashMap::new();

    for request in requests.iter().filter(|r| r.command == Command::Control) {
        let index = events.insert(request.event_id)?;
        event_of.insert((request.thread, request.register), index);
        captures |= request.capture;
    }

    for request in requests.iter().filter(|r| r.command == Command::Counter) {
        captures |= request.capture;
    }

    let timer = match params
        .events
        .iter()
        .find(|e| e.command == Command::TimerInterval)
    {
        Some(request) => Some(TimerEvent {
            interval: Duration::from_micros(request.value.max(1)),
            event_index: events.insert(request.event_id)?,
        }),
        None => None,
    };

    let sets = (0..threads)
        .map(|thread| build_set(thread, &requests, &event_of, mask, cpus))
        .collect();

    let layout = RecordLayout::new(params.timestamp, captures);

    debug!(
        "configured {} registers, {} events, {} byte records",
        requests.len(),
        events.len(),
        layout.len()
    );

    Ok(SessionConfig {
        method: params.method,
        samples_per_buffer: params.samples_per_buffer as usize,
        max_samples: params.max_samples,
        max_duration: params.max_duration,
        start_delay: params.start_delay,
        tables: RegisterTables { sets },
        layout,
        events,
        timer,
    })
}

fn build_set(
    thread: usize,
    requests: &[&EventRequest],
    event_of: &HashMap<(u8, RegisterId), u16>,
    mask: u64,
    cpus: usize,
) -> RegisterSet {
    let mine: Vec<&EventRequest> = requests
        .iter()
        .filter(|r| r.thread as usize == thread)
        .copied()
        .collect();

    let mut descriptors = Vec::with_capacity(mine.len());
    let mut position = HashMap::new();

    for request in &mine {
        let role = match request.command {
            Command::Control => RegisterRole::Control,
            Command::Counter => RegisterRole::Counter,
            _ => RegisterRole::Global,
        };

        let mut descriptor = if role == RegisterRole::Counter {
            if request.value > mask {
                warn!(
                    "sample-after count {} for counter {} exceeds the counter width, using {mask}",
                    request.value, request.register
                );
            }
            let mut d = RegisterDescriptor::new(
                request.register,
                initial_count(request.value, mask),
                role,
                cpus,
            );
            d.sample_after = effective_count(request.value, mask);
            d.capture = request.capture;
            d
        } else {
            RegisterDescriptor::new(request.register, request.value, role, cpus)
        };

        if role == RegisterRole::Control {
            descriptor.capture = request.capture;
            descriptor.event_index = event_of
                .get(&(request.thread, request.register))
                .copied()
                .unwrap_or(0);
        }

        position.insert(request.register, descriptors.len());
        descriptors.push(descriptor);
    }

    let mut counters = Vec::new();

    for (control, request) in mine.iter().enumerate() {
        if request.command != Command::Control {
            continue;
        }

        let Some(counter) = request.counter.and_then(|c| position.get(&c).copied()) else {
            continue;
        };

        descriptors[control].counter = Some(counter);

        let event_index = descriptors[control].event_index;
        let capture = descriptors[control].capture;
        descriptors[counter].event_index = event_index;
        descriptors[counter].capture |= capture;

        counters.push((counter, control));
    }

    RegisterSet {
        thread,
        descriptors,
        counters,
    }
}
