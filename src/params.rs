//! Session parameters and the versioned binary parameter block.
//!
//! Block layout, all little-endian:
//!
//! Header (48 bytes):
//! magic[4] + version[2] + flags[2] + method[4] + entry_count[4] +
//! block_len[4] + samples_per_buffer[4] + max_samples[8] +
//! max_duration_ms[8] + start_delay_ms[8]
//!
//! Entry (32 bytes):
//! command[4] + register[4] + value[8] + counter[4] + event_id[4] +
//! thread[1] + capture[1] + reserved[6]

use crate::error::{Result, SamplingError};
use crate::backend::RegisterId;

use bitflags::bitflags;

use std::time::Duration;

/// Magic bytes identifying a parameter block: "EBSP"
pub const MAGIC: [u8; 4] = [0x45, 0x42, 0x53, 0x50];

pub const VERSION_MAJOR: u8 = 1;
pub const VERSION_MINOR: u8 = 0;

pub const HEADER_LEN: usize = 48;
pub const ENTRY_LEN: usize = 32;

/// Marks an entry without a paired counter.
const NO_COUNTER: u32 = u32::MAX;

const FLAG_TIMESTAMP: u16 = 1;

bitflags! {
    /// Sampling methods enabled for a session.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Method: u32 {
        const TIME_BASED = 1;
        const EVENT_BASED = 2;
    }
}

bitflags! {
    /// Extra data captured alongside a sample.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Capture: u8 {
        /// Exact instruction pointer from a precise-event area.
        const PRECISE = 1;
        /// Instruction/data event address registers.
        const ADDRESS = 2;
        /// Last-branch history.
        const BRANCH = 4;
    }
}

/// What a single request asks the register layer to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Program a control/selector register driving `counter`.
    Control,
    /// Arm a counter to overflow after `value` occurrences.
    Counter,
    /// Write an architecture-global register verbatim.
    Raw,
    /// Time-based sampling every `value` microseconds.
    TimerInterval,
}

impl Command {
    fn code(self) -> u32 {
        match self {
            Self::Control => 1,
            Self::Counter => 2,
            Self::Raw => 3,
            Self::TimerInterval => 4,
        }
    }

    fn from_code(code: u32) -> Result<Self> {
        match code {
            1 => Ok(Self::Control),
            2 => Ok(Self::Counter),
            3 => Ok(Self::Raw),
            4 => Ok(Self::TimerInterval),
            _ => Err(SamplingError::invalid(format!(
                "unsupported event-register command: {code}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRequest {
    pub command: Command,
    pub register: RegisterId,
    pub value: u64,
    /// Counter driven by a `Control` request.
    pub counter: Option<RegisterId>,
    pub event_id: u32,
    /// Hardware thread (within a core) the request belongs to.
    pub thread: u8,
    pub capture: Capture,
}

impl EventRequest {
    pub fn control(register: u32, value: u64, counter: u32, event_id: u32) -> Self {
        Self {
            command: Command::Control,
            register: RegisterId(register),
            value,
            counter: Some(RegisterId(counter)),
            event_id,
            thread: 0,
            capture: Capture::empty(),
        }
    }

    pub fn counter(register: u32, sample_after: u64) -> Self {
        Self {
            command: Command::Counter,
            register: RegisterId(register),
            value: sample_after,
            counter: None,
            event_id: 0,
            thread: 0,
            capture: Capture::empty(),
        }
    }

    pub fn raw(register: u32, value: u64) -> Self {
        Self {
            command: Command::Raw,
            register: RegisterId(register),
            value,
            counter: None,
            event_id: 0,
            thread: 0,
            capture: Capture::empty(),
        }
    }

    pub fn timer(interval_us: u64, event_id: u32) -> Self {
        Self {
            command: Command::TimerInterval,
            register: RegisterId(0),
            value: interval_us,
            counter: None,
            event_id,
            thread: 0,
            capture: Capture::empty(),
        }
    }

    pub fn on_thread(mut self, thread: u8) -> Self {
        self.thread = thread;
        self
    }

    pub fn with_capture(mut self, capture: Capture) -> Self {
        self.capture = capture;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub method: Method,
    pub samples_per_buffer: u32,
    pub max_samples: Option<u64>,
    pub max_duration: Option<Duration>,
    pub start_delay: Option<Duration>,
    pub timestamp: bool,
    pub events: Vec<EventRequest>,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            method: Method::EVENT_BASED,
            samples_per_buffer: 1000,
            max_samples: None,
            max_duration: None,
            start_delay: None,
            timestamp: false,
            events: Vec::new(),
        }
    }
}

impl SessionParams {
    /// Checks that do not depend on the processor family.
    pub fn validate(&self) -> Result<()> {
        if self.method.is_empty() {
            return Err(SamplingError::invalid("no sampling method selected"));
        }

        if self.samples_per_buffer == 0 {
            return Err(SamplingError::invalid("samples per buffer must be non-zero"));
        }

        if self.events.is_empty() {
            return Err(SamplingError::invalid("no event requests"));
        }

        if self.max_samples == Some(0) {
            return Err(SamplingError::invalid("maximum samples must be non-zero"));
        }

        let timers = self
            .events
            .iter()
            .filter(|e| e.command == Command::TimerInterval)
            .count();

        if timers > 0 && !self.method.contains(Method::TIME_BASED) {
            return Err(SamplingError::invalid(
                "timer interval requested without time-based method",
            ));
        }

        if timers > 1 {
            return Err(SamplingError::invalid("more than one timer interval"));
        }

        Ok(())
    }

    /// Parse a parameter block. The declared length is checked against the
    /// entry count and the data before any entry is read.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(SamplingError::invalid("truncated parameter header"));
        }

        if data[0..4] != MAGIC {
            return Err(SamplingError::invalid("invalid parameter block magic"));
        }

        if data[4] != VERSION_MAJOR {
            return Err(SamplingError::invalid(format!(
                "unsupported parameter block version: {}.{}",
                data[4], data[5]
            )));
        }

        let flags = u16::from_le_bytes([data[6], data[7]]);
        let method = Method::from_bits(read_u32(data, 8))
            .ok_or_else(|| SamplingError::invalid("unknown sampling method bits"))?;
        let entry_count = read_u32(data, 12) as usize;
        let block_len = read_u32(data, 16) as usize;
        let samples_per_buffer = read_u32(data, 20);
        let max_samples = read_u64(data, 24);
        let max_duration_ms = read_u64(data, 32);
        let start_delay_ms = read_u64(data, 40);

        let needed = entry_count
            .checked_mul(ENTRY_LEN)
            .and_then(|v| v.checked_add(HEADER_LEN))
            .ok_or_else(|| SamplingError::invalid("entry count overflows"))?;

        if block_len < needed {
            return Err(SamplingError::invalid(format!(
                "declared length {block_len} too small for {entry_count} entries"
            )));
        }

        if data.len() < block_len {
            return Err(SamplingError::invalid(format!(
                "block is {} bytes but declares {block_len}",
                data.len()
            )));
        }

        let mut events = Vec::with_capacity(entry_count);

        for i in 0..entry_count {
            let offset = HEADER_LEN + i * ENTRY_LEN;
            events.push(parse_entry(&data[offset..offset + ENTRY_LEN])?);
        }

        Ok(Self {
            method,
            samples_per_buffer,
            max_samples: (max_samples != 0).then_some(max_samples),
            max_duration: (max_duration_ms != 0).then(|| Duration::from_millis(max_duration_ms)),
            start_delay: (start_delay_ms != 0).then(|| Duration::from_millis(start_delay_ms)),
            timestamp: flags & FLAG_TIMESTAMP != 0,
            events,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let block_len = HEADER_LEN + self.events.len() * ENTRY_LEN;
        let mut data = Vec::with_capacity(block_len);

        let flags = if self.timestamp { FLAG_TIMESTAMP } else { 0 };

        data.extend_from_slice(&MAGIC);
        data.extend_from_slice(&[VERSION_MAJOR, VERSION_MINOR]);
        data.extend_from_slice(&flags.to_le_bytes());
        data.extend_from_slice(&self.method.bits().to_le_bytes());
        data.extend_from_slice(&(self.events.len() as u32).to_le_bytes());
        data.extend_from_slice(&(block_len as u32).to_le_bytes());
        data.extend_from_slice(&self.samples_per_buffer.to_le_bytes());
        data.extend_from_slice(&self.max_samples.unwrap_or(0).to_le_bytes());
        data.extend_from_slice(&millis(self.max_duration).to_le_bytes());
        data.extend_from_slice(&millis(self.start_delay).to_le_bytes());

        for event in &self.events {
            data.extend_from_slice(&event.command.code().to_le_bytes());
            data.extend_from_slice(&event.register.0.to_le_bytes());
            data.extend_from_slice(&event.value.to_le_bytes());
            data.extend_from_slice(&event.counter.map(|c| c.0).unwrap_or(NO_COUNTER).to_le_bytes());
            data.extend_from_slice(&event.event_id.to_le_bytes());
            data.push(event.thread);
            data.push(event.capture.bits());
            data.extend_from_slice(&[0; 6]);
        }

        data
    }
}

fn parse_entry(data: &[u8]) -> Result<EventRequest> {
    let command = Command::from_code(read_u32(data, 0))?;
    let counter = read_u32(data, 16);
    let capture = Capture::from_bits(data[25])
        .ok_or_else(|| SamplingError::invalid(format!("unknown capture bits: {:#x}", data[25])))?;

    Ok(EventRequest {
        command,
        register: RegisterId(read_u32(data, 4)),
        value: read_u64(data, 8),
        counter: (counter != NO_COUNTER).then_some(RegisterId(counter)),
        event_id: read_u32(data, 20),
        thread: data[24],
        capture,
    })
}

fn millis(duration: Option<Duration>) -> u64 {
    duration.map(|d| d.as_millis() as u64).unwrap_or(0)
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut bytes = [0; 4];
    bytes.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}
