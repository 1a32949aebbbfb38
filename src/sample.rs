//! Sample record layout.
//!
//! Base record (32 bytes, little-endian):
//! ip[8] + flags[8] + cs[2] + cpu[2] + pid[4] + tid[4] + event_index[2] +
//! record_flags[2]
//!
//! Optional extensions follow in this order: timestamp[8], address capture
//! (instruction address[8] + data address[8] + latency[8]) and branch history
//! (four from[8] + to[8] pairs). The extensions present are fixed for a
//! session, so every record in a buffer has the same length.

use crate::error::{Result, SamplingError};
use crate::params::Capture;

use serde::Serialize;

pub const BASE_RECORD_LEN: usize = 32;
pub const TIMESTAMP_LEN: usize = 8;
pub const ADDRESS_LEN: usize = 24;
pub const BRANCH_ENTRIES: usize = 4;
pub const BRANCH_LEN: usize = BRANCH_ENTRIES * 16;
pub const MAX_RECORD_LEN: usize = BASE_RECORD_LEN + TIMESTAMP_LEN + ADDRESS_LEN + BRANCH_LEN;

pub const EVENT_INDEX_OFFSET: usize = 28;
const RECORD_FLAGS_OFFSET: usize = 30;

/// Maximum number of distinct events in one session.
pub const MAX_EVENT_IDS: usize = 32;

// record flags
pub const HAS_TIMESTAMP: u16 = 1;
pub const HAS_ADDRESS: u16 = 2;
pub const HAS_BRANCHES: u16 = 4;
pub const PRECISE_IP: u16 = 8;

/// Which optional extensions every record of a session carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordLayout {
    pub timestamp: bool,
    pub address: bool,
    pub branches: bool,
}

impl RecordLayout {
    pub fn new(timestamp: bool, captures: Capture) -> Self {
        Self {
            timestamp,
            address: captures.contains(Capture::ADDRESS),
            branches: captures.contains(Capture::BRANCH),
        }
    }

    pub fn len(&self) -> usize {
        let mut len = BASE_RECORD_LEN;

        if self.timestamp {
            len += TIMESTAMP_LEN;
        }
        if self.address {
            len += ADDRESS_LEN;
        }
        if self.branches {
            len += BRANCH_LEN;
        }

        len
    }

    fn address_offset(&self) -> usize {
        BASE_RECORD_LEN + if self.timestamp { TIMESTAMP_LEN } else { 0 }
    }

    fn branch_offset(&self) -> usize {
        self.address_offset() + if self.address { ADDRESS_LEN } else { 0 }
    }

    /// Layout bits as stored in a record file header.
    pub fn bits(&self) -> u16 {
        let mut bits = 0;
        if self.timestamp {
            bits |= HAS_TIMESTAMP;
        }
        if self.address {
            bits |= HAS_ADDRESS;
        }
        if self.branches {
            bits |= HAS_BRANCHES;
        }
        bits
    }

    pub fn from_bits(bits: u16) -> Self {
        Self {
            timestamp: bits & HAS_TIMESTAMP != 0,
            address: bits & HAS_ADDRESS != 0,
            branches: bits & HAS_BRANCHES != 0,
        }
    }
}

/// Context handed to the overflow handler by whatever delivered the
/// interrupt.
#[derive(Debug, Clone, Copy, Default)]
pub struct InterruptFrame {
    pub ip: u64,
    pub flags: u64,
    pub cs: u16,
    pub pid: u32,
    pub tid: u32,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AddressCapture {
    pub instruction: u64,
    pub data: u64,
    pub latency: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BranchEntry {
    pub from: u64,
    pub to: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SampleRecord {
    pub ip: u64,
    pub flags: u64,
    pub cs: u16,
    pub cpu: u16,
    pub pid: u32,
    pub tid: u32,
    pub event_index: u16,
    pub precise: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<AddressCapture>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branches: Option<[BranchEntry; BRANCH_ENTRIES]>,
}

impl SampleRecord {
    /// Write the record into `buf`, which must be exactly `layout.len()`
    /// bytes. Extensions the layout has but the record lacks are zeroed.
    pub fn encode_into(&self, layout: RecordLayout, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), layout.len());

        let mut flags = 0;
        if self.precise {
            flags |= PRECISE_IP;
        }

        buf[0..8].copy_from_slice(&self.ip.to_le_bytes());
        buf[8..16].copy_from_slice(&self.flags.to_le_bytes());
        buf[16..18].copy_from_slice(&self.cs.to_le_bytes());
        buf[18..20].copy_from_slice(&self.cpu.to_le_bytes());
        buf[20..24].copy_from_slice(&self.pid.to_le_bytes());
        buf[24..28].copy_from_slice(&self.tid.to_le_bytes());
        buf[EVENT_INDEX_OFFSET..EVENT_INDEX_OFFSET + 2]
            .copy_from_slice(&self.event_index.to_le_bytes());

        if layout.timestamp {
            flags |= HAS_TIMESTAMP;
            let ts = self.timestamp.unwrap_or(0);
            buf[BASE_RECORD_LEN..BASE_RECORD_LEN + 8].copy_from_slice(&ts.to_le_bytes());
        }

        if layout.address {
            let offset = layout.address_offset();
            let address = self.address.unwrap_or_default();
            if self.address.is_some() {
                flags |= HAS_ADDRESS;
            }
            buf[offset..offset + 8].copy_from_slice(&address.instruction.to_le_bytes());
            buf[offset + 8..offset + 16].copy_from_slice(&address.data.to_le_bytes());
            buf[offset + 16..offset + 24].copy_from_slice(&address.latency.to_le_bytes());
        }

        if layout.branches {
            let offset = layout.branch_offset();
            let branches = self.branches.unwrap_or_default();
            if self.branches.is_some() {
                flags |= HAS_BRANCHES;
            }
            for (i, entry) in branches.iter().enumerate() {
                let at = offset + i * 16;
                buf[at..at + 8].copy_from_slice(&entry.from.to_le_bytes());
                buf[at + 8..at + 16].copy_from_slice(&entry.to.to_le_bytes());
            }
        }

        buf[RECORD_FLAGS_OFFSET..RECORD_FLAGS_OFFSET + 2].copy_from_slice(&flags.to_le_bytes());
    }

    pub fn decode(layout: RecordLayout, buf: &[u8]) -> Result<Self> {
        if buf.len() < layout.len() {
            return Err(SamplingError::invalid(format!(
                "record is {} bytes, layout needs {}",
                buf.len(),
                layout.len()
            )));
        }

        let flags = u16_at(buf, RECORD_FLAGS_OFFSET);

        let mut record = Self {
            ip: u64_at(buf, 0),
            flags: u64_at(buf, 8),
            cs: u16_at(buf, 16),
            cpu: u16_at(buf, 18),
            pid: u32_at(buf, 20),
            tid: u32_at(buf, 24),
            event_index: u16_at(buf, EVENT_INDEX_OFFSET),
            precise: flags & PRECISE_IP != 0,
            ..Default::default()
        };

        if layout.timestamp {
            record.timestamp = Some(u64_at(buf, BASE_RECORD_LEN));
        }

        if layout.address && flags & HAS_ADDRESS != 0 {
            let offset = layout.address_offset();
            record.address = Some(AddressCapture {
                instruction: u64_at(buf, offset),
                data: u64_at(buf, offset + 8),
                latency: u64_at(buf, offset + 16),
            });
        }

        if layout.branches && flags & HAS_BRANCHES != 0 {
            let offset = layout.branch_offset();
            let mut branches = [BranchEntry::default(); BRANCH_ENTRIES];
            for (i, entry) in branches.iter_mut().enumerate() {
                let at = offset + i * 16;
                entry.from = u64_at(buf, at);
                entry.to = u64_at(buf, at + 8);
            }
            record.branches = Some(branches);
        }

        Ok(record)
    }
}

/// Overwrite only the event index of an encoded record.
pub fn set_event_index(buf: &mut [u8], index: u16) {
    buf[EVENT_INDEX_OFFSET..EVENT_INDEX_OFFSET + 2].copy_from_slice(&index.to_le_bytes());
}

/// Compact per-session index to user-visible event id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventIdTable {
    ids: Vec<u32>,
}

impl EventIdTable {
    /// Returns the index for `event_id`, adding it if it is new.
    pub fn insert(&mut self, event_id: u32) -> Result<u16> {
        if let Some(index) = self.ids.iter().position(|id| *id == event_id) {
            return Ok(index as u16);
        }

        if self.ids.len() >= MAX_EVENT_IDS {
            return Err(SamplingError::exhausted(format!(
                "more than {MAX_EVENT_IDS} distinct events requested"
            )));
        }

        self.ids.push(event_id);
        Ok((self.ids.len() - 1) as u16)
    }

    pub fn get(&self, index: u16) -> Option<u32> {
        self.ids.get(index as usize).copied()
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

fn u16_at(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn u32_at(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn u64_at(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_lengths() {
        assert_eq!(RecordLayout::default().len(), BASE_RECORD_LEN);
        assert_eq!(RecordLayout::new(true, Capture::empty()).len(), 40);
        assert_eq!(
            RecordLayout::new(true, Capture::ADDRESS | Capture::BRANCH).len(),
            MAX_RECORD_LEN
        );
        // precise capture rewrites the ip and needs no extra room
        assert_eq!(RecordLayout::new(false, Capture::PRECISE).len(), BASE_RECORD_LEN);
    }

    #[test]
    fn extension_offsets() {
        let layout = RecordLayout::new(false, Capture::ADDRESS | Capture::BRANCH);
        let record = SampleRecord {
            ip: 0x401000,
            address: Some(AddressCapture {
                instruction: 0x401010,
                data: 0x7fff0000,
                latency: 12,
            }),
            ..Default::default()
        };

        let mut buf = vec![0; layout.len()];
        record.encode_into(layout, &mut buf);

        assert_eq!(u64_at(&buf, BASE_RECORD_LEN), 0x401010);
        assert_eq!(u64_at(&buf, BASE_RECORD_LEN + 16), 12);

        // branches were not captured for this record
        let decoded = SampleRecord::decode(layout, &buf).unwrap();
        assert_eq!(decoded.address, record.address);
        assert_eq!(decoded.branches, None);
    }

    #[test]
    fn rewrite_event_index() {
        let layout = RecordLayout::new(true, Capture::empty());
        let record = SampleRecord {
            ip: 0xdead,
            cpu: 3,
            event_index: 1,
            timestamp: Some(99),
            ..Default::default()
        };

        let mut buf = vec![0; layout.len()];
        record.encode_into(layout, &mut buf);
        let mut copy = buf.clone();
        set_event_index(&mut copy, 4);

        let first = SampleRecord::decode(layout, &buf).unwrap();
        let second = SampleRecord::decode(layout, &copy).unwrap();
        assert_eq!(second.event_index, 4);
        assert_eq!(first, SampleRecord { event_index: 1, ..second });
    }

    #[test]
    fn event_table() {
        let mut table = EventIdTable::default();
        assert_eq!(table.insert(100).unwrap(), 0);
        assert_eq!(table.insert(200).unwrap(), 1);
        assert_eq!(table.insert(100).unwrap(), 0);
        assert_eq!(table.get(1), Some(200));

        for id in 0..(MAX_EVENT_IDS as u32 - 2) {
            table.insert(1000 + id).unwrap();
        }

        assert!(matches!(
            table.insert(5),
            Err(SamplingError::ResourceExhausted(_))
        ));
    }
}
