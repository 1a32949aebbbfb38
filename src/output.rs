//! Record file: a header describing the session followed by the raw
//! records exactly as `read` returned them.
//!
//! Header, all little-endian:
//!
//! magic[4] + version[2] + layout[2] + record_len[4] + family[1] +
//! reserved[3] + event_count[4] + event_id[4] * event_count

use crate::backend::Family;
use crate::error::SamplingError;
use crate::registers::SessionConfig;
use crate::sample::{RecordLayout, SampleRecord};

use serde::Serialize;

use std::io::{ErrorKind, Read, Write};

/// Magic bytes identifying a record file: "EBSR"
pub const FILE_MAGIC: [u8; 4] = [0x45, 0x42, 0x53, 0x52];
pub const FILE_VERSION: u16 = 1;

const FIXED_LEN: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a sample file")]
    BadMagic,
    #[error("unsupported sample file version: {0}")]
    Version(u16),
    #[error("bad sample file header: {0}")]
    Header(String),
    #[error("truncated record after {0} records")]
    Truncated(u64),
    #[error(transparent)]
    Sampling(#[from] SamplingError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub family: Family,
    pub layout: RecordLayout,
    /// Event ids, indexed by a record's event index.
    pub events: Vec<u32>,
}

impl FileHeader {
    pub fn new(family: Family, config: &SessionConfig) -> Self {
        Self {
            family,
            layout: config.layout,
            events: config.events.ids().to_vec(),
        }
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), OutputError> {
        let mut buf = Vec::with_capacity(FIXED_LEN + self.events.len() * 4);

        buf.extend_from_slice(&FILE_MAGIC);
        buf.extend_from_slice(&FILE_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.layout.bits().to_le_bytes());
        buf.extend_from_slice(&(self.layout.len() as u32).to_le_bytes());
        buf.push(family_code(self.family));
        buf.extend_from_slice(&[0; 3]);
        buf.extend_from_slice(&(self.events.len() as u32).to_le_bytes());

        for id in &self.events {
            buf.extend_from_slice(&id.to_le_bytes());
        }

        writer.write_all(&buf)?;
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, OutputError> {
        let mut fixed = [0u8; FIXED_LEN];
        reader.read_exact(&mut fixed)?;

        if fixed[0..4] != FILE_MAGIC {
            return Err(OutputError::BadMagic);
        }

        let version = u16::from_le_bytes([fixed[4], fixed[5]]);
        if version != FILE_VERSION {
            return Err(OutputError::Version(version));
        }

        let layout = RecordLayout::from_bits(u16::from_le_bytes([fixed[6], fixed[7]]));
        let record_len = u32::from_le_bytes([fixed[8], fixed[9], fixed[10], fixed[11]]) as usize;

        if record_len != layout.len() {
            return Err(OutputError::Header(format!(
                "record length {record_len} does not match layout length {}",
                layout.len()
            )));
        }

        let family = family_from_code(fixed[12])
            .ok_or_else(|| OutputError::Header(format!("unknown family {}", fixed[12])))?;

        let count = u32::from_le_bytes([fixed[16], fixed[17], fixed[18], fixed[19]]) as usize;

        if count > crate::sample::MAX_EVENT_IDS {
            return Err(OutputError::Header(format!("{count} event ids")));
        }

        let mut ids = vec![0u8; count * 4];
        reader.read_exact(&mut ids)?;

        let events = ids
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        Ok(Self {
            family,
            layout,
            events,
        })
    }
}

fn family_code(family: Family) -> u8 {
    match family {
        Family::P6 => 1,
        Family::Pentium4 => 2,
        Family::Itanium => 3,
    }
}

fn family_from_code(code: u8) -> Option<Family> {
    match code {
        1 => Some(Family::P6),
        2 => Some(Family::Pentium4),
        3 => Some(Family::Itanium),
        _ => None,
    }
}

/// A record as printed by `decode`.
#[derive(Serialize)]
struct Decoded<'a> {
    event_id: Option<u32>,
    #[serde(flatten)]
    record: &'a SampleRecord,
}

/// Fill `buf` completely, or return `false` on a clean end of input.
fn read_record<R: Read>(reader: &mut R, buf: &mut [u8], records: u64) -> Result<bool, OutputError> {
    let mut filled = 0;

    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(OutputError::Truncated(records)),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(true)
}

/// Print every record of a record file as one JSON object per line.
/// Returns the number of records.
pub fn decode<R: Read, W: Write>(reader: &mut R, writer: &mut W) -> Result<u64, OutputError> {
    let header = FileHeader::read_from(reader)?;
    let mut buf = vec![0u8; header.layout.len()];
    let mut records = 0;

    while read_record(reader, &mut buf, records)? {
        let record = SampleRecord::decode(header.layout, &buf)?;

        let decoded = Decoded {
            event_id: header.events.get(record.event_index as usize).copied(),
            record: &record,
        };

        serde_json::to_writer(&mut *writer, &decoded)?;
        writer.write_all(b"\n")?;

        records += 1;
    }

    writer.flush()?;

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::InterruptFrame;

    fn header() -> FileHeader {
        FileHeader {
            family: Family::Pentium4,
            layout: RecordLayout {
                timestamp: true,
                address: false,
                branches: false,
            },
            events: vec![0xc0, 0xc4],
        }
    }

    fn record(event_index: u16) -> SampleRecord {
        let frame = InterruptFrame {
            ip: 0x401000,
            flags: 0x246,
            cs: 0x33,
            pid: 7,
            tid: 8,
            timestamp: 99,
        };

        SampleRecord {
            ip: frame.ip,
            flags: frame.flags,
            cs: frame.cs,
            cpu: 1,
            pid: frame.pid,
            tid: frame.tid,
            event_index,
            timestamp: Some(frame.timestamp),
            ..Default::default()
        }
    }

    fn file(records: &[SampleRecord]) -> Vec<u8> {
        let header = header();
        let mut out = Vec::new();
        header.write_to(&mut out).unwrap();

        for r in records {
            let mut buf = vec![0u8; header.layout.len()];
            r.encode_into(header.layout, &mut buf);
            out.extend_from_slice(&buf);
        }

        out
    }

    #[test]
    fn header_is_read_back() {
        let mut out = Vec::new();
        header().write_to(&mut out).unwrap();
        assert_eq!(out.len(), FIXED_LEN + 8);
        assert_eq!(FileHeader::read_from(&mut out.as_slice()).unwrap(), header());
    }

    #[test]
    fn decode_json_lines() {
        let data = file(&[record(0), record(1)]);
        let mut out = Vec::new();

        assert_eq!(decode(&mut data.as_slice(), &mut out).unwrap(), 2);

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event_id"], 0xc0);
        assert_eq!(lines[1]["event_id"], 0xc4);
        assert_eq!(lines[1]["ip"], 0x401000);
        assert_eq!(lines[1]["timestamp"], 99);
        assert_eq!(lines[0]["cpu"], 1);
    }

    #[test]
    fn truncated_record() {
        let mut data = file(&[record(0), record(1)]);
        data.truncate(data.len() - 3);

        let mut out = Vec::new();
        assert!(matches!(
            decode(&mut data.as_slice(), &mut out),
            Err(OutputError::Truncated(1))
        ));
    }

    #[test]
    fn not_a_record_file() {
        let data = vec![0u8; 64];
        assert!(matches!(
            FileHeader::read_from(&mut data.as_slice()),
            Err(OutputError::BadMagic)
        ));
    }
}
