use crate::wake::NonBlocking;

use bitflags::bitflags;
use metriken::Counter;
use serde::Serialize;

/// Length of the fixed `stat` snapshot.
pub const STAT_LEN: usize = 64;

bitflags! {
    /// Sticky conditions raised where no caller could be told directly.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
    #[serde(transparent)]
    pub struct Status: u8 {
        const DURATION_EXPIRED = 1;
        const SAMPLE_LIMIT = 2;
        const HARDWARE_ANOMALY = 4;
        const ABORTED = 8;
    }
}

/// Counters bumped from the interrupt path.
#[derive(Default)]
pub struct HandlerStats {
    pub interrupts: Counter,
    /// Overflows seen while paused or suspended.
    pub skipped: Counter,
    /// Interrupts for a CPU outside the topology.
    pub dropped: Counter,
    /// Overflows that found the buffer full.
    pub lost: Counter,
    /// Overflows postponed to the counter's next event.
    pub deferred: Counter,
    pub precise_errors: Counter,
    pub anomalies: Counter,
    /// Full context captures, one per interrupt that wrote records.
    pub captures: Counter,
    pub timer_ticks: Counter,
}

impl NonBlocking for HandlerStats {}

impl HandlerStats {
    pub fn reset(&self) {
        for counter in [
            &self.interrupts,
            &self.skipped,
            &self.dropped,
            &self.lost,
            &self.deferred,
            &self.precise_errors,
            &self.anomalies,
            &self.captures,
            &self.timer_ticks,
        ] {
            counter.set(0);
        }
    }
}

/// Point-in-time view of a session, as returned by `stat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub duration_us: u64,
    pub interrupts: u64,
    pub samples: u64,
    pub skipped: u64,
    pub lost: u64,
    pub dropped: u64,
    pub deferred: u64,
    pub precise_errors: u64,
    pub anomalies: u64,
    pub timer_ticks: u64,
    pub state: u8,
    pub status: Status,
}

impl SessionStats {
    /// Fixed little-endian layout:
    ///
    /// duration_us[8] + interrupts[8] + samples[8] + skipped[8] + lost[8] +
    /// dropped[4] + deferred[4] + precise_errors[4] + anomalies[4] +
    /// timer_ticks[4] + state[1] + status[1] + reserved[2]
    ///
    /// The narrow fields saturate.
    pub fn to_bytes(&self) -> [u8; STAT_LEN] {
        let mut buf = [0; STAT_LEN];

        let wide = [
            self.duration_us,
            self.interrupts,
            self.samples,
            self.skipped,
            self.lost,
        ];
        for (i, value) in wide.iter().enumerate() {
            buf[i * 8..i * 8 + 8].copy_from_slice(&value.to_le_bytes());
        }

        let narrow = [
            self.dropped,
            self.deferred,
            self.precise_errors,
            self.anomalies,
            self.timer_ticks,
        ];
        for (i, value) in narrow.iter().enumerate() {
            let value = u32::try_from(*value).unwrap_or(u32::MAX);
            let at = 40 + i * 4;
            buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
        }

        buf[60] = self.state;
        buf[61] = self.status.bits();

        buf
    }

    pub fn from_bytes(buf: &[u8; STAT_LEN]) -> Self {
        let wide = |i: usize| {
            let mut bytes = [0; 8];
            bytes.copy_from_slice(&buf[i * 8..i * 8 + 8]);
            u64::from_le_bytes(bytes)
        };
        let narrow = |i: usize| {
            let at = 40 + i * 4;
            u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]) as u64
        };

        Self {
            duration_us: wide(0),
            interrupts: wide(1),
            samples: wide(2),
            skipped: wide(3),
            lost: wide(4),
            dropped: narrow(0),
            deferred: narrow(1),
            precise_errors: narrow(2),
            anomalies: narrow(3),
            timer_ticks: narrow(4),
            state: buf[60],
            status: Status::from_bits_truncate(buf[61]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_layout() {
        let stats = SessionStats {
            duration_us: 1_500_000,
            interrupts: 1500,
            samples: 1000,
            lost: 1,
            dropped: 2,
            state: 3,
            status: Status::SAMPLE_LIMIT | Status::DURATION_EXPIRED,
            ..Default::default()
        };

        let bytes = stats.to_bytes();
        assert_eq!(&bytes[16..24], &1000u64.to_le_bytes());
        assert_eq!(&bytes[40..44], &2u32.to_le_bytes());
        assert_eq!(bytes[61], 3);
        assert_eq!(SessionStats::from_bytes(&bytes), stats);
    }

    #[test]
    fn narrow_fields_saturate() {
        let stats = SessionStats {
            anomalies: u64::MAX,
            ..Default::default()
        };
        let decoded = SessionStats::from_bytes(&stats.to_bytes());
        assert_eq!(decoded.anomalies, u32::MAX as u64);
    }

    #[test]
    fn counters_reset() {
        let stats = HandlerStats::default();
        stats.interrupts.add(5);
        stats.captures.increment();
        stats.reset();
        assert_eq!(stats.interrupts.value(), 0);
        assert_eq!(stats.captures.value(), 0);
    }
}
