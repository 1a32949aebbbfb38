//! Byte-oriented control surface over a [`SamplingSession`].
//!
//! Callers hand over raw parameter blocks and buffers and get plain status
//! codes back: `0` or a byte count on success, a negative
//! [`SamplingError::code`] on failure.

use crate::error::{Result, SamplingError};
use crate::params::SessionParams;
use crate::session::{SamplingSession, STAT_LEN};
use crate::debug;

use std::sync::Arc;

/// Control requests understood by [`Device::control`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Configure,
    Start,
    Stop,
    Abort,
    Stat,
}

impl Request {
    pub fn code(self) -> u32 {
        match self {
            Self::Configure => 1,
            Self::Start => 2,
            Self::Stop => 3,
            Self::Abort => 4,
            Self::Stat => 5,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Configure),
            2 => Some(Self::Start),
            3 => Some(Self::Stop),
            4 => Some(Self::Abort),
            5 => Some(Self::Stat),
            _ => None,
        }
    }
}

pub struct Device {
    session: Arc<SamplingSession>,
}

impl Device {
    pub fn new(session: Arc<SamplingSession>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<SamplingSession> {
        &self.session
    }

    pub fn configure(&self, block: &[u8]) -> Result<()> {
        let params = SessionParams::parse(block)?;
        debug!("configure: {} event requests", params.events.len());
        self.session.configure(&params)
    }

    /// Start sampling. An empty block starts with the current
    /// configuration.
    pub fn start(&self, block: &[u8]) -> Result<()> {
        if block.is_empty() {
            return self.session.start(None);
        }

        let params = SessionParams::parse(block)?;
        self.session.start(Some(&params))
    }

    /// Stop and make the remaining records available to `read`.
    pub fn stop(&self) -> Result<()> {
        self.session.stop(true)
    }

    pub fn abort(&self) -> Result<()> {
        self.session.abort()
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.session.read(buf)
    }

    /// Write the statistics snapshot into `buf`.
    pub fn stat(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < STAT_LEN {
            return Err(SamplingError::invalid(format!(
                "stat buffer of {} bytes is smaller than {STAT_LEN}",
                buf.len()
            )));
        }

        buf[..STAT_LEN].copy_from_slice(&self.session.stat().to_bytes());
        Ok(STAT_LEN)
    }

    /// Dispatch a request by code. `buf` carries the parameter block for
    /// configure and start and receives the snapshot for stat.
    pub fn control(&self, code: u32, buf: &mut [u8]) -> i64 {
        let Some(request) = Request::from_code(code) else {
            return SamplingError::invalid(format!("unknown request {code}")).code() as i64;
        };

        let result = match request {
            Request::Configure => self.configure(buf).map(|_| 0),
            Request::Start => self.start(buf).map(|_| 0),
            Request::Stop => self.stop().map(|_| 0),
            Request::Abort => self.abort().map(|_| 0),
            Request::Stat => self.stat(buf),
        };

        match result {
            Ok(len) => len as i64,
            Err(e) => {
                debug!("{request:?} failed: {e}");
                e.code() as i64
            }
        }
    }
}
