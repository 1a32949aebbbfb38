use super::*;

use std::path::PathBuf;

fn output() -> String {
    "samples.ebs".into()
}

fn samples_per_buffer() -> u32 {
    4096
}

fn timestamp() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct General {
    /// File the recorded samples are written to.
    #[serde(default = "output")]
    output: String,

    #[serde(default = "samples_per_buffer")]
    samples_per_buffer: u32,

    #[serde(default)]
    max_samples: Option<u64>,

    // stop automatically after this long
    #[serde(default)]
    duration: Option<String>,

    #[serde(default)]
    start_delay: Option<String>,

    #[serde(default = "timestamp")]
    timestamp: bool,

    // time-based sampling interval, sampling is event-based only if unset
    #[serde(default)]
    timer_interval: Option<String>,

    #[serde(default)]
    timer_event_id: u32,
}

impl Default for General {
    fn default() -> Self {
        Self {
            output: output(),
            samples_per_buffer: samples_per_buffer(),
            max_samples: None,
            duration: None,
            start_delay: None,
            timestamp: timestamp(),
            timer_interval: None,
            timer_event_id: 0,
        }
    }
}

impl General {
    pub fn check(&self) -> Result<(), String> {
        if self.samples_per_buffer == 0 {
            return Err("samples_per_buffer must be non-zero".into());
        }

        if self.max_samples == Some(0) {
            return Err("max_samples must be non-zero".into());
        }

        if let Some(duration) = &self.duration {
            if parse_duration("duration", duration)?.is_zero() {
                return Err("duration must be non-zero".into());
            }
        }

        if let Some(delay) = &self.start_delay {
            parse_duration("start_delay", delay)?;
        }

        if let Some(interval) = &self.timer_interval {
            if parse_duration("timer_interval", interval)? < Duration::from_micros(1) {
                return Err("timer_interval is too short. Minimum interval is: 1us".into());
            }
        }

        Ok(())
    }

    pub fn output(&self) -> PathBuf {
        PathBuf::from(&self.output)
    }

    pub fn samples_per_buffer(&self) -> u32 {
        self.samples_per_buffer
    }

    pub fn max_samples(&self) -> Option<u64> {
        self.max_samples
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
            .as_deref()
            .and_then(|d| parse_duration("duration", d).ok())
    }

    pub fn start_delay(&self) -> Option<Duration> {
        self.start_delay
            .as_deref()
            .and_then(|d| parse_duration("start_delay", d).ok())
            .filter(|d| !d.is_zero())
    }

    pub fn timestamp(&self) -> bool {
        self.timestamp
    }

    pub fn timer_interval(&self) -> Option<Duration> {
        self.timer_interval
            .as_deref()
            .and_then(|d| parse_duration("timer_interval", d).ok())
    }

    pub fn timer_event_id(&self) -> u32 {
        self.timer_event_id
    }
}
