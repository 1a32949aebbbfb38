use crate::backend::Family;
use crate::params::{Capture, EventRequest, Method, SessionParams};
use crate::debug;

use ::log::Level;
use serde::Deserialize;

use std::path::Path;
use std::time::Duration;

mod events;
mod general;
mod hardware;
mod log;
mod topology;
mod workload;

pub use events::{CaptureKind, Event, RawRegister};
pub use general::General;
pub use hardware::Hardware;
pub use self::log::Log;
pub use topology::Topology;
pub use workload::Workload;

fn parse_duration(name: &str, value: &str) -> Result<Duration, String> {
    value
        .parse::<humantime::Duration>()
        .map(|d| *d)
        .map_err(|e| format!("{name} couldn't be parsed: {e}"))
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    general: General,
    #[serde(default)]
    log: Log,
    #[serde(default)]
    hardware: Hardware,
    #[serde(default)]
    topology: Topology,
    #[serde(default)]
    workload: Workload,
    #[serde(default)]
    events: Vec<Event>,
    #[serde(default)]
    registers: Vec<RawRegister>,
}

impl Config {
    /// Load and check a config file. Problems are fatal, like every other
    /// startup failure of the binary.
    pub fn load(path: &dyn AsRef<Path>) -> Result<Self, String> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                eprintln!("unable to open config file: {e}");
                std::process::exit(1);
            }
        };

        let config = match Self::parse(&content) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("failed to parse config file: {e}");
                std::process::exit(1);
            }
        };

        if let Err(e) = config.check() {
            eprintln!("{e}");
            std::process::exit(1);
        }

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
    }

    pub fn check(&self) -> Result<(), String> {
        self.general.check()?;
        self.hardware.check()?;
        self.topology.check()?;
        self.workload.check()?;

        if self.events.is_empty() && self.general.timer_interval().is_none() {
            return Err("no events configured and no timer interval set".into());
        }

        for event in &self.events {
            event.check()?;
        }

        let mut names: Vec<&str> = self.events.iter().map(|e| e.name.as_str()).collect();
        names.sort_unstable();
        if let Some(pair) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(format!("event '{}' is defined twice", pair[0]));
        }

        Ok(())
    }

    pub fn general(&self) -> &General {
        &self.general
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn hardware(&self) -> &Hardware {
        &self.hardware
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn workload(&self) -> &Workload {
        &self.workload
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// The backend family to drive: configured, or else detected.
    pub fn family(&self, detected: Option<Family>) -> Option<Family> {
        self.hardware.family().or(detected)
    }

    /// Session parameters for this configuration.
    pub fn params(&self) -> SessionParams {
        let general = &self.general;

        let mut method = Method::empty();
        let mut events = Vec::new();

        for raw in &self.registers {
            events.push(EventRequest::raw(raw.register, raw.value).on_thread(raw.thread));
        }

        for event in &self.events {
            debug!("event '{}': sample after {}", event.name, event.sample_after);

            let capture = event.capture();

            events.push(
                EventRequest::control(event.control, event.control_value, event.counter, event.event_id)
                    .on_thread(event.thread)
                    .with_capture(capture),
            );
            events.push(EventRequest::counter(event.counter, event.sample_after).on_thread(event.thread));
        }

        if !self.events.is_empty() {
            method |= Method::EVENT_BASED;
        }

        if let Some(interval) = general.timer_interval() {
            method |= Method::TIME_BASED;
            events.push(EventRequest::timer(
                interval.as_micros() as u64,
                general.timer_event_id(),
            ));
        }

        SessionParams {
            method,
            samples_per_buffer: general.samples_per_buffer(),
            max_samples: general.max_samples(),
            max_duration: general.duration(),
            start_delay: general.start_delay(),
            timestamp: general.timestamp(),
            events,
        }
    }
}
