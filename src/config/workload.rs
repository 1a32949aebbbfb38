use super::*;

fn tick() -> String {
    "1ms".into()
}

fn events_per_tick() -> u64 {
    1000
}

fn processes() -> u32 {
    4
}

fn ip_base() -> u64 {
    0x40_0000
}

fn ip_span() -> u64 {
    0x1_0000
}

fn pin() -> bool {
    true
}

/// Synthetic activity driven through the simulated counters.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Workload {
    #[serde(default = "tick")]
    tick: String,
    #[serde(default = "events_per_tick")]
    events_per_tick: u64,
    #[serde(default = "processes")]
    processes: u32,
    #[serde(default = "ip_base")]
    ip_base: u64,
    #[serde(default = "ip_span")]
    ip_span: u64,
    // pin each simulated cpu's driver thread to a core
    #[serde(default = "pin")]
    pin: bool,
}

impl Default for Workload {
    fn default() -> Self {
        Self {
            tick: tick(),
            events_per_tick: events_per_tick(),
            processes: processes(),
            ip_base: ip_base(),
            ip_span: ip_span(),
            pin: pin(),
        }
    }
}

impl Workload {
    pub fn check(&self) -> Result<(), String> {
        if parse_duration("workload tick", &self.tick)? < Duration::from_micros(10) {
            return Err("workload tick is too short. Minimum tick is: 10us".into());
        }

        if self.events_per_tick == 0 {
            return Err("workload events_per_tick must be non-zero".into());
        }

        if self.processes == 0 {
            return Err("workload processes must be non-zero".into());
        }

        if self.ip_span < 16 {
            return Err("workload ip_span must be at least 16 bytes".into());
        }

        Ok(())
    }

    pub fn tick(&self) -> Duration {
        parse_duration("workload tick", &self.tick).unwrap_or(Duration::from_millis(1))
    }

    pub fn events_per_tick(&self) -> u64 {
        self.events_per_tick
    }

    pub fn processes(&self) -> u32 {
        self.processes
    }

    pub fn ip_base(&self) -> u64 {
        self.ip_base
    }

    pub fn ip_span(&self) -> u64 {
        self.ip_span
    }

    pub fn pin(&self) -> bool {
        self.pin
    }
}
