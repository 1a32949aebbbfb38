use super::*;

fn weight() -> u64 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureKind {
    Precise,
    Address,
    Branch,
}

impl From<CaptureKind> for Capture {
    fn from(kind: CaptureKind) -> Self {
        match kind {
            CaptureKind::Precise => Capture::PRECISE,
            CaptureKind::Address => Capture::ADDRESS,
            CaptureKind::Branch => Capture::BRANCH,
        }
    }
}

/// One sampled hardware event: a control register selecting the event and
/// the counter it drives.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Event {
    pub name: String,
    pub event_id: u32,
    pub control: u32,
    pub control_value: u64,
    pub counter: u32,
    pub sample_after: u64,
    #[serde(default)]
    pub thread: u8,
    #[serde(default)]
    pub capture: Vec<CaptureKind>,
    /// Relative rate at which the workload generates this event.
    #[serde(default = "weight")]
    pub weight: u64,
}

impl Event {
    pub fn check(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("event name must not be empty".into());
        }

        if self.sample_after == 0 {
            return Err(format!("event '{}': sample_after must be non-zero", self.name));
        }

        if self.weight == 0 {
            return Err(format!("event '{}': weight must be non-zero", self.name));
        }

        Ok(())
    }

    pub fn capture(&self) -> Capture {
        self.capture
            .iter()
            .fold(Capture::empty(), |acc, kind| acc | Capture::from(*kind))
    }
}

/// A register written verbatim when the session starts.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawRegister {
    pub register: u32,
    pub value: u64,
    #[serde(default)]
    pub thread: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_set() {
        let event: Event = toml::from_str(
            r#"
name = "loads"
event_id = 3
control = 0x1004
control_value = 0x2c
counter = 0x2004
sample_after = 500
capture = ["address", "branch"]
"#,
        )
        .unwrap();

        event.check().unwrap();
        assert_eq!(event.capture(), Capture::ADDRESS | Capture::BRANCH);
        assert_eq!(event.weight, 1);
    }

    #[test]
    fn zero_sample_after() {
        let event: Event = toml::from_str(
            "name = \"x\"\nevent_id = 1\ncontrol = 1\ncontrol_value = 0\ncounter = 2\nsample_after = 0\n",
        )
        .unwrap();
        assert!(event.check().is_err());
    }
}
