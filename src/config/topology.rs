use super::*;

/// Upper bound on simulated packages.
const MAX_PACKAGES: usize = 256;

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Topology {
    // number of simulated packages, defaults to the detected count
    #[serde(default)]
    packages: Option<usize>,
}

impl Topology {
    pub fn check(&self) -> Result<(), String> {
        match self.packages {
            Some(0) => Err("topology packages must be non-zero".into()),
            Some(n) if n > MAX_PACKAGES => Err(format!(
                "topology packages must be at most {MAX_PACKAGES}, got {n}"
            )),
            _ => Ok(()),
        }
    }

    pub fn packages(&self) -> Option<usize> {
        self.packages
    }
}
