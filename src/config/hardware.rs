use super::*;

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Hardware {
    // detected from the running processor when unset
    #[serde(default)]
    family: Option<Family>,
}

impl Hardware {
    pub fn check(&self) -> Result<(), String> {
        Ok(())
    }

    pub fn family(&self) -> Option<Family> {
        self.family
    }
}
