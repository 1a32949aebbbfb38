use crate::Result;

mod cpu;
mod util;

pub use self::cpu::Cpu;

#[non_exhaustive]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HwInfo {
    pub cpus: Vec<Cpu>,
}

impl HwInfo {
    pub fn new() -> Result<Self> {
        Ok(Self {
            cpus: self::cpu::get_cpus()?,
        })
    }

    pub fn get_cpus(&self) -> &Vec<Cpu> {
        &self.cpus
    }

    /// Number of packages, counting ids as they appear.
    pub fn packages(&self) -> usize {
        self.cpus
            .iter()
            .map(|cpu| cpu.package_id)
            .max()
            .map(|max| max + 1)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu(id: usize, package_id: usize) -> Cpu {
        Cpu {
            id,
            package_id,
            ..Default::default()
        }
    }

    #[test]
    fn packages_from_ids() {
        let info = HwInfo {
            cpus: vec![cpu(0, 0), cpu(1, 0), cpu(2, 1), cpu(3, 1)],
        };
        assert_eq!(info.packages(), 2);
        assert_eq!(info.get_cpus().len(), 4);

        let empty = HwInfo { cpus: Vec::new() };
        assert_eq!(empty.packages(), 0);
    }

    #[test]
    fn describes_only_cpus() {
        let info = HwInfo {
            cpus: vec![cpu(0, 0)],
        };
        let value = serde_json::to_value(&info).unwrap();
        let fields: Vec<&String> = value.as_object().unwrap().keys().collect();
        assert_eq!(fields, vec!["cpus"]);
    }
}
