use std::collections::BTreeMap;
use std::collections::HashSet;
use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;

use super::util::*;
use crate::{Error, Result};

#[non_exhaustive]
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Cpu {
    pub id: usize,

    pub core_id: usize,
    pub package_id: usize,

    pub core_cpus: Vec<usize>,
    pub package_cpus: Vec<usize>,
    pub thread_siblings: Vec<usize>,

    pub vendor: Option<String>,
    pub model_name: Option<String>,
    /// "cpu family" on x86, "family" on ia64 (where it is a name).
    pub cpu_family: Option<String>,
    pub model: Option<String>,
    pub arch: Option<String>,
    pub features: Option<HashSet<String>>,
}

impl Cpu {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn core(&self) -> usize {
        self.core_id
    }

    pub fn package(&self) -> usize {
        self.package_id
    }

    /// Position of this CPU among the hardware threads of its core.
    pub fn thread(&self) -> usize {
        self.thread_siblings
            .iter()
            .position(|id| *id == self.id)
            .unwrap_or(0)
    }

    /// Numeric processor family, when the platform reports one.
    pub fn family(&self) -> Option<usize> {
        self.cpu_family.as_ref()?.parse().ok()
    }

    pub fn model_number(&self) -> Option<usize> {
        self.model.as_ref()?.parse().ok()
    }

    pub fn is_ia64(&self) -> bool {
        self.arch.as_deref() == Some("IA-64")
            || self
                .cpu_family
                .as_deref()
                .map(|f| f.contains("Itanium"))
                .unwrap_or(false)
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features
            .as_ref()
            .map(|f| f.contains(feature))
            .unwrap_or(false)
    }
}

pub fn get_cpus() -> Result<Vec<Cpu>> {
    let mut tmp = BTreeMap::new();

    // first read from /sys and build up the topology
    let ids = read_list("/sys/devices/system/cpu/online")?;
    for id in ids {
        let core_id = read_usize(format!("/sys/devices/system/cpu/cpu{id}/topology/core_id"))?;
        let package_id = read_usize(format!(
            "/sys/devices/system/cpu/cpu{id}/topology/physical_package_id"
        ))?;

        let core_cpus = read_list(format!(
            "/sys/devices/system/cpu/cpu{id}/topology/core_cpus_list"
        ))?;
        let package_cpus = read_list(format!(
            "/sys/devices/system/cpu/cpu{id}/topology/package_cpus_list"
        ))?;
        let thread_siblings = read_list(format!(
            "/sys/devices/system/cpu/cpu{id}/topology/thread_siblings_list"
        ))?;

        tmp.insert(
            id,
            Cpu {
                id,
                core_id,
                package_id,
                core_cpus,
                package_cpus,
                thread_siblings,
                ..Default::default()
            },
        );
    }

    // processor identification is easier to get from /proc/cpuinfo

    let path = "/proc/cpuinfo";
    let file = File::open(path).map_err(|e| Error::unreadable(e, path))?;
    let reader = BufReader::new(file);

    parse_cpuinfo(reader, &mut tmp).map_err(|e| Error::unreadable(e, path))?;

    Ok(tmp.into_values().collect())
}

fn parse_cpuinfo(
    mut reader: impl BufRead,
    cpus: &mut BTreeMap<usize, Cpu>,
) -> std::io::Result<()> {
    let mut id: Option<usize> = None;
    let mut line = String::new();

    while reader.read_line(&mut line)? != 0 {
        let line = ClearGuard::new(&mut line);
        let parts: Vec<&str> = line.splitn(2, ':').map(|v| v.trim()).collect();

        if parts.len() != 2 {
            continue;
        }

        if parts[0] == "processor" {
            id = parts[1].parse().ok();
            if let Some(id) = id {
                if !cpus.contains_key(&id) {
                    log::debug!("processor {id} in cpuinfo is not online");
                }
            }
            continue;
        }

        let Some(cpu) = id.and_then(|id| cpus.get_mut(&id)) else {
            continue;
        };

        let value = Some(parts[1].to_owned());

        match parts[0] {
            "vendor_id" | "vendor" => cpu.vendor = value,
            "model name" => cpu.model_name = value,
            "cpu family" | "family" => cpu.cpu_family = value,
            "model" => cpu.model = value,
            "arch" => cpu.arch = value,
            "flags" | "Features" => {
                cpu.features = Some(
                    parts[1]
                        .split_ascii_whitespace()
                        .map(|s| s.to_owned())
                        .collect(),
                );
            }
            _ => (),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpus(ids: &[usize]) -> BTreeMap<usize, Cpu> {
        ids.iter()
            .map(|id| {
                (
                    *id,
                    Cpu {
                        id: *id,
                        ..Default::default()
                    },
                )
            })
            .collect()
    }

    #[test]
    fn x86_cpuinfo() {
        let text = "processor\t: 0\n\
                    vendor_id\t: GenuineIntel\n\
                    cpu family\t: 15\n\
                    model\t\t: 2\n\
                    model name\t: Intel(R) Pentium(R) 4 CPU 2.80GHz\n\
                    flags\t\t: fpu ht ds pebs\n\
                    \n\
                    processor\t: 1\n\
                    cpu family\t: 15\n";

        let mut map = cpus(&[0, 1]);
        parse_cpuinfo(text.as_bytes(), &mut map).unwrap();

        let cpu = &map[&0];
        assert_eq!(cpu.family(), Some(15));
        assert_eq!(cpu.model_number(), Some(2));
        assert!(cpu.has_feature("ht"));
        assert!(!cpu.is_ia64());
        assert_eq!(cpu.model_name.as_deref(), Some("Intel(R) Pentium(R) 4 CPU 2.80GHz"));
        assert_eq!(map[&1].family(), Some(15));
    }

    #[test]
    fn ia64_cpuinfo() {
        let text = "processor  : 0\n\
                    vendor     : GenuineIntel\n\
                    arch       : IA-64\n\
                    family     : Itanium 2\n\
                    model      : 1\n";

        let mut map = cpus(&[0]);
        parse_cpuinfo(text.as_bytes(), &mut map).unwrap();

        let cpu = &map[&0];
        assert!(cpu.is_ia64());
        assert_eq!(cpu.family(), None);
    }

    #[test]
    fn unknown_processor_ignored() {
        let text = "processor : 3\ncpu family : 6\n";
        let mut map = cpus(&[0]);
        parse_cpuinfo(text.as_bytes(), &mut map).unwrap();
        assert_eq!(map[&0].family(), None);
    }

    #[test]
    fn thread_position() {
        let cpu = Cpu {
            id: 5,
            thread_siblings: vec![1, 5],
            ..Default::default()
        };
        assert_eq!(cpu.thread(), 1);
    }
}
