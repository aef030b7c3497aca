//! Declarative drivers for plain attribute trees
//!
//! Each entry of [`SYSFS_DRIVERS`] names a base path and the files below it;
//! one [`SysfsDriver`] implementation handles all of them.

use std::path::PathBuf;

use lg_protocol::{DriverEventData, EventAction};
use tracing::debug;

use super::{reprobe, Driver, DriverDescriptor, KernelEvent};
use crate::config::Roots;
use crate::constants::{caps, drivers};

/// Filesystem root a base path is relative to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootKind {
    Sys,
    Proc,
    Dev,
}

impl RootKind {
    fn resolve(self, roots: &Roots) -> &std::path::Path {
        match self {
            RootKind::Sys => &roots.sys,
            RootKind::Proc => &roots.proc,
            RootKind::Dev => &roots.dev,
        }
    }
}

#[derive(Debug)]
pub struct SysfsDriverSpec {
    pub name: &'static str,
    pub module: Option<&'static str>,
    pub root: RootKind,
    pub base: &'static str,
    /// (capability, file relative to base)
    pub capabilities: &'static [(&'static str, &'static str)],
    pub required: &'static [&'static str],
    pub filter: Option<&'static str>,
    /// Actions of the filter subsystem that trigger a re-probe
    pub reprobe_on: &'static [&'static str],
}

pub const SYSFS_DRIVERS: &[SysfsDriverSpec] = &[
    SysfsDriverSpec {
        name: drivers::LEGION,
        module: Some(drivers::LEGION_MODULE),
        root: RootKind::Sys,
        base: drivers::LEGION_BASE,
        capabilities: &[
            (caps::FAN_CURVE, "fancurve"),
            (caps::FAN_FULLSPEED, "fan_fullspeed"),
            (caps::FAN_LOCK, "lockfancontroller"),
        ],
        required: &[caps::FAN_CURVE],
        filter: Some("platform"),
        reprobe_on: &["change"],
    },
    SysfsDriverSpec {
        name: drivers::PLATFORM_PROFILE,
        module: Some(drivers::PLATFORM_PROFILE_MODULE),
        root: RootKind::Sys,
        base: drivers::PLATFORM_PROFILE_BASE,
        capabilities: &[
            (caps::PROFILE, "platform_profile"),
            (caps::PROFILE_CHOICES, "platform_profile_choices"),
        ],
        required: &[caps::PROFILE],
        filter: None,
        reprobe_on: &[],
    },
    SysfsDriverSpec {
        name: drivers::ACPI_CALL,
        module: Some(drivers::ACPI_CALL_MODULE),
        root: RootKind::Proc,
        base: drivers::ACPI_CALL_BASE,
        capabilities: &[(caps::ACPI_CALL, "call")],
        required: &[caps::ACPI_CALL],
        filter: None,
        reprobe_on: &[],
    },
    SysfsDriverSpec {
        name: drivers::EC_PORT,
        module: None,
        root: RootKind::Dev,
        base: "",
        capabilities: &[(caps::EC_PORT, "port")],
        required: &[caps::EC_PORT],
        filter: None,
        reprobe_on: &[],
    },
];

pub struct SysfsDriver {
    spec: &'static SysfsDriverSpec,
    descriptor: DriverDescriptor,
}

impl SysfsDriver {
    pub fn new(spec: &'static SysfsDriverSpec, roots: &Roots) -> Self {
        let base = spec.root.resolve(roots).join(spec.base);
        Self {
            spec,
            descriptor: DriverDescriptor::new(spec.name, base, spec.filter),
        }
    }

    fn wants(&self, event: &KernelEvent) -> bool {
        self.spec.filter == Some(event.subsystem.as_str())
            && self.spec.reprobe_on.iter().any(|a| *a == event.action)
            && event.driver.as_deref() == Some(self.spec.name)
    }
}

impl Driver for SysfsDriver {
    fn descriptor(&self) -> &DriverDescriptor {
        &self.descriptor
    }

    fn descriptor_mut(&mut self) -> &mut DriverDescriptor {
        &mut self.descriptor
    }

    fn module(&self) -> Option<&str> {
        self.spec.module
    }

    fn required(&self) -> &[&'static str] {
        self.spec.required
    }

    fn init(&mut self) {
        let base = self.descriptor.base().to_path_buf();
        if !base.is_dir() {
            debug!("{}: {} not present", self.spec.name, base.display());
            return;
        }

        for (capability, file) in self.spec.capabilities {
            let path: PathBuf = base.join(file);
            if path.exists() {
                self.descriptor.insert(capability, path);
            }
        }
        debug!("{}: {} capabilities under {}", self.spec.name, self.descriptor.paths().len(), base.display());
    }

    fn handle_kernel_event(&mut self, event: &KernelEvent) -> Option<DriverEventData> {
        if !self.wants(event) {
            return None;
        }

        let valid = reprobe(self);
        Some(DriverEventData {
            driver: self.spec.name.to_string(),
            action: if valid { EventAction::Changed } else { EventAction::Removed },
            detail: format!("{} {}", event.action, event.sysname),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lg_error::LegionError;
    use std::fs;
    use tempfile::TempDir;

    fn legion_spec() -> &'static SysfsDriverSpec {
        SYSFS_DRIVERS.iter().find(|s| s.name == drivers::LEGION).unwrap()
    }

    fn legion_tree(dir: &TempDir) -> Roots {
        let roots = Roots::under(dir.path());
        let base = roots.sys.join(drivers::LEGION_BASE);
        fs::create_dir_all(&base).unwrap();
        fs::write(base.join("fancurve"), "30,40,50,60,70,80,90,95,99,100\n").unwrap();
        fs::write(base.join("lockfancontroller"), "0\n").unwrap();
        roots
    }

    #[test]
    fn test_init_collects_present_files() {
        let dir = TempDir::new().unwrap();
        let roots = legion_tree(&dir);

        let mut driver = SysfsDriver::new(legion_spec(), &roots);
        driver.init();
        driver.validate().unwrap();

        let desc = driver.descriptor();
        assert!(desc.has(caps::FAN_CURVE));
        assert!(desc.has(caps::FAN_LOCK));
        assert!(!desc.has(caps::FAN_FULLSPEED));
        assert!(desc.is_valid());
    }

    #[test]
    fn test_absent_base_is_not_available() {
        let dir = TempDir::new().unwrap();
        let roots = Roots::under(dir.path());

        let mut driver = SysfsDriver::new(legion_spec(), &roots);
        driver.init();
        assert!(driver.descriptor().is_empty());
        assert!(matches!(driver.validate(), Err(LegionError::DriverNotAvailable(_))));
    }

    #[test]
    fn test_missing_required_capability() {
        let dir = TempDir::new().unwrap();
        let roots = legion_tree(&dir);
        fs::remove_file(roots.sys.join(drivers::LEGION_BASE).join("fancurve")).unwrap();

        let mut driver = SysfsDriver::new(legion_spec(), &roots);
        driver.init();
        assert!(!driver.descriptor().is_empty());
        assert!(driver.validate().is_err());
    }

    #[test]
    fn test_change_event_reprobes() {
        let dir = TempDir::new().unwrap();
        let roots = legion_tree(&dir);
        let mut driver = SysfsDriver::new(legion_spec(), &roots);
        driver.init();
        driver.validate().unwrap();

        let base = roots.sys.join(drivers::LEGION_BASE);
        fs::write(base.join("fan_fullspeed"), "0\n").unwrap();

        let other = KernelEvent::new("change", "/devices/platform/other", "platform", Some("other"));
        assert!(driver.handle_kernel_event(&other).is_none());

        let event = KernelEvent::new("change", "/devices/platform/PNP0C09:00", "platform", Some("legion"));
        let published = driver.handle_kernel_event(&event).unwrap();
        assert_eq!(published.action, EventAction::Changed);
        assert_eq!(published.detail, "change PNP0C09:00");
        assert!(driver.descriptor().has(caps::FAN_FULLSPEED));
    }
}
