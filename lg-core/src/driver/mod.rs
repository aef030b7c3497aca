//! Driver descriptors
//!
//! A driver turns the files a kernel driver exposes below one base path into a
//! name → path map (the descriptor). The map is filled by `init`, checked by
//! `validate` and emptied by `clean`. Consumers look a path up through the
//! [`DriverManager`](crate::manager::DriverManager) right before every access
//! and never keep it across a hotplug cycle.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use lg_error::{LegionError, Result};
use lg_protocol::DriverEventData;

pub mod cpu;
pub mod sysfs;
pub mod thermal;

pub use cpu::CpuControlDriver;
pub use sysfs::{RootKind, SysfsDriver, SysfsDriverSpec, SYSFS_DRIVERS};
pub use thermal::ProcessorThermalDriver;

/// One device event from the kernel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelEvent {
    pub action: String,
    pub devpath: String,
    pub subsystem: String,
    pub driver: Option<String>,
    /// Last component of `devpath`
    pub sysname: String,
}

impl KernelEvent {
    pub fn new(action: &str, devpath: &str, subsystem: &str, driver: Option<&str>) -> Self {
        let sysname = devpath.rsplit('/').next().unwrap_or_default().to_string();
        Self {
            action: action.to_string(),
            devpath: devpath.to_string(),
            subsystem: subsystem.to_string(),
            driver: driver.map(str::to_string),
            sysname,
        }
    }
}

/// Capability name → absolute path for one hardware surface
#[derive(Debug, Clone, Default)]
pub struct DriverDescriptor {
    name: String,
    base: PathBuf,
    paths: BTreeMap<String, PathBuf>,
    filter: Option<String>,
    valid: bool,
}

impl DriverDescriptor {
    pub fn new(name: &str, base: PathBuf, filter: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            base,
            paths: BTreeMap::new(),
            filter: filter.map(str::to_string),
            valid: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Kernel subsystem whose events this driver wants to see
    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    pub fn paths(&self) -> &BTreeMap<String, PathBuf> {
        &self.paths
    }

    pub fn insert(&mut self, capability: &str, path: PathBuf) {
        self.paths.insert(capability.to_string(), path);
    }

    pub fn has(&self, capability: &str) -> bool {
        self.paths.contains_key(capability)
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }

    /// Path of one capability
    pub fn get(&self, capability: &str) -> Result<&Path> {
        self.paths.get(capability).map(PathBuf::as_path).ok_or_else(|| {
            LegionError::MissingCapability {
                driver: self.name.clone(),
                capability: capability.to_string(),
            }
        })
    }

    /// Drop every path and mark the descriptor invalid
    pub fn clear(&mut self) {
        self.paths.clear();
        self.valid = false;
    }
}

/// Lifecycle of one hardware surface
pub trait Driver {
    fn descriptor(&self) -> &DriverDescriptor;
    fn descriptor_mut(&mut self) -> &mut DriverDescriptor;

    /// Probe the base path and fill the descriptor; absence is not an error
    fn init(&mut self);

    /// Kernel module whose load/unload drives this driver
    fn module(&self) -> Option<&str> {
        None
    }

    /// Capabilities that must be present for the driver to be usable
    fn required(&self) -> &[&'static str] {
        &[]
    }

    fn name(&self) -> &str {
        self.descriptor().name()
    }

    fn validate(&mut self) -> Result<()> {
        let desc = self.descriptor();
        let ok = !desc.is_empty() && self.required().iter().all(|cap| desc.has(cap));
        self.descriptor_mut().set_valid(ok);
        if ok {
            Ok(())
        } else {
            Err(LegionError::DriverNotAvailable(self.name().to_string()))
        }
    }

    fn clean(&mut self) {
        self.descriptor_mut().clear();
    }

    /// React to an event of the driver's subsystem filter
    ///
    /// Returns the event to publish when the driver re-probed.
    fn handle_kernel_event(&mut self, _event: &KernelEvent) -> Option<DriverEventData> {
        None
    }
}

/// Re-run the whole lifecycle; returns whether the driver came back valid
pub(crate) fn reprobe<D: Driver + ?Sized>(driver: &mut D) -> bool {
    driver.clean();
    driver.init();
    driver.validate().is_ok()
}
