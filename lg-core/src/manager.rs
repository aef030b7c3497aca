//! Driver registry and hotplug dispatch
//!
//! Per driver: `Uninitialized → Initialized → (Removed → Uninitialized |
//! Reloaded → Initialized)`. Module events (`add`/`remove` of the backing
//! kernel module) drive that state machine; events of a driver's own
//! subsystem are forwarded to the driver, which decides whether to re-probe.

use std::collections::{BTreeMap, BTreeSet};

use lg_error::{LegionError, Result};
use lg_protocol::{DriverEventData, EventAction, Payload};
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::constants::drivers;
use crate::driver::{
    reprobe, CpuControlDriver, Driver, DriverDescriptor, KernelEvent, ProcessorThermalDriver,
    SysfsDriver, SYSFS_DRIVERS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Uninitialized,
    Initialized,
}

struct Entry {
    driver: Box<dyn Driver>,
    state: DriverState,
}

/// Owns every driver, keyed by unique name
pub struct DriverManager {
    drivers: BTreeMap<String, Entry>,
    /// Subsystems the hotplug monitor forwards; only ever grows
    filters: BTreeSet<String>,
    blocked: BTreeSet<String>,
}

impl Default for DriverManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverManager {
    pub fn new() -> Self {
        Self {
            drivers: BTreeMap::new(),
            filters: BTreeSet::new(),
            blocked: BTreeSet::new(),
        }
    }

    /// Registry with every built-in driver, not yet initialized
    pub fn with_default_drivers(config: &DaemonConfig) -> Result<Self> {
        let mut manager = Self::new();
        for spec in SYSFS_DRIVERS {
            manager.add_driver(Box::new(SysfsDriver::new(spec, &config.roots)))?;
        }
        manager.add_driver(Box::new(CpuControlDriver::new(&config.roots)))?;
        manager.add_driver(Box::new(ProcessorThermalDriver::new(
            &config.roots,
            config.rapl.slot.as_deref(),
        )))?;
        Ok(manager)
    }

    /// Register a driver; a second driver with the same name is a configuration error
    pub fn add_driver(&mut self, driver: Box<dyn Driver>) -> Result<()> {
        let name = driver.name().to_string();
        if self.drivers.contains_key(&name) {
            return Err(LegionError::DuplicateDriver(name));
        }
        self.drivers.insert(name, Entry { driver, state: DriverState::Uninitialized });
        Ok(())
    }

    /// Probe every driver and subscribe to their event filters
    ///
    /// A driver that fails validation stays `Uninitialized`, so a later load
    /// of its module is reported as `Added`.
    pub fn init_drivers(&mut self) {
        for (name, entry) in self.drivers.iter_mut() {
            entry.driver.init();
            entry.state = match entry.driver.validate() {
                Ok(()) => {
                    info!("Driver {} available", name);
                    DriverState::Initialized
                }
                Err(e) => {
                    warn!("{}", e);
                    DriverState::Uninitialized
                }
            };
            if let Some(filter) = entry.driver.descriptor().filter() {
                if self.filters.insert(filter.to_string()) {
                    debug!("Subscribed to kernel subsystem '{}'", filter);
                }
            }
        }
    }

    pub fn clean_drivers(&mut self) {
        for entry in self.drivers.values_mut() {
            entry.driver.clean();
            entry.state = DriverState::Uninitialized;
        }
    }

    /// Descriptor of a usable driver
    ///
    /// `DriverNotFound` means the name was never registered, `DriverNotAvailable`
    /// that the hardware is missing right now.
    pub fn get_descriptor(&self, name: &str) -> Result<&DriverDescriptor> {
        let entry = self
            .drivers
            .get(name)
            .ok_or_else(|| LegionError::DriverNotFound(name.to_string()))?;
        let desc = entry.driver.descriptor();
        if entry.state != DriverState::Initialized || !desc.is_valid() {
            return Err(LegionError::DriverNotAvailable(name.to_string()));
        }
        Ok(desc)
    }

    pub fn state(&self, name: &str) -> Option<DriverState> {
        self.drivers.get(name).map(|e| e.state)
    }

    pub fn is_available(&self, name: &str) -> bool {
        self.get_descriptor(name).is_ok()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.drivers.keys().map(String::as_str)
    }

    pub fn filters(&self) -> impl Iterator<Item = &str> {
        self.filters.iter().map(String::as_str)
    }

    /// Suppress subsystem events for `name` while a multi-step write runs
    pub fn block_kernel_event(&mut self, name: &str, block: bool) {
        if block {
            self.blocked.insert(name.to_string());
        } else {
            self.blocked.remove(name);
        }
        debug!("Kernel events for {} {}", name, if block { "blocked" } else { "unblocked" });
    }

    /// Re-run clean/init/validate for one driver
    pub fn reinit_driver(&mut self, name: &str) -> Result<()> {
        let entry = self
            .drivers
            .get_mut(name)
            .ok_or_else(|| LegionError::DriverNotFound(name.to_string()))?;
        if reprobe(entry.driver.as_mut()) {
            entry.state = DriverState::Initialized;
            Ok(())
        } else {
            entry.state = DriverState::Uninitialized;
            Err(LegionError::DriverNotAvailable(name.to_string()))
        }
    }

    /// Apply one batch of kernel events; module events are handled first
    ///
    /// Returns the `ModuleEvent`/`SubsystemEvent` payloads to publish.
    pub fn handle_kernel_events(&mut self, events: &[KernelEvent]) -> Vec<Payload> {
        let (module_events, other): (Vec<&KernelEvent>, Vec<&KernelEvent>) =
            events.iter().partition(|e| e.subsystem == drivers::MODULE_SUBSYSTEM);

        let mut published = Vec::new();
        for event in module_events {
            published.extend(self.handle_module_event(event).into_iter().map(Payload::ModuleEvent));
        }
        for event in other {
            published.extend(self.handle_subsystem_event(event).into_iter().map(Payload::SubsystemEvent));
        }
        published
    }

    fn handle_module_event(&mut self, event: &KernelEvent) -> Vec<DriverEventData> {
        let mut out = Vec::new();
        for (name, entry) in self.drivers.iter_mut() {
            if entry.driver.module() != Some(event.sysname.as_str()) {
                continue;
            }

            let action = match (event.action.as_str(), entry.state) {
                ("add", DriverState::Uninitialized) => {
                    entry.driver.init();
                    entry.state = DriverState::Initialized;
                    EventAction::Added
                }
                ("add", DriverState::Initialized) => {
                    reprobe(entry.driver.as_mut());
                    EventAction::Reloaded
                }
                ("remove", _) => {
                    entry.driver.clean();
                    entry.state = DriverState::Uninitialized;
                    EventAction::Removed
                }
                _ => continue,
            };
            if action != EventAction::Removed {
                if let Err(e) = entry.driver.validate() {
                    warn!("After module {}: {}", event.action, e);
                    entry.state = DriverState::Uninitialized;
                }
            }

            info!("Module {} {}: driver {} {}", event.sysname, event.action, name, action);
            out.push(DriverEventData {
                driver: name.clone(),
                action,
                detail: format!("module {}", event.sysname),
            });
        }
        out
    }

    fn handle_subsystem_event(&mut self, event: &KernelEvent) -> Vec<DriverEventData> {
        if !self.filters.contains(&event.subsystem) {
            return Vec::new();
        }

        let mut out = Vec::new();
        for (name, entry) in self.drivers.iter_mut() {
            if entry.state != DriverState::Initialized
                || entry.driver.descriptor().filter() != Some(event.subsystem.as_str())
            {
                continue;
            }
            if self.blocked.contains(name) {
                debug!("Dropping {} event for blocked driver {}", event.action, name);
                continue;
            }
            if let Some(data) = entry.driver.handle_kernel_event(event) {
                debug!("Driver {} re-probed on {} {}", name, event.action, event.devpath);
                out.push(data);
            }
        }
        out
    }
}
