//! CPU topology and SMT control under `<sys>/devices/system/cpu`

use std::fs;
use std::path::{Path, PathBuf};

use lg_protocol::{DriverEventData, EventAction};
use tracing::debug;

use super::{reprobe, Driver, DriverDescriptor, KernelEvent};
use crate::config::Roots;
use crate::constants::{caps, drivers};

const CPU_SUBSYSTEM: &str = "cpu";
const HOTPLUG_ACTIONS: &[&str] = &["online", "offline", "add", "remove"];

pub struct CpuControlDriver {
    descriptor: DriverDescriptor,
}

/// Capability name of a CPU's `online` switch
pub fn cpu_online_capability(cpu: u32) -> String {
    format!("cpu{}_online", cpu)
}

fn cpu_number(dir_name: &str) -> Option<u32> {
    dir_name.strip_prefix("cpu")?.parse().ok()
}

impl CpuControlDriver {
    pub fn new(roots: &Roots) -> Self {
        let base = roots.sys.join(drivers::CPU_CONTROL_BASE);
        Self {
            descriptor: DriverDescriptor::new(drivers::CPU_CONTROL, base, Some(CPU_SUBSYSTEM)),
        }
    }

    fn probe_cpus(&mut self, base: &Path) {
        let Ok(entries) = fs::read_dir(base) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(cpu) = name.to_str().and_then(cpu_number) else {
                continue;
            };
            // cpu0 usually has no online switch
            let online: PathBuf = entry.path().join("online");
            if online.exists() {
                self.descriptor.insert(&cpu_online_capability(cpu), online);
            }
        }
    }
}

impl Driver for CpuControlDriver {
    fn descriptor(&self) -> &DriverDescriptor {
        &self.descriptor
    }

    fn descriptor_mut(&mut self) -> &mut DriverDescriptor {
        &mut self.descriptor
    }

    fn required(&self) -> &[&'static str] {
        &[caps::CPU_ONLINE]
    }

    fn init(&mut self) {
        let base = self.descriptor.base().to_path_buf();
        if !base.is_dir() {
            return;
        }

        for (capability, file) in [
            (caps::CPU_POSSIBLE, "possible"),
            (caps::CPU_PRESENT, "present"),
            (caps::CPU_ONLINE, "online"),
            (caps::SMT_CONTROL, "smt/control"),
        ] {
            let path = base.join(file);
            if path.exists() {
                self.descriptor.insert(capability, path);
            }
        }
        self.probe_cpus(&base);
        debug!("cpu_control: {} capabilities", self.descriptor.paths().len());
    }

    fn handle_kernel_event(&mut self, event: &KernelEvent) -> Option<DriverEventData> {
        if event.subsystem != CPU_SUBSYSTEM || !HOTPLUG_ACTIONS.contains(&event.action.as_str()) {
            return None;
        }

        let valid = reprobe(self);
        Some(DriverEventData {
            driver: drivers::CPU_CONTROL.to_string(),
            action: if valid { EventAction::Changed } else { EventAction::Removed },
            detail: format!("{} {}", event.sysname, event.action),
        })
    }
}
