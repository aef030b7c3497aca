//! Processor thermal PCI device carrying the RAPL MMIO window

use lg_hw::rapl::{self, PciDevice};
use tracing::debug;

use super::{Driver, DriverDescriptor};
use crate::config::Roots;
use crate::constants::{caps, drivers};

pub struct ProcessorThermalDriver {
    descriptor: DriverDescriptor,
    slot: String,
    device: Option<PciDevice>,
}

impl ProcessorThermalDriver {
    /// `slot` is probed before the bus scan
    pub fn new(roots: &Roots, slot: Option<&str>) -> Self {
        let base = roots.sys.join(drivers::PCI_DEVICES_BASE);
        Self {
            descriptor: DriverDescriptor::new(drivers::PROCESSOR_THERMAL, base, None),
            slot: slot.unwrap_or(rapl::FAST_PATH_SLOT).to_string(),
            device: None,
        }
    }

    /// Device found by the last successful probe
    pub fn device(&self) -> Option<&PciDevice> {
        self.device.as_ref()
    }
}

impl Driver for ProcessorThermalDriver {
    fn descriptor(&self) -> &DriverDescriptor {
        &self.descriptor
    }

    fn descriptor_mut(&mut self) -> &mut DriverDescriptor {
        &mut self.descriptor
    }

    fn module(&self) -> Option<&str> {
        Some(drivers::PROCESSOR_THERMAL_MODULE)
    }

    fn required(&self) -> &[&'static str] {
        &[caps::MMIO]
    }

    fn init(&mut self) {
        let base = self.descriptor.base().to_path_buf();
        match rapl::discover_with_slot(&base, &self.slot) {
            Ok(device) => {
                let resource = device.resource0();
                if resource.exists() {
                    self.descriptor.insert(caps::MMIO, resource);
                    self.device = Some(device);
                } else {
                    debug!("processor_thermal: {} has no resource0", device.slot);
                }
            }
            Err(e) => debug!("processor_thermal: {}", e),
        }
    }

    fn clean(&mut self) {
        self.descriptor.clear();
        self.device = None;
    }
}
