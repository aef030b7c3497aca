//! Opening the hardware backends behind a resolved descriptor path

use std::collections::BTreeMap;
use std::path::Path;

use lg_error::Result;
use lg_hw::{AcpiCallBackend, AcpiMethod, DevPort, MmioRegion, PortIo, RegisterBlock};

/// Factory for the three hardware seams
///
/// Every feature access resolves its path through the driver registry first
/// and then asks this factory for a backend bound to that path.
pub trait HardwareAccess {
    fn port_io(&self, port_path: &Path) -> Result<Box<dyn PortIo>>;
    fn acpi(&self, call_path: &Path, methods: &BTreeMap<String, String>) -> Box<dyn AcpiMethod>;
    fn map_registers(&self, resource: &Path) -> Result<Box<dyn RegisterBlock>>;
}

/// The real machine: `/dev/port`, `acpi_call` and an mmap of `resource0`
pub struct SystemHardware;

impl HardwareAccess for SystemHardware {
    fn port_io(&self, port_path: &Path) -> Result<Box<dyn PortIo>> {
        Ok(Box::new(DevPort::open(port_path)?))
    }

    fn acpi(&self, call_path: &Path, methods: &BTreeMap<String, String>) -> Box<dyn AcpiMethod> {
        let methods = methods.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        Box::new(AcpiCallBackend::new(call_path, methods))
    }

    fn map_registers(&self, resource: &Path) -> Result<Box<dyn RegisterBlock>> {
        Ok(Box::new(MmioRegion::map(resource)?))
    }
}
