//! Low-level hardware access for legionctl
//!
//! Three independent protocols, each behind a small trait so the logic can be
//! exercised without the hardware:
//!
//! - [`ec`] - Embedded Controller byte protocol over the ACPI EC ports
//! - [`wmi`] - WMI method invocation with typed ACPI results
//! - [`rapl`] - RAPL power-limit registers in the processor thermal MMIO window

pub mod ec;
pub mod rapl;
pub mod wmi;

pub use ec::{DevPort, EmbeddedController, PortIo};
pub use rapl::{discover, MmioRegion, PciDevice, RaplEngine, RaplSnapshot, RegisterBlock};
pub use wmi::{AcpiCallBackend, AcpiMethod, AcpiObject, WmiBridge};
