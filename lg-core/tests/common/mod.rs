//! Shared fixtures: a fake machine under a temp dir and in-memory hardware

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use lg_core::constants::drivers;
use lg_core::{Context, DaemonConfig, DriverManager, HardwareAccess, Roots};
use lg_error::{LegionError, Result};
use lg_hw::ec::{EC_COMMAND_PORT, EC_DATA_PORT, RD_EC, STATUS_OBF, WR_EC};
use lg_hw::rapl::FAST_PATH_SLOT;
use lg_hw::{AcpiMethod, AcpiObject, PortIo, RegisterBlock};
use tempfile::TempDir;

pub const FAN_CURVE: &str = "30,40,50,60,70,80,90,95,99,100";

// ============================================================================
// Fixture tree
// ============================================================================

/// A machine with every supported surface present
pub struct Machine {
    pub dir: TempDir,
    pub roots: Roots,
}

impl Machine {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let roots = Roots::under(dir.path());
        let machine = Self { dir, roots };

        machine.write(&machine.legion_dir().join("fancurve"), FAN_CURVE);
        machine.write(&machine.legion_dir().join("fan_fullspeed"), "0");
        machine.write(&machine.legion_dir().join("lockfancontroller"), "1");

        let acpi = machine.roots.sys.join(drivers::PLATFORM_PROFILE_BASE);
        machine.write(&acpi.join("platform_profile"), "balanced");
        machine.write(&acpi.join("platform_profile_choices"), "low-power quiet balanced performance");

        let cpu = machine.cpu_dir();
        machine.write(&cpu.join("possible"), "0-15");
        machine.write(&cpu.join("present"), "0-15");
        machine.write(&cpu.join("online"), "0-7");
        machine.write(&cpu.join("smt/control"), "on");
        machine.write(&cpu.join("cpu1/online"), "1");

        machine.write(&machine.roots.proc.join("acpi/call"), "");
        machine.write(&machine.roots.dev.join("port"), "");

        let slot = machine.pci_slot_dir();
        machine.write(&slot.join("vendor"), "0x8086");
        machine.write(&slot.join("device"), "0xa71d");
        machine.write(&slot.join("resource0"), "");

        machine
    }

    pub fn write(&self, path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    pub fn read(&self, path: &Path) -> String {
        fs::read_to_string(path).unwrap().trim().to_string()
    }

    pub fn legion_dir(&self) -> PathBuf {
        self.roots.sys.join(drivers::LEGION_BASE)
    }

    pub fn cpu_dir(&self) -> PathBuf {
        self.roots.sys.join(drivers::CPU_CONTROL_BASE)
    }

    pub fn pci_slot_dir(&self) -> PathBuf {
        self.roots.sys.join(drivers::PCI_DEVICES_BASE).join(FAST_PATH_SLOT)
    }

    /// Simulate a module unload taking its sysfs directory with it
    pub fn remove_legion(&self) {
        fs::remove_dir_all(self.legion_dir()).unwrap();
    }

    pub fn config(&self) -> DaemonConfig {
        DaemonConfig {
            roots: self.roots.clone(),
            request_socket: self.dir.path().join("request.sock"),
            notify_socket: self.dir.path().join("notify.sock"),
            ..DaemonConfig::default()
        }
    }

    /// Initialized context over this tree and the given fake hardware
    pub fn context(&self, hardware: &FakeHardware) -> Context {
        let config = self.config();
        let manager = DriverManager::with_default_drivers(&config).unwrap();
        let mut ctx = Context::new(config, manager, Box::new(hardware.clone()));
        ctx.init();
        ctx
    }
}

// ============================================================================
// Embedded controller
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum EcState {
    Idle,
    ReadAddress,
    WriteAddress,
    WriteValue(u8),
}

/// Port-level EC state machine backed by a 256-byte register file
pub struct FakeEc {
    ram: Arc<Mutex<[u8; 256]>>,
    state: Mutex<EcState>,
    output: Mutex<Option<u8>>,
}

impl FakeEc {
    pub fn new(ram: Arc<Mutex<[u8; 256]>>) -> Self {
        Self {
            ram,
            state: Mutex::new(EcState::Idle),
            output: Mutex::new(None),
        }
    }
}

impl PortIo for FakeEc {
    fn inb(&self, port: u16) -> io::Result<u8> {
        match port {
            EC_COMMAND_PORT => Ok(if self.output.lock().unwrap().is_some() { STATUS_OBF } else { 0 }),
            EC_DATA_PORT => Ok(self.output.lock().unwrap().take().unwrap_or(0xFF)),
            _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "unexpected port")),
        }
    }

    fn outb(&self, port: u16, value: u8) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        *state = match (port, *state) {
            (EC_COMMAND_PORT, _) if value == RD_EC => EcState::ReadAddress,
            (EC_COMMAND_PORT, _) if value == WR_EC => EcState::WriteAddress,
            (EC_DATA_PORT, EcState::ReadAddress) => {
                *self.output.lock().unwrap() = Some(self.ram.lock().unwrap()[usize::from(value)]);
                EcState::Idle
            }
            (EC_DATA_PORT, EcState::WriteAddress) => EcState::WriteValue(value),
            (EC_DATA_PORT, EcState::WriteValue(addr)) => {
                self.ram.lock().unwrap()[usize::from(addr)] = value;
                EcState::Idle
            }
            _ => return Err(io::Error::new(io::ErrorKind::InvalidInput, "unexpected EC command")),
        };
        Ok(())
    }
}

// ============================================================================
// ACPI
// ============================================================================

/// Canned ACPI replies keyed by (GUID, method id); records every call
#[derive(Clone, Default)]
pub struct FakeAcpi {
    replies: Arc<Mutex<HashMap<(String, u32), AcpiObject>>>,
    calls: Arc<Mutex<Vec<(String, u32, Vec<u8>)>>>,
}

impl FakeAcpi {
    pub fn reply(&self, guid: &str, method_id: u32, object: AcpiObject) {
        self.replies.lock().unwrap().insert((guid.to_string(), method_id), object);
    }

    pub fn calls(&self) -> Vec<(String, u32, Vec<u8>)> {
        self.calls.lock().unwrap().clone()
    }
}

impl AcpiMethod for FakeAcpi {
    fn evaluate(&self, guid: &str, method_id: u32, args: &[u8]) -> Result<AcpiObject> {
        self.calls.lock().unwrap().push((guid.to_string(), method_id, args.to_vec()));
        self.replies
            .lock()
            .unwrap()
            .get(&(guid.to_string(), method_id))
            .cloned()
            .ok_or_else(|| LegionError::WmiCall(format!("no reply for {} 0x{:X}", guid, method_id)))
    }
}

// ============================================================================
// MMIO
// ============================================================================

#[derive(Clone, Default)]
pub struct MemoryRegisters {
    cells: Arc<Mutex<HashMap<usize, u64>>>,
}

impl MemoryRegisters {
    pub fn get(&self, offset: usize) -> u64 {
        self.cells.lock().unwrap().get(&offset).copied().unwrap_or(0)
    }

    pub fn set(&self, offset: usize, value: u64) {
        self.cells.lock().unwrap().insert(offset, value);
    }
}

impl RegisterBlock for MemoryRegisters {
    fn read_u64(&self, offset: usize) -> u64 {
        self.get(offset)
    }

    fn write_u64(&mut self, offset: usize, value: u64) {
        self.set(offset, value);
    }
}

// ============================================================================
// Hardware factory
// ============================================================================

#[derive(Clone)]
pub struct FakeHardware {
    pub ec_ram: Arc<Mutex<[u8; 256]>>,
    pub acpi: FakeAcpi,
    pub registers: MemoryRegisters,
    /// Resource files the daemon asked to map
    pub mapped: Arc<Mutex<Vec<PathBuf>>>,
}

impl FakeHardware {
    pub fn new() -> Self {
        Self {
            ec_ram: Arc::new(Mutex::new([0u8; 256])),
            acpi: FakeAcpi::default(),
            registers: MemoryRegisters::default(),
            mapped: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn ec_set(&self, register: u8, value: u8) {
        self.ec_ram.lock().unwrap()[usize::from(register)] = value;
    }

    pub fn ec_get(&self, register: u8) -> u8 {
        self.ec_ram.lock().unwrap()[usize::from(register)]
    }
}

impl HardwareAccess for FakeHardware {
    fn port_io(&self, _port_path: &Path) -> Result<Box<dyn PortIo>> {
        Ok(Box::new(FakeEc::new(self.ec_ram.clone())))
    }

    fn acpi(&self, _call_path: &Path, _methods: &BTreeMap<String, String>) -> Box<dyn AcpiMethod> {
        Box::new(self.acpi.clone())
    }

    fn map_registers(&self, resource: &Path) -> Result<Box<dyn RegisterBlock>> {
        self.mapped.lock().unwrap().push(resource.to_path_buf());
        Ok(Box::new(self.registers.clone()))
    }
}
