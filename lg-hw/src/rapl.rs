//! RAPL power limits through the processor thermal device MMIO window
//!
//! Intel exposes a copy of the package power-limit registers in BAR0 of the
//! processor thermal PCI device. Two 64-bit registers are used:
//!
//! ```text
//! 0x59A0  PL1/PL2
//!   0..=14  PL1 value     15 PL1 enable   16 PL1 clamp   17..=23 PL1 time window
//!   32..=46 PL2 value     47 PL2 enable   48 PL2 clamp   49..=55 PL2 time window
//!   63      lock
//! 0x59B0  PL4
//!   0..=14  PL4 value     15 PL4 enable   31 PL4 lock
//! ```
//!
//! Power values are in units of 1/8 W. Once a lock bit is set the register
//! ignores writes until the next reset, so a locked register that disagrees
//! with what we want is reported as [`LegionError::RaplLocked`] instead of
//! being "retried".

use std::fs::{self, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use lg_error::{LegionError, Result};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// Offset of the PL1/PL2 register in the MMIO window
pub const PL_LIMIT_OFFSET: usize = 0x59A0;

/// Offset of the PL4 register in the MMIO window
pub const PL4_OFFSET: usize = 0x59B0;

/// Smallest window that contains both registers
pub const MIN_WINDOW_LEN: usize = PL4_OFFSET + 8;

/// Highest accepted power limit
pub const MAX_POWER_MW: u32 = 999_000;

/// Hardware units per watt
pub const UNITS_PER_WATT: u64 = 8;

const VALUE_MASK: u64 = 0x7FFF;

const PL1_ENABLE: u64 = 1 << 15;
const PL1_CLAMP: u64 = 1 << 16;
const PL1_TIME_WINDOW_SHIFT: u32 = 17;
const PL2_SHIFT: u32 = 32;
const PL2_ENABLE: u64 = 1 << 47;
const PL2_CLAMP: u64 = 1 << 48;
const PL2_TIME_WINDOW_SHIFT: u32 = 49;
const TIME_WINDOW_MASK: u64 = 0x7F;
const LIMIT_LOCK: u64 = 1 << 63;

const PL4_ENABLE: u64 = 1 << 15;
const PL4_LOCK: u64 = 1 << 31;

/// Intel PCI vendor id
pub const INTEL_VENDOR_ID: u16 = 0x8086;

/// Slot where the processor thermal device lives on every supported platform
pub const FAST_PATH_SLOT: &str = "0000:00:04.0";

/// Processor thermal device ids that carry the RAPL MMIO window
pub const THERMAL_DEVICE_IDS: &[u16] = &[
    0x1903, // Skylake
    0x8A03, // Ice Lake
    0x9A03, // Tiger Lake
    0x4E03, // Jasper Lake
    0x461D, // Alder Lake
    0xA71D, // Raptor Lake
    0x7D03, // Meteor Lake
    0xAD03, // Arrow Lake
    0x641D, // Lunar Lake
];

/// Convert milliwatts to 1/8 W hardware units, rounding to nearest
pub fn mw_to_units(mw: u32) -> u64 {
    (u64::from(mw) * UNITS_PER_WATT + 500) / 1000
}

/// Convert 1/8 W hardware units to milliwatts
pub fn units_to_mw(units: u64) -> u32 {
    ((units & VALUE_MASK) * 1000 / UNITS_PER_WATT) as u32
}

fn check_range(mw: u32) -> Result<()> {
    if mw > MAX_POWER_MW {
        return Err(LegionError::RaplInvalid { value_mw: mw });
    }
    Ok(())
}

/// Decoded view of the PL1/PL2 register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerLimitRegister {
    pub pl1_units: u64,
    pub pl1_enabled: bool,
    pub pl1_clamp: bool,
    pub pl1_time_window: u8,
    pub pl2_units: u64,
    pub pl2_enabled: bool,
    pub pl2_clamp: bool,
    pub pl2_time_window: u8,
    pub locked: bool,
}

impl From<u64> for PowerLimitRegister {
    fn from(raw: u64) -> Self {
        Self {
            pl1_units: raw & VALUE_MASK,
            pl1_enabled: raw & PL1_ENABLE != 0,
            pl1_clamp: raw & PL1_CLAMP != 0,
            pl1_time_window: ((raw >> PL1_TIME_WINDOW_SHIFT) & TIME_WINDOW_MASK) as u8,
            pl2_units: (raw >> PL2_SHIFT) & VALUE_MASK,
            pl2_enabled: raw & PL2_ENABLE != 0,
            pl2_clamp: raw & PL2_CLAMP != 0,
            pl2_time_window: ((raw >> PL2_TIME_WINDOW_SHIFT) & TIME_WINDOW_MASK) as u8,
            locked: raw & LIMIT_LOCK != 0,
        }
    }
}

/// All power-limit values read under one lock acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaplSnapshot {
    pub pl1_mw: u32,
    pub pl2_mw: u32,
    pub pl4_mw: u32,
    pub locked: bool,
    pub pl4_locked: bool,
}

/// 64-bit register access at byte offsets of a mapped window
pub trait RegisterBlock: Send {
    fn read_u64(&self, offset: usize) -> u64;
    fn write_u64(&mut self, offset: usize, value: u64);
}

impl<R: RegisterBlock + ?Sized> RegisterBlock for Box<R> {
    fn read_u64(&self, offset: usize) -> u64 {
        (**self).read_u64(offset)
    }

    fn write_u64(&mut self, offset: usize, value: u64) {
        (**self).write_u64(offset, value)
    }
}

/// Shared mapping of a PCI BAR resource file
pub struct MmioRegion {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the mapping is owned exclusively by this value and every access goes
// through the engine's mutex.
unsafe impl Send for MmioRegion {}

impl MmioRegion {
    /// Map a `resourceN` file read/write
    pub fn map(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| LegionError::FileRead { path: path.to_path_buf(), source: e })?;
        let len = file
            .metadata()
            .map_err(|e| LegionError::FileRead { path: path.to_path_buf(), source: e })?
            .len() as usize;

        if len < MIN_WINDOW_LEN {
            return Err(LegionError::invalid(format!(
                "MMIO window {} is {} bytes, need at least {}",
                path.display(),
                len,
                MIN_WINDOW_LEN
            )));
        }

        // SAFETY: fd is a valid open descriptor, len is the file size and the
        // result is checked against MAP_FAILED before use.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error().into());
        }

        debug!("Mapped {} ({} bytes)", path.display(), len);
        Ok(Self { ptr: ptr.cast::<u8>(), len })
    }

    fn check(&self, offset: usize) {
        assert!(offset % 8 == 0 && offset + 8 <= self.len, "MMIO access out of window: 0x{:X}", offset);
    }
}

impl RegisterBlock for MmioRegion {
    fn read_u64(&self, offset: usize) -> u64 {
        self.check(offset);
        // SAFETY: offset is aligned and inside the mapping (checked above).
        unsafe { std::ptr::read_volatile(self.ptr.add(offset).cast::<u64>()) }
    }

    fn write_u64(&mut self, offset: usize, value: u64) {
        self.check(offset);
        // SAFETY: offset is aligned and inside the mapping (checked above).
        unsafe { std::ptr::write_volatile(self.ptr.add(offset).cast::<u64>(), value) }
    }
}

impl Drop for MmioRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len come from a successful mmap and are unmapped exactly once.
        if unsafe { libc::munmap(self.ptr.cast(), self.len) } != 0 {
            warn!("munmap failed: {}", std::io::Error::last_os_error());
        }
    }
}

/// A PCI function matched against the thermal device allow-list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciDevice {
    pub slot: String,
    pub path: PathBuf,
    pub vendor: u16,
    pub device: u16,
}

impl PciDevice {
    /// BAR0 resource file
    pub fn resource0(&self) -> PathBuf {
        self.path.join("resource0")
    }
}

fn read_pci_id(path: &Path) -> Option<u16> {
    let raw = fs::read_to_string(path).ok()?;
    let raw = raw.trim();
    u16::from_str_radix(raw.strip_prefix("0x").unwrap_or(raw), 16).ok()
}

/// Check one slot against the allow-list
pub fn probe_slot(pci_root: &Path, slot: &str) -> Option<PciDevice> {
    let path = pci_root.join(slot);
    let vendor = read_pci_id(&path.join("vendor"))?;
    let device = read_pci_id(&path.join("device"))?;

    if vendor != INTEL_VENDOR_ID || !THERMAL_DEVICE_IDS.contains(&device) {
        return None;
    }
    Some(PciDevice {
        slot: slot.to_string(),
        path,
        vendor,
        device,
    })
}

/// Find the processor thermal device below `pci_root` (`/sys/bus/pci/devices`)
///
/// The well-known slot is probed first; the full bus is only scanned when it
/// does not hold an allow-listed device.
pub fn discover(pci_root: &Path) -> Result<PciDevice> {
    discover_with_slot(pci_root, FAST_PATH_SLOT)
}

/// Same as [`discover`] with a custom fast-path slot
pub fn discover_with_slot(pci_root: &Path, preferred_slot: &str) -> Result<PciDevice> {
    if let Some(device) = probe_slot(pci_root, preferred_slot) {
        debug!("RAPL device {:04x}:{:04x} at fast-path slot {}", device.vendor, device.device, device.slot);
        return Ok(device);
    }

    let mut slots: Vec<String> = fs::read_dir(pci_root)
        .map_err(|_| LegionError::RaplNotFound)?
        .flatten()
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    slots.sort();

    slots
        .iter()
        .filter(|slot| slot.as_str() != preferred_slot)
        .find_map(|slot| probe_slot(pci_root, slot))
        .map(|device| {
            debug!("RAPL device {:04x}:{:04x} found by bus scan at {}", device.vendor, device.device, device.slot);
            device
        })
        .ok_or(LegionError::RaplNotFound)
}

/// Power-limit engine bound to one mapped register window
pub struct RaplEngine<R: RegisterBlock = MmioRegion> {
    device: PciDevice,
    regs: Mutex<R>,
}

impl RaplEngine<MmioRegion> {
    /// Map BAR0 of a discovered device
    pub fn open(device: PciDevice) -> Result<Self> {
        let region = MmioRegion::map(&device.resource0())?;
        info!("RAPL MMIO engine ready on {}", device.slot);
        Ok(Self::with_registers(device, region))
    }
}

impl<R: RegisterBlock> RaplEngine<R> {
    pub fn with_registers(device: PciDevice, regs: R) -> Self {
        Self {
            device,
            regs: Mutex::new(regs),
        }
    }

    pub fn device(&self) -> &PciDevice {
        &self.device
    }

    pub fn read_pl1(&self) -> u32 {
        let regs = self.regs.lock();
        units_to_mw(regs.read_u64(PL_LIMIT_OFFSET))
    }

    pub fn read_pl2(&self) -> u32 {
        let regs = self.regs.lock();
        units_to_mw(regs.read_u64(PL_LIMIT_OFFSET) >> PL2_SHIFT)
    }

    pub fn read_pl4(&self) -> u32 {
        let regs = self.regs.lock();
        units_to_mw(regs.read_u64(PL4_OFFSET))
    }

    /// Lock bit of the PL1/PL2 register
    pub fn read_lock_state(&self) -> bool {
        let regs = self.regs.lock();
        regs.read_u64(PL_LIMIT_OFFSET) & LIMIT_LOCK != 0
    }

    /// Lock bit of the PL4 register
    pub fn read_pl4_lock_state(&self) -> bool {
        let regs = self.regs.lock();
        regs.read_u64(PL4_OFFSET) & PL4_LOCK != 0
    }

    pub fn read_limit_register(&self) -> PowerLimitRegister {
        let regs = self.regs.lock();
        PowerLimitRegister::from(regs.read_u64(PL_LIMIT_OFFSET))
    }

    pub fn snapshot(&self) -> RaplSnapshot {
        let regs = self.regs.lock();
        let limit = regs.read_u64(PL_LIMIT_OFFSET);
        let pl4 = regs.read_u64(PL4_OFFSET);
        RaplSnapshot {
            pl1_mw: units_to_mw(limit),
            pl2_mw: units_to_mw(limit >> PL2_SHIFT),
            pl4_mw: units_to_mw(pl4),
            locked: limit & LIMIT_LOCK != 0,
            pl4_locked: pl4 & PL4_LOCK != 0,
        }
    }

    /// Program PL1/PL2, enable both and set the lock bit in one write
    ///
    /// A register that is already locked with the same values is left alone;
    /// locked with different values is an invariant violation.
    pub fn set_and_lock(&self, pl1_mw: u32, pl2_mw: u32) -> Result<()> {
        check_range(pl1_mw)?;
        check_range(pl2_mw)?;
        let pl1 = mw_to_units(pl1_mw);
        let pl2 = mw_to_units(pl2_mw);

        let mut regs = self.regs.lock();
        let current = regs.read_u64(PL_LIMIT_OFFSET);

        if current & LIMIT_LOCK != 0 {
            let decoded = PowerLimitRegister::from(current);
            if decoded.pl1_units == pl1 && decoded.pl2_units == pl2 {
                debug!("PL1/PL2 already locked at {}/{} mW", pl1_mw, pl2_mw);
                return Ok(());
            }
            return Err(LegionError::RaplLocked {
                register: PL_LIMIT_OFFSET as u32,
                current_mw: vec![units_to_mw(decoded.pl1_units), units_to_mw(decoded.pl2_units)],
                requested_mw: vec![pl1_mw, pl2_mw],
            });
        }

        let value = (current & !(VALUE_MASK | (VALUE_MASK << PL2_SHIFT)))
            | pl1
            | (pl2 << PL2_SHIFT)
            | PL1_ENABLE
            | PL2_ENABLE
            | LIMIT_LOCK;
        regs.write_u64(PL_LIMIT_OFFSET, value);

        info!("AUDIT: RAPL PL1={} mW PL2={} mW locked on {}", pl1_mw, pl2_mw, self.device.slot);
        Ok(())
    }

    /// Program PL4, enable it and set its lock bit in one write
    pub fn set_pl4_and_lock(&self, pl4_mw: u32) -> Result<()> {
        check_range(pl4_mw)?;
        let pl4 = mw_to_units(pl4_mw);

        let mut regs = self.regs.lock();
        let current = regs.read_u64(PL4_OFFSET);

        if current & PL4_LOCK != 0 {
            let locked_units = current & VALUE_MASK;
            if locked_units == pl4 {
                debug!("PL4 already locked at {} mW", pl4_mw);
                return Ok(());
            }
            return Err(LegionError::RaplLocked {
                register: PL4_OFFSET as u32,
                current_mw: vec![units_to_mw(locked_units)],
                requested_mw: vec![pl4_mw],
            });
        }

        let value = (current & !VALUE_MASK) | pl4 | PL4_ENABLE | PL4_LOCK;
        regs.write_u64(PL4_OFFSET, value);

        info!("AUDIT: RAPL PL4={} mW locked on {}", pl4_mw, self.device.slot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[derive(Default)]
    struct MemoryRegisters {
        words: HashMap<usize, u64>,
        writes: usize,
    }

    impl RegisterBlock for MemoryRegisters {
        fn read_u64(&self, offset: usize) -> u64 {
            self.words.get(&offset).copied().unwrap_or(0)
        }

        fn write_u64(&mut self, offset: usize, value: u64) {
            self.writes += 1;
            self.words.insert(offset, value);
        }
    }

    fn test_device() -> PciDevice {
        PciDevice {
            slot: FAST_PATH_SLOT.to_string(),
            path: PathBuf::from("/nonexistent"),
            vendor: INTEL_VENDOR_ID,
            device: 0x9A03,
        }
    }

    fn engine_with(limit: u64, pl4: u64) -> RaplEngine<MemoryRegisters> {
        let mut regs = MemoryRegisters::default();
        regs.words.insert(PL_LIMIT_OFFSET, limit);
        regs.words.insert(PL4_OFFSET, pl4);
        RaplEngine::with_registers(test_device(), regs)
    }

    fn writes(engine: &RaplEngine<MemoryRegisters>) -> usize {
        engine.regs.lock().writes
    }

    #[test]
    fn test_unit_conversion() {
        assert_eq!(mw_to_units(45_000), 360);
        assert_eq!(units_to_mw(360), 45_000);
        assert_eq!(mw_to_units(62), 0);
        assert_eq!(mw_to_units(63), 1);
        assert_eq!(units_to_mw(1), 125);
        assert_eq!(mw_to_units(MAX_POWER_MW), 7992);
    }

    #[test]
    fn test_conversion_error_within_quantum() {
        for mw in (0..=MAX_POWER_MW).step_by(997) {
            let back = units_to_mw(mw_to_units(mw));
            assert!(back.abs_diff(mw) <= 125, "{} -> {}", mw, back);
        }
    }

    #[test]
    fn test_set_and_lock_single_write() {
        // Time windows and clamp bits must survive the read-modify-write
        let preserved = PL1_CLAMP | (0x1A << PL1_TIME_WINDOW_SHIFT) | (0x0B << PL2_TIME_WINDOW_SHIFT);
        let engine = engine_with(preserved | 100 | (200 << PL2_SHIFT), 0);

        engine.set_and_lock(55_000, 140_000).unwrap();
        assert_eq!(writes(&engine), 1);

        let reg = engine.read_limit_register();
        assert_eq!(reg.pl1_units, 440);
        assert_eq!(reg.pl2_units, 1120);
        assert!(reg.pl1_enabled && reg.pl2_enabled && reg.locked);
        assert!(reg.pl1_clamp);
        assert_eq!(reg.pl1_time_window, 0x1A);
        assert_eq!(reg.pl2_time_window, 0x0B);
        assert_eq!(engine.read_pl1(), 55_000);
        assert_eq!(engine.read_pl2(), 140_000);
        assert!(engine.read_lock_state());
    }

    #[test]
    fn test_set_and_lock_same_values_is_noop() {
        let engine = engine_with(0, 0);
        engine.set_and_lock(45_000, 90_000).unwrap();
        engine.set_and_lock(45_000, 90_000).unwrap();
        assert_eq!(writes(&engine), 1);
    }

    #[test]
    fn test_set_and_lock_different_values_after_lock() {
        let engine = engine_with(0, 0);
        engine.set_and_lock(45_000, 90_000).unwrap();

        let err = engine.set_and_lock(50_000, 90_000).unwrap_err();
        match err {
            LegionError::RaplLocked { register, current_mw, requested_mw } => {
                assert_eq!(register, PL_LIMIT_OFFSET as u32);
                assert_eq!(current_mw, vec![45_000, 90_000]);
                assert_eq!(requested_mw, vec![50_000, 90_000]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(writes(&engine), 1);
        assert_eq!(engine.read_pl1(), 45_000);
    }

    #[test]
    fn test_range_check_before_hardware() {
        let engine = engine_with(0, 0);
        assert!(matches!(
            engine.set_and_lock(999_001, 1000),
            Err(LegionError::RaplInvalid { value_mw: 999_001 })
        ));
        assert!(matches!(
            engine.set_pl4_and_lock(1_000_000),
            Err(LegionError::RaplInvalid { value_mw: 1_000_000 })
        ));
        assert_eq!(writes(&engine), 0);
        engine.set_and_lock(MAX_POWER_MW, MAX_POWER_MW).unwrap();
    }

    #[test]
    fn test_pl4_lock() {
        let engine = engine_with(0, 0xFFFF_0000_0000_0000);
        engine.set_pl4_and_lock(210_000).unwrap();

        assert_eq!(engine.read_pl4(), 210_000);
        assert!(engine.read_pl4_lock_state());
        assert!(!engine.read_lock_state());
        // Upper half untouched
        assert_eq!(engine.regs.lock().read_u64(PL4_OFFSET) >> 32, 0xFFFF_0000);

        engine.set_pl4_and_lock(210_000).unwrap();
        assert!(matches!(engine.set_pl4_and_lock(200_000), Err(LegionError::RaplLocked { .. })));
        assert_eq!(writes(&engine), 1);
    }

    #[test]
    fn test_snapshot() {
        let engine = engine_with(LIMIT_LOCK | 360 | (920 << PL2_SHIFT), PL4_LOCK | 1600);
        let snap = engine.snapshot();
        assert_eq!(
            snap,
            RaplSnapshot {
                pl1_mw: 45_000,
                pl2_mw: 115_000,
                pl4_mw: 200_000,
                locked: true,
                pl4_locked: true,
            }
        );
    }

    fn fake_pci(root: &Path, slot: &str, vendor: &str, device: &str) {
        let dir = root.join(slot);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("vendor"), format!("{}\n", vendor)).unwrap();
        fs::write(dir.join("device"), format!("{}\n", device)).unwrap();
    }

    #[test]
    fn test_discover_fast_path() {
        let dir = TempDir::new().unwrap();
        fake_pci(dir.path(), "0000:00:02.0", "0x8086", "0x9a03");
        fake_pci(dir.path(), FAST_PATH_SLOT, "0x8086", "0x461d");

        let device = discover(dir.path()).unwrap();
        assert_eq!(device.slot, FAST_PATH_SLOT);
        assert_eq!(device.device, 0x461D);
    }

    #[test]
    fn test_discover_falls_back_to_bus_scan() {
        let dir = TempDir::new().unwrap();
        fake_pci(dir.path(), FAST_PATH_SLOT, "0x8086", "0x1234");
        fake_pci(dir.path(), "0000:00:1f.0", "0x8086", "0x7a04");
        fake_pci(dir.path(), "0000:00:08.0", "0x8086", "0xa71d");

        let device = discover(dir.path()).unwrap();
        assert_eq!(device.slot, "0000:00:08.0");
        assert_eq!(device.resource0(), dir.path().join("0000:00:08.0").join("resource0"));
    }

    #[test]
    fn test_discover_rejects_other_vendors() {
        let dir = TempDir::new().unwrap();
        fake_pci(dir.path(), FAST_PATH_SLOT, "0x1022", "0x9a03");
        fake_pci(dir.path(), "0000:00:05.0", "0x10de", "0x461d");

        assert!(matches!(discover(dir.path()), Err(LegionError::RaplNotFound)));
    }

    #[test]
    fn test_discover_missing_bus() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            discover(&dir.path().join("missing")),
            Err(LegionError::RaplNotFound)
        ));
    }

    #[test]
    fn test_mmio_region_over_file() {
        let dir = TempDir::new().unwrap();
        let slot = dir.path().join(FAST_PATH_SLOT);
        fs::create_dir_all(&slot).unwrap();
        fs::write(slot.join("resource0"), vec![0u8; 0x8000]).unwrap();

        let device = PciDevice {
            slot: FAST_PATH_SLOT.to_string(),
            path: slot.clone(),
            vendor: INTEL_VENDOR_ID,
            device: 0x9A03,
        };
        {
            let engine = RaplEngine::open(device).unwrap();
            engine.set_and_lock(45_000, 90_000).unwrap();
            assert_eq!(engine.read_pl2(), 90_000);
        }

        let raw = fs::read(slot.join("resource0")).unwrap();
        let word = u64::from_le_bytes(raw[PL_LIMIT_OFFSET..PL_LIMIT_OFFSET + 8].try_into().unwrap());
        assert_eq!(word & VALUE_MASK, 360);
        assert_ne!(word & LIMIT_LOCK, 0);
    }

    #[test]
    fn test_mmio_region_too_small() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resource0");
        fs::write(&path, vec![0u8; 0x100]).unwrap();
        assert!(matches!(MmioRegion::map(&path), Err(LegionError::InvalidValue(_))));
    }
}
