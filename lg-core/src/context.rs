//! Daemon context and feature dispatch
//!
//! [`Context`] is created once at start and handed by reference to every
//! handler. [`FEATURES`] lists one row per readable data type; `get`/`set`
//! are the only dispatch functions. A feature whose hardware is missing
//! answers with a zeroed payload flagged `available = false` (get) or
//! [`SetStatus::NotAvailable`] (set).

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use lg_error::{LegionError, Result};
use lg_hw::rapl::{self, RaplEngine};
use lg_hw::wmi::{fan_method, gamezone, GUID_FAN_METHOD, GUID_GAMEZONE};
use lg_hw::{AcpiMethod, EmbeddedController, PortIo, RegisterBlock, WmiBridge};
use lg_protocol::{
    CpuPeakPowerLimitData, CpuPowerLimitsData, CpuTopologyData, DataType, FanCurveData,
    FanMaxSpeedData, KeyboardBacklightData, Payload, PowerProfile, PowerProfileData, SensorsData,
    SetStatus, SmartFanModeData, ToggleData, FAN_CURVE_POINTS,
};
use tracing::{debug, error, info, warn};

use crate::config::DaemonConfig;
use crate::constants::{caps, drivers, ec};
use crate::driver::KernelEvent;
use crate::hardware::{HardwareAccess, SystemHardware};
use crate::manager::DriverManager;
use crate::sysfs;

/// RAPL engine over whatever register block the hardware factory mapped
pub type RaplHandle = RaplEngine<Box<dyn RegisterBlock>>;

type Getter = fn(&Context) -> Result<Payload>;
type Setter = fn(&mut Context, &Payload) -> Result<()>;

/// One readable (and maybe writable) data type
pub struct Feature {
    pub data_type: DataType,
    pub get: Getter,
    pub set: Option<Setter>,
}

pub const FEATURES: &[Feature] = &[
    Feature { data_type: DataType::PowerProfile, get: get_power_profile, set: Some(set_power_profile) },
    Feature { data_type: DataType::SmartFanMode, get: get_smart_fan_mode, set: Some(set_smart_fan_mode) },
    Feature { data_type: DataType::FanCurve, get: get_fan_curve, set: Some(set_fan_curve) },
    Feature { data_type: DataType::FanFullSpeed, get: get_fan_full_speed, set: Some(set_fan_full_speed) },
    Feature { data_type: DataType::FanLock, get: get_fan_lock, set: Some(set_fan_lock) },
    Feature { data_type: DataType::FanMaxSpeed, get: get_fan_max_speed, set: None },
    Feature { data_type: DataType::Sensors, get: get_sensors, set: None },
    Feature { data_type: DataType::KeyboardBacklight, get: get_keyboard_backlight, set: Some(set_keyboard_backlight) },
    Feature { data_type: DataType::CpuPowerLimits, get: get_cpu_power_limits, set: Some(set_cpu_power_limits) },
    Feature { data_type: DataType::CpuPeakPowerLimit, get: get_cpu_peak_power_limit, set: Some(set_cpu_peak_power_limit) },
    Feature { data_type: DataType::CpuTopology, get: get_cpu_topology, set: None },
    Feature { data_type: DataType::CpuSmt, get: get_cpu_smt, set: Some(set_cpu_smt) },
];

pub fn find_feature(data_type: DataType) -> Option<&'static Feature> {
    FEATURES.iter().find(|f| f.data_type == data_type)
}

pub struct Context {
    config: DaemonConfig,
    manager: DriverManager,
    hardware: Box<dyn HardwareAccess>,
    rapl: Option<RaplHandle>,
    /// Drivers whose kernel events stay blocked until the next tick
    deferred_unblock: BTreeSet<String>,
}

impl Context {
    pub fn new(config: DaemonConfig, manager: DriverManager, hardware: Box<dyn HardwareAccess>) -> Self {
        Self {
            config,
            manager,
            hardware,
            rapl: None,
            deferred_unblock: BTreeSet::new(),
        }
    }

    /// Context on the real machine with every built-in driver registered
    pub fn from_config(config: DaemonConfig) -> Result<Self> {
        let manager = DriverManager::with_default_drivers(&config)?;
        Ok(Self::new(config, manager, Box::new(SystemHardware)))
    }

    /// Probe every driver and open the engines that depend on them
    pub fn init(&mut self) {
        self.manager.init_drivers();
        self.refresh_engines();
    }

    pub fn shutdown(&mut self) {
        self.rapl = None;
        self.manager.clean_drivers();
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn manager(&self) -> &DriverManager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut DriverManager {
        &mut self.manager
    }

    pub fn rapl(&self) -> Result<&RaplHandle> {
        self.rapl.as_ref().ok_or(LegionError::RaplNotFound)
    }

    /// Read one data type
    pub fn get(&self, data_type: DataType) -> Result<Payload> {
        let feature = find_feature(data_type)
            .ok_or_else(|| LegionError::protocol(format!("{} cannot be read", data_type)))?;

        match (feature.get)(self) {
            Ok(payload) => Ok(payload),
            Err(e) if e.is_not_available() => {
                debug!("{} not available: {}", data_type, e);
                Ok(Payload::unavailable(data_type))
            }
            Err(e) => Err(e),
        }
    }

    /// Write one data type
    pub fn set(&mut self, payload: &Payload) -> SetStatus {
        let data_type = payload.data_type();
        let Some(setter) = find_feature(data_type).and_then(|f| f.set) else {
            debug!("{} is read-only", data_type);
            return SetStatus::ReadOnly;
        };

        match setter(self, payload) {
            Ok(()) => SetStatus::Success,
            Err(e) => {
                let status = set_status_for(&e);
                match status {
                    SetStatus::NotAvailable => debug!("Set {}: {}", data_type, e),
                    _ if matches!(e, LegionError::RaplLocked { .. }) => error!("Set {}: {}", data_type, e),
                    _ => warn!("Set {}: {}", data_type, e),
                }
                status
            }
        }
    }

    /// Apply a batch of kernel events and follow driver availability
    pub fn handle_kernel_events(&mut self, events: &[KernelEvent]) -> Vec<Payload> {
        let published = self.manager.handle_kernel_events(events);
        self.refresh_engines();
        published
    }

    /// Periodic housekeeping from the reactor timer
    pub fn tick(&mut self) {
        for name in std::mem::take(&mut self.deferred_unblock) {
            self.manager.block_kernel_event(&name, false);
        }
    }

    /// Open or drop the RAPL mapping to match the processor_thermal driver
    pub fn refresh_engines(&mut self) {
        let resource = self
            .manager
            .get_descriptor(drivers::PROCESSOR_THERMAL)
            .and_then(|d| d.get(caps::MMIO).map(Path::to_path_buf));

        match resource {
            Ok(resource) => {
                let current = self.rapl.as_ref().map(|e| e.device().resource0());
                if current.as_deref() == Some(resource.as_path()) {
                    return;
                }
                match self.open_rapl(&resource) {
                    Ok(engine) => {
                        info!("RAPL engine on {}", engine.device().slot);
                        self.rapl = Some(engine);
                    }
                    Err(e) => {
                        warn!("RAPL engine unavailable: {}", e);
                        self.rapl = None;
                    }
                }
            }
            Err(_) => {
                if self.rapl.take().is_some() {
                    info!("RAPL engine released");
                }
            }
        }
    }

    fn open_rapl(&self, resource: &Path) -> Result<RaplHandle> {
        let slot_dir = resource.parent().ok_or(LegionError::RaplNotFound)?;
        let pci_root = slot_dir.parent().ok_or(LegionError::RaplNotFound)?;
        let slot = slot_dir
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or(LegionError::RaplNotFound)?;

        let device = rapl::probe_slot(pci_root, slot).ok_or(LegionError::RaplNotFound)?;
        let regs = self.hardware.map_registers(resource)?;
        Ok(RaplEngine::with_registers(device, regs))
    }

    /// Write and lock the configured RAPL limits
    ///
    /// A register already locked with other values aborts start-up.
    pub fn apply_startup_limits(&self) -> Result<()> {
        let Some(limits) = self.config.rapl.startup_limits else {
            return Ok(());
        };
        let Ok(engine) = self.rapl() else {
            warn!("RAPL startup limits configured but no MMIO engine was found");
            return Ok(());
        };

        engine.set_and_lock(limits.pl1_mw, limits.pl2_mw)?;
        if let Some(pl4_mw) = limits.pl4_mw {
            engine.set_pl4_and_lock(pl4_mw)?;
        }
        Ok(())
    }

    /// Path of a capability, looked up fresh from the registry
    fn path(&self, driver: &str, capability: &str) -> Result<PathBuf> {
        Ok(self.manager.get_descriptor(driver)?.get(capability)?.to_path_buf())
    }

    fn ec(&self) -> Result<EmbeddedController<Box<dyn PortIo>>> {
        let port = self.path(drivers::EC_PORT, caps::EC_PORT)?;
        Ok(EmbeddedController::new(self.hardware.port_io(&port)?))
    }

    fn wmi(&self) -> Result<WmiBridge<Box<dyn AcpiMethod>>> {
        let call = self.path(drivers::ACPI_CALL, caps::ACPI_CALL)?;
        Ok(WmiBridge::new(self.hardware.acpi(&call, &self.config.wmi.methods)))
    }
}

fn set_status_for(e: &LegionError) -> SetStatus {
    match e {
        e if e.is_not_available() => SetStatus::NotAvailable,
        LegionError::InvalidValue(_) | LegionError::RaplInvalid { .. } | LegionError::EcAddress(_) => {
            SetStatus::InvalidValue
        }
        _ => SetStatus::Failed,
    }
}

fn wrong_payload(payload: &Payload) -> LegionError {
    LegionError::protocol(format!("unexpected payload for {}", payload.data_type()))
}

// ============================================================================
// Platform profile
// ============================================================================

fn get_power_profile(ctx: &Context) -> Result<Payload> {
    let path = ctx.path(drivers::PLATFORM_PROFILE, caps::PROFILE)?;
    let name = sysfs::read_string(&path)?;
    let profile = PowerProfile::from_sysfs_name(&name)
        .ok_or_else(|| LegionError::parse(&path, format!("unknown profile '{}'", name)))?;
    Ok(Payload::PowerProfile(PowerProfileData { profile, available: true }))
}

fn set_power_profile(ctx: &mut Context, payload: &Payload) -> Result<()> {
    let Payload::PowerProfile(data) = payload else {
        return Err(wrong_payload(payload));
    };
    let path = ctx.path(drivers::PLATFORM_PROFILE, caps::PROFILE)?;
    let name = data.profile.sysfs_name();

    if let Ok(choices_path) = ctx.path(drivers::PLATFORM_PROFILE, caps::PROFILE_CHOICES) {
        let choices = sysfs::read_string(&choices_path)?;
        if !choices.split_whitespace().any(|c| c == name) {
            return Err(LegionError::invalid(format!("profile '{}' not in [{}]", name, choices)));
        }
    }

    sysfs::write_string(&path, name)?;
    info!("AUDIT: platform profile -> {}", name);
    Ok(())
}

// ============================================================================
// WMI
// ============================================================================

fn get_smart_fan_mode(ctx: &Context) -> Result<Payload> {
    let mode = ctx.wmi()?.invoke_u32(GUID_GAMEZONE, gamezone::GET_SMART_FAN_MODE, &[])?;
    Ok(Payload::SmartFanMode(SmartFanModeData { mode, available: true }))
}

fn set_smart_fan_mode(ctx: &mut Context, payload: &Payload) -> Result<()> {
    let Payload::SmartFanMode(data) = payload else {
        return Err(wrong_payload(payload));
    };
    if data.mode == 0 {
        return Err(LegionError::invalid("smart fan mode 0 is reserved"));
    }
    ctx.wmi()?.invoke_void(GUID_GAMEZONE, gamezone::SET_SMART_FAN_MODE, &data.mode.to_le_bytes())?;
    info!("AUDIT: smart fan mode -> {}", data.mode);
    Ok(())
}

fn get_fan_max_speed(ctx: &Context) -> Result<Payload> {
    let mut out = [0u8; 4];
    let copied = ctx.wmi()?.invoke_buffer(GUID_FAN_METHOD, fan_method::GET_MAX_SPEED, &[], &mut out)?;
    if copied < out.len() {
        return Err(LegionError::WmiCall(format!("max speed buffer has {} bytes, need {}", copied, out.len())));
    }
    Ok(Payload::FanMaxSpeed(FanMaxSpeedData {
        fan1_rpm: u16::from_le_bytes([out[0], out[1]]),
        fan2_rpm: u16::from_le_bytes([out[2], out[3]]),
        available: true,
    }))
}

// ============================================================================
// Legion platform driver
// ============================================================================

fn get_fan_curve(ctx: &Context) -> Result<Payload> {
    let path = ctx.path(drivers::LEGION, caps::FAN_CURVE)?;
    let points = sysfs::read_byte_list::<FAN_CURVE_POINTS>(&path)?;
    Ok(Payload::FanCurve(FanCurveData { points, available: true }))
}

fn set_fan_curve(ctx: &mut Context, payload: &Payload) -> Result<()> {
    let Payload::FanCurve(data) = payload else {
        return Err(wrong_payload(payload));
    };
    if data.points.iter().any(|p| *p > 100) {
        return Err(LegionError::invalid("fan curve points are percentages (0-100)"));
    }
    if data.points.windows(2).any(|w| w[1] < w[0]) {
        return Err(LegionError::invalid("fan curve must not decrease"));
    }

    let path = ctx.path(drivers::LEGION, caps::FAN_CURVE)?;
    sysfs::write_byte_list(&path, &data.points)?;
    info!("AUDIT: fan curve -> {:?}", data.points);
    Ok(())
}

fn get_toggle(ctx: &Context, driver: &str, capability: &str) -> Result<ToggleData> {
    let path = ctx.path(driver, capability)?;
    Ok(ToggleData { enabled: sysfs::read_bool(&path)?, available: true })
}

fn set_toggle(ctx: &Context, driver: &str, capability: &str, enabled: bool) -> Result<()> {
    let path = ctx.path(driver, capability)?;
    sysfs::write_bool(&path, enabled)?;
    info!("AUDIT: {}/{} -> {}", driver, capability, enabled);
    Ok(())
}

fn get_fan_full_speed(ctx: &Context) -> Result<Payload> {
    get_toggle(ctx, drivers::LEGION, caps::FAN_FULLSPEED).map(Payload::FanFullSpeed)
}

fn set_fan_full_speed(ctx: &mut Context, payload: &Payload) -> Result<()> {
    let Payload::FanFullSpeed(data) = payload else {
        return Err(wrong_payload(payload));
    };
    set_toggle(ctx, drivers::LEGION, caps::FAN_FULLSPEED, data.enabled)
}

fn get_fan_lock(ctx: &Context) -> Result<Payload> {
    get_toggle(ctx, drivers::LEGION, caps::FAN_LOCK).map(Payload::FanLock)
}

fn set_fan_lock(ctx: &mut Context, payload: &Payload) -> Result<()> {
    let Payload::FanLock(data) = payload else {
        return Err(wrong_payload(payload));
    };
    set_toggle(ctx, drivers::LEGION, caps::FAN_LOCK, data.enabled)
}

// ============================================================================
// Embedded controller
// ============================================================================

fn get_sensors(ctx: &Context) -> Result<Payload> {
    let regs = ctx.config.ec;
    let ec = ctx.ec()?;
    Ok(Payload::Sensors(SensorsData {
        cpu_temp: ec.ec_read(regs.cpu_temp)?,
        gpu_temp: ec.ec_read(regs.gpu_temp)?,
        fan1_rpm: ec.ec_read_u16(regs.fan1_rpm)?,
        fan2_rpm: ec.ec_read_u16(regs.fan2_rpm)?,
        available: true,
    }))
}

fn get_keyboard_backlight(ctx: &Context) -> Result<Payload> {
    let level = ctx.ec()?.ec_read(ctx.config.ec.keyboard_backlight)?;
    Ok(Payload::KeyboardBacklight(KeyboardBacklightData { level, available: true }))
}

fn set_keyboard_backlight(ctx: &mut Context, payload: &Payload) -> Result<()> {
    let Payload::KeyboardBacklight(data) = payload else {
        return Err(wrong_payload(payload));
    };
    if data.level > ec::KEYBOARD_BACKLIGHT_MAX {
        return Err(LegionError::invalid(format!(
            "backlight level {} above {}",
            data.level,
            ec::KEYBOARD_BACKLIGHT_MAX
        )));
    }
    ctx.ec()?.ec_write(ctx.config.ec.keyboard_backlight, data.level)?;
    info!("AUDIT: keyboard backlight -> {}", data.level);
    Ok(())
}

// ============================================================================
// RAPL
// ============================================================================

fn get_cpu_power_limits(ctx: &Context) -> Result<Payload> {
    let snap = ctx.rapl()?.snapshot();
    Ok(Payload::CpuPowerLimits(CpuPowerLimitsData {
        pl1_mw: snap.pl1_mw,
        pl2_mw: snap.pl2_mw,
        locked: snap.locked,
        available: true,
    }))
}

fn set_cpu_power_limits(ctx: &mut Context, payload: &Payload) -> Result<()> {
    let Payload::CpuPowerLimits(data) = payload else {
        return Err(wrong_payload(payload));
    };
    ctx.rapl()?.set_and_lock(data.pl1_mw, data.pl2_mw)
}

fn get_cpu_peak_power_limit(ctx: &Context) -> Result<Payload> {
    let snap = ctx.rapl()?.snapshot();
    Ok(Payload::CpuPeakPowerLimit(CpuPeakPowerLimitData {
        pl4_mw: snap.pl4_mw,
        locked: snap.pl4_locked,
        available: true,
    }))
}

fn set_cpu_peak_power_limit(ctx: &mut Context, payload: &Payload) -> Result<()> {
    let Payload::CpuPeakPowerLimit(data) = payload else {
        return Err(wrong_payload(payload));
    };
    ctx.rapl()?.set_pl4_and_lock(data.pl4_mw)
}

// ============================================================================
// CPU control
// ============================================================================

fn get_cpu_topology(ctx: &Context) -> Result<Payload> {
    let count = |cap: &str| -> Result<u16> { sysfs::read_cpu_count(&ctx.path(drivers::CPU_CONTROL, cap)?) };
    Ok(Payload::CpuTopology(CpuTopologyData {
        possible: count(caps::CPU_POSSIBLE)?,
        present: count(caps::CPU_PRESENT)?,
        online: count(caps::CPU_ONLINE)?,
        available: true,
    }))
}

fn smt_enabled(state: &str) -> Result<bool> {
    match state {
        "on" => Ok(true),
        "off" | "forceoff" => Ok(false),
        other => Err(LegionError::NotSupported(format!("SMT control reports '{}'", other))),
    }
}

fn get_cpu_smt(ctx: &Context) -> Result<Payload> {
    let path = ctx.path(drivers::CPU_CONTROL, caps::SMT_CONTROL)?;
    let enabled = smt_enabled(&sysfs::read_string(&path)?)?;
    Ok(Payload::CpuSmt(ToggleData { enabled, available: true }))
}

/// Toggling SMT takes sibling CPUs on/offline, which floods the cpu
/// subsystem with events. Those are blocked until the next tick and the
/// driver is re-probed once here instead.
fn set_cpu_smt(ctx: &mut Context, payload: &Payload) -> Result<()> {
    let Payload::CpuSmt(data) = payload else {
        return Err(wrong_payload(payload));
    };
    let path = ctx.path(drivers::CPU_CONTROL, caps::SMT_CONTROL)?;
    let current = sysfs::read_string(&path)?;
    if current == "forceoff" {
        return Err(LegionError::NotSupported("SMT is forced off by the kernel".into()));
    }
    if smt_enabled(&current)? == data.enabled {
        return Ok(());
    }

    ctx.manager.block_kernel_event(drivers::CPU_CONTROL, true);
    ctx.deferred_unblock.insert(drivers::CPU_CONTROL.to_string());

    sysfs::write_string(&path, if data.enabled { "on" } else { "off" })?;
    info!("AUDIT: SMT -> {}", if data.enabled { "on" } else { "off" });
    ctx.manager.reinit_driver(drivers::CPU_CONTROL)
}
