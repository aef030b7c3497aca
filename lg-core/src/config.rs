//! Daemon configuration
//!
//! Stored as JSON in /etc/legionctl/daemon.json. Every field has a default,
//! so a missing file or a partial file is fine; a malformed file is not.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use lg_error::{LegionError, Result};
use lg_hw::wmi::{GUID_FAN_METHOD, GUID_GAMEZONE};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{ec, paths, timing, wmi};

/// Top-level daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Request/response socket path
    #[serde(default = "default_request_socket")]
    pub request_socket: PathBuf,

    /// Notification socket path
    #[serde(default = "default_notify_socket")]
    pub notify_socket: PathBuf,

    /// Filesystem roots, overridable for fixture trees
    #[serde(default)]
    pub roots: Roots,

    #[serde(default)]
    pub ec: EcRegisters,

    #[serde(default)]
    pub wmi: WmiConfig,

    #[serde(default)]
    pub rapl: RaplConfig,

    /// Kernel modules to modprobe at start
    #[serde(default)]
    pub load_modules: Vec<String>,

    /// Reactor timer period in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Roots {
    #[serde(default = "default_sys")]
    pub sys: PathBuf,
    #[serde(default = "default_proc")]
    pub proc: PathBuf,
    #[serde(default = "default_dev")]
    pub dev: PathBuf,
}

/// EC register addresses
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EcRegisters {
    #[serde(default = "default_kbd")]
    pub keyboard_backlight: u16,
    #[serde(default = "default_cpu_temp")]
    pub cpu_temp: u16,
    #[serde(default = "default_gpu_temp")]
    pub gpu_temp: u16,
    #[serde(default = "default_fan1")]
    pub fan1_rpm: u16,
    #[serde(default = "default_fan2")]
    pub fan2_rpm: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WmiConfig {
    /// WMI GUID -> ACPI method path
    #[serde(default = "default_wmi_methods")]
    pub methods: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RaplConfig {
    /// PCI slot probed before the bus scan; defaults to the usual thermal device slot
    #[serde(default)]
    pub slot: Option<String>,

    /// Limits written and locked at start
    #[serde(default)]
    pub startup_limits: Option<StartupLimits>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupLimits {
    pub pl1_mw: u32,
    pub pl2_mw: u32,
    #[serde(default)]
    pub pl4_mw: Option<u32>,
}

fn default_request_socket() -> PathBuf { PathBuf::from(paths::REQUEST_SOCKET) }
fn default_notify_socket() -> PathBuf { PathBuf::from(paths::NOTIFY_SOCKET) }
fn default_sys() -> PathBuf { PathBuf::from(paths::SYS_ROOT) }
fn default_proc() -> PathBuf { PathBuf::from(paths::PROC_ROOT) }
fn default_dev() -> PathBuf { PathBuf::from(paths::DEV_ROOT) }
fn default_kbd() -> u16 { ec::KEYBOARD_BACKLIGHT }
fn default_cpu_temp() -> u16 { ec::CPU_TEMP }
fn default_gpu_temp() -> u16 { ec::GPU_TEMP }
fn default_fan1() -> u16 { ec::FAN1_RPM }
fn default_fan2() -> u16 { ec::FAN2_RPM }
fn default_poll_interval() -> u64 { timing::POLL_INTERVAL_MS }

fn default_wmi_methods() -> BTreeMap<String, String> {
    BTreeMap::from([
        (GUID_GAMEZONE.to_string(), wmi::GAMEZONE_METHOD.to_string()),
        (GUID_FAN_METHOD.to_string(), wmi::FAN_METHOD.to_string()),
    ])
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            request_socket: default_request_socket(),
            notify_socket: default_notify_socket(),
            roots: Roots::default(),
            ec: EcRegisters::default(),
            wmi: WmiConfig::default(),
            rapl: RaplConfig::default(),
            load_modules: Vec::new(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl Default for Roots {
    fn default() -> Self {
        Self { sys: default_sys(), proc: default_proc(), dev: default_dev() }
    }
}

impl Default for EcRegisters {
    fn default() -> Self {
        Self {
            keyboard_backlight: default_kbd(),
            cpu_temp: default_cpu_temp(),
            gpu_temp: default_gpu_temp(),
            fan1_rpm: default_fan1(),
            fan2_rpm: default_fan2(),
        }
    }
}

impl Default for WmiConfig {
    fn default() -> Self {
        Self { methods: default_wmi_methods() }
    }
}

impl Roots {
    /// All three roots below one directory, as laid out by test fixtures
    pub fn under(base: &Path) -> Self {
        Self { sys: base.join("sys"), proc: base.join("proc"), dev: base.join("dev") }
    }
}

impl DaemonConfig {
    /// Load from `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .map_err(|e| LegionError::FileRead { path: path.to_path_buf(), source: e })?;
        let config: DaemonConfig = serde_json::from_str(&content)?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(LegionError::config("poll_interval_ms must be greater than 0"));
        }
        if self.request_socket == self.notify_socket {
            return Err(LegionError::config("request and notify sockets must differ"));
        }
        for (name, reg) in [
            ("keyboard_backlight", self.ec.keyboard_backlight),
            ("cpu_temp", self.ec.cpu_temp),
            ("gpu_temp", self.ec.gpu_temp),
            ("fan1_rpm", self.ec.fan1_rpm),
            ("fan2_rpm", self.ec.fan2_rpm),
        ] {
            if reg > 0xFF {
                return Err(LegionError::config(format!("ec.{} register 0x{:X} is above 0xFF", name, reg)));
            }
        }
        Ok(())
    }
}
