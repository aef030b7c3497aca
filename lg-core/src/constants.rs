//! Constants and configuration defaults for legionctl
//!
//! Every hardware constant, path and timing budget used outside the `lg-hw`
//! protocol modules lives here. Add new magic numbers here first.

use std::time::Duration;

/// Filesystem defaults
pub mod paths {
    /// Daemon configuration file
    pub const CONFIG_FILE: &str = "/etc/legionctl/daemon.json";

    /// Request/response socket
    pub const REQUEST_SOCKET: &str = "/run/legionctl.sock";

    /// Notification socket
    pub const NOTIFY_SOCKET: &str = "/run/legionctl-notify.sock";

    /// PID file guarding against a second daemon instance
    pub const PID_FILE: &str = "/run/legiond.pid";

    /// Present when journald is running
    pub const JOURNALD_SOCKET: &str = "/run/systemd/journal/socket";

    pub const SYS_ROOT: &str = "/sys";
    pub const PROC_ROOT: &str = "/proc";
    pub const DEV_ROOT: &str = "/dev";

    /// modprobe binary used for `load_modules`
    pub const MODPROBE: &str = "/sbin/modprobe";
}

/// Driver names, backing modules and their base paths relative to a root
pub mod drivers {
    pub const LEGION: &str = "legion";
    pub const LEGION_MODULE: &str = "legion_laptop";
    pub const LEGION_BASE: &str = "bus/platform/drivers/legion/PNP0C09:00";

    pub const PLATFORM_PROFILE: &str = "platform_profile";
    pub const PLATFORM_PROFILE_MODULE: &str = "platform_profile";
    pub const PLATFORM_PROFILE_BASE: &str = "firmware/acpi";

    pub const CPU_CONTROL: &str = "cpu_control";
    pub const CPU_CONTROL_BASE: &str = "devices/system/cpu";

    pub const ACPI_CALL: &str = "acpi_call";
    pub const ACPI_CALL_MODULE: &str = "acpi_call";
    pub const ACPI_CALL_BASE: &str = "acpi";

    pub const EC_PORT: &str = "ec_port";

    pub const PROCESSOR_THERMAL: &str = "processor_thermal";
    pub const PROCESSOR_THERMAL_MODULE: &str = "processor_thermal_device_pci";
    pub const PCI_DEVICES_BASE: &str = "bus/pci/devices";

    /// uevent subsystem carrying module load/unload
    pub const MODULE_SUBSYSTEM: &str = "module";
}

/// Capability names exposed by the driver descriptors
pub mod caps {
    pub const FAN_CURVE: &str = "fan_curve";
    pub const FAN_FULLSPEED: &str = "fan_fullspeed";
    pub const FAN_LOCK: &str = "fan_lock";
    pub const PROFILE: &str = "profile";
    pub const PROFILE_CHOICES: &str = "choices";
    pub const CPU_POSSIBLE: &str = "possible";
    pub const CPU_PRESENT: &str = "present";
    pub const CPU_ONLINE: &str = "online";
    pub const SMT_CONTROL: &str = "smt_control";
    pub const ACPI_CALL: &str = "call";
    pub const EC_PORT: &str = "port";
    pub const MMIO: &str = "mmio";
}

/// Default EC register map
pub mod ec {
    pub const KEYBOARD_BACKLIGHT: u16 = 0x9E;
    pub const CPU_TEMP: u16 = 0xB0;
    pub const GPU_TEMP: u16 = 0xB1;
    /// Low byte; the high byte follows
    pub const FAN1_RPM: u16 = 0xC0;
    pub const FAN2_RPM: u16 = 0xC2;
    /// Highest backlight level accepted by the EC
    pub const KEYBOARD_BACKLIGHT_MAX: u8 = 2;
}

/// ACPI method paths reached through acpi_call, keyed by WMI GUID
pub mod wmi {
    pub const GAMEZONE_METHOD: &str = "\\_SB.GZFD.WMAA";
    pub const FAN_METHOD: &str = "\\_SB.GZFD.WMAE";
}

/// IPC limits
pub mod ipc {
    /// Notifications kept while no client is bound
    pub const NOTIFY_QUEUE_LEN: usize = 32;

    /// World-accessible sockets
    pub const SOCKET_MODE: u32 = 0o666;

    /// Process umask applied before anything is created
    pub const UMASK: u32 = 0o077;
}

/// Timing
pub mod timing {
    use super::Duration;

    /// Default reactor timer period
    pub const POLL_INTERVAL_MS: u64 = 1000;

    /// How long a client waits for a response to start arriving
    pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(2);

    /// Sleep between two idle polls of a client socket
    pub const WATCH_INTERVAL: Duration = Duration::from_millis(50);
}

/// Logging
pub mod logging {
    pub const DAEMON_ENV: &str = "LEGIOND_LOG";
    pub const DAEMON_DEFAULT: &str = "info";
    pub const CLI_ENV: &str = "LEGIONCTL_LOG";
    pub const CLI_DEFAULT: &str = "warn";
    pub const SYSLOG_IDENTIFIER: &str = "legiond";
}
