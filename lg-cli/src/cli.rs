//! Command Line Interface
//!
//! Thin front end over the lg-core client library: every command is one or
//! more request/response exchanges, or a stream of notifications.

use std::path::PathBuf;

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand};
use lg_core::constants::paths;
use lg_core::{DaemonClient, NotificationClient};
use lg_protocol::data::FAN_CURVE_POINTS;
use lg_protocol::{
    CpuPeakPowerLimitData, CpuPowerLimitsData, DataType, FanCurveData, KeyboardBacklightData,
    Payload, PowerProfile, PowerProfileData, SetStatus, SmartFanModeData, ToggleData,
};
use tracing::debug;

#[derive(Parser)]
#[command(name = "legionctl")]
#[command(version)]
#[command(about = "legionctl - Lenovo Legion hardware control")]
#[command(long_about = "legionctl - Lenovo Legion hardware control

Talks to the legiond daemon over its Unix sockets. Reading and writing
hardware settings needs no privileges; the daemon does the privileged work.

FEATURES:
    power-profile          low-power, quiet, balanced, balanced-performance, performance
    smart-fan-mode         firmware fan mode (1-255)
    fan-curve              10 comma-separated duty points, non-decreasing, 0-100
    fan-full-speed         on/off
    fan-lock               on/off
    fan-max-speed          read-only
    sensors                read-only
    keyboard-backlight     0-2
    cpu-power-limits       PL1,PL2 in milliwatts
    cpu-peak-power-limit   PL4 in milliwatts
    cpu-topology           read-only
    cpu-smt                on/off

EXAMPLES:
    legionctl status                              Read every feature
    legionctl get sensors                         Temperatures and fan speeds
    legionctl set power-profile quiet
    legionctl set fan-curve 0,10,20,30,40,50,60,70,80,100
    legionctl set cpu-power-limits 45000,65000
    legionctl --json watch                        Stream hotplug events as JSON

ENVIRONMENT VARIABLES:
    LEGIONCTL_LOG=debug    Client diagnostics on stderr")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Request socket of the daemon
    #[arg(long, value_name = "PATH", default_value = paths::REQUEST_SOCKET)]
    pub socket: PathBuf,

    /// Notification socket of the daemon
    #[arg(long, value_name = "PATH", default_value = paths::NOTIFY_SOCKET)]
    pub notify_socket: PathBuf,

    /// Print payloads as JSON
    #[arg(long)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Read one feature
    Get {
        #[arg(value_parser = parse_feature)]
        feature: DataType,
    },

    /// Write one feature
    Set {
        #[arg(value_parser = parse_feature)]
        feature: DataType,
        /// New value, format depends on the feature
        value: String,
    },

    /// Print driver events until interrupted
    Watch,

    /// Read every readable feature
    Status,
}

fn parse_feature(s: &str) -> Result<DataType, String> {
    let feature: DataType = s.parse().map_err(|e: lg_error::LegionError| e.to_string())?;
    if feature.is_notification() {
        return Err(format!("{} is delivered by `watch`, not requested", feature));
    }
    Ok(feature)
}

/// Run the selected command; `Ok(false)` means the daemon refused a write
pub fn run_cli(cli: &Cli) -> anyhow::Result<bool> {
    match &cli.command {
        Commands::Get { feature } => cmd_get(cli, *feature).map(|_| true),
        Commands::Set { feature, value } => cmd_set(cli, *feature, value),
        Commands::Watch => cmd_watch(cli).map(|_| true),
        Commands::Status => cmd_status(cli).map(|_| true),
    }
}

fn connect(cli: &Cli) -> anyhow::Result<DaemonClient> {
    DaemonClient::connect(&cli.socket)
        .with_context(|| format!("connecting to {}", cli.socket.display()))
}

// ============================================================================
// Commands
// ============================================================================

fn cmd_get(cli: &Cli, feature: DataType) -> anyhow::Result<()> {
    let payload = connect(cli)?.get(feature)?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        println!("{}", describe(&payload));
    }
    Ok(())
}

fn cmd_set(cli: &Cli, feature: DataType, value: &str) -> anyhow::Result<bool> {
    let payload = parse_value(feature, value)?;
    debug!("Setting {} to {:?}", feature, payload);
    let status = connect(cli)?.set(payload)?;

    if cli.json {
        let out = serde_json::json!({ "feature": feature, "status": status });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else if status == SetStatus::Success {
        println!("{}: ok", feature);
    } else {
        eprintln!("{}: {}", feature, status_text(status));
    }
    Ok(status == SetStatus::Success)
}

fn cmd_watch(cli: &Cli) -> anyhow::Result<()> {
    let mut client = NotificationClient::connect(&cli.notify_socket)
        .with_context(|| format!("connecting to {}", cli.notify_socket.display()))?;
    loop {
        let event = client.wait_event()?;
        if cli.json {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            println!("{}: {}", event.data_type(), describe(&event));
        }
    }
}

fn cmd_status(cli: &Cli) -> anyhow::Result<()> {
    let mut client = connect(cli)?;
    let payloads = DataType::ALL
        .iter()
        .filter(|dt| !dt.is_notification())
        .map(|dt| client.get(*dt))
        .collect::<Result<Vec<_>, _>>()?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&payloads)?);
        return Ok(());
    }

    println!("Legion Status");
    println!("=============");
    println!();
    for payload in &payloads {
        println!("{:<22}{}", payload.data_type().name(), describe(payload));
    }
    Ok(())
}

// ============================================================================
// Value parsing
// ============================================================================

/// Build the payload to send for `set <feature> <value>`
pub fn parse_value(feature: DataType, value: &str) -> anyhow::Result<Payload> {
    let value = value.trim();
    let payload = match feature {
        DataType::PowerProfile => {
            let Some(profile) = PowerProfile::from_sysfs_name(value) else {
                bail!("unknown power profile '{}'", value);
            };
            Payload::PowerProfile(PowerProfileData { profile, available: true })
        }
        DataType::SmartFanMode => Payload::SmartFanMode(SmartFanModeData {
            mode: parse_number(value)?,
            available: true,
        }),
        DataType::FanCurve => {
            let values = parse_list::<u8>(value)?;
            let points: [u8; FAN_CURVE_POINTS] = values.as_slice().try_into().map_err(|_| {
                anyhow::anyhow!("fan curve needs {} points, got {}", FAN_CURVE_POINTS, values.len())
            })?;
            Payload::FanCurve(FanCurveData { points, available: true })
        }
        DataType::FanFullSpeed => Payload::FanFullSpeed(toggle(value)?),
        DataType::FanLock => Payload::FanLock(toggle(value)?),
        DataType::CpuSmt => Payload::CpuSmt(toggle(value)?),
        DataType::KeyboardBacklight => Payload::KeyboardBacklight(KeyboardBacklightData {
            level: parse_number(value)?,
            available: true,
        }),
        DataType::CpuPowerLimits => match parse_list::<u32>(value)?.as_slice() {
            [pl1_mw, pl2_mw] => Payload::CpuPowerLimits(CpuPowerLimitsData {
                pl1_mw: *pl1_mw,
                pl2_mw: *pl2_mw,
                locked: false,
                available: true,
            }),
            _ => bail!("cpu power limits are given as PL1,PL2 in milliwatts"),
        },
        DataType::CpuPeakPowerLimit => Payload::CpuPeakPowerLimit(CpuPeakPowerLimitData {
            pl4_mw: parse_number(value)?,
            locked: false,
            available: true,
        }),
        DataType::FanMaxSpeed | DataType::Sensors | DataType::CpuTopology => {
            bail!("{} is read-only", feature)
        }
        DataType::ModuleEvent | DataType::SubsystemEvent => {
            bail!("{} cannot be set", feature)
        }
    };
    Ok(payload)
}

fn parse_number<T: std::str::FromStr>(s: &str) -> anyhow::Result<T> {
    s.parse().map_err(|_| anyhow::anyhow!("'{}' is not a valid number", s))
}

fn parse_list<T: std::str::FromStr>(s: &str) -> anyhow::Result<Vec<T>> {
    s.split(',').map(|part| parse_number(part.trim())).collect()
}

fn toggle(s: &str) -> anyhow::Result<ToggleData> {
    let enabled = match s.to_ascii_lowercase().as_str() {
        "on" | "1" | "true" | "enable" => true,
        "off" | "0" | "false" | "disable" => false,
        other => bail!("expected on or off, got '{}'", other),
    };
    Ok(ToggleData { enabled, available: true })
}

// ============================================================================
// Output
// ============================================================================

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "on"
    } else {
        "off"
    }
}

fn locked_suffix(locked: bool) -> &'static str {
    if locked {
        " (locked)"
    } else {
        ""
    }
}

fn status_text(status: SetStatus) -> &'static str {
    match status {
        SetStatus::Success => "ok",
        SetStatus::NotAvailable => "not available on this machine",
        SetStatus::InvalidValue => "invalid value",
        SetStatus::ReadOnly => "read-only",
        SetStatus::Failed => "failed (see the daemon log)",
    }
}

/// One-line human rendering of a payload
pub fn describe(payload: &Payload) -> String {
    if !payload.is_available() {
        return "unavailable".to_string();
    }
    match payload {
        Payload::PowerProfile(d) => d.profile.sysfs_name().to_string(),
        Payload::SmartFanMode(d) => format!("mode {}", d.mode),
        Payload::FanCurve(d) => d
            .points
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(","),
        Payload::FanFullSpeed(d) | Payload::FanLock(d) | Payload::CpuSmt(d) => {
            on_off(d.enabled).to_string()
        }
        Payload::FanMaxSpeed(d) => format!("fan1 {} RPM, fan2 {} RPM", d.fan1_rpm, d.fan2_rpm),
        Payload::Sensors(d) => format!(
            "CPU {}°C, GPU {}°C, fan1 {} RPM, fan2 {} RPM",
            d.cpu_temp, d.gpu_temp, d.fan1_rpm, d.fan2_rpm
        ),
        Payload::KeyboardBacklight(d) => format!("level {}", d.level),
        Payload::CpuPowerLimits(d) => format!(
            "PL1 {} mW, PL2 {} mW{}",
            d.pl1_mw,
            d.pl2_mw,
            locked_suffix(d.locked)
        ),
        Payload::CpuPeakPowerLimit(d) => format!("PL4 {} mW{}", d.pl4_mw, locked_suffix(d.locked)),
        Payload::CpuTopology(d) => format!(
            "{} possible, {} present, {} online",
            d.possible, d.present, d.online
        ),
        Payload::ModuleEvent(e) | Payload::SubsystemEvent(e) => {
            if e.detail.is_empty() {
                format!("{} {}", e.driver, e.action)
            } else {
                format!("{} {} ({})", e.driver, e.action, e.detail)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lg_protocol::{DriverEventData, EventAction};

    #[test]
    fn test_parse_fan_curve() {
        let payload = parse_value(DataType::FanCurve, "0,10,20,30,40,50,60,70,80,100").unwrap();
        assert_eq!(
            payload,
            Payload::FanCurve(FanCurveData {
                points: [0, 10, 20, 30, 40, 50, 60, 70, 80, 100],
                available: true
            })
        );

        assert!(parse_value(DataType::FanCurve, "0,10,20").is_err());
        assert!(parse_value(DataType::FanCurve, "0,10,20,30,40,50,60,70,80,300").is_err());
    }

    #[test]
    fn test_parse_power_limits() {
        let payload = parse_value(DataType::CpuPowerLimits, "45000, 65000").unwrap();
        assert_eq!(
            payload,
            Payload::CpuPowerLimits(CpuPowerLimitsData {
                pl1_mw: 45000,
                pl2_mw: 65000,
                locked: false,
                available: true
            })
        );
        assert!(parse_value(DataType::CpuPowerLimits, "45000").is_err());

        let peak = parse_value(DataType::CpuPeakPowerLimit, "120000").unwrap();
        assert!(matches!(peak, Payload::CpuPeakPowerLimit(CpuPeakPowerLimitData { pl4_mw: 120000, .. })));
    }

    #[test]
    fn test_parse_profile_and_toggles() {
        assert_eq!(
            parse_value(DataType::PowerProfile, "balanced-performance").unwrap(),
            Payload::PowerProfile(PowerProfileData {
                profile: PowerProfile::BalancedPerformance,
                available: true
            })
        );
        assert!(parse_value(DataType::PowerProfile, "turbo").is_err());

        assert_eq!(
            parse_value(DataType::CpuSmt, "OFF").unwrap(),
            Payload::CpuSmt(ToggleData { enabled: false, available: true })
        );
        assert_eq!(
            parse_value(DataType::FanLock, "1").unwrap(),
            Payload::FanLock(ToggleData { enabled: true, available: true })
        );
        assert!(parse_value(DataType::FanFullSpeed, "maybe").is_err());
    }

    #[test]
    fn test_read_only_features_rejected() {
        for feature in [DataType::Sensors, DataType::FanMaxSpeed, DataType::CpuTopology] {
            assert!(parse_value(feature, "1").is_err());
        }
        assert!(parse_feature("module-event").is_err());
        assert!(parse_feature("fan-speed").is_err());
        assert_eq!(parse_feature("cpu-smt").unwrap(), DataType::CpuSmt);
    }

    #[test]
    fn test_describe() {
        assert_eq!(describe(&Payload::unavailable(DataType::Sensors)), "unavailable");
        assert_eq!(
            describe(&Payload::CpuPowerLimits(CpuPowerLimitsData {
                pl1_mw: 45000,
                pl2_mw: 65000,
                locked: true,
                available: true
            })),
            "PL1 45000 mW, PL2 65000 mW (locked)"
        );
        assert_eq!(
            describe(&Payload::ModuleEvent(DriverEventData {
                driver: "legion".to_string(),
                action: EventAction::Removed,
                detail: "module legion_laptop".to_string(),
            })),
            "legion removed (module legion_laptop)"
        );
    }

    #[test]
    fn test_cli_parses_global_flags() {
        let cli = Cli::try_parse_from(["legionctl", "--json", "--socket", "/tmp/x.sock", "get", "sensors"]).unwrap();
        assert!(cli.json);
        assert_eq!(cli.socket, PathBuf::from("/tmp/x.sock"));
        assert!(matches!(cli.command, Commands::Get { feature: DataType::Sensors }));
    }
}
