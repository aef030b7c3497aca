//! Data types and their fixed-layout payloads
//!
//! Every payload ends with an `available` byte except the two event types,
//! which are pushed only when something happened and so are always "available".

use std::fmt;
use std::str::FromStr;

use lg_error::{LegionError, Result};
use serde::{Deserialize, Serialize};

use crate::codec::{Reader, Writer};

/// Maximum bytes of the driver name carried in an event
pub const EVENT_DRIVER_LEN: usize = 32;

/// Maximum bytes of the free-form detail carried in an event
pub const EVENT_DETAIL_LEN: usize = 64;

/// Number of points in a fan curve
pub const FAN_CURVE_POINTS: usize = 10;

/// Closed enumeration of every value the daemon can read, write or push
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum DataType {
    PowerProfile = 0,
    SmartFanMode = 1,
    FanCurve = 2,
    FanFullSpeed = 3,
    FanLock = 4,
    FanMaxSpeed = 5,
    Sensors = 6,
    KeyboardBacklight = 7,
    CpuPowerLimits = 8,
    CpuPeakPowerLimit = 9,
    CpuTopology = 10,
    CpuSmt = 11,
    ModuleEvent = 12,
    SubsystemEvent = 13,
}

impl DataType {
    pub const ALL: [DataType; 14] = [
        DataType::PowerProfile,
        DataType::SmartFanMode,
        DataType::FanCurve,
        DataType::FanFullSpeed,
        DataType::FanLock,
        DataType::FanMaxSpeed,
        DataType::Sensors,
        DataType::KeyboardBacklight,
        DataType::CpuPowerLimits,
        DataType::CpuPeakPowerLimit,
        DataType::CpuTopology,
        DataType::CpuSmt,
        DataType::ModuleEvent,
        DataType::SubsystemEvent,
    ];

    /// Exact payload size in bytes; the wire carries no length field
    pub fn payload_len(self) -> usize {
        match self {
            DataType::PowerProfile => 2,
            DataType::SmartFanMode => 5,
            DataType::FanCurve => FAN_CURVE_POINTS + 1,
            DataType::FanFullSpeed | DataType::FanLock | DataType::CpuSmt => 2,
            DataType::FanMaxSpeed => 5,
            DataType::Sensors => 7,
            DataType::KeyboardBacklight => 2,
            DataType::CpuPowerLimits => 10,
            DataType::CpuPeakPowerLimit => 6,
            DataType::CpuTopology => 7,
            DataType::ModuleEvent | DataType::SubsystemEvent => {
                EVENT_DRIVER_LEN + 1 + EVENT_DETAIL_LEN
            }
        }
    }

    /// Event types are only ever pushed by the notifier
    pub fn is_notification(self) -> bool {
        matches!(self, DataType::ModuleEvent | DataType::SubsystemEvent)
    }

    pub fn name(self) -> &'static str {
        match self {
            DataType::PowerProfile => "power-profile",
            DataType::SmartFanMode => "smart-fan-mode",
            DataType::FanCurve => "fan-curve",
            DataType::FanFullSpeed => "fan-full-speed",
            DataType::FanLock => "fan-lock",
            DataType::FanMaxSpeed => "fan-max-speed",
            DataType::Sensors => "sensors",
            DataType::KeyboardBacklight => "keyboard-backlight",
            DataType::CpuPowerLimits => "cpu-power-limits",
            DataType::CpuPeakPowerLimit => "cpu-peak-power-limit",
            DataType::CpuTopology => "cpu-topology",
            DataType::CpuSmt => "cpu-smt",
            DataType::ModuleEvent => "module-event",
            DataType::SubsystemEvent => "subsystem-event",
        }
    }
}

impl TryFrom<u8> for DataType {
    type Error = LegionError;

    fn try_from(value: u8) -> Result<Self> {
        DataType::ALL
            .get(usize::from(value))
            .copied()
            .ok_or(LegionError::UnknownDataType(value))
    }
}

impl FromStr for DataType {
    type Err = LegionError;

    fn from_str(s: &str) -> Result<Self> {
        DataType::ALL
            .iter()
            .copied()
            .find(|dt| dt.name() == s)
            .ok_or_else(|| LegionError::invalid(format!("unknown feature '{}'", s)))
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of a `RequestSet`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SetStatus {
    Success = 0,
    NotAvailable = 1,
    InvalidValue = 2,
    ReadOnly = 3,
    Failed = 4,
}

impl TryFrom<u8> for SetStatus {
    type Error = LegionError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SetStatus::Success),
            1 => Ok(SetStatus::NotAvailable),
            2 => Ok(SetStatus::InvalidValue),
            3 => Ok(SetStatus::ReadOnly),
            4 => Ok(SetStatus::Failed),
            other => Err(LegionError::protocol(format!("invalid set status {}", other))),
        }
    }
}

/// Values of the ACPI platform profile
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum PowerProfile {
    LowPower = 0,
    Quiet = 1,
    #[default]
    Balanced = 2,
    BalancedPerformance = 3,
    Performance = 4,
    Custom = 5,
}

impl PowerProfile {
    /// Name used by the kernel's `platform_profile` attribute
    pub fn sysfs_name(self) -> &'static str {
        match self {
            PowerProfile::LowPower => "low-power",
            PowerProfile::Quiet => "quiet",
            PowerProfile::Balanced => "balanced",
            PowerProfile::BalancedPerformance => "balanced-performance",
            PowerProfile::Performance => "performance",
            PowerProfile::Custom => "custom",
        }
    }

    pub fn from_sysfs_name(name: &str) -> Option<Self> {
        [
            PowerProfile::LowPower,
            PowerProfile::Quiet,
            PowerProfile::Balanced,
            PowerProfile::BalancedPerformance,
            PowerProfile::Performance,
            PowerProfile::Custom,
        ]
        .into_iter()
        .find(|p| p.sysfs_name() == name)
    }
}

impl TryFrom<u8> for PowerProfile {
    type Error = LegionError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PowerProfile::LowPower),
            1 => Ok(PowerProfile::Quiet),
            2 => Ok(PowerProfile::Balanced),
            3 => Ok(PowerProfile::BalancedPerformance),
            4 => Ok(PowerProfile::Performance),
            5 => Ok(PowerProfile::Custom),
            other => Err(LegionError::protocol(format!("invalid power profile {}", other))),
        }
    }
}

/// What happened to a driver
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum EventAction {
    #[default]
    Added = 0,
    Removed = 1,
    Changed = 2,
    Reloaded = 3,
}

impl TryFrom<u8> for EventAction {
    type Error = LegionError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(EventAction::Added),
            1 => Ok(EventAction::Removed),
            2 => Ok(EventAction::Changed),
            3 => Ok(EventAction::Reloaded),
            other => Err(LegionError::protocol(format!("invalid event action {}", other))),
        }
    }
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventAction::Added => "added",
            EventAction::Removed => "removed",
            EventAction::Changed => "changed",
            EventAction::Reloaded => "reloaded",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerProfileData {
    pub profile: PowerProfile,
    pub available: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmartFanModeData {
    pub mode: u32,
    pub available: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanCurveData {
    pub points: [u8; FAN_CURVE_POINTS],
    pub available: bool,
}

/// On/off switch (fan full speed, fan lock, SMT)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToggleData {
    pub enabled: bool,
    pub available: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanMaxSpeedData {
    pub fan1_rpm: u16,
    pub fan2_rpm: u16,
    pub available: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorsData {
    pub cpu_temp: u8,
    pub gpu_temp: u8,
    pub fan1_rpm: u16,
    pub fan2_rpm: u16,
    pub available: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyboardBacklightData {
    pub level: u8,
    pub available: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuPowerLimitsData {
    pub pl1_mw: u32,
    pub pl2_mw: u32,
    pub locked: bool,
    pub available: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuPeakPowerLimitData {
    pub pl4_mw: u32,
    pub locked: bool,
    pub available: bool,
}

/// CPU counts taken from the kernel's possible/present/online range lists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuTopologyData {
    pub possible: u16,
    pub present: u16,
    pub online: u16,
    pub available: bool,
}

/// Hotplug event as seen by clients
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverEventData {
    pub driver: String,
    pub action: EventAction,
    pub detail: String,
}

/// Payload of a message; the variant fixes the data type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "kebab-case")]
pub enum Payload {
    PowerProfile(PowerProfileData),
    SmartFanMode(SmartFanModeData),
    FanCurve(FanCurveData),
    FanFullSpeed(ToggleData),
    FanLock(ToggleData),
    FanMaxSpeed(FanMaxSpeedData),
    Sensors(SensorsData),
    KeyboardBacklight(KeyboardBacklightData),
    CpuPowerLimits(CpuPowerLimitsData),
    CpuPeakPowerLimit(CpuPeakPowerLimitData),
    CpuTopology(CpuTopologyData),
    CpuSmt(ToggleData),
    ModuleEvent(DriverEventData),
    SubsystemEvent(DriverEventData),
}

impl Payload {
    pub fn data_type(&self) -> DataType {
        match self {
            Payload::PowerProfile(_) => DataType::PowerProfile,
            Payload::SmartFanMode(_) => DataType::SmartFanMode,
            Payload::FanCurve(_) => DataType::FanCurve,
            Payload::FanFullSpeed(_) => DataType::FanFullSpeed,
            Payload::FanLock(_) => DataType::FanLock,
            Payload::FanMaxSpeed(_) => DataType::FanMaxSpeed,
            Payload::Sensors(_) => DataType::Sensors,
            Payload::KeyboardBacklight(_) => DataType::KeyboardBacklight,
            Payload::CpuPowerLimits(_) => DataType::CpuPowerLimits,
            Payload::CpuPeakPowerLimit(_) => DataType::CpuPeakPowerLimit,
            Payload::CpuTopology(_) => DataType::CpuTopology,
            Payload::CpuSmt(_) => DataType::CpuSmt,
            Payload::ModuleEvent(_) => DataType::ModuleEvent,
            Payload::SubsystemEvent(_) => DataType::SubsystemEvent,
        }
    }

    /// Zero-valued payload with `available = false`
    pub fn unavailable(data_type: DataType) -> Payload {
        match data_type {
            DataType::PowerProfile => Payload::PowerProfile(PowerProfileData::default()),
            DataType::SmartFanMode => Payload::SmartFanMode(SmartFanModeData::default()),
            DataType::FanCurve => Payload::FanCurve(FanCurveData::default()),
            DataType::FanFullSpeed => Payload::FanFullSpeed(ToggleData::default()),
            DataType::FanLock => Payload::FanLock(ToggleData::default()),
            DataType::FanMaxSpeed => Payload::FanMaxSpeed(FanMaxSpeedData::default()),
            DataType::Sensors => Payload::Sensors(SensorsData::default()),
            DataType::KeyboardBacklight => {
                Payload::KeyboardBacklight(KeyboardBacklightData::default())
            }
            DataType::CpuPowerLimits => Payload::CpuPowerLimits(CpuPowerLimitsData::default()),
            DataType::CpuPeakPowerLimit => {
                Payload::CpuPeakPowerLimit(CpuPeakPowerLimitData::default())
            }
            DataType::CpuTopology => Payload::CpuTopology(CpuTopologyData::default()),
            DataType::CpuSmt => Payload::CpuSmt(ToggleData::default()),
            DataType::ModuleEvent => Payload::ModuleEvent(DriverEventData::default()),
            DataType::SubsystemEvent => Payload::SubsystemEvent(DriverEventData::default()),
        }
    }

    /// `available` flag; events always count as available
    pub fn is_available(&self) -> bool {
        match self {
            Payload::PowerProfile(d) => d.available,
            Payload::SmartFanMode(d) => d.available,
            Payload::FanCurve(d) => d.available,
            Payload::FanFullSpeed(d) | Payload::FanLock(d) | Payload::CpuSmt(d) => d.available,
            Payload::FanMaxSpeed(d) => d.available,
            Payload::Sensors(d) => d.available,
            Payload::KeyboardBacklight(d) => d.available,
            Payload::CpuPowerLimits(d) => d.available,
            Payload::CpuPeakPowerLimit(d) => d.available,
            Payload::CpuTopology(d) => d.available,
            Payload::ModuleEvent(_) | Payload::SubsystemEvent(_) => true,
        }
    }

    /// Append the wire layout of this payload
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let mut w = Writer::new(out);
        match self {
            Payload::PowerProfile(d) => {
                w.u8(d.profile as u8);
                w.bool(d.available);
            }
            Payload::SmartFanMode(d) => {
                w.u32(d.mode);
                w.bool(d.available);
            }
            Payload::FanCurve(d) => {
                w.bytes(&d.points);
                w.bool(d.available);
            }
            Payload::FanFullSpeed(d) | Payload::FanLock(d) | Payload::CpuSmt(d) => {
                w.bool(d.enabled);
                w.bool(d.available);
            }
            Payload::FanMaxSpeed(d) => {
                w.u16(d.fan1_rpm);
                w.u16(d.fan2_rpm);
                w.bool(d.available);
            }
            Payload::Sensors(d) => {
                w.u8(d.cpu_temp);
                w.u8(d.gpu_temp);
                w.u16(d.fan1_rpm);
                w.u16(d.fan2_rpm);
                w.bool(d.available);
            }
            Payload::KeyboardBacklight(d) => {
                w.u8(d.level);
                w.bool(d.available);
            }
            Payload::CpuPowerLimits(d) => {
                w.u32(d.pl1_mw);
                w.u32(d.pl2_mw);
                w.bool(d.locked);
                w.bool(d.available);
            }
            Payload::CpuPeakPowerLimit(d) => {
                w.u32(d.pl4_mw);
                w.bool(d.locked);
                w.bool(d.available);
            }
            Payload::CpuTopology(d) => {
                w.u16(d.possible);
                w.u16(d.present);
                w.u16(d.online);
                w.bool(d.available);
            }
            Payload::ModuleEvent(d) | Payload::SubsystemEvent(d) => {
                w.fixed_str::<EVENT_DRIVER_LEN>(&d.driver);
                w.u8(d.action as u8);
                w.fixed_str::<EVENT_DETAIL_LEN>(&d.detail);
            }
        }
    }

    /// Decode exactly `data_type.payload_len()` bytes
    pub fn decode(data_type: DataType, buf: &[u8]) -> Result<Payload> {
        let mut r = Reader::new(buf);
        let payload = match data_type {
            DataType::PowerProfile => Payload::PowerProfile(PowerProfileData {
                profile: PowerProfile::try_from(r.u8()?)?,
                available: r.bool()?,
            }),
            DataType::SmartFanMode => Payload::SmartFanMode(SmartFanModeData {
                mode: r.u32()?,
                available: r.bool()?,
            }),
            DataType::FanCurve => Payload::FanCurve(FanCurveData {
                points: r.array()?,
                available: r.bool()?,
            }),
            DataType::FanFullSpeed => Payload::FanFullSpeed(read_toggle(&mut r)?),
            DataType::FanLock => Payload::FanLock(read_toggle(&mut r)?),
            DataType::CpuSmt => Payload::CpuSmt(read_toggle(&mut r)?),
            DataType::FanMaxSpeed => Payload::FanMaxSpeed(FanMaxSpeedData {
                fan1_rpm: r.u16()?,
                fan2_rpm: r.u16()?,
                available: r.bool()?,
            }),
            DataType::Sensors => Payload::Sensors(SensorsData {
                cpu_temp: r.u8()?,
                gpu_temp: r.u8()?,
                fan1_rpm: r.u16()?,
                fan2_rpm: r.u16()?,
                available: r.bool()?,
            }),
            DataType::KeyboardBacklight => Payload::KeyboardBacklight(KeyboardBacklightData {
                level: r.u8()?,
                available: r.bool()?,
            }),
            DataType::CpuPowerLimits => Payload::CpuPowerLimits(CpuPowerLimitsData {
                pl1_mw: r.u32()?,
                pl2_mw: r.u32()?,
                locked: r.bool()?,
                available: r.bool()?,
            }),
            DataType::CpuPeakPowerLimit => Payload::CpuPeakPowerLimit(CpuPeakPowerLimitData {
                pl4_mw: r.u32()?,
                locked: r.bool()?,
                available: r.bool()?,
            }),
            DataType::CpuTopology => Payload::CpuTopology(CpuTopologyData {
                possible: r.u16()?,
                present: r.u16()?,
                online: r.u16()?,
                available: r.bool()?,
            }),
            DataType::ModuleEvent => Payload::ModuleEvent(read_event(&mut r)?),
            DataType::SubsystemEvent => Payload::SubsystemEvent(read_event(&mut r)?),
        };
        r.finish()?;
        Ok(payload)
    }
}

fn read_toggle(r: &mut Reader<'_>) -> Result<ToggleData> {
    Ok(ToggleData { enabled: r.bool()?, available: r.bool()? })
}

fn read_event(r: &mut Reader<'_>) -> Result<DriverEventData> {
    Ok(DriverEventData {
        driver: r.fixed_str::<EVENT_DRIVER_LEN>()?,
        action: EventAction::try_from(r.u8()?)?,
        detail: r.fixed_str::<EVENT_DETAIL_LEN>()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_ids_are_dense() {
        for (i, dt) in DataType::ALL.iter().enumerate() {
            assert_eq!(*dt as u8 as usize, i);
            assert_eq!(DataType::try_from(i as u8).unwrap(), *dt);
        }
        assert!(matches!(DataType::try_from(14), Err(LegionError::UnknownDataType(14))));
        assert!(matches!(DataType::try_from(0xFF), Err(LegionError::UnknownDataType(0xFF))));
    }

    #[test]
    fn test_payload_len_matches_encoding() {
        for dt in DataType::ALL {
            let mut out = Vec::new();
            Payload::unavailable(dt).encode_into(&mut out);
            assert_eq!(out.len(), dt.payload_len(), "{}", dt);
        }
    }

    #[test]
    fn test_fan_curve_layout() {
        let payload = Payload::FanCurve(FanCurveData {
            points: [30, 40, 50, 60, 70, 80, 90, 95, 99, 100],
            available: true,
        });
        let mut out = Vec::new();
        payload.encode_into(&mut out);
        assert_eq!(out, vec![30, 40, 50, 60, 70, 80, 90, 95, 99, 100, 1]);
        assert_eq!(Payload::decode(DataType::FanCurve, &out).unwrap(), payload);
    }

    #[test]
    fn test_power_limits_little_endian() {
        let payload = Payload::CpuPowerLimits(CpuPowerLimitsData {
            pl1_mw: 45_000,
            pl2_mw: 0x0001_2345,
            locked: true,
            available: true,
        });
        let mut out = Vec::new();
        payload.encode_into(&mut out);
        assert_eq!(&out[..4], &45_000u32.to_le_bytes());
        assert_eq!(&out[4..8], &[0x45, 0x23, 0x01, 0x00]);
        assert_eq!(&out[8..], &[1, 1]);
    }

    #[test]
    fn test_event_round_trip_and_truncation() {
        let long_detail = "x".repeat(EVENT_DETAIL_LEN + 10);
        let payload = Payload::ModuleEvent(DriverEventData {
            driver: "legion".into(),
            action: EventAction::Removed,
            detail: long_detail,
        });
        let mut out = Vec::new();
        payload.encode_into(&mut out);

        match Payload::decode(DataType::ModuleEvent, &out).unwrap() {
            Payload::ModuleEvent(d) => {
                assert_eq!(d.driver, "legion");
                assert_eq!(d.action, EventAction::Removed);
                assert_eq!(d.detail.len(), EVENT_DETAIL_LEN);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        assert!(Payload::decode(DataType::PowerProfile, &[9, 1]).is_err());
        assert!(Payload::decode(DataType::FanLock, &[1, 2]).is_err());
        assert!(Payload::decode(DataType::FanLock, &[1]).is_err());
        assert!(Payload::decode(DataType::FanLock, &[1, 1, 0]).is_err());
    }

    #[test]
    fn test_feature_names() {
        assert_eq!("fan-curve".parse::<DataType>().unwrap(), DataType::FanCurve);
        assert!("fan_curve".parse::<DataType>().is_err());
        assert_eq!(PowerProfile::from_sysfs_name("balanced-performance"), Some(PowerProfile::BalancedPerformance));
        assert_eq!(PowerProfile::from_sysfs_name("turbo"), None);
    }

    #[test]
    fn test_payload_json_shape() {
        let payload = Payload::KeyboardBacklight(KeyboardBacklightData { level: 2, available: true });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "keyboard-backlight");
        assert_eq!(json["value"]["level"], 2);
    }
}
