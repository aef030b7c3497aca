//! Framed messages: `{type: u8, data_type: u8}` followed by the body

use lg_error::{LegionError, Result};
use serde::{Deserialize, Serialize};

use crate::data::{DataType, Payload, SetStatus};

/// Size of the `{type, data_type}` header
pub const HEADER_LEN: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    RequestGet = 0,
    RequestSet = 1,
    ResponseGet = 2,
    ResponseSet = 3,
    Notification = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = LegionError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageType::RequestGet),
            1 => Ok(MessageType::RequestSet),
            2 => Ok(MessageType::ResponseGet),
            3 => Ok(MessageType::ResponseSet),
            4 => Ok(MessageType::Notification),
            other => Err(LegionError::UnknownMessageType(other)),
        }
    }
}

impl MessageType {
    /// Body size for this message type and data type
    pub fn body_len(self, data_type: DataType) -> usize {
        match self {
            MessageType::RequestGet => 0,
            MessageType::ResponseSet => 1,
            MessageType::RequestSet | MessageType::ResponseGet | MessageType::Notification => {
                data_type.payload_len()
            }
        }
    }
}

/// One protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    RequestGet(DataType),
    RequestSet(Payload),
    ResponseGet(Payload),
    ResponseSet(DataType, SetStatus),
    Notification(Payload),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::RequestGet(_) => MessageType::RequestGet,
            Message::RequestSet(_) => MessageType::RequestSet,
            Message::ResponseGet(_) => MessageType::ResponseGet,
            Message::ResponseSet(..) => MessageType::ResponseSet,
            Message::Notification(_) => MessageType::Notification,
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Message::RequestGet(dt) | Message::ResponseSet(dt, _) => *dt,
            Message::RequestSet(p) | Message::ResponseGet(p) | Message::Notification(p) => {
                p.data_type()
            }
        }
    }

    /// Total frame size including the header
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.message_type().body_len(self.data_type())
    }

    /// Byte layout derived from the data type alone
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.frame_len());
        out.push(self.message_type() as u8);
        out.push(self.data_type() as u8);
        match self {
            Message::RequestGet(_) => {}
            Message::ResponseSet(_, status) => out.push(*status as u8),
            Message::RequestSet(p) | Message::ResponseGet(p) | Message::Notification(p) => {
                p.encode_into(&mut out)
            }
        }
        out
    }

    /// Validate a header and return the body size that must follow it
    pub fn parse_header(header: [u8; HEADER_LEN]) -> Result<(MessageType, DataType)> {
        let message_type = MessageType::try_from(header[0])?;
        let data_type = DataType::try_from(header[1])?;

        let notification_only = data_type.is_notification();
        let allowed = match message_type {
            MessageType::Notification => notification_only,
            _ => !notification_only,
        };
        if !allowed {
            return Err(LegionError::protocol(format!(
                "{:?} is not valid for data type {}",
                message_type, data_type
            )));
        }
        Ok((message_type, data_type))
    }

    /// Build a message from an already-validated header and its exact body
    pub fn from_parts(message_type: MessageType, data_type: DataType, body: &[u8]) -> Result<Message> {
        let expected = message_type.body_len(data_type);
        if body.len() != expected {
            return Err(LegionError::protocol(format!(
                "{} body is {} bytes, expected {}",
                data_type,
                body.len(),
                expected
            )));
        }

        Ok(match message_type {
            MessageType::RequestGet => Message::RequestGet(data_type),
            MessageType::ResponseSet => Message::ResponseSet(data_type, SetStatus::try_from(body[0])?),
            MessageType::RequestSet => Message::RequestSet(Payload::decode(data_type, body)?),
            MessageType::ResponseGet => Message::ResponseGet(Payload::decode(data_type, body)?),
            MessageType::Notification => Message::Notification(Payload::decode(data_type, body)?),
        })
    }

    /// Decode one complete frame
    pub fn decode(frame: &[u8]) -> Result<Message> {
        if frame.len() < HEADER_LEN {
            return Err(LegionError::protocol("frame shorter than header"));
        }
        let (message_type, data_type) = Self::parse_header([frame[0], frame[1]])?;
        Self::from_parts(message_type, data_type, &frame[HEADER_LEN..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::*;

    #[test]
    fn test_request_get_is_header_only() {
        let msg = Message::RequestGet(DataType::FanCurve);
        assert_eq!(msg.encode(), vec![0, 2]);
        assert_eq!(Message::decode(&[0, 2]).unwrap(), msg);
    }

    #[test]
    fn test_response_set_status_byte() {
        let msg = Message::ResponseSet(DataType::CpuPowerLimits, SetStatus::NotAvailable);
        assert_eq!(msg.encode(), vec![3, 8, 1]);
        assert_eq!(Message::decode(&[3, 8, 1]).unwrap(), msg);
        assert!(Message::decode(&[3, 8, 7]).is_err());
    }

    /// A non-default value for every data type
    fn sample(data_type: DataType) -> Payload {
        match data_type {
            DataType::PowerProfile => Payload::PowerProfile(PowerProfileData { profile: PowerProfile::Performance, available: true }),
            DataType::SmartFanMode => Payload::SmartFanMode(SmartFanModeData { mode: 3, available: true }),
            DataType::FanCurve => Payload::FanCurve(FanCurveData {
                points: [20, 25, 30, 40, 50, 60, 70, 85, 95, 100],
                available: true,
            }),
            DataType::FanFullSpeed => Payload::FanFullSpeed(ToggleData { enabled: true, available: true }),
            DataType::FanLock => Payload::FanLock(ToggleData { enabled: true, available: false }),
            DataType::FanMaxSpeed => Payload::FanMaxSpeed(FanMaxSpeedData { fan1_rpm: 4800, fan2_rpm: 5100, available: true }),
            DataType::Sensors => Payload::Sensors(SensorsData { cpu_temp: 61, gpu_temp: 48, fan1_rpm: 2200, fan2_rpm: 2300, available: true }),
            DataType::KeyboardBacklight => Payload::KeyboardBacklight(KeyboardBacklightData { level: 2, available: true }),
            DataType::CpuPowerLimits => Payload::CpuPowerLimits(CpuPowerLimitsData {
                pl1_mw: 45_000,
                pl2_mw: 0x0102_0304,
                locked: true,
                available: true,
            }),
            DataType::CpuPeakPowerLimit => Payload::CpuPeakPowerLimit(CpuPeakPowerLimitData { pl4_mw: 160_000, locked: false, available: true }),
            DataType::CpuTopology => Payload::CpuTopology(CpuTopologyData { possible: 16, present: 16, online: 12, available: true }),
            DataType::CpuSmt => Payload::CpuSmt(ToggleData { enabled: true, available: true }),
            DataType::ModuleEvent => Payload::ModuleEvent(DriverEventData {
                driver: "legion".into(),
                action: EventAction::Reloaded,
                detail: "legion_laptop".into(),
            }),
            DataType::SubsystemEvent => Payload::SubsystemEvent(DriverEventData {
                driver: "cpu_control".into(),
                action: EventAction::Changed,
                detail: "cpu3 offline".into(),
            }),
        }
    }

    fn assert_round_trip(msg: Message) {
        let frame = msg.encode();
        assert_eq!(frame.len(), msg.frame_len(), "{:?}", msg);
        assert_eq!(Message::decode(&frame).unwrap(), msg);
    }

    #[test]
    fn test_every_data_type_round_trips() {
        for data_type in DataType::ALL {
            let payload = sample(data_type);
            assert_eq!(payload.data_type(), data_type);

            if data_type.is_notification() {
                assert_round_trip(Message::Notification(payload));
            } else {
                assert_round_trip(Message::ResponseGet(payload.clone()));
                assert_round_trip(Message::RequestSet(payload));
                assert_round_trip(Message::RequestGet(data_type));
                assert_round_trip(Message::ResponseSet(data_type, SetStatus::ReadOnly));
            }
        }
    }

    #[test]
    fn test_event_strings_cut_on_char_boundary() {
        // two bytes per char, so neither field ends on its last byte
        let event = Message::Notification(Payload::ModuleEvent(DriverEventData {
            driver: "\u{e9}".repeat(40),
            action: EventAction::Added,
            detail: "\u{fc}".repeat(100),
        }));

        match Message::decode(&event.encode()).unwrap() {
            Message::Notification(Payload::ModuleEvent(d)) => {
                assert_eq!(d.driver, "\u{e9}".repeat(EVENT_DRIVER_LEN / 2));
                assert_eq!(d.detail, "\u{fc}".repeat(EVENT_DETAIL_LEN / 2));
                assert_eq!(d.action, EventAction::Added);
            }
            other => panic!("unexpected {:?}", other),
        }

        // odd byte budget: a three-byte char that would straddle the end is dropped
        let euro = Message::Notification(Payload::SubsystemEvent(DriverEventData {
            driver: "\u{20ac}".repeat(11),
            action: EventAction::Changed,
            detail: String::new(),
        }));
        match Message::decode(&euro.encode()).unwrap() {
            Message::Notification(Payload::SubsystemEvent(d)) => {
                assert_eq!(d.driver, "\u{20ac}".repeat(10));
                assert!(d.driver.len() <= EVENT_DRIVER_LEN);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_tags_are_fatal() {
        assert!(matches!(Message::decode(&[9, 0]), Err(LegionError::UnknownMessageType(9))));
        assert!(matches!(Message::decode(&[0, 42]), Err(LegionError::UnknownDataType(42))));
    }

    #[test]
    fn test_notification_types_only_in_notifications() {
        assert!(matches!(
            Message::parse_header([MessageType::RequestGet as u8, DataType::ModuleEvent as u8]),
            Err(LegionError::Protocol(_))
        ));
        assert!(matches!(
            Message::parse_header([MessageType::Notification as u8, DataType::FanCurve as u8]),
            Err(LegionError::Protocol(_))
        ));
    }

    #[test]
    fn test_body_length_must_match() {
        assert!(Message::decode(&[0, 2, 0]).is_err());
        assert!(Message::decode(&[2, 2, 1, 2, 3]).is_err());
    }
}
