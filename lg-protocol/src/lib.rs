//! Binary IPC protocol between legiond and its clients
//!
//! Every frame is a two-byte header `{message_type, data_type}` followed by a
//! body whose size is fully determined by the header. There is no length
//! field and no checksum; both ends share the schema in [`data`].
//!
//! | message type   | body                         |
//! |----------------|------------------------------|
//! | `RequestGet`   | empty                        |
//! | `RequestSet`   | payload of the data type     |
//! | `ResponseGet`  | payload of the data type     |
//! | `ResponseSet`  | one [`SetStatus`] byte       |
//! | `Notification` | event payload                |
//!
//! All integers are little-endian.

mod codec;
pub mod data;
pub mod frame;
pub mod message;

pub use data::{
    CpuPeakPowerLimitData, CpuPowerLimitsData, CpuTopologyData, DataType, DriverEventData,
    EventAction, FanCurveData, FanMaxSpeedData, KeyboardBacklightData, Payload, PowerProfile,
    PowerProfileData, SensorsData, SetStatus, SmartFanModeData, ToggleData, FAN_CURVE_POINTS,
};
pub use frame::{read_message, try_read_message, write_message};
pub use message::{Message, MessageType};
