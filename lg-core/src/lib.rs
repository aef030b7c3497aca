//! legionctl core library
//!
//! Everything the daemon does between the hardware protocols in `lg-hw` and
//! the sockets it serves.
//!
//! # Module Structure
//!
//! - `driver/` - Driver descriptors and the concrete sysfs, CPU and thermal drivers
//! - `manager` - Driver registry and kernel event routing
//! - `hotplug` - Netlink uevent monitor
//! - `context` - Feature table and get/set dispatch
//! - `ipc/` - Single-client protocol processor and notifier
//! - `client` - Blocking-free client library used by `legionctl`
//!
//! # Example
//!
//! ```no_run
//! use lg_core::{Context, DaemonConfig};
//! use lg_protocol::DataType;
//!
//! let mut ctx = Context::from_config(DaemonConfig::default()).unwrap();
//! ctx.init();
//! let profile = ctx.get(DataType::PowerProfile).unwrap();
//! ```

// Grouped modules
pub mod driver;
pub mod ipc;

// Standalone modules
pub mod client;
pub mod config;
pub mod constants;
pub mod context;
pub mod hardware;
pub mod hotplug;
pub mod manager;
pub mod sysfs;

pub use client::{DaemonClient, NotificationClient};
pub use config::{DaemonConfig, EcRegisters, RaplConfig, Roots, StartupLimits, WmiConfig};
pub use context::{find_feature, Context, Feature, FEATURES};
pub use driver::{Driver, DriverDescriptor, KernelEvent};
pub use hardware::{HardwareAccess, SystemHardware};
pub use hotplug::UeventMonitor;
pub use ipc::{peer_credentials, PeerCredentials, ProtocolNotifier, ProtocolProcessor};
pub use manager::{DriverManager, DriverState};

pub use lg_error::{LegionError, Result};
