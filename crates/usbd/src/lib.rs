//! USB Type-C Port Coordination Daemon
//!
//! Mediates between callers that want to observe and control USB Type-C
//! ports and the kernel Type-C class, TCPC and gadget control nodes.
//! Reports multi-port status snapshots to a single subscriber and reacts to
//! kernel uevents on a dedicated dispatch thread.
//!
//! NIST 800-53 Rev5 [AC-3]: Access Enforcement - USB data signaling control
//! NIST 800-53 Rev5 [SI-4]: System Monitoring - Port and partner state monitoring

pub mod compliance;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod node_store;
pub mod notify;
pub mod role_switch;
pub mod service;
pub mod session;
pub mod status;
pub mod telemetry;
pub mod topology;
pub mod types;
pub mod uevent;

pub use compliance::parse_compliance_warnings;
pub use config::{UsbdConfig, DEFAULT_CONFIG_PATH};
pub use dispatch::{DispatchHandle, EventDispatcher};
pub use error::{Result, UsbError};
pub use node_store::{DirEntry, MemoryNodeStore, NodeStore, SysfsNodeStore, WriteRecord};
pub use notify::{LoggingSink, NotificationSink};
pub use role_switch::{PartnerWait, RoleSwitchCoordinator};
pub use service::UsbService;
pub use session::{DataSessionMonitor, FixedDataSessionMonitor, NullDataSessionMonitor};
pub use status::StatusAggregator;
pub use telemetry::{OverheatReport, TelemetrySink, ThermalTelemetry};
pub use topology::{I2cClientResolver, TypecLayout};
pub use types::*;
pub use uevent::{
    ChannelEventSource, EventSource, EventStream, UeventClassifier, UeventKind, UeventRecord,
};

#[cfg(target_os = "linux")]
pub use uevent::UeventSocket;
