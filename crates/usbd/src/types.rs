//! Port data model for USB Type-C connectors.
//!
//! Role enumerations mirror the vocabulary of the kernel Type-C class:
//! role nodes hold a space separated list with the active entry bracketed
//! (`"[source] sink"`).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome reported to subscribers for every operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Operation completed.
    #[default]
    Success,
    /// Generic I/O or confirmation failure.
    Error,
    /// The control surface is absent on this hardware.
    NotSupported,
    /// Hardware reported a role string outside the known vocabulary.
    UnrecognizedRole,
}

impl Status {
    /// Convenience mapping from a success flag.
    pub fn from_success(success: bool) -> Self {
        if success {
            Status::Success
        } else {
            Status::Error
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Success => "SUCCESS",
            Status::Error => "ERROR",
            Status::NotSupported => "NOT_SUPPORTED",
            Status::UnrecognizedRole => "UNRECOGNIZED_ROLE",
        };
        write!(f, "{}", s)
    }
}

/// Power role of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PortPowerRole {
    #[default]
    None,
    Source,
    Sink,
}

impl PortPowerRole {
    /// Value written to / read from the `power_role` node.
    pub const fn node_value(&self) -> &'static str {
        match self {
            PortPowerRole::None => "none",
            PortPowerRole::Source => "source",
            PortPowerRole::Sink => "sink",
        }
    }

    /// Parses an extracted role token.
    pub fn from_node_value(value: &str) -> Option<Self> {
        match value {
            "none" => Some(PortPowerRole::None),
            "source" => Some(PortPowerRole::Source),
            "sink" => Some(PortPowerRole::Sink),
            _ => None,
        }
    }
}

/// Data role of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PortDataRole {
    #[default]
    None,
    Host,
    Device,
}

impl PortDataRole {
    /// Value written to / read from the `data_role` node.
    pub const fn node_value(&self) -> &'static str {
        match self {
            PortDataRole::None => "none",
            PortDataRole::Host => "host",
            PortDataRole::Device => "device",
        }
    }

    /// Parses an extracted role token.
    pub fn from_node_value(value: &str) -> Option<Self> {
        match value {
            "none" => Some(PortDataRole::None),
            "host" => Some(PortDataRole::Host),
            "device" => Some(PortDataRole::Device),
            _ => None,
        }
    }
}

/// Operating mode of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PortMode {
    #[default]
    None,
    /// Upstream facing port.
    Ufp,
    /// Downstream facing port.
    Dfp,
    /// Dual role port, the negotiable default.
    Drp,
    AudioAccessory,
    DebugAccessory,
}

impl PortMode {
    /// Value written to the `port_type` node to request this mode.
    ///
    /// Accessory modes cannot be requested and map to `none`.
    pub const fn node_value(&self) -> &'static str {
        match self {
            PortMode::Ufp => "sink",
            PortMode::Dfp => "source",
            PortMode::Drp => "dual",
            PortMode::None | PortMode::AudioAccessory | PortMode::DebugAccessory => "none",
        }
    }

    /// Mode derived from the data role of a connected, non-accessory port.
    pub const fn from_data_role(role: PortDataRole) -> Self {
        match role {
            PortDataRole::Host => PortMode::Dfp,
            PortDataRole::Device => PortMode::Ufp,
            PortDataRole::None => PortMode::None,
        }
    }

    /// Mode override for a reported accessory type, if any.
    pub fn from_accessory(accessory: &str) -> Option<Self> {
        match accessory {
            "analog_audio" => Some(PortMode::AudioAccessory),
            "debug" => Some(PortMode::DebugAccessory),
            _ => None,
        }
    }
}

/// Which role a [`PortRole`] addresses; selects the node it is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleKind {
    Power,
    Data,
    Mode,
}

impl RoleKind {
    /// Node name under the port's class directory.
    pub const fn node_name(&self) -> &'static str {
        match self {
            RoleKind::Power => "power_role",
            RoleKind::Data => "data_role",
            RoleKind::Mode => "port_type",
        }
    }
}

/// A requested or reported role: exactly one of the three role families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum PortRole {
    PowerRole(PortPowerRole),
    DataRole(PortDataRole),
    Mode(PortMode),
}

impl PortRole {
    pub const fn kind(&self) -> RoleKind {
        match self {
            PortRole::PowerRole(_) => RoleKind::Power,
            PortRole::DataRole(_) => RoleKind::Data,
            PortRole::Mode(_) => RoleKind::Mode,
        }
    }

    /// String written to the role node for this request.
    pub const fn node_value(&self) -> &'static str {
        match self {
            PortRole::PowerRole(role) => role.node_value(),
            PortRole::DataRole(role) => role.node_value(),
            PortRole::Mode(mode) => mode.node_value(),
        }
    }
}

impl fmt::Display for PortRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortRole::PowerRole(role) => write!(f, "power_role:{:?}", role),
            PortRole::DataRole(role) => write!(f, "data_role:{:?}", role),
            PortRole::Mode(mode) => write!(f, "mode:{:?}", mode),
        }
    }
}

/// Charger or cable compliance diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComplianceWarning {
    Other,
    DebugAccessory,
    #[serde(rename = "BC_1_2")]
    Bc12,
    MissingRp,
    InputPowerLimited,
    MissingDataLines,
    EnumerationFail,
    FlakyConnection,
    UnreliableIo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContaminantDetectionStatus {
    #[default]
    NotSupported,
    Disabled,
    NotDetected,
    Detected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContaminantProtectionStatus {
    #[default]
    None,
    ForceSink,
    ForceSource,
    ForceDisable,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContaminantProtectionMode {
    None,
    ForceSink,
    ForceSource,
    ForceDisable,
}

/// Whether a charger ("power brick") sits behind the partner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PowerBrickStatus {
    #[default]
    Unknown,
    Connected,
    NotConnected,
}

/// USB data signaling state; several disable reasons may coexist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UsbDataStatus {
    Unknown,
    Enabled,
    DisabledOverheat,
    DisabledContaminant,
    DisabledDock,
    DisabledForce,
    DisabledDebug,
    DisabledDockHostMode,
    DisabledDockDeviceMode,
}

/// Status of one Type-C port as captured in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortStatus {
    pub port_name: String,
    pub connected: bool,
    pub current_power_role: PortPowerRole,
    pub current_data_role: PortDataRole,
    pub current_mode: PortMode,
    pub can_change_mode: bool,
    pub can_change_data_role: bool,
    pub can_change_power_role: bool,
    pub supported_modes: Vec<PortMode>,
    pub supported_contaminant_protection_modes: Vec<ContaminantProtectionMode>,
    pub supports_enable_contaminant_presence_protection: bool,
    pub contaminant_protection_status: ContaminantProtectionStatus,
    pub supports_enable_contaminant_presence_detection: bool,
    pub contaminant_detection_status: ContaminantDetectionStatus,
    pub usb_data_status: Vec<UsbDataStatus>,
    pub power_transfer_limited: bool,
    pub power_brick_status: PowerBrickStatus,
    pub supports_compliance_warnings: bool,
    pub compliance_warnings: Vec<ComplianceWarning>,
}

impl PortStatus {
    /// Creates an empty status for `port_name`.
    pub fn new(port_name: impl Into<String>, connected: bool) -> Self {
        Self {
            port_name: port_name.into(),
            connected,
            ..Default::default()
        }
    }

    /// Adds a warning unless it is already present.
    pub fn add_compliance_warning(&mut self, warning: ComplianceWarning) {
        if !self.compliance_warnings.contains(&warning) {
            self.compliance_warnings.push(warning);
        }
    }
}

/// Ordered multi-port snapshot.
pub type PortSnapshot = Vec<PortStatus>;

/// Opaque caller-supplied correlation token echoed in notifications.
pub type TransactionId = i64;
