//! Port status aggregation
//!
//! [`StatusAggregator`] composes one multi-port snapshot from topology,
//! role nodes, the TCPC i2c client (contaminant and power limiting), the
//! compliance reasons and the data session monitor. Each merge step is
//! best-effort: a failed read degrades its field and the remaining steps
//! still run. Only a failed topology enumeration fails the snapshot.
//!
//! The status section ([`StatusAggregator::lock`]) guards the last snapshot
//! and the subscriber; every notification is delivered while holding it.

use crate::compliance::parse_compliance_warnings;
use crate::config::{PathsConfig, UsbdConfig};
use crate::error::{Result, UsbError};
use crate::node_store::NodeStore;
use crate::notify::{deliver, NotificationSink};
use crate::session::DataSessionMonitor;
use crate::topology::{
    enumerate_ports, extract_role, I2cClientResolver, PortTopology, TypecLayout,
    CONTAMINANT_DETECTION, CONTAMINANT_DETECTION_STATUS, SINK_LIMIT_ENABLE,
};
use crate::types::{
    ContaminantDetectionStatus, ContaminantProtectionMode, ContaminantProtectionStatus,
    PortDataRole, PortMode, PortPowerRole, PortSnapshot, PortStatus, PowerBrickStatus, RoleKind,
    Status, UsbDataStatus,
};
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const PD_SUPPORTED: &str = "yes";

/// State guarded by the status section.
#[derive(Default)]
pub struct StatusState {
    subscriber: Option<Arc<dyn NotificationSink>>,
    ports: PortSnapshot,
}

impl StatusState {
    pub fn subscriber(&self) -> Option<&Arc<dyn NotificationSink>> {
        self.subscriber.as_ref()
    }

    /// Replaces the subscriber, returning the previous one.
    pub fn set_subscriber(
        &mut self,
        subscriber: Option<Arc<dyn NotificationSink>>,
    ) -> Option<Arc<dyn NotificationSink>> {
        std::mem::replace(&mut self.subscriber, subscriber)
    }

    /// Last published snapshot.
    pub fn ports(&self) -> &[PortStatus] {
        &self.ports
    }
}

impl fmt::Debug for StatusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusState")
            .field("subscribed", &self.subscriber.is_some())
            .field("ports", &self.ports.len())
            .finish()
    }
}

/// Builds and publishes port status snapshots.
pub struct StatusAggregator {
    store: Arc<dyn NodeStore>,
    layout: TypecLayout,
    paths: PathsConfig,
    i2c: Arc<I2cClientResolver>,
    session: Arc<dyn DataSessionMonitor>,
    split_input_power_limited: bool,
    usb_data_enabled: AtomicBool,
    section: Mutex<StatusState>,
}

impl StatusAggregator {
    pub fn new(
        store: Arc<dyn NodeStore>,
        config: &UsbdConfig,
        i2c: Arc<I2cClientResolver>,
        session: Arc<dyn DataSessionMonitor>,
    ) -> Self {
        Self {
            store,
            layout: TypecLayout::new(&config.paths.typec_class),
            paths: config.paths.clone(),
            i2c,
            session,
            split_input_power_limited: config.features.input_power_limited_warning,
            usb_data_enabled: AtomicBool::new(true),
            section: Mutex::new(StatusState::default()),
        }
    }

    /// Enters the status section.
    pub fn lock(&self) -> MutexGuard<'_, StatusState> {
        self.section.lock()
    }

    pub fn layout(&self) -> &TypecLayout {
        &self.layout
    }

    /// Remembered result of the last successful enableUsbData.
    pub fn usb_data_enabled(&self) -> bool {
        self.usb_data_enabled.load(Ordering::SeqCst)
    }

    pub fn set_usb_data_enabled(&self, enabled: bool) {
        self.usb_data_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Recomputes and publishes a snapshot inside the status section.
    pub fn refresh(&self) -> (PortSnapshot, Status) {
        let mut state = self.section.lock();
        self.refresh_locked(&mut state)
    }

    /// Recomputes and publishes a snapshot; the caller holds the section.
    pub fn refresh_locked(&self, state: &mut StatusState) -> (PortSnapshot, Status) {
        let (ports, status) = self.compute_snapshot();
        state.ports = ports.clone();

        deliver(state.subscriber.as_ref(), "port_status_changed", |sink| {
            sink.port_status_changed(&ports, status)
        });
        (ports, status)
    }

    /// Computes a snapshot without publishing it.
    pub fn compute_snapshot(&self) -> (PortSnapshot, Status) {
        let topology = match enumerate_ports(self.store.as_ref(), &self.layout) {
            Ok(topology) => topology,
            Err(e) => {
                error!(error = %e, "Failed to enumerate Type-C ports");
                return (Vec::new(), Status::Error);
            }
        };

        let mut ports: PortSnapshot = topology.iter().map(|t| self.port_status(t)).collect();

        if !ports.is_empty() {
            self.merge_contaminant(&mut ports[0]);
            self.merge_power_limit(&mut ports[0]);
        }
        for port in ports.iter_mut() {
            self.merge_compliance_warnings(port);
            self.merge_usb_data_status(port);
        }
        if let Some(primary) = ports.first_mut() {
            let warnings = self.session.compliance_warnings(primary.current_data_role);
            for warning in warnings {
                primary.add_compliance_warning(warning);
            }
        }

        for port in &ports {
            info!(
                port = %port.port_name,
                connected = port.connected,
                power_role = ?port.current_power_role,
                data_role = ?port.current_data_role,
                mode = ?port.current_mode,
                can_change_mode = port.can_change_mode,
                can_change_data_role = port.can_change_data_role,
                can_change_power_role = port.can_change_power_role,
                usb_data = ?port.usb_data_status,
                "Port status"
            );
        }

        (ports, Status::Success)
    }

    fn port_status(&self, topology: &PortTopology) -> PortStatus {
        let name = topology.name.as_str();
        let mut port = PortStatus::new(name, topology.connected);
        port.can_change_mode = true;
        port.supported_modes = vec![PortMode::Drp];

        if !topology.connected {
            port.power_brick_status = PowerBrickStatus::NotConnected;
            return port;
        }

        match self.read_role(name, RoleKind::Power, PortPowerRole::from_node_value) {
            Ok(role) => port.current_power_role = role,
            Err(e) => log_role_error(name, &e),
        }
        match self.read_role(name, RoleKind::Data, PortDataRole::from_node_value) {
            Ok(role) => port.current_data_role = role,
            Err(e) => log_role_error(name, &e),
        }
        port.current_mode = self
            .accessory_mode(name)
            .unwrap_or_else(|| PortMode::from_data_role(port.current_data_role));

        let pd = self.partner_supports_pd(name);
        port.can_change_data_role = pd;
        port.can_change_power_role = pd;

        port.power_brick_status = self.power_brick_status(port.current_power_role);
        port
    }

    fn read_role<T>(&self, port: &str, kind: RoleKind, parse: fn(&str) -> Option<T>) -> Result<T> {
        let path = self.layout.role_node(port, kind);
        let raw = self.store.read_trimmed(&path)?;
        let value = extract_role(&raw);
        parse(value).ok_or_else(|| UsbError::UnrecognizedRole {
            path,
            value: value.to_string(),
        })
    }

    fn accessory_mode(&self, port: &str) -> Option<PortMode> {
        let accessory = self
            .store
            .read_trimmed(&self.layout.accessory_mode(port))
            .ok()?;
        PortMode::from_accessory(&accessory)
    }

    fn partner_supports_pd(&self, port: &str) -> bool {
        self.store
            .read_trimmed(&self.layout.partner_pd_support(port))
            .is_ok_and(|value| value == PD_SUPPORTED)
    }

    fn power_brick_status(&self, power_role: PortPowerRole) -> PowerBrickStatus {
        if power_role == PortPowerRole::Source {
            return PowerBrickStatus::NotConnected;
        }
        match self.store.read(&self.paths.power_supply_usb_type) {
            Ok(usb_type) if usb_type.contains("[D") => PowerBrickStatus::Connected,
            Ok(usb_type) if usb_type.contains("[U") => PowerBrickStatus::Unknown,
            Ok(_) => PowerBrickStatus::NotConnected,
            Err(e) => {
                warn!(error = %e, "Failed to read usb_type");
                PowerBrickStatus::default()
            }
        }
    }

    fn i2c_node(&self, name: &str) -> Result<PathBuf> {
        Ok(self.i2c.resolve(self.store.as_ref())?.join(name))
    }

    /// Contaminant detection is a single TCPC feature reported on the primary port.
    fn merge_contaminant(&self, port: &mut PortStatus) {
        port.supported_contaminant_protection_modes = vec![ContaminantProtectionMode::ForceDisable];
        port.contaminant_protection_status = ContaminantProtectionStatus::None;
        port.contaminant_detection_status = ContaminantDetectionStatus::Disabled;
        port.supports_enable_contaminant_presence_detection = true;
        port.supports_enable_contaminant_presence_protection = false;

        let enabled = match self
            .i2c_node(CONTAMINANT_DETECTION)
            .and_then(|path| self.store.read_trimmed(&path))
        {
            Ok(enabled) => enabled,
            Err(e) => {
                warn!(error = %e, "Failed to read contaminant detection state");
                return;
            }
        };
        if enabled != "1" {
            return;
        }

        match self
            .i2c_node(CONTAMINANT_DETECTION_STATUS)
            .and_then(|path| self.store.read_trimmed(&path))
        {
            Ok(status) if status == "1" => {
                port.contaminant_detection_status = ContaminantDetectionStatus::Detected;
                port.contaminant_protection_status = ContaminantProtectionStatus::ForceDisable;
            }
            Ok(_) => port.contaminant_detection_status = ContaminantDetectionStatus::NotDetected,
            Err(e) => warn!(error = %e, "Failed to read contaminant detection status"),
        }

        debug!(
            detection = ?port.contaminant_detection_status,
            protection = ?port.contaminant_protection_status,
            "Contaminant status"
        );
    }

    fn merge_power_limit(&self, port: &mut PortStatus) {
        match self
            .i2c_node(SINK_LIMIT_ENABLE)
            .and_then(|path| self.store.read_trimmed(&path))
        {
            Ok(enabled) => port.power_transfer_limited = enabled == "1",
            Err(e) => warn!(error = %e, "Failed to read sink limit state"),
        }
    }

    fn merge_compliance_warnings(&self, port: &mut PortStatus) {
        port.supports_compliance_warnings = true;

        let path = self.layout.compliance_reasons(&port.port_name);
        let Ok(reasons) = self.store.read(&path) else {
            return;
        };
        for warning in parse_compliance_warnings(&reasons, self.split_input_power_limited) {
            port.add_compliance_warning(warning);
        }

        // A charger that only shows up through compliance reasons.
        if !port.compliance_warnings.is_empty()
            && port.current_power_role == PortPowerRole::None
        {
            debug!(port = %port.port_name, "Synthesizing sink state from compliance warnings");
            port.current_mode = PortMode::Ufp;
            port.current_power_role = PortPowerRole::Sink;
            port.current_data_role = PortDataRole::None;
            port.power_brick_status = PowerBrickStatus::Connected;
        }
    }

    fn merge_usb_data_status(&self, port: &mut PortStatus) {
        let mut reasons = Vec::new();

        let docked = self
            .store
            .read_trimmed(&self.paths.dock_usb_active)
            .ok()
            .and_then(|value| value.parse::<i32>().ok())
            == Some(1);
        if docked {
            reasons.push(UsbDataStatus::DisabledDockDeviceMode);
        }
        if !self.usb_data_enabled() {
            reasons.push(UsbDataStatus::DisabledForce);
        }
        if reasons.is_empty() {
            reasons.push(UsbDataStatus::Enabled);
        }
        port.usb_data_status = reasons;
    }
}

fn log_role_error(port: &str, error: &UsbError) {
    match error {
        UsbError::UnrecognizedRole { value, .. } => {
            warn!(port, value = %value, status = %error.status(), "Unrecognized role")
        }
        _ => error!(port, error = %error, "Failed to read current role"),
    }
}
