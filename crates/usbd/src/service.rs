//! USB service context
//!
//! [`UsbService`] owns every piece of process-wide state (subscriber, the
//! partner wait slot, the memoized i2c client path, the data-enable flag)
//! and exposes the caller-facing operations. Each operation reports its
//! outcome to the subscriber, if one is registered, and returns it.
//!
//! Registering the first subscriber starts the uevent dispatch thread;
//! clearing it stops and joins the thread before returning.

use crate::config::UsbdConfig;
use crate::dispatch::{DispatchHandle, EventDispatcher};
use crate::error::Result;
use crate::node_store::NodeStore;
use crate::notify::{deliver, NotificationSink};
use crate::role_switch::RoleSwitchCoordinator;
use crate::session::{DataSessionMonitor, NullDataSessionMonitor};
use crate::status::StatusAggregator;
use crate::telemetry::{TelemetrySink, ThermalTelemetry};
use crate::topology::{
    I2cClientResolver, CONTAMINANT_DETECTION, SINK_LIMIT_CURRENT, SINK_LIMIT_ENABLE,
    SOURCE_LIMIT_ENABLE,
};
use crate::types::{PortRole, PortSnapshot, Status, TransactionId};
use crate::uevent::{EventSource, UeventClassifier};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Port name used when acknowledging a status query.
const ALL_PORTS: &str = "all";

struct Shared {
    config: UsbdConfig,
    store: Arc<dyn NodeStore>,
    source: Arc<dyn EventSource>,
    i2c: Arc<I2cClientResolver>,
    aggregator: Arc<StatusAggregator>,
    coordinator: Arc<RoleSwitchCoordinator>,
    dispatcher: Arc<EventDispatcher>,
    /// Running dispatch thread; present exactly while a subscriber is.
    lifecycle: Mutex<Option<DispatchHandle>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(handle) = self.lifecycle.get_mut().take() {
            handle.stop();
        }
    }
}

/// USB Type-C port coordination service.
#[derive(Clone)]
pub struct UsbService {
    shared: Arc<Shared>,
}

impl UsbService {
    /// Creates a service with thermal telemetry read from the configured
    /// plug temperature node and no data session monitoring.
    pub fn new(
        config: UsbdConfig,
        store: Arc<dyn NodeStore>,
        source: Arc<dyn EventSource>,
    ) -> Self {
        let telemetry = Arc::new(ThermalTelemetry::new(
            Arc::clone(&store),
            &config.paths.plug_temperature,
        ));
        Self::with_collaborators(
            config,
            store,
            source,
            Arc::new(NullDataSessionMonitor),
            telemetry,
        )
    }

    pub fn with_collaborators(
        config: UsbdConfig,
        store: Arc<dyn NodeStore>,
        source: Arc<dyn EventSource>,
        session: Arc<dyn DataSessionMonitor>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        info!(
            input_power_limited_warning = config.features.input_power_limited_warning,
            contaminant_detection_disabled = config.features.contaminant_detection_disabled,
            partner_wait_timeout_ms = config.timing.partner_wait_timeout_ms,
            "Creating USB service"
        );

        let i2c = Arc::new(I2cClientResolver::new(
            &config.paths.hsi2c,
            &config.paths.tcpc_device_name,
            &config.paths.i2c_client_id,
        ));
        let aggregator = Arc::new(StatusAggregator::new(
            Arc::clone(&store),
            &config,
            Arc::clone(&i2c),
            session,
        ));
        let coordinator = Arc::new(RoleSwitchCoordinator::new(Arc::clone(&store), &config));
        let dispatcher = Arc::new(EventDispatcher::new(
            Arc::clone(&aggregator),
            Arc::clone(&coordinator),
            Arc::clone(&store),
            UeventClassifier::new(&config.uevent),
            telemetry,
            &config.paths.overheat_stats,
        ));

        Self {
            shared: Arc::new(Shared {
                config,
                store,
                source,
                i2c,
                aggregator,
                coordinator,
                dispatcher,
                lifecycle: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &UsbdConfig {
        &self.shared.config
    }

    /// Last published snapshot.
    pub fn last_snapshot(&self) -> PortSnapshot {
        self.shared.aggregator.lock().ports().to_vec()
    }

    /// True while the dispatch thread is running.
    pub fn is_dispatching(&self) -> bool {
        self.shared
            .lifecycle
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Registers, replaces or clears the subscriber.
    ///
    /// absent -> present starts the dispatch thread; present -> absent stops
    /// and joins it before returning. Other transitions only swap the handle.
    #[instrument(skip_all, fields(subscribe = subscriber.is_some()))]
    pub fn set_subscriber(&self, subscriber: Option<Arc<dyn NotificationSink>>) -> Result<()> {
        let shared = &self.shared;
        let mut lifecycle = shared.lifecycle.lock();

        match (lifecycle.take(), subscriber) {
            (None, None) => {
                shared.aggregator.lock().set_subscriber(None);
                debug!("Subscriber already absent");
                Ok(())
            }
            (Some(handle), None) => {
                // Joined without the status section held; the loop may be
                // waiting on it.
                handle.stop();
                shared.aggregator.lock().set_subscriber(None);
                info!("Subscriber cleared, dispatch loop stopped");
                Ok(())
            }
            (Some(handle), Some(subscriber)) if !handle.is_finished() => {
                shared.aggregator.lock().set_subscriber(Some(subscriber));
                *lifecycle = Some(handle);
                debug!("Subscriber replaced");
                Ok(())
            }
            (previous, Some(subscriber)) => {
                if let Some(handle) = previous {
                    warn!("Dispatch loop had exited, restarting");
                    handle.stop();
                }
                shared.aggregator.lock().set_subscriber(Some(subscriber));
                let dispatcher = Arc::clone(&shared.dispatcher);
                match DispatchHandle::spawn(dispatcher, shared.source.as_ref()) {
                    Ok(handle) => {
                        *lifecycle = Some(handle);
                        info!("Subscriber registered, dispatch loop started");
                        Ok(())
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to start dispatch loop");
                        shared.aggregator.lock().set_subscriber(None);
                        Err(e)
                    }
                }
            }
        }
    }

    /// Recomputes and publishes status, then acknowledges the query.
    #[instrument(skip(self))]
    pub fn query_port_status(&self, transaction_id: TransactionId) -> Status {
        let aggregator = &self.shared.aggregator;
        let mut state = aggregator.lock();
        aggregator.refresh_locked(&mut state);
        deliver(state.subscriber(), "query_port_status", |sink| {
            sink.query_port_status(ALL_PORTS, Status::Success, transaction_id)
        });
        Status::Success
    }

    #[instrument(skip(self, role), fields(role = %role))]
    pub fn switch_role(&self, port: &str, role: PortRole, transaction_id: TransactionId) -> Status {
        let aggregator = &self.shared.aggregator;
        self.shared.coordinator.switch_role(port, role, |status| {
            let mut state = aggregator.lock();
            deliver(state.subscriber(), "role_switch_status", |sink| {
                sink.role_switch_status(port, &role, status, transaction_id)
            });
            aggregator.refresh_locked(&mut state);
        })
    }

    /// Turns USB data signaling on or off.
    ///
    /// Every sub-write is attempted; the remembered enable state only
    /// changes when all of them succeeded.
    #[instrument(skip(self))]
    pub fn enable_usb_data(
        &self,
        port: &str,
        enable: bool,
        transaction_id: TransactionId,
    ) -> Status {
        let paths = &self.shared.config.paths;
        let aggregator = &self.shared.aggregator;
        let mut success = true;

        if enable {
            if !aggregator.usb_data_enabled() {
                if let Ok(pullup) = self.shared.store.read_trimmed(&paths.gadget_pullup) {
                    if pullup != paths.gadget_name {
                        success &= self.write_node(
                            &paths.gadget_pullup,
                            &paths.gadget_name,
                            "gadget pull-up",
                        );
                    }
                }
                success &=
                    self.write_node(&paths.usb_data_enabled, "1", "usb connection notification");
            }
        } else {
            if let Ok(pullup) = self.shared.store.read_trimmed(&paths.gadget_pullup) {
                if pullup == paths.gadget_name {
                    success &= self.write_node(&paths.gadget_pullup, "none", "gadget pull-down");
                }
            }
            success &= self.write_node(&paths.host_mode_id, "1", "host mode id");
            success &= self.write_node(&paths.vbus_session, "0", "vbus session");
            success &= self.write_node(&paths.usb_data_enabled, "0", "usb connection notification");
        }

        if success {
            aggregator.set_usb_data_enabled(enable);
        }
        let status = Status::from_success(success);

        let mut state = aggregator.lock();
        deliver(state.subscriber(), "enable_usb_data_status", |sink| {
            sink.enable_usb_data_status(port, enable, status, transaction_id)
        });
        aggregator.refresh_locked(&mut state);
        status
    }

    /// Moves data from the dock to the USB port, where the dock supports it.
    #[instrument(skip(self))]
    pub fn enable_usb_data_while_docked(
        &self,
        port: &str,
        transaction_id: TransactionId,
    ) -> Status {
        let node = &self.shared.config.paths.dock_move_data_to_usb;
        let status = if self.shared.store.exists(node) {
            Status::from_success(self.write_node(node, "1", "move data to usb"))
        } else {
            info!(node = %node.display(), "Dock data control not present");
            Status::NotSupported
        };

        let aggregator = &self.shared.aggregator;
        let mut state = aggregator.lock();
        deliver(state.subscriber(), "enable_usb_data_while_docked_status", |sink| {
            sink.enable_usb_data_while_docked_status(port, status, transaction_id)
        });
        aggregator.refresh_locked(&mut state);
        status
    }

    /// Pulls the gadget down; the host re-enumerates once it binds again.
    #[instrument(skip(self))]
    pub fn reset_usb_port(&self, port: &str, transaction_id: TransactionId) -> Status {
        let status = Status::from_success(self.write_node(
            &self.shared.config.paths.gadget_pullup,
            "none",
            "gadget pull-down",
        ));

        let state = self.shared.aggregator.lock();
        deliver(state.subscriber(), "reset_usb_port_status", |sink| {
            sink.reset_usb_port_status(port, status, transaction_id)
        });
        status
    }

    /// Enables or disables sink and source current limiting.
    ///
    /// Negative transaction ids mark internal requests that are not reported.
    #[instrument(skip(self))]
    pub fn limit_power_transfer(
        &self,
        port: &str,
        limit: bool,
        transaction_id: TransactionId,
    ) -> Status {
        let aggregator = &self.shared.aggregator;
        let client = self.shared.i2c.resolve(self.shared.store.as_ref());

        let mut state = aggregator.lock();
        let status = match client {
            Ok(client) => {
                let mut success = true;
                if limit {
                    success &= self.write_node(
                        &client.join(SINK_LIMIT_CURRENT),
                        "0",
                        "sink current limit",
                    );
                }
                let value = if limit { "1" } else { "0" };
                success &=
                    self.write_node(&client.join(SINK_LIMIT_ENABLE), value, "sink limit enable");
                success &= self.write_node(
                    &client.join(SOURCE_LIMIT_ENABLE),
                    value,
                    "source limit enable",
                );
                Status::from_success(success)
            }
            Err(e) => {
                error!(error = %e, "Unable to locate i2c bus node");
                Status::Error
            }
        };

        if transaction_id >= 0 {
            deliver(state.subscriber(), "limit_power_transfer_status", |sink| {
                sink.limit_power_transfer_status(port, limit, status, transaction_id)
            });
        } else {
            debug!("Internal power limit request, not notifying");
        }
        aggregator.refresh_locked(&mut state);
        status
    }

    /// Toggles contaminant presence detection unless disabled by configuration.
    #[instrument(skip(self))]
    pub fn enable_contaminant_presence_detection(
        &self,
        port: &str,
        enable: bool,
        transaction_id: TransactionId,
    ) -> Status {
        let status = if self.shared.config.features.contaminant_detection_disabled {
            info!("Contaminant detection disabled by configuration, ignoring request");
            Status::Success
        } else {
            match self.shared.i2c.resolve(self.shared.store.as_ref()) {
                Ok(client) => Status::from_success(self.write_node(
                    &client.join(CONTAMINANT_DETECTION),
                    if enable { "1" } else { "0" },
                    "contaminant detection",
                )),
                Err(e) => {
                    error!(error = %e, "Unable to locate i2c bus node");
                    Status::Error
                }
            }
        };

        let aggregator = &self.shared.aggregator;
        let mut state = aggregator.lock();
        deliver(state.subscriber(), "contaminant_detection_status", |sink| {
            sink.contaminant_detection_status(port, enable, status, transaction_id)
        });
        aggregator.refresh_locked(&mut state);
        status
    }

    fn write_node(&self, path: &Path, value: &str, what: &str) -> bool {
        match self.shared.store.write(path, value) {
            Ok(()) => {
                debug!(node = what, value, "Wrote node");
                true
            }
            Err(e) => {
                error!(node = what, error = %e, "Failed to write node");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_store::MemoryNodeStore;
    use crate::notify::MockNotificationSink;
    use crate::types::{PortPowerRole, UsbDataStatus};
    use crate::uevent::ChannelEventSource;
    use pretty_assertions::assert_eq;

    const TYPEC: &str = "/sys/class/typec";
    const I2C: &str = "/sys/devices/platform/10d60000.hsi2c/i2c-7/7-0025";
    const PULLUP: &str = "/config/usb_gadget/g1/UDC";

    fn setup() -> (Arc<MemoryNodeStore>, ChannelEventSource, UsbService) {
        let store = Arc::new(MemoryNodeStore::new());
        store.add_link(TYPEC, "port0");
        store.add_link(TYPEC, "port0-partner");
        store.set(format!("{}/port0/power_role", TYPEC), "source [sink]");
        store.set(format!("{}/port0/data_role", TYPEC), "host [device]");
        store.set(format!("{}/port0/port_type", TYPEC), "[dual] source sink");
        store.set(format!("{}/name", I2C), "max77759tcpc");
        store.set(format!("{}/contaminant_detection", I2C), "0");
        store.set(format!("{}/usb_limit_sink_enable", I2C), "0");
        store.set(PULLUP, "11210000.dwc3");

        let source = ChannelEventSource::new();
        let mut config = UsbdConfig::default();
        config.timing.partner_wait_timeout_ms = 100;
        let service = UsbService::new(config, store.clone(), Arc::new(source.clone()));
        (store, source, service)
    }

    #[test]
    fn test_query_notifies_snapshot_and_ack() {
        let (_store, _source, service) = setup();
        let mut sink = MockNotificationSink::new();
        sink.expect_port_status_changed()
            .withf(|ports, status| ports.len() == 1 && *status == Status::Success)
            .times(1)
            .returning(|_, _| Ok(()));
        sink.expect_query_port_status()
            .withf(|port, status, txn| {
                port.to_string() == "all" && *status == Status::Success && *txn == 42
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        service.shared.aggregator.lock().set_subscriber(Some(Arc::new(sink)));

        assert_eq!(service.query_port_status(42), Status::Success);
        assert_eq!(service.last_snapshot()[0].current_power_role, PortPowerRole::Sink);
    }

    #[test]
    fn test_operations_without_subscriber() {
        let (_store, _source, service) = setup();
        assert_eq!(service.query_port_status(1), Status::Success);
        assert_eq!(service.reset_usb_port("port0", 2), Status::Success);
    }

    #[test]
    fn test_disable_usb_data_writes_nodes() {
        let (store, _source, service) = setup();
        let paths = service.config().paths.clone();

        assert_eq!(service.enable_usb_data("port0", false, 3), Status::Success);
        assert_eq!(store.get(PULLUP).as_deref(), Some("none"));
        assert_eq!(store.writes_to(&paths.host_mode_id), vec!["1".to_string()]);
        assert_eq!(store.writes_to(&paths.vbus_session), vec!["0".to_string()]);
        assert_eq!(store.writes_to(&paths.usb_data_enabled), vec!["0".to_string()]);
        assert_eq!(
            service.last_snapshot()[0].usb_data_status,
            vec![UsbDataStatus::DisabledForce]
        );

        assert_eq!(service.enable_usb_data("port0", true, 4), Status::Success);
        assert_eq!(store.get(PULLUP).as_deref(), Some("11210000.dwc3"));
        assert_eq!(
            service.last_snapshot()[0].usb_data_status,
            vec![UsbDataStatus::Enabled]
        );
    }

    #[test]
    fn test_partial_disable_keeps_flag() {
        let (store, _source, service) = setup();
        store.fail_writes(service.config().paths.vbus_session.clone());

        assert_eq!(service.enable_usb_data("port0", false, 5), Status::Error);
        // Remaining writes are still attempted.
        assert_eq!(
            store.writes_to(&service.config().paths.usb_data_enabled),
            vec!["0".to_string()]
        );
        assert_eq!(
            service.last_snapshot()[0].usb_data_status,
            vec![UsbDataStatus::Enabled]
        );
    }

    #[test]
    fn test_enable_when_already_enabled_writes_nothing() {
        let (store, _source, service) = setup();
        assert_eq!(service.enable_usb_data("port0", true, 6), Status::Success);
        assert!(store.writes().is_empty());
    }

    #[test]
    fn test_docked_not_supported() {
        let (store, _source, service) = setup();
        assert_eq!(service.enable_usb_data_while_docked("port0", 7), Status::NotSupported);

        let node = service.config().paths.dock_move_data_to_usb.clone();
        store.set(node.clone(), "0");
        assert_eq!(service.enable_usb_data_while_docked("port0", 8), Status::Success);
        assert_eq!(store.writes_to(&node), vec!["1".to_string()]);
    }

    #[test]
    fn test_reset_usb_port() {
        let (store, _source, service) = setup();
        assert_eq!(service.reset_usb_port("port0", 9), Status::Success);
        assert_eq!(store.writes_to(PULLUP), vec!["none".to_string()]);

        store.fail_writes(PULLUP);
        assert_eq!(service.reset_usb_port("port0", 10), Status::Error);
    }

    #[test]
    fn test_limit_power_transfer() {
        let (store, _source, service) = setup();
        assert_eq!(service.limit_power_transfer("port0", true, 11), Status::Success);
        assert_eq!(
            store.writes_to(format!("{}/usb_limit_sink_current", I2C)),
            vec!["0".to_string()]
        );
        assert_eq!(
            store.writes_to(format!("{}/usb_limit_source_enable", I2C)),
            vec!["1".to_string()]
        );
        assert!(service.last_snapshot()[0].power_transfer_limited);

        store.fail_writes(format!("{}/usb_limit_sink_enable", I2C));
        assert_eq!(service.limit_power_transfer("port0", false, 12), Status::Error);
        assert_eq!(
            store.writes_to(format!("{}/usb_limit_source_enable", I2C)),
            vec!["1".to_string(), "0".to_string()]
        );
    }

    #[test]
    fn test_limit_power_transfer_skips_unreadable_client() {
        let (store, _source, service) = setup();
        let stray = "/sys/devices/platform/10d60000.hsi2c/i2c-3/3-0025";
        store.set(format!("{}/uevent", stray), "");

        assert_eq!(service.limit_power_transfer("port0", true, 13), Status::Success);
        assert_eq!(
            store.writes_to(format!("{}/usb_limit_sink_enable", I2C)),
            vec!["1".to_string()]
        );
        assert!(store.writes_to(format!("{}/usb_limit_sink_enable", stray)).is_empty());
    }

    #[test]
    fn test_internal_limit_not_reported() {
        let (_store, _source, service) = setup();
        let mut sink = MockNotificationSink::new();
        sink.expect_port_status_changed().returning(|_, _| Ok(()));
        sink.expect_limit_power_transfer_status().times(0);
        service.shared.aggregator.lock().set_subscriber(Some(Arc::new(sink)));

        assert_eq!(service.limit_power_transfer("port0", true, -1), Status::Success);
    }

    #[test]
    fn test_contaminant_detection_toggle() {
        let (store, _source, service) = setup();
        assert_eq!(
            service.enable_contaminant_presence_detection("port0", true, 13),
            Status::Success
        );
        assert_eq!(
            store.writes_to(format!("{}/contaminant_detection", I2C)),
            vec!["1".to_string()]
        );
    }

    #[test]
    fn test_contaminant_detection_disabled_by_config() {
        let store = Arc::new(MemoryNodeStore::new());
        store.add_link(TYPEC, "port0");
        let mut config = UsbdConfig::default();
        config.features.contaminant_detection_disabled = true;
        let service = UsbService::new(config, store.clone(), Arc::new(ChannelEventSource::new()));

        assert_eq!(
            service.enable_contaminant_presence_detection("port0", true, 14),
            Status::Success
        );
        assert!(store.writes().is_empty());
    }

    #[test]
    fn test_subscriber_lifecycle() {
        let (_store, source, service) = setup();
        assert!(!service.is_dispatching());

        service.set_subscriber(Some(Arc::new(crate::notify::LoggingSink))).unwrap();
        assert!(service.is_dispatching());
        assert_eq!(source.open_count(), 1);

        // Replacing keeps the running loop.
        service.set_subscriber(Some(Arc::new(crate::notify::LoggingSink))).unwrap();
        assert_eq!(source.open_count(), 1);

        service.set_subscriber(None).unwrap();
        assert!(!service.is_dispatching());
        assert!(!source.is_streaming());

        // Clearing twice is a no-op.
        service.set_subscriber(None).unwrap();
        assert_eq!(source.open_count(), 1);
    }
}
