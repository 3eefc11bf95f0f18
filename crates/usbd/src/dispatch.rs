//! Uevent dispatch loop
//!
//! A single reactor thread consumes uevent records and routes them:
//! partner attaches wake a pending mode switch, topology changes recompute
//! status and return idle ports to dual-role mode, and cooling device
//! changes emit overheat telemetry. Stopping is cooperative: the flag is
//! checked after each record and the stream is woken so a blocked receive
//! returns immediately.

use crate::error::Result;
use crate::node_store::NodeStore;
use crate::role_switch::RoleSwitchCoordinator;
use crate::status::StatusAggregator;
use crate::telemetry::{emit_overheat_report, TelemetrySink};
use crate::types::PortStatus;
use crate::uevent::{
    EventSource, EventStream, StreamWaker, UeventClassifier, UeventKind, UeventRecord,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace};

const THREAD_NAME: &str = "usbd-uevent";

/// Routes classified uevent records to the coordination components.
pub struct EventDispatcher {
    aggregator: Arc<StatusAggregator>,
    coordinator: Arc<RoleSwitchCoordinator>,
    store: Arc<dyn NodeStore>,
    classifier: UeventClassifier,
    telemetry: Arc<dyn TelemetrySink>,
    overheat_stats: PathBuf,
}

impl EventDispatcher {
    pub fn new(
        aggregator: Arc<StatusAggregator>,
        coordinator: Arc<RoleSwitchCoordinator>,
        store: Arc<dyn NodeStore>,
        classifier: UeventClassifier,
        telemetry: Arc<dyn TelemetrySink>,
        overheat_stats: impl Into<PathBuf>,
    ) -> Self {
        Self {
            aggregator,
            coordinator,
            store,
            classifier,
            telemetry,
            overheat_stats: overheat_stats.into(),
        }
    }

    /// Handles one record and returns how it was classified.
    pub fn handle_record(&self, record: &UeventRecord) -> UeventKind {
        let kind = self.classifier.classify(record);
        match &kind {
            UeventKind::PartnerAttached { port } => {
                info!(port = %port, "Partner attached");
                self.coordinator.partner_wait().notify_partner_attached();
            }
            kind if kind.is_topology_relevant() => {
                debug!(kind = ?kind, header = record.header(), "Port state changed");
                let (ports, _) = self.aggregator.refresh();
                self.reconcile(&ports);
            }
            UeventKind::CoolingDeviceChanged => {
                debug!("USB port cooling device changed");
                emit_overheat_report(
                    self.store.as_ref(),
                    &self.overheat_stats,
                    self.telemetry.as_ref(),
                );
            }
            _ => trace!(header = record.header(), "Ignoring uevent"),
        }
        kind
    }

    /// Returns partnerless ports to dual-role mode unless a switch is in flight.
    fn reconcile(&self, ports: &[PortStatus]) {
        let Some(_section) = self.coordinator.try_lock() else {
            debug!("Role switch in progress, skipping dual role reconciliation");
            return;
        };

        let layout = self.aggregator.layout();
        for port in ports {
            if !self.store.exists(&layout.partner_dir(&port.port_name)) {
                self.coordinator.switch_to_drp(&port.port_name);
            }
        }
    }

    /// Processes records until `stop` is set or the stream fails.
    pub fn run(&self, stream: &mut dyn EventStream, stop: &AtomicBool) {
        info!("Uevent dispatch loop started");
        while !stop.load(Ordering::SeqCst) {
            match stream.next_record() {
                Ok(Some(record)) => {
                    self.handle_record(&record);
                }
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "Uevent stream failed, stopping dispatch loop");
                    break;
                }
            }
        }
        info!("Uevent dispatch loop stopped");
    }
}

/// A running dispatch thread.
pub struct DispatchHandle {
    stop: Arc<AtomicBool>,
    waker: StreamWaker,
    thread: JoinHandle<()>,
}

impl DispatchHandle {
    /// Opens a stream from `source` and starts the dispatch thread.
    pub fn spawn(dispatcher: Arc<EventDispatcher>, source: &dyn EventSource) -> Result<Self> {
        let mut stream = source.open()?;
        let waker = stream.waker();
        let stop = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || dispatcher.run(stream.as_mut(), &flag))?;

        Ok(Self { stop, waker, thread })
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Requests a stop and joins the thread.
    pub fn stop(self) {
        self.stop.store(true, Ordering::SeqCst);
        self.waker.wake();
        if self.thread.join().is_err() {
            error!("Uevent dispatch thread panicked");
        }
    }
}
