//! Subscriber notifications
//!
//! Snapshots and per-operation outcomes are delivered to at most one
//! registered [`NotificationSink`]. Delivery is best-effort: with no
//! subscriber the outcome is logged and dropped, and a failing sink is
//! logged without being retried.

use crate::error::Result;
use crate::types::{PortRole, PortStatus, Status, TransactionId};
use std::sync::Arc;
use tracing::{error, info};

/// Receiver of port status snapshots and operation outcomes.
#[cfg_attr(test, mockall::automock)]
pub trait NotificationSink: Send + Sync {
    /// A full snapshot; `status` is the outcome of topology enumeration.
    fn port_status_changed(&self, ports: &[PortStatus], status: Status) -> Result<()>;

    fn role_switch_status(
        &self,
        port: &str,
        role: &PortRole,
        status: Status,
        transaction_id: TransactionId,
    ) -> Result<()>;

    fn enable_usb_data_status(
        &self,
        port: &str,
        enable: bool,
        status: Status,
        transaction_id: TransactionId,
    ) -> Result<()>;

    fn enable_usb_data_while_docked_status(
        &self,
        port: &str,
        status: Status,
        transaction_id: TransactionId,
    ) -> Result<()>;

    fn reset_usb_port_status(
        &self,
        port: &str,
        status: Status,
        transaction_id: TransactionId,
    ) -> Result<()>;

    fn limit_power_transfer_status(
        &self,
        port: &str,
        limit: bool,
        status: Status,
        transaction_id: TransactionId,
    ) -> Result<()>;

    fn contaminant_detection_status(
        &self,
        port: &str,
        enable: bool,
        status: Status,
        transaction_id: TransactionId,
    ) -> Result<()>;

    /// Acknowledges a status query; the snapshot itself arrives through
    /// [`NotificationSink::port_status_changed`].
    fn query_port_status(
        &self,
        port: &str,
        status: Status,
        transaction_id: TransactionId,
    ) -> Result<()>;
}

/// Invokes `notify` on the subscriber, logging failures and absence.
pub(crate) fn deliver<F>(subscriber: Option<&Arc<dyn NotificationSink>>, operation: &str, notify: F)
where
    F: FnOnce(&dyn NotificationSink) -> Result<()>,
{
    match subscriber {
        Some(sink) => {
            if let Err(e) = notify(sink.as_ref()) {
                error!(operation, error = %e, "Subscriber notification failed");
            }
        }
        None => info!(operation, "No subscriber registered, dropping notification"),
    }
}

/// Sink that writes every notification to the log.
///
/// Snapshots are rendered as JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

impl LoggingSink {
    pub fn new() -> Self {
        Self
    }
}

impl NotificationSink for LoggingSink {
    fn port_status_changed(&self, ports: &[PortStatus], status: Status) -> Result<()> {
        let snapshot = serde_json::to_string(ports)?;
        info!(status = %status, ports = ports.len(), %snapshot, "Port status changed");
        Ok(())
    }

    fn role_switch_status(
        &self,
        port: &str,
        role: &PortRole,
        status: Status,
        transaction_id: TransactionId,
    ) -> Result<()> {
        info!(port, %role, status = %status, transaction_id, "Role switch completed");
        Ok(())
    }

    fn enable_usb_data_status(
        &self,
        port: &str,
        enable: bool,
        status: Status,
        transaction_id: TransactionId,
    ) -> Result<()> {
        info!(port, enable, status = %status, transaction_id, "USB data enable completed");
        Ok(())
    }

    fn enable_usb_data_while_docked_status(
        &self,
        port: &str,
        status: Status,
        transaction_id: TransactionId,
    ) -> Result<()> {
        info!(port, status = %status, transaction_id, "USB data while docked completed");
        Ok(())
    }

    fn reset_usb_port_status(
        &self,
        port: &str,
        status: Status,
        transaction_id: TransactionId,
    ) -> Result<()> {
        info!(port, status = %status, transaction_id, "USB port reset completed");
        Ok(())
    }

    fn limit_power_transfer_status(
        &self,
        port: &str,
        limit: bool,
        status: Status,
        transaction_id: TransactionId,
    ) -> Result<()> {
        info!(port, limit, status = %status, transaction_id, "Power transfer limit completed");
        Ok(())
    }

    fn contaminant_detection_status(
        &self,
        port: &str,
        enable: bool,
        status: Status,
        transaction_id: TransactionId,
    ) -> Result<()> {
        info!(
            port,
            enable,
            status = %status,
            transaction_id,
            "Contaminant detection toggle completed"
        );
        Ok(())
    }

    fn query_port_status(
        &self,
        port: &str,
        status: Status,
        transaction_id: TransactionId,
    ) -> Result<()> {
        info!(port, status = %status, transaction_id, "Port status query dispatched");
        Ok(())
    }
}
