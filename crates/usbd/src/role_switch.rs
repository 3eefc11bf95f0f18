//! Role switch coordination
//!
//! Role switches are requested by writing a role node and, for mode
//! changes, confirmed asynchronously by a partner-attach uevent. At most one
//! switch runs at a time ([`RoleSwitchCoordinator::switch_role`] holds the
//! role-switch section for its full duration, bounded wait included).
//!
//! Any switch that does not converge falls back to dual-role mode so the
//! port stays advertisable.

use crate::config::UsbdConfig;
use crate::error::{Result, UsbError};
use crate::node_store::NodeStore;
use crate::topology::{extract_role, TypecLayout};
use crate::types::{PortMode, PortRole, RoleKind, Status};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// The single in-flight partner-attach wait slot.
#[derive(Debug, Default)]
pub struct PartnerWait {
    observed: Mutex<bool>,
    signal: Condvar,
}

impl PartnerWait {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a partner attach and wakes the waiter, if any.
    pub fn notify_partner_attached(&self) {
        let mut observed = self.observed.lock();
        *observed = true;
        self.signal.notify_one();
    }

    /// Clears the observed flag, runs `trigger` and waits up to `timeout`
    /// for a partner attach.
    ///
    /// `trigger` runs inside the section so an attach that races the write
    /// is not lost. The deadline is fixed before the first wait; wakes
    /// without the flag set only consume the remaining time. Returns
    /// `Ok(false)` on timeout.
    pub fn arm_and_wait<F>(&self, timeout: Duration, trigger: F) -> Result<bool>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut observed = self.observed.lock();
        *observed = false;
        trigger()?;

        // A timeout past the clock's range waits for the attach alone.
        let deadline = Instant::now().checked_add(timeout);
        loop {
            match deadline {
                Some(deadline) => {
                    if self.signal.wait_until(&mut observed, deadline).timed_out() {
                        return Ok(false);
                    }
                }
                None => self.signal.wait(&mut observed),
            }
            if *observed {
                return Ok(true);
            }
            debug!("Partner wait woken without attach, waiting again");
        }
    }
}

/// Executes role switch requests.
pub struct RoleSwitchCoordinator {
    store: Arc<dyn NodeStore>,
    layout: TypecLayout,
    partner: Arc<PartnerWait>,
    section: Mutex<()>,
    partner_wait_timeout: Duration,
    retry_backoff: Duration,
}

impl RoleSwitchCoordinator {
    pub fn new(store: Arc<dyn NodeStore>, config: &UsbdConfig) -> Self {
        Self {
            store,
            layout: TypecLayout::new(&config.paths.typec_class),
            partner: Arc::new(PartnerWait::new()),
            section: Mutex::new(()),
            partner_wait_timeout: config.partner_wait_timeout(),
            retry_backoff: config.role_swap_retry(),
        }
    }

    pub fn partner_wait(&self) -> &Arc<PartnerWait> {
        &self.partner
    }

    /// Enters the role-switch section if no switch is in flight.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, ()>> {
        self.section.try_lock()
    }

    /// Switches `port` to `role`.
    ///
    /// `complete` runs with the outcome before the role-switch section is
    /// released; it is where the caller reports and recomputes status.
    pub fn switch_role<F>(&self, port: &str, role: PortRole, complete: F) -> Status
    where
        F: FnOnce(Status),
    {
        let _section = self.section.lock();
        info!(port, role = %role, value = role.node_value(), "Switching role");

        let result = match role {
            PortRole::Mode(mode) => self.switch_mode(port, mode),
            PortRole::PowerRole(_) | PortRole::DataRole(_) => self.write_role(port, role),
        };

        let status = match result {
            Ok(()) => {
                info!(port, role = %role, "Role switch succeeded");
                Status::Success
            }
            Err(e) => {
                error!(port, role = %role, error = %e, "Role switch failed");
                self.switch_to_drp(port);
                Status::Error
            }
        };

        complete(status);
        status
    }

    /// Writes dual-role mode to the port. Best-effort: failures are logged.
    pub fn switch_to_drp(&self, port: &str) {
        let path = self.layout.role_node(port, RoleKind::Mode);
        match self.store.write(&path, PortMode::Drp.node_value()) {
            Ok(()) => debug!(port, "Switched back to dual role"),
            Err(e) => error!(port, error = %e, "Failed to switch back to dual role"),
        }
    }

    fn switch_mode(&self, port: &str, mode: PortMode) -> Result<()> {
        let path = self.layout.role_node(port, RoleKind::Mode);
        let value = mode.node_value();

        let confirmed = self
            .partner
            .arm_and_wait(self.partner_wait_timeout, || self.store.write(&path, value))?;
        if confirmed {
            Ok(())
        } else {
            info!(
                port,
                timeout_ms = self.partner_wait_timeout.as_millis() as u64,
                "Partner wait timed out"
            );
            Err(UsbError::Timeout(format!("partner attach on {}", port)))
        }
    }

    /// Writes a power or data role, retrying once on contention, then
    /// verifies the node reports the requested role.
    fn write_role(&self, port: &str, role: PortRole) -> Result<()> {
        let path = self.layout.role_node(port, role.kind());
        let value = role.node_value();

        match self.store.write(&path, value) {
            Err(e) if e.is_retryable() => {
                warn!(
                    port,
                    backoff_ms = self.retry_backoff.as_millis() as u64,
                    "Role switch busy, retrying"
                );
                thread::sleep(self.retry_backoff);
                self.store.write(&path, value)?;
            }
            result => result?,
        }

        let written = self.store.read_trimmed(&path)?;
        let actual = extract_role(&written);
        debug!(port, written = actual, "Read back role");
        if actual == value {
            Ok(())
        } else {
            Err(UsbError::RoleNotApplied {
                path,
                requested: value.to_string(),
                actual: actual.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_store::MemoryNodeStore;
    use crate::types::{PortDataRole, PortPowerRole};
    use pretty_assertions::assert_eq;

    const POWER: &str = "/sys/class/typec/port0/power_role";
    const DATA: &str = "/sys/class/typec/port0/data_role";
    const MODE: &str = "/sys/class/typec/port0/port_type";

    fn config(timeout_ms: u64) -> UsbdConfig {
        let mut config = UsbdConfig::default();
        config.timing.partner_wait_timeout_ms = timeout_ms;
        config.timing.role_swap_retry_ms = 5;
        config
    }

    fn setup(timeout_ms: u64) -> (Arc<MemoryNodeStore>, RoleSwitchCoordinator) {
        let store = Arc::new(MemoryNodeStore::new());
        store.set(POWER, "[source] sink");
        store.set(DATA, "[host] device");
        store.set(MODE, "[dual] source sink");
        let coordinator = RoleSwitchCoordinator::new(store.clone(), &config(timeout_ms));
        (store, coordinator)
    }

    #[test]
    fn test_power_role_switch() {
        let (store, coordinator) = setup(50);
        let mut reported = None;
        let status = coordinator.switch_role(
            "port0",
            PortRole::PowerRole(PortPowerRole::Sink),
            |s| reported = Some(s),
        );

        assert_eq!(status, Status::Success);
        assert_eq!(reported, Some(Status::Success));
        assert_eq!(store.writes_to(POWER), vec!["sink".to_string()]);
        assert!(store.writes_to(MODE).is_empty());
    }

    #[test]
    fn test_busy_write_retried_once() {
        let (store, coordinator) = setup(50);
        store.busy(DATA, 1);

        let status =
            coordinator.switch_role("port0", PortRole::DataRole(PortDataRole::Device), |_| {});
        assert_eq!(status, Status::Success);
        assert_eq!(store.writes_to(DATA), vec!["device".to_string()]);
        assert_eq!(store.writes().len(), 2);
    }

    #[test]
    fn test_busy_twice_fails_with_fallback() {
        let (store, coordinator) = setup(50);
        store.busy(DATA, 2);

        let status =
            coordinator.switch_role("port0", PortRole::DataRole(PortDataRole::Device), |_| {});
        assert_eq!(status, Status::Error);
        assert!(store.writes_to(DATA).is_empty());
        assert_eq!(store.writes_to(MODE), vec!["dual".to_string()]);
    }

    #[test]
    fn test_read_back_mismatch_fails() {
        let (store, coordinator) = setup(50);
        store.freeze(POWER);

        let status =
            coordinator.switch_role("port0", PortRole::PowerRole(PortPowerRole::Sink), |_| {});
        assert_eq!(status, Status::Error);
        assert_eq!(store.writes_to(MODE), vec!["dual".to_string()]);
    }

    #[test]
    fn test_mode_switch_timeout_falls_back() {
        let (store, coordinator) = setup(50);
        let started = Instant::now();

        let status = coordinator.switch_role("port0", PortRole::Mode(PortMode::Dfp), |_| {});
        assert_eq!(status, Status::Error);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(
            store.writes_to(MODE),
            vec!["source".to_string(), "dual".to_string()]
        );
    }

    #[test]
    fn test_mode_write_failure_skips_wait() {
        let (store, coordinator) = setup(5_000);
        store.busy(MODE, 1);
        let started = Instant::now();

        let status = coordinator.switch_role("port0", PortRole::Mode(PortMode::Ufp), |_| {});
        assert_eq!(status, Status::Error);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(store.writes_to(MODE), vec!["dual".to_string()]);
    }

    #[test]
    fn test_mode_switch_confirmed_by_partner() {
        let (store, coordinator) = setup(5_000);
        let wait = coordinator.partner_wait().clone();
        store.on_write(move |_, value| {
            if value == "sink" {
                let wait = wait.clone();
                thread::spawn(move || wait.notify_partner_attached());
            }
        });

        let status = coordinator.switch_role("port0", PortRole::Mode(PortMode::Ufp), |_| {});
        assert_eq!(status, Status::Success);
        assert_eq!(store.writes_to(MODE), vec!["sink".to_string()]);
    }

    #[test]
    fn test_unbounded_timeout_waits_for_attach() {
        let wait = Arc::new(PartnerWait::new());
        let waker = wait.clone();

        let confirmed = wait
            .arm_and_wait(Duration::MAX, || {
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(20));
                    waker.notify_partner_attached();
                });
                Ok(())
            })
            .unwrap();

        assert!(confirmed);
    }

    #[test]
    fn test_spurious_wake_keeps_deadline() {
        let wait = Arc::new(PartnerWait::new());
        let waker = wait.clone();
        let started = Instant::now();

        let confirmed = wait
            .arm_and_wait(Duration::from_millis(100), || {
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(20));
                    let _observed = waker.observed.lock();
                    waker.signal.notify_all();
                });
                Ok(())
            })
            .unwrap();

        assert!(!confirmed);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[test]
    fn test_stale_attach_is_cleared() {
        let wait = PartnerWait::new();
        wait.notify_partner_attached();
        let confirmed = wait.arm_and_wait(Duration::from_millis(20), || Ok(())).unwrap();
        assert!(!confirmed);
    }

    #[test]
    fn test_try_lock_reflects_section() {
        let (_store, coordinator) = setup(50);
        assert!(coordinator.try_lock().is_some());

        let coordinator = Arc::new(coordinator);
        let inner = coordinator.clone();
        let observed = coordinator.switch_role(
            "port0",
            PortRole::PowerRole(PortPowerRole::Sink),
            move |_| assert!(inner.try_lock().is_none()),
        );
        assert_eq!(observed, Status::Success);
    }
}
