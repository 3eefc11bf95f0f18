//! USB data session monitoring
//!
//! A data session monitor watches gadget/host enumeration and reports
//! data-path compliance problems (missing data lines, enumeration failures,
//! flaky connections). The aggregator only asks it for the warnings that
//! apply to the current data role of the primary port.

use crate::types::{ComplianceWarning, PortDataRole};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Source of data-session compliance warnings.
pub trait DataSessionMonitor: Send + Sync {
    fn compliance_warnings(&self, data_role: PortDataRole) -> Vec<ComplianceWarning>;
}

/// Monitor that never reports warnings.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDataSessionMonitor;

impl DataSessionMonitor for NullDataSessionMonitor {
    fn compliance_warnings(&self, _data_role: PortDataRole) -> Vec<ComplianceWarning> {
        Vec::new()
    }
}

/// Monitor returning warnings recorded per data role.
#[derive(Debug, Default)]
pub struct FixedDataSessionMonitor {
    warnings: Mutex<HashMap<PortDataRole, Vec<ComplianceWarning>>>,
}

impl FixedDataSessionMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the warnings reported while in `data_role`.
    pub fn set_warnings(&self, data_role: PortDataRole, warnings: Vec<ComplianceWarning>) {
        self.warnings.lock().insert(data_role, warnings);
    }

    pub fn clear(&self) {
        self.warnings.lock().clear();
    }
}

impl DataSessionMonitor for FixedDataSessionMonitor {
    fn compliance_warnings(&self, data_role: PortDataRole) -> Vec<ComplianceWarning> {
        self.warnings
            .lock()
            .get(&data_role)
            .cloned()
            .unwrap_or_default()
    }
}
