//! USB port overheat telemetry
//!
//! When the USB port cooling device changes state, the dispatch loop emits
//! an [`OverheatReport`]: plug and peak temperature plus the trip,
//! hysteresis and cleared durations published by the cooling device.
//! A report is only emitted when every metric could be read.

use crate::error::{Result, UsbError};
use crate::node_store::NodeStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const TRIP_TIME: &str = "trip_time";
const HYSTERESIS_TIME: &str = "hysteresis_time";
const CLEARED_TIME: &str = "cleared_time";

/// One overheat episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverheatReport {
    /// Plug temperature in tenths of a degree Celsius
    pub plug_temperature_deci_c: i32,
    /// Highest temperature seen in tenths of a degree Celsius
    pub max_temperature_deci_c: i32,
    pub time_to_overheat_secs: u64,
    pub time_to_hysteresis_secs: u64,
    pub time_to_inactive_secs: u64,
}

/// Temperature source and destination for overheat reports.
pub trait TelemetrySink: Send + Sync {
    fn plug_temperature_deci_c(&self) -> Result<i32>;

    fn max_temperature_deci_c(&self) -> Result<i32>;

    fn report_overheat(&self, report: &OverheatReport) -> Result<()>;
}

fn read_secs(store: &dyn NodeStore, path: &Path) -> Result<u64> {
    let value = store.read_trimmed(path)?;
    value
        .parse()
        .map_err(|_| UsbError::invalid_value(path, value))
}

/// Reads every metric of an overheat report. Fails on the first unreadable one.
pub fn collect_overheat_report(
    store: &dyn NodeStore,
    stats_dir: &Path,
    telemetry: &dyn TelemetrySink,
) -> Result<OverheatReport> {
    Ok(OverheatReport {
        plug_temperature_deci_c: telemetry.plug_temperature_deci_c()?,
        max_temperature_deci_c: telemetry.max_temperature_deci_c()?,
        time_to_overheat_secs: read_secs(store, &stats_dir.join(TRIP_TIME))?,
        time_to_hysteresis_secs: read_secs(store, &stats_dir.join(HYSTERESIS_TIME))?,
        time_to_inactive_secs: read_secs(store, &stats_dir.join(CLEARED_TIME))?,
    })
}

/// Collects and emits a report; returns false if nothing was emitted.
pub fn emit_overheat_report(
    store: &dyn NodeStore,
    stats_dir: &Path,
    telemetry: &dyn TelemetrySink,
) -> bool {
    let report = match collect_overheat_report(store, stats_dir, telemetry) {
        Ok(report) => report,
        Err(e) => {
            warn!(error = %e, "Skipping overheat report");
            return false;
        }
    };

    match telemetry.report_overheat(&report) {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Failed to deliver overheat report");
            false
        }
    }
}

/// Telemetry backed by a thermal node in millidegrees, logging reports.
///
/// The maximum temperature is the highest plug reading seen by this process.
pub struct ThermalTelemetry {
    store: Arc<dyn NodeStore>,
    node: PathBuf,
    max_deci_c: Mutex<Option<i32>>,
}

impl ThermalTelemetry {
    pub fn new(store: Arc<dyn NodeStore>, node: impl Into<PathBuf>) -> Self {
        Self {
            store,
            node: node.into(),
            max_deci_c: Mutex::new(None),
        }
    }
}

impl TelemetrySink for ThermalTelemetry {
    fn plug_temperature_deci_c(&self) -> Result<i32> {
        let value = self.store.read_trimmed(&self.node)?;
        let millidegrees: i32 = value
            .parse()
            .map_err(|_| UsbError::invalid_value(&self.node, value))?;
        let deci_c = millidegrees / 100;

        let mut max = self.max_deci_c.lock();
        if max.map_or(true, |m| deci_c > m) {
            *max = Some(deci_c);
        }
        Ok(deci_c)
    }

    fn max_temperature_deci_c(&self) -> Result<i32> {
        let max = *self.max_deci_c.lock();
        match max {
            Some(max) => Ok(max),
            None => self.plug_temperature_deci_c(),
        }
    }

    fn report_overheat(&self, report: &OverheatReport) -> Result<()> {
        info!(
            plug_temperature_deci_c = report.plug_temperature_deci_c,
            max_temperature_deci_c = report.max_temperature_deci_c,
            time_to_overheat_secs = report.time_to_overheat_secs,
            time_to_hysteresis_secs = report.time_to_hysteresis_secs,
            time_to_inactive_secs = report.time_to_inactive_secs,
            "USB port overheat"
        );
        Ok(())
    }
}
