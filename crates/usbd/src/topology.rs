//! Type-C class topology
//!
//! The kernel Type-C class exposes one symlink per port (`port0`) and one per
//! attached partner (`port0-partner`). Role, accessory and compliance nodes
//! hang off those directories; [`TypecLayout`] centralizes their paths.

use crate::error::{Result, UsbError};
use crate::node_store::NodeStore;
use crate::types::RoleKind;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const PARTNER_SUFFIX: &str = "-partner";

/// Contaminant detection enable, under the TCPC i2c client.
pub const CONTAMINANT_DETECTION: &str = "contaminant_detection";
/// Contaminant detection result, under the TCPC i2c client.
pub const CONTAMINANT_DETECTION_STATUS: &str = "contaminant_detection_status";
pub const SINK_LIMIT_ENABLE: &str = "usb_limit_sink_enable";
pub const SOURCE_LIMIT_ENABLE: &str = "usb_limit_source_enable";
pub const SINK_LIMIT_CURRENT: &str = "usb_limit_sink_current";

/// Paths of the per-port nodes under the Type-C class directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypecLayout {
    class_dir: PathBuf,
}

impl TypecLayout {
    pub fn new(class_dir: impl Into<PathBuf>) -> Self {
        Self {
            class_dir: class_dir.into(),
        }
    }

    pub fn class_dir(&self) -> &Path {
        &self.class_dir
    }

    pub fn port_dir(&self, port: &str) -> PathBuf {
        self.class_dir.join(port)
    }

    /// Directory that exists only while a partner is attached.
    pub fn partner_dir(&self, port: &str) -> PathBuf {
        self.class_dir.join(format!("{}{}", port, PARTNER_SUFFIX))
    }

    /// Node controlling the given role family.
    pub fn role_node(&self, port: &str, kind: RoleKind) -> PathBuf {
        self.port_dir(port).join(kind.node_name())
    }

    pub fn accessory_mode(&self, port: &str) -> PathBuf {
        self.partner_dir(port).join("accessory_mode")
    }

    pub fn partner_pd_support(&self, port: &str) -> PathBuf {
        self.partner_dir(port).join("supports_usb_power_delivery")
    }

    pub fn compliance_reasons(&self, port: &str) -> PathBuf {
        self.port_dir(port).join("device").join("non_compliant_reasons")
    }
}

/// A port discovered in the class directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortTopology {
    pub name: String,
    /// A partner symlink exists for this port.
    pub connected: bool,
}

/// Enumerates ports and their connected flag, ordered by port name.
pub fn enumerate_ports(store: &dyn NodeStore, layout: &TypecLayout) -> Result<Vec<PortTopology>> {
    let mut ports: BTreeMap<String, bool> = BTreeMap::new();

    for entry in store.list_dir(layout.class_dir())? {
        if !entry.is_link {
            continue;
        }
        if entry.name.contains(PARTNER_SUFFIX) {
            let port = entry.name.split('-').next().unwrap_or_default();
            if !port.is_empty() {
                ports.insert(port.to_string(), true);
            }
        } else {
            ports.entry(entry.name).or_insert(false);
        }
    }

    Ok(ports
        .into_iter()
        .map(|(name, connected)| PortTopology { name, connected })
        .collect())
}

/// Extracts the active entry of a role node (`"[source] sink"` -> `"source"`).
///
/// Values without brackets are returned trimmed.
pub fn extract_role(raw: &str) -> &str {
    let raw = raw.trim();
    match (raw.find('['), raw.find(']')) {
        (Some(first), Some(last)) if first < last => &raw[first + 1..last],
        _ => raw,
    }
}

/// Locates the TCPC i2c client directory and memoizes it.
///
/// Resolution is retried on each call until it succeeds once.
#[derive(Debug)]
pub struct I2cClientResolver {
    hsi2c: PathBuf,
    device_name: String,
    client_id: String,
    resolved: Mutex<Option<PathBuf>>,
}

impl I2cClientResolver {
    pub fn new(
        hsi2c: impl Into<PathBuf>,
        device_name: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            hsi2c: hsi2c.into(),
            device_name: device_name.into(),
            client_id: client_id.into(),
            resolved: Mutex::new(None),
        }
    }

    /// Returns the client directory, scanning `i2c-N/N-<client id>` on first use.
    pub fn resolve(&self, store: &dyn NodeStore) -> Result<PathBuf> {
        let mut resolved = self.resolved.lock();
        if let Some(path) = resolved.as_ref() {
            return Ok(path.clone());
        }

        let path = self.scan(store)?;
        debug!(path = %path.display(), "Resolved i2c client path");
        *resolved = Some(path.clone());
        Ok(path)
    }

    fn scan(&self, store: &dyn NodeStore) -> Result<PathBuf> {
        for entry in store.list_dir(&self.hsi2c)? {
            let Some(bus) = entry.name.strip_prefix("i2c-") else {
                continue;
            };
            let client = self
                .hsi2c
                .join(&entry.name)
                .join(format!("{}-{}", bus, self.client_id));
            if !store.exists(&client) {
                continue;
            }
            match store.read_trimmed(&client.join("name")) {
                Ok(name) if self.name_matches(&name) => return Ok(client),
                Ok(name) => {
                    debug!(client = %client.display(), name = %name, "Skipping i2c client");
                }
                Err(e) => {
                    debug!(
                        client = %client.display(),
                        error = %e,
                        "Skipping unreadable i2c client"
                    );
                }
            }
        }

        warn!(hsi2c = %self.hsi2c.display(), "Unable to locate i2c bus node");
        Err(UsbError::NotFound(format!(
            "i2c client {} under {}",
            self.client_id,
            self.hsi2c.display()
        )))
    }

    fn name_matches(&self, name: &str) -> bool {
        name == self.device_name
            || self
                .device_name
                .strip_prefix("i2c-")
                .is_some_and(|short| short == name)
    }
}
