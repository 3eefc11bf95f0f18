//! Hardware node access
//!
//! Every sysfs/configfs interaction goes through [`NodeStore`], a small
//! string key-value contract over paths. [`SysfsNodeStore`] talks to the real
//! filesystem; [`MemoryNodeStore`] is an in-memory store used by tests and
//! simulations, with fault injection and a write journal.

use crate::error::{Result, UsbError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Directory entry returned by [`NodeStore::list_dir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    /// Class directories expose devices as symlinks.
    pub is_link: bool,
}

/// String key-value access to hardware control nodes.
///
/// Implementations must be callable from the reactor thread and caller
/// threads concurrently.
pub trait NodeStore: Send + Sync {
    /// Reads the raw content of a node.
    fn read(&self, path: &Path) -> Result<String>;

    /// Writes `value` to a node. Contention is reported as [`UsbError::Busy`].
    fn write(&self, path: &Path, value: &str) -> Result<()>;

    /// Returns true if a node or directory exists at `path`.
    fn exists(&self, path: &Path) -> bool;

    /// Lists the entries of a directory.
    fn list_dir(&self, path: &Path) -> Result<Vec<DirEntry>>;

    /// Reads a node with surrounding whitespace removed.
    fn read_trimmed(&self, path: &Path) -> Result<String> {
        Ok(self.read(path)?.trim().to_string())
    }
}

/// Node store backed by the real filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysfsNodeStore;

impl SysfsNodeStore {
    pub fn new() -> Self {
        Self
    }
}

impl NodeStore for SysfsNodeStore {
    fn read(&self, path: &Path) -> Result<String> {
        fs::read_to_string(path).map_err(|e| UsbError::node_read(path, e))
    }

    fn write(&self, path: &Path, value: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| UsbError::node_write(path, e))?;

        match file.write_all(value.as_bytes()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(UsbError::busy(path)),
            Err(e) => Err(UsbError::node_write(path, e)),
        }
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path).map_err(|e| UsbError::node_read(path, e))? {
            let entry = entry.map_err(|e| UsbError::node_read(path, e))?;
            let is_link = entry
                .file_type()
                .map(|t| t.is_symlink())
                .unwrap_or(false);
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_link,
            });
        }
        Ok(entries)
    }
}

/// One attempted write recorded by [`MemoryNodeStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub path: PathBuf,
    pub value: String,
    /// False when the write was rejected by fault injection.
    pub accepted: bool,
}

type WriteObserver = Arc<dyn Fn(&Path, &str) + Send + Sync>;

#[derive(Default)]
struct MemoryState {
    nodes: BTreeMap<PathBuf, String>,
    /// Directory -> symlink names
    links: BTreeMap<PathBuf, BTreeSet<String>>,
    failing_reads: HashSet<PathBuf>,
    failing_writes: HashSet<PathBuf>,
    /// Remaining Busy responses per node
    busy: HashMap<PathBuf, u32>,
    /// Nodes that accept writes without changing value
    frozen: HashSet<PathBuf>,
    journal: Vec<WriteRecord>,
    observer: Option<WriteObserver>,
}

/// In-memory node store.
///
/// Writes update the stored value, so a write followed by a read returns
/// the written value unless the node is frozen.
#[derive(Default)]
pub struct MemoryNodeStore {
    state: Mutex<MemoryState>,
}

impl fmt::Debug for MemoryNodeStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryNodeStore")
            .field("nodes", &state.nodes)
            .field("links", &state.links)
            .field("journal_len", &state.journal.len())
            .finish()
    }
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a node value.
    pub fn set(&self, path: impl Into<PathBuf>, value: impl Into<String>) {
        self.state.lock().nodes.insert(path.into(), value.into());
    }

    /// Returns the current value of a node.
    pub fn get(&self, path: impl AsRef<Path>) -> Option<String> {
        self.state.lock().nodes.get(path.as_ref()).cloned()
    }

    /// Removes a node.
    pub fn remove(&self, path: impl AsRef<Path>) {
        self.state.lock().nodes.remove(path.as_ref());
    }

    /// Adds a symlink entry `name` inside `dir`.
    pub fn add_link(&self, dir: impl Into<PathBuf>, name: impl Into<String>) {
        self.state
            .lock()
            .links
            .entry(dir.into())
            .or_default()
            .insert(name.into());
    }

    /// Removes a symlink entry.
    pub fn remove_link(&self, dir: impl AsRef<Path>, name: &str) {
        if let Some(names) = self.state.lock().links.get_mut(dir.as_ref()) {
            names.remove(name);
        }
    }

    /// Makes every read of `path` fail.
    pub fn fail_reads(&self, path: impl Into<PathBuf>) {
        self.state.lock().failing_reads.insert(path.into());
    }

    /// Makes every write to `path` fail.
    pub fn fail_writes(&self, path: impl Into<PathBuf>) {
        self.state.lock().failing_writes.insert(path.into());
    }

    /// Makes the next `count` writes to `path` report contention.
    pub fn busy(&self, path: impl Into<PathBuf>, count: u32) {
        self.state.lock().busy.insert(path.into(), count);
    }

    /// Accepts writes to `path` without changing its value.
    pub fn freeze(&self, path: impl Into<PathBuf>) {
        self.state.lock().frozen.insert(path.into());
    }

    /// Installs a callback invoked after every accepted write.
    pub fn on_write(&self, observer: impl Fn(&Path, &str) + Send + Sync + 'static) {
        self.state.lock().observer = Some(Arc::new(observer));
    }

    /// Returns every attempted write in order.
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state.lock().journal.clone()
    }

    /// Returns the values of accepted writes to `path` in order.
    pub fn writes_to(&self, path: impl AsRef<Path>) -> Vec<String> {
        let path = path.as_ref();
        self.state
            .lock()
            .journal
            .iter()
            .filter(|w| w.path == path && w.accepted)
            .map(|w| w.value.clone())
            .collect()
    }
}

impl NodeStore for MemoryNodeStore {
    fn read(&self, path: &Path) -> Result<String> {
        let state = self.state.lock();
        if state.failing_reads.contains(path) {
            return Err(UsbError::node_read(
                path,
                io::Error::new(io::ErrorKind::Other, "injected read failure"),
            ));
        }
        state.nodes.get(path).cloned().ok_or_else(|| {
            UsbError::node_read(path, io::Error::from(io::ErrorKind::NotFound))
        })
    }

    fn write(&self, path: &Path, value: &str) -> Result<()> {
        let observer = {
            let mut state = self.state.lock();

            if let Some(remaining) = state.busy.get_mut(path) {
                if *remaining > 0 {
                    *remaining -= 1;
                    state.journal.push(WriteRecord {
                        path: path.to_path_buf(),
                        value: value.to_string(),
                        accepted: false,
                    });
                    return Err(UsbError::busy(path));
                }
            }

            if state.failing_writes.contains(path) {
                state.journal.push(WriteRecord {
                    path: path.to_path_buf(),
                    value: value.to_string(),
                    accepted: false,
                });
                return Err(UsbError::node_write(
                    path,
                    io::Error::new(io::ErrorKind::Other, "injected write failure"),
                ));
            }

            if !state.frozen.contains(path) {
                state.nodes.insert(path.to_path_buf(), value.to_string());
            }
            state.journal.push(WriteRecord {
                path: path.to_path_buf(),
                value: value.to_string(),
                accepted: true,
            });
            state.observer.clone()
        };

        // Called without the state lock so observers may touch the store.
        if let Some(observer) = observer {
            observer(path, value);
        }
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        let state = self.state.lock();
        if state.nodes.contains_key(path) || state.links.contains_key(path) {
            return true;
        }
        if let (Some(parent), Some(name)) = (path.parent(), path.file_name()) {
            let name = name.to_string_lossy();
            if state
                .links
                .get(parent)
                .is_some_and(|names| names.contains(name.as_ref()))
            {
                return true;
            }
        }
        state.nodes.keys().any(|node| node.starts_with(path))
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        let state = self.state.lock();
        if state.failing_reads.contains(path) {
            return Err(UsbError::node_read(
                path,
                io::Error::new(io::ErrorKind::Other, "injected read failure"),
            ));
        }

        let mut entries: BTreeMap<String, bool> = BTreeMap::new();
        if let Some(names) = state.links.get(path) {
            for name in names {
                entries.insert(name.clone(), true);
            }
        }
        for node in state.nodes.keys() {
            if let Ok(rest) = node.strip_prefix(path) {
                if let Some(first) = rest.components().next() {
                    let name = first.as_os_str().to_string_lossy().into_owned();
                    entries.entry(name).or_insert(false);
                }
            }
        }

        if entries.is_empty() && !state.links.contains_key(path) {
            return Err(UsbError::node_read(
                path,
                io::Error::from(io::ErrorKind::NotFound),
            ));
        }

        Ok(entries
            .into_iter()
            .map(|(name, is_link)| DirEntry { name, is_link })
            .collect())
    }
}
