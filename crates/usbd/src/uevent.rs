//! Kernel uevent records and event sources
//!
//! The kernel broadcasts device changes on the `NETLINK_KOBJECT_UEVENT`
//! multicast group as NUL separated text: an `action@devpath` header
//! followed by `KEY=VALUE` properties. [`UeventClassifier`] reduces a
//! record to the handful of kinds the dispatch loop reacts to.
//!
//! Linux: [`UeventSocket`] reads the netlink socket directly.
//! Other platforms and tests: [`ChannelEventSource`] injects records in-process.
//!
//! NIST 800-53 Rev5 [SI-4]: System Monitoring - Real-time device state monitoring

use crate::config::UeventConfig;
use crate::error::{Result, UsbError};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

/// Header of a partner add/remove record, capturing action and port name.
static PARTNER_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(add|remove)@(?:.*/)?([^/@]+)-partner$").expect("valid partner header regex")
});

const TYPEC_DEVTYPE_PREFIX: &str = "DEVTYPE=typec_";
const DRIVER_PREFIX: &str = "DRIVER=";
const POWER_SUPPLY_PREFIX: &str = "POWER_SUPPLY_NAME=";

/// One kernel uevent message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UeventRecord {
    header: String,
    properties: Vec<String>,
}

impl UeventRecord {
    /// Builds a record from its header and `KEY=VALUE` properties.
    pub fn new<I, S>(header: impl Into<String>, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            header: header.into(),
            properties: properties.into_iter().map(Into::into).collect(),
        }
    }

    /// Parses a raw NUL separated message. Returns `None` for an empty buffer.
    pub fn parse(buffer: &[u8]) -> Option<Self> {
        let text = String::from_utf8_lossy(buffer);
        let mut lines = text.split('\0').filter(|line| !line.is_empty());
        let header = lines.next()?.to_string();
        Some(Self {
            header,
            properties: lines.map(str::to_string).collect(),
        })
    }

    pub fn header(&self) -> &str {
        &self.header
    }

    /// Value of property `key`, if present.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.iter().find_map(|line| {
            line.split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }

    /// Header followed by every property line, in message order.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.header.as_str()).chain(self.properties.iter().map(String::as_str))
    }
}

impl fmt::Display for UeventRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.header)?;
        for property in &self.properties {
            write!(f, " {}", property)?;
        }
        Ok(())
    }
}

/// What a record means for port coordination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UeventKind {
    /// A partner appeared on `port`.
    PartnerAttached { port: String },
    /// A partner left `port`.
    PartnerDetached { port: String },
    /// Type-C class, TCPC or dock driver state changed.
    TypecChanged,
    /// The USB power supply changed.
    PowerSupplyChanged,
    /// The USB port cooling device changed state.
    CoolingDeviceChanged,
    Unrecognized,
}

impl UeventKind {
    /// Kinds that require a status recomputation.
    pub fn is_topology_relevant(&self) -> bool {
        matches!(
            self,
            UeventKind::PartnerDetached { .. }
                | UeventKind::TypecChanged
                | UeventKind::PowerSupplyChanged
        )
    }
}

/// Classifies records using the configured driver and supply names.
///
/// Lines are examined in message order and the first match wins.
#[derive(Debug, Clone)]
pub struct UeventClassifier {
    port_drivers: Vec<String>,
    power_supply: String,
    cooling_driver: String,
}

impl UeventClassifier {
    pub fn new(config: &UeventConfig) -> Self {
        Self {
            port_drivers: config
                .port_drivers
                .iter()
                .map(|d| format!("{}{}", DRIVER_PREFIX, d))
                .collect(),
            power_supply: format!("{}{}", POWER_SUPPLY_PREFIX, config.power_supply_name),
            cooling_driver: format!("{}{}", DRIVER_PREFIX, config.cooling_device_driver),
        }
    }

    pub fn classify(&self, record: &UeventRecord) -> UeventKind {
        for line in record.lines() {
            if let Some(captures) = PARTNER_HEADER.captures(line) {
                let port = captures[2].to_string();
                return match &captures[1] {
                    "add" => UeventKind::PartnerAttached { port },
                    _ => UeventKind::PartnerDetached { port },
                };
            }

            if line.starts_with(TYPEC_DEVTYPE_PREFIX)
                || self.port_drivers.iter().any(|d| line.starts_with(d.as_str()))
            {
                return UeventKind::TypecChanged;
            }

            if line.starts_with(&self.power_supply) {
                return UeventKind::PowerSupplyChanged;
            }

            if line.starts_with(&self.cooling_driver) {
                return UeventKind::CoolingDeviceChanged;
            }
        }

        UeventKind::Unrecognized
    }
}

impl Default for UeventClassifier {
    fn default() -> Self {
        Self::new(&UeventConfig::default())
    }
}

/// Handle that unblocks a pending [`EventStream::next_record`] call.
#[derive(Clone)]
pub struct StreamWaker {
    wake: Arc<dyn Fn() + Send + Sync>,
}

impl StreamWaker {
    pub fn new(wake: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            wake: Arc::new(wake),
        }
    }

    pub fn wake(&self) {
        (self.wake)();
    }
}

impl fmt::Debug for StreamWaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamWaker").finish_non_exhaustive()
    }
}

/// Producer of uevent streams; opened once per dispatch loop run.
pub trait EventSource: Send + Sync {
    fn open(&self) -> Result<Box<dyn EventStream>>;
}

/// A blocking stream of uevent records.
pub trait EventStream: Send {
    /// Blocks until a record arrives or the stream is woken.
    ///
    /// Returns `Ok(None)` when woken or when a message was discarded.
    fn next_record(&mut self) -> Result<Option<UeventRecord>>;

    /// Returns a handle that wakes a blocked `next_record` call.
    fn waker(&self) -> StreamWaker;
}

type Delivery = Option<UeventRecord>;

#[derive(Debug, Default)]
struct ChannelState {
    sender: Option<Sender<Delivery>>,
    opened: usize,
}

/// In-process event source. Records injected while no stream is open are dropped.
#[derive(Debug, Clone, Default)]
pub struct ChannelEventSource {
    state: Arc<Mutex<ChannelState>>,
}

impl ChannelEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers a record to the open stream. Returns false if none is open.
    pub fn inject(&self, record: UeventRecord) -> bool {
        match self.state.lock().sender.as_ref() {
            Some(sender) => sender.send(Some(record)).is_ok(),
            None => false,
        }
    }

    /// Parses and delivers a raw kernel message.
    pub fn inject_raw(&self, buffer: &[u8]) -> bool {
        UeventRecord::parse(buffer).is_some_and(|record| self.inject(record))
    }

    /// Number of streams opened so far.
    pub fn open_count(&self) -> usize {
        self.state.lock().opened
    }

    /// Returns true while the most recently opened stream is alive.
    pub fn is_streaming(&self) -> bool {
        self.state
            .lock()
            .sender
            .as_ref()
            .is_some_and(|sender| sender.send(None).is_ok())
    }
}

impl EventSource for ChannelEventSource {
    fn open(&self) -> Result<Box<dyn EventStream>> {
        let (sender, receiver) = mpsc::channel();
        let mut state = self.state.lock();
        state.sender = Some(sender.clone());
        state.opened += 1;
        Ok(Box::new(ChannelEventStream { receiver, sender }))
    }
}

struct ChannelEventStream {
    receiver: Receiver<Delivery>,
    sender: Sender<Delivery>,
}

impl EventStream for ChannelEventStream {
    fn next_record(&mut self) -> Result<Option<UeventRecord>> {
        self.receiver
            .recv()
            .map_err(|_| UsbError::Uevent("event channel closed".to_string()))
    }

    fn waker(&self) -> StreamWaker {
        let sender = Mutex::new(self.sender.clone());
        StreamWaker::new(move || {
            let _ = sender.lock().send(None);
        })
    }
}

#[cfg(target_os = "linux")]
pub use self::kernel::UeventSocket;

#[cfg(target_os = "linux")]
mod kernel {
    use super::{EventSource, EventStream, StreamWaker, UeventRecord};
    use crate::error::{Result, UsbError};
    use nix::errno::Errno;
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    use nix::sys::socket::{
        bind, recvfrom, setsockopt, socket, sockopt, AddressFamily, NetlinkAddr, SockFlag,
        SockProtocol, SockType,
    };
    use std::io::{Read, Write};
    use std::os::fd::{AsFd, AsRawFd, OwnedFd};
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;
    use tracing::{debug, warn};

    /// Kernel uevent broadcast group.
    const KOBJECT_UEVENT_GROUP: u32 = 1;

    /// Netlink `NETLINK_KOBJECT_UEVENT` event source.
    #[derive(Debug, Clone)]
    pub struct UeventSocket {
        buffer_bytes: usize,
    }

    impl UeventSocket {
        pub fn new(buffer_bytes: usize) -> Self {
            Self { buffer_bytes }
        }
    }

    impl EventSource for UeventSocket {
        fn open(&self) -> Result<Box<dyn EventStream>> {
            let fd = socket(
                AddressFamily::Netlink,
                SockType::Datagram,
                SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
                SockProtocol::NetlinkKObjectUEvent,
            )
            .map_err(|e| UsbError::Uevent(format!("Failed to create uevent socket: {}", e)))?;

            // Forcing the buffer size needs CAP_NET_ADMIN.
            if let Err(e) = setsockopt(&fd, sockopt::RcvBufForce, &self.buffer_bytes) {
                debug!(error = %e, "SO_RCVBUFFORCE rejected, falling back to SO_RCVBUF");
                if let Err(e) = setsockopt(&fd, sockopt::RcvBuf, &self.buffer_bytes) {
                    warn!(error = %e, "Failed to size uevent receive buffer");
                }
            }

            bind(fd.as_raw_fd(), &NetlinkAddr::new(0, KOBJECT_UEVENT_GROUP))
                .map_err(|e| UsbError::Uevent(format!("Failed to bind uevent socket: {}", e)))?;

            let (wake_rx, wake_tx) = UnixStream::pair()?;
            wake_rx.set_nonblocking(true)?;
            wake_tx.set_nonblocking(true)?;

            debug!(buffer_bytes = self.buffer_bytes, "Opened uevent socket");
            Ok(Box::new(KernelEventStream {
                fd,
                wake_rx,
                wake_tx: Arc::new(wake_tx),
                buffer: vec![0u8; self.buffer_bytes],
            }))
        }
    }

    struct KernelEventStream {
        fd: OwnedFd,
        wake_rx: UnixStream,
        wake_tx: Arc<UnixStream>,
        buffer: Vec<u8>,
    }

    impl KernelEventStream {
        fn drain_wake(&self) {
            let mut rx = &self.wake_rx;
            let mut scratch = [0u8; 64];
            while let Ok(n) = rx.read(&mut scratch) {
                if n == 0 {
                    break;
                }
            }
        }
    }

    impl EventStream for KernelEventStream {
        fn next_record(&mut self) -> Result<Option<UeventRecord>> {
            let (readable, woken) = {
                let mut fds = [
                    PollFd::new(self.fd.as_fd(), PollFlags::POLLIN),
                    PollFd::new(self.wake_rx.as_fd(), PollFlags::POLLIN),
                ];
                match poll(&mut fds, PollTimeout::NONE) {
                    Ok(_) => {}
                    Err(Errno::EINTR) => return Ok(None),
                    Err(e) => return Err(UsbError::Uevent(format!("poll failed: {}", e))),
                }
                let ready = |fd: &PollFd<'_>| {
                    fd.revents()
                        .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLERR))
                };
                (ready(&fds[0]), ready(&fds[1]))
            };

            if woken {
                self.drain_wake();
                return Ok(None);
            }
            if !readable {
                return Ok(None);
            }

            match recvfrom::<NetlinkAddr>(self.fd.as_raw_fd(), &mut self.buffer) {
                Ok((0, _)) => Ok(None),
                Ok((n, _)) if n >= self.buffer.len() => {
                    warn!(bytes = n, "Uevent message overflowed receive buffer, dropping");
                    Ok(None)
                }
                Ok((n, Some(sender))) if sender.pid() == 0 => {
                    Ok(UeventRecord::parse(&self.buffer[..n]))
                }
                Ok((_, sender)) => {
                    debug!(
                        sender = ?sender.map(|s| s.pid()),
                        "Ignoring uevent not sent by the kernel"
                    );
                    Ok(None)
                }
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => Ok(None),
                Err(e) => Err(UsbError::Uevent(format!("Failed to receive uevent: {}", e))),
            }
        }

        fn waker(&self) -> StreamWaker {
            let tx = Arc::clone(&self.wake_tx);
            StreamWaker::new(move || {
                let mut tx: &UnixStream = &tx;
                let _ = tx.write(&[1]);
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn classify(record: &UeventRecord) -> UeventKind {
        UeventClassifier::default().classify(record)
    }

    #[test]
    fn test_parse_raw_message() {
        let raw =
            b"change@/devices/platform/tcpc/typec/port0\0ACTION=change\0DEVTYPE=typec_port\0\0";
        let record = UeventRecord::parse(raw).unwrap();
        assert_eq!(record.header(), "change@/devices/platform/tcpc/typec/port0");
        assert_eq!(record.property("DEVTYPE"), Some("typec_port"));
        assert_eq!(record.property("MISSING"), None);
        assert_eq!(record.lines().count(), 3);
    }

    #[test]
    fn test_parse_empty() {
        assert!(UeventRecord::parse(b"").is_none());
        assert!(UeventRecord::parse(b"\0\0").is_none());
    }

    #[test]
    fn test_classify_partner_add_and_remove() {
        let add = UeventRecord::new(
            "add@/devices/platform/tcpc/typec/port0/port0-partner",
            ["ACTION=add", "DEVTYPE=typec_partner"],
        );
        assert_eq!(
            classify(&add),
            UeventKind::PartnerAttached { port: "port0".to_string() }
        );

        let remove = UeventRecord::new(
            "remove@/devices/platform/tcpc/typec/port1/port1-partner",
            ["ACTION=remove"],
        );
        let kind = classify(&remove);
        assert_eq!(kind, UeventKind::PartnerDetached { port: "port1".to_string() });
        assert!(kind.is_topology_relevant());
    }

    #[test]
    fn test_classify_typec_and_drivers() {
        let devtype = UeventRecord::new("change@/typec/port0", ["DEVTYPE=typec_port"]);
        assert_eq!(classify(&devtype), UeventKind::TypecChanged);

        let tcpc = UeventRecord::new("change@/i2c/7-0025", ["DRIVER=max77759tcpc"]);
        assert_eq!(classify(&tcpc), UeventKind::TypecChanged);

        let dock = UeventRecord::new("change@/platform/pogo", ["DRIVER=pogo-transport"]);
        assert_eq!(classify(&dock), UeventKind::TypecChanged);
    }

    #[test]
    fn test_classify_power_supply_and_cooling() {
        let supply = UeventRecord::new("change@/power_supply/usb", ["POWER_SUPPLY_NAME=usb"]);
        assert_eq!(classify(&supply), UeventKind::PowerSupplyChanged);

        let cooling = UeventRecord::new(
            "change@/platform/cooling",
            ["DRIVER=google,usbc_port_cooling_dev"],
        );
        let kind = classify(&cooling);
        assert_eq!(kind, UeventKind::CoolingDeviceChanged);
        assert!(!kind.is_topology_relevant());
    }

    #[test]
    fn test_classify_unrecognized() {
        let record = UeventRecord::new("change@/block/sda", ["DEVTYPE=disk", "DRIVER=sd"]);
        assert_eq!(classify(&record), UeventKind::Unrecognized);
        // The partner pattern only applies to whole header lines.
        let record = UeventRecord::new("change@/typec/port0-partner", ["ACTION=change"]);
        assert_eq!(classify(&record), UeventKind::Unrecognized);
    }

    #[test]
    fn test_classify_custom_drivers() {
        let config = UeventConfig {
            port_drivers: vec!["tcpci".to_string()],
            power_supply_name: "ac".to_string(),
            ..Default::default()
        };
        let classifier = UeventClassifier::new(&config);
        let record = UeventRecord::new("change@/x", ["DRIVER=tcpci"]);
        assert_eq!(classifier.classify(&record), UeventKind::TypecChanged);
        let record = UeventRecord::new("change@/x", ["POWER_SUPPLY_NAME=usb"]);
        assert_eq!(classifier.classify(&record), UeventKind::Unrecognized);
    }

    #[test]
    fn test_channel_source_delivers_records() {
        let source = ChannelEventSource::new();
        let record = UeventRecord::new("change@/typec/port0", ["DEVTYPE=typec_port"]);
        assert!(!source.inject(record.clone()));

        let mut stream = source.open().unwrap();
        assert_eq!(source.open_count(), 1);
        assert!(source.inject(record.clone()));
        assert_eq!(stream.next_record().unwrap(), Some(record));
    }

    #[test]
    fn test_channel_waker_unblocks() {
        let source = ChannelEventSource::new();
        let mut stream = source.open().unwrap();
        let waker = stream.waker();

        let handle = std::thread::spawn(move || stream.next_record());
        waker.wake();
        assert_eq!(handle.join().unwrap().unwrap(), None);
    }

    #[test]
    fn test_channel_source_after_stream_dropped() {
        let source = ChannelEventSource::new();
        let stream = source.open().unwrap();
        assert!(source.is_streaming());
        drop(stream);
        assert!(!source.is_streaming());
        assert!(!source.inject_raw(b"change@/x\0DEVTYPE=typec_port\0"));
    }
}
