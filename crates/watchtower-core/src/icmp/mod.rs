//! ICMP liveness detection.
//!
//! [`IcmpDetector`] probes every registered service with echo requests,
//! flips it up on the first reply and down after `leave_timeout` of
//! silence, and keeps its roster in the config engine at [`ROSTER_PATH`].

pub mod detector;
pub mod notify;
pub mod packet;
pub mod transport;

pub use detector::{
    DetectorConfig, IcmpDetector, ROSTER_PATH, ServiceIdentifier, ServiceRecord,
    parse_service_address,
};
pub use notify::{
    DOWN_SUBJECT, EventSource, LogNotifier, Notifier, TopologyEvent, TopologyEventType,
    TopologySink, UP_SUBJECT,
};
pub use packet::{EchoKind, EchoPacket, IcmpFamily, strip_ipv4_header};
pub use transport::{ProbeTransport, RawIcmpSocket};
