//! ICMP liveness detector.
//!
//! Five tasks cooperate around one live service map:
//!
//! - the **controller** owns structural changes (add, delete) and the
//!   periodic down sweep, so those are totally ordered;
//! - the **transmitter** probes every service each `send_interval`;
//! - one **receiver** per address family matches echo replies to services;
//! - the **refresher** publishes a sorted copy of the map each
//!   `refresh_interval`, which is all [`IcmpDetector::get_services`] reads.
//!
//! Transmitter and receivers only touch fields of records that already
//! exist. The map lock and record locks are never held across an `.await`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize, Serializer};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::ConfigStore;
use crate::error::{ConfigError, DetectorError, PacketError};
use crate::icmp::notify::{
    self, EventSource, Notifier, TopologyEvent, TopologyEventType, TopologySink,
};
use crate::icmp::packet::{self, EchoKind, EchoPacket, IcmpFamily};
use crate::icmp::transport::{ProbeTransport, RawIcmpSocket};

/// Config path of the persisted service roster.
pub const ROSTER_PATH: &str = "/icmp-ka/services";

const RECV_BUFFER_LEN: usize = 2000;

/// Detector timing and behaviour.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Time between probe rounds.
    pub send_interval: Duration,
    /// Time between down sweeps.
    pub check_interval: Duration,
    /// Silence after which a live service is declared down.
    pub leave_timeout: Duration,
    /// Time between mirror refreshes.
    pub refresh_interval: Duration,
    /// Pause after a receive or parse error.
    pub receive_freeze: Duration,
    /// Capacity of the add and delete queues.
    pub queue_capacity: usize,
    /// Also require replies to carry this engine's echo identifier.
    pub strict_reply_match: bool,
    /// Open an ICMPv6 socket and probe IPv6 services.
    pub enable_ipv6: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            send_interval: Duration::from_millis(500),
            check_interval: Duration::from_millis(500),
            leave_timeout: Duration::from_millis(2000),
            refresh_interval: Duration::from_millis(1000),
            receive_freeze: Duration::from_millis(10),
            queue_capacity: 50,
            strict_reply_match: false,
            enable_ipv6: true,
        }
    }
}

/// A service as persisted in the roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceIdentifier {
    pub address: String,
    pub service_name: String,
}

impl ServiceIdentifier {
    pub fn new(address: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            service_name: service_name.into(),
        }
    }
}

/// Observed state of one service.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    pub address: IpAddr,
    pub service_name: String,
    pub alive: bool,
    /// Wall-clock time of the last reply; the Unix epoch if none yet.
    pub last_seen: DateTime<Utc>,
    /// Probes sent. Also the source of the echo sequence number.
    pub detect_count: u64,
    /// Replies received.
    pub report_count: u64,
    #[serde(rename = "rttMs", serialize_with = "serialize_millis")]
    pub rtt: Duration,
    /// When the latest probe went out.
    pub rtt_outbound: Option<DateTime<Utc>>,
}

impl ServiceRecord {
    pub fn new(address: IpAddr, service_name: String) -> Self {
        Self {
            address,
            service_name,
            alive: false,
            last_seen: DateTime::<Utc>::default(),
            detect_count: 0,
            report_count: 0,
            rtt: Duration::ZERO,
            rtt_outbound: None,
        }
    }
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn serialize_millis<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(value.as_secs_f64() * 1000.0)
}

/// Parse a service address into its canonical form.
///
/// IPv4-mapped IPv6 addresses become plain IPv4, since their replies arrive
/// on the v4 socket. Returns `None` for anything that is not an IP literal,
/// including zoned IPv6 (`fe80::1%eth0`).
pub fn parse_service_address(raw: &str) -> Option<IpAddr> {
    raw.trim().parse::<IpAddr>().ok().map(|addr| addr.to_canonical())
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

fn sequence_number(detect_count: u64) -> u16 {
    u16::try_from(detect_count & 0xFFFF).unwrap_or_default()
}

struct ServiceState {
    record: ServiceRecord,
    last_seen_at: Option<Instant>,
    outbound_at: Option<Instant>,
}

type ServiceMap = HashMap<IpAddr, Arc<Mutex<ServiceState>>>;

struct Shared {
    config: DetectorConfig,
    services: RwLock<ServiceMap>,
    mirror: watch::Sender<Arc<Vec<ServiceRecord>>>,
    notifier: Arc<dyn Notifier>,
    topology: Arc<dyn TopologySink>,
}

impl Shared {
    /// Insert a fresh record. Returns `false` if the address is already tracked.
    fn insert(&self, address: IpAddr, service_name: &str) -> bool {
        let mut services = self.services.write();
        if services.contains_key(&address) {
            return false;
        }
        let state = ServiceState {
            record: ServiceRecord::new(address, service_name.to_owned()),
            last_seen_at: None,
            outbound_at: None,
        };
        services.insert(address, Arc::new(Mutex::new(state)));
        true
    }

    fn remove(&self, address: IpAddr) -> Option<ServiceRecord> {
        let removed = self.services.write().remove(&address)?;
        let record = removed.lock().record.clone();
        Some(record)
    }

    fn tracked(&self) -> Vec<(IpAddr, Arc<Mutex<ServiceState>>)> {
        self.services
            .read()
            .iter()
            .map(|(address, state)| (*address, Arc::clone(state)))
            .collect()
    }

    /// Mark live services that have been silent too long as down.
    fn sweep(&self, now: Instant) {
        let leave = self.config.leave_timeout;
        for service in self.services.read().values() {
            let went_down = {
                let mut state = service.lock();
                let silent = state
                    .last_seen_at
                    .is_none_or(|seen| now.saturating_duration_since(seen) > leave);
                if state.record.alive && silent {
                    state.record.alive = false;
                    Some(state.record.clone())
                } else {
                    None
                }
            };
            if let Some(record) = went_down {
                info!(address = %record.address, service = %record.service_name, "service is down");
                self.notify(notify::down_message(&record, Utc::now()));
            }
        }
    }

    /// Apply one received datagram.
    ///
    /// Returns whether it refreshed a tracked service. Echo requests,
    /// replies from untracked sources, and (in strict mode) replies with a
    /// foreign identifier are ignored.
    fn accept(
        &self,
        family: IcmpFamily,
        datagram: &[u8],
        source: IpAddr,
    ) -> Result<bool, PacketError> {
        let message = match family {
            IcmpFamily::V4 => packet::strip_ipv4_header(datagram)?,
            IcmpFamily::V6 => datagram,
        };
        let reply = EchoPacket::parse(family, message)?;
        if reply.kind != EchoKind::Reply {
            return Ok(false);
        }
        if self.config.strict_reply_match && reply.identifier != family.echo_id() {
            debug!(%source, identifier = reply.identifier, "ignoring reply with foreign identifier");
            return Ok(false);
        }

        let Some(service) = self.services.read().get(&source).cloned() else {
            return Ok(false);
        };

        let now = Instant::now();
        let wall = Utc::now();
        let came_up = {
            let mut state = service.lock();
            state.last_seen_at = Some(now);
            state.record.last_seen = wall;
            if let Some(sent) = state.outbound_at {
                state.record.rtt = now.saturating_duration_since(sent);
            }
            state.record.report_count += 1;
            if state.record.alive {
                None
            } else {
                state.record.alive = true;
                Some(state.record.clone())
            }
        };

        if let Some(record) = came_up {
            info!(address = %record.address, service = %record.service_name, "service is up");
            self.notify(notify::up_message(&record, wall));
        }
        Ok(true)
    }

    fn publish_mirror(&self) {
        let mut records: Vec<ServiceRecord> = self
            .services
            .read()
            .values()
            .map(|state| state.lock().record.clone())
            .collect();
        records.sort_by_cached_key(|record| record.address.to_string());
        self.mirror.send_replace(Arc::new(records));
    }

    fn notify(&self, (subject, body): (&'static str, String)) {
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            if let Err(e) = notifier.send_notification(subject, &body).await {
                warn!(subject, error = %e, "failed to deliver notification");
            }
        });
    }

    fn announce_removal(&self, record: &ServiceRecord) {
        let topology = Arc::clone(&self.topology);
        let event = TopologyEvent {
            event_type: TopologyEventType::ServiceDelete,
            source: EventSource::Icmp,
            service_name: record.service_name.clone(),
            timestamp: Utc::now(),
        };
        tokio::spawn(async move {
            if let Err(e) = topology.send_event(event).await {
                warn!(error = %e, "failed to deliver topology event");
            }
        });
    }
}

/// Handle to a running detector. Dropping it stops every task.
pub struct IcmpDetector {
    adds: mpsc::Sender<ServiceIdentifier>,
    deletes: mpsc::Sender<IpAddr>,
    mirror: watch::Receiver<Arc<Vec<ServiceRecord>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl IcmpDetector {
    /// Open raw sockets, start the loops, and replay the persisted roster.
    ///
    /// # Errors
    ///
    /// [`DetectorError::Socket`] if a raw socket cannot be opened and
    /// [`DetectorError::Roster`] if the roster cannot be initialized.
    pub async fn start(
        config: DetectorConfig,
        store: ConfigStore,
        notifier: Arc<dyn Notifier>,
        topology: Arc<dyn TopologySink>,
    ) -> Result<Self, DetectorError> {
        let v4: Arc<dyn ProbeTransport> = Arc::new(RawIcmpSocket::open(IcmpFamily::V4)?);
        let v6: Option<Arc<dyn ProbeTransport>> = if config.enable_ipv6 {
            Some(Arc::new(RawIcmpSocket::open(IcmpFamily::V6)?))
        } else {
            info!("IPv6 probing disabled");
            None
        };
        Self::start_with_transports(config, store, v4, v6, notifier, topology).await
    }

    /// Like [`start`](Self::start) but over caller-supplied transports.
    ///
    /// # Errors
    ///
    /// [`DetectorError::Roster`] if the roster cannot be initialized.
    pub async fn start_with_transports(
        config: DetectorConfig,
        store: ConfigStore,
        v4: Arc<dyn ProbeTransport>,
        v6: Option<Arc<dyn ProbeTransport>>,
        notifier: Arc<dyn Notifier>,
        topology: Arc<dyn TopologySink>,
    ) -> Result<Self, DetectorError> {
        let roster = load_roster(&store).await?;

        let (mirror_tx, mirror_rx) = watch::channel(Arc::new(Vec::new()));
        let (add_tx, add_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (del_tx, del_rx) = mpsc::channel(config.queue_capacity.max(1));
        let shared = Arc::new(Shared {
            config,
            services: RwLock::new(HashMap::new()),
            mirror: mirror_tx,
            notifier,
            topology,
        });

        let mut tasks = vec![
            tokio::spawn(run_controller(Arc::clone(&shared), store, add_rx, del_rx)),
            tokio::spawn(run_transmitter(Arc::clone(&shared), Arc::clone(&v4), v6.clone())),
            tokio::spawn(run_receiver(Arc::clone(&shared), v4)),
            tokio::spawn(run_refresher(Arc::clone(&shared))),
        ];
        if let Some(v6) = v6 {
            tasks.push(tokio::spawn(run_receiver(Arc::clone(&shared), v6)));
        }

        let detector = Self {
            adds: add_tx,
            deletes: del_tx,
            mirror: mirror_rx,
            tasks,
        };

        info!(services = roster.len(), "ICMP detector started, replaying roster");
        for service in roster {
            detector.add_service(service).await;
        }
        Ok(detector)
    }

    /// Start monitoring a service. Invalid addresses are dropped; an address
    /// that is already monitored is left untouched.
    pub async fn add_service(&self, service: ServiceIdentifier) {
        let Some(address) = parse_service_address(&service.address) else {
            debug!(address = %service.address, "dropping add for invalid address");
            return;
        };
        let service = ServiceIdentifier {
            address: address.to_string(),
            service_name: service.service_name,
        };
        if self.adds.send(service).await.is_err() {
            warn!(%address, "ICMP controller is not running, add dropped");
        }
    }

    /// Stop monitoring the service at `address`. Invalid addresses are dropped.
    pub async fn del_service(&self, address: &str) {
        let Some(address) = parse_service_address(address) else {
            debug!(address, "dropping delete for invalid address");
            return;
        };
        if self.deletes.send(address).await.is_err() {
            warn!(%address, "ICMP controller is not running, delete dropped");
        }
    }

    /// Latest published snapshot, sorted by address text.
    pub fn get_services(&self) -> Vec<ServiceRecord> {
        self.mirror.borrow().as_ref().clone()
    }
}

impl Drop for IcmpDetector {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn load_roster(store: &ConfigStore) -> Result<Vec<ServiceIdentifier>, DetectorError> {
    match store.get_as::<Vec<ServiceIdentifier>>(ROSTER_PATH).await {
        Ok(roster) => Ok(roster),
        Err(e) if e.is_absent() => {
            info!(path = ROSTER_PATH, "no service roster yet, creating an empty one");
            store.put_as(ROSTER_PATH, &Vec::<ServiceIdentifier>::new()).await?;
            Ok(Vec::new())
        }
        Err(e @ ConfigError::Serialization { .. }) => {
            warn!(error = %e, "stored service roster is unreadable, starting empty");
            Ok(Vec::new())
        }
        Err(e) => Err(e.into()),
    }
}

async fn read_roster(store: &ConfigStore) -> Option<Vec<ServiceIdentifier>> {
    match store.get_as(ROSTER_PATH).await {
        Ok(roster) => Some(roster),
        Err(e) => {
            warn!(error = %e, "cannot read service roster, change not persisted");
            None
        }
    }
}

async fn write_roster(store: &ConfigStore, roster: &[ServiceIdentifier]) {
    if let Err(e) = store.put_as(ROSTER_PATH, roster).await {
        warn!(error = %e, "failed to persist service roster");
    }
}

fn same_address(entry: &ServiceIdentifier, address: IpAddr) -> bool {
    parse_service_address(&entry.address) == Some(address)
}

async fn run_controller(
    shared: Arc<Shared>,
    store: ConfigStore,
    mut adds: mpsc::Receiver<ServiceIdentifier>,
    mut deletes: mpsc::Receiver<IpAddr>,
) {
    let mut ticker = ticker(shared.config.check_interval);

    loop {
        tokio::select! {
            Some(service) = adds.recv() => {
                let Some(address) = parse_service_address(&service.address) else {
                    continue;
                };
                if shared.insert(address, &service.service_name) {
                    info!(%address, service = %service.service_name, "service added");
                } else {
                    debug!(%address, "service already monitored");
                }
                if let Some(mut roster) = read_roster(&store).await {
                    if !roster.iter().any(|entry| same_address(entry, address)) {
                        roster.push(service);
                        write_roster(&store, &roster).await;
                    }
                }
            }
            Some(address) = deletes.recv() => {
                if let Some(record) = shared.remove(address) {
                    info!(%address, service = %record.service_name, "service removed");
                    shared.announce_removal(&record);
                }
                if let Some(mut roster) = read_roster(&store).await {
                    let before = roster.len();
                    roster.retain(|entry| !same_address(entry, address));
                    if roster.len() != before {
                        write_roster(&store, &roster).await;
                    }
                }
            }
            _ = ticker.tick() => shared.sweep(Instant::now()),
        }
    }
}

async fn run_transmitter(
    shared: Arc<Shared>,
    v4: Arc<dyn ProbeTransport>,
    v6: Option<Arc<dyn ProbeTransport>>,
) {
    let mut ticker = ticker(shared.config.send_interval);

    loop {
        ticker.tick().await;
        for (address, service) in shared.tracked() {
            let family = IcmpFamily::of(&address);
            let transport = match family {
                IcmpFamily::V4 => &v4,
                IcmpFamily::V6 => {
                    let Some(v6) = &v6 else {
                        debug!(%address, "IPv6 probing disabled, skipping");
                        continue;
                    };
                    v6
                }
            };

            let sequence = {
                let mut state = service.lock();
                state.record.detect_count += 1;
                state.outbound_at = Some(Instant::now());
                state.record.rtt_outbound = Some(Utc::now());
                sequence_number(state.record.detect_count)
            };
            let probe = EchoPacket::request(family, sequence, packet::timestamp_payload(Utc::now()));

            if let Err(e) = transport.send_to(&probe.encode(), address).await {
                warn!(%address, error = %e, "failed to send probe");
            }
        }
    }
}

async fn run_receiver(shared: Arc<Shared>, transport: Arc<dyn ProbeTransport>) {
    let family = transport.family();
    let freeze = shared.config.receive_freeze;
    let mut buf = vec![0u8; RECV_BUFFER_LEN];
    info!(%family, "ICMP receiver started");

    loop {
        let (len, source) = match transport.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!(%family, error = %e, freeze_ms = freeze.as_millis(), "ICMP receive failed");
                tokio::time::sleep(freeze).await;
                continue;
            }
        };
        let datagram = buf.get(..len).unwrap_or_default();

        match shared.accept(family, datagram, source) {
            Ok(true) => debug!(%family, %source, "echo reply matched"),
            Ok(false) => {}
            Err(e) => {
                debug!(%family, %source, error = %e, "unusable ICMP datagram");
                tokio::time::sleep(freeze).await;
            }
        }
    }
}

async fn run_refresher(shared: Arc<Shared>) {
    let mut ticker = ticker(shared.config.refresh_interval);

    loop {
        ticker.tick().await;
        shared.publish_mirror();
    }
}
