//! Datagram transport for probes.
//!
//! [`ProbeTransport`] is the seam between the detector loops and the
//! network. Production uses [`RawIcmpSocket`]; tests substitute an
//! in-process loopback.

use std::io;
use std::net::{IpAddr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::info;

use crate::error::DetectorError;
use crate::icmp::packet::IcmpFamily;

/// Sends and receives raw ICMP datagrams for one address family.
#[async_trait::async_trait]
pub trait ProbeTransport: Send + Sync + 'static {
    /// Family this transport carries.
    fn family(&self) -> IcmpFamily;

    /// Send one encoded ICMP message to `target`.
    async fn send_to(&self, message: &[u8], target: IpAddr) -> io::Result<usize>;

    /// Receive one datagram and its source address.
    ///
    /// IPv4 datagrams still carry their IP header; IPv6 ones do not.
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, IpAddr)>;
}

/// A raw `SOCK_RAW` ICMP or ICMPv6 socket driven by the tokio reactor.
///
/// Opening one needs `CAP_NET_RAW` (or root).
#[derive(Debug)]
pub struct RawIcmpSocket {
    family: IcmpFamily,
    socket: UdpSocket,
}

impl RawIcmpSocket {
    /// Open a raw socket for `family`. Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`DetectorError::Socket`] if the socket cannot be created
    /// (usually missing privileges) or registered with the reactor.
    pub fn open(family: IcmpFamily) -> Result<Self, DetectorError> {
        let socket_err = |e: io::Error| DetectorError::Socket {
            family: match family {
                IcmpFamily::V4 => "ipv4",
                IcmpFamily::V6 => "ipv6",
            },
            reason: e.to_string(),
        };

        let (domain, protocol) = match family {
            IcmpFamily::V4 => (Domain::IPV4, Protocol::ICMPV4),
            IcmpFamily::V6 => (Domain::IPV6, Protocol::ICMPV6),
        };
        let raw = Socket::new(domain, Type::RAW, Some(protocol)).map_err(socket_err)?;
        raw.set_nonblocking(true).map_err(socket_err)?;

        let std_socket: std::net::UdpSocket = raw.into();
        let socket = UdpSocket::from_std(std_socket).map_err(socket_err)?;

        info!(%family, protocol = family.protocol(), "raw ICMP socket opened");
        Ok(Self { family, socket })
    }
}

#[async_trait::async_trait]
impl ProbeTransport for RawIcmpSocket {
    fn family(&self) -> IcmpFamily {
        self.family
    }

    async fn send_to(&self, message: &[u8], target: IpAddr) -> io::Result<usize> {
        self.socket.send_to(message, SocketAddr::new(target, 0)).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, IpAddr)> {
        let (len, source) = self.socket.recv_from(buf).await?;
        Ok((len, source.ip()))
    }
}

#[cfg(test)]
pub(crate) mod loopback {
    //! In-process transport: records what was sent, delivers injected replies
    //! and injected failures.

    use std::collections::HashSet;
    use std::io;
    use std::net::IpAddr;

    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use super::ProbeTransport;
    use crate::icmp::packet::{EchoPacket, IcmpFamily};

    type Inbound = io::Result<(IpAddr, Vec<u8>)>;

    pub(crate) struct LoopbackTransport {
        family: IcmpFamily,
        sent: Mutex<Vec<(IpAddr, Vec<u8>)>>,
        unreachable: Mutex<HashSet<IpAddr>>,
        inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
    }

    /// Test-side handle for pushing datagrams into a [`LoopbackTransport`].
    #[derive(Clone)]
    pub(crate) struct Injector {
        family: IcmpFamily,
        tx: mpsc::UnboundedSender<Inbound>,
    }

    impl LoopbackTransport {
        pub(crate) fn new(family: IcmpFamily) -> (Self, Injector) {
            let (tx, rx) = mpsc::unbounded_channel();
            let transport = Self {
                family,
                sent: Mutex::new(Vec::new()),
                unreachable: Mutex::new(HashSet::new()),
                inbound: tokio::sync::Mutex::new(rx),
            };
            (transport, Injector { family, tx })
        }

        pub(crate) fn sent(&self) -> Vec<(IpAddr, Vec<u8>)> {
            self.sent.lock().clone()
        }

        /// Make every later send to `target` fail.
        pub(crate) fn fail_sends_to(&self, target: IpAddr) {
            self.unreachable.lock().insert(target);
        }
    }

    impl Injector {
        /// Deliver raw bytes as if `source` had sent them.
        pub(crate) fn raw(&self, source: IpAddr, message: Vec<u8>) {
            let datagram = match self.family {
                IcmpFamily::V4 => {
                    let mut datagram = vec![0x45u8];
                    datagram.extend_from_slice(&[0; 19]);
                    datagram.extend_from_slice(&message);
                    datagram
                }
                IcmpFamily::V6 => message,
            };
            let _ = self.tx.send(Ok((source, datagram)));
        }

        /// Make the next receive fail.
        pub(crate) fn fail_receive(&self) {
            let _ = self.tx.send(Err(io::Error::other("injected receive failure")));
        }

        /// Deliver an echo reply carrying this engine's identifier.
        pub(crate) fn reply_from(&self, source: IpAddr) {
            let reply = EchoPacket::request(self.family, 1, b"pong".to_vec()).reply();
            self.raw(source, reply.encode());
        }
    }

    #[async_trait::async_trait]
    impl ProbeTransport for LoopbackTransport {
        fn family(&self) -> IcmpFamily {
            self.family
        }

        async fn send_to(&self, message: &[u8], target: IpAddr) -> io::Result<usize> {
            if self.unreachable.lock().contains(&target) {
                return Err(io::Error::new(
                    io::ErrorKind::HostUnreachable,
                    format!("{target} is unreachable"),
                ));
            }
            self.sent.lock().push((target, message.to_vec()));
            Ok(message.len())
        }

        async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, IpAddr)> {
            let next = self.inbound.lock().await.recv().await;
            let Some(inbound) = next else {
                return std::future::pending().await;
            };
            let (source, datagram) = inbound?;
            let len = datagram.len().min(buf.len());
            buf[..len].copy_from_slice(&datagram[..len]);
            Ok((len, source))
        }
    }
}
