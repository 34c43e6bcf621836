//! ICMP echo message encoding and parsing.
//!
//! Only echo request and echo reply are understood. Everything else a raw
//! socket hands us (unreachables, redirects, other tools' traffic) is
//! rejected with [`PacketError::NotEcho`].

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};

use crate::error::PacketError;

/// Echo identifier stamped on IPv4 probes.
pub const ECHO_ID_V4: u16 = 0x1994;

/// Echo identifier stamped on IPv6 probes.
pub const ECHO_ID_V6: u16 = 0x1996;

const ECHO_HEADER_LEN: usize = 8;
const IPV4_MIN_HEADER_LEN: usize = 20;

/// Address family of a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IcmpFamily {
    V4,
    V6,
}

impl IcmpFamily {
    /// Family of `addr`.
    #[must_use]
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }

    /// This engine's echo identifier for the family.
    #[must_use]
    pub fn echo_id(self) -> u16 {
        match self {
            Self::V4 => ECHO_ID_V4,
            Self::V6 => ECHO_ID_V6,
        }
    }

    /// IANA protocol number (1 for ICMP, 58 for ICMPv6).
    #[must_use]
    pub fn protocol(self) -> i32 {
        match self {
            Self::V4 => 1,
            Self::V6 => 58,
        }
    }

    fn type_for(self, kind: EchoKind) -> u8 {
        match (self, kind) {
            (Self::V4, EchoKind::Request) => 8,
            (Self::V4, EchoKind::Reply) => 0,
            (Self::V6, EchoKind::Request) => 128,
            (Self::V6, EchoKind::Reply) => 129,
        }
    }

    fn kind_of(self, icmp_type: u8) -> Option<EchoKind> {
        match (self, icmp_type) {
            (Self::V4, 8) | (Self::V6, 128) => Some(EchoKind::Request),
            (Self::V4, 0) | (Self::V6, 129) => Some(EchoKind::Reply),
            _ => None,
        }
    }
}

impl fmt::Display for IcmpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::V4 => "ipv4",
            Self::V6 => "ipv6",
        })
    }
}

/// Echo request or reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoKind {
    Request,
    Reply,
}

/// A decoded ICMP or ICMPv6 echo message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoPacket {
    pub family: IcmpFamily,
    pub kind: EchoKind,
    pub identifier: u16,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

impl EchoPacket {
    /// A probe carrying this engine's identifier for `family`.
    #[must_use]
    pub fn request(family: IcmpFamily, sequence: u16, payload: Vec<u8>) -> Self {
        Self {
            family,
            kind: EchoKind::Request,
            identifier: family.echo_id(),
            sequence,
            payload,
        }
    }

    /// The reply a well-behaved host would send for this request.
    #[must_use]
    pub fn reply(&self) -> Self {
        Self {
            kind: EchoKind::Reply,
            ..self.clone()
        }
    }

    /// Serialize to wire format.
    ///
    /// The ICMPv4 checksum is filled in. The ICMPv6 checksum covers a
    /// pseudo-header only the kernel knows, so it is left zero for the
    /// kernel to compute.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(ECHO_HEADER_LEN + self.payload.len());
        bytes.push(self.family.type_for(self.kind));
        bytes.push(0);
        bytes.extend_from_slice(&[0, 0]);
        bytes.extend_from_slice(&self.identifier.to_be_bytes());
        bytes.extend_from_slice(&self.sequence.to_be_bytes());
        bytes.extend_from_slice(&self.payload);

        if self.family == IcmpFamily::V4 {
            let sum = checksum(&bytes).to_be_bytes();
            bytes[2] = sum[0];
            bytes[3] = sum[1];
        }
        bytes
    }

    /// Parse an ICMP message (no IP header) of the given family.
    ///
    /// # Errors
    ///
    /// [`PacketError::TooShort`] for a truncated header,
    /// [`PacketError::NotEcho`] for any non-echo type, and
    /// [`PacketError::Checksum`] if an ICMPv4 checksum does not verify.
    pub fn parse(family: IcmpFamily, bytes: &[u8]) -> Result<Self, PacketError> {
        let Some((header, payload)) = bytes.split_first_chunk::<ECHO_HEADER_LEN>() else {
            return Err(PacketError::TooShort {
                expected: ECHO_HEADER_LEN,
                actual: bytes.len(),
            });
        };
        let [icmp_type, code, c0, c1, i0, i1, s0, s1] = *header;

        let kind = family
            .kind_of(icmp_type)
            .filter(|_| code == 0)
            .ok_or(PacketError::NotEcho { icmp_type, code })?;

        if family == IcmpFamily::V4 && checksum(bytes) != 0 {
            let mut zeroed = bytes.to_vec();
            zeroed[2] = 0;
            zeroed[3] = 0;
            return Err(PacketError::Checksum {
                computed: checksum(&zeroed),
                carried: u16::from_be_bytes([c0, c1]),
            });
        }

        Ok(Self {
            family,
            kind,
            identifier: u16::from_be_bytes([i0, i1]),
            sequence: u16::from_be_bytes([s0, s1]),
            payload: payload.to_vec(),
        })
    }
}

/// Skip the IPv4 header that raw ICMPv4 sockets deliver ahead of the message.
///
/// # Errors
///
/// [`PacketError::BadIpHeader`] if the version is not 4 or the header
/// length field is below the minimum, [`PacketError::TooShort`] if the
/// datagram is shorter than its own header.
pub fn strip_ipv4_header(datagram: &[u8]) -> Result<&[u8], PacketError> {
    let first = *datagram.first().ok_or(PacketError::TooShort {
        expected: IPV4_MIN_HEADER_LEN,
        actual: 0,
    })?;

    let version = first >> 4;
    if version != 4 {
        return Err(PacketError::BadIpHeader {
            reason: format!("version {version}"),
        });
    }
    let header_len = usize::from(first & 0x0F) * 4;
    if header_len < IPV4_MIN_HEADER_LEN {
        return Err(PacketError::BadIpHeader {
            reason: format!("header length {header_len}"),
        });
    }

    datagram.get(header_len..).ok_or(PacketError::TooShort {
        expected: header_len,
        actual: datagram.len(),
    })
}

/// Probe payload: the send time as RFC 3339 text.
#[must_use]
pub fn timestamp_payload(now: DateTime<Utc>) -> Vec<u8> {
    now.to_rfc3339().into_bytes()
}

/// RFC 1071 Internet checksum.
fn checksum(bytes: &[u8]) -> u16 {
    let mut chunks = bytes.chunks_exact(2);
    let mut sum: u32 = chunks
        .by_ref()
        .map(|pair| u32::from(u16::from_be_bytes([pair[0], pair[1]])))
        .sum();
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    #[allow(clippy::cast_possible_truncation)]
    let folded = sum as u16;
    !folded
}
