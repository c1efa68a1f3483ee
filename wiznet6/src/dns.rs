//! DNS client for hostname resolution.
//!
//! Queries AAAA first, then falls back to A, so dual-stack targets prefer
//! the native IPv6 path. Wire format is built and parsed by hand; answers
//! may use name compression and carry CNAME records ahead of the address.

use alloc::vec::Vec;
use core::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use log::{debug, warn};
use rand_core::RngCore;

use crate::bus::RegisterBus;
use crate::ethernet::{Clock, Ethernet};
use crate::udp::UdpSocket;

/// DNS server port
pub const DNS_PORT: u16 = 53;

/// Record types
const TYPE_A: u16 = 1;
const TYPE_AAAA: u16 = 28;
/// Internet class
const CLASS_IN: u16 = 1;

/// DNS header flags
const FLAG_RD: u16 = 0x0100; // Recursion Desired
const FLAG_QR: u16 = 0x8000; // Query/Response (1 = response)

/// DNS response codes
const RCODE_MASK: u16 = 0x000F;
const RCODE_NXDOMAIN: u16 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsError {
    /// No DNS server has been configured or learned.
    NoServer,
    NoFreeSocket,
    /// No response within the retransmission budget.
    Timeout,
    /// The name does not exist, or has no address record of either family.
    NotFound,
    /// Server answered with an error code.
    ServerFailure,
}

/// Hostname resolver. Stateless apart from its retransmission tuning.
pub struct DnsResolver {
    attempts: u8,
    attempt_timeout_ms: u32,
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsResolver {
    pub const fn new() -> Self {
        DnsResolver {
            attempts: 3,
            attempt_timeout_ms: 2000,
        }
    }

    pub const fn with_timing(attempts: u8, attempt_timeout_ms: u32) -> Self {
        DnsResolver {
            attempts,
            attempt_timeout_ms,
        }
    }

    /// Resolve `host` to an address. Address literals short-circuit without
    /// touching the network.
    pub fn resolve<B: RegisterBus, C: Clock>(
        &self,
        eth: &mut Ethernet<B, C>,
        host: &str,
    ) -> Result<IpAddr, DnsError> {
        if let Ok(v4) = host.parse::<Ipv4Addr>() {
            return Ok(IpAddr::V4(v4));
        }
        if let Ok(v6) = host.parse::<Ipv6Addr>() {
            return Ok(IpAddr::V6(v6));
        }
        let server = eth.dns_server().ok_or(DnsError::NoServer)?;

        match self.query(eth, server, host, TYPE_AAAA) {
            Ok(addr) => Ok(addr),
            Err(DnsError::NoFreeSocket) => Err(DnsError::NoFreeSocket),
            Err(first) => {
                debug!("no AAAA for {:?} ({:?}), trying A", host, first);
                self.query(eth, server, host, TYPE_A)
            }
        }
    }

    fn query<B: RegisterBus, C: Clock>(
        &self,
        eth: &mut Ethernet<B, C>,
        server: IpAddr,
        host: &str,
        qtype: u16,
    ) -> Result<IpAddr, DnsError> {
        let mut sock = UdpSocket::new();
        let opened = match server {
            IpAddr::V4(_) => sock.begin(eth, 0),
            IpAddr::V6(_) => sock.begin6(eth, 0),
        };
        opened.map_err(|_| DnsError::NoFreeSocket)?;

        let mut result = Err(DnsError::Timeout);
        'attempts: for _ in 0..self.attempts {
            let txid = eth.rng.next_u32() as u16;
            let packet = build_query(txid, host, qtype);
            if sock.send_to(eth, &server, DNS_PORT, &packet).is_err() {
                warn!("dns query transmit failed");
                continue;
            }
            let deadline = eth.now_ms() + self.attempt_timeout_ms as u64;
            while eth.now_ms() < deadline {
                let mut buf = [0u8; 512];
                if let Some((_, _, n)) = sock.recv_from(eth, &mut buf) {
                    match parse_response(&buf[..n], txid, qtype) {
                        ParseOutcome::Answer(addr) => {
                            result = Ok(addr);
                            break 'attempts;
                        }
                        ParseOutcome::NameError | ParseOutcome::NoRecord => {
                            result = Err(DnsError::NotFound);
                            break 'attempts;
                        }
                        ParseOutcome::ServerFailure => {
                            result = Err(DnsError::ServerFailure);
                            break; // retransmit
                        }
                        // stale or damaged datagram; keep waiting
                        ParseOutcome::WrongId | ParseOutcome::Malformed => {}
                    }
                }
                eth.sleep_ms(2);
            }
        }
        sock.close(eth);
        result
    }
}

/// Build a query packet for one record type.
pub(crate) fn build_query(txid: u16, hostname: &str, qtype: u16) -> Vec<u8> {
    let hostname = hostname.as_bytes();
    // header (12) + name (length bytes + terminator) + qtype (2) + qclass (2)
    let mut packet = Vec::with_capacity(12 + hostname.len() + 2 + 4);

    packet.extend_from_slice(&txid.to_be_bytes());
    packet.extend_from_slice(&FLAG_RD.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes()); // questions
    packet.extend_from_slice(&0u16.to_be_bytes()); // answers
    packet.extend_from_slice(&0u16.to_be_bytes()); // authority
    packet.extend_from_slice(&0u16.to_be_bytes()); // additional

    encode_domain_name(hostname, &mut packet);
    packet.extend_from_slice(&qtype.to_be_bytes());
    packet.extend_from_slice(&CLASS_IN.to_be_bytes());
    packet
}

/// Encode a domain name as length-prefixed labels:
/// "example.com" -> [7]example[3]com[0]
fn encode_domain_name(hostname: &[u8], packet: &mut Vec<u8>) {
    let mut label_start = 0;
    for i in 0..=hostname.len() {
        if i == hostname.len() || hostname[i] == b'.' {
            let label_len = i - label_start;
            if label_len > 0 && label_len <= 63 {
                packet.push(label_len as u8);
                packet.extend_from_slice(&hostname[label_start..i]);
            }
            label_start = i + 1;
        }
    }
    packet.push(0);
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ParseOutcome {
    Answer(IpAddr),
    /// NXDOMAIN
    NameError,
    /// Clean response without a record of the requested type
    NoRecord,
    ServerFailure,
    WrongId,
    Malformed,
}

/// Parse a response packet, looking for the first record of `qtype`.
pub(crate) fn parse_response(packet: &[u8], expected_txid: u16, qtype: u16) -> ParseOutcome {
    if packet.len() < 12 {
        return ParseOutcome::Malformed;
    }
    let txid = u16::from_be_bytes([packet[0], packet[1]]);
    if txid != expected_txid {
        return ParseOutcome::WrongId;
    }
    let flags = u16::from_be_bytes([packet[2], packet[3]]);
    if flags & FLAG_QR == 0 {
        return ParseOutcome::Malformed;
    }
    match flags & RCODE_MASK {
        0 => {}
        RCODE_NXDOMAIN => return ParseOutcome::NameError,
        _ => return ParseOutcome::ServerFailure,
    }

    let questions = u16::from_be_bytes([packet[4], packet[5]]);
    let answers = u16::from_be_bytes([packet[6], packet[7]]);

    let mut pos = 12;
    for _ in 0..questions {
        pos = match skip_name(packet, pos) {
            Some(p) => p + 4, // qtype + qclass
            None => return ParseOutcome::Malformed,
        };
    }

    for _ in 0..answers {
        pos = match skip_name(packet, pos) {
            Some(p) => p,
            None => return ParseOutcome::Malformed,
        };
        if pos + 10 > packet.len() {
            return ParseOutcome::Malformed;
        }
        let rtype = u16::from_be_bytes([packet[pos], packet[pos + 1]]);
        let rclass = u16::from_be_bytes([packet[pos + 2], packet[pos + 3]]);
        let rdlen = u16::from_be_bytes([packet[pos + 8], packet[pos + 9]]) as usize;
        pos += 10;
        if pos + rdlen > packet.len() {
            return ParseOutcome::Malformed;
        }
        if rclass == CLASS_IN && rtype == qtype {
            if qtype == TYPE_A && rdlen == 4 {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&packet[pos..pos + 4]);
                return ParseOutcome::Answer(IpAddr::V4(Ipv4Addr::from(octets)));
            }
            if qtype == TYPE_AAAA && rdlen == 16 {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&packet[pos..pos + 16]);
                return ParseOutcome::Answer(IpAddr::V6(Ipv6Addr::from(octets)));
            }
            return ParseOutcome::Malformed;
        }
        // CNAME or other record; skip its data
        pos += rdlen;
    }
    ParseOutcome::NoRecord
}

/// Skip a possibly-compressed domain name, returning the offset just after.
fn skip_name(packet: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let len = *packet.get(pos)?;
        if len == 0 {
            return Some(pos + 1);
        }
        if len & 0xC0 == 0xC0 {
            // compression pointer ends the name
            return if pos + 2 <= packet.len() { Some(pos + 2) } else { None };
        }
        pos += 1 + len as usize;
        if pos > packet.len() {
            return None;
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
