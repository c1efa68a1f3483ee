//! Stateless address autoconfiguration over raw ICMPv6.
//!
//! Sequence mirrors what a host does on link-up: derive the EUI-64
//! link-local address, run Duplicate Address Detection, solicit a router,
//! then act on the advertisement: form the global address from an
//! autonomous prefix, record the RDNSS server, and escalate to stateless
//! or stateful DHCPv6 when the M/O flags ask for it. The controller only
//! offloads IP framing for raw sockets, so ICMPv6 checksums over the
//! pseudo-header are computed here.

use alloc::vec::Vec;
use core::net::{IpAddr, Ipv6Addr};

use bitflags::bitflags;
use log::{debug, info, warn};

use crate::bus::RegisterBus;
use crate::ethernet::{Clock, Ethernet};
use crate::ip;
use crate::socket::SocketId;

const ICMPV6_PROTOCOL: u8 = 58;

const TYPE_ROUTER_SOLICIT: u8 = 133;
const TYPE_ROUTER_ADVERT: u8 = 134;
const TYPE_NEIGHBOR_SOLICIT: u8 = 135;
const TYPE_NEIGHBOR_ADVERT: u8 = 136;

/// NDP option types
const OPT_SOURCE_LLA: u8 = 1;
const OPT_PREFIX_INFO: u8 = 3;
const OPT_RDNSS: u8 = 25;

/// Prefix-information flag: address may be formed autonomously.
const PREFIX_FLAG_AUTONOMOUS: u8 = 0x40;

/// All-routers multicast group (ff02::2).
const ALL_ROUTERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 2);

/// How long a tentative address listens for a defending advertisement.
const DAD_WINDOW_MS: u64 = 1000;

const RS_ATTEMPTS: u32 = 3;

bitflags! {
    /// Router advertisement configuration flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RaFlags: u8 {
        /// Addresses are managed by DHCPv6.
        const MANAGED = 0x80;
        /// Other configuration (DNS etc.) available via DHCPv6.
        const OTHER = 0x40;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaacOutcome {
    /// Global address formed and RDNSS learned; nothing else needed.
    SlaacComplete,
    /// Address formed, but other configuration must come from DHCPv6.
    NeedStatelessDhcp,
    /// Router demands managed address assignment.
    NeedStatefulDhcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaacError {
    NoFreeSocket,
    /// Another node defended our tentative link-local address.
    AddressInUse,
    /// No router advertisement within the solicitation budget.
    NoRouter,
}

struct RaInfo {
    flags: RaFlags,
    /// First autonomous on-link prefix, with its length.
    prefix: Option<(Ipv6Addr, u8)>,
    rdnss: Option<Ipv6Addr>,
}

/// Run autoconfiguration. Programs the link-local, global, prefix and
/// gateway registers and records the RDNSS server on success; the returned
/// outcome tells the caller which DHCPv6 flavor (if any) must follow.
pub(crate) fn auto_configure<B: RegisterBus, C: Clock>(
    eth: &mut Ethernet<B, C>,
    mac: &[u8; 6],
    response_timeout_ms: u32,
) -> Result<SlaacOutcome, SlaacError> {
    let sock = eth
        .socket_open_raw6(ICMPV6_PROTOCOL)
        .ok_or(SlaacError::NoFreeSocket)?;
    let result = run(eth, sock, mac, response_timeout_ms);
    eth.socket_close(sock);
    result
}

fn run<B: RegisterBus, C: Clock>(
    eth: &mut Ethernet<B, C>,
    sock: SocketId,
    mac: &[u8; 6],
    response_timeout_ms: u32,
) -> Result<SlaacOutcome, SlaacError> {
    let lla = ip::link_local_from_mac(mac);

    duplicate_address_detection(eth, sock, &lla)?;
    eth.write_v6(eth.layout.link_local, &lla);
    info!("slaac: link-local {}", lla);

    let (router, ra) = solicit_router(eth, sock, mac, &lla, response_timeout_ms)?;

    if let Some((prefix, len)) = ra.prefix {
        let global = ip::merge_prefix(&prefix, &ip::eui64_interface_id(mac));
        eth.write_v6(eth.layout.global_unicast, &global);
        eth.write_v6(eth.layout.subnet6, &ip::prefix_mask(len));
        info!("slaac: global {} (/{} via {})", global, len, router);
    }
    eth.write_v6(eth.layout.gateway6, &router);
    if let Some(dns) = ra.rdnss {
        eth.dns_server = Some(IpAddr::V6(dns));
        debug!("slaac: rdnss {}", dns);
    }
    Ok(outcome_for(&ra))
}

fn outcome_for(ra: &RaInfo) -> SlaacOutcome {
    if ra.flags.contains(RaFlags::MANAGED) {
        SlaacOutcome::NeedStatefulDhcp
    } else if ra.prefix.is_none() {
        // no autonomous prefix to form an address from
        SlaacOutcome::NeedStatefulDhcp
    } else if ra.flags.contains(RaFlags::OTHER) {
        SlaacOutcome::NeedStatelessDhcp
    } else if ra.rdnss.is_some() {
        SlaacOutcome::SlaacComplete
    } else {
        // address stands on its own but a resolver must still be found
        SlaacOutcome::NeedStatelessDhcp
    }
}

/// Probe the tentative address: solicit it on its solicited-node group and
/// treat any neighbor advertisement for it inside the window as a defense.
fn duplicate_address_detection<B: RegisterBus, C: Clock>(
    eth: &mut Ethernet<B, C>,
    sock: SocketId,
    tentative: &Ipv6Addr,
) -> Result<(), SlaacError> {
    let probe = build_neighbor_solicit(tentative);
    let group = ip::solicited_node(tentative);
    eth.socket_send_to(sock, &IpAddr::V6(group), 0, &probe);

    let deadline = eth.now_ms() + DAD_WINDOW_MS;
    while eth.now_ms() < deadline {
        let mut buf = [0u8; 128];
        if let Some((_, _, n)) = eth.socket_recv_frame(sock, &mut buf) {
            if n >= 24 && buf[0] == TYPE_NEIGHBOR_ADVERT {
                let mut target = [0u8; 16];
                target.copy_from_slice(&buf[8..24]);
                if Ipv6Addr::from(target) == *tentative {
                    warn!("slaac: {} already in use on this link", tentative);
                    return Err(SlaacError::AddressInUse);
                }
            }
        }
        eth.sleep_ms(2);
    }
    Ok(())
}

fn solicit_router<B: RegisterBus, C: Clock>(
    eth: &mut Ethernet<B, C>,
    sock: SocketId,
    mac: &[u8; 6],
    lla: &Ipv6Addr,
    response_timeout_ms: u32,
) -> Result<(Ipv6Addr, RaInfo), SlaacError> {
    for attempt in 0..RS_ATTEMPTS {
        if attempt > 0 {
            debug!("slaac: re-soliciting router ({})", attempt + 1);
        }
        let solicit = build_router_solicit(mac, lla);
        eth.socket_send_to(sock, &IpAddr::V6(ALL_ROUTERS), 0, &solicit);

        let deadline = eth.now_ms() + response_timeout_ms as u64;
        while eth.now_ms() < deadline {
            let mut buf = [0u8; 512];
            if let Some((src, _, n)) = eth.socket_recv_frame(sock, &mut buf) {
                if n >= 16 && buf[0] == TYPE_ROUTER_ADVERT {
                    if let IpAddr::V6(router) = src {
                        if let Some(ra) = parse_router_advertisement(&buf[..n]) {
                            return Ok((router, ra));
                        }
                    }
                }
            }
            eth.sleep_ms(2);
        }
    }
    Err(SlaacError::NoRouter)
}

fn build_neighbor_solicit(target: &Ipv6Addr) -> Vec<u8> {
    let mut p = Vec::with_capacity(24);
    p.extend_from_slice(&[TYPE_NEIGHBOR_SOLICIT, 0, 0, 0]);
    p.extend_from_slice(&[0u8; 4]); // reserved
    p.extend_from_slice(&target.octets());
    // DAD probes originate from the unspecified address
    let sum = icmpv6_checksum(&Ipv6Addr::UNSPECIFIED, &ip::solicited_node(target), &p);
    p[2..4].copy_from_slice(&sum.to_be_bytes());
    p
}

fn build_router_solicit(mac: &[u8; 6], lla: &Ipv6Addr) -> Vec<u8> {
    let mut p = Vec::with_capacity(16);
    p.extend_from_slice(&[TYPE_ROUTER_SOLICIT, 0, 0, 0]);
    p.extend_from_slice(&[0u8; 4]); // reserved
    p.push(OPT_SOURCE_LLA);
    p.push(1); // length in units of 8 octets
    p.extend_from_slice(mac);
    let sum = icmpv6_checksum(lla, &ALL_ROUTERS, &p);
    p[2..4].copy_from_slice(&sum.to_be_bytes());
    p
}

/// Parse a router advertisement payload (starting at the ICMPv6 type).
fn parse_router_advertisement(payload: &[u8]) -> Option<RaInfo> {
    if payload.len() < 16 || payload[0] != TYPE_ROUTER_ADVERT {
        return None;
    }
    let mut ra = RaInfo {
        flags: RaFlags::from_bits_truncate(payload[5]),
        prefix: None,
        rdnss: None,
    };
    let mut pos = 16;
    while pos + 2 <= payload.len() {
        let opt_type = payload[pos];
        let opt_len = payload[pos + 1] as usize * 8;
        if opt_len == 0 || pos + opt_len > payload.len() {
            return None;
        }
        let body = &payload[pos + 2..pos + opt_len];
        match opt_type {
            OPT_PREFIX_INFO if body.len() >= 30 => {
                let prefix_len = body[0];
                let flags = body[1];
                if flags & PREFIX_FLAG_AUTONOMOUS != 0 && ra.prefix.is_none() {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(&body[14..30]);
                    ra.prefix = Some((Ipv6Addr::from(octets), prefix_len));
                }
            }
            OPT_RDNSS if body.len() >= 22 => {
                if ra.rdnss.is_none() {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(&body[6..22]);
                    ra.rdnss = Some(Ipv6Addr::from(octets));
                }
            }
            _ => {}
        }
        pos += opt_len;
    }
    Some(ra)
}

/// One's-complement checksum over the IPv6 pseudo-header and payload.
fn icmpv6_checksum(src: &Ipv6Addr, dst: &Ipv6Addr, payload: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for addr in [src, dst] {
        for chunk in addr.octets().chunks(2) {
            sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
        }
    }
    let len = payload.len() as u32;
    sum += len >> 16;
    sum += len & 0xFFFF;
    sum += ICMPV6_PROTOCOL as u32;
    let mut i = 0;
    while i + 1 < payload.len() {
        sum += u16::from_be_bytes([payload[i], payload[i + 1]]) as u32;
        i += 2;
    }
    if i < payload.len() {
        sum += (payload[i] as u32) << 8;
    }
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

// ============================================================================
// TESTS
// ============================================================================
