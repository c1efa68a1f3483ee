//! DHCPv6 client.
//!
//! Two operating modes, selected by the router advertisement that triggered
//! us: stateful (managed address: Solicit/Advertise/Request/Reply, then
//! Renew/Rebind upkeep on the T1/T2 schedule) and stateless (address from
//! SLAAC, only other configuration fetched with Information-Request).
//! Messages are built and parsed by hand against the RFC 8415 option codes.

use alloc::vec::Vec;
use core::net::{IpAddr, Ipv6Addr};

use log::{debug, info, warn};
use rand_core::RngCore;

use crate::bus::RegisterBus;
use crate::ethernet::{Clock, Ethernet};
use crate::udp::UdpSocket;

pub const DHCP6_CLIENT_PORT: u16 = 546;
pub const DHCP6_SERVER_PORT: u16 = 547;

/// All_DHCP_Relay_Agents_and_Servers (ff02::1:2)
pub const ALL_DHCP_SERVERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 1, 2);

/// Message types
const MSG_SOLICIT: u8 = 1;
const MSG_ADVERTISE: u8 = 2;
const MSG_REQUEST: u8 = 3;
const MSG_RENEW: u8 = 5;
const MSG_REBIND: u8 = 6;
const MSG_REPLY: u8 = 7;
const MSG_INFORMATION_REQUEST: u8 = 11;

/// Option codes
const OPT_CLIENTID: u16 = 1;
const OPT_SERVERID: u16 = 2;
const OPT_IA_NA: u16 = 3;
const OPT_IAADDR: u16 = 5;
const OPT_ORO: u16 = 6;
const OPT_ELAPSED_TIME: u16 = 8;
const OPT_STATUS_CODE: u16 = 13;
const OPT_DNS_SERVERS: u16 = 23;

/// Pause after a failed renew/rebind before the next attempt.
const RETRY_HOLDOFF_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dhcp6Error {
    NoFreeSocket,
    /// No usable response within the bound.
    Timeout,
    /// Response arrived but did not carry what the exchange needs.
    BadReply,
    /// Server answered with a non-success status code.
    StatusFailed,
}

/// Result of one [`Ethernet::maintain`](crate::Ethernet::maintain) pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintainEvent {
    /// Nothing due.
    None,
    /// Lease renewed with the original server.
    RenewOk,
    /// Lease rebound; the global address may have changed and address
    /// accessors must be re-queried.
    RebindOk,
    /// A due transaction failed; it will be retried after a holdoff.
    Failed,
}

/// A bound address with its timers, all in seconds except the timestamp.
#[derive(Debug, Clone, Copy)]
struct Lease {
    address: Ipv6Addr,
    t1: u32,
    t2: u32,
    valid: u32,
    obtained_ms: u64,
}

/// DHCPv6 client state. Owned by the [`Ethernet`] context once `begin`
/// selects a DHCP-assisted configuration.
pub struct Dhcp6Client {
    stateful: bool,
    /// DUID-LL: type 3, hardware type 1, MAC.
    duid: [u8; 10],
    iaid: u32,
    server_duid: Vec<u8>,
    pending_addr: Option<Ipv6Addr>,
    lease: Option<Lease>,
    dns: Option<Ipv6Addr>,
    response_timeout_ms: u32,
    holdoff_until_ms: u64,
}

impl Dhcp6Client {
    pub fn new(mac: &[u8; 6], stateful: bool) -> Self {
        Dhcp6Client {
            stateful,
            duid: [
                0x00, 0x03, 0x00, 0x01, mac[0], mac[1], mac[2], mac[3], mac[4], mac[5],
            ],
            iaid: u32::from_be_bytes([mac[2], mac[3], mac[4], mac[5]]),
            server_duid: Vec::new(),
            pending_addr: None,
            lease: None,
            dns: None,
            response_timeout_ms: 4000,
            holdoff_until_ms: 0,
        }
    }

    pub fn is_stateful(&self) -> bool {
        self.stateful
    }

    /// Leased global address, when one is bound.
    pub fn global_address(&self) -> Option<Ipv6Addr> {
        self.lease.map(|l| l.address)
    }

    /// DNS server learned from the server, if it sent one.
    pub fn dns_server(&self) -> Option<Ipv6Addr> {
        self.dns
    }

    /// Run the acquisition exchange: Solicit/Advertise/Request/Reply when
    /// stateful, a single Information-Request round trip when stateless.
    /// `timeout_ms` bounds the whole exchange, `response_timeout_ms` one
    /// round trip before retransmission.
    pub fn acquire<B: RegisterBus, C: Clock>(
        &mut self,
        eth: &mut Ethernet<B, C>,
        timeout_ms: u32,
        response_timeout_ms: u32,
    ) -> Result<(), Dhcp6Error> {
        self.response_timeout_ms = response_timeout_ms.max(100);
        let deadline = eth.now_ms() + timeout_ms as u64;

        let mut sock = UdpSocket::new();
        sock.begin6(eth, DHCP6_CLIENT_PORT)
            .map_err(|_| Dhcp6Error::NoFreeSocket)?;

        let result = if self.stateful {
            self.acquire_stateful(eth, &mut sock, deadline)
        } else {
            self.acquire_stateless(eth, &mut sock, deadline)
        };
        sock.close(eth);

        match &result {
            Ok(()) => {
                if let Some(lease) = &self.lease {
                    info!(
                        "dhcp6: bound {} (t1={}s t2={}s valid={}s)",
                        lease.address, lease.t1, lease.t2, lease.valid
                    );
                } else {
                    info!("dhcp6: other configuration received");
                }
            }
            Err(e) => warn!("dhcp6: acquisition failed: {:?}", e),
        }
        result
    }

    fn acquire_stateful<B: RegisterBus, C: Clock>(
        &mut self,
        eth: &mut Ethernet<B, C>,
        sock: &mut UdpSocket,
        deadline: u64,
    ) -> Result<(), Dhcp6Error> {
        loop {
            let advertise = self.exchange(eth, sock, MSG_SOLICIT, deadline)?;
            if advertise.status != 0 || advertise.address.is_none() {
                return Err(Dhcp6Error::BadReply);
            }
            self.server_duid = advertise.server_duid;
            self.pending_addr = advertise.address;
            debug!("dhcp6: advertise for {:?}", self.pending_addr);

            match self.exchange(eth, sock, MSG_REQUEST, deadline) {
                Ok(reply) => {
                    let now = eth.now_ms();
                    return self.commit(&reply, now);
                }
                // the selected server went quiet; start over
                Err(Dhcp6Error::Timeout) if eth.now_ms() < deadline => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn acquire_stateless<B: RegisterBus, C: Clock>(
        &mut self,
        eth: &mut Ethernet<B, C>,
        sock: &mut UdpSocket,
        deadline: u64,
    ) -> Result<(), Dhcp6Error> {
        let reply = self.exchange(eth, sock, MSG_INFORMATION_REQUEST, deadline)?;
        if reply.status != 0 {
            return Err(Dhcp6Error::StatusFailed);
        }
        if reply.dns.is_some() {
            self.dns = reply.dns;
        }
        Ok(())
    }

    /// Lease upkeep: nothing before T1, Renew between T1 and T2, Rebind
    /// past T2, full reacquisition after expiry. Failures hold off further
    /// attempts briefly so a dead server is not hammered every pass.
    pub fn check_lease<B: RegisterBus, C: Clock>(
        &mut self,
        eth: &mut Ethernet<B, C>,
    ) -> MaintainEvent {
        let Some(lease) = self.lease else {
            return MaintainEvent::None;
        };
        let now = eth.now_ms();
        if now < self.holdoff_until_ms {
            return MaintainEvent::None;
        }
        let elapsed_s = ((now.saturating_sub(lease.obtained_ms)) / 1000) as u32;

        if elapsed_s >= lease.valid {
            warn!("dhcp6: lease expired, restarting discovery");
            let budget = self.response_timeout_ms.saturating_mul(4);
            let response = self.response_timeout_ms;
            return match self.acquire(eth, budget, response) {
                Ok(()) => MaintainEvent::RebindOk,
                Err(_) => {
                    self.holdoff_until_ms = eth.now_ms() + RETRY_HOLDOFF_MS;
                    MaintainEvent::Failed
                }
            };
        }
        if elapsed_s >= lease.t2 {
            return self.transact(eth, MSG_REBIND);
        }
        if elapsed_s >= lease.t1 {
            return self.transact(eth, MSG_RENEW);
        }
        MaintainEvent::None
    }

    fn transact<B: RegisterBus, C: Clock>(
        &mut self,
        eth: &mut Ethernet<B, C>,
        msg_type: u8,
    ) -> MaintainEvent {
        let deadline = eth.now_ms() + (self.response_timeout_ms as u64) * 2;
        let mut sock = UdpSocket::new();
        if sock.begin6(eth, DHCP6_CLIENT_PORT).is_err() {
            return MaintainEvent::Failed;
        }
        let result = self.exchange(eth, &mut sock, msg_type, deadline);
        sock.close(eth);

        match result {
            Ok(reply) => {
                let now = eth.now_ms();
                match self.commit(&reply, now) {
                    Ok(()) => {
                        if msg_type == MSG_REBIND {
                            info!("dhcp6: rebind ok");
                            MaintainEvent::RebindOk
                        } else {
                            info!("dhcp6: renew ok");
                            MaintainEvent::RenewOk
                        }
                    }
                    Err(e) => {
                        warn!("dhcp6: lease transaction rejected: {:?}", e);
                        self.holdoff_until_ms = eth.now_ms() + RETRY_HOLDOFF_MS;
                        MaintainEvent::Failed
                    }
                }
            }
            Err(e) => {
                warn!("dhcp6: lease transaction failed: {:?}", e);
                self.holdoff_until_ms = eth.now_ms() + RETRY_HOLDOFF_MS;
                MaintainEvent::Failed
            }
        }
    }

    /// Send `msg_type`, retransmitting every response timeout until the
    /// expected answer arrives or `deadline` passes.
    fn exchange<B: RegisterBus, C: Clock>(
        &mut self,
        eth: &mut Ethernet<B, C>,
        sock: &mut UdpSocket,
        msg_type: u8,
        deadline: u64,
    ) -> Result<ReplyInfo, Dhcp6Error> {
        let expect = if msg_type == MSG_SOLICIT {
            MSG_ADVERTISE
        } else {
            MSG_REPLY
        };
        let mut txid = [0u8; 3];
        eth.rng.fill_bytes(&mut txid);
        let started = eth.now_ms();

        loop {
            if eth.now_ms() >= deadline {
                return Err(Dhcp6Error::Timeout);
            }
            let elapsed_cs = ((eth.now_ms() - started) / 10).min(u16::MAX as u64) as u16;
            let message = self.build_message(msg_type, &txid, elapsed_cs);
            let dest = IpAddr::V6(ALL_DHCP_SERVERS);
            if sock.send_to(eth, &dest, DHCP6_SERVER_PORT, &message).is_err() {
                warn!("dhcp6: transmit failed");
                return Err(Dhcp6Error::Timeout);
            }

            let attempt_deadline = (eth.now_ms() + self.response_timeout_ms as u64).min(deadline);
            while eth.now_ms() < attempt_deadline {
                let mut buf = [0u8; 576];
                if let Some((_, _, n)) = sock.recv_from(eth, &mut buf) {
                    if let Some(info) = parse_message(&buf[..n], &txid, expect, &self.duid) {
                        return Ok(info);
                    }
                }
                eth.sleep_ms(2);
            }
            debug!("dhcp6: retransmitting message type {}", msg_type);
        }
    }

    fn build_message(&self, msg_type: u8, txid: &[u8; 3], elapsed_cs: u16) -> Vec<u8> {
        let mut m = Vec::with_capacity(96);
        m.push(msg_type);
        m.extend_from_slice(txid);

        push_option(&mut m, OPT_CLIENTID, &self.duid);
        push_option(&mut m, OPT_ELAPSED_TIME, &elapsed_cs.to_be_bytes());
        push_option(&mut m, OPT_ORO, &OPT_DNS_SERVERS.to_be_bytes());

        if self.stateful && msg_type != MSG_INFORMATION_REQUEST {
            let mut ia = Vec::with_capacity(40);
            ia.extend_from_slice(&self.iaid.to_be_bytes());
            ia.extend_from_slice(&0u32.to_be_bytes()); // T1: server's choice
            ia.extend_from_slice(&0u32.to_be_bytes()); // T2: server's choice
            let hint = self.pending_addr.or(self.lease.map(|l| l.address));
            if msg_type != MSG_SOLICIT {
                if let Some(addr) = hint {
                    let mut iaaddr = Vec::with_capacity(24);
                    iaaddr.extend_from_slice(&addr.octets());
                    iaaddr.extend_from_slice(&0u32.to_be_bytes());
                    iaaddr.extend_from_slice(&0u32.to_be_bytes());
                    push_option(&mut ia, OPT_IAADDR, &iaaddr);
                }
            }
            push_option(&mut m, OPT_IA_NA, &ia);
        }

        // Rebind deliberately omits the server id: any server may answer.
        if (msg_type == MSG_REQUEST || msg_type == MSG_RENEW) && !self.server_duid.is_empty() {
            push_option(&mut m, OPT_SERVERID, &self.server_duid);
        }
        m
    }

    fn commit(&mut self, reply: &ReplyInfo, now_ms: u64) -> Result<(), Dhcp6Error> {
        if reply.status != 0 {
            return Err(Dhcp6Error::StatusFailed);
        }
        let Some(address) = reply.address else {
            return Err(Dhcp6Error::BadReply);
        };
        if !reply.server_duid.is_empty() {
            self.server_duid = reply.server_duid.clone();
        }
        let valid = if reply.valid == 0 { 7200 } else { reply.valid };
        let preferred = if reply.preferred == 0 {
            valid
        } else {
            reply.preferred
        };
        // RFC 8415 defaults when the server leaves the timers to us
        let t1 = if reply.t1 == 0 { preferred / 2 } else { reply.t1 };
        let t2 = if reply.t2 == 0 {
            preferred / 5 * 4
        } else {
            reply.t2
        };
        self.lease = Some(Lease {
            address,
            t1,
            t2,
            valid,
            obtained_ms: now_ms,
        });
        self.pending_addr = None;
        if reply.dns.is_some() {
            self.dns = reply.dns;
        }
        Ok(())
    }
}

fn push_option(out: &mut Vec<u8>, code: u16, body: &[u8]) {
    out.extend_from_slice(&code.to_be_bytes());
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(body);
}

#[derive(Debug, Default)]
struct ReplyInfo {
    server_duid: Vec<u8>,
    address: Option<Ipv6Addr>,
    t1: u32,
    t2: u32,
    preferred: u32,
    valid: u32,
    dns: Option<Ipv6Addr>,
    status: u16,
}

/// Parse a server message. `None` means "not the answer we are waiting
/// for" (wrong type, transaction or client), so the caller keeps waiting.
fn parse_message(
    packet: &[u8],
    txid: &[u8; 3],
    expect_type: u8,
    our_duid: &[u8],
) -> Option<ReplyInfo> {
    if packet.len() < 4 || packet[0] != expect_type || &packet[1..4] != txid {
        return None;
    }
    let mut info = ReplyInfo::default();
    let mut pos = 4;
    while pos + 4 <= packet.len() {
        let code = u16::from_be_bytes([packet[pos], packet[pos + 1]]);
        let len = u16::from_be_bytes([packet[pos + 2], packet[pos + 3]]) as usize;
        pos += 4;
        if pos + len > packet.len() {
            return None;
        }
        let body = &packet[pos..pos + len];
        match code {
            OPT_CLIENTID => {
                if body != our_duid {
                    return None; // addressed to someone else
                }
            }
            OPT_SERVERID => info.server_duid = body.to_vec(),
            OPT_STATUS_CODE => {
                if body.len() >= 2 {
                    info.status = u16::from_be_bytes([body[0], body[1]]);
                }
            }
            OPT_DNS_SERVERS => {
                if body.len() >= 16 {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(&body[..16]);
                    info.dns = Some(Ipv6Addr::from(octets));
                }
            }
            OPT_IA_NA => parse_ia_na(body, &mut info)?,
            _ => {}
        }
        pos += len;
    }
    Some(info)
}

fn parse_ia_na(body: &[u8], info: &mut ReplyInfo) -> Option<()> {
    if body.len() < 12 {
        return None;
    }
    info.t1 = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);
    info.t2 = u32::from_be_bytes([body[8], body[9], body[10], body[11]]);
    let mut pos = 12;
    while pos + 4 <= body.len() {
        let code = u16::from_be_bytes([body[pos], body[pos + 1]]);
        let len = u16::from_be_bytes([body[pos + 2], body[pos + 3]]) as usize;
        pos += 4;
        if pos + len > body.len() {
            return None;
        }
        let inner = &body[pos..pos + len];
        match code {
            OPT_IAADDR if len >= 24 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&inner[..16]);
                info.address = Some(Ipv6Addr::from(octets));
                info.preferred = u32::from_be_bytes([inner[16], inner[17], inner[18], inner[19]]);
                info.valid = u32::from_be_bytes([inner[20], inner[21], inner[22], inner[23]]);
            }
            OPT_STATUS_CODE => {
                if inner.len() >= 2 {
                    info.status = u16::from_be_bytes([inner[0], inner[1]]);
                }
            }
            _ => {}
        }
        pos += len;
    }
    Some(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: [u8; 6] = [0x02, 0x42, 0xC0, 0xA8, 0x00, 0x17];

    fn find_option(message: &[u8], code: u16) -> Option<Vec<u8>> {
        let mut pos = 4;
        while pos + 4 <= message.len() {
            let c = u16::from_be_bytes([message[pos], message[pos + 1]]);
            let len = u16::from_be_bytes([message[pos + 2], message[pos + 3]]) as usize;
            pos += 4;
            if c == code {
                return Some(message[pos..pos + len].to_vec());
            }
            pos += len;
        }
        None
    }

    #[test]
    fn test_solicit_layout() {
        let client = Dhcp6Client::new(&MAC, true);
        let m = client.build_message(MSG_SOLICIT, &[0xAA, 0xBB, 0xCC], 0);
        assert_eq!(m[0], MSG_SOLICIT);
        assert_eq!(&m[1..4], &[0xAA, 0xBB, 0xCC]);
        let duid = find_option(&m, OPT_CLIENTID).unwrap();
        assert_eq!(&duid[..4], &[0x00, 0x03, 0x00, 0x01]);
        assert_eq!(&duid[4..], &MAC);
        let ia = find_option(&m, OPT_IA_NA).unwrap();
        assert_eq!(ia.len(), 12); // no address hint in a solicit
        assert_eq!(
            u32::from_be_bytes([ia[0], ia[1], ia[2], ia[3]]),
            u32::from_be_bytes([MAC[2], MAC[3], MAC[4], MAC[5]])
        );
        assert!(find_option(&m, OPT_SERVERID).is_none());
        assert!(find_option(&m, OPT_ORO).is_some());
    }

    #[test]
    fn test_information_request_has_no_ia() {
        let client = Dhcp6Client::new(&MAC, false);
        let m = client.build_message(MSG_INFORMATION_REQUEST, &[1, 2, 3], 0);
        assert!(find_option(&m, OPT_IA_NA).is_none());
    }

    #[test]
    fn test_renew_carries_server_and_address() {
        let mut client = Dhcp6Client::new(&MAC, true);
        client.server_duid = alloc::vec![0, 1, 0, 1, 9, 9, 9, 9];
        client.lease = Some(Lease {
            address: "2001:db8::100".parse().unwrap(),
            t1: 100,
            t2: 160,
            valid: 200,
            obtained_ms: 0,
        });
        let m = client.build_message(MSG_RENEW, &[1, 2, 3], 50);
        assert_eq!(find_option(&m, OPT_SERVERID).unwrap(), client.server_duid);
        let ia = find_option(&m, OPT_IA_NA).unwrap();
        // nested IAADDR with the bound address
        assert_eq!(u16::from_be_bytes([ia[12], ia[13]]), OPT_IAADDR);
        assert_eq!(
            &ia[16..32],
            &"2001:db8::100".parse::<Ipv6Addr>().unwrap().octets()
        );
    }

    fn reply_fixture(txid: [u8; 3], duid: &[u8], status: u16) -> Vec<u8> {
        let mut m = alloc::vec![MSG_REPLY];
        m.extend_from_slice(&txid);
        push_option(&mut m, OPT_CLIENTID, duid);
        push_option(&mut m, OPT_SERVERID, &[0, 1, 0, 1, 5, 5, 5, 5]);
        let mut ia = Vec::new();
        ia.extend_from_slice(&7u32.to_be_bytes()); // iaid
        ia.extend_from_slice(&600u32.to_be_bytes()); // t1
        ia.extend_from_slice(&960u32.to_be_bytes()); // t2
        let mut iaaddr = Vec::new();
        iaaddr.extend_from_slice(&"2001:db8::77".parse::<Ipv6Addr>().unwrap().octets());
        iaaddr.extend_from_slice(&1200u32.to_be_bytes());
        iaaddr.extend_from_slice(&2400u32.to_be_bytes());
        if status != 0 {
            let mut sc = status.to_be_bytes().to_vec();
            sc.extend_from_slice(b"no");
            push_option(&mut ia, OPT_STATUS_CODE, &sc);
        }
        push_option(&mut ia, OPT_IAADDR, &iaaddr);
        push_option(&mut m, OPT_IA_NA, &ia);
        push_option(
            &mut m,
            OPT_DNS_SERVERS,
            &"2001:db8::53".parse::<Ipv6Addr>().unwrap().octets(),
        );
        m
    }

    #[test]
    fn test_parse_reply_and_commit() {
        let mut client = Dhcp6Client::new(&MAC, true);
        let m = reply_fixture([9, 9, 9], &client.duid.clone(), 0);
        let info = parse_message(&m, &[9, 9, 9], MSG_REPLY, &client.duid).unwrap();
        assert_eq!(info.t1, 600);
        assert_eq!(info.t2, 960);
        assert_eq!(info.valid, 2400);
        client.commit(&info, 5000).unwrap();
        let lease = client.lease.unwrap();
        assert_eq!(lease.address, "2001:db8::77".parse::<Ipv6Addr>().unwrap());
        assert_eq!(lease.obtained_ms, 5000);
        assert_eq!(client.dns_server(), Some("2001:db8::53".parse().unwrap()));
    }

    #[test]
    fn test_commit_applies_default_timers() {
        let mut client = Dhcp6Client::new(&MAC, true);
        let info = ReplyInfo {
            address: Some("2001:db8::1".parse().unwrap()),
            preferred: 1000,
            valid: 2000,
            ..Default::default()
        };
        client.commit(&info, 0).unwrap();
        let lease = client.lease.unwrap();
        assert_eq!(lease.t1, 500);
        assert_eq!(lease.t2, 800);
    }

    #[test]
    fn test_parse_rejects_wrong_txid_and_type() {
        let client = Dhcp6Client::new(&MAC, true);
        let m = reply_fixture([9, 9, 9], &client.duid, 0);
        assert!(parse_message(&m, &[1, 1, 1], MSG_REPLY, &client.duid).is_none());
        assert!(parse_message(&m, &[9, 9, 9], MSG_ADVERTISE, &client.duid).is_none());
    }

    #[test]
    fn test_parse_rejects_foreign_client_id() {
        let client = Dhcp6Client::new(&MAC, true);
        let other = Dhcp6Client::new(&[1, 2, 3, 4, 5, 6], true);
        let m = reply_fixture([9, 9, 9], &other.duid, 0);
        assert!(parse_message(&m, &[9, 9, 9], MSG_REPLY, &client.duid).is_none());
    }

    #[test]
    fn test_status_code_fails_commit() {
        let mut client = Dhcp6Client::new(&MAC, true);
        let m = reply_fixture([9, 9, 9], &client.duid.clone(), 2);
        let info = parse_message(&m, &[9, 9, 9], MSG_REPLY, &client.duid).unwrap();
        assert_eq!(client.commit(&info, 0), Err(Dhcp6Error::StatusFailed));
        assert!(client.lease.is_none());
    }
}
