//! Socket slot bookkeeping and the per-socket chip operations.
//!
//! The chip exposes a fixed table of hardware sockets. The driver-side
//! [`SocketTable`] enforces single ownership of each slot; the chip's own
//! status register decides whether a slot is actually reusable, since a
//! released socket may linger in a teardown state while the peer finishes
//! closing.

use core::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use log::{debug, warn};

use crate::bus::{RegisterBlock, RegisterBus, Transaction};
use crate::chip::{ExtStatus, SocketCommand, SocketInterrupt, SocketMode, SocketStatus};
use crate::ethernet::{Clock, Ethernet};

/// Hardware socket slots on the largest supported model.
pub const MAX_SOCKETS: usize = 8;

/// Index into the hardware socket table.
pub type SocketId = u8;

/// Bound on the wait for a send to be acknowledged by the chip.
const SEND_TIMEOUT_MS: u64 = 1000;

#[derive(Clone, Copy)]
struct Slot {
    in_use: bool,
    mode: SocketMode,
    local_port: u16,
}

const FREE_SLOT: Slot = Slot {
    in_use: false,
    mode: SocketMode::Closed,
    local_port: 0,
};

/// Driver-side ownership record for the chip's socket slots.
pub(crate) struct SocketTable {
    slots: [Slot; MAX_SOCKETS],
    count: u8,
}

impl SocketTable {
    pub fn new(count: u8) -> Self {
        SocketTable {
            slots: [FREE_SLOT; MAX_SOCKETS],
            count: count.min(MAX_SOCKETS as u8),
        }
    }

    pub fn count(&self) -> u8 {
        self.count
    }

    pub fn in_use(&self, sock: SocketId) -> bool {
        self.slots.get(sock as usize).map(|s| s.in_use).unwrap_or(true)
    }

    pub fn bind(&mut self, sock: SocketId, mode: SocketMode, local_port: u16) {
        if let Some(slot) = self.slots.get_mut(sock as usize) {
            slot.in_use = true;
            slot.mode = mode;
            slot.local_port = local_port;
        }
    }

    pub fn release(&mut self, sock: SocketId) {
        if let Some(slot) = self.slots.get_mut(sock as usize) {
            *slot = FREE_SLOT;
        }
    }

    pub fn mode(&self, sock: SocketId) -> SocketMode {
        self.slots
            .get(sock as usize)
            .map(|s| s.mode)
            .unwrap_or(SocketMode::Closed)
    }

    pub fn local_port(&self, sock: SocketId) -> u16 {
        self.slots
            .get(sock as usize)
            .map(|s| s.local_port)
            .unwrap_or(0)
    }
}

impl<B: RegisterBus, C: Clock> Ethernet<B, C> {
    /// Allocate and open a socket in `mode`. A `local_port` of zero picks a
    /// random ephemeral port. Returns `None` when every slot is taken.
    pub fn socket_open(&mut self, mode: SocketMode, local_port: u16) -> Option<SocketId> {
        self.open_inner(mode, local_port, None)
    }

    /// Open a raw IPv6 socket bound to an IP protocol number.
    pub(crate) fn socket_open_raw6(&mut self, protocol: u8) -> Option<SocketId> {
        self.open_inner(SocketMode::IpRaw6, 0, Some(protocol))
    }

    fn open_inner(
        &mut self,
        mode: SocketMode,
        local_port: u16,
        protocol: Option<u8>,
    ) -> Option<SocketId> {
        if mode.requires_ipv6() && !self.chip.supports_ipv6() {
            warn!("{:?} needs an IPv6-capable controller", mode);
            return None;
        }
        let sock = self.pick_slot()?;
        if self.socket_status(sock) != SocketStatus::Closed {
            // lingering teardown; reclaim the hardware slot first
            debug!("socket {}: reclaiming lingering slot", sock);
            self.command(sock, SocketCommand::Close);
        }
        let port = if local_port == 0 {
            self.rng.ephemeral_port()
        } else {
            local_port
        };
        let l = self.layout;
        {
            let mut bus = Transaction::new(&mut self.bus);
            let block = RegisterBlock::Socket(sock);
            bus.write_u8(block, l.sn_interrupt, 0xFF);
            bus.write_u8(block, l.sn_mode, mode.bits());
            if let Some(proto) = protocol {
                bus.write_u8(block, l.sn_protocol, proto);
            }
            bus.write_u16(block, l.sn_source_port, port);
            bus.write_u8(block, l.sn_command, SocketCommand::Open as u8);
        }
        self.sockets.bind(sock, mode, port);
        debug!("socket {}: open {:?} port {}", sock, mode, port);
        Some(sock)
    }

    /// Choose a hardware slot: prefer an unowned slot the chip reports
    /// `Closed`; failing that, an unowned slot stuck in teardown.
    fn pick_slot(&mut self) -> Option<SocketId> {
        let mut lingering = None;
        for sock in 0..self.sockets.count() {
            if self.sockets.in_use(sock) {
                continue;
            }
            let status = self.socket_status(sock);
            if status == SocketStatus::Closed {
                return Some(sock);
            }
            if status.is_closing() && lingering.is_none() {
                lingering = Some(sock);
            }
        }
        if lingering.is_none() {
            warn!("no free socket slot");
        }
        lingering
    }

    pub fn socket_listen(&mut self, sock: SocketId) {
        self.command(sock, SocketCommand::Listen);
        debug!("socket {}: listen on port {}", sock, self.sockets.local_port(sock));
    }

    /// Program the destination and issue the connect command matching the
    /// target's address family.
    pub fn socket_connect(&mut self, sock: SocketId, addr: &IpAddr, port: u16) {
        let l = self.layout;
        let block = RegisterBlock::Socket(sock);
        let mut bus = Transaction::new(&mut self.bus);
        let command = match addr {
            IpAddr::V4(v4) => {
                bus.write(block, l.sn_dest_ip4, &v4.octets());
                SocketCommand::Connect4
            }
            IpAddr::V6(v6) => {
                bus.write(block, l.sn_dest_ip6, &v6.octets());
                SocketCommand::Connect6
            }
        };
        bus.write_u16(block, l.sn_dest_port, port);
        bus.write_u8(block, l.sn_command, command as u8);
        drop(bus);
        debug!("socket {}: connect {}:{}", sock, addr, port);
    }

    /// Graceful half-close (FIN). The socket keeps tearing down on its own;
    /// the slot is released from the owner's side immediately.
    pub fn socket_disconnect(&mut self, sock: SocketId) {
        self.command(sock, SocketCommand::Disconnect);
        debug!("socket {}: disconnect", sock);
    }

    /// Force-close the hardware socket and release the slot.
    pub fn socket_close(&mut self, sock: SocketId) {
        self.command(sock, SocketCommand::Close);
        self.sockets.release(sock);
        debug!("socket {}: closed", sock);
    }

    /// Release the slot without touching the hardware (the chip already
    /// reports the socket closed).
    pub(crate) fn socket_free(&mut self, sock: SocketId) {
        self.sockets.release(sock);
    }

    pub fn socket_status(&mut self, sock: SocketId) -> SocketStatus {
        let addr = self.layout.sn_status;
        let mut bus = Transaction::new(&mut self.bus);
        SocketStatus::from(bus.read_u8(RegisterBlock::Socket(sock), addr))
    }

    /// Socket mode as programmed in the chip's mode register.
    pub(crate) fn socket_mode(&mut self, sock: SocketId) -> SocketMode {
        let addr = self.layout.sn_mode;
        let mut bus = Transaction::new(&mut self.bus);
        SocketMode::from_bits(bus.read_u8(RegisterBlock::Socket(sock), addr))
    }

    /// Extended status; meaningful on IPv6-capable models only.
    pub(crate) fn socket_ext_status(&mut self, sock: SocketId) -> ExtStatus {
        if !self.chip.supports_ipv6() {
            return ExtStatus::empty();
        }
        let addr = self.layout.sn_ext_status;
        let mut bus = Transaction::new(&mut self.bus);
        ExtStatus::from_bits_truncate(bus.read_u8(RegisterBlock::Socket(sock), addr))
    }

    pub fn socket_local_port(&mut self, sock: SocketId) -> u16 {
        let addr = self.layout.sn_source_port;
        let mut bus = Transaction::new(&mut self.bus);
        bus.read_u16(RegisterBlock::Socket(sock), addr)
    }

    pub fn socket_remote_port(&mut self, sock: SocketId) -> u16 {
        let addr = self.layout.sn_dest_port;
        let mut bus = Transaction::new(&mut self.bus);
        bus.read_u16(RegisterBlock::Socket(sock), addr)
    }

    pub(crate) fn socket_dest_ip4(&mut self, sock: SocketId) -> Ipv4Addr {
        let addr = self.layout.sn_dest_ip4;
        let mut buf = [0u8; 4];
        let mut bus = Transaction::new(&mut self.bus);
        bus.read(RegisterBlock::Socket(sock), addr, &mut buf);
        Ipv4Addr::from(buf)
    }

    pub(crate) fn socket_dest_ip6(&mut self, sock: SocketId) -> Ipv6Addr {
        let addr = self.layout.sn_dest_ip6;
        let mut buf = [0u8; 16];
        let mut bus = Transaction::new(&mut self.bus);
        bus.read(RegisterBlock::Socket(sock), addr, &mut buf);
        Ipv6Addr::from(buf)
    }

    /// Free space in the transmit buffer.
    pub fn socket_send_available(&mut self, sock: SocketId) -> u16 {
        let addr = self.layout.sn_tx_free;
        let mut bus = Transaction::new(&mut self.bus);
        bus.read_u16(RegisterBlock::Socket(sock), addr)
    }

    /// Bytes waiting in the receive buffer. A plain status read; issues no
    /// commands, so callers may poll it freely.
    pub fn socket_recv_available(&mut self, sock: SocketId) -> u16 {
        let addr = self.layout.sn_rx_size;
        let mut bus = Transaction::new(&mut self.bus);
        bus.read_u16(RegisterBlock::Socket(sock), addr)
    }

    /// Queue `data` and wait (bounded) for the chip to acknowledge the
    /// transmission. Returns false on transport rejection or timeout.
    pub fn socket_send(&mut self, sock: SocketId, data: &[u8]) -> bool {
        let chunk_size = self.chip.buffer_size() as usize;
        for chunk in data.chunks(chunk_size) {
            if !self.send_chunk(sock, chunk) {
                return false;
            }
        }
        true
    }

    /// Program a datagram destination, then send.
    pub fn socket_send_to(
        &mut self,
        sock: SocketId,
        addr: &IpAddr,
        port: u16,
        data: &[u8],
    ) -> bool {
        let l = self.layout;
        {
            let block = RegisterBlock::Socket(sock);
            let mut bus = Transaction::new(&mut self.bus);
            match addr {
                IpAddr::V4(v4) => bus.write(block, l.sn_dest_ip4, &v4.octets()),
                IpAddr::V6(v6) => bus.write(block, l.sn_dest_ip6, &v6.octets()),
            }
            bus.write_u16(block, l.sn_dest_port, port);
        }
        self.socket_send(sock, data)
    }

    fn send_chunk(&mut self, sock: SocketId, data: &[u8]) -> bool {
        if data.is_empty() {
            return true;
        }
        let l = self.layout;
        let block = RegisterBlock::Socket(sock);
        let deadline = self.now_ms() + SEND_TIMEOUT_MS;

        // wait for buffer space
        loop {
            let free = self.socket_send_available(sock);
            if free as usize >= data.len() {
                break;
            }
            let status = self.socket_status(sock);
            if status.is_closing() || status == SocketStatus::Closed {
                return false;
            }
            if self.now_ms() >= deadline {
                warn!("socket {}: send buffer never drained", sock);
                return false;
            }
            self.sleep_ms(1);
        }

        {
            let mut bus = Transaction::new(&mut self.bus);
            bus.write(RegisterBlock::TxBuf(sock), 0, data);
            bus.write_u16(block, l.sn_tx_write, data.len() as u16);
            bus.write_u8(block, l.sn_command, SocketCommand::Send as u8);
        }

        // wait for the chip to confirm or reject the transmission
        loop {
            let flags = {
                let mut bus = Transaction::new(&mut self.bus);
                SocketInterrupt::from_bits_truncate(bus.read_u8(block, l.sn_interrupt))
            };
            if flags.contains(SocketInterrupt::SEND_OK) {
                self.clear_interrupt(sock, SocketInterrupt::SEND_OK);
                return true;
            }
            if flags.contains(SocketInterrupt::TIMEOUT) {
                self.clear_interrupt(sock, SocketInterrupt::TIMEOUT);
                warn!("socket {}: send rejected by transport", sock);
                return false;
            }
            if self.now_ms() >= deadline {
                warn!("socket {}: send not acknowledged", sock);
                return false;
            }
            self.sleep_ms(1);
        }
    }

    /// Consume up to `buf.len()` bytes from a stream (TCP) socket.
    pub fn socket_recv(&mut self, sock: SocketId, buf: &mut [u8]) -> usize {
        let pending = self.socket_recv_available(sock) as usize;
        let n = pending.min(buf.len());
        if n == 0 {
            return 0;
        }
        let l = self.layout;
        let block = RegisterBlock::Socket(sock);
        let mut bus = Transaction::new(&mut self.bus);
        bus.read(RegisterBlock::RxBuf(sock), 0, &mut buf[..n]);
        bus.write_u16(block, l.sn_rx_read, n as u16);
        bus.write_u8(block, l.sn_command, SocketCommand::Recv as u8);
        n
    }

    /// Next received byte without consuming it.
    pub fn socket_peek(&mut self, sock: SocketId) -> Option<u8> {
        if self.socket_recv_available(sock) == 0 {
            return None;
        }
        let mut buf = [0u8; 1];
        let mut bus = Transaction::new(&mut self.bus);
        bus.read(RegisterBlock::RxBuf(sock), 0, &mut buf);
        Some(buf[0])
    }

    /// Consume one datagram/raw frame. Datagram sockets prefix payloads with
    /// `source address ‖ source port ‖ length`; raw sockets omit the port.
    /// Returns the source, source port (zero for raw) and the number of
    /// payload bytes copied; payload beyond `buf` is dropped with the frame.
    pub(crate) fn socket_recv_frame(
        &mut self,
        sock: SocketId,
        buf: &mut [u8],
    ) -> Option<(IpAddr, u16, usize)> {
        let mode = self.sockets.mode(sock);
        let (addr_len, has_port) = match mode {
            SocketMode::Udp4 => (4, true),
            SocketMode::Udp6 => (16, true),
            SocketMode::IpRaw4 => (4, false),
            SocketMode::IpRaw6 => (16, false),
            _ => return None,
        };
        let header_len = addr_len + if has_port { 2 } else { 0 } + 2;

        let pending = self.socket_recv_available(sock) as usize;
        if pending < header_len {
            return None;
        }

        let l = self.layout;
        let block = RegisterBlock::Socket(sock);
        let mut header = [0u8; 20];
        {
            let mut bus = Transaction::new(&mut self.bus);
            bus.read(RegisterBlock::RxBuf(sock), 0, &mut header[..header_len]);
        }

        let src = if addr_len == 4 {
            let mut a = [0u8; 4];
            a.copy_from_slice(&header[..4]);
            IpAddr::V4(Ipv4Addr::from(a))
        } else {
            let mut a = [0u8; 16];
            a.copy_from_slice(&header[..16]);
            IpAddr::V6(Ipv6Addr::from(a))
        };
        let mut at = addr_len;
        let port = if has_port {
            let p = u16::from_be_bytes([header[at], header[at + 1]]);
            at += 2;
            p
        } else {
            0
        };
        let payload_len = u16::from_be_bytes([header[at], header[at + 1]]) as usize;

        let total = header_len + payload_len;
        if pending < total {
            // frame still arriving
            return None;
        }

        let n = payload_len.min(buf.len());
        let mut bus = Transaction::new(&mut self.bus);
        if n > 0 {
            bus.read(RegisterBlock::RxBuf(sock), header_len as u16, &mut buf[..n]);
        }
        bus.write_u16(block, l.sn_rx_read, total as u16);
        bus.write_u8(block, l.sn_command, SocketCommand::Recv as u8);
        Some((src, port, n))
    }

    fn command(&mut self, sock: SocketId, command: SocketCommand) {
        let addr = self.layout.sn_command;
        let mut bus = Transaction::new(&mut self.bus);
        bus.write_u8(RegisterBlock::Socket(sock), addr, command as u8);
    }

    fn clear_interrupt(&mut self, sock: SocketId, flags: SocketInterrupt) {
        let addr = self.layout.sn_interrupt;
        let mut bus = Transaction::new(&mut self.bus);
        bus.write_u8(RegisterBlock::Socket(sock), addr, flags.bits());
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_bind_release() {
        let mut table = SocketTable::new(4);
        assert!(!table.in_use(0));
        table.bind(0, SocketMode::Tcp6, 49200);
        assert!(table.in_use(0));
        assert_eq!(table.mode(0), SocketMode::Tcp6);
        assert_eq!(table.local_port(0), 49200);
        table.release(0);
        assert!(!table.in_use(0));
        assert_eq!(table.mode(0), SocketMode::Closed);
    }

    #[test]
    fn test_table_out_of_range_is_unusable() {
        let table = SocketTable::new(4);
        assert!(table.in_use(MAX_SOCKETS as u8));
        assert_eq!(table.mode(MAX_SOCKETS as u8), SocketMode::Closed);
    }
}
