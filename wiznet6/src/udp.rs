//! UDP sockets.
//!
//! Thin wrapper over a datagram-mode hardware socket. Receives are
//! non-blocking: the chip queues whole frames and [`UdpSocket::recv_from`]
//! returns one per call, or `None` when nothing complete has arrived.

use core::net::IpAddr;

use log::debug;

use crate::bus::RegisterBus;
use crate::chip::SocketMode;
use crate::ethernet::{Clock, Ethernet};
use crate::socket::SocketId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpError {
    NoFreeSocket,
    /// Socket has not been opened.
    Unbound,
    /// Destination family does not match the socket's mode.
    FamilyMismatch,
    SendFailed,
}

/// One datagram socket.
pub struct UdpSocket {
    sock: Option<SocketId>,
    local_port: u16,
}

impl Default for UdpSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpSocket {
    pub const fn new() -> Self {
        UdpSocket {
            sock: None,
            local_port: 0,
        }
    }

    /// Open for IPv4 traffic on `local_port` (zero for ephemeral).
    pub fn begin<B: RegisterBus, C: Clock>(
        &mut self,
        eth: &mut Ethernet<B, C>,
        local_port: u16,
    ) -> Result<(), UdpError> {
        self.open(eth, SocketMode::Udp4, local_port)
    }

    /// Open for IPv6 traffic on `local_port` (zero for ephemeral).
    pub fn begin6<B: RegisterBus, C: Clock>(
        &mut self,
        eth: &mut Ethernet<B, C>,
        local_port: u16,
    ) -> Result<(), UdpError> {
        self.open(eth, SocketMode::Udp6, local_port)
    }

    fn open<B: RegisterBus, C: Clock>(
        &mut self,
        eth: &mut Ethernet<B, C>,
        mode: SocketMode,
        local_port: u16,
    ) -> Result<(), UdpError> {
        self.close(eth);
        let sock = eth
            .socket_open(mode, local_port)
            .ok_or(UdpError::NoFreeSocket)?;
        self.sock = Some(sock);
        self.local_port = eth.socket_local_port(sock);
        Ok(())
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Send one datagram.
    pub fn send_to<B: RegisterBus, C: Clock>(
        &mut self,
        eth: &mut Ethernet<B, C>,
        addr: &IpAddr,
        port: u16,
        data: &[u8],
    ) -> Result<usize, UdpError> {
        let sock = self.sock.ok_or(UdpError::Unbound)?;
        let mode = eth.socket_mode(sock);
        let matches = match addr {
            IpAddr::V4(_) => mode == SocketMode::Udp4 || mode == SocketMode::UdpDual,
            IpAddr::V6(_) => mode == SocketMode::Udp6 || mode == SocketMode::UdpDual,
        };
        if !matches {
            return Err(UdpError::FamilyMismatch);
        }
        if eth.socket_send_to(sock, addr, port, data) {
            Ok(data.len())
        } else {
            Err(UdpError::SendFailed)
        }
    }

    /// Take one received datagram, if a complete one is queued. Returns the
    /// source address, source port and payload bytes copied into `buf`.
    pub fn recv_from<B: RegisterBus, C: Clock>(
        &mut self,
        eth: &mut Ethernet<B, C>,
        buf: &mut [u8],
    ) -> Option<(IpAddr, u16, usize)> {
        let sock = self.sock?;
        eth.socket_recv_frame(sock, buf)
    }

    /// Bytes queued on the socket (frame headers included).
    pub fn available<B: RegisterBus, C: Clock>(&mut self, eth: &mut Ethernet<B, C>) -> u16 {
        match self.sock {
            Some(sock) => eth.socket_recv_available(sock),
            None => 0,
        }
    }

    /// Release the socket slot.
    pub fn close<B: RegisterBus, C: Clock>(&mut self, eth: &mut Ethernet<B, C>) {
        if let Some(sock) = self.sock.take() {
            eth.socket_close(sock);
            debug!("udp socket {} closed", sock);
        }
        self.local_port = 0;
    }
}
