//! TCP listener.
//!
//! A server owns one listening socket. Accepting an established connection
//! hands the socket over to a fresh [`TcpClient`] and re-listens on a new
//! slot, so several connections to the same port can be alive at once (up
//! to the chip's socket budget).

use log::{debug, warn};

use crate::bus::RegisterBus;
use crate::chip::{SocketMode, SocketStatus};
use crate::client::TcpClient;
use crate::ethernet::{Clock, Ethernet};
use crate::socket::SocketId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerError {
    NoFreeSocket,
}

pub struct TcpServer {
    port: u16,
    listener: Option<SocketId>,
}

impl TcpServer {
    pub const fn new(port: u16) -> Self {
        TcpServer {
            port,
            listener: None,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Open the listening socket. IPv6-capable controllers listen in dual
    /// mode so either family can connect; the live family of each accepted
    /// connection is classified per socket at query time.
    pub fn begin<B: RegisterBus, C: Clock>(
        &mut self,
        eth: &mut Ethernet<B, C>,
    ) -> Result<(), ServerError> {
        let mode = if eth.hardware_status().supports_ipv6() {
            SocketMode::TcpDual
        } else {
            SocketMode::Tcp4
        };
        let sock = eth
            .socket_open(mode, self.port)
            .ok_or(ServerError::NoFreeSocket)?;
        eth.socket_listen(sock);
        self.listener = Some(sock);
        Ok(())
    }

    /// Hand out the next established connection, if any. The listener
    /// socket becomes the client's; listening resumes on a fresh slot.
    pub fn accept<B: RegisterBus, C: Clock>(
        &mut self,
        eth: &mut Ethernet<B, C>,
    ) -> Option<TcpClient> {
        let sock = self.listener?;
        match eth.socket_status(sock) {
            SocketStatus::Established | SocketStatus::CloseWait => {
                debug!("socket {}: accepted connection on port {}", sock, self.port);
                self.listener = None;
                if self.begin(eth).is_err() {
                    warn!("port {}: cannot re-listen, sockets exhausted", self.port);
                }
                Some(TcpClient::from_socket(sock))
            }
            SocketStatus::Closed => {
                // listener died (aborted handshake); recycle it
                eth.socket_free(sock);
                self.listener = None;
                if self.begin(eth).is_err() {
                    warn!("port {}: cannot re-listen, sockets exhausted", self.port);
                }
                None
            }
            _ => None,
        }
    }

    /// Stop listening and release the socket.
    pub fn end<B: RegisterBus, C: Clock>(&mut self, eth: &mut Ethernet<B, C>) {
        if let Some(sock) = self.listener.take() {
            eth.socket_close(sock);
        }
    }
}
