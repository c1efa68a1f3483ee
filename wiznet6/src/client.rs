//! TCP client: connection lifecycle and address-family classification.
//!
//! The connect and stop sequences are bounded polls over the socket status
//! register. Both are exposed two ways: blocking convenience methods that
//! sleep through the driver clock, and explicit `*_start`/`*_poll` step
//! functions taking the current time, so the same state machine can be
//! driven from a thread, an async task or a bare superloop.

use core::net::IpAddr;
use core::task::Poll;

use log::{debug, warn};

use crate::bus::RegisterBus;
use crate::chip::{ExtStatus, SocketMode, SocketStatus};
use crate::dns::DnsResolver;
use crate::ethernet::{Clock, Ethernet};
use crate::ip;
use crate::socket::SocketId;

/// Default bound for connect and close waits, per client.
pub const DEFAULT_TIMEOUT_MS: u32 = 1000;

/// Sleep between polls of a bounded wait.
const POLL_INTERVAL_MS: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectError {
    /// Hostname lookup failed; no handle was allocated.
    ResolutionFailed,
    /// Target was the all-zero or all-ones address.
    ReservedAddress,
    /// Target family needs IPv6-capable silicon.
    UnsupportedFamily,
    /// Every socket slot is taken.
    NoFreeSocket,
    /// Peer closed the handshake.
    Refused,
    /// No terminal status within the configured bound; the handle was
    /// force-closed and released.
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketError {
    NotConnected,
    /// Send rejected by the transport. Also latched in the client's sticky
    /// write-error flag.
    WriteFailed,
}

/// Address family of a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrFamily {
    V4,
    V6,
}

/// One logical TCP connection over a hardware socket slot.
pub struct TcpClient {
    sock: Option<SocketId>,
    timeout_ms: u32,
    write_error: bool,
    /// Receive-available count as of the last status or read query. Keeps
    /// `connected()` free of chip commands.
    rx_cached: u16,
    /// Deadline of the bounded wait a stepper is currently inside.
    deadline: Option<u64>,
}

impl Default for TcpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpClient {
    pub const fn new() -> Self {
        TcpClient {
            sock: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            write_error: false,
            rx_cached: 0,
            deadline: None,
        }
    }

    pub const fn with_timeout(timeout_ms: u32) -> Self {
        TcpClient {
            sock: None,
            timeout_ms,
            write_error: false,
            rx_cached: 0,
            deadline: None,
        }
    }

    /// Wrap a socket the server side already established.
    pub(crate) fn from_socket(sock: SocketId) -> Self {
        TcpClient {
            sock: Some(sock),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            write_error: false,
            rx_cached: 0,
            deadline: None,
        }
    }

    pub fn set_timeout(&mut self, timeout_ms: u32) {
        self.timeout_ms = timeout_ms;
    }

    /// Hardware slot backing this client, if any.
    pub fn socket(&self) -> Option<SocketId> {
        self.sock
    }

    /// Resolve `host` and connect. Resolution failure allocates nothing.
    pub fn connect_hostname<B: RegisterBus, C: Clock>(
        &mut self,
        eth: &mut Ethernet<B, C>,
        host: &str,
        port: u16,
    ) -> Result<(), ConnectError> {
        // drop any previous connection before spending time on the lookup
        self.release_stale(eth);
        let addr = DnsResolver::new()
            .resolve(eth, host)
            .map_err(|e| {
                warn!("lookup of {:?} failed: {:?}", host, e);
                ConnectError::ResolutionFailed
            })?;
        self.connect(eth, addr, port)
    }

    /// Connect to `addr:port`, blocking for at most the configured timeout.
    pub fn connect<B: RegisterBus, C: Clock>(
        &mut self,
        eth: &mut Ethernet<B, C>,
        addr: IpAddr,
        port: u16,
    ) -> Result<(), ConnectError> {
        self.connect_start(eth, addr, port)?;
        loop {
            let now = eth.now_ms();
            match self.connect_poll(eth, now) {
                Poll::Ready(result) => return result,
                Poll::Pending => eth.sleep_ms(POLL_INTERVAL_MS),
            }
        }
    }

    /// Begin a connection attempt: release any previous handle, validate the
    /// target, allocate a socket and issue the connect command. Follow with
    /// [`connect_poll`](Self::connect_poll) until it reports a result.
    pub fn connect_start<B: RegisterBus, C: Clock>(
        &mut self,
        eth: &mut Ethernet<B, C>,
        addr: IpAddr,
        port: u16,
    ) -> Result<(), ConnectError> {
        self.release_stale(eth);
        if ip::is_reserved(&addr) {
            return Err(ConnectError::ReservedAddress);
        }
        let mode = match addr {
            IpAddr::V4(_) => SocketMode::Tcp4,
            IpAddr::V6(_) => {
                if !eth.hardware_status().supports_ipv6() {
                    return Err(ConnectError::UnsupportedFamily);
                }
                SocketMode::Tcp6
            }
        };
        let sock = eth.socket_open(mode, 0).ok_or(ConnectError::NoFreeSocket)?;
        eth.socket_connect(sock, &addr, port);
        self.sock = Some(sock);
        self.write_error = false;
        self.rx_cached = 0;
        self.deadline = Some(eth.now_ms() + self.timeout_ms as u64);
        Ok(())
    }

    /// Advance a pending connection attempt. `Established` and `CloseWait`
    /// (peer already half-closed, data may still be readable) both count as
    /// connected; `Closed` refuses; running past the deadline force-closes
    /// and releases the handle.
    pub fn connect_poll<B: RegisterBus, C: Clock>(
        &mut self,
        eth: &mut Ethernet<B, C>,
        now_ms: u64,
    ) -> Poll<Result<(), ConnectError>> {
        let Some(sock) = self.sock else {
            return Poll::Ready(Err(ConnectError::Refused));
        };
        match eth.socket_status(sock) {
            SocketStatus::Established | SocketStatus::CloseWait => {
                self.deadline = None;
                debug!("socket {}: connected", sock);
                Poll::Ready(Ok(()))
            }
            SocketStatus::Closed => {
                eth.socket_free(sock);
                self.sock = None;
                self.deadline = None;
                debug!("socket {}: connection refused", sock);
                Poll::Ready(Err(ConnectError::Refused))
            }
            _ => {
                let deadline = self.deadline.unwrap_or(now_ms);
                if now_ms >= deadline {
                    eth.socket_close(sock);
                    self.sock = None;
                    self.deadline = None;
                    warn!("socket {}: connect timed out", sock);
                    Poll::Ready(Err(ConnectError::Timeout))
                } else {
                    Poll::Pending
                }
            }
        }
    }

    /// Close the connection: graceful disconnect first, then a forced close
    /// if the peer does not acknowledge within the timeout. Always releases
    /// the handle; a no-op when already unbound.
    pub fn stop<B: RegisterBus, C: Clock>(&mut self, eth: &mut Ethernet<B, C>) {
        if self.sock.is_none() {
            return;
        }
        self.stop_start(eth);
        loop {
            let now = eth.now_ms();
            match self.stop_poll(eth, now) {
                Poll::Ready(()) => return,
                Poll::Pending => eth.sleep_ms(POLL_INTERVAL_MS),
            }
        }
    }

    /// Issue the graceful disconnect and arm the close deadline. Follow with
    /// [`stop_poll`](Self::stop_poll) until ready.
    pub fn stop_start<B: RegisterBus, C: Clock>(&mut self, eth: &mut Ethernet<B, C>) {
        let Some(sock) = self.sock else { return };
        eth.socket_disconnect(sock);
        self.deadline = Some(eth.now_ms() + self.timeout_ms as u64);
    }

    /// Advance a pending close. Ready once the socket reports `Closed` or
    /// the deadline forces the close.
    pub fn stop_poll<B: RegisterBus, C: Clock>(
        &mut self,
        eth: &mut Ethernet<B, C>,
        now_ms: u64,
    ) -> Poll<()> {
        let Some(sock) = self.sock else {
            return Poll::Ready(());
        };
        if eth.socket_status(sock) == SocketStatus::Closed {
            eth.socket_free(sock);
        } else {
            let deadline = self.deadline.unwrap_or(now_ms);
            if now_ms < deadline {
                return Poll::Pending;
            }
            warn!("socket {}: peer did not close, forcing", sock);
            eth.socket_close(sock);
        }
        self.sock = None;
        self.deadline = None;
        self.rx_cached = 0;
        Poll::Ready(())
    }

    /// Whether the connection is usable. A half-closed (`CloseWait`) socket
    /// still counts while received data remains unread, so callers can
    /// drain the buffer after the peer's FIN. Idempotent: only status and
    /// receive-size registers are read, no commands are issued.
    pub fn connected<B: RegisterBus, C: Clock>(&mut self, eth: &mut Ethernet<B, C>) -> bool {
        let Some(sock) = self.sock else { return false };
        match eth.socket_status(sock) {
            SocketStatus::Listen | SocketStatus::Closed | SocketStatus::FinWait => false,
            SocketStatus::CloseWait => {
                self.rx_cached = eth.socket_recv_available(sock);
                self.rx_cached > 0
            }
            _ => true,
        }
    }

    /// Raw socket status, `Closed` when unbound.
    pub fn status<B: RegisterBus, C: Clock>(&mut self, eth: &mut Ethernet<B, C>) -> SocketStatus {
        match self.sock {
            Some(sock) => eth.socket_status(sock),
            None => SocketStatus::Closed,
        }
    }

    /// Bytes available to read.
    pub fn available<B: RegisterBus, C: Clock>(&mut self, eth: &mut Ethernet<B, C>) -> u16 {
        let Some(sock) = self.sock else { return 0 };
        self.rx_cached = eth.socket_recv_available(sock);
        self.rx_cached
    }

    pub fn read<B: RegisterBus, C: Clock>(
        &mut self,
        eth: &mut Ethernet<B, C>,
        buf: &mut [u8],
    ) -> usize {
        let Some(sock) = self.sock else { return 0 };
        let n = eth.socket_recv(sock, buf);
        self.rx_cached = self.rx_cached.saturating_sub(n as u16);
        n
    }

    pub fn read_byte<B: RegisterBus, C: Clock>(&mut self, eth: &mut Ethernet<B, C>) -> Option<u8> {
        let mut buf = [0u8; 1];
        if self.read(eth, &mut buf) == 1 {
            Some(buf[0])
        } else {
            None
        }
    }

    pub fn peek<B: RegisterBus, C: Clock>(&mut self, eth: &mut Ethernet<B, C>) -> Option<u8> {
        let sock = self.sock?;
        eth.socket_peek(sock)
    }

    /// Free space in the transmit buffer.
    pub fn available_for_write<B: RegisterBus, C: Clock>(
        &mut self,
        eth: &mut Ethernet<B, C>,
    ) -> u16 {
        let Some(sock) = self.sock else { return 0 };
        eth.socket_send_available(sock)
    }

    /// Queue `data` for transmission. A transport rejection latches the
    /// sticky write-error flag and reports `WriteFailed`.
    pub fn write<B: RegisterBus, C: Clock>(
        &mut self,
        eth: &mut Ethernet<B, C>,
        data: &[u8],
    ) -> Result<usize, SocketError> {
        let Some(sock) = self.sock else {
            return Err(SocketError::NotConnected);
        };
        if eth.socket_send(sock, data) {
            Ok(data.len())
        } else {
            self.write_error = true;
            Err(SocketError::WriteFailed)
        }
    }

    /// Sticky flag recording any past transport-rejected write.
    pub fn write_error(&self) -> bool {
        self.write_error
    }

    pub fn clear_write_error(&mut self) {
        self.write_error = false;
    }

    /// Wait until queued transmit data has been handed to the wire or the
    /// connection stops being writable.
    pub fn flush<B: RegisterBus, C: Clock>(&mut self, eth: &mut Ethernet<B, C>) {
        let Some(sock) = self.sock else { return };
        let buffer_size = eth.hardware_status().buffer_size();
        loop {
            let status = eth.socket_status(sock);
            if status != SocketStatus::Established && status != SocketStatus::CloseWait {
                return;
            }
            if eth.socket_send_available(sock) >= buffer_size {
                return;
            }
            eth.sleep_ms(POLL_INTERVAL_MS);
        }
    }

    pub fn local_port<B: RegisterBus, C: Clock>(&mut self, eth: &mut Ethernet<B, C>) -> u16 {
        match self.sock {
            Some(sock) => eth.socket_local_port(sock),
            None => 0,
        }
    }

    pub fn remote_port<B: RegisterBus, C: Clock>(&mut self, eth: &mut Ethernet<B, C>) -> u16 {
        match self.sock {
            Some(sock) => eth.socket_remote_port(sock),
            None => 0,
        }
    }

    /// Remote address of the live connection.
    ///
    /// The socket's mode register declares the family, except for dual-mode
    /// sockets, which commit to one family only when the handshake
    /// completes; for those the extended status register reports the live
    /// family. Classification therefore always happens here, at query time;
    /// a dual socket read before the handshake would yield garbage from the
    /// wrong register.
    pub fn remote_ip<B: RegisterBus, C: Clock>(
        &mut self,
        eth: &mut Ethernet<B, C>,
    ) -> Option<IpAddr> {
        let sock = self.sock?;
        Some(match classify(eth, sock) {
            AddrFamily::V6 => IpAddr::V6(eth.socket_dest_ip6(sock)),
            AddrFamily::V4 => IpAddr::V4(eth.socket_dest_ip4(sock)),
        })
    }

    /// Address family of the live connection; same classification as
    /// [`remote_ip`](Self::remote_ip) without the address read.
    pub fn address_family<B: RegisterBus, C: Clock>(
        &mut self,
        eth: &mut Ethernet<B, C>,
    ) -> Option<AddrFamily> {
        let sock = self.sock?;
        Some(classify(eth, sock))
    }

    /// Borrow the context alongside this client for `embedded_io` streams.
    pub fn io<'a, B: RegisterBus, C: Clock>(
        &'a mut self,
        eth: &'a mut Ethernet<B, C>,
    ) -> ClientIo<'a, B, C> {
        ClientIo { eth, client: self }
    }

    /// Step 1 of every connect: a handle whose socket is not yet closed gets
    /// a graceful disconnect, then the client unbinds unconditionally; the
    /// old socket finishes closing on its own.
    fn release_stale<B: RegisterBus, C: Clock>(&mut self, eth: &mut Ethernet<B, C>) {
        let Some(sock) = self.sock else { return };
        if eth.socket_status(sock) != SocketStatus::Closed {
            eth.socket_disconnect(sock);
        }
        eth.socket_free(sock);
        self.sock = None;
        self.rx_cached = 0;
        self.deadline = None;
    }
}

/// Family of the live connection on `sock`.
fn classify<B: RegisterBus, C: Clock>(eth: &mut Ethernet<B, C>, sock: SocketId) -> AddrFamily {
    let mode = eth.socket_mode(sock);
    let v6 = match mode {
        SocketMode::TcpDual => eth.socket_ext_status(sock).contains(ExtStatus::TCP6),
        other => other.is_v6(),
    };
    if v6 {
        AddrFamily::V6
    } else {
        AddrFamily::V4
    }
}

/// `embedded_io` adapter borrowing a client and its context.
pub struct ClientIo<'a, B: RegisterBus, C: Clock> {
    eth: &'a mut Ethernet<B, C>,
    client: &'a mut TcpClient,
}

#[derive(Debug)]
pub struct IoError(pub SocketError);

impl embedded_io::Error for IoError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self.0 {
            SocketError::NotConnected => embedded_io::ErrorKind::NotConnected,
            SocketError::WriteFailed => embedded_io::ErrorKind::Other,
        }
    }
}

impl<'a, B: RegisterBus, C: Clock> embedded_io::ErrorType for ClientIo<'a, B, C> {
    type Error = IoError;
}

impl<'a, B: RegisterBus, C: Clock> embedded_io::Read for ClientIo<'a, B, C> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.client.available(self.eth) > 0 {
                return Ok(self.client.read(self.eth, buf));
            }
            if !self.client.connected(self.eth) {
                // drained and gone: end of stream
                return Ok(0);
            }
            self.eth.sleep_ms(POLL_INTERVAL_MS);
        }
    }
}

impl<'a, B: RegisterBus, C: Clock> embedded_io::ReadReady for ClientIo<'a, B, C> {
    fn read_ready(&mut self) -> Result<bool, Self::Error> {
        Ok(self.client.available(self.eth) > 0 || !self.client.connected(self.eth))
    }
}

impl<'a, B: RegisterBus, C: Clock> embedded_io::Write for ClientIo<'a, B, C> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.client.write(self.eth, buf).map_err(IoError)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.client.flush(self.eth);
        Ok(())
    }
}

impl<'a, B: RegisterBus, C: Clock> embedded_io::WriteReady for ClientIo<'a, B, C> {
    fn write_ready(&mut self) -> Result<bool, Self::Error> {
        Ok(self.client.available_for_write(self.eth) > 0)
    }
}
