//! Register-level simulator of a W6100-class controller.
//!
//! Implements the driver's logical register model over an in-memory
//! register file, with scripted peer behavior: connects can be accepted,
//! refused or left hanging on a simulated clock, disconnects acknowledged
//! or ignored, and UDP/raw traffic answered by registered responders. The
//! chip state is shared behind a mutex so one [`Sim`] hands out the
//! [`SimBus`] and [`SimClock`] halves the driver wants plus the inspection
//! hooks tests use.
//!
//! The simulator also polices the driver's transaction discipline: nested
//! or unbalanced acquisitions, register traffic outside a transaction, and
//! sleeping while holding the bus all panic.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex, MutexGuard};

use log::trace;
use wiznet6::chip::{
    SocketCommand, SocketInterrupt, SocketMode, SocketStatus, MODE_RESET, PHY_LINK,
    VERSION_REGISTER, W6100_LAYOUT,
};
use wiznet6::ethernet::Clock;
use wiznet6::{RegisterBlock, RegisterBus};

const NUM_SOCKETS: usize = 8;
const COMMON_SPACE: usize = 0x100;
const SOCKET_SPACE: usize = 0x40;
const BUFFER_SIZE: usize = 2048;

const CMD_OPEN: u8 = SocketCommand::Open as u8;
const CMD_LISTEN: u8 = SocketCommand::Listen as u8;
const CMD_CONNECT4: u8 = SocketCommand::Connect4 as u8;
const CMD_CONNECT6: u8 = SocketCommand::Connect6 as u8;
const CMD_DISCONNECT: u8 = SocketCommand::Disconnect as u8;
const CMD_CLOSE: u8 = SocketCommand::Close as u8;
const CMD_SEND: u8 = SocketCommand::Send as u8;
const CMD_RECV: u8 = SocketCommand::Recv as u8;

/// How the simulated peer treats an outgoing connection attempt.
#[derive(Debug, Clone, Copy)]
pub enum ConnectBehavior {
    /// Handshake completes `after_ms` later.
    Establish { after_ms: u64 },
    /// Handshake completes but the peer immediately half-closes.
    HalfClose { after_ms: u64 },
    /// Peer resets the handshake `after_ms` later.
    Refuse { after_ms: u64 },
    /// Peer never answers; the socket stays in SYN-SENT.
    Ignore,
}

/// How the simulated peer treats a graceful disconnect.
#[derive(Debug, Clone, Copy)]
pub enum CloseBehavior {
    /// FIN acknowledged; the socket reaches CLOSED `after_ms` later.
    Acknowledge { after_ms: u64 },
    /// Peer never acknowledges; the socket sticks in FIN-WAIT.
    Ignore,
}

/// A frame the driver handed to the chip for transmission.
#[derive(Debug, Clone)]
pub struct SentFrame {
    pub socket: u8,
    pub dest: IpAddr,
    pub dest_port: u16,
    pub payload: Vec<u8>,
}

enum Action {
    SetStatus { sock: usize, status: u8 },
    SetExt { sock: usize, bits: u8 },
    PushRx { sock: usize, data: Vec<u8> },
}

struct Pending {
    at_ms: u64,
    action: Action,
}

type Handler = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

struct Responder {
    /// Destination port to match; ignored for raw responders.
    dest_port: u16,
    raw: bool,
    src: IpAddr,
    src_port: u16,
    delay_ms: u64,
    handler: Handler,
}

struct SimSocket {
    regs: [u8; SOCKET_SPACE],
    tx: Vec<u8>,
    rx: VecDeque<u8>,
}

impl SimSocket {
    fn new() -> Self {
        SimSocket {
            regs: [0; SOCKET_SPACE],
            tx: Vec::new(),
            rx: VecDeque::new(),
        }
    }

    fn status(&self) -> u8 {
        self.regs[W6100_LAYOUT.sn_status as usize]
    }

    fn set_status(&mut self, status: u8) {
        self.regs[W6100_LAYOUT.sn_status as usize] = status;
    }

    fn mode(&self) -> SocketMode {
        SocketMode::from_bits(self.regs[W6100_LAYOUT.sn_mode as usize])
    }

    fn reg_u16(&self, addr: u16) -> u16 {
        let a = addr as usize;
        u16::from_be_bytes([self.regs[a], self.regs[a + 1]])
    }
}

struct Inner {
    now_ms: u64,
    in_transaction: bool,
    common: [u8; COMMON_SPACE],
    sockets: Vec<SimSocket>,
    commands: Vec<(u8, u8)>,
    pending: Vec<Pending>,
    connect: ConnectBehavior,
    close: CloseBehavior,
    fail_sends: bool,
    sent: Vec<SentFrame>,
    responders: Vec<Responder>,
}

impl Inner {
    fn new() -> Self {
        let mut common = [0u8; COMMON_SPACE];
        common[VERSION_REGISTER as usize] = 0x61;
        common[W6100_LAYOUT.phy_status as usize] = PHY_LINK;
        Inner {
            now_ms: 0,
            in_transaction: false,
            common,
            sockets: (0..NUM_SOCKETS).map(|_| SimSocket::new()).collect(),
            commands: Vec::new(),
            pending: Vec::new(),
            connect: ConnectBehavior::Establish { after_ms: 10 },
            close: CloseBehavior::Acknowledge { after_ms: 10 },
            fail_sends: false,
            sent: Vec::new(),
            responders: Vec::new(),
        }
    }

    fn reset(&mut self) {
        let version = self.common[VERSION_REGISTER as usize];
        let phy = self.common[W6100_LAYOUT.phy_status as usize];
        self.common = [0; COMMON_SPACE];
        self.common[VERSION_REGISTER as usize] = version;
        self.common[W6100_LAYOUT.phy_status as usize] = phy;
        for sock in &mut self.sockets {
            *sock = SimSocket::new();
        }
    }

    fn schedule(&mut self, at_ms: u64, action: Action) {
        if at_ms <= self.now_ms {
            self.apply(action);
        } else {
            self.pending.push(Pending { at_ms, action });
        }
    }

    fn apply(&mut self, action: Action) {
        match action {
            Action::SetStatus { sock, status } => self.sockets[sock].set_status(status),
            Action::SetExt { sock, bits } => {
                self.sockets[sock].regs[W6100_LAYOUT.sn_ext_status as usize] = bits;
            }
            Action::PushRx { sock, data } => self.sockets[sock].rx.extend(data),
        }
    }

    fn advance_to(&mut self, t: u64) {
        loop {
            let next = self
                .pending
                .iter()
                .enumerate()
                .filter(|(_, p)| p.at_ms <= t)
                .min_by_key(|(_, p)| p.at_ms)
                .map(|(i, _)| i);
            let Some(i) = next else { break };
            let p = self.pending.swap_remove(i);
            self.now_ms = self.now_ms.max(p.at_ms);
            self.apply(p.action);
        }
        self.now_ms = self.now_ms.max(t);
    }

    fn command(&mut self, sock: usize, cmd: u8) {
        self.commands.push((sock as u8, cmd));
        trace!("sim: socket {} command {:#04x}", sock, cmd);
        match cmd {
            CMD_OPEN => {
                let status = match self.sockets[sock].mode() {
                    SocketMode::Tcp4 | SocketMode::Tcp6 | SocketMode::TcpDual => SocketStatus::Init,
                    SocketMode::Udp4 | SocketMode::Udp6 | SocketMode::UdpDual => SocketStatus::Udp,
                    SocketMode::IpRaw4 | SocketMode::IpRaw6 => SocketStatus::IpRaw,
                    SocketMode::MacRaw => SocketStatus::MacRaw,
                    SocketMode::Closed => SocketStatus::Closed,
                };
                let s = &mut self.sockets[sock];
                s.tx.clear();
                s.rx.clear();
                s.set_status(status.as_u8());
            }
            CMD_CONNECT4 | CMD_CONNECT6 => {
                self.sockets[sock].set_status(SocketStatus::SynSent.as_u8());
                let ext = if cmd == CMD_CONNECT6 {
                    wiznet6::ExtStatus::TCP6.bits()
                } else {
                    0
                };
                let now = self.now_ms;
                match self.connect {
                    ConnectBehavior::Establish { after_ms } => {
                        self.schedule(now + after_ms, Action::SetExt { sock, bits: ext });
                        self.schedule(
                            now + after_ms,
                            Action::SetStatus {
                                sock,
                                status: SocketStatus::Established.as_u8(),
                            },
                        );
                    }
                    ConnectBehavior::HalfClose { after_ms } => {
                        self.schedule(now + after_ms, Action::SetExt { sock, bits: ext });
                        self.schedule(
                            now + after_ms,
                            Action::SetStatus {
                                sock,
                                status: SocketStatus::CloseWait.as_u8(),
                            },
                        );
                    }
                    ConnectBehavior::Refuse { after_ms } => {
                        self.schedule(
                            now + after_ms,
                            Action::SetStatus {
                                sock,
                                status: SocketStatus::Closed.as_u8(),
                            },
                        );
                    }
                    ConnectBehavior::Ignore => {}
                }
            }
            CMD_LISTEN => self.sockets[sock].set_status(SocketStatus::Listen.as_u8()),
            CMD_DISCONNECT => {
                self.sockets[sock].set_status(SocketStatus::FinWait.as_u8());
                if let CloseBehavior::Acknowledge { after_ms } = self.close {
                    let at = self.now_ms + after_ms;
                    self.schedule(
                        at,
                        Action::SetStatus {
                            sock,
                            status: SocketStatus::Closed.as_u8(),
                        },
                    );
                }
            }
            CMD_CLOSE => {
                let s = &mut self.sockets[sock];
                s.set_status(SocketStatus::Closed.as_u8());
                s.tx.clear();
                s.rx.clear();
            }
            CMD_SEND => self.process_send(sock),
            CMD_RECV => {
                let consumed = self.sockets[sock].reg_u16(W6100_LAYOUT.sn_rx_read) as usize;
                let s = &mut self.sockets[sock];
                for _ in 0..consumed.min(s.rx.len()) {
                    s.rx.pop_front();
                }
            }
            _ => panic!("sim: unknown socket command {:#04x}", cmd),
        }
    }

    fn process_send(&mut self, sock: usize) {
        let len = self.sockets[sock].reg_u16(W6100_LAYOUT.sn_tx_write) as usize;
        let mode = self.sockets[sock].mode();
        let dest_port = self.sockets[sock].reg_u16(W6100_LAYOUT.sn_dest_port);
        let dest = if mode.is_v6() || mode == SocketMode::TcpDual {
            let a = W6100_LAYOUT.sn_dest_ip6 as usize;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&self.sockets[sock].regs[a..a + 16]);
            IpAddr::V6(Ipv6Addr::from(octets))
        } else {
            let a = W6100_LAYOUT.sn_dest_ip4 as usize;
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&self.sockets[sock].regs[a..a + 4]);
            IpAddr::V4(Ipv4Addr::from(octets))
        };

        let payload: Vec<u8> = {
            let s = &mut self.sockets[sock];
            let n = len.min(s.tx.len());
            let payload = s.tx[..n].to_vec();
            s.tx.clear();
            payload
        };

        let ir = W6100_LAYOUT.sn_interrupt as usize;
        if self.fail_sends {
            self.sockets[sock].regs[ir] |= SocketInterrupt::TIMEOUT.bits();
            self.sent.push(SentFrame {
                socket: sock as u8,
                dest,
                dest_port,
                payload,
            });
            return;
        }
        self.sockets[sock].regs[ir] |= SocketInterrupt::SEND_OK.bits();

        // hand the frame to any matching responder (datagram and raw
        // sockets only; TCP payloads just land in the sent log)
        let raw_socket = matches!(mode, SocketMode::IpRaw4 | SocketMode::IpRaw6);
        let datagram = matches!(mode, SocketMode::Udp4 | SocketMode::Udp6);
        let mut replies: Vec<(u64, Vec<u8>)> = Vec::new();
        for r in &mut self.responders {
            if !raw_socket && !datagram {
                break;
            }
            if r.raw != raw_socket {
                continue;
            }
            if !r.raw && r.dest_port != dest_port {
                continue;
            }
            if let Some(reply) = (r.handler)(&payload) {
                let framed = frame_for(mode, r.src, r.src_port, &reply);
                replies.push((r.delay_ms, framed));
            }
        }
        let now = self.now_ms;
        for (delay, framed) in replies {
            self.schedule(now + delay, Action::PushRx { sock, data: framed });
        }

        self.sent.push(SentFrame {
            socket: sock as u8,
            dest,
            dest_port,
            payload,
        });
    }
}

/// Receive-path framing of the logical chip model: datagrams carry
/// `src ‖ src port ‖ length`, raw frames `src ‖ length`.
fn frame_for(mode: SocketMode, src: IpAddr, src_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut f = Vec::with_capacity(20 + payload.len());
    match (mode, src) {
        (SocketMode::Udp4 | SocketMode::IpRaw4, IpAddr::V4(v4)) => {
            f.extend_from_slice(&v4.octets())
        }
        (SocketMode::Udp6 | SocketMode::IpRaw6, IpAddr::V6(v6)) => {
            f.extend_from_slice(&v6.octets())
        }
        _ => panic!("sim: responder source family does not match socket mode"),
    }
    if matches!(mode, SocketMode::Udp4 | SocketMode::Udp6) {
        f.extend_from_slice(&src_port.to_be_bytes());
    }
    f.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    f.extend_from_slice(payload);
    f
}

/// Shared simulated chip. Clone freely; [`Sim::bus`] and [`Sim::clock`]
/// return the halves the driver consumes.
#[derive(Clone)]
pub struct Sim {
    inner: Arc<Mutex<Inner>>,
}

impl Default for Sim {
    fn default() -> Self {
        Self::new()
    }
}

impl Sim {
    pub fn new() -> Self {
        Sim {
            inner: Arc::new(Mutex::new(Inner::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("sim state poisoned")
    }

    pub fn bus(&self) -> SimBus {
        SimBus {
            inner: self.inner.clone(),
        }
    }

    pub fn clock(&self) -> SimClock {
        SimClock {
            inner: self.inner.clone(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.lock().now_ms
    }

    /// Advance simulated time, applying scheduled peer transitions.
    pub fn advance(&self, ms: u64) {
        let mut inner = self.lock();
        let t = inner.now_ms + ms;
        inner.advance_to(t);
    }

    pub fn set_link(&self, up: bool) {
        let mut inner = self.lock();
        let addr = W6100_LAYOUT.phy_status as usize;
        if up {
            inner.common[addr] |= PHY_LINK;
        } else {
            inner.common[addr] &= !PHY_LINK;
        }
    }

    pub fn set_version(&self, version: u8) {
        self.lock().common[VERSION_REGISTER as usize] = version;
    }

    pub fn on_connect(&self, behavior: ConnectBehavior) {
        self.lock().connect = behavior;
    }

    pub fn on_disconnect(&self, behavior: CloseBehavior) {
        self.lock().close = behavior;
    }

    /// Make the chip report transmit timeouts instead of SEND-OK.
    pub fn fail_sends(&self, fail: bool) {
        self.lock().fail_sends = fail;
    }

    /// Queue raw bytes on a socket's receive buffer (TCP stream data).
    pub fn push_rx(&self, sock: u8, data: &[u8]) {
        self.lock().sockets[sock as usize]
            .rx
            .extend(data.iter().copied());
    }

    pub fn set_status(&self, sock: u8, status: SocketStatus) {
        self.lock().sockets[sock as usize].set_status(status.as_u8());
    }

    pub fn set_mode_raw(&self, sock: u8, bits: u8) {
        self.lock().sockets[sock as usize].regs[W6100_LAYOUT.sn_mode as usize] = bits;
    }

    pub fn set_ext_status_raw(&self, sock: u8, bits: u8) {
        self.lock().sockets[sock as usize].regs[W6100_LAYOUT.sn_ext_status as usize] = bits;
    }

    pub fn set_remote4(&self, sock: u8, addr: Ipv4Addr) {
        let a = W6100_LAYOUT.sn_dest_ip4 as usize;
        self.lock().sockets[sock as usize].regs[a..a + 4].copy_from_slice(&addr.octets());
    }

    pub fn set_remote6(&self, sock: u8, addr: Ipv6Addr) {
        let a = W6100_LAYOUT.sn_dest_ip6 as usize;
        self.lock().sockets[sock as usize].regs[a..a + 16].copy_from_slice(&addr.octets());
    }

    pub fn status_byte(&self, sock: u8) -> u8 {
        self.lock().sockets[sock as usize].status()
    }

    /// Every socket command issued so far, in order: `(socket, command)`.
    pub fn commands(&self) -> Vec<(u8, u8)> {
        self.lock().commands.clone()
    }

    /// How many OPEN commands the allocator has issued.
    pub fn open_count(&self) -> usize {
        self.lock()
            .commands
            .iter()
            .filter(|(_, c)| *c == CMD_OPEN)
            .count()
    }

    pub fn sent_frames(&self) -> Vec<SentFrame> {
        self.lock().sent.clone()
    }

    /// Answer UDP frames sent to `dest_port`. The handler sees the payload
    /// and returns the reply payload, delivered from `src:src_port` after
    /// `delay_ms`.
    pub fn add_udp_responder<F>(
        &self,
        dest_port: u16,
        src: IpAddr,
        src_port: u16,
        delay_ms: u64,
        handler: F,
    ) where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        self.lock().responders.push(Responder {
            dest_port,
            raw: false,
            src,
            src_port,
            delay_ms,
            handler: Box::new(handler),
        });
    }

    /// Answer raw (ICMPv6) frames regardless of destination.
    pub fn add_raw_responder<F>(&self, src: Ipv6Addr, delay_ms: u64, handler: F)
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        self.lock().responders.push(Responder {
            dest_port: 0,
            raw: true,
            src: IpAddr::V6(src),
            src_port: 0,
            delay_ms,
            handler: Box::new(handler),
        });
    }

    /// Panics unless every transaction has been released.
    pub fn assert_idle(&self) {
        assert!(!self.lock().in_transaction, "bus transaction left open");
    }
}

/// The driver's register bus half of the simulator.
pub struct SimBus {
    inner: Arc<Mutex<Inner>>,
}

impl SimBus {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("sim state poisoned")
    }
}

impl RegisterBus for SimBus {
    fn begin_transaction(&mut self) {
        let mut inner = self.lock();
        assert!(!inner.in_transaction, "nested bus transaction");
        inner.in_transaction = true;
    }

    fn end_transaction(&mut self) {
        let mut inner = self.lock();
        assert!(inner.in_transaction, "transaction released twice");
        inner.in_transaction = false;
    }

    fn read(&mut self, block: RegisterBlock, addr: u16, buf: &mut [u8]) {
        let inner = self.lock();
        assert!(inner.in_transaction, "register read outside a transaction");
        match block {
            RegisterBlock::Common => {
                let a = addr as usize;
                buf.copy_from_slice(&inner.common[a..a + buf.len()]);
            }
            RegisterBlock::Socket(n) => {
                let s = &inner.sockets[n as usize];
                if addr == W6100_LAYOUT.sn_rx_size && buf.len() == 2 {
                    buf.copy_from_slice(&(s.rx.len() as u16).to_be_bytes());
                } else if addr == W6100_LAYOUT.sn_tx_free && buf.len() == 2 {
                    let free = BUFFER_SIZE.saturating_sub(s.tx.len()) as u16;
                    buf.copy_from_slice(&free.to_be_bytes());
                } else {
                    let a = addr as usize;
                    buf.copy_from_slice(&s.regs[a..a + buf.len()]);
                }
            }
            RegisterBlock::RxBuf(n) => {
                let s = &inner.sockets[n as usize];
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = s.rx.get(addr as usize + i).copied().unwrap_or(0);
                }
            }
            RegisterBlock::TxBuf(_) => panic!("sim: read from tx buffer"),
        }
    }

    fn write(&mut self, block: RegisterBlock, addr: u16, data: &[u8]) {
        let mut inner = self.lock();
        assert!(inner.in_transaction, "register write outside a transaction");
        match block {
            RegisterBlock::Common => {
                if addr == W6100_LAYOUT.mode && data.len() == 1 && data[0] & MODE_RESET != 0 {
                    inner.reset();
                    return;
                }
                let a = addr as usize;
                inner.common[a..a + data.len()].copy_from_slice(data);
            }
            RegisterBlock::Socket(n) => {
                let sock = n as usize;
                if addr == W6100_LAYOUT.sn_command && data.len() == 1 {
                    inner.command(sock, data[0]);
                    return;
                }
                if addr == W6100_LAYOUT.sn_interrupt && data.len() == 1 {
                    // write-one-to-clear
                    inner.sockets[sock].regs[addr as usize] &= !data[0];
                    return;
                }
                let a = addr as usize;
                inner.sockets[sock].regs[a..a + data.len()].copy_from_slice(data);
            }
            RegisterBlock::TxBuf(n) => {
                let s = &mut inner.sockets[n as usize];
                let end = addr as usize + data.len();
                if s.tx.len() < end {
                    s.tx.resize(end, 0);
                }
                s.tx[addr as usize..end].copy_from_slice(data);
            }
            RegisterBlock::RxBuf(_) => panic!("sim: write to rx buffer"),
        }
    }
}

/// The driver's clock half of the simulator. Sleeping advances simulated
/// time and fires scheduled peer transitions.
pub struct SimClock {
    inner: Arc<Mutex<Inner>>,
}

impl Clock for SimClock {
    fn now_ms(&mut self) -> u64 {
        self.inner.lock().expect("sim state poisoned").now_ms
    }

    fn sleep_ms(&mut self, ms: u32) {
        let mut inner = self.inner.lock().expect("sim state poisoned");
        assert!(
            !inner.in_transaction,
            "sleeping while holding a bus transaction"
        );
        let t = inner.now_ms + ms as u64;
        inner.advance_to(t);
    }
}
