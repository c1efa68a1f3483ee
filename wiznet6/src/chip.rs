//! Controller models, register layouts and register-level constants.
//!
//! The concrete model is detected once at startup from the version register;
//! everything downstream dispatches through [`ChipModel::layout`] instead of
//! branching on the model at each call site. Offsets describe this driver's
//! logical register model, not the bit-exact datasheet maps.

use bitflags::bitflags;

/// Version register location, identical on every supported model so the
/// model can be probed before a layout is selected.
pub const VERSION_REGISTER: u16 = 0x0039;

/// Common mode register bit: software reset.
pub const MODE_RESET: u8 = 0x80;

/// PHY status register bit: link established.
pub const PHY_LINK: u8 = 0x01;

/// Detected Ethernet controller model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipModel {
    W5100,
    W5200,
    W5500,
    W6100,
    Unknown,
}

impl ChipModel {
    /// Map a version register value to a model.
    pub fn from_version(version: u8) -> Self {
        match version {
            0x51 => ChipModel::W5100,
            0x52 => ChipModel::W5200,
            0x55 => ChipModel::W5500,
            0x61 => ChipModel::W6100,
            _ => ChipModel::Unknown,
        }
    }

    /// Number of hardware socket slots on this model.
    pub fn socket_count(self) -> u8 {
        match self {
            ChipModel::W5100 => 4,
            ChipModel::W5200 | ChipModel::W5500 | ChipModel::W6100 => 8,
            ChipModel::Unknown => 0,
        }
    }

    /// Whether the model terminates IPv6 in hardware.
    pub fn supports_ipv6(self) -> bool {
        matches!(self, ChipModel::W6100)
    }

    /// Per-socket buffer size in bytes.
    pub fn buffer_size(self) -> u16 {
        match self {
            ChipModel::W5100 => 1024,
            _ => 2048,
        }
    }

    /// Register layout for this model. Must not be called on `Unknown`.
    pub fn layout(self) -> &'static RegisterLayout {
        match self {
            ChipModel::W5100 => &W5100_LAYOUT,
            ChipModel::W5200 => &W5200_LAYOUT,
            ChipModel::W5500 => &W5500_LAYOUT,
            ChipModel::W6100 | ChipModel::Unknown => &W6100_LAYOUT,
        }
    }
}

/// Named register offsets for one controller model.
///
/// Common-block offsets are relative to [`RegisterBlock::Common`], socket
/// offsets to the socket's own [`RegisterBlock::Socket`] window. IPv6 fields
/// are only meaningful when [`ChipModel::supports_ipv6`] holds.
pub struct RegisterLayout {
    // common block
    pub mode: u16,
    pub gateway: u16,
    pub subnet: u16,
    pub mac: u16,
    pub source_ip: u16,
    pub retry_time: u16,
    pub retry_count: u16,
    pub phy_status: u16,
    pub link_local: u16,
    pub global_unicast: u16,
    pub subnet6: u16,
    pub gateway6: u16,
    // socket block
    pub sn_mode: u16,
    pub sn_command: u16,
    pub sn_interrupt: u16,
    pub sn_status: u16,
    pub sn_ext_status: u16,
    pub sn_protocol: u16,
    pub sn_source_port: u16,
    pub sn_dest_ip4: u16,
    pub sn_dest_ip6: u16,
    pub sn_dest_port: u16,
    pub sn_tx_free: u16,
    pub sn_tx_write: u16,
    pub sn_rx_size: u16,
    pub sn_rx_read: u16,
}

pub const W5100_LAYOUT: RegisterLayout = RegisterLayout {
    mode: 0x0000,
    gateway: 0x0001,
    subnet: 0x0005,
    mac: 0x0009,
    source_ip: 0x000F,
    retry_time: 0x0017,
    retry_count: 0x0019,
    phy_status: 0x003C, // no PHY register on the W5100; never read
    link_local: 0,
    global_unicast: 0,
    subnet6: 0,
    gateway6: 0,
    sn_mode: 0x00,
    sn_command: 0x01,
    sn_interrupt: 0x02,
    sn_status: 0x03,
    sn_ext_status: 0,
    sn_protocol: 0x14,
    sn_source_port: 0x04,
    sn_dest_ip4: 0x0C,
    sn_dest_ip6: 0,
    sn_dest_port: 0x10,
    sn_tx_free: 0x20,
    sn_tx_write: 0x24,
    sn_rx_size: 0x26,
    sn_rx_read: 0x28,
};

pub const W5200_LAYOUT: RegisterLayout = RegisterLayout {
    mode: 0x0000,
    gateway: 0x0001,
    subnet: 0x0005,
    mac: 0x0009,
    source_ip: 0x000F,
    retry_time: 0x0017,
    retry_count: 0x0019,
    phy_status: 0x0035,
    link_local: 0,
    global_unicast: 0,
    subnet6: 0,
    gateway6: 0,
    sn_mode: 0x00,
    sn_command: 0x01,
    sn_interrupt: 0x02,
    sn_status: 0x03,
    sn_ext_status: 0,
    sn_protocol: 0x14,
    sn_source_port: 0x04,
    sn_dest_ip4: 0x0C,
    sn_dest_ip6: 0,
    sn_dest_port: 0x10,
    sn_tx_free: 0x20,
    sn_tx_write: 0x24,
    sn_rx_size: 0x26,
    sn_rx_read: 0x28,
};

pub const W5500_LAYOUT: RegisterLayout = RegisterLayout {
    mode: 0x0000,
    gateway: 0x0001,
    subnet: 0x0005,
    mac: 0x0009,
    source_ip: 0x000F,
    retry_time: 0x0019,
    retry_count: 0x001B,
    phy_status: 0x002E,
    link_local: 0,
    global_unicast: 0,
    subnet6: 0,
    gateway6: 0,
    sn_mode: 0x00,
    sn_command: 0x01,
    sn_interrupt: 0x02,
    sn_status: 0x03,
    sn_ext_status: 0,
    sn_protocol: 0x14,
    sn_source_port: 0x04,
    sn_dest_ip4: 0x0C,
    sn_dest_ip6: 0,
    sn_dest_port: 0x10,
    sn_tx_free: 0x20,
    sn_tx_write: 0x24,
    sn_rx_size: 0x26,
    sn_rx_read: 0x28,
};

pub const W6100_LAYOUT: RegisterLayout = RegisterLayout {
    mode: 0x0000,
    gateway: 0x0001,
    subnet: 0x0005,
    mac: 0x0009,
    source_ip: 0x000F,
    retry_time: 0x0019,
    retry_count: 0x001B,
    phy_status: 0x002E,
    link_local: 0x0040,
    global_unicast: 0x0050,
    subnet6: 0x0060,
    gateway6: 0x0070,
    sn_mode: 0x00,
    sn_command: 0x01,
    sn_interrupt: 0x02,
    sn_status: 0x03,
    sn_ext_status: 0x2E,
    sn_protocol: 0x14,
    sn_source_port: 0x04,
    sn_dest_ip4: 0x0C,
    sn_dest_ip6: 0x30,
    sn_dest_port: 0x10,
    sn_tx_free: 0x20,
    sn_tx_write: 0x24,
    sn_rx_size: 0x26,
    sn_rx_read: 0x28,
};

/// Socket status mirrored from the chip status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketStatus {
    Closed,
    Init,
    Listen,
    SynSent,
    SynRecv,
    Established,
    FinWait,
    Closing,
    TimeWait,
    CloseWait,
    LastAck,
    Udp,
    IpRaw,
    MacRaw,
    Pppoe,
    Unknown,
}

impl From<u8> for SocketStatus {
    fn from(value: u8) -> Self {
        match value {
            0x00 => SocketStatus::Closed,
            0x13 => SocketStatus::Init,
            0x14 => SocketStatus::Listen,
            0x15 => SocketStatus::SynSent,
            0x16 => SocketStatus::SynRecv,
            0x17 => SocketStatus::Established,
            0x18 => SocketStatus::FinWait,
            0x1A => SocketStatus::Closing,
            0x1B => SocketStatus::TimeWait,
            0x1C => SocketStatus::CloseWait,
            0x1D => SocketStatus::LastAck,
            0x22 => SocketStatus::Udp,
            0x32 | 0x33 => SocketStatus::IpRaw,
            0x42 => SocketStatus::MacRaw,
            0x5F => SocketStatus::Pppoe,
            _ => SocketStatus::Unknown,
        }
    }
}

impl SocketStatus {
    /// Status register encoding, the inverse of the `From<u8>` mapping.
    pub fn as_u8(self) -> u8 {
        match self {
            SocketStatus::Closed => 0x00,
            SocketStatus::Init => 0x13,
            SocketStatus::Listen => 0x14,
            SocketStatus::SynSent => 0x15,
            SocketStatus::SynRecv => 0x16,
            SocketStatus::Established => 0x17,
            SocketStatus::FinWait => 0x18,
            SocketStatus::Closing => 0x1A,
            SocketStatus::TimeWait => 0x1B,
            SocketStatus::CloseWait => 0x1C,
            SocketStatus::LastAck => 0x1D,
            SocketStatus::Udp => 0x22,
            SocketStatus::IpRaw => 0x32,
            SocketStatus::MacRaw => 0x42,
            SocketStatus::Pppoe => 0x5F,
            SocketStatus::Unknown => 0xFF,
        }
    }

    /// True for the lingering teardown states a dead socket passes through.
    pub fn is_closing(self) -> bool {
        matches!(
            self,
            SocketStatus::FinWait
                | SocketStatus::Closing
                | SocketStatus::TimeWait
                | SocketStatus::LastAck
        )
    }
}

/// Socket mode register values. The TCP mode fixes the connection's address
/// family, except `TcpDual` which commits to one only after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SocketMode {
    Closed = 0x00,
    Tcp4 = 0x01,
    Udp4 = 0x02,
    IpRaw4 = 0x03,
    MacRaw = 0x04,
    Tcp6 = 0x09,
    Udp6 = 0x0A,
    IpRaw6 = 0x0B,
    TcpDual = 0x0D,
    UdpDual = 0x0E,
}

impl SocketMode {
    pub fn bits(self) -> u8 {
        self as u8
    }

    pub fn from_bits(value: u8) -> Self {
        match value {
            0x01 => SocketMode::Tcp4,
            0x02 => SocketMode::Udp4,
            0x03 => SocketMode::IpRaw4,
            0x04 => SocketMode::MacRaw,
            0x09 => SocketMode::Tcp6,
            0x0A => SocketMode::Udp6,
            0x0B => SocketMode::IpRaw6,
            0x0D => SocketMode::TcpDual,
            0x0E => SocketMode::UdpDual,
            _ => SocketMode::Closed,
        }
    }

    pub fn is_tcp(self) -> bool {
        matches!(self, SocketMode::Tcp4 | SocketMode::Tcp6 | SocketMode::TcpDual)
    }

    /// Whether this mode pins the socket to IPv6 (dual mode pins nothing).
    pub fn is_v6(self) -> bool {
        matches!(self, SocketMode::Tcp6 | SocketMode::Udp6 | SocketMode::IpRaw6)
    }

    /// Modes only available on IPv6-capable silicon.
    pub fn requires_ipv6(self) -> bool {
        matches!(
            self,
            SocketMode::Tcp6
                | SocketMode::Udp6
                | SocketMode::IpRaw6
                | SocketMode::TcpDual
                | SocketMode::UdpDual
        )
    }
}

/// Socket command register values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SocketCommand {
    Open = 0x01,
    Listen = 0x02,
    Connect4 = 0x04,
    Disconnect = 0x08,
    Close = 0x10,
    Send = 0x20,
    Recv = 0x40,
    Connect6 = 0x84,
}

bitflags! {
    /// Socket interrupt register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SocketInterrupt: u8 {
        const CONNECTED = 0x01;
        const DISCONNECTED = 0x02;
        const RECEIVED = 0x04;
        const TIMEOUT = 0x08;
        const SEND_OK = 0x10;
    }
}

bitflags! {
    /// Extended socket status (IPv6-capable models). `TCP6` reports the
    /// address family a dual-mode connection settled into at handshake time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExtStatus: u8 {
        const TCP6 = 0x04;
    }
}

/// PHY link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Unknown,
    Up,
    Down,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_detection() {
        assert_eq!(ChipModel::from_version(0x51), ChipModel::W5100);
        assert_eq!(ChipModel::from_version(0x52), ChipModel::W5200);
        assert_eq!(ChipModel::from_version(0x55), ChipModel::W5500);
        assert_eq!(ChipModel::from_version(0x61), ChipModel::W6100);
        assert_eq!(ChipModel::from_version(0x00), ChipModel::Unknown);
    }

    #[test]
    fn test_capabilities() {
        assert!(ChipModel::W6100.supports_ipv6());
        assert!(!ChipModel::W5500.supports_ipv6());
        assert_eq!(ChipModel::W5100.socket_count(), 4);
        assert_eq!(ChipModel::W6100.socket_count(), 8);
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            SocketStatus::Closed,
            SocketStatus::Init,
            SocketStatus::Listen,
            SocketStatus::SynSent,
            SocketStatus::Established,
            SocketStatus::FinWait,
            SocketStatus::CloseWait,
            SocketStatus::TimeWait,
            SocketStatus::LastAck,
            SocketStatus::Udp,
            SocketStatus::IpRaw,
        ] {
            assert_eq!(SocketStatus::from(status.as_u8()), status);
        }
        // undocumented values collapse into Unknown
        assert_eq!(SocketStatus::from(0x99), SocketStatus::Unknown);
    }

    #[test]
    fn test_mode_bits() {
        assert_eq!(SocketMode::from_bits(SocketMode::TcpDual.bits()), SocketMode::TcpDual);
        assert!(SocketMode::TcpDual.is_tcp());
        assert!(!SocketMode::TcpDual.is_v6());
        assert!(SocketMode::Tcp6.is_v6());
        assert!(SocketMode::TcpDual.requires_ipv6());
        assert!(!SocketMode::Tcp4.requires_ipv6());
    }

    #[test]
    fn test_closing_states() {
        assert!(SocketStatus::FinWait.is_closing());
        assert!(SocketStatus::TimeWait.is_closing());
        assert!(!SocketStatus::Established.is_closing());
        assert!(!SocketStatus::Closed.is_closing());
    }
}
