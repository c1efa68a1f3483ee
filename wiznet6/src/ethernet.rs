//! Controller context.
//!
//! [`Ethernet`] owns the register bus, the clock, the socket table and the
//! lease/autoconfiguration state, and is passed by reference to clients and
//! servers. One context per controller; there are no process-wide globals.

use core::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use log::{debug, info};

use crate::bus::{RegisterBlock, RegisterBus, Transaction};
use crate::chip::{ChipModel, LinkStatus, RegisterLayout, MODE_RESET, PHY_LINK, VERSION_REGISTER};
use crate::dhcp6::{Dhcp6Client, Dhcp6Error, MaintainEvent};
use crate::rand::NetRng;
use crate::slaac::{self, SlaacError, SlaacOutcome};
use crate::socket::SocketTable;

/// Default bound for the whole autoconfiguration/lease exchange.
pub const DEFAULT_TIMEOUT_MS: u32 = 60_000;
/// Default bound for a single solicit/request round trip.
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u32 = 4_000;

/// Timing collaborator: a monotonic millisecond clock plus the short sleep
/// used between polls of a bounded wait.
pub trait Clock {
    fn now_ms(&mut self) -> u64;
    fn sleep_ms(&mut self, ms: u32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    /// Version register did not identify a supported controller.
    NoHardware,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginError {
    /// Autoconfiguration needs IPv6-capable silicon.
    Ipv6Unsupported,
    LinkDown,
    Slaac(SlaacError),
    Dhcp(Dhcp6Error),
}

/// How the current addresses were obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressConfig {
    /// Addresses programmed by the caller.
    Static,
    /// SLAAC address, options possibly from stateless DHCPv6.
    Stateless,
    /// Address and options managed by a DHCPv6 lease.
    Stateful,
}

/// Fully manual addressing for [`Ethernet::begin_static`].
pub struct StaticConfig {
    pub ip: Ipv4Addr,
    pub dns: IpAddr,
    pub gateway: Ipv4Addr,
    pub subnet: Ipv4Addr,
    pub link_local: Ipv6Addr,
    pub global: Ipv6Addr,
    pub prefix6: Ipv6Addr,
    pub gateway6: Ipv6Addr,
}

/// Driver context for one controller.
pub struct Ethernet<B: RegisterBus, C: Clock> {
    pub(crate) bus: B,
    pub(crate) clock: C,
    pub(crate) chip: ChipModel,
    pub(crate) layout: &'static RegisterLayout,
    pub(crate) sockets: SocketTable,
    pub(crate) rng: NetRng,
    pub(crate) dns_server: Option<IpAddr>,
    lease: Option<Dhcp6Client>,
    config: AddressConfig,
}

impl<B: RegisterBus, C: Clock> Ethernet<B, C> {
    /// Probe the version register, select the model's register layout and
    /// reset the controller.
    pub fn new(bus: B, mut clock: C) -> Result<Self, InitError> {
        let seed = clock.now_ms();
        let mut eth = Ethernet {
            bus,
            clock,
            chip: ChipModel::Unknown,
            layout: ChipModel::W6100.layout(),
            sockets: SocketTable::new(0),
            rng: NetRng::new(seed ^ 0x57_49_5A_6E_45_54_36_00),
            dns_server: None,
            lease: None,
            config: AddressConfig::Static,
        };

        let version = {
            let mut bus = Transaction::new(&mut eth.bus);
            bus.read_u8(RegisterBlock::Common, VERSION_REGISTER)
        };
        let chip = ChipModel::from_version(version);
        if chip == ChipModel::Unknown {
            return Err(InitError::NoHardware);
        }
        eth.chip = chip;
        eth.layout = chip.layout();
        eth.sockets = SocketTable::new(chip.socket_count());

        {
            let mode = eth.layout.mode;
            let mut bus = Transaction::new(&mut eth.bus);
            bus.write_u8(RegisterBlock::Common, mode, MODE_RESET);
        }
        info!("detected {:?}, {} sockets", chip, chip.socket_count());
        Ok(eth)
    }

    /// Bring the interface up by address autoconfiguration: duplicate
    /// address detection, SLAAC, then stateless or stateful DHCPv6 as the
    /// router advertisement demands.
    pub fn begin(
        &mut self,
        mac: &[u8; 6],
        timeout_ms: u32,
        response_timeout_ms: u32,
    ) -> Result<AddressConfig, BeginError> {
        if !self.chip.supports_ipv6() {
            return Err(BeginError::Ipv6Unsupported);
        }
        {
            let l = self.layout;
            let mut bus = Transaction::new(&mut self.bus);
            bus.write(RegisterBlock::Common, l.mac, mac);
            bus.write(RegisterBlock::Common, l.source_ip, &[0u8; 4]);
        }
        if self.link_status() != LinkStatus::Up {
            return Err(BeginError::LinkDown);
        }

        info!("address autoconfiguration start");
        let outcome =
            slaac::auto_configure(self, mac, response_timeout_ms).map_err(BeginError::Slaac)?;
        match outcome {
            SlaacOutcome::SlaacComplete => {
                info!("autoconfiguration complete (SLAAC + RDNSS)");
                self.lease = None;
                self.config = AddressConfig::Stateless;
            }
            SlaacOutcome::NeedStatelessDhcp => {
                info!("autoconfiguration continues with stateless DHCPv6");
                let mut lease = Dhcp6Client::new(mac, false);
                lease
                    .acquire(self, timeout_ms, response_timeout_ms)
                    .map_err(BeginError::Dhcp)?;
                if let Some(dns) = lease.dns_server() {
                    self.dns_server = Some(IpAddr::V6(dns));
                }
                self.lease = Some(lease);
                self.config = AddressConfig::Stateless;
            }
            SlaacOutcome::NeedStatefulDhcp => {
                info!("autoconfiguration continues with stateful DHCPv6");
                let mut lease = Dhcp6Client::new(mac, true);
                lease
                    .acquire(self, timeout_ms, response_timeout_ms)
                    .map_err(BeginError::Dhcp)?;
                if let Some(gua) = lease.global_address() {
                    self.write_v6(self.layout.global_unicast, &gua);
                }
                if let Some(dns) = lease.dns_server() {
                    self.dns_server = Some(IpAddr::V6(dns));
                }
                self.lease = Some(lease);
                self.config = AddressConfig::Stateful;
                // fresh entropy for ephemeral ports once the link is usable
                let seed = self.clock.now_ms();
                self.rng.reseed(seed.rotate_left(17) ^ 0xA5A5_5A5A_0F0F_F0F0);
            }
        }
        Ok(self.config)
    }

    /// Program a fully manual address configuration.
    pub fn begin_static(&mut self, mac: &[u8; 6], config: &StaticConfig) {
        let l = self.layout;
        {
            let mut bus = Transaction::new(&mut self.bus);
            bus.write(RegisterBlock::Common, l.mac, mac);
            bus.write(RegisterBlock::Common, l.source_ip, &config.ip.octets());
            bus.write(RegisterBlock::Common, l.gateway, &config.gateway.octets());
            bus.write(RegisterBlock::Common, l.subnet, &config.subnet.octets());
        }
        if self.chip.supports_ipv6() {
            let mut bus = Transaction::new(&mut self.bus);
            bus.write(RegisterBlock::Common, l.link_local, &config.link_local.octets());
            bus.write(RegisterBlock::Common, l.global_unicast, &config.global.octets());
            bus.write(RegisterBlock::Common, l.subnet6, &config.prefix6.octets());
            bus.write(RegisterBlock::Common, l.gateway6, &config.gateway6.octets());
        }
        self.dns_server = Some(config.dns);
        self.lease = None;
        self.config = AddressConfig::Static;
        debug!("static configuration programmed");
    }

    /// Periodic lease upkeep. A no-op unless a stateful lease is active;
    /// otherwise delegates to the lease's renew/rebind schedule. After
    /// `RebindOk` the (possibly new) global address has been re-programmed
    /// and address accessors must be re-queried; open sockets keep the
    /// address they connected with.
    pub fn maintain(&mut self) -> MaintainEvent {
        if self.config != AddressConfig::Stateful {
            return MaintainEvent::None;
        }
        let Some(mut lease) = self.lease.take() else {
            return MaintainEvent::None;
        };
        let event = lease.check_lease(self);
        if event == MaintainEvent::RebindOk {
            if let Some(gua) = lease.global_address() {
                self.write_v6(self.layout.global_unicast, &gua);
                info!("lease rebound, global address {}", gua);
            }
        }
        self.lease = Some(lease);
        event
    }

    /// PHY link state. The W5100 has no link indication.
    pub fn link_status(&mut self) -> LinkStatus {
        if self.chip == ChipModel::W5100 {
            return LinkStatus::Unknown;
        }
        let addr = self.layout.phy_status;
        let mut bus = Transaction::new(&mut self.bus);
        if bus.read_u8(RegisterBlock::Common, addr) & PHY_LINK != 0 {
            LinkStatus::Up
        } else {
            LinkStatus::Down
        }
    }

    /// Detected controller model.
    pub fn hardware_status(&self) -> ChipModel {
        self.chip
    }

    /// How the current addresses were obtained.
    pub fn address_config(&self) -> AddressConfig {
        self.config
    }

    pub fn mac_address(&mut self) -> [u8; 6] {
        let addr = self.layout.mac;
        let mut mac = [0u8; 6];
        let mut bus = Transaction::new(&mut self.bus);
        bus.read(RegisterBlock::Common, addr, &mut mac);
        mac
    }

    pub fn local_ip(&mut self) -> Ipv4Addr {
        self.read_v4(self.layout.source_ip)
    }

    pub fn subnet_mask(&mut self) -> Ipv4Addr {
        self.read_v4(self.layout.subnet)
    }

    pub fn gateway_ip(&mut self) -> Ipv4Addr {
        self.read_v4(self.layout.gateway)
    }

    pub fn link_local_address(&mut self) -> Ipv6Addr {
        self.read_v6(self.layout.link_local)
    }

    pub fn global_unicast_address(&mut self) -> Ipv6Addr {
        self.read_v6(self.layout.global_unicast)
    }

    pub fn subnet_mask6(&mut self) -> Ipv6Addr {
        self.read_v6(self.layout.subnet6)
    }

    pub fn gateway6(&mut self) -> Ipv6Addr {
        self.read_v6(self.layout.gateway6)
    }

    pub fn dns_server(&self) -> Option<IpAddr> {
        self.dns_server
    }

    pub fn set_dns_server(&mut self, server: IpAddr) {
        self.dns_server = Some(server);
    }

    pub fn set_local_ip(&mut self, ip: Ipv4Addr) {
        self.write_v4(self.layout.source_ip, &ip);
    }

    pub fn set_subnet_mask(&mut self, subnet: Ipv4Addr) {
        self.write_v4(self.layout.subnet, &subnet);
    }

    pub fn set_gateway_ip(&mut self, gateway: Ipv4Addr) {
        self.write_v4(self.layout.gateway, &gateway);
    }

    pub fn set_link_local_address(&mut self, lla: Ipv6Addr) {
        self.write_v6(self.layout.link_local, &lla);
    }

    pub fn set_global_unicast_address(&mut self, gua: Ipv6Addr) {
        self.write_v6(self.layout.global_unicast, &gua);
    }

    pub fn set_subnet_mask6(&mut self, prefix: Ipv6Addr) {
        self.write_v6(self.layout.subnet6, &prefix);
    }

    pub fn set_gateway6(&mut self, gateway: Ipv6Addr) {
        self.write_v6(self.layout.gateway6, &gateway);
    }

    /// Hardware TCP retransmission period. The register counts 100 µs
    /// units, capping the usable range at 6553 ms.
    pub fn set_retransmission_timeout(&mut self, milliseconds: u16) {
        let ms = milliseconds.min(6553);
        let addr = self.layout.retry_time;
        let mut bus = Transaction::new(&mut self.bus);
        bus.write_u16(RegisterBlock::Common, addr, ms * 10);
    }

    pub fn set_retransmission_count(&mut self, count: u8) {
        let addr = self.layout.retry_count;
        let mut bus = Transaction::new(&mut self.bus);
        bus.write_u8(RegisterBlock::Common, addr, count);
    }

    pub(crate) fn now_ms(&mut self) -> u64 {
        self.clock.now_ms()
    }

    pub(crate) fn sleep_ms(&mut self, ms: u32) {
        self.clock.sleep_ms(ms);
    }

    fn read_v4(&mut self, addr: u16) -> Ipv4Addr {
        let mut buf = [0u8; 4];
        let mut bus = Transaction::new(&mut self.bus);
        bus.read(RegisterBlock::Common, addr, &mut buf);
        Ipv4Addr::from(buf)
    }

    fn write_v4(&mut self, addr: u16, ip: &Ipv4Addr) {
        let mut bus = Transaction::new(&mut self.bus);
        bus.write(RegisterBlock::Common, addr, &ip.octets());
    }

    fn read_v6(&mut self, addr: u16) -> Ipv6Addr {
        if !self.chip.supports_ipv6() {
            return Ipv6Addr::UNSPECIFIED;
        }
        let mut buf = [0u8; 16];
        let mut bus = Transaction::new(&mut self.bus);
        bus.read(RegisterBlock::Common, addr, &mut buf);
        Ipv6Addr::from(buf)
    }

    pub(crate) fn write_v6(&mut self, addr: u16, ip: &Ipv6Addr) {
        if !self.chip.supports_ipv6() {
            return;
        }
        let mut bus = Transaction::new(&mut self.bus);
        bus.write(RegisterBlock::Common, addr, &ip.octets());
    }
}
