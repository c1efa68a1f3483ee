//! Connection lifecycle tests against the simulated controller.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use wiznet6::{
    AddrFamily, ConnectError, Ethernet, InitError, SocketError, SocketStatus, TcpClient,
};
use wiznet6_sim::{CloseBehavior, ConnectBehavior, Sim, SimBus, SimClock};

const CMD_OPEN: u8 = 0x01;
const CMD_DISCONNECT: u8 = 0x08;
const CMD_CLOSE: u8 = 0x10;

fn setup() -> (Sim, Ethernet<SimBus, SimClock>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let sim = Sim::new();
    let eth = Ethernet::new(sim.bus(), sim.clock()).expect("chip detection");
    (sim, eth)
}

fn target() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10))
}

#[test]
fn detects_missing_hardware() {
    let sim = Sim::new();
    sim.set_version(0x00);
    assert!(matches!(
        Ethernet::new(sim.bus(), sim.clock()),
        Err(InitError::NoHardware)
    ));
}

#[test]
fn connect_establishes_within_timeout() {
    let (sim, mut eth) = setup();
    sim.on_connect(ConnectBehavior::Establish { after_ms: 20 });

    let mut client = TcpClient::new();
    client.connect(&mut eth, target(), 80).unwrap();
    assert!(client.connected(&mut eth));
    assert_eq!(client.status(&mut eth), SocketStatus::Established);
    assert_eq!(client.remote_port(&mut eth), 80);
    assert!(client.local_port(&mut eth) >= 49152);
    sim.assert_idle();
}

#[test]
fn connect_times_out_and_releases_handle() {
    let (sim, mut eth) = setup();
    sim.on_connect(ConnectBehavior::Ignore);

    let mut client = TcpClient::with_timeout(250);
    let start = sim.now_ms();
    assert_eq!(client.connect(&mut eth, target(), 80), Err(ConnectError::Timeout));
    // bounded by the timeout plus polling granularity
    assert!(sim.now_ms() - start <= 260);
    assert_eq!(client.socket(), None);
    assert!(!client.connected(&mut eth));
    // the handle was force-closed and the slot is reusable
    assert_eq!(sim.status_byte(0), SocketStatus::Closed.as_u8());
    sim.on_connect(ConnectBehavior::Establish { after_ms: 5 });
    client.connect(&mut eth, target(), 80).unwrap();
    assert_eq!(client.socket(), Some(0));
    sim.assert_idle();
}

#[test]
fn steppers_drive_connect_and_stop_without_blocking() {
    use std::task::Poll;

    let (sim, mut eth) = setup();
    sim.on_connect(ConnectBehavior::Establish { after_ms: 10 });

    // drive the state machine from an external loop instead of the
    // blocking wrappers
    let mut client = TcpClient::new();
    client.connect_start(&mut eth, target(), 80).unwrap();
    loop {
        match client.connect_poll(&mut eth, sim.now_ms()) {
            Poll::Ready(result) => {
                result.unwrap();
                break;
            }
            Poll::Pending => sim.advance(5),
        }
    }
    assert!(client.connected(&mut eth));

    sim.on_disconnect(CloseBehavior::Acknowledge { after_ms: 5 });
    client.stop_start(&mut eth);
    while client.stop_poll(&mut eth, sim.now_ms()).is_pending() {
        sim.advance(5);
    }
    assert_eq!(client.socket(), None);
    sim.assert_idle();
}

#[test]
fn connect_refused_fails_fast() {
    let (sim, mut eth) = setup();
    sim.on_connect(ConnectBehavior::Refuse { after_ms: 5 });

    let mut client = TcpClient::new();
    let start = sim.now_ms();
    assert_eq!(client.connect(&mut eth, target(), 80), Err(ConnectError::Refused));
    assert!(sim.now_ms() - start < 50);
    assert_eq!(client.socket(), None);
}

#[test]
fn reserved_targets_fail_without_allocating() {
    let (sim, mut eth) = setup();
    let mut client = TcpClient::new();
    let reserved = [
        IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V4(Ipv4Addr::BROADCAST),
        IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        IpAddr::V6(Ipv6Addr::from(u128::MAX)),
    ];
    for addr in reserved {
        assert_eq!(
            client.connect(&mut eth, addr, 80),
            Err(ConnectError::ReservedAddress)
        );
    }
    assert_eq!(sim.open_count(), 0);
}

#[test]
fn ipv6_needs_capable_silicon() {
    let sim = Sim::new();
    sim.set_version(0x55); // W5500
    let mut eth = Ethernet::new(sim.bus(), sim.clock()).unwrap();
    let mut client = TcpClient::new();
    assert_eq!(
        client.connect(&mut eth, IpAddr::V6("2001:db8::1".parse().unwrap()), 80),
        Err(ConnectError::UnsupportedFamily)
    );
    assert_eq!(sim.open_count(), 0);
}

#[test]
fn reconnect_disconnects_old_handle_first() {
    let (sim, mut eth) = setup();
    sim.on_connect(ConnectBehavior::Establish { after_ms: 5 });
    sim.on_disconnect(CloseBehavior::Ignore); // old socket lingers in FIN-WAIT

    let mut client = TcpClient::new();
    client.connect(&mut eth, target(), 80).unwrap();
    assert_eq!(client.socket(), Some(0));

    client
        .connect(&mut eth, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 11)), 443)
        .unwrap();
    // the lingering socket 0 was not reusable, so the new connection took slot 1
    assert_eq!(client.socket(), Some(1));

    let commands = sim.commands();
    let disconnect_old = commands
        .iter()
        .position(|&(s, c)| s == 0 && c == CMD_DISCONNECT)
        .expect("old handle must be disconnected");
    let open_new = commands
        .iter()
        .position(|&(s, c)| s == 1 && c == CMD_OPEN)
        .expect("new handle must be opened");
    assert!(disconnect_old < open_new);
}

#[test]
fn stop_closes_gracefully_when_peer_acknowledges() {
    let (sim, mut eth) = setup();
    sim.on_connect(ConnectBehavior::Establish { after_ms: 5 });
    sim.on_disconnect(CloseBehavior::Acknowledge { after_ms: 30 });

    let mut client = TcpClient::new();
    client.connect(&mut eth, target(), 80).unwrap();

    let start = sim.now_ms();
    client.stop(&mut eth);
    let elapsed = sim.now_ms() - start;
    assert!((30..=45).contains(&elapsed));
    assert_eq!(client.socket(), None);
    assert!(!client.connected(&mut eth));

    // graceful path: disconnect yes, forced close no
    let commands = sim.commands();
    let disconnect = commands
        .iter()
        .position(|&(s, c)| s == 0 && c == CMD_DISCONNECT)
        .unwrap();
    assert!(!commands[disconnect..]
        .iter()
        .any(|&(s, c)| s == 0 && c == CMD_CLOSE));
}

#[test]
fn stop_forces_close_after_timeout_and_is_idempotent() {
    let (sim, mut eth) = setup();
    sim.on_connect(ConnectBehavior::Establish { after_ms: 5 });
    sim.on_disconnect(CloseBehavior::Ignore);

    let mut client = TcpClient::with_timeout(200);
    client.connect(&mut eth, target(), 80).unwrap();

    let start = sim.now_ms();
    client.stop(&mut eth);
    assert!(sim.now_ms() - start <= 210);
    assert_eq!(client.socket(), None);
    assert!(sim
        .commands()
        .iter()
        .any(|&(s, c)| s == 0 && c == CMD_CLOSE));

    // second stop is a no-op
    let command_count = sim.commands().len();
    client.stop(&mut eth);
    assert_eq!(sim.commands().len(), command_count);
}

#[test]
fn half_closed_connect_counts_as_connected_until_drained() {
    let (sim, mut eth) = setup();
    sim.on_connect(ConnectBehavior::HalfClose { after_ms: 5 });

    let mut client = TcpClient::new();
    // CLOSE-WAIT during the handshake still means the connect succeeded
    client.connect(&mut eth, target(), 80).unwrap();
    assert_eq!(client.status(&mut eth), SocketStatus::CloseWait);

    sim.push_rx(client.socket().unwrap(), b"hi");
    assert!(client.connected(&mut eth));
    assert_eq!(client.available(&mut eth), 2);

    let mut buf = [0u8; 8];
    assert_eq!(client.read(&mut eth, &mut buf), 2);
    assert_eq!(&buf[..2], b"hi");
    // fully drained half-close no longer reports connected
    assert!(!client.connected(&mut eth));
}

#[test]
fn connected_is_false_in_listen_and_fin_wait() {
    let (sim, mut eth) = setup();
    sim.on_connect(ConnectBehavior::Establish { after_ms: 5 });
    let mut client = TcpClient::new();
    client.connect(&mut eth, target(), 80).unwrap();
    let sock = client.socket().unwrap();

    sim.set_status(sock, SocketStatus::FinWait);
    assert!(!client.connected(&mut eth));
    sim.set_status(sock, SocketStatus::Listen);
    assert!(!client.connected(&mut eth));
    sim.set_status(sock, SocketStatus::Established);
    assert!(client.connected(&mut eth));
}

#[test]
fn dual_mode_classification_follows_ext_status() {
    let (sim, mut eth) = setup();
    sim.on_connect(ConnectBehavior::Establish { after_ms: 2 });

    let mut client = TcpClient::new();
    client.connect(&mut eth, target(), 80).unwrap();
    let sock = client.socket().unwrap();

    // present the socket as dual-mode, first settled on IPv4
    sim.set_mode_raw(sock, 0x0D);
    sim.set_ext_status_raw(sock, 0x00);
    sim.set_remote4(sock, Ipv4Addr::new(192, 0, 2, 1));
    let v4 = client.remote_ip(&mut eth).unwrap();
    assert_eq!(v4, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)));
    assert_eq!(client.address_family(&mut eth), Some(AddrFamily::V4));
    // the 128-bit register form keeps the v4 address in the low 32 bits
    let words = wiznet6::ip::chip_words(&v4);
    assert_eq!(&words[..12], &[0u8; 12]);
    assert_eq!(&words[12..], &[0xC0, 0x00, 0x02, 0x01]);

    // same socket, live connection negotiated IPv6
    let v6: Ipv6Addr = "2001:db8::cafe".parse().unwrap();
    sim.set_ext_status_raw(sock, 0x04);
    sim.set_remote6(sock, v6);
    assert_eq!(client.remote_ip(&mut eth), Some(IpAddr::V6(v6)));
    assert_eq!(client.address_family(&mut eth), Some(AddrFamily::V6));
}

#[test]
fn native_mode_classification_ignores_ext_status() {
    let (sim, mut eth) = setup();
    sim.on_connect(ConnectBehavior::Establish { after_ms: 2 });

    let mut client = TcpClient::new();
    let v6: Ipv6Addr = "2001:db8::99".parse().unwrap();
    client.connect(&mut eth, IpAddr::V6(v6), 443).unwrap();
    assert_eq!(client.address_family(&mut eth), Some(AddrFamily::V6));
    assert_eq!(client.remote_ip(&mut eth), Some(IpAddr::V6(v6)));
}

#[test]
fn write_failure_latches_sticky_flag() {
    let (sim, mut eth) = setup();
    sim.on_connect(ConnectBehavior::Establish { after_ms: 2 });

    let mut client = TcpClient::new();
    client.connect(&mut eth, target(), 80).unwrap();

    sim.fail_sends(true);
    assert_eq!(
        client.write(&mut eth, b"lost"),
        Err(SocketError::WriteFailed)
    );
    assert!(client.write_error());

    sim.fail_sends(false);
    assert_eq!(client.write(&mut eth, b"ok"), Ok(2));
    // flag stays latched until explicitly cleared
    assert!(client.write_error());
    client.clear_write_error();
    assert!(!client.write_error());
}

#[test]
fn data_round_trip() {
    let (sim, mut eth) = setup();
    sim.on_connect(ConnectBehavior::Establish { after_ms: 2 });

    let mut client = TcpClient::new();
    client.connect(&mut eth, target(), 80).unwrap();
    let sock = client.socket().unwrap();

    client.write(&mut eth, b"GET /\r\n").unwrap();
    client.flush(&mut eth);
    let frames = sim.sent_frames();
    let frame = frames.last().unwrap();
    assert_eq!(frame.socket, sock);
    assert_eq!(frame.dest, target());
    assert_eq!(frame.dest_port, 80);
    assert_eq!(frame.payload, b"GET /\r\n");

    sim.push_rx(sock, b"pong");
    assert_eq!(client.available(&mut eth), 4);
    assert_eq!(client.peek(&mut eth), Some(b'p'));
    // peeking consumes nothing
    assert_eq!(client.available(&mut eth), 4);
    assert_eq!(client.read_byte(&mut eth), Some(b'p'));
    let mut buf = [0u8; 8];
    assert_eq!(client.read(&mut eth, &mut buf), 3);
    assert_eq!(&buf[..3], b"ong");
}

#[test]
fn embedded_io_adapter_streams_data() {
    use embedded_io::{Read, Write};

    let (sim, mut eth) = setup();
    sim.on_connect(ConnectBehavior::Establish { after_ms: 2 });

    let mut client = TcpClient::new();
    client.connect(&mut eth, target(), 80).unwrap();
    sim.push_rx(client.socket().unwrap(), b"pong");

    let mut io = client.io(&mut eth);
    io.write(b"ping").unwrap();
    io.flush().unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(io.read(&mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], b"pong");
}

#[test]
fn allocator_exhaustion_reports_no_free_socket() {
    let (sim, mut eth) = setup();
    sim.on_connect(ConnectBehavior::Establish { after_ms: 1 });

    let mut clients: Vec<TcpClient> = (0..8).map(|_| TcpClient::new()).collect();
    for client in &mut clients {
        client.connect(&mut eth, target(), 80).unwrap();
    }
    let mut extra = TcpClient::new();
    assert_eq!(
        extra.connect(&mut eth, target(), 80),
        Err(ConnectError::NoFreeSocket)
    );
    // freeing one slot makes connects work again
    clients[3].stop(&mut eth);
    extra.connect(&mut eth, target(), 80).unwrap();
    assert_eq!(extra.socket(), Some(3));
    sim.assert_idle();
}

#[test]
fn hostname_connect_resolves_then_connects() {
    let (sim, mut eth) = setup();
    let dns_server = Ipv4Addr::new(192, 0, 2, 53);
    eth.set_dns_server(IpAddr::V4(dns_server));
    sim.on_connect(ConnectBehavior::Establish { after_ms: 3 });

    sim.add_udp_responder(53, IpAddr::V4(dns_server), 53, 2, |query| {
        let txid = [query[0], query[1]];
        let qtype = u16::from_be_bytes([query[query.len() - 4], query[query.len() - 3]]);
        Some(dns_response(txid, qtype))
    });

    let mut client = TcpClient::new();
    client.connect_hostname(&mut eth, "device.example", 8080).unwrap();
    assert!(client.connected(&mut eth));
    assert_eq!(
        client.remote_ip(&mut eth),
        Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 77)))
    );
    sim.assert_idle();
}

#[test]
fn hostname_resolution_failure_allocates_nothing() {
    let (sim, mut eth) = setup();
    eth.set_dns_server(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 53)));
    // no responder: every query times out

    let mut client = TcpClient::new();
    let before = sim.open_count();
    assert_eq!(
        client.connect_hostname(&mut eth, "device.example", 80),
        Err(ConnectError::ResolutionFailed)
    );
    // the resolver's own UDP socket is the only allocation; no TCP socket
    assert_eq!(client.socket(), None);
    assert_eq!(sim.status_byte(0), SocketStatus::Closed.as_u8());
    assert!(sim.open_count() > before); // resolver did try
    sim.assert_idle();
}

#[test]
fn server_accepts_and_relistens() {
    use wiznet6::TcpServer;

    let (sim, mut eth) = setup();
    let mut server = TcpServer::new(8080);
    server.begin(&mut eth).unwrap();
    assert_eq!(sim.status_byte(0), SocketStatus::Listen.as_u8());
    assert!(server.accept(&mut eth).is_none());

    // an inbound IPv4 peer completes the handshake on the dual-mode listener
    sim.set_status(0, SocketStatus::Established);
    sim.set_ext_status_raw(0, 0x00);
    sim.set_remote4(0, Ipv4Addr::new(192, 0, 2, 99));

    let mut conn = server.accept(&mut eth).expect("pending connection");
    assert!(conn.connected(&mut eth));
    assert_eq!(conn.address_family(&mut eth), Some(AddrFamily::V4));
    assert_eq!(
        conn.remote_ip(&mut eth),
        Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 99)))
    );
    // listening resumed on a fresh slot
    assert_eq!(sim.status_byte(1), SocketStatus::Listen.as_u8());

    conn.stop(&mut eth);
    server.end(&mut eth);
    sim.assert_idle();
}

#[test]
fn udp_echo_round_trip() {
    let (sim, mut eth) = setup();
    let peer = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7));
    sim.add_udp_responder(9999, peer, 9999, 1, |payload| Some(payload.to_vec()));

    let mut udp = wiznet6::UdpSocket::new();
    udp.begin(&mut eth, 40000).unwrap();
    assert_eq!(udp.local_port(), 40000);
    udp.send_to(&mut eth, &peer, 9999, b"echo").unwrap();

    sim.advance(2);
    let mut buf = [0u8; 16];
    let (src, src_port, n) = udp.recv_from(&mut eth, &mut buf).expect("echo reply");
    assert_eq!(src, peer);
    assert_eq!(src_port, 9999);
    assert_eq!(&buf[..n], b"echo");

    // destination family must match the socket mode
    assert_eq!(
        udp.send_to(&mut eth, &IpAddr::V6("2001:db8::1".parse().unwrap()), 9, b"x"),
        Err(wiznet6::UdpError::FamilyMismatch)
    );
    udp.close(&mut eth);
    sim.assert_idle();
}

/// Minimal answer: zero questions echoed, one address record. AAAA queries
/// get an empty answer section so the resolver falls back to A.
fn dns_response(txid: [u8; 2], qtype: u16) -> Vec<u8> {
    let answered = qtype == 1;
    let mut p = Vec::new();
    p.extend_from_slice(&txid);
    p.extend_from_slice(&0x8180u16.to_be_bytes()); // response, recursion available
    p.extend_from_slice(&0u16.to_be_bytes()); // questions
    p.extend_from_slice(&(answered as u16).to_be_bytes());
    p.extend_from_slice(&0u16.to_be_bytes());
    p.extend_from_slice(&0u16.to_be_bytes());
    if answered {
        p.push(0); // root name
        p.extend_from_slice(&1u16.to_be_bytes()); // A
        p.extend_from_slice(&1u16.to_be_bytes()); // IN
        p.extend_from_slice(&60u32.to_be_bytes());
        p.extend_from_slice(&4u16.to_be_bytes());
        p.extend_from_slice(&[192, 0, 2, 77]);
    }
    p
}
