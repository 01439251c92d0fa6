//! End-to-end scenarios over loopback: handshake, framed data exchange,
//! authentication, the address view, graceful disconnect and memory caps.

use graviton::framing::udp::{build_datagram, UdpMode};
use graviton::instance::ConnectionState;
use graviton::profile::Profile;
use graviton::runtime::{ErrorMode, Runtime};
use graviton::socket::TcpStatus;
use graviton::support::ErrorKind;
use graviton::{Client, Server};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn runtime() -> Arc<Runtime> {
    Runtime::start(2, None).unwrap()
}

fn base_profile() -> Profile {
    let mut profile = Profile::default();
    profile.local_addr_tcp = "127.0.0.1:0".parse().unwrap();
    profile.local_addr_udp = "127.0.0.1:0".parse().unwrap();
    profile.connection_timeout_ms = 5_000;
    profile.send_timeout_ms = 5_000;
    profile
}

fn pump_until_joined(server: &Server, timeout: Duration) -> Option<usize> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Ok(Some(id)) = server.client_joined() {
            return Some(id);
        }
        thread::sleep(Duration::from_millis(2));
    }
    None
}

fn pump_until_disconnect(server: &Server, timeout: Duration) -> Option<usize> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        let _ = server.client_joined();
        if let Some(id) = server.get_disconnect() {
            return Some(id);
        }
        thread::sleep(Duration::from_millis(2));
    }
    None
}

/// Runs `connect` on a worker thread while the caller pumps the server.
fn connect_in_background(
    client: &Arc<Client>,
    tcp: SocketAddr,
    udp: Option<SocketAddr>,
) -> thread::JoinHandle<bool> {
    let client = client.clone();
    thread::spawn(move || client.connect(tcp, udp).is_ok())
}

#[test]
fn test_length_prefix_roundtrip_with_udp_handshake() {
    let runtime = runtime();
    runtime.errors().set_mode(ErrorMode::Throw, true);

    let mut profile = base_profile();
    profile.max_clients = 4;
    profile.udp_mode = Some(UdpMode::CatchAllNoReorder);

    let server = Server::open(&runtime, profile.clone()).unwrap();
    let tcp_addr = server.local_addr_tcp().unwrap();
    let udp_addr = server.local_addr_udp().unwrap();

    let client = Arc::new(Client::open(&runtime, profile).unwrap());
    let connecting = connect_in_background(&client, tcp_addr, Some(udp_addr));

    let joined = pump_until_joined(&server, Duration::from_secs(5)).expect("no client joined");
    assert!(connecting.join().unwrap(), "client connect failed");

    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(client.client_id(), joined);
    assert_eq!(client.max_clients(), 4);
    assert!(client.client_id() >= 1 && client.client_id() <= 4);

    // Client says Hello over TCP.
    client.send_tcp(&[0x48, 0x65, 0x6C, 0x6C, 0x6F], true).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let request = loop {
        if let Some(packet) = server.recv_tcp(joined).unwrap() {
            break packet;
        }
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(2));
    };
    assert_eq!(request.bytes(), b"Hello");
    assert_eq!(request.client_from(), joined);

    // Server replies with world.
    server
        .send_tcp(joined, &[0x77, 0x6F, 0x72, 0x6C, 0x64], true)
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let reply = loop {
        if let Some(packet) = client.recv_tcp() {
            break packet;
        }
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(2));
    };
    assert_eq!(reply.bytes(), b"world");
    assert!(client.recv_tcp().is_none());
}

#[test]
fn test_oversize_frame_without_auto_resize_disconnects() {
    let runtime = runtime();

    let mut server_profile = base_profile();
    server_profile.max_clients = 2;
    server_profile.handshake_enabled = false;
    server_profile.recv_size_tcp = 64;
    server_profile.auto_resize_tcp = false;

    let mut client_profile = base_profile();
    client_profile.handshake_enabled = false;

    let server = Server::open(&runtime, server_profile).unwrap();
    let tcp_addr = server.local_addr_tcp().unwrap();

    let client = Arc::new(Client::open(&runtime, client_profile).unwrap());
    let connecting = connect_in_background(&client, tcp_addr, None);
    let joined = pump_until_joined(&server, Duration::from_secs(5)).expect("no client joined");
    assert!(connecting.join().unwrap());

    // 100-byte payload cannot fit the server's 64-byte receive buffer.
    client.send_tcp(&[7u8; 100], true).unwrap();

    let gone = pump_until_disconnect(&server, Duration::from_secs(5));
    assert_eq!(gone, Some(joined));
    assert_eq!(
        server.client_state(joined).unwrap(),
        ConnectionState::NotConnected
    );
}

#[test]
fn test_udp_handshake_auth_rejection() {
    let runtime = runtime();

    let mut profile = base_profile();
    profile.max_clients = 4;
    profile.udp_mode = Some(UdpMode::PerClient);
    profile.connection_timeout_ms = 60_000;

    let server = Server::open(&runtime, profile).unwrap();
    let tcp_addr = server.local_addr_tcp().unwrap();
    let udp_addr = server.local_addr_udp().unwrap();

    // A TCP-only connection that never sends its UDP leg; the slot sits in
    // Connecting with real auth codes we never see.
    let _victim = std::net::TcpStream::connect(tcp_addr).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let _ = server.client_joined();
        if server.client_state(1).unwrap() == ConnectionState::Connecting {
            break;
        }
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(2));
    }

    // A malicious sender claims client id 1 with made-up codes.
    let attacker = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut forged = Vec::new();
    forged.extend_from_slice(&0u64.to_le_bytes());
    forged.extend_from_slice(&1u64.to_le_bytes());
    for code in &[0xdeadu32, 0xbeef, 0xfeed, 0xface] {
        forged.extend_from_slice(&code.to_le_bytes());
    }
    for _ in 0..5 {
        attacker.send_to(&forged, udp_addr).unwrap();
        thread::sleep(Duration::from_millis(10));
    }

    // No state change, no UDP association.
    let _ = server.client_joined();
    assert_eq!(server.client_state(1).unwrap(), ConnectionState::Connecting);
    assert_eq!(server.client_udp_addr(1).unwrap(), None);
}

#[test]
fn test_handshake_timeout_disconnects_silent_client() {
    let runtime = runtime();

    let mut profile = base_profile();
    profile.max_clients = 2;
    profile.udp_mode = Some(UdpMode::PerClient);
    profile.connection_timeout_ms = 300;

    let server = Server::open(&runtime, profile).unwrap();
    let tcp_addr = server.local_addr_tcp().unwrap();

    // TCP leg only; the UDP leg never comes.
    let _silent = std::net::TcpStream::connect(tcp_addr).unwrap();

    let started = Instant::now();
    let deadline = started + Duration::from_secs(5);
    loop {
        let _ = server.client_joined();
        let state = server.client_state(1).unwrap();
        if state == ConnectionState::NotConnected && started.elapsed() > Duration::from_millis(250)
        {
            break;
        }
        assert!(Instant::now() < deadline, "slot never timed out");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_address_view_routes_and_forgets() {
    let runtime = runtime();
    runtime.errors().set_mode(ErrorMode::Throw, true);

    let mut profile = base_profile();
    profile.max_clients = 10;
    profile.udp_mode = Some(UdpMode::PerClient);

    let server = Server::open(&runtime, profile.clone()).unwrap();
    let tcp_addr = server.local_addr_tcp().unwrap();
    let udp_addr = server.local_addr_udp().unwrap();

    // Ten clients from random ephemeral ports.
    let mut clients = Vec::new();
    for _ in 0..10 {
        let client = Arc::new(Client::open(&runtime, profile.clone()).unwrap());
        let connecting = connect_in_background(&client, tcp_addr, Some(udp_addr));
        let joined =
            pump_until_joined(&server, Duration::from_secs(5)).expect("a client never joined");
        assert!(connecting.join().unwrap());
        assert_eq!(client.client_id(), joined);
        clients.push(client);
    }

    // Data from client 7's validated address routes to slot 7.
    let seven = clients
        .iter()
        .find(|client| client.client_id() == 7)
        .expect("no client got id 7");
    seven.send_udp(0, b"from seven", true).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let packet = loop {
        if let Some(packet) = server.recv_udp(7, 0).unwrap() {
            break packet;
        }
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(2));
    };
    assert_eq!(packet.bytes(), b"from seven");
    assert_eq!(packet.client_from(), 7);

    // Disconnect 7; a datagram from an unknown address routes nowhere.
    server.disconnect(7);
    assert_eq!(server.client_udp_addr(7).unwrap(), None);

    let stranger = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let wire = build_datagram(UdpMode::PerClient, 99, None, None, b"stray");
    stranger.send_to(&wire, udp_addr).unwrap();
    thread::sleep(Duration::from_millis(100));

    for id in 1..=10usize {
        assert_eq!(
            server.recv_udp(id, 0).unwrap().map(|p| p.bytes().to_vec()),
            None,
            "client {} received a stray datagram",
            id
        );
    }
}

#[test]
fn test_graceful_disconnect_delivers_backlog() {
    let runtime = runtime();
    runtime.errors().set_mode(ErrorMode::Throw, true);

    let mut profile = base_profile();
    profile.max_clients = 2;
    profile.udp_mode = None;

    let server = Server::open(&runtime, profile.clone()).unwrap();
    let tcp_addr = server.local_addr_tcp().unwrap();

    let client = Arc::new(Client::open(&runtime, profile).unwrap());
    let connecting = connect_in_background(&client, tcp_addr, None);
    let joined = pump_until_joined(&server, Duration::from_secs(5)).expect("no client joined");
    assert!(connecting.join().unwrap());

    // Five packets, then a half-close from the server side.
    for n in 0u8..5 {
        server.send_tcp(joined, &[n; 32], true).unwrap();
    }
    server.shutdown_send(joined).unwrap();

    // The client drains every packet before the teardown is observable.
    let mut received = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while received.len() < 5 {
        if let Some(packet) = client.recv_tcp() {
            received.push(packet.bytes().to_vec());
        }
        assert!(Instant::now() < deadline, "backlog never arrived");
        thread::sleep(Duration::from_millis(2));
    }
    for (n, payload) in received.iter().enumerate() {
        assert_eq!(payload, &vec![n as u8; 32]);
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if client.connection_status() == TcpStatus::NoRecv {
            break;
        }
        assert!(Instant::now() < deadline, "client never observed NoRecv");
        thread::sleep(Duration::from_millis(2));
    }

    // The client half-closes too; both sides drain to NotConnected.
    client.shutdown_send();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let _ = server.client_joined();
        if client.connection_status() == TcpStatus::NotConnected
            && server.client_state(joined).unwrap() == ConnectionState::NotConnected
        {
            break;
        }
        assert!(Instant::now() < deadline, "teardown never completed");
        thread::sleep(Duration::from_millis(2));
    }

    assert_eq!(server.get_disconnect(), Some(joined));
}

#[test]
fn test_send_memory_cap_disconnects_client() {
    let runtime = runtime();
    runtime.errors().set_mode(ErrorMode::Throw, true);

    let mut profile = base_profile();
    profile.max_clients = 2;
    profile.handshake_enabled = false;
    profile.send_mem_limit_tcp = Some(1024 * 1024);

    let server = Server::open(&runtime, profile).unwrap();
    let tcp_addr = server.local_addr_tcp().unwrap();

    // A receiver that never reads, with a tiny receive buffer, so the
    // kernel stops absorbing data quickly.
    let sink = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .unwrap();
    sink.set_recv_buffer_size(4096).unwrap();
    sink.connect(&tcp_addr.into()).unwrap();

    let joined = pump_until_joined(&server, Duration::from_secs(5)).expect("no client joined");

    // Asynchronous 256 KiB sends; queued tickets accumulate against the
    // 1 MiB cap once the kernel buffers are full.
    let payload = vec![0u8; 256 * 1024];
    let mut refused = None;
    for _ in 0..200 {
        match server.send_tcp(joined, &payload, false) {
            Ok(_) => (),
            Err(err) => {
                refused = Some(err);
                break;
            }
        }
    }

    let refused = refused.expect("the accountant never refused a send");
    assert_eq!(refused.kind(), ErrorKind::MemoryLimitExceeded);

    // The offending client slot is torn down.
    assert_eq!(
        server.client_state(joined).unwrap(),
        ConnectionState::NotConnected
    );
    assert_eq!(pump_until_disconnect(&server, Duration::from_secs(5)), Some(joined));
}

#[test]
fn test_per_client_per_op_udp_roundtrip() {
    let runtime = runtime();
    runtime.errors().set_mode(ErrorMode::Throw, true);

    let mut profile = base_profile();
    profile.max_clients = 2;
    profile.udp_mode = Some(UdpMode::PerClientPerOp);
    profile.num_operations = 3;

    let server = Server::open(&runtime, profile.clone()).unwrap();
    let tcp_addr = server.local_addr_tcp().unwrap();
    let udp_addr = server.local_addr_udp().unwrap();

    let client = Arc::new(Client::open(&runtime, profile).unwrap());
    let connecting = connect_in_background(&client, tcp_addr, Some(udp_addr));
    let joined = pump_until_joined(&server, Duration::from_secs(5)).expect("no client joined");
    assert!(connecting.join().unwrap());
    assert_eq!(client.num_operations(), 3);

    // Client → server on operation 2.
    client.send_udp(2, b"op-two", true).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    let packet = loop {
        if let Some(packet) = server.recv_udp(joined, 2).unwrap() {
            break packet;
        }
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(2));
    };
    assert_eq!(packet.bytes(), b"op-two");
    assert_eq!(packet.operation(), 2);
    assert_eq!(server.recv_udp(joined, 1).unwrap(), None);

    // Server → client on operation 1; the client demuxes by its own id.
    server.send_udp(joined, 1, b"reply", true).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    let packet = loop {
        if let Some(packet) = client.recv_udp(joined, 1).unwrap() {
            break packet;
        }
        assert!(Instant::now() < deadline);
        thread::sleep(Duration::from_millis(2));
    };
    assert_eq!(packet.bytes(), b"reply");
}

#[test]
fn test_server_rejects_when_full() {
    let runtime = runtime();

    let mut profile = base_profile();
    profile.max_clients = 1;
    profile.handshake_enabled = false;

    let server = Server::open(&runtime, profile.clone()).unwrap();
    let tcp_addr = server.local_addr_tcp().unwrap();

    let first = Arc::new(Client::open(&runtime, profile.clone()).unwrap());
    let connecting = connect_in_background(&first, tcp_addr, None);
    pump_until_joined(&server, Duration::from_secs(5)).expect("first client never joined");
    assert!(connecting.join().unwrap());

    // The second connection is accepted at the kernel and dropped by the
    // server; its stream dies shortly after.
    let second = std::net::TcpStream::connect(tcp_addr).unwrap();
    second.set_nonblocking(true).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut buf = [0u8; 16];
    loop {
        let _ = server.client_joined();
        use std::io::Read;
        match (&second).read(&mut buf) {
            Ok(0) => break,
            Ok(_) => (),
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => (),
            Err(_) => break,
        }
        assert!(Instant::now() < deadline, "reject never observed");
        thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(server.client_count(), 1);
}
