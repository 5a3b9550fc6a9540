//! End-to-end tunnel tests: a SOCKS client talks to the client engine,
//! whose only route to the exit engine is the in-memory social platform.

mod support;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use support::harness::{spawn_echo_server, TunnelHarness};

const DEADLINE: Duration = Duration::from_secs(30);

async fn socks5_connect(addr: SocketAddr, target: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.expect("connect socks");

    stream
        .write_all(&[0x05, 0x01, 0x00])
        .await
        .expect("write greeting");

    let mut reply = [0u8; 2];
    timeout(DEADLINE, stream.read_exact(&mut reply))
        .await
        .expect("greeting reply deadline")
        .expect("greeting reply");
    assert_eq!(reply, [0x05, 0x00]);

    let std::net::IpAddr::V4(ip) = target.ip() else {
        panic!("echo server is v4");
    };

    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&ip.octets());
    request.extend_from_slice(&target.port().to_be_bytes());

    stream.write_all(&request).await.expect("write connect");

    let mut connect_reply = vec![0u8; request.len()];
    timeout(DEADLINE, stream.read_exact(&mut connect_reply))
        .await
        .expect("connect reply deadline")
        .expect("connect reply");
    assert_eq!(connect_reply[0], 0x05);
    assert_eq!(connect_reply[1], 0x00);

    stream
}

async fn echo_roundtrip(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(payload).await.expect("write payload");

    let mut echoed = vec![0u8; payload.len()];
    timeout(DEADLINE, stream.read_exact(&mut echoed))
        .await
        .expect("echo deadline")
        .expect("echo read");

    assert_eq!(echoed, payload);
}

#[tokio::test]
async fn socks5_echo_roundtrip_through_carriers() {
    let harness = TunnelHarness::spawn().await;
    let echo = spawn_echo_server().await;

    let mut stream = socks5_connect(harness.socks_addr(), echo).await;

    echo_roundtrip(&mut stream, b"hello tunnel").await;
    echo_roundtrip(&mut stream, b"second burst").await;

    harness.shutdown().await;
}

#[tokio::test]
async fn socks4a_connect_and_forward() {
    let harness = TunnelHarness::spawn().await;
    let echo = spawn_echo_server().await;

    let mut stream = TcpStream::connect(harness.socks_addr())
        .await
        .expect("connect socks");

    // SOCKS4a: invalid ip 0.0.0.1, empty user id, hostname appended.
    let mut request = vec![0x04, 0x01];
    request.extend_from_slice(&echo.port().to_be_bytes());
    request.extend_from_slice(&[0, 0, 0, 1, 0]);
    request.extend_from_slice(b"127.0.0.1");
    request.push(0);

    stream.write_all(&request).await.expect("write connect");

    let mut reply = [0u8; 8];
    timeout(DEADLINE, stream.read_exact(&mut reply))
        .await
        .expect("connect reply deadline")
        .expect("connect reply");
    assert_eq!(reply[0], 0x00);
    assert_eq!(reply[1], 0x5A);
    assert_eq!(&reply[2..4], &echo.port().to_be_bytes());

    echo_roundtrip(&mut stream, b"over socks4a").await;

    harness.shutdown().await;
}

#[tokio::test]
async fn larger_transfers_arrive_in_order() {
    let harness = TunnelHarness::spawn().await;
    let echo = spawn_echo_server().await;

    let mut stream = socks5_connect(harness.socks_addr(), echo).await;

    // Spans several forward chunks; ordering across fragments must hold.
    let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    echo_roundtrip(&mut stream, &payload).await;

    harness.shutdown().await;
}

#[tokio::test]
async fn peer_eof_closes_the_exit_session() {
    let harness = TunnelHarness::spawn().await;
    let echo = spawn_echo_server().await;

    let mut stream = socks5_connect(harness.socks_addr(), echo).await;
    echo_roundtrip(&mut stream, b"ping").await;

    assert!(harness.server.engine().has_open_sessions());

    drop(stream);

    let deadline = Instant::now() + DEADLINE;

    while harness.server.engine().has_open_sessions() {
        assert!(Instant::now() < deadline, "exit session never closed");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    harness.shutdown().await;
}

#[tokio::test]
async fn loopback_frames_change_nothing() {
    use sideband::codec::{Alphabet, Command, Datagram};

    let harness = TunnelHarness::spawn().await;

    // A CONNECT carrying the client engine's own device id must leave the
    // client's session state untouched, whatever carrier it arrives by.
    let own = Datagram::new(1_000, 99, 1, Command::Connect, vec![0; 4]);
    harness
        .platform
        .inject("message_reply", &own.encode(Alphabet::Wide));

    // A third party's padding frame carries no command for anyone.
    let padding = Datagram::padding(3_000);
    harness
        .platform
        .inject("wall_post_new", &padding.encode(Alphabet::Ascii));

    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(!harness.client.engine().has_open_sessions());

    harness.shutdown().await;
}

#[tokio::test]
async fn idle_sessions_are_reaped() {
    use sideband::runtime::Engine;
    use support::harness::{test_config, MemoryPlatform};

    let platform = MemoryPlatform::new();

    let mut cfg = test_config("");
    cfg.session.timeout_ms = 2_000;
    cfg.socks.read_timeout_ms = 60_000;

    let handle = Engine::with_device(cfg, platform.carrier(), 1_000)
        .expect("engine")
        .start()
        .await
        .expect("start");

    let mut stream = TcpStream::connect(handle.socks_addr)
        .await
        .expect("connect socks");

    stream
        .write_all(&[0x05, 0x01, 0x00])
        .await
        .expect("write greeting");

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.expect("greeting reply");
    assert!(handle.engine().has_open_sessions());

    // No further activity: the reaper must close the session within the
    // timeout plus one reaper interval.
    let deadline = Instant::now() + DEADLINE;

    while handle.engine().has_open_sessions() {
        assert!(Instant::now() < deadline, "idle session never reaped");
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    handle.shutdown();
    let _ = handle.wait().await;
}

#[tokio::test]
async fn clients_without_no_auth_are_rejected() {
    let harness = TunnelHarness::spawn().await;

    let mut stream = TcpStream::connect(harness.socks_addr())
        .await
        .expect("connect socks");

    stream
        .write_all(&[0x05, 0x01, 0x02])
        .await
        .expect("write greeting");

    let mut reply = [0u8; 2];
    timeout(DEADLINE, stream.read_exact(&mut reply))
        .await
        .expect("reject deadline")
        .expect("reject reply");
    assert_eq!(reply, [0x05, 0xFF]);

    // The proxy hangs up after the refusal.
    let mut rest = [0u8; 1];
    let eof = timeout(DEADLINE, stream.read(&mut rest))
        .await
        .expect("eof deadline")
        .expect("eof read");
    assert_eq!(eof, 0);

    harness.shutdown().await;
}
