//! Probes against the loopback interface. Raw sockets need root or
//! `CAP_NET_RAW`; without it every test here returns early.

use raw_ping::ping::{icmp, tcp};
use raw_ping::{Config, PingError};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::time::{Duration, Instant};

fn config(timeout_ms: u64) -> Config {
    Config {
        timeout_ms,
        ..Config::default()
    }
}

fn icmp_pinger(conf: &Config) -> Option<icmp::Pinger> {
    match icmp::Pinger::new(conf) {
        Ok(pinger) => Some(pinger),
        Err(PingError::Socket(e)) => {
            eprintln!("skipping, cannot open raw socket: {}", e);
            None
        }
        Err(e) => panic!("unexpected error: {}", e),
    }
}

fn tcp_pinger(conf: &Config) -> Option<tcp::Pinger> {
    match tcp::Pinger::new(conf) {
        Ok(pinger) => Some(pinger),
        Err(PingError::Socket(e)) => {
            eprintln!("skipping, cannot open raw socket: {}", e);
            None
        }
        Err(e) => panic!("unexpected error: {}", e),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn localhost_answers_quickly() {
    let pinger = match icmp_pinger(&config(3000)) {
        Some(pinger) => pinger,
        None => return,
    };
    let rtt = pinger.ping(Ipv4Addr::LOCALHOST).await.unwrap();
    assert!(rtt < Duration::from_millis(50), "rtt={:?}", rtt);
    pinger.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_probes_to_one_host() {
    let pinger = match icmp_pinger(&config(3000)) {
        Some(pinger) => pinger,
        None => return,
    };
    let probes = (0..20).map(|_| {
        let pinger = pinger.clone();
        tokio::spawn(async move { pinger.ping(Ipv4Addr::LOCALHOST).await })
    });
    for res in futures::future::join_all(probes).await {
        res.unwrap().unwrap();
    }
    pinger.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn two_pingers_share_the_host() {
    let a = match icmp_pinger(&Config {
        identifier_seed: Some(1),
        ..config(3000)
    }) {
        Some(pinger) => pinger,
        None => return,
    };
    let b = match icmp_pinger(&Config {
        identifier_seed: Some(2),
        ..config(3000)
    }) {
        Some(pinger) => pinger,
        None => return,
    };
    assert_ne!(a.identifier(), b.identifier());
    let (ra, rb) = tokio::join!(a.ping(Ipv4Addr::LOCALHOST), b.ping(Ipv4Addr::LOCALHOST));
    ra.unwrap();
    rb.unwrap();
    a.close().await;
    b.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unanswered_probe_times_out() {
    let pinger = match icmp_pinger(&config(300)) {
        Some(pinger) => pinger,
        None => return,
    };
    // TEST-NET-1 is never routed.
    let start = Instant::now();
    match pinger.ping(Ipv4Addr::new(192, 0, 2, 1)).await {
        Err(PingError::Timeout) => {
            let elapsed = start.elapsed();
            assert!(elapsed >= Duration::from_millis(300));
            assert!(elapsed < Duration::from_millis(800), "elapsed={:?}", elapsed);
        }
        // Hosts without a default route refuse to send at all.
        Err(PingError::Transport(_)) | Err(PingError::DestinationUnreachable(_)) => {}
        other => panic!("unexpected result: {:?}", other),
    }
    pinger.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn close_is_idempotent_and_final() {
    let pinger = match icmp_pinger(&config(1000)) {
        Some(pinger) => pinger,
        None => return,
    };
    pinger.close().await;
    pinger.close().await;
    assert!(pinger.is_closed());
    assert!(matches!(
        pinger.ping(Ipv4Addr::LOCALHOST).await,
        Err(PingError::Closed)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn tcp_open_and_closed_ports() {
    let pinger = match tcp_pinger(&Config {
        source_addr: Some(Ipv4Addr::LOCALHOST),
        ..config(2000)
    }) {
        Some(pinger) => pinger,
        None => return,
    };
    let open = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let open_port = open.local_addr().unwrap().port();
    let rtt = pinger
        .ping(SocketAddrV4::new(Ipv4Addr::LOCALHOST, open_port))
        .await
        .unwrap();
    assert!(rtt < Duration::from_secs(2));

    // Take a port from the kernel, then release it so nothing listens there.
    let closed_port = {
        let l = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        l.local_addr().unwrap().port()
    };
    assert!(matches!(
        pinger
            .ping(SocketAddrV4::new(Ipv4Addr::LOCALHOST, closed_port))
            .await,
        Err(PingError::PortClosed)
    ));
    pinger.close().await;
}

/// Sends `bytes` as the whole payload of one raw IPv4 datagram to localhost.
fn send_raw(protocol: Protocol, bytes: &[u8]) {
    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(protocol)).unwrap();
    let dst = SockAddr::from(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
    socket.send_to(bytes, &dst).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn tcp_pinger_survives_truncated_segment() {
    let pinger = match tcp_pinger(&Config {
        source_addr: Some(Ipv4Addr::LOCALHOST),
        ..config(1000)
    }) {
        Some(pinger) => pinger,
        None => return,
    };
    let open = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let dst = SocketAddrV4::new(Ipv4Addr::LOCALHOST, open.local_addr().unwrap().port());
    pinger.ping(dst).await.unwrap();

    // Half a TCP header.
    send_raw(Protocol::TCP, &[0u8; 10]);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!pinger.is_closed());
    pinger.ping(dst).await.unwrap();
    pinger.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn icmp_pinger_survives_truncated_message() {
    let pinger = match icmp_pinger(&config(1000)) {
        Some(pinger) => pinger,
        None => return,
    };
    pinger.ping(Ipv4Addr::LOCALHOST).await.unwrap();

    send_raw(Protocol::ICMPV4, &[8, 0]);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!pinger.is_closed());
    pinger.ping(Ipv4Addr::LOCALHOST).await.unwrap();
    pinger.close().await;
}
