//! Handshake tests against real ZeroMQ sockets on loopback.
//!
//! Peers bind ephemeral ports so tests can run in parallel.

use anyhow::Result;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use usrp_sync_toolbox::coordinator::{ServerConfig, SyncServer};
use usrp_sync_toolbox::sync::{Handshake, SyncClient, SyncConfig};

fn bind_ephemeral(ctx: &zmq::Context, kind: zmq::SocketType) -> Result<(zmq::Socket, u16)> {
    let socket = ctx.socket(kind)?;
    socket.set_linger(0)?;
    socket.bind("tcp://127.0.0.1:*")?;
    let endpoint = socket
        .get_last_endpoint()?
        .map_err(|_| anyhow::anyhow!("non UTF-8 endpoint"))?;
    let port = endpoint
        .rsplit(':')
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| anyhow::anyhow!("no port in {}", endpoint))?;
    Ok((socket, port))
}

fn client_config(announce_port: u16, release_port: u16) -> SyncConfig {
    let mut config = SyncConfig::new("127.0.0.1");
    config.announce_port = announce_port;
    config.release_port = release_port;
    config
}

#[test]
fn test_announce_sends_identity_once_and_accepts_any_reply() -> Result<()> {
    let ctx = zmq::Context::new();
    let (rep, announce_port) = bind_ephemeral(&ctx, zmq::REP)?;
    let (_publisher, release_port) = bind_ephemeral(&ctx, zmq::PUB)?;

    let client_thread = thread::spawn(move || -> Result<Vec<u8>> {
        let client = SyncClient::connect(client_config(announce_port, release_port))?;
        client.announce("31DBE03")
    });

    rep.set_rcvtimeo(5000)?;
    let request = rep.recv_bytes(0)?;
    assert_eq!(request, b"31DBE03");
    rep.send("not what a coordinator would say", 0)?;

    let reply = client_thread
        .join()
        .map_err(|_| anyhow::anyhow!("client thread panicked"))??;
    assert_eq!(reply, b"not what a coordinator would say");

    // No second request follows the first
    rep.set_rcvtimeo(300)?;
    assert!(matches!(rep.recv_bytes(0), Err(zmq::Error::EAGAIN)));
    Ok(())
}

#[test]
fn test_announce_without_reply_blocks() -> Result<()> {
    let ctx = zmq::Context::new();
    let (rep, announce_port) = bind_ephemeral(&ctx, zmq::REP)?;
    let (_publisher, release_port) = bind_ephemeral(&ctx, zmq::PUB)?;

    let (done_tx, done_rx) = mpsc::channel();
    thread::spawn(move || {
        let result = SyncClient::connect(client_config(announce_port, release_port))
            .and_then(|client| client.announce("SILENT"));
        let _ = done_tx.send(result.is_ok());
    });

    rep.set_rcvtimeo(5000)?;
    assert_eq!(rep.recv_bytes(0)?, b"SILENT");

    // Coordinator never replies: the client must still be waiting
    assert!(matches!(
        done_rx.recv_timeout(Duration::from_millis(750)),
        Err(mpsc::RecvTimeoutError::Timeout)
    ));
    Ok(())
}

#[test]
fn test_announce_times_out_when_configured() -> Result<()> {
    let ctx = zmq::Context::new();
    let (_rep, announce_port) = bind_ephemeral(&ctx, zmq::REP)?;
    let (_publisher, release_port) = bind_ephemeral(&ctx, zmq::PUB)?;

    let mut config = client_config(announce_port, release_port);
    config.timeout = Some(Duration::from_millis(200));
    let client = SyncClient::connect(config)?;

    let err = client.announce("SLOW").unwrap_err();
    assert!(err.to_string().contains("Timeout"), "{}", err);
    Ok(())
}

/// Publish `payload` until the waiting thread reports back or `limit` passes.
fn publish_until<T>(
    publisher: &zmq::Socket,
    payload: &str,
    done: &mpsc::Receiver<T>,
    limit: Duration,
) -> Option<T> {
    let rounds = (limit.as_millis() / 50).max(1);
    for _ in 0..rounds {
        let _ = publisher.send(payload, 0);
        if let Ok(value) = done.recv_timeout(Duration::from_millis(50)) {
            return Some(value);
        }
    }
    None
}

#[test]
fn test_any_broadcast_releases_by_default() -> Result<()> {
    let ctx = zmq::Context::new();
    let (_rep, announce_port) = bind_ephemeral(&ctx, zmq::REP)?;
    let (publisher, release_port) = bind_ephemeral(&ctx, zmq::PUB)?;

    let (done_tx, done_rx) = mpsc::channel();
    thread::spawn(move || {
        let result = SyncClient::connect(client_config(announce_port, release_port))
            .and_then(|client| client.await_release());
        let _ = done_tx.send(result.map_err(|e| e.to_string()));
    });

    let released = publish_until(&publisher, "banana", &done_rx, Duration::from_secs(5))
        .ok_or_else(|| anyhow::anyhow!("client was never released"))?;
    assert_eq!(released.map_err(|e| anyhow::anyhow!(e))?, b"banana");
    Ok(())
}

#[test]
fn test_expected_token_skips_other_broadcasts() -> Result<()> {
    let ctx = zmq::Context::new();
    let (_rep, announce_port) = bind_ephemeral(&ctx, zmq::REP)?;
    let (publisher, release_port) = bind_ephemeral(&ctx, zmq::PUB)?;

    let mut config = client_config(announce_port, release_port);
    config.expected_token = Some(b"SYNC".to_vec());

    let (done_tx, done_rx) = mpsc::channel();
    thread::spawn(move || {
        let result = SyncClient::connect(config).and_then(|client| client.await_release());
        let _ = done_tx.send(result.map_err(|e| e.to_string()));
    });

    assert!(publish_until(&publisher, "banana", &done_rx, Duration::from_millis(800)).is_none());

    let released = publish_until(&publisher, "SYNC", &done_rx, Duration::from_secs(5))
        .ok_or_else(|| anyhow::anyhow!("client was never released"))?;
    assert_eq!(released.map_err(|e| anyhow::anyhow!(e))?, b"SYNC");
    Ok(())
}

#[test]
fn test_release_wait_times_out_when_configured() -> Result<()> {
    let ctx = zmq::Context::new();
    let (_rep, announce_port) = bind_ephemeral(&ctx, zmq::REP)?;
    let (publisher, release_port) = bind_ephemeral(&ctx, zmq::PUB)?;

    let mut config = client_config(announce_port, release_port);
    config.timeout = Some(Duration::from_millis(400));
    config.expected_token = Some(b"SYNC".to_vec());
    let client = SyncClient::connect(config)?;

    // Only wrong payloads arrive before the deadline
    let feeder = thread::spawn(move || {
        for _ in 0..20 {
            let _ = publisher.send("noise", 0);
            thread::sleep(Duration::from_millis(25));
        }
    });

    let err = client.await_release().unwrap_err();
    assert!(err.to_string().contains("Timeout"), "{}", err);
    let _ = feeder.join();
    Ok(())
}

#[test]
fn test_coordinator_releases_all_participants() -> Result<()> {
    let mut server = SyncServer::bind(ServerConfig {
        bind_ip: "127.0.0.1".to_string(),
        announce_port: 0,
        release_port: 0,
        release_delay: Duration::from_millis(500),
        timeout: Some(Duration::from_secs(10)),
        ..Default::default()
    })?;
    let announce_port = server.announce_port()?;
    let release_port = server.release_port()?;

    let clients: Vec<_> = ["31DBE03", "31DEA71"]
        .into_iter()
        .map(|serial| {
            thread::spawn(move || -> Result<()> {
                let mut config = client_config(announce_port, release_port);
                config.timeout = Some(Duration::from_secs(10));
                config.expected_token = Some(b"SYNC".to_vec());
                let mut client = SyncClient::connect(config)?;
                client.synchronize(serial)
            })
        })
        .collect();

    let participants = server.wait_for_participants(2)?;
    assert_eq!(participants.len(), 2);
    server.release()?;

    for client in clients {
        client
            .join()
            .map_err(|_| anyhow::anyhow!("client thread panicked"))??;
    }

    let mut ids = server.participant_ids();
    ids.sort();
    assert_eq!(ids, vec!["31DBE03".to_string(), "31DEA71".to_string()]);

    let report = server.report();
    assert_eq!(report.participant_count, 2);
    assert!(report.released_at.is_some());
    assert!(report.announce_spread_ms >= 0.0);
    Ok(())
}

#[test]
fn test_coordinator_counts_repeated_identity_once() -> Result<()> {
    let mut server = SyncServer::bind(ServerConfig {
        bind_ip: "127.0.0.1".to_string(),
        announce_port: 0,
        release_port: 0,
        release_delay: Duration::ZERO,
        timeout: Some(Duration::from_millis(1500)),
        ..Default::default()
    })?;
    let announce_port = server.announce_port()?;
    let release_port = server.release_port()?;

    let repeat = thread::spawn(move || -> Result<()> {
        for _ in 0..2 {
            let mut config = client_config(announce_port, release_port);
            config.timeout = Some(Duration::from_secs(5));
            let client = SyncClient::connect(config)?;
            client.announce("SAME")?;
        }
        Ok(())
    });

    // Two announcements from one device never satisfy two participants
    let err = server.wait_for_participants(2).unwrap_err();
    assert!(err.to_string().contains("Timeout"), "{}", err);
    repeat
        .join()
        .map_err(|_| anyhow::anyhow!("client thread panicked"))??;

    assert_eq!(server.participants().len(), 1);
    assert_eq!(server.participants()[0].announcements, 2);
    Ok(())
}
