use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};

use crate::sync::{ANNOUNCE_PORT, DEFAULT_RELEASE_TOKEN, RELEASE_PORT};

/// Reply sent to every announcement.
pub const ANNOUNCE_REPLY: &str = "READY";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_ip: String,
    /// 0 binds an ephemeral port
    pub announce_port: u16,
    /// 0 binds an ephemeral port
    pub release_port: u16,
    pub release_token: String,
    /// Pause between the last reply and the broadcast
    pub release_delay: Duration,
    /// Bound on the wait for participants. `None` waits forever.
    pub timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: "*".to_string(),
            announce_port: ANNOUNCE_PORT,
            release_port: RELEASE_PORT,
            release_token: DEFAULT_RELEASE_TOKEN.to_string(),
            release_delay: Duration::from_secs(1),
            timeout: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ParticipantInfo {
    pub id: String,
    pub announced_at: DateTime<Utc>,
    pub announcements: u32,
}

/// Reference coordinator: collects readiness announcements and broadcasts a
/// single release once everyone expected has checked in.
pub struct SyncServer {
    config: ServerConfig,
    replies: zmq::Socket,
    publisher: zmq::Socket,
    participants: Vec<ParticipantInfo>,
    released_at: Option<DateTime<Utc>>,
    _ctx: zmq::Context,
}

impl SyncServer {
    pub fn bind(config: ServerConfig) -> Result<Self> {
        let ctx = zmq::Context::new();

        let replies = ctx.socket(zmq::REP).context("zmq REP socket")?;
        replies.set_linger(0).context("zmq set_linger")?;
        let endpoint = bind_endpoint(&config.bind_ip, config.announce_port);
        replies
            .bind(&endpoint)
            .with_context(|| format!("zmq bind {}", endpoint))?;

        let publisher = ctx.socket(zmq::PUB).context("zmq PUB socket")?;
        publisher.set_linger(1000).context("zmq set_linger")?;
        let endpoint = bind_endpoint(&config.bind_ip, config.release_port);
        publisher
            .bind(&endpoint)
            .with_context(|| format!("zmq bind {}", endpoint))?;

        let server = Self {
            config,
            replies,
            publisher,
            participants: Vec::new(),
            released_at: None,
            _ctx: ctx,
        };
        tracing::info!(
            "Coordinator listening (announce port {}, release port {})",
            server.announce_port()?,
            server.release_port()?
        );
        Ok(server)
    }

    /// Port the announce socket is bound to
    pub fn announce_port(&self) -> Result<u16> {
        bound_port(&self.replies)
    }

    /// Port the release socket is bound to
    pub fn release_port(&self) -> Result<u16> {
        bound_port(&self.publisher)
    }

    /// Answer announcements until `expected` distinct identities are present.
    pub fn wait_for_participants(&mut self, expected: usize) -> Result<&[ParticipantInfo]> {
        println!("Waiting for {} participant(s)...", expected);
        let start = Instant::now();

        while self.participants.len() < expected {
            let remaining = match self.config.timeout {
                Some(limit) => {
                    let elapsed = start.elapsed();
                    if elapsed >= limit {
                        return Err(anyhow::anyhow!(
                            "Timeout waiting for participants. Present: {:?}",
                            self.participant_ids()
                        ));
                    }
                    (limit - elapsed).as_millis().clamp(1, i32::MAX as u128) as i32
                }
                None => -1,
            };
            self.replies.set_rcvtimeo(remaining).context("zmq set_rcvtimeo")?;

            let msg = match self.replies.recv_bytes(0) {
                Ok(msg) => msg,
                Err(zmq::Error::EAGAIN) => continue,
                Err(e) => return Err(anyhow::anyhow!("zmq receive announcement: {}", e)),
            };
            self.replies
                .send(ANNOUNCE_REPLY, 0)
                .context("zmq send announcement reply")?;

            let id = String::from_utf8_lossy(&msg).into_owned();
            self.record(id);
        }

        println!("All participants ready: {:?}", self.participant_ids());
        Ok(&self.participants)
    }

    fn record(&mut self, id: String) {
        let now = Utc::now();
        match self.participants.iter_mut().find(|p| p.id == id) {
            Some(existing) => {
                tracing::warn!("Participant '{}' announced again", id);
                existing.announced_at = now;
                existing.announcements += 1;
            }
            None => {
                println!("Participant '{}' ready", id);
                self.participants.push(ParticipantInfo {
                    id,
                    announced_at: now,
                    announcements: 1,
                });
            }
        }
    }

    /// Wait the release delay, then broadcast the release token once.
    pub fn release(&mut self) -> Result<()> {
        if !self.config.release_delay.is_zero() {
            std::thread::sleep(self.config.release_delay);
        }
        self.publisher
            .send(self.config.release_token.as_bytes(), 0)
            .context("zmq publish release")?;
        self.released_at = Some(Utc::now());
        println!("Release '{}' broadcast", self.config.release_token);
        Ok(())
    }

    pub fn participants(&self) -> &[ParticipantInfo] {
        &self.participants
    }

    pub fn participant_ids(&self) -> Vec<String> {
        self.participants.iter().map(|p| p.id.clone()).collect()
    }

    pub fn report(&self) -> SyncReport {
        let mut report = SyncReport {
            participant_count: self.participants.len(),
            participants: self.participants.clone(),
            released_at: self.released_at,
            ..Default::default()
        };

        let first = self.participants.iter().map(|p| p.announced_at).min();
        let last = self.participants.iter().map(|p| p.announced_at).max();
        if let (Some(first), Some(last)) = (first, last) {
            let spread_us = (last - first).num_microseconds().unwrap_or(0);
            report.announce_spread_ms = spread_us as f64 / 1000.0;
            report.first_announce = Some(first);
            report.last_announce = Some(last);
        }
        report
    }
}

fn bind_endpoint(ip: &str, port: u16) -> String {
    if port == 0 {
        format!("tcp://{}:*", ip)
    } else {
        format!("tcp://{}:{}", ip, port)
    }
}

fn bound_port(socket: &zmq::Socket) -> Result<u16> {
    let endpoint = socket
        .get_last_endpoint()
        .context("zmq get_last_endpoint")?
        .map_err(|raw| anyhow::anyhow!("endpoint is not UTF-8: {:?}", raw))?;
    endpoint
        .rsplit(':')
        .next()
        .and_then(|p| p.parse::<u16>().ok())
        .ok_or_else(|| anyhow::anyhow!("cannot read port from endpoint '{}'", endpoint))
}

#[derive(Debug, Default, Serialize)]
pub struct SyncReport {
    pub participant_count: usize,
    pub announce_spread_ms: f64,
    pub first_announce: Option<DateTime<Utc>>,
    pub last_announce: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub participants: Vec<ParticipantInfo>,
}

impl SyncReport {
    pub fn print_report(&self) {
        println!("SYNCHRONIZATION REPORT");
        println!("======================");
        println!("Participants:\t\t{}", self.participant_count);
        for p in &self.participants {
            println!("\t{}\t{}", p.id, p.announced_at.to_rfc3339());
        }
        println!("Announce spread:\t{:.3} ms", self.announce_spread_ms);
        if let Some(released) = self.released_at {
            println!("Released at:\t\t{}", released.to_rfc3339());
        }
    }
}
