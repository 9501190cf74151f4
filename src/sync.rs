use anyhow::{Context, Result};
use std::time::{Duration, Instant};

/// Coordinator port answering readiness announcements (REQ/REP).
pub const ANNOUNCE_PORT: u16 = 5555;
/// Coordinator port broadcasting the release (PUB/SUB).
pub const RELEASE_PORT: u16 = 5557;
/// Payload the reference coordinator publishes as release.
pub const DEFAULT_RELEASE_TOKEN: &str = "SYNC";

/// Where the coordinator lives and how long to wait for it
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub server_ip: String,
    pub announce_port: u16,
    pub release_port: u16,
    /// Bound on each blocking wait. `None` blocks forever.
    pub timeout: Option<Duration>,
    /// Only a release carrying exactly this payload unblocks. `None` accepts
    /// any message.
    pub expected_token: Option<Vec<u8>>,
}

impl SyncConfig {
    pub fn new(server_ip: impl Into<String>) -> Self {
        Self {
            server_ip: server_ip.into(),
            announce_port: ANNOUNCE_PORT,
            release_port: RELEASE_PORT,
            timeout: None,
            expected_token: None,
        }
    }

    pub fn announce_endpoint(&self) -> String {
        format!("tcp://{}:{}", self.server_ip, self.announce_port)
    }

    pub fn release_endpoint(&self) -> String {
        format!("tcp://{}:{}", self.server_ip, self.release_port)
    }
}

/// Something that can hold a device back until every unit is ready.
pub trait Handshake {
    /// Announce `identity` as ready, then block until released.
    fn synchronize(&mut self, identity: &str) -> Result<()>;
}

/// Client side of the ready / go handshake.
///
/// Owns its messaging context: both sockets and the context are torn down
/// when the client is dropped. Sockets are created with zero linger so a
/// pending, unanswered announcement never blocks teardown.
pub struct SyncClient {
    config: SyncConfig,
    announce: zmq::Socket,
    release: zmq::Socket,
    _ctx: zmq::Context,
}

impl SyncClient {
    /// Create the context and connect both sockets.
    ///
    /// The subscriber connects here, before anything is announced, so a
    /// release published right after the coordinator replies is not missed
    /// while the subscription is still propagating.
    pub fn connect(config: SyncConfig) -> Result<Self> {
        let ctx = zmq::Context::new();

        let announce = ctx.socket(zmq::REQ).context("zmq REQ socket")?;
        announce.set_linger(0).context("zmq set_linger")?;

        let release = ctx.socket(zmq::SUB).context("zmq SUB socket")?;
        release.set_linger(0).context("zmq set_linger")?;
        release.set_subscribe(b"").context("zmq set_subscribe")?;

        println!("Connecting to server...");
        let announce_endpoint = config.announce_endpoint();
        announce
            .connect(&announce_endpoint)
            .with_context(|| format!("zmq connect to {}", announce_endpoint))?;
        let release_endpoint = config.release_endpoint();
        release
            .connect(&release_endpoint)
            .with_context(|| format!("zmq connect to {}", release_endpoint))?;

        tracing::info!(
            "Sync client connected (announce {}, release {})",
            announce_endpoint,
            release_endpoint
        );

        Ok(Self {
            config,
            announce,
            release,
            _ctx: ctx,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Send `identity` to the coordinator and wait for exactly one reply.
    ///
    /// The reply content is returned but carries no meaning; receiving it is
    /// the acknowledgement.
    pub fn announce(&self, identity: &str) -> Result<Vec<u8>> {
        println!("Sending ID {}...", identity);
        self.announce
            .send(identity.as_bytes(), 0)
            .context("zmq send announcement")?;

        set_recv_timeout(&self.announce, self.config.timeout)?;
        let reply = recv_or_timeout(&self.announce, "announcement reply", self.config.timeout)?;
        println!("Received");
        tracing::info!("Coordinator acknowledged '{}'", identity);
        Ok(reply)
    }

    /// Block until a release message arrives on the broadcast channel and
    /// return its payload.
    ///
    /// Without an expected token the first message of any content releases.
    /// With one, other payloads are logged and skipped.
    pub fn await_release(&self) -> Result<Vec<u8>> {
        let deadline = self.config.timeout.map(|t| Instant::now() + t);

        loop {
            let remaining = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(timeout_error("release broadcast", self.config.timeout));
                    }
                    Some(d - now)
                }
                None => None,
            };
            set_recv_timeout(&self.release, remaining)?;

            let msg = recv_or_timeout(&self.release, "release broadcast", self.config.timeout)?;
            let text = String::from_utf8_lossy(&msg).into_owned();
            println!("Received '{}'", text);

            match &self.config.expected_token {
                Some(expected) if *expected != msg => {
                    tracing::warn!(
                        "Ignoring broadcast '{}' (waiting for '{}')",
                        text,
                        String::from_utf8_lossy(expected)
                    );
                }
                _ => return Ok(msg),
            }
        }
    }
}

impl Handshake for SyncClient {
    fn synchronize(&mut self, identity: &str) -> Result<()> {
        self.announce(identity)?;
        self.await_release()?;
        Ok(())
    }
}

fn set_recv_timeout(socket: &zmq::Socket, timeout: Option<Duration>) -> Result<()> {
    let ms = match timeout {
        Some(t) => t.as_millis().clamp(1, i32::MAX as u128) as i32,
        None => -1,
    };
    socket.set_rcvtimeo(ms).context("zmq set_rcvtimeo")
}

fn recv_or_timeout(socket: &zmq::Socket, what: &str, timeout: Option<Duration>) -> Result<Vec<u8>> {
    match socket.recv_bytes(0) {
        Ok(msg) => Ok(msg),
        Err(zmq::Error::EAGAIN) => Err(timeout_error(what, timeout)),
        Err(e) => Err(anyhow::anyhow!("zmq receive {}: {}", what, e)),
    }
}

fn timeout_error(what: &str, timeout: Option<Duration>) -> anyhow::Error {
    match timeout {
        Some(t) => anyhow::anyhow!("Timeout after {:.1}s waiting for {}", t.as_secs_f64(), what),
        None => anyhow::anyhow!("Timeout waiting for {}", what),
    }
}
