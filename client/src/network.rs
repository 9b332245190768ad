use crate::game::{ClientView, RandomWalk};
use log::{debug, info, warn};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use shared::{Attack, InboundMessage, Position, ProtocolError, SnapshotStream, Status, BUFFER_SIZE};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid server URL: {0}")]
    Url(String),

    #[error("server answered {status}: {body}")]
    Rejected { status: StatusCode, body: String },

    #[error("server returned an invalid worker port: {0}")]
    InvalidPort(String),

    #[error("not logged in")]
    NotConnected,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Summary served by `GET /server-state`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerState {
    pub worker_count: usize,
    pub coin_count: usize,
    pub item_count: usize,
}

/// How the bot plays once logged in
#[derive(Debug, Clone, Copy)]
pub struct BotSettings {
    pub moves: usize,
    pub move_interval: Duration,
    pub attack_probability: f64,
    pub map_size: i32,
}

impl Default for BotSettings {
    fn default() -> Self {
        Self {
            moves: 100,
            move_interval: Duration::from_millis(100),
            attack_probability: 0.1,
            map_size: 100,
        }
    }
}

pub struct Client {
    http: reqwest::Client,
    base_url: Url,
    user_id: String,

    snapshot_listener: TcpListener,
    worker: Option<TcpStream>,
    snapshots: Option<TcpStream>,
    stream: SnapshotStream,

    view: ClientView,
}

impl Client {
    /// Binds the snapshot listener the server dials back to
    pub async fn new(server_url: &str, user_id: &str) -> Result<Self> {
        let base_url = Url::parse(server_url).map_err(|e| ClientError::Url(e.to_string()))?;
        let snapshot_listener =
            TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)).await?;

        Ok(Client {
            http: reqwest::Client::new(),
            base_url,
            user_id: user_id.to_string(),
            snapshot_listener,
            worker: None,
            snapshots: None,
            stream: SnapshotStream::new(),
            view: ClientView::new(),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn view(&self) -> &ClientView {
        &self.view
    }

    pub fn snapshot_port(&self) -> Result<u16> {
        Ok(self.snapshot_listener.local_addr()?.port())
    }

    /// Appends percent-encoded path segments to the server URL
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ClientError::Url(format!("{} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Asks the server for a worker and connects to it. Returns the port.
    pub async fn login(&mut self) -> Result<u16> {
        let client_port = self.snapshot_port()?.to_string();
        let url = self.endpoint(&["get-worker-port", &self.user_id, &client_port])?;
        let response = self.http.get(url).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status != StatusCode::OK {
            return Err(ClientError::Rejected { status, body });
        }
        let port: u16 = body
            .trim()
            .parse()
            .map_err(|_| ClientError::InvalidPort(body.clone()))?;

        let host = self
            .base_url
            .host_str()
            .ok_or_else(|| ClientError::Url("missing host".to_string()))?;
        let worker = TcpStream::connect((host, port)).await?;
        worker.set_nodelay(true)?;
        self.worker = Some(worker);

        info!("{} logged in, worker port {}", self.user_id, port);
        Ok(port)
    }

    /// Returns the worker to the pool and drops both connections
    pub async fn disconnect(&mut self) -> Result<()> {
        let url = self.endpoint(&["disconnect", &self.user_id])?;
        let response = self.http.patch(url).send().await?;
        let status = response.status();

        self.worker = None;
        self.snapshots = None;
        self.stream = SnapshotStream::new();

        if status != StatusCode::OK {
            let body = response.text().await?;
            return Err(ClientError::Rejected { status, body });
        }
        info!("{} disconnected", self.user_id);
        Ok(())
    }

    pub async fn server_state(&self) -> Result<ServerState> {
        let url = self.endpoint(&["server-state"])?;
        Ok(self.http.get(url).send().await?.json().await?)
    }

    pub async fn send_status(&mut self, position: Position) -> Result<()> {
        let message = InboundMessage::Status(Status {
            id: self.user_id.clone(),
            current_position: position,
        });
        self.send(&message).await
    }

    pub async fn send_attack(&mut self, from: Position, target: Position) -> Result<()> {
        let message = InboundMessage::Attack(Attack {
            user_id: self.user_id.clone(),
            user_position: from,
            attack_position: target,
        });
        self.send(&message).await
    }

    /// Writes raw bytes to the worker connection
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        let worker = self.worker.as_mut().ok_or(ClientError::NotConnected)?;
        worker.write_all(bytes).await?;
        Ok(())
    }

    async fn send(&mut self, message: &InboundMessage) -> Result<()> {
        let frame = message.encode()?;
        self.send_raw(&frame).await
    }

    /// Waits up to `wait` for the next snapshot and applies it to the view.
    /// Returns false when none arrived in time. The server's dial-back
    /// connection is accepted on first use.
    pub async fn next_snapshot(&mut self, wait: Duration) -> Result<bool> {
        let deadline = Instant::now() + wait;

        if self.snapshots.is_none() {
            match timeout(wait, self.snapshot_listener.accept()).await {
                Ok(accepted) => {
                    let (socket, addr) = accepted?;
                    debug!("Snapshot connection from {}", addr);
                    self.snapshots = Some(socket);
                }
                Err(_) => return Ok(false),
            }
        }

        let mut buf = [0u8; BUFFER_SIZE];
        loop {
            if let Some(snapshot) = self.stream.next_snapshot()? {
                self.view.apply(snapshot);
                return Ok(true);
            }

            let socket = self.snapshots.as_mut().ok_or(ClientError::NotConnected)?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, socket.read(&mut buf)).await {
                Ok(Ok(0)) => {
                    self.snapshots = None;
                    return Err(ClientError::Io(io::ErrorKind::UnexpectedEof.into()));
                }
                Ok(Ok(n)) => self.stream.push(&buf[..n]),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Ok(false),
            }
        }
    }

    /// Plays a random walk: one status per move, an occasional attack, and
    /// a short wait for the next snapshot in between
    pub async fn run(&mut self, settings: BotSettings) -> Result<()> {
        let mut walk = RandomWalk::new(Position::new(0, 0), settings.map_size);
        let mut ticker = interval(settings.move_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        for _ in 0..settings.moves {
            ticker.tick().await;

            let position = walk.next_position();
            self.send_status(position).await?;

            if walk.should_attack(settings.attack_probability) {
                let target = self
                    .view
                    .adjacent_opponents(&self.user_id)
                    .first()
                    .copied()
                    .unwrap_or_else(|| walk.attack_target());
                self.send_attack(position, target).await?;
            }

            match self.next_snapshot(settings.move_interval).await {
                Ok(true) => debug!(
                    "{} at {:?} sees {} cells",
                    self.user_id,
                    self.view.position,
                    self.view.cells.len()
                ),
                Ok(false) => debug!("No snapshot for {} this tick", self.user_id),
                Err(e) => warn!("Snapshot stream for {} failed: {}", self.user_id, e),
            }
        }

        info!(
            "{} finished {} moves with score {:?}",
            self.user_id,
            settings.moves,
            self.view.score(&self.user_id)
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_endpoint_escapes_user_id() {
        let client = Client::new("http://127.0.0.1:8080", "a/b?c#d").await.unwrap();

        let url = client.endpoint(&["disconnect", client.user_id()]).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:8080/disconnect/a%2Fb%3Fc%23d");
    }

    #[tokio::test]
    async fn test_endpoint_keeps_base_path() {
        let client = Client::new("http://127.0.0.1:8080/game/", "alice").await.unwrap();

        let url = client.endpoint(&["server-state"]).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:8080/game/server-state");
    }
}
