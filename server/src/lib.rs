//! # Coin Chase Server Library
//!
//! This library provides the authoritative server for the coin chase game.
//! Players log in over HTTP, are bound to a dedicated worker slot, stream
//! their moves and attacks to that worker over TCP, and receive a
//! compressed view of their surroundings on every broadcast tick.
//!
//! ## Core Responsibilities
//!
//! ### Worker Pool
//! A fixed number of worker slots is created at startup, each with its own
//! listening port. A login pulls a slot out of the pool, binds it to the
//! user and starts the session; a logout or a failed health check puts it
//! back. The pool never grows or shrinks at runtime.
//!
//! ### Session Tasks
//! Every session runs three cooperating tasks:
//! - **Receiver**: accepts the client connection and decodes `$` delimited
//!   frames into inbound events
//! - **Processor**: drains the shared inbound event queue into the world
//! - **Sender**: dials back to the client and pushes one zlib compressed
//!   snapshot per broadcast tick
//!
//! Any task returning ends the whole session through the termination
//! coordinator, and the slot is marked `TERMINATED` until it is reclaimed.
//!
//! ### Health Monitoring
//! A monitor probes the receiver and processor of every in-use slot on a
//! fixed interval and revives slots that fail to answer in time.
//!
//! ## Module Organization
//!
//! ### Worker Modules (`worker`, `worker_pool`, `termination`)
//! Slot state machine, pool bookkeeping and per-session cancellation.
//!
//! ### Session Modules (`receiver`, `processor`, `sender`, `clock`)
//! The three session tasks and the clock that paces the senders.
//!
//! ### Game Module (`game`)
//! The world collaborator consumed by the sessions, plus an in-memory map
//! with coins, items and a scoreboard.
//!
//! ### Outer Surfaces (`http`, `monitor`)
//! Login and logout endpoints and the health check loop.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::{config::ServerConfig, GameServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = GameServer::start(ServerConfig::default()).await?;
//!     println!("Logins accepted on {}", server.http_addr());
//!
//!     server.wait().await?;
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod game;
pub mod http;
pub mod monitor;
pub mod processor;
pub mod receiver;
pub mod sender;
pub mod termination;
pub mod worker;
pub mod worker_pool;

use log::info;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use config::ServerConfig;
use error::{Error, Result};
use game::{GameWorld, SharedWorld};
use processor::EventQueue;
use worker::SessionContext;
use worker_pool::WorkerPool;

/// Ticks buffered per sender before it starts lagging
const CLOCK_CAPACITY: usize = 16;

/// A running server: worker pool, broadcast clock, health monitor and the
/// HTTP endpoints.
pub struct GameServer {
    pool: Arc<WorkerPool>,
    world: Arc<GameWorld>,
    http_addr: SocketAddr,
    shutdown: CancellationToken,
    http: JoinHandle<std::io::Result<()>>,
}

impl GameServer {
    pub async fn start(config: ServerConfig) -> Result<Self> {
        let world = Arc::new(GameWorld::new(config.world));
        Self::start_with_world(config, world).await
    }

    /// Starts every component around a caller-provided world
    pub async fn start_with_world(config: ServerConfig, world: Arc<GameWorld>) -> Result<Self> {
        config.validate()?;
        let shared_world: SharedWorld = world.clone();
        let shutdown = CancellationToken::new();
        let (clock, _) = broadcast::channel(CLOCK_CAPACITY);

        let context = SessionContext {
            world: Arc::clone(&shared_world),
            events: EventQueue::new(config.event_queue_capacity),
            clock: clock.clone(),
            config: config.session,
        };
        let pool = Arc::new(WorkerPool::bind(&config, Some(Arc::new(context))).await?);
        monitor::verify_pool(&pool, config.worker_count)?;

        tokio::spawn(clock::run_broadcast_clock(
            clock,
            config.broadcast_interval,
            shutdown.clone(),
        ));
        tokio::spawn(monitor::health_check_and_revive(
            Arc::clone(&pool),
            config.health_check_interval,
            shutdown.clone(),
        ));

        let listener = TcpListener::bind(config.http_addr).await?;
        let http_addr = listener.local_addr()?;
        let state = http::AppState {
            pool: Arc::clone(&pool),
            world: shared_world,
        };
        let http = tokio::spawn(http::serve(listener, state, shutdown.clone()));
        info!(
            "Server listening on {} with {} workers",
            http_addr,
            pool.capacity()
        );

        Ok(Self {
            pool,
            world,
            http_addr,
            shutdown,
            http,
        })
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn world(&self) -> &Arc<GameWorld> {
        &self.world
    }

    /// Stops the clock, the monitor and the HTTP server
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Waits for the HTTP server to stop
    pub async fn wait(self) -> Result<()> {
        match self.http.await {
            Ok(result) => Ok(result?),
            Err(e) => Err(Error::Io(std::io::Error::other(e))),
        }
    }
}
