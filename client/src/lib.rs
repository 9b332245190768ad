//! # Coin Chase Client Library
//!
//! A headless client for the coin chase server, used as a load testing bot
//! and by the integration tests.
//!
//! ## Session Flow
//!
//! 1. The client binds a snapshot listener on an OS-assigned port.
//! 2. It logs in with `GET /get-worker-port/{user_id}/{snapshot_port}` and
//!    connects to the worker port the server answers with.
//! 3. Moves and attacks are written to the worker connection as `$`
//!    delimited frames.
//! 4. The server dials back to the snapshot listener and streams one zlib
//!    compressed snapshot per broadcast tick; the client inflates them
//!    incrementally and keeps the latest one as its view of the world.
//! 5. `PATCH /disconnect/{user_id}` hands the worker back.
//!
//! ## Module Organization
//!
//! ### Game Module (`game`)
//! The client's view of the world and the random walk the bot plays.
//!
//! ### Network Module (`network`)
//! HTTP login and logout, the worker connection and the snapshot stream.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::{BotSettings, Client};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = Client::new("http://127.0.0.1:8080", "alice").await?;
//!     client.login().await?;
//!     client.run(BotSettings::default()).await?;
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod game;
pub mod network;
