//! Runtime configuration for the server.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::error::{Error, Result};

/// Idle time after which a silent client connection is dropped
pub const READ_DEADLINE: Duration = Duration::from_secs(300);
/// Upper bound for dialing back to a client's snapshot listener
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(300);
/// Failed snapshot writes tolerated before a session is torn down
pub const FAULT_TOLERANCE: u32 = 100;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address of the HTTP login endpoint
    pub http_addr: SocketAddr,
    /// Interface the worker listeners bind to
    pub worker_host: IpAddr,
    pub worker_count: usize,
    /// First worker port; 0 lets the OS pick a port for every worker
    pub worker_base_port: u16,
    pub broadcast_interval: Duration,
    pub health_check_interval: Duration,
    pub session: SessionConfig,
    pub event_queue_capacity: usize,
    pub world: WorldConfig,
}

/// Settings every session task needs
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub read_deadline: Duration,
    pub dial_timeout: Duration,
    pub fault_tolerance: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct WorldConfig {
    pub map_size: i32,
    pub coin_count: usize,
    pub item_count: usize,
    /// Visibility radius before item effects are added
    pub base_visibility: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            worker_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            worker_count: 10,
            worker_base_port: 0,
            broadcast_interval: Duration::from_millis(100),
            health_check_interval: Duration::from_secs(10),
            session: SessionConfig::default(),
            event_queue_capacity: 1024,
            world: WorldConfig::default(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_deadline: READ_DEADLINE,
            dial_timeout: DIAL_TIMEOUT,
            fault_tolerance: FAULT_TOLERANCE,
        }
    }
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            map_size: 100,
            coin_count: 30,
            item_count: 10,
            base_visibility: 5,
        }
    }
}

impl ServerConfig {
    /// Listen address for the worker with the given index
    pub fn worker_addr(&self, index: usize) -> Result<SocketAddr> {
        let port = if self.worker_base_port == 0 {
            0
        } else {
            u16::try_from(index)
                .ok()
                .and_then(|offset| self.worker_base_port.checked_add(offset))
                .ok_or_else(|| {
                    Error::InvalidConfig(format!(
                        "worker port {} + {} exceeds {}",
                        self.worker_base_port,
                        index,
                        u16::MAX
                    ))
                })?
        };
        Ok(SocketAddr::new(self.worker_host, port))
    }

    /// Rejects settings the server cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.broadcast_interval.is_zero() {
            return Err(Error::InvalidConfig("broadcast interval must be positive".into()));
        }
        if self.health_check_interval.is_zero() {
            return Err(Error::InvalidConfig("health check interval must be positive".into()));
        }
        if self.worker_count > 0 {
            self.worker_addr(self.worker_count - 1)?;
        }
        Ok(())
    }
}
