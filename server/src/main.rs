use clap::Parser;
use log::{error, info};
use server::config::{ServerConfig, SessionConfig, WorldConfig};
use server::GameServer;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Interface to bind the HTTP server and the workers to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: IpAddr,
    /// HTTP port for logins and logouts
    #[clap(short, long, default_value = "8080")]
    port: u16,
    /// Number of worker slots
    #[clap(short, long, default_value = "10")]
    workers: usize,
    /// First worker port, 0 lets the OS choose
    #[clap(long, default_value = "0")]
    worker_base_port: u16,
    /// Snapshot broadcast interval in milliseconds
    #[clap(long, default_value = "100", value_parser = clap::value_parser!(u64).range(1..))]
    broadcast_ms: u64,
    /// Health check interval in seconds
    #[clap(long, default_value = "10", value_parser = clap::value_parser!(u64).range(1..))]
    health_check_secs: u64,
    /// Idle read timeout in seconds
    #[clap(long, default_value = "300")]
    read_deadline_secs: u64,
    /// Failed snapshot writes tolerated per session
    #[clap(long, default_value = "100")]
    fault_tolerance: u32,
    /// Width and height of the map
    #[clap(long, default_value = "100")]
    map_size: i32,
    #[clap(long, default_value = "30")]
    coins: usize,
    #[clap(long, default_value = "10")]
    items: usize,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        let defaults = ServerConfig::default();
        ServerConfig {
            http_addr: SocketAddr::new(self.host, self.port),
            worker_host: self.host,
            worker_count: self.workers,
            worker_base_port: self.worker_base_port,
            broadcast_interval: Duration::from_millis(self.broadcast_ms),
            health_check_interval: Duration::from_secs(self.health_check_secs),
            session: SessionConfig {
                read_deadline: Duration::from_secs(self.read_deadline_secs),
                fault_tolerance: self.fault_tolerance,
                ..SessionConfig::default()
            },
            world: WorldConfig {
                map_size: self.map_size,
                coin_count: self.coins,
                item_count: self.items,
                ..WorldConfig::default()
            },
            ..defaults
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config();
    let server = GameServer::start(config).await?;

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
            Err(e) => error!("Unable to listen for Ctrl+C: {}", e),
        }
        shutdown.cancel();
    });

    server.wait().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_intervals_rejected() {
        assert!(Args::try_parse_from(["coin-chase-server", "--broadcast-ms", "0"]).is_err());
        assert!(Args::try_parse_from(["coin-chase-server", "--health-check-secs", "0"]).is_err());

        let args = Args::try_parse_from(["coin-chase-server", "--broadcast-ms", "5"]).unwrap();
        assert_eq!(args.into_config().broadcast_interval, Duration::from_millis(5));
    }
}
