use clap::Parser;
use client::network::{BotSettings, Client};
use log::{error, info};
use rand::Rng;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base URL of the server's HTTP endpoints
    #[arg(short = 's', long, default_value = "http://127.0.0.1:8080")]
    server: String,

    /// User id to log in with, random when omitted
    #[arg(short = 'u', long)]
    user: Option<String>,

    /// Number of moves before logging out
    #[arg(short = 'm', long, default_value = "100")]
    moves: usize,

    /// Delay between moves in milliseconds
    #[arg(short = 'i', long, default_value = "100")]
    interval_ms: u64,

    /// Probability of attacking after a move
    #[arg(short = 'a', long, default_value = "0.1")]
    attack_probability: f64,

    /// Map size used to bound the random walk
    #[arg(long, default_value = "100")]
    map_size: i32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let user_id = args
        .user
        .unwrap_or_else(|| format!("bot-{:04}", rand::thread_rng().gen_range(0..10_000)));

    info!("Starting bot {}", user_id);
    info!("Connecting to: {}", args.server);

    let mut client = Client::new(&args.server, &user_id).await?;
    client.login().await?;

    let settings = BotSettings {
        moves: args.moves,
        move_interval: Duration::from_millis(args.interval_ms),
        attack_probability: args.attack_probability,
        map_size: args.map_size,
    };
    let played = client.run(settings).await;

    if let Err(e) = client.disconnect().await {
        error!("Logout failed: {}", e);
    }
    played?;

    Ok(())
}
