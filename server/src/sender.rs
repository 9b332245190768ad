//! Snapshot sender: dials back to the client's listener and pushes one
//! compressed view of the world per broadcast tick.

use log::{debug, info, warn};
use shared::{encode_snapshot, RelatedPositions};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::timeout;

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::game::SharedWorld;
use crate::termination::Termination;

/// Everything a session needs to start streaming, registered when the
/// worker is pulled out and consumed when sending starts.
pub struct SendRoutine {
    world: SharedWorld,
    clock: broadcast::Sender<u64>,
    config: SessionConfig,
}

impl SendRoutine {
    pub fn new(world: SharedWorld, clock: broadcast::Sender<u64>, config: SessionConfig) -> Self {
        Self {
            world,
            clock,
            config,
        }
    }

    pub async fn run(
        self,
        user_id: String,
        client_addr: SocketAddr,
        termination: Arc<Termination>,
    ) -> Result<()> {
        let ticks = self.clock.subscribe();

        let stream = tokio::select! {
            biased;

            _ = termination.send_stopped() => return Ok(()),
            dialed = timeout(self.config.dial_timeout, TcpStream::connect(client_addr)) => match dialed {
                Ok(stream) => stream?,
                Err(_) => return Err(Error::DialTimeout(client_addr)),
            },
        };
        stream.set_nodelay(true)?;
        info!("Streaming snapshots for {} to {}", user_id, client_addr);

        self.stream_snapshots(stream, &user_id, ticks, &termination)
            .await
    }

    /// Writes a snapshot on every tick until a stop signal arrives or the
    /// fault budget runs out. The budget counts consecutive failed writes.
    pub(crate) async fn stream_snapshots<W>(
        &self,
        mut writer: W,
        user_id: &str,
        mut ticks: broadcast::Receiver<u64>,
        termination: &Termination,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut remaining = self.config.fault_tolerance;

        loop {
            tokio::select! {
                biased;

                _ = termination.forced() => {
                    info!("Force exit signal received in sender for {}", user_id);
                    return Ok(());
                }
                _ = termination.cancelled() => {
                    info!("Termination signal received in sender for {}", user_id);
                    return Ok(());
                }
                _ = termination.send_stopped() => {
                    info!("Stop send signal received for {}", user_id);
                    return Ok(());
                }
                tick = ticks.recv() => {
                    match tick {
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => debug!("Sender for {} skipped {} ticks", user_id, skipped),
                        Err(RecvError::Closed) => return Ok(()),
                    }

                    let Some(frame) = self.build_frame(user_id)? else {
                        continue;
                    };

                    match write_frame(&mut writer, &frame).await {
                        Ok(()) => remaining = self.config.fault_tolerance,
                        Err(e) => {
                            remaining = remaining.saturating_sub(1);
                            warn!("Snapshot write for {} failed: {} (fault tolerance remain: {})", user_id, e, remaining);
                            if remaining == 0 {
                                self.world.deregister(user_id);
                                return Err(Error::FaultToleranceExhausted(self.config.fault_tolerance));
                            }
                        }
                    }
                }
            }
        }
    }

    /// None until the user has reported a position
    fn build_frame(&self, user_id: &str) -> Result<Option<Vec<u8>>> {
        let Some(status) = self.world.user_status(user_id) else {
            return Ok(None);
        };

        let snapshot = RelatedPositions {
            user_position: status.position,
            related_positions: self
                .world
                .related_positions(status.position, status.item_effect),
            scoreboard: self.world.scoreboard(),
        };
        Ok(Some(encode_snapshot(&snapshot)?))
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorldConfig;
    use crate::game::{GameWorld, World};
    use shared::{Position, SnapshotStream, Status};
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Writer that rejects every write
    struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn world_with(user_id: &str, position: Position) -> Arc<GameWorld> {
        let world = Arc::new(GameWorld::empty(WorldConfig {
            map_size: 10,
            coin_count: 0,
            item_count: 0,
            base_visibility: 2,
        }));
        world.register_score(user_id);
        world.update_user_position(&Status {
            id: user_id.to_string(),
            current_position: position,
        });
        world
    }

    fn routine(world: Arc<GameWorld>, fault_tolerance: u32) -> (SendRoutine, broadcast::Sender<u64>) {
        let (clock, _) = broadcast::channel(16);
        let config = SessionConfig {
            fault_tolerance,
            ..SessionConfig::default()
        };
        (SendRoutine::new(world, clock.clone(), config), clock)
    }

    #[tokio::test]
    async fn test_fault_budget_exhaustion_deregisters_user() {
        let world = world_with("alice", Position::new(3, 3));
        let (routine, clock) = routine(world.clone(), 3);
        let ticks = clock.subscribe();
        let termination = Termination::new();

        for tick in 0..3 {
            clock.send(tick).unwrap();
        }

        let result = routine
            .stream_snapshots(BrokenPipe, "alice", ticks, &termination)
            .await;

        assert!(matches!(result, Err(Error::FaultToleranceExhausted(3))));
        assert!(world.user_status("alice").is_none());
        assert!(!world.scoreboard().contains_key("alice"));
        assert!(world.cell(Position::new(3, 3)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_frame_before_first_status() {
        let world = Arc::new(GameWorld::empty(WorldConfig::default()));
        let (routine, clock) = routine(world, 1);
        let ticks = clock.subscribe();
        let termination = Arc::new(Termination::new());

        clock.send(0).unwrap();
        clock.send(1).unwrap();

        let stopper = {
            let termination = Arc::clone(&termination);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                termination.stop_send();
            })
        };

        let result = routine
            .stream_snapshots(BrokenPipe, "nobody", ticks, &termination)
            .await;
        stopper.await.unwrap();

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_streams_snapshots_to_client_listener() {
        let world = world_with("bob", Position::new(5, 5));
        world.place_coin(Position::new(6, 5));
        let (routine, clock) = routine(world, 10);
        let termination = Arc::new(Termination::new());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let sender = {
            let termination = Arc::clone(&termination);
            tokio::spawn(routine.run("bob".to_string(), addr, termination))
        };

        let (mut socket, _) = listener.accept().await.unwrap();
        let mut snapshots = SnapshotStream::new();
        let mut buf = [0u8; 1024];

        let snapshot = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                clock.send(0).ok();
                tokio::time::sleep(Duration::from_millis(10)).await;
                let n = socket.read(&mut buf).await.unwrap();
                snapshots.push(&buf[..n]);
                if let Some(snapshot) = snapshots.next_snapshot().unwrap() {
                    return snapshot;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(snapshot.user_position, Position::new(5, 5));
        assert_eq!(snapshot.related_positions.len(), 2);
        assert_eq!(snapshot.scoreboard.get("bob"), Some(&0));

        termination.stop_send();
        sender.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_timeout() {
        let world = Arc::new(GameWorld::empty(WorldConfig::default()));
        let (clock, _) = broadcast::channel(4);
        let config = SessionConfig {
            dial_timeout: Duration::from_millis(10),
            ..SessionConfig::default()
        };
        let routine = SendRoutine::new(world, clock, config);

        // Non-routable address, the connect attempt never completes
        let addr: SocketAddr = "10.255.255.1:9".parse().unwrap();
        let result = routine
            .run("carol".to_string(), addr, Arc::new(Termination::new()))
            .await;

        assert!(matches!(
            result,
            Err(Error::DialTimeout(_)) | Err(Error::Io(_))
        ));
    }
}
