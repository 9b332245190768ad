//! Client receiver: accepts the client's connection on the worker's
//! listener and turns its byte stream into inbound events.

use log::{debug, info, warn};
use shared::{FrameDecoder, InboundMessage, BUFFER_SIZE};
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};

use crate::error::{Error, Result};
use crate::termination::Termination;
use crate::worker::Probe;

const KEEPALIVE_TIME: Duration = Duration::from_secs(60);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

pub struct Receiver {
    worker_id: usize,
    listener: Arc<TcpListener>,
    events: mpsc::Sender<InboundMessage>,
    read_deadline: Duration,
    termination: Arc<Termination>,
    probes: mpsc::Receiver<Probe>,
}

impl Receiver {
    pub fn new(
        worker_id: usize,
        listener: Arc<TcpListener>,
        events: mpsc::Sender<InboundMessage>,
        read_deadline: Duration,
        termination: Arc<Termination>,
        probes: mpsc::Receiver<Probe>,
    ) -> Self {
        Self {
            worker_id,
            listener,
            events,
            read_deadline,
            termination,
            probes,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        info!("Client receiver initialized on worker {}", self.worker_id);

        let Some(stream) = self.accept().await? else {
            return Ok(());
        };
        configure(&stream)?;
        self.pump(stream).await
    }

    /// Waits for the client to connect. The read deadline also bounds how
    /// long a pulled out worker waits for its client.
    async fn accept(&mut self) -> Result<Option<TcpStream>> {
        let deadline = sleep(self.read_deadline);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;

                _ = self.termination.forced() => {
                    info!("Force exit signal received in receiver {}", self.worker_id);
                    return Ok(None);
                }
                _ = self.termination.cancelled() => {
                    info!("Termination signal received in receiver {}", self.worker_id);
                    return Ok(None);
                }
                Some(reply) = self.probes.recv() => {
                    let _ = reply.send(());
                }
                _ = &mut deadline => return Err(Error::ReadDeadline(self.read_deadline)),
                accepted = self.listener.accept() => {
                    let (stream, addr) = accepted?;
                    info!("Worker {} accepted client connection from {}", self.worker_id, addr);
                    return Ok(Some(stream));
                }
            }
        }
    }

    /// Reads frames until termination, a protocol violation, a read error
    /// or the read deadline. After the client closes its half of the stream
    /// the receiver stays alive and keeps answering probes.
    pub(crate) async fn pump<R>(&mut self, mut reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut chunk = [0u8; BUFFER_SIZE];
        let mut frames = FrameDecoder::new();
        let mut end_of_stream = false;

        let deadline = sleep(self.read_deadline);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;

                _ = self.termination.forced() => {
                    info!("Force exit signal received in receiver {}", self.worker_id);
                    return Ok(());
                }
                _ = self.termination.cancelled() => {
                    info!("Termination signal received in receiver {}", self.worker_id);
                    return Ok(());
                }
                Some(reply) = self.probes.recv() => {
                    let _ = reply.send(());
                }
                _ = &mut deadline => {
                    warn!("Worker {} read deadline of {:?} exceeded", self.worker_id, self.read_deadline);
                    return Err(Error::ReadDeadline(self.read_deadline));
                }
                read = reader.read(&mut chunk), if !end_of_stream => {
                    let size = read?;
                    if size == 0 {
                        debug!("Client of worker {} closed its stream", self.worker_id);
                        end_of_stream = true;
                        continue;
                    }

                    deadline.as_mut().reset(Instant::now() + self.read_deadline);
                    frames.extend_from_slice(&chunk[..size]);

                    while let Some(frame) = frames.next_frame()? {
                        let event = InboundMessage::decode(&frame)?;
                        // A full queue must not hide a termination
                        tokio::select! {
                            biased;

                            _ = self.termination.cancelled() => return Ok(()),
                            sent = self.events.send(event) => {
                                sent.map_err(|_| Error::EventQueueClosed)?;
                            }
                        }
                    }
                }
            }
        }
    }
}

fn configure(stream: &TcpStream) -> io::Result<()> {
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_TIME)
        .with_interval(KEEPALIVE_INTERVAL);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    stream.set_nodelay(true)
}
