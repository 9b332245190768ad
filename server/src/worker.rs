//! Worker slots and their session lifecycle.
//!
//! A worker owns one listening socket for the lifetime of the process and
//! hosts at most one client session at a time. Its status moves through
//!
//! ```text
//! AVAILABLE -> PULLED_OUT -> CLIENT_INFORMATION_RECEIVED -> WORKING -> TERMINATED
//!     ^                                                                    |
//!     +---------------------------- put / revive --------------------------+
//! ```
//!
//! Pulling a worker out arms a session: a fresh [`Termination`], the
//! receiver and its paired processor, and a registered [`SendRoutine`] that
//! is started once the client's address is known. Every session carries a
//! generation number so tasks of a recycled session cannot touch the slot's
//! next occupant.

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::game::SharedWorld;
use crate::processor::{EventQueue, Processor};
use crate::receiver::Receiver;
use crate::sender::SendRoutine;
use crate::termination::Termination;

/// Reply channel of a liveness probe
pub type Probe = oneshot::Sender<()>;

/// User id to worker id, shared by every worker of a pool
pub(crate) type OwnerIndex = Mutex<HashMap<String, usize>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerStatus {
    Available,
    PulledOut,
    ClientInformationReceived,
    Working,
    Terminated,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerStatus::Available => "AVAILABLE",
            WorkerStatus::PulledOut => "PULLED_OUT",
            WorkerStatus::ClientInformationReceived => "CLIENT_INFORMATION_RECEIVED",
            WorkerStatus::Working => "WORKING",
            WorkerStatus::Terminated => "TERMINATED",
        };
        f.write_str(name)
    }
}

/// Collaborators shared by every session of a pool
pub struct SessionContext {
    pub world: SharedWorld,
    pub events: EventQueue,
    pub clock: broadcast::Sender<u64>,
    pub config: SessionConfig,
}

struct Session {
    generation: u64,
    termination: Arc<Termination>,
    receiver_probe: mpsc::Sender<Probe>,
    processor_probe: mpsc::Sender<Probe>,
    send_routine: Option<SendRoutine>,
}

struct WorkerState {
    status: WorkerStatus,
    owner_user_id: Option<String>,
    client_addr: Option<SocketAddr>,
    generation: u64,
    session: Option<Session>,
}

impl WorkerState {
    fn force_exit(&self) {
        if let Some(session) = &self.session {
            session.termination.force_exit();
        }
    }
}

pub struct Worker {
    id: usize,
    port: u16,
    listener: Arc<TcpListener>,
    owners: Arc<OwnerIndex>,
    state: RwLock<WorkerState>,
}

impl Worker {
    pub(crate) fn new(id: usize, listener: TcpListener, owners: Arc<OwnerIndex>) -> io::Result<Self> {
        let port = listener.local_addr()?.port();
        Ok(Self {
            id,
            port,
            listener: Arc::new(listener),
            owners,
            state: RwLock::new(WorkerState {
                status: WorkerStatus::Available,
                owner_user_id: None,
                client_addr: None,
                generation: 0,
                session: None,
            }),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Port clients connect to for this worker
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn status(&self) -> WorkerStatus {
        read(&self.state).status
    }

    pub fn owner_user_id(&self) -> Option<String> {
        read(&self.state).owner_user_id.clone()
    }

    pub fn client_addr(&self) -> Option<SocketAddr> {
        read(&self.state).client_addr
    }

    pub fn generation(&self) -> u64 {
        read(&self.state).generation
    }

    /// AVAILABLE -> PULLED_OUT, arming a session when a context is given
    pub(crate) fn pull_out(self: &Arc<Self>, context: Option<&SessionContext>) -> Result<()> {
        let mut state = write(&self.state);
        if state.status != WorkerStatus::Available {
            return Err(Error::InvalidState {
                expected: WorkerStatus::Available,
                found: state.status,
            });
        }

        state.status = WorkerStatus::PulledOut;
        if let Some(context) = context {
            state.session = Some(self.arm(state.generation, context));
        }
        debug!("Worker {} pulled out (generation {})", self.id, state.generation);
        Ok(())
    }

    fn arm(self: &Arc<Self>, generation: u64, context: &SessionContext) -> Session {
        let termination = Arc::new(Termination::new());
        let (receiver_probe, receiver_probes) = mpsc::channel(1);
        let (processor_probe, processor_probes) = mpsc::channel(1);

        let receiver = Receiver::new(
            self.id,
            Arc::clone(&self.listener),
            context.events.sender(),
            context.config.read_deadline,
            Arc::clone(&termination),
            receiver_probes,
        );
        self.supervise("receiver", generation, &termination, true, receiver.run());

        let processor = Processor::new(
            self.id,
            context.events.clone(),
            Arc::clone(&context.world),
            Arc::clone(&termination),
            processor_probes,
        );
        self.supervise("processor", generation, &termination, false, processor.run());

        Session {
            generation,
            termination,
            receiver_probe,
            processor_probe,
            send_routine: Some(SendRoutine::new(
                Arc::clone(&context.world),
                context.clock.clone(),
                context.config,
            )),
        }
    }

    /// Runs a session task; whatever way it ends, the session is fired and
    /// the slot is marked TERMINATED if it still belongs to that session.
    fn supervise<F>(
        self: &Arc<Self>,
        task: &'static str,
        generation: u64,
        termination: &Arc<Termination>,
        forward: bool,
        future: F,
    ) where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let worker = Arc::clone(self);
        let guard = termination.guard(forward);

        tokio::spawn(async move {
            let _guard = guard;
            match future.await {
                Ok(()) => debug!("Worker {} {} finished", worker.id, task),
                Err(e) => error!("Worker {} {} failed: {}", worker.id, task, e),
            }
            worker.mark_terminated(generation);
        });
    }

    /// PULLED_OUT -> CLIENT_INFORMATION_RECEIVED.
    ///
    /// Called in any other status this is an invariant violation: the
    /// session is force exited and an error returned.
    pub fn set_client_information(&self, user_id: &str, client_ip: IpAddr, client_port: u16) -> Result<()> {
        let mut state = write(&self.state);
        if state.status != WorkerStatus::PulledOut {
            let found = state.status;
            state.force_exit();
            warn!("Worker {} received client information while {}", self.id, found);
            return Err(Error::InvalidState {
                expected: WorkerStatus::PulledOut,
                found,
            });
        }

        if user_id.is_empty() {
            return Err(Error::InvalidClientInformation("empty user id"));
        }
        if client_port == 0 {
            return Err(Error::InvalidClientInformation("client port 0"));
        }

        {
            let mut owners = lock(&self.owners);
            match owners.get(user_id) {
                Some(&other) if other != self.id => {
                    return Err(Error::UserAlreadyBound(user_id.to_string()))
                }
                _ => {
                    owners.insert(user_id.to_string(), self.id);
                }
            }
        }

        state.owner_user_id = Some(user_id.to_string());
        state.client_addr = Some(SocketAddr::new(client_ip, client_port));
        state.status = WorkerStatus::ClientInformationReceived;
        info!("Worker {} bound to user {} at {}:{}", self.id, user_id, client_ip, client_port);
        Ok(())
    }

    /// CLIENT_INFORMATION_RECEIVED -> WORKING, spawning the registered
    /// send routine
    pub fn start_send_user_related_data_to_client(self: &Arc<Self>) -> Result<()> {
        let mut state = write(&self.state);
        let found = state.status;
        if found != WorkerStatus::ClientInformationReceived {
            state.force_exit();
            warn!("Worker {} asked to start sending while {}", self.id, found);
            return Err(Error::InvalidState {
                expected: WorkerStatus::ClientInformationReceived,
                found,
            });
        }

        let (Some(user_id), Some(client_addr)) = (state.owner_user_id.clone(), state.client_addr) else {
            state.force_exit();
            return Err(Error::InvalidState {
                expected: WorkerStatus::ClientInformationReceived,
                found,
            });
        };

        let Some(session) = state.session.as_mut() else {
            return Err(Error::SendRoutineMissing);
        };
        let Some(routine) = session.send_routine.take() else {
            session.termination.force_exit();
            return Err(Error::SendRoutineMissing);
        };

        let generation = session.generation;
        let termination = Arc::clone(&session.termination);
        state.status = WorkerStatus::Working;

        self.supervise(
            "sender",
            generation,
            &termination,
            false,
            routine.run(user_id, client_addr, Arc::clone(&termination)),
        );
        Ok(())
    }

    /// Marks the slot TERMINATED unless it has moved on to another session
    pub(crate) fn mark_terminated(&self, generation: u64) {
        let mut state = write(&self.state);
        if state.generation != generation {
            return;
        }
        if matches!(state.status, WorkerStatus::Available | WorkerStatus::Terminated) {
            return;
        }

        info!("Worker {} terminated (was {})", self.id, state.status);
        state.status = WorkerStatus::Terminated;
    }

    /// Tears the session down and returns the slot to AVAILABLE.
    /// Returns the user that owned the slot, if any.
    pub(crate) fn reset(&self, forced: bool) -> Option<String> {
        let mut state = write(&self.state);
        if state.status == WorkerStatus::Available {
            return None;
        }

        if let Some(session) = state.session.take() {
            session.termination.stop_send();
            if forced {
                session.termination.force_exit();
            } else {
                session.termination.fire();
            }
        }

        let owner = state.owner_user_id.take();
        if let Some(owner) = &owner {
            let mut owners = lock(&self.owners);
            if owners.get(owner) == Some(&self.id) {
                owners.remove(owner);
            }
        }

        state.client_addr = None;
        state.status = WorkerStatus::Available;
        state.generation += 1;
        owner
    }

    /// Fires the session's force exit signal
    pub fn force_exit(&self) {
        read(&self.state).force_exit();
    }

    /// True when both the receiver and the processor answer a probe within
    /// `window`. A slot without an armed session has nothing to probe.
    pub async fn check_liveness(&self, window: Duration) -> bool {
        let probes = {
            let state = read(&self.state);
            state
                .session
                .as_ref()
                .map(|s| (s.receiver_probe.clone(), s.processor_probe.clone()))
        };
        let Some((receiver, processor)) = probes else {
            return true;
        };

        let (receiver_alive, processor_alive) =
            tokio::join!(probe(receiver, window), probe(processor, window));
        if !receiver_alive || !processor_alive {
            debug!(
                "Worker {} liveness: receiver={} processor={}",
                self.id, receiver_alive, processor_alive
            );
        }
        receiver_alive && processor_alive
    }
}

#[cfg(test)]
impl Worker {
    /// Installs a session whose tasks hold their probe channels but never
    /// answer them
    pub(crate) fn attach_unresponsive_session(&self) -> (mpsc::Receiver<Probe>, mpsc::Receiver<Probe>) {
        let (receiver_probe, receiver_probes) = mpsc::channel(1);
        let (processor_probe, processor_probes) = mpsc::channel(1);
        let mut state = write(&self.state);
        state.session = Some(Session {
            generation: state.generation,
            termination: Arc::new(Termination::new()),
            receiver_probe,
            processor_probe,
            send_routine: None,
        });
        (receiver_probes, processor_probes)
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = read(&self.state);
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("port", &self.port)
            .field("status", &state.status)
            .field("owner_user_id", &state.owner_user_id)
            .field("generation", &state.generation)
            .finish()
    }
}

async fn probe(channel: mpsc::Sender<Probe>, window: Duration) -> bool {
    let (reply, echo) = oneshot::channel();
    let round_trip = async {
        channel.send(reply).await.ok()?;
        echo.await.ok()
    };
    matches!(timeout(window, round_trip).await, Ok(Some(())))
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}
