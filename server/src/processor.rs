//! Inbound event queue and the processor tasks draining it.
//!
//! Every armed session contributes one processor to a pool that consumes a
//! single shared queue; any processor may handle any session's events.

use log::{debug, info};
use shared::InboundMessage;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};

use crate::error::{Error, Result};
use crate::game::{SharedWorld, World};
use crate::termination::Termination;
use crate::worker::Probe;

/// Multi-producer, multi-consumer queue of decoded client messages
#[derive(Clone)]
pub struct EventQueue {
    sender: mpsc::Sender<InboundMessage>,
    receiver: Arc<Mutex<mpsc::Receiver<InboundMessage>>>,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    pub fn sender(&self) -> mpsc::Sender<InboundMessage> {
        self.sender.clone()
    }

    /// Waits for the next event. Consumers take turns on the receiver.
    pub async fn next(&self) -> Option<InboundMessage> {
        self.receiver.lock().await.recv().await
    }
}

/// Applies one inbound message to the world
pub fn apply_event(world: &dyn World, event: InboundMessage) {
    match event {
        InboundMessage::Status(status) => world.update_user_position(&status),
        InboundMessage::Attack(attack) => world.apply_attack(&attack),
    }
}

pub struct Processor {
    worker_id: usize,
    events: EventQueue,
    world: SharedWorld,
    termination: Arc<Termination>,
    terminated: watch::Receiver<bool>,
    probes: mpsc::Receiver<Probe>,
}

impl Processor {
    pub fn new(
        worker_id: usize,
        events: EventQueue,
        world: SharedWorld,
        termination: Arc<Termination>,
        probes: mpsc::Receiver<Probe>,
    ) -> Self {
        let terminated = termination.subscribe_processor();
        Self {
            worker_id,
            events,
            world,
            termination,
            terminated,
            probes,
        }
    }

    /// Runs until the paired receiver raises the termination flag.
    /// A forced exit is reported as an error.
    pub async fn run(mut self) -> Result<()> {
        info!("Event processor for worker {} initialized", self.worker_id);

        loop {
            tokio::select! {
                biased;

                _ = self.termination.forced() => {
                    info!("Force exit signal received in processor {}", self.worker_id);
                    return Err(Error::ForcedExit);
                }
                changed = self.terminated.changed() => {
                    if changed.is_err() || *self.terminated.borrow() {
                        info!("Termination signal received in processor {}", self.worker_id);
                        return Ok(());
                    }
                }
                Some(reply) = self.probes.recv() => {
                    let _ = reply.send(());
                }
                event = self.events.next() => match event {
                    Some(event) => {
                        debug!("Processing {} event", event.user_id());
                        apply_event(self.world.as_ref(), event);
                    }
                    None => return Err(Error::EventQueueClosed),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorldConfig;
    use crate::game::GameWorld;
    use shared::{Attack, Position, Status};
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::time::{sleep, timeout};

    fn world() -> Arc<GameWorld> {
        Arc::new(GameWorld::empty(WorldConfig {
            map_size: 10,
            coin_count: 0,
            item_count: 0,
            base_visibility: 2,
        }))
    }

    fn status(id: &str, x: i32, y: i32) -> InboundMessage {
        InboundMessage::Status(Status {
            id: id.to_string(),
            current_position: Position::new(x, y),
        })
    }

    fn spawn_processor(
        world: SharedWorld,
        events: EventQueue,
    ) -> (
        Arc<Termination>,
        mpsc::Sender<Probe>,
        tokio::task::JoinHandle<Result<()>>,
    ) {
        let termination = Arc::new(Termination::new());
        let (probe, probes) = mpsc::channel(1);
        let processor = Processor::new(0, events, world, Arc::clone(&termination), probes);
        (termination, probe, tokio::spawn(processor.run()))
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        timeout(Duration::from_secs(2), async {
            while !condition() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_events_are_applied_in_order() {
        let world = world();
        let events = EventQueue::new(16);
        let (termination, _probe, handle) = spawn_processor(world.clone(), events.clone());

        let sender = events.sender();
        sender.send(status("alice", 1, 1)).await.unwrap();
        sender.send(status("alice", 2, 1)).await.unwrap();
        sender.send(status("alice", 3, 1)).await.unwrap();

        wait_for(|| {
            world.user_status("alice").map(|s| s.position) == Some(Position::new(3, 1))
        })
        .await;

        termination.notify_processor();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_attack_event_reaches_world() {
        let world = world();
        world.register_score("alice");
        world.register_score("bob");
        apply_event(world.as_ref(), status("alice", 4, 4));
        apply_event(world.as_ref(), status("bob", 5, 4));

        let events = EventQueue::new(4);
        let (termination, _probe, handle) = spawn_processor(world.clone(), events.clone());

        // bob has nothing to lose yet, so scores stay flat
        events
            .sender()
            .send(InboundMessage::Attack(Attack {
                user_id: "alice".to_string(),
                user_position: Position::new(4, 4),
                attack_position: Position::new(5, 4),
            }))
            .await
            .unwrap();
        events.sender().send(status("alice", 4, 5)).await.unwrap();

        wait_for(|| {
            world.user_status("alice").map(|s| s.position) == Some(Position::new(4, 5))
        })
        .await;
        assert_eq!(world.scoreboard().get("bob"), Some(&0));

        termination.notify_processor();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_answers_liveness_probe() {
        let events = EventQueue::new(4);
        let (termination, probe, handle) = spawn_processor(world(), events);

        let (reply, echo) = oneshot::channel();
        probe.send(reply).await.unwrap();
        timeout(Duration::from_secs(1), echo).await.unwrap().unwrap();

        termination.notify_processor();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_forced_exit_is_an_error() {
        let events = EventQueue::new(4);
        let (termination, _probe, handle) = spawn_processor(world(), events);

        termination.force_exit();
        let result = timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(matches!(result, Err(Error::ForcedExit)));
    }

    #[tokio::test]
    async fn test_processors_share_one_queue() {
        let world = world();
        let events = EventQueue::new(64);
        let (first, _p1, first_handle) = spawn_processor(world.clone(), events.clone());
        let (second, _p2, second_handle) = spawn_processor(world.clone(), events.clone());

        let sender = events.sender();
        for x in 0..5 {
            sender.send(status(&format!("user-{x}"), x, 0)).await.unwrap();
        }

        wait_for(|| (0..5).all(|x| world.user_status(&format!("user-{x}")).is_some())).await;

        first.notify_processor();
        second.notify_processor();
        first_handle.await.unwrap().unwrap();
        second_handle.await.unwrap().unwrap();
    }
}
