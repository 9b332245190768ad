//! Fixed-size pool of worker slots.
//!
//! Every slot is either in the available queue or in the in-use set, so
//! `available_count() + active_count()` always equals the capacity.

use log::{debug, info};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::worker::{lock, OwnerIndex, SessionContext, Worker};
use tokio::net::TcpListener;

struct PoolIndex {
    available: VecDeque<usize>,
    in_use: BTreeSet<usize>,
}

pub struct WorkerPool {
    workers: Vec<Arc<Worker>>,
    index: Mutex<PoolIndex>,
    owners: Arc<OwnerIndex>,
    context: Option<Arc<SessionContext>>,
}

impl WorkerPool {
    /// Binds one listener per worker. Listeners live as long as the pool.
    pub async fn bind(config: &ServerConfig, context: Option<Arc<SessionContext>>) -> Result<Self> {
        let owners: Arc<OwnerIndex> = Arc::new(Mutex::new(HashMap::new()));
        let mut workers = Vec::with_capacity(config.worker_count);

        for id in 0..config.worker_count {
            let listener = TcpListener::bind(config.worker_addr(id)?).await?;
            let worker = Worker::new(id, listener, Arc::clone(&owners))?;
            debug!("Worker {} listening on port {}", id, worker.port());
            workers.push(Arc::new(worker));
        }

        info!("Worker pool initialized with {} workers", workers.len());
        Ok(Self {
            index: Mutex::new(PoolIndex {
                available: (0..workers.len()).collect(),
                in_use: BTreeSet::new(),
            }),
            workers,
            owners,
            context,
        })
    }

    pub fn capacity(&self) -> usize {
        self.workers.len()
    }

    pub fn available_count(&self) -> usize {
        lock(&self.index).available.len()
    }

    pub fn active_count(&self) -> usize {
        lock(&self.index).in_use.len()
    }

    /// Snapshot of the slots currently in use
    pub fn in_use_workers(&self) -> Vec<Arc<Worker>> {
        let index = lock(&self.index);
        index
            .in_use
            .iter()
            .map(|&id| Arc::clone(&self.workers[id]))
            .collect()
    }

    /// Takes an available worker and arms its session
    pub fn pull(&self) -> Result<Arc<Worker>> {
        let mut index = lock(&self.index);
        let id = index.available.pop_front().ok_or(Error::Capacity)?;
        let worker = &self.workers[id];

        if let Err(e) = worker.pull_out(self.context.as_deref()) {
            index.available.push_front(id);
            return Err(e);
        }

        index.in_use.insert(id);
        debug!(
            "Worker {} pulled ({} available)",
            id,
            index.available.len()
        );
        Ok(Arc::clone(worker))
    }

    /// Returns a worker to the pool. Putting an available worker is a no-op.
    pub fn put(&self, id: usize) -> Result<()> {
        let worker = self
            .workers
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("worker {id}")))?;

        let mut index = lock(&self.index);
        if !index.in_use.remove(&id) {
            return Ok(());
        }

        let owner = worker.reset(false);
        index.available.push_back(id);
        info!("Worker {} returned to pool (owner: {:?})", id, owner);
        Ok(())
    }

    /// Returns the worker of `user_id` to the pool. The owner is checked
    /// under the pool lock, so a slot recycled for another user is left alone.
    pub fn put_owned(&self, id: usize, user_id: &str) -> Result<()> {
        let worker = self
            .workers
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("worker {id}")))?;

        let mut index = lock(&self.index);
        if !index.in_use.contains(&id) || worker.owner_user_id().as_deref() != Some(user_id) {
            return Err(Error::NotFound(user_id.to_string()));
        }

        index.in_use.remove(&id);
        worker.reset(false);
        index.available.push_back(id);
        info!("Worker {} returned to pool by {}", id, user_id);
        Ok(())
    }

    /// Force exits a stuck or terminated session and reclaims its slot,
    /// provided the slot still hosts the session of `generation`.
    /// Returns whether the slot was reclaimed.
    pub fn revive(&self, id: usize, generation: u64) -> bool {
        let Some(worker) = self.workers.get(id) else {
            return false;
        };

        let owner = {
            let mut index = lock(&self.index);
            if !index.in_use.contains(&id) || worker.generation() != generation {
                return false;
            }

            let owner = worker.reset(true);
            index.in_use.remove(&id);
            index.available.push_back(id);

            // Still under the pool lock so a new login of the same user
            // cannot lose its fresh scoreboard entry
            if let (Some(owner), Some(context)) = (&owner, &self.context) {
                context.world.deregister(owner);
            }
            owner
        };

        info!("Worker {} revived (owner: {:?})", id, owner);
        true
    }

    pub fn get_by_user_id(&self, user_id: &str) -> Result<(usize, Arc<Worker>)> {
        let id = lock(&self.owners)
            .get(user_id)
            .copied()
            .ok_or_else(|| Error::NotFound(user_id.to_string()))?;
        Ok((id, Arc::clone(&self.workers[id])))
    }
}
