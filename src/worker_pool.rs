#![forbid(unsafe_code)]

// Fixed pool of media-engine workers. Rooms are assigned round-robin and
// keep their worker for life; there is no rebalancing. A dying worker is
// reported on the death channel and the binary treats it as fatal.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::MediaConfig;
use crate::engine::types::WorkerId;
use crate::engine::{EngineError, EngineResult, EventSubscription, MediaEngine, MediaWorker};

#[derive(Debug)]
pub struct WorkerDeath {
    pub worker_id: WorkerId,
    pub reason: String,
}

pub struct WorkerPool {
    workers: Vec<Arc<dyn MediaWorker>>,
    next_idx: AtomicUsize,
    death_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkerDeath>>>,
    _death_watches: Vec<EventSubscription>,
}

impl WorkerPool {
    pub async fn new(engine: Arc<dyn MediaEngine>, config: &MediaConfig) -> EngineResult<Self> {
        let count = config.num_workers.max(1);
        let (death_tx, death_rx) = mpsc::unbounded_channel();
        let mut workers: Vec<Arc<dyn MediaWorker>> = Vec::with_capacity(count);
        let mut death_watches = Vec::with_capacity(count);

        for index in 0..count {
            let worker = engine.create_worker(config.worker_settings()).await?;
            let worker_id = worker.id();
            let watch = worker.on_dead(Box::new({
                let death_tx = death_tx.clone();
                move |reason| {
                    let _ = death_tx.send(WorkerDeath { worker_id, reason });
                }
            }));
            info!(%worker_id, index, "media worker started");
            workers.push(worker);
            death_watches.push(watch);
        }

        if workers.is_empty() {
            return Err(EngineError::Failure("worker pool is empty".to_string()));
        }

        Ok(Self {
            workers,
            next_idx: AtomicUsize::new(0),
            death_rx: Mutex::new(Some(death_rx)),
            _death_watches: death_watches,
        })
    }

    /// Round-robin worker assignment for a new room. The assignment is
    /// permanent for the room's lifetime.
    pub fn acquire(&self) -> Arc<dyn MediaWorker> {
        let index = self.next_idx.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        debug!(index, worker_id = %self.workers[index].id(), "assigning worker");
        Arc::clone(&self.workers[index])
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Hands out the death receiver once; the binary selects on it and
    /// exits when anything arrives.
    pub fn take_death_watch(&self) -> Option<mpsc::UnboundedReceiver<WorkerDeath>> {
        self.death_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::stub::StubEngine;

    async fn pool_of(count: usize) -> (Arc<StubEngine>, WorkerPool) {
        let engine = Arc::new(StubEngine::new());
        let config = MediaConfig {
            num_workers: count,
            ..MediaConfig::default()
        };
        let pool = WorkerPool::new(engine.clone(), &config)
            .await
            .expect("pool");
        (engine, pool)
    }

    #[tokio::test]
    async fn acquire_cycles_deterministically() {
        let (_engine, pool) = pool_of(3).await;
        assert_eq!(pool.len(), 3);
        let first_round: Vec<_> = (0..3).map(|_| pool.acquire().id()).collect();
        let second_round: Vec<_> = (0..3).map(|_| pool.acquire().id()).collect();
        assert_eq!(first_round, second_round);
        assert_ne!(first_round[0], first_round[1]);
        assert_ne!(first_round[1], first_round[2]);
    }

    #[tokio::test]
    async fn zero_requested_workers_still_yields_one() {
        let (_engine, pool) = pool_of(0).await;
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn worker_death_reaches_the_watch_channel() {
        let (engine, pool) = pool_of(2).await;
        let mut deaths = pool.take_death_watch().expect("first take");
        assert!(pool.take_death_watch().is_none());

        let victim = &engine.workers()[1];
        victim.kill("rtc thread panicked");

        let death = deaths.recv().await.expect("death event");
        assert_eq!(death.worker_id, victim.id());
        assert_eq!(death.reason, "rtc thread panicked");
    }
}
