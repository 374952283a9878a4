#![forbid(unsafe_code)]

// Bounded pool of mediasoup workers with death recovery and CPU-driven
// auto-scaling.

use crate::media::config::WorkerConfig;
use crate::media::types::{MediaError, MediaResult};
use futures_util::future::join_all;
use mediasoup::prelude::*;
use mediasoup::worker::WorkerId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Scale up when the busiest worker crosses this CPU ratio.
const SCALE_UP_CPU: f64 = 0.75;
/// Scale down when the pool-wide average falls below this CPU ratio.
const SCALE_DOWN_CPU: f64 = 0.30;
/// Delay before terminating the process once the pool is unrecoverable.
const EXHAUSTED_EXIT_DELAY: Duration = Duration::from_secs(5);

struct CpuSample {
    busy_ms: u64,
    taken_at: Instant,
}

/// Worker pool. Size always stays within `[min_workers, max_workers]`;
/// mutation happens under the `workers` write lock, which serializes the
/// death handler against auto-scaling.
pub struct WorkerPool {
    manager: mediasoup::worker_manager::WorkerManager,
    config: WorkerConfig,
    workers: RwLock<Vec<Worker>>,
    next_worker_idx: AtomicUsize,
    /// Coalesces overlapping auto-scaling triggers.
    is_scaling: AtomicBool,
    cpu_samples: StdMutex<HashMap<WorkerId, CpuSample>>,
}

impl WorkerPool {
    /// Creates `min_workers` workers in parallel. Individual failures are
    /// tolerated; startup fails only if no worker comes up at all.
    pub async fn new(config: WorkerConfig) -> MediaResult<Arc<Self>> {
        let manager = mediasoup::worker_manager::WorkerManager::new();

        let spawns = (0..config.min_workers).map(|_| Self::spawn_worker(&manager, &config));
        let mut workers = Vec::with_capacity(config.min_workers);
        for result in join_all(spawns).await {
            match result {
                Ok(worker) => workers.push(worker),
                Err(e) => warn!("Worker failed to start: {}", e),
            }
        }
        if workers.is_empty() {
            return Err(MediaError::WorkerError(
                "No media workers could be started".to_string(),
            ));
        }
        info!(
            "Started {}/{} media workers (max {})",
            workers.len(),
            config.min_workers,
            config.max_workers
        );

        let pool = Arc::new(Self {
            manager,
            config,
            workers: RwLock::new(Vec::new()),
            next_worker_idx: AtomicUsize::new(0),
            is_scaling: AtomicBool::new(false),
            cpu_samples: StdMutex::new(HashMap::new()),
        });

        for worker in &workers {
            pool.install_death_handler(worker);
        }
        *pool.workers.write().await = workers;

        Ok(pool)
    }

    async fn spawn_worker(
        manager: &mediasoup::worker_manager::WorkerManager,
        config: &WorkerConfig,
    ) -> MediaResult<Worker> {
        manager
            .create_worker(config.to_worker_settings())
            .await
            .map_err(|e| MediaError::WorkerError(format!("Failed to create worker: {e}")))
    }

    /// Each worker gets exactly one recovery attempt; if the pool is empty
    /// after a failed recovery, the process is terminated after a short delay.
    fn install_death_handler(self: &Arc<Self>, worker: &Worker) {
        let pool = Arc::clone(self);
        let worker_id = worker.id();
        let runtime = tokio::runtime::Handle::current();
        worker
            .on_dead(move |reason| {
                error!("Media worker {} died: {:?}", worker_id, reason);
                runtime.spawn(async move {
                    pool.recover_from_death(worker_id).await;
                });
            })
            .detach();
    }

    async fn recover_from_death(self: Arc<Self>, dead_id: WorkerId) {
        let mut workers = self.workers.write().await;
        workers.retain(|w| w.id() != dead_id);
        {
            let mut samples = self.cpu_samples.lock().unwrap_or_else(|e| e.into_inner());
            samples.remove(&dead_id);
        }

        match Self::spawn_worker(&self.manager, &self.config).await {
            Ok(replacement) => {
                info!(
                    "Recovered from worker {} death with replacement {}",
                    dead_id,
                    replacement.id()
                );
                self.install_death_handler(&replacement);
                workers.push(replacement);
            }
            Err(e) => {
                error!("Failed to replace dead worker {}: {}", dead_id, e);
                if workers.is_empty() {
                    drop(workers);
                    error!(
                        "Media worker pool exhausted, terminating in {:?}",
                        EXHAUSTED_EXIT_DELAY
                    );
                    tokio::time::sleep(EXHAUSTED_EXIT_DELAY).await;
                    std::process::exit(1);
                }
            }
        }
    }

    /// Round-robin placement for new routers.
    pub async fn next_worker(&self) -> MediaResult<Worker> {
        let workers = self.workers.read().await;
        if workers.is_empty() {
            return Err(MediaError::WorkerError("No workers available".to_string()));
        }
        let idx = self.next_worker_idx.fetch_add(1, Ordering::Relaxed) % workers.len();
        Ok(workers[idx].clone())
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.read().await.len()
    }

    /// Auto-scaling pass, triggered imperatively after router creation and
    /// room closure. `attribution` maps a worker to its live
    /// (producers, consumers) counts for operator visibility.
    pub async fn autoscale(
        self: &Arc<Self>,
        room_count: usize,
        attribution: &HashMap<WorkerId, (usize, usize)>,
    ) {
        if room_count == 0 {
            return;
        }
        if self
            .is_scaling
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.autoscale_locked(attribution).await;
        self.is_scaling.store(false, Ordering::SeqCst);
    }

    async fn autoscale_locked(self: &Arc<Self>, attribution: &HashMap<WorkerId, (usize, usize)>) {
        let snapshot: Vec<Worker> = self.workers.read().await.clone();
        if snapshot.is_empty() {
            return;
        }

        let mut ratios = Vec::with_capacity(snapshot.len());
        for worker in &snapshot {
            match worker.get_resource_usage().await {
                Ok(usage) => {
                    let ratio = self.cpu_ratio(worker.id(), usage.ru_utime + usage.ru_stime);
                    let (producers, consumers) = attribution
                        .get(&worker.id())
                        .copied()
                        .unwrap_or((0, 0));
                    debug!(
                        "Worker {}: cpu {:.2}, {} producers, {} consumers",
                        worker.id(),
                        ratio,
                        producers,
                        consumers
                    );
                    ratios.push(ratio);
                }
                Err(e) => warn!("Failed to sample worker {}: {}", worker.id(), e),
            }
        }
        if ratios.is_empty() {
            return;
        }

        let max_cpu = ratios.iter().copied().fold(0.0_f64, f64::max);
        let avg_cpu = ratios.iter().sum::<f64>() / ratios.len() as f64;
        let pool_size = snapshot.len();

        if max_cpu > SCALE_UP_CPU && pool_size < self.config.max_workers {
            info!(
                "Scaling up: max worker cpu {:.2} with {} workers",
                max_cpu, pool_size
            );
            match Self::spawn_worker(&self.manager, &self.config).await {
                Ok(worker) => {
                    // Re-check the bound: a death recovery may have run since
                    // the snapshot was taken.
                    let mut workers = self.workers.write().await;
                    if workers.len() < self.config.max_workers {
                        info!("Added worker {} to the pool", worker.id());
                        self.install_death_handler(&worker);
                        workers.push(worker);
                    }
                }
                Err(e) => warn!("Scale-up failed: {}", e),
            }
        } else if avg_cpu < SCALE_DOWN_CPU && pool_size > self.config.min_workers {
            let mut workers = self.workers.write().await;
            if workers.len() > self.config.min_workers {
                if let Some(worker) = workers.pop() {
                    info!(
                        "Scaling down: avg cpu {:.2}, closing worker {}",
                        avg_cpu,
                        worker.id()
                    );
                    let mut samples = self.cpu_samples.lock().unwrap_or_else(|e| e.into_inner());
                    samples.remove(&worker.id());
                    // Dropped here; the worker process shuts down.
                }
            }
        }
    }

    /// CPU busy ratio since the previous sample, clamped to [0, 1]. The
    /// first observation of a worker yields 0 and seeds the baseline.
    fn cpu_ratio(&self, worker_id: WorkerId, busy_ms: u64) -> f64 {
        let now = Instant::now();
        let mut samples = self.cpu_samples.lock().unwrap_or_else(|e| e.into_inner());
        let ratio = match samples.get(&worker_id) {
            Some(prev) => {
                let wall_ms = now.duration_since(prev.taken_at).as_millis() as u64;
                if wall_ms == 0 {
                    0.0
                } else {
                    (busy_ms.saturating_sub(prev.busy_ms) as f64 / wall_ms as f64).min(1.0)
                }
            }
            None => 0.0,
        };
        samples.insert(worker_id, CpuSample { busy_ms, taken_at: now });
        ratio
    }

    pub async fn shutdown(&self) {
        info!("Shutting down media worker pool");
        self.workers.write().await.clear();
        let mut samples = self.cpu_samples.lock().unwrap_or_else(|e| e.into_inner());
        samples.clear();
    }
}
