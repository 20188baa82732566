// Copyright 2025 framewire contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The bounded-growth worker pool.
//!
//! A single dispatcher matches queued tasks to free workers, spawning new
//! workers up to the configured maximum when none are idle. Workers are
//! long-lived: the initial minimum persists until pool shutdown and a panic
//! inside a task never takes a worker down.

use std::any::type_name;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::buffer::IoBuf;
use crate::service::{Shutdown, WorkerPoolConfig};

/// A callable executed on a worker, decoupled from the I/O tasks.
///
/// The payload buffer is owned by the call; dropping it returns a recyclable
/// buffer to its pool. Deferred work for an orderly session must signal
/// completion through the session's `process_incoming_data` /
/// `process_outgoing_data` after it finishes.
#[async_trait]
pub trait Work: Send + Sync {
    async fn run(&self, payload: IoBuf) -> i32;
}

struct Task {
    work: Arc<dyn Work>,
    payload: IoBuf,
}

type WorkerSlot = mpsc::Sender<Task>;

struct PoolCore {
    free_tx: mpsc::UnboundedSender<WorkerSlot>,
    workers_stop: broadcast::Sender<()>,
    worker_count: AtomicUsize,
    max_workers: usize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl PoolCore {
    /// Bring up one worker task. A registered worker starts on the free
    /// list; an unregistered one is handed its first task directly by the
    /// dispatcher.
    fn spawn_worker(&self, id: usize, register_free: bool) -> WorkerSlot {
        let (slot_tx, mut slot_rx) = mpsc::channel::<Task>(1);
        let free_tx = self.free_tx.clone();
        let return_slot = slot_tx.clone();
        let mut shutdown = Shutdown::subscribe(&self.workers_stop);

        self.worker_count.fetch_add(1, Ordering::Relaxed);

        let handle = tokio::spawn(async move {
            debug!("worker {} started", id);
            loop {
                tokio::select! {
                    maybe_task = slot_rx.recv() => {
                        let Some(task) = maybe_task else { break };
                        let run = AssertUnwindSafe(task.work.run(task.payload)).catch_unwind();
                        if let Err(panic_payload) = run.await {
                            log_worker_panic(id, panic_payload);
                        }
                        // recyclable payloads went back to their pool on drop;
                        // rejoin the free list and wake the dispatcher
                        if free_tx.send(return_slot.clone()).is_err() {
                            break;
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("worker {} shutting down", id);
                        break;
                    }
                }
            }
        });

        self.handles.lock().push(handle);
        if register_free {
            let _ = self.free_tx.send(slot_tx.clone());
        }
        slot_tx
    }
}

/// A dynamically-sized pool of long-lived workers fed by a FIFO task queue,
/// plus a keyed registry for routing frames to named [`Work`] callables.
pub struct WorkerPool {
    core: Arc<PoolCore>,
    task_tx: async_channel::Sender<Task>,
    dispatcher_stop: broadcast::Sender<()>,
    dispatcher_handle: Mutex<Option<JoinHandle<()>>>,
    int_works: DashMap<i32, Arc<dyn Work>>,
    str_works: DashMap<String, Arc<dyn Work>>,
    min_workers: usize,
    state: AtomicI32,
}

impl WorkerPool {
    /// Build the pool and spawn its minimum workers and the dispatcher.
    ///
    /// Zeroes in the config pick defaults from the core count: `min` becomes
    /// the number of CPUs, `max` twice that.
    pub fn new(config: &WorkerPoolConfig) -> WorkerPool {
        let cores = num_cpus::get();
        let mut min_workers = config.min_workers;
        if min_workers == 0 {
            min_workers = cores.max(1);
        }
        let mut max_workers = config.max_workers;
        if max_workers == 0 {
            max_workers = (cores * 2).max(2);
        }
        if max_workers < min_workers {
            max_workers = min_workers;
        }

        let (task_tx, task_rx) = async_channel::unbounded();
        let (free_tx, free_rx) = mpsc::unbounded_channel();
        let (workers_stop, _) = broadcast::channel(1);
        let (dispatcher_stop, _) = broadcast::channel(1);

        let core = Arc::new(PoolCore {
            free_tx,
            workers_stop,
            worker_count: AtomicUsize::new(0),
            max_workers,
            handles: Mutex::new(Vec::new()),
        });

        for id in 0..min_workers {
            core.spawn_worker(id, true);
        }

        let dispatcher_core = core.clone();
        let stop = dispatcher_stop.clone();
        let dispatcher_handle = tokio::spawn(async move {
            dispatch(dispatcher_core, task_rx, free_rx, stop).await;
        });

        WorkerPool {
            core,
            task_tx,
            dispatcher_stop,
            dispatcher_handle: Mutex::new(Some(dispatcher_handle)),
            int_works: DashMap::new(),
            str_works: DashMap::new(),
            min_workers,
            state: AtomicI32::new(1),
        }
    }

    /// Queue a one-shot task and wake the dispatcher. Returns the queue
    /// depth after the append, or 0 when the pool is shut down.
    pub async fn add_task(&self, work: Arc<dyn Work>, payload: IoBuf) -> usize {
        if self.state.load(Ordering::Relaxed) <= 0 {
            return 0;
        }
        if let Err(err) = self.task_tx.send(Task { work, payload }).await {
            error!("failed to queue work task: {}", err);
            return 0;
        }
        self.task_tx.len()
    }

    /// Register a long-lived callable under an integer key, replacing any
    /// previous entry. Returns the number of registered integer keys.
    pub fn put_work(&self, key: i32, work: Arc<dyn Work>) -> usize {
        self.int_works.insert(key, work);
        self.int_works.len()
    }

    pub fn get_work(&self, key: i32) -> Option<Arc<dyn Work>> {
        self.int_works.get(&key).map(|entry| entry.value().clone())
    }

    pub fn put_work_by_name(&self, key: impl Into<String>, work: Arc<dyn Work>) -> usize {
        self.str_works.insert(key.into(), work);
        self.str_works.len()
    }

    pub fn get_work_by_name(&self, key: &str) -> Option<Arc<dyn Work>> {
        self.str_works.get(key).map(|entry| entry.value().clone())
    }

    pub fn worker_count(&self) -> usize {
        self.core.worker_count.load(Ordering::Relaxed)
    }

    pub fn task_count(&self) -> usize {
        self.task_tx.len()
    }

    pub fn min_workers(&self) -> usize {
        self.min_workers
    }

    pub fn max_workers(&self) -> usize {
        self.core.max_workers
    }

    /// Stop the dispatcher first, then every worker, joining each in turn.
    /// Queued but unassigned tasks are dropped; their payloads recycle.
    pub async fn shutdown(&self) {
        if self.state.swap(-1, Ordering::Relaxed) <= 0 {
            return;
        }
        self.task_tx.close();

        let _ = self.dispatcher_stop.send(());
        let dispatcher = self.dispatcher_handle.lock().take();
        if let Some(handle) = dispatcher {
            let _ = handle.await;
        }

        let _ = self.core.workers_stop.send(());
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.core.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn dispatch(
    core: Arc<PoolCore>,
    task_rx: async_channel::Receiver<Task>,
    mut free_rx: mpsc::UnboundedReceiver<WorkerSlot>,
    stop: broadcast::Sender<()>,
) {
    let mut shutdown = Shutdown::subscribe(&stop);
    debug!("dispatcher started");

    loop {
        let task = tokio::select! {
            result = task_rx.recv() => match result {
                Ok(task) => task,
                Err(_) => break,
            },
            _ = shutdown.recv() => break,
        };

        // prefer an idle worker; grow the pool up to the cap when none is
        let slot = match free_rx.try_recv() {
            Ok(slot) => slot,
            Err(_) => {
                let live = core.worker_count.load(Ordering::Relaxed);
                if live < core.max_workers {
                    core.spawn_worker(live, false)
                } else {
                    tokio::select! {
                        maybe_slot = free_rx.recv() => match maybe_slot {
                            Some(slot) => slot,
                            None => break,
                        },
                        _ = shutdown.recv() => break,
                    }
                }
            }
        };

        if slot.send(task).await.is_err() {
            error!("failed to hand a task to a worker");
        }
    }

    debug!("dispatcher exiting");
}

fn log_worker_panic(worker_id: usize, payload: Box<dyn std::any::Any + Send>) {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        error!("worker {worker_id} panicked with message: {message}");
    } else if let Some(message) = payload.downcast_ref::<String>() {
        error!("worker {worker_id} panicked with message: {message}");
    } else {
        error!(
            "worker {worker_id} panicked with an unknown type: {}",
            get_type_name(&payload)
        );
    }
}

#[inline]
fn get_type_name<R>(_: &R) -> &'static str {
    type_name::<R>()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::buffer::BufferPool;

    struct CountingWork {
        completed: Arc<AtomicUsize>,
        running: Arc<AtomicI32>,
        peak: Arc<AtomicI32>,
        delay: Duration,
    }

    #[async_trait]
    impl Work for CountingWork {
        async fn run(&self, _payload: IoBuf) -> i32 {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.completed.fetch_add(1, Ordering::SeqCst);
            0
        }
    }

    fn counting_work(delay_ms: u64) -> (Arc<CountingWork>, Arc<AtomicUsize>, Arc<AtomicI32>) {
        let completed = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicI32::new(0));
        let work = Arc::new(CountingWork {
            completed: completed.clone(),
            running: Arc::new(AtomicI32::new(0)),
            peak: peak.clone(),
            delay: Duration::from_millis(delay_ms),
        });
        (work, completed, peak)
    }

    async fn wait_for(completed: &AtomicUsize, expected: usize) {
        for _ in 0..200 {
            if completed.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "only {} of {} tasks completed",
            completed.load(Ordering::SeqCst),
            expected
        );
    }

    #[tokio::test]
    async fn tasks_run_and_payloads_recycle() {
        let pool = WorkerPool::new(&WorkerPoolConfig {
            min_workers: 2,
            max_workers: 2,
        });
        let buffers = BufferPool::default();
        let (work, completed, _) = counting_work(1);

        for _ in 0..3 {
            let payload = buffers.acquire(64).unwrap();
            pool.add_task(work.clone(), payload).await;
        }
        wait_for(&completed, 3).await;

        // every payload buffer went back to the pool after its task ran
        for _ in 0..50 {
            if buffers.free_count() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(buffers.free_count(), 3);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn six_tasks_never_exceed_four_workers() {
        let pool = WorkerPool::new(&WorkerPoolConfig {
            min_workers: 2,
            max_workers: 4,
        });
        assert_eq!(pool.worker_count(), 2);

        let (work, completed, peak) = counting_work(100);
        for _ in 0..6 {
            pool.add_task(work.clone(), IoBuf::new(16)).await;
        }

        wait_for(&completed, 6).await;
        assert!(pool.worker_count() <= 4);
        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert_eq!(completed.load(Ordering::SeqCst), 6);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn pool_grows_past_the_minimum_under_load() {
        let pool = WorkerPool::new(&WorkerPoolConfig {
            min_workers: 1,
            max_workers: 3,
        });
        let (work, completed, peak) = counting_work(100);

        for _ in 0..3 {
            pool.add_task(work.clone(), IoBuf::new(16)).await;
        }
        wait_for(&completed, 3).await;

        assert!(pool.worker_count() > 1);
        assert!(pool.worker_count() <= 3);
        assert!(peak.load(Ordering::SeqCst) > 1);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn a_panicking_task_does_not_kill_its_worker() {
        struct PanicWork;

        #[async_trait]
        impl Work for PanicWork {
            async fn run(&self, _payload: IoBuf) -> i32 {
                panic!("boom");
            }
        }

        let pool = WorkerPool::new(&WorkerPoolConfig {
            min_workers: 1,
            max_workers: 1,
        });

        pool.add_task(Arc::new(PanicWork), IoBuf::new(4)).await;

        let (work, completed, _) = counting_work(1);
        pool.add_task(work, IoBuf::new(4)).await;
        wait_for(&completed, 1).await;
        assert_eq!(pool.worker_count(), 1);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn keyed_works_route_by_int_and_name() {
        let pool = WorkerPool::new(&WorkerPoolConfig {
            min_workers: 1,
            max_workers: 1,
        });
        let (work, completed, _) = counting_work(1);

        assert_eq!(pool.put_work(7, work.clone()), 1);
        assert_eq!(pool.put_work_by_name("echo", work.clone()), 1);
        assert!(pool.get_work(7).is_some());
        assert!(pool.get_work(8).is_none());
        assert!(pool.get_work_by_name("echo").is_some());

        // replacing under the same key does not grow the registry
        assert_eq!(pool.put_work(7, work.clone()), 1);

        let routed = pool.get_work(7).unwrap();
        pool.add_task(routed, IoBuf::new(4)).await;
        wait_for(&completed, 1).await;

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn add_task_after_shutdown_is_refused() {
        let pool = WorkerPool::new(&WorkerPoolConfig {
            min_workers: 1,
            max_workers: 1,
        });
        pool.shutdown().await;

        let (work, completed, _) = counting_work(1);
        assert_eq!(pool.add_task(work, IoBuf::new(4)).await, 0);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(completed.load(Ordering::SeqCst), 0);
    }
}
