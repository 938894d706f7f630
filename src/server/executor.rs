//! # Executor de Tareas
//! src/server/executor.rs
//!
//! El reactor no procesa requests: entrega cada conexión lista a un
//! [`Executor`]. Quien embebe el servidor puede dar el suyo; si no, se usa
//! un [`ThreadPool`] con una cola FIFO compartida.
//!
//! ```text
//! reactor ──execute()──► cola (Mutex + Condvar) ──► worker-0 .. worker-N
//! ```

use crate::error::RejectedExecution;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// Unidad de trabajo entregada al executor
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Destino de las tareas de exchange
pub trait Executor: Send + Sync {
    fn execute(&self, task: Task) -> Result<(), RejectedExecution>;
}

/// Cualquier closure `Fn(Task)` sirve como executor (por ejemplo, uno que
/// corre la tarea en un thread nuevo)
impl<F> Executor for F
where
    F: Fn(Task) + Send + Sync,
{
    fn execute(&self, task: Task) -> Result<(), RejectedExecution> {
        self(task);
        Ok(())
    }
}

/// Cola compartida entre el pool y sus workers
struct TaskQueue {
    state: Mutex<QueueState>,
    condvar: Condvar,
}

struct QueueState {
    tasks: VecDeque<Task>,
    shutdown: bool,
}

impl TaskQueue {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bloquea hasta que haya una tarea; `None` al apagar el pool
    fn dequeue(&self) -> Option<Task> {
        let mut state = self.lock();
        loop {
            if let Some(task) = state.tasks.pop_front() {
                return Some(task);
            }
            if state.shutdown {
                return None;
            }
            state = self
                .condvar
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

/// Pool fijo de workers
pub struct ThreadPool {
    queue: Arc<TaskQueue>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl ThreadPool {
    /// Lanza `size` workers (mínimo uno)
    pub fn new(size: usize) -> std::io::Result<Self> {
        let size = size.max(1);
        let queue = Arc::new(TaskQueue {
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                shutdown: false,
            }),
            condvar: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let queue = Arc::clone(&queue);
            let handle = thread::Builder::new()
                .name(format!("http-worker-{}", i))
                .spawn(move || Self::worker_loop(queue))?;
            workers.push(handle);
        }

        debug!(workers = size, "thread pool started");

        Ok(Self {
            queue,
            workers: Mutex::new(workers),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Tareas encoladas que ningún worker tomó todavía
    pub fn pending(&self) -> usize {
        self.queue.lock().tasks.len()
    }

    fn worker_loop(queue: Arc<TaskQueue>) {
        while let Some(task) = queue.dequeue() {
            // Un panic no debe matar al worker
            if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                error!("task panicked in worker thread");
            }
        }
    }

    /// Deja de aceptar tareas; los workers terminan lo encolado y salen
    ///
    /// No bloquea: un worker atrapado en un handler sigue vivo hasta que
    /// el handler retorne.
    pub fn shutdown(&self) {
        self.queue.lock().shutdown = true;
        self.queue.condvar.notify_all();
    }

    /// Espera a que salgan los workers (llamar después de `shutdown`)
    pub fn join(&self) {
        let handles: Vec<JoinHandle<()>> = match self.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        let current = thread::current().id();
        for handle in handles {
            // Un worker que apaga su propio pool no puede esperarse a sí mismo
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

impl Executor for ThreadPool {
    fn execute(&self, task: Task) -> Result<(), RejectedExecution> {
        let mut state = self.queue.lock();
        if state.shutdown {
            return Err(RejectedExecution::new("thread pool is shut down"));
        }
        state.tasks.push_back(task);
        drop(state);

        self.queue.condvar.notify_one();
        Ok(())
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_pool_runs_tasks() {
        let pool = ThreadPool::new(3).unwrap();
        assert_eq!(pool.size(), 3);

        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            let tx = tx.clone();
            pool.execute(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                tx.send(()).unwrap();
            }))
            .unwrap();
        }

        for _ in 0..10 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_panic_does_not_kill_worker() {
        let pool = ThreadPool::new(1).unwrap();
        pool.execute(Box::new(|| panic!("boom"))).unwrap();

        let (tx, rx) = mpsc::channel();
        pool.execute(Box::new(move || tx.send(42).unwrap())).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }

    #[test]
    fn test_rejects_after_shutdown() {
        let pool = ThreadPool::new(2).unwrap();
        pool.shutdown();
        assert!(pool.execute(Box::new(|| {})).is_err());
    }

    #[test]
    fn test_shutdown_does_not_wait_for_busy_worker() {
        let pool = ThreadPool::new(1).unwrap();
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        pool.execute(Box::new(move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv_timeout(Duration::from_secs(10));
        }))
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let start = std::time::Instant::now();
        pool.shutdown();
        assert!(start.elapsed() < Duration::from_secs(1));

        release_tx.send(()).unwrap();
        pool.join();
    }

    #[test]
    fn test_closure_executor() {
        let direct = |task: Task| task();
        let (tx, rx) = mpsc::channel();
        direct.execute(Box::new(move || tx.send("ran").unwrap())).unwrap();
        assert_eq!(rx.try_recv().unwrap(), "ran");
    }
}
