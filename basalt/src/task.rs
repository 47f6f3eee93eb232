use parking_lot::{Condvar, Mutex};
use std::{
    io,
    sync::Arc,
    time::{Duration, Instant},
};
use strum::IntoStaticStr;
use tokio::{
    runtime::{Builder, Runtime},
    sync::{oneshot, Semaphore},
};

/// Work submitted to a pool. All context the work needs is captured by the closure.
pub type WorkItem = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum TaskPriority {
    /// Dependency builds that other work is waiting on.
    High,
    /// Work that blocks its own thread on dependencies, throttled so it can never starve them.
    Normal,
}

pub trait WorkerPool: Send + Sync {
    fn submit(&self, priority: TaskPriority, work: WorkItem);
}

pub struct TokioWorkerPool {
    runtime: Option<Runtime>,
    normal_permits: Arc<Semaphore>,
}

impl TokioWorkerPool {
    pub fn new(worker_threads: usize, max_concurrent_normal: usize) -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .max_blocking_threads(worker_threads.max(1))
            .thread_name("basalt-worker")
            .enable_all()
            .build()?;
        Ok(Self {
            runtime: Some(runtime),
            normal_permits: Arc::new(Semaphore::new(max_concurrent_normal.max(1))),
        })
    }
}

impl Drop for TokioWorkerPool {
    fn drop(&mut self) {
        // the last owner may be one of our own worker threads, where a blocking shutdown would deadlock
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl WorkerPool for TokioWorkerPool {
    fn submit(&self, priority: TaskPriority, work: WorkItem) {
        let Some(runtime) = self.runtime.as_ref() else {
            log::error!("work submitted to a worker pool that has shut down");
            return;
        };
        match priority {
            TaskPriority::High => {
                runtime.spawn_blocking(work);
            }
            TaskPriority::Normal => {
                let permits = Arc::clone(&self.normal_permits);
                runtime.spawn(async move {
                    let permit = match permits.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            log::error!("worker pool closed before normal priority work could start");
                            return;
                        }
                    };
                    let result = tokio::task::spawn_blocking(move || {
                        let _permit = permit;
                        work()
                    })
                    .await;
                    if let Err(err) = result {
                        log::error!("normal priority work did not complete: {}", err);
                    }
                });
            }
        }
    }
}

/// Runs every submission to completion on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineWorkerPool;

impl WorkerPool for InlineWorkerPool {
    fn submit(&self, _priority: TaskPriority, work: WorkItem) {
        work()
    }
}

pub enum TaskPoll<T> {
    Pending,
    Ready(T),
    /// The producer went away without sending a result.
    Abandoned,
}

pub struct TaskOutput<T>(oneshot::Receiver<T>);

impl<T> TaskOutput<T> {
    pub fn channel() -> (oneshot::Sender<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self(rx))
    }

    /// Never blocks.
    pub fn poll(&mut self) -> TaskPoll<T> {
        match self.0.try_recv() {
            Ok(t) => TaskPoll::Ready(t),
            Err(oneshot::error::TryRecvError::Empty) => TaskPoll::Pending,
            Err(oneshot::error::TryRecvError::Closed) => TaskPoll::Abandoned,
        }
    }
}

/// Counting wakeup signal: each `notify_one` is consumed by exactly one waiter count.
#[derive(Debug, Default)]
pub struct CompletionSignal {
    count: Mutex<usize>,
    cond: Condvar,
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify_one(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_one();
    }

    /// Waits until `n` notifications arrived or the timeout expires, returning how many were consumed.
    pub fn wait_for(&self, n: usize, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count < n {
            if self.cond.wait_until(&mut count, deadline).timed_out() {
                break;
            }
        }
        let taken = (*count).min(n);
        *count -= taken;
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
    };

    fn wait_ready<T>(output: &mut TaskOutput<T>) -> Option<T> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            match output.poll() {
                TaskPoll::Ready(t) => return Some(t),
                TaskPoll::Abandoned => return None,
                TaskPoll::Pending => thread::sleep(Duration::from_millis(1)),
            }
        }
        None
    }

    #[test]
    fn inline_pool_runs_before_submit_returns() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = InlineWorkerPool;
        for priority in [TaskPriority::High, TaskPriority::Normal] {
            let counter = Arc::clone(&counter);
            pool.submit(priority, Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn tokio_pool_delivers_results_for_both_priorities() {
        let pool = TokioWorkerPool::new(2, 1).unwrap();
        let (high_tx, mut high) = TaskOutput::channel();
        let (normal_tx, mut normal) = TaskOutput::channel();
        pool.submit(TaskPriority::High, Box::new(move || {
            let _ = high_tx.send(1);
        }));
        pool.submit(TaskPriority::Normal, Box::new(move || {
            let _ = normal_tx.send(2);
        }));
        assert_eq!(wait_ready(&mut high), Some(1));
        assert_eq!(wait_ready(&mut normal), Some(2));
    }

    #[test]
    fn normal_work_can_wait_on_high_work() {
        let pool = Arc::new(TokioWorkerPool::new(2, 1).unwrap());
        let signal = Arc::new(CompletionSignal::new());
        let (tx, mut output) = TaskOutput::channel();
        pool.submit(TaskPriority::Normal, {
            let pool = Arc::clone(&pool);
            let signal = Arc::clone(&signal);
            Box::new(move || {
                for _ in 0..3 {
                    let signal = Arc::clone(&signal);
                    pool.submit(TaskPriority::High, Box::new(move || signal.notify_one()));
                }
                drop(pool);
                let _ = tx.send(signal.wait_for(3, Duration::from_secs(5)));
            })
        });
        assert_eq!(wait_ready(&mut output), Some(3));
    }

    #[test]
    fn dropped_sender_reports_abandoned() {
        let (tx, mut output) = TaskOutput::<u32>::channel();
        assert!(matches!(output.poll(), TaskPoll::Pending));
        drop(tx);
        assert!(matches!(output.poll(), TaskPoll::Abandoned));
    }

    #[test]
    fn completion_signal_counts_notifications() {
        let signal = Arc::new(CompletionSignal::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let signal = Arc::clone(&signal);
                thread::spawn(move || signal.notify_one())
            })
            .collect();
        assert_eq!(signal.wait_for(4, Duration::from_secs(5)), 4);
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn completion_signal_times_out_with_partial_count() {
        let signal = CompletionSignal::new();
        signal.notify_one();
        assert_eq!(signal.wait_for(2, Duration::from_millis(10)), 1);
        assert_eq!(signal.wait_for(1, Duration::from_millis(1)), 0);
    }
}
