//! Single-consumer work queue running on a [`WorkerRuntime`] worker.
//!
//! Producers [`enqueue`](QueueThread::enqueue) items from any thread. The consumer wakes, takes
//! the whole pending list in one swap and hands it to a [`BatchProcessor`] as one batch.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::thread::{self, ThreadId};

use crate::sync::{lock, panic_message, wait};
use crate::worker::{Worker, WorkerRuntime};

/// Handles one batch of queued items on the consumer thread.
pub trait BatchProcessor<T>: Send + 'static {
    fn process(&mut self, batch: Vec<T>);
}

struct QueueState<T> {
    pending: Vec<T>,
    processing: bool,
    finish: bool,
}

struct QueueShared<T> {
    name: String,
    state: Mutex<QueueState<T>>,
    changed: Condvar,
    idle: Condvar,
    consumer: OnceLock<ThreadId>,
}

impl<T> QueueShared<T> {
    fn is_consumer_thread(&self) -> bool {
        self.consumer.get() == Some(&thread::current().id())
    }

    fn enqueue(&self, item: T) {
        let mut st = lock(&self.state);
        if st.finish {
            tracing::debug!(queue = %self.name, "enqueue after finish; item dropped");
            return;
        }
        st.pending.push(item);
        drop(st);
        self.changed.notify_one();
    }
}

/// Cloneable producer side of a [`QueueThread`].
pub struct QueueHandle<T> {
    shared: Arc<QueueShared<T>>,
}

impl<T> Clone for QueueHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> QueueHandle<T> {
    pub fn enqueue(&self, item: T) {
        self.shared.enqueue(item);
    }
}

/// Proof that the queue was empty and idle. No new batch starts while it is held.
pub struct QueueIdle<'a, T> {
    _state: MutexGuard<'a, QueueState<T>>,
}

/// Typed work queue with a dedicated consumer thread.
pub struct QueueThread<T: Send + 'static> {
    shared: Arc<QueueShared<T>>,
    worker: Mutex<Option<Worker>>,
}

impl<T: Send + 'static> QueueThread<T> {
    /// Spawn the consumer on `runtime` and start accepting items.
    pub fn start<P>(runtime: &WorkerRuntime, name: &str, processor: P) -> Self
    where
        P: BatchProcessor<T>,
    {
        let shared = Arc::new(QueueShared {
            name: name.to_string(),
            state: Mutex::new(QueueState {
                pending: Vec::new(),
                processing: false,
                finish: false,
            }),
            changed: Condvar::new(),
            idle: Condvar::new(),
            consumer: OnceLock::new(),
        });
        let consumer_shared = shared.clone();
        let worker = runtime.spawn(name, move || consumer_main(consumer_shared, processor));
        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn enqueue(&self, item: T) {
        self.shared.enqueue(item);
    }

    pub fn handle(&self) -> QueueHandle<T> {
        QueueHandle {
            shared: self.shared.clone(),
        }
    }

    /// Whether the caller is this queue's consumer thread.
    pub fn is_consumer_thread(&self) -> bool {
        self.shared.is_consumer_thread()
    }

    /// Block until nothing is pending and no batch is being processed.
    ///
    /// Called from the consumer thread itself this returns at once, since waiting there would
    /// never finish.
    pub fn wait_empty(&self) -> QueueIdle<'_, T> {
        let mut st = lock(&self.shared.state);
        if self.shared.is_consumer_thread() {
            return QueueIdle { _state: st };
        }
        while !st.pending.is_empty() || st.processing {
            st = wait(&self.shared.idle, st);
        }
        QueueIdle { _state: st }
    }

    /// Drain what is pending, stop the consumer and join it. Idempotent.
    pub fn finish(&self) {
        {
            let mut st = lock(&self.shared.state);
            st.finish = true;
        }
        self.shared.changed.notify_all();

        let Some(worker) = lock(&self.worker).take() else {
            return;
        };
        if worker.is_current_thread() {
            tracing::warn!(queue = %self.shared.name, "queue finished from its own consumer");
            drop(worker);
            return;
        }
        worker.join();
        tracing::debug!(queue = %self.shared.name, "queue thread finished");
    }
}

impl<T: Send + 'static> Drop for QueueThread<T> {
    fn drop(&mut self) {
        self.finish();
    }
}

fn consumer_main<T, P: BatchProcessor<T>>(shared: Arc<QueueShared<T>>, mut processor: P) {
    let _ = shared.consumer.set(thread::current().id());
    loop {
        let batch = {
            let mut st = lock(&shared.state);
            while st.pending.is_empty() && !st.finish {
                st = wait(&shared.changed, st);
            }
            if st.pending.is_empty() {
                break;
            }
            st.processing = true;
            std::mem::take(&mut st.pending)
        };

        let size = batch.len();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| processor.process(batch))) {
            tracing::error!(
                queue = %shared.name,
                batch = size,
                "batch processor panicked: {}",
                panic_message(payload.as_ref())
            );
        }

        let mut st = lock(&shared.state);
        st.processing = false;
        if st.pending.is_empty() {
            shared.idle.notify_all();
        }
    }
    let mut st = lock(&shared.state);
    st.processing = false;
    drop(st);
    shared.idle.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    struct Recorder {
        batches: Arc<Mutex<Vec<Vec<u32>>>>,
        gate: Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>,
    }

    impl BatchProcessor<u32> for Recorder {
        fn process(&mut self, batch: Vec<u32>) {
            if batch.contains(&0) {
                if let Some((started, go)) = self.gate.take() {
                    let _ = started.send(());
                    let _ = go.recv();
                }
            }
            if batch.contains(&13) {
                panic!("unlucky batch");
            }
            lock(&self.batches).push(batch);
        }
    }

    fn recorder(gated: bool) -> (Recorder, Arc<Mutex<Vec<Vec<u32>>>>, Option<(mpsc::Receiver<()>, mpsc::Sender<()>)>) {
        let batches = Arc::new(Mutex::new(Vec::new()));
        if gated {
            let (started_tx, started_rx) = mpsc::channel();
            let (go_tx, go_rx) = mpsc::channel();
            (
                Recorder {
                    batches: batches.clone(),
                    gate: Some((started_tx, go_rx)),
                },
                batches,
                Some((started_rx, go_tx)),
            )
        } else {
            (
                Recorder {
                    batches: batches.clone(),
                    gate: None,
                },
                batches,
                None,
            )
        }
    }

    #[test]
    fn items_queued_during_a_batch_arrive_as_one_batch() {
        let runtime = WorkerRuntime::start().expect("runtime");
        let (proc, batches, gate) = recorder(true);
        let Some((started, go)) = gate else {
            unreachable!()
        };
        let queue = QueueThread::start(&runtime, "test-queue", proc);

        queue.enqueue(0);
        started.recv().expect("consumer started");
        for i in 1..=4 {
            queue.enqueue(i);
        }
        go.send(()).expect("release");
        drop(queue.wait_empty());

        let batches = lock(&batches).clone();
        assert_eq!(batches, vec![vec![0], vec![1, 2, 3, 4]]);
    }

    #[test]
    fn wait_empty_returns_after_all_batches() {
        let runtime = WorkerRuntime::start().expect("runtime");
        let (proc, batches, _) = recorder(false);
        let queue = QueueThread::start(&runtime, "test-queue", proc);
        let handle = queue.handle();
        for i in 1..=100 {
            handle.enqueue(i);
        }
        drop(queue.wait_empty());
        let total: usize = lock(&batches).iter().map(Vec::len).sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn panicking_batch_does_not_stop_the_consumer() {
        let runtime = WorkerRuntime::start().expect("runtime");
        let (proc, batches, _) = recorder(false);
        let queue = QueueThread::start(&runtime, "test-queue", proc);
        queue.enqueue(13);
        drop(queue.wait_empty());
        queue.enqueue(7);
        drop(queue.wait_empty());
        assert_eq!(lock(&batches).clone(), vec![vec![7]]);
    }

    #[test]
    fn finish_drains_pending_and_rejects_new_items() {
        let runtime = WorkerRuntime::start().expect("runtime");
        let (proc, batches, _) = recorder(false);
        let queue = QueueThread::start(&runtime, "test-queue", proc);
        for i in 1..=10 {
            queue.enqueue(i);
        }
        queue.finish();
        queue.enqueue(99);
        queue.finish();
        let all: Vec<u32> = lock(&batches).iter().flatten().copied().collect();
        assert_eq!(all, (1..=10).collect::<Vec<_>>());
    }
}
