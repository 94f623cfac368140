//! Named worker threads with a join-once handle.
//!
//! Workers are created in the `Prepared` phase and handed to the master thread, which starts
//! them and later reaps them. Completion and disposal are separate steps:
//!
//! `Prepared -> Running -> Finished -> Joined`
//!
//! A worker reaches `Finished` on its own when its body returns (or panics). It reaches `Joined`
//! only when its owner calls [`Worker::join`]. The master thread removes joined workers, and
//! finished workers whose handle was dropped without a join.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};

use crate::sync::{lock, panic_message, wait};

/// Lifecycle phase of a worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerPhase {
    Prepared,
    Running,
    Finished,
    Joined,
}

type WorkerBody = Box<dyn FnOnce() + Send + 'static>;

enum MasterEvent {
    Changed,
    Shutdown,
}

struct WorkerSlot {
    name: String,
    state: Mutex<SlotState>,
    finished: Condvar,
}

struct SlotState {
    phase: WorkerPhase,
    body: Option<WorkerBody>,
    thread: Option<JoinHandle<()>>,
    detached: bool,
}

impl WorkerSlot {
    fn mark_finished(&self) {
        let mut st = lock(&self.state);
        if st.phase == WorkerPhase::Running {
            st.phase = WorkerPhase::Finished;
        }
        drop(st);
        self.finished.notify_all();
    }

    fn is_reapable(&self) -> bool {
        let st = lock(&self.state);
        st.phase == WorkerPhase::Joined || (st.phase == WorkerPhase::Finished && st.detached)
    }
}

struct RuntimeInner {
    slots: Mutex<Vec<Arc<WorkerSlot>>>,
    events: Sender<MasterEvent>,
    stopped: AtomicBool,
}

impl RuntimeInner {
    /// Wake the master, or do its work inline once it has exited.
    fn changed(self: &Arc<Self>) {
        if self.stopped.load(Ordering::Acquire) {
            self.sweep();
        } else {
            let _ = self.events.send(MasterEvent::Changed);
        }
    }

    fn sweep(self: &Arc<Self>) {
        let mut reaped = Vec::new();
        {
            let mut slots = lock(&self.slots);
            for slot in slots.iter() {
                self.start_if_prepared(slot);
            }
            slots.retain(|slot| {
                if slot.is_reapable() {
                    reaped.push(slot.clone());
                    false
                } else {
                    true
                }
            });
        }
        for slot in reaped {
            let handle = lock(&slot.state).thread.take();
            if let Some(handle) = handle
                && handle.join().is_err()
            {
                tracing::warn!(worker = %slot.name, "worker thread exited abnormally");
            }
            tracing::trace!(worker = %slot.name, "worker reaped");
        }
    }

    fn start_if_prepared(&self, slot: &Arc<WorkerSlot>) {
        let mut st = lock(&slot.state);
        if st.phase != WorkerPhase::Prepared {
            return;
        }
        let Some(body) = st.body.take() else {
            return;
        };
        st.phase = WorkerPhase::Running;

        let thread_slot = slot.clone();
        let events = self.events.clone();
        let spawned = thread::Builder::new()
            .name(slot.name.clone())
            .spawn(move || {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(body)) {
                    tracing::error!(
                        worker = %thread_slot.name,
                        "worker panicked: {}",
                        panic_message(payload.as_ref())
                    );
                }
                thread_slot.mark_finished();
                let _ = events.send(MasterEvent::Changed);
            });

        match spawned {
            Ok(handle) => st.thread = Some(handle),
            Err(e) => {
                tracing::error!(worker = %slot.name, "failed to spawn worker thread: {e}");
                st.phase = WorkerPhase::Finished;
                slot.finished.notify_all();
            }
        }
    }
}

fn master_main(inner: Arc<RuntimeInner>, events: Receiver<MasterEvent>) {
    loop {
        inner.sweep();
        match events.recv() {
            Ok(MasterEvent::Changed) => {}
            Ok(MasterEvent::Shutdown) | Err(_) => break,
        }
    }
    inner.sweep();
    tracing::debug!("worker master exited");
}

/// Owner of the master thread and every worker spawned through it.
pub struct WorkerRuntime {
    inner: Arc<RuntimeInner>,
    master: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerRuntime {
    /// Spawn the master thread.
    pub fn start() -> Result<Self> {
        let (events, rx) = crossbeam_channel::unbounded();
        let inner = Arc::new(RuntimeInner {
            slots: Mutex::new(Vec::new()),
            events,
            stopped: AtomicBool::new(false),
        });
        let master_inner = inner.clone();
        let master = thread::Builder::new()
            .name("tonearm-master".to_string())
            .spawn(move || master_main(master_inner, rx))
            .context("spawn worker master thread")?;
        Ok(Self {
            inner,
            master: Mutex::new(Some(master)),
        })
    }

    /// Queue `body` to run on a new named thread.
    pub fn spawn<F>(&self, name: impl Into<String>, body: F) -> Worker
    where
        F: FnOnce() + Send + 'static,
    {
        let slot = Arc::new(WorkerSlot {
            name: name.into(),
            state: Mutex::new(SlotState {
                phase: WorkerPhase::Prepared,
                body: Some(Box::new(body)),
                thread: None,
                detached: false,
            }),
            finished: Condvar::new(),
        });
        lock(&self.inner.slots).push(slot.clone());
        tracing::trace!(worker = %slot.name, "worker prepared");
        self.inner.changed();
        Worker {
            slot,
            runtime: self.inner.clone(),
            joined: false,
        }
    }

    /// Workers not yet reaped.
    pub fn worker_count(&self) -> usize {
        lock(&self.inner.slots).len()
    }

    /// Stop the master and join every detached worker. Idempotent.
    ///
    /// Workers whose handle is still held stay the responsibility of their owner.
    pub fn shutdown(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.events.send(MasterEvent::Shutdown);
        if let Some(master) = lock(&self.master).take()
            && master.join().is_err()
        {
            tracing::error!("worker master panicked");
        }

        let detached: Vec<_> = lock(&self.inner.slots)
            .iter()
            .filter(|slot| lock(&slot.state).detached)
            .cloned()
            .collect();
        for slot in detached {
            let handle = lock(&slot.state).thread.take();
            if let Some(handle) = handle {
                tracing::debug!(worker = %slot.name, "joining detached worker at shutdown");
                let _ = handle.join();
            }
        }
        self.inner.sweep();
    }
}

impl Drop for WorkerRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Join-once handle to a spawned worker.
///
/// Dropping the handle without joining detaches the worker: it keeps running and is reaped by
/// the master once finished.
pub struct Worker {
    slot: Arc<WorkerSlot>,
    runtime: Arc<RuntimeInner>,
    joined: bool,
}

impl Worker {
    pub fn name(&self) -> &str {
        &self.slot.name
    }

    pub fn phase(&self) -> WorkerPhase {
        lock(&self.slot.state).phase
    }

    /// Whether the caller is running on this worker's thread.
    pub fn is_current_thread(&self) -> bool {
        let current = thread::current().id();
        lock(&self.slot.state)
            .thread
            .as_ref()
            .is_some_and(|handle| handle.thread().id() == current)
    }

    /// Block until the body has returned, then hand the worker to the master for reaping.
    pub fn join(mut self) {
        if self.is_current_thread() {
            tracing::warn!(worker = %self.slot.name, "worker cannot join itself; detaching");
            return;
        }
        let mut st = lock(&self.slot.state);
        while matches!(st.phase, WorkerPhase::Prepared | WorkerPhase::Running) {
            st = wait(&self.slot.finished, st);
        }
        st.phase = WorkerPhase::Joined;
        drop(st);
        self.joined = true;
        self.runtime.changed();
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.joined {
            return;
        }
        let mut st = lock(&self.slot.state);
        st.detached = true;
        let phase = st.phase;
        drop(st);
        if phase != WorkerPhase::Finished {
            tracing::warn!(worker = %self.slot.name, ?phase, "worker dropped without join");
        }
        self.runtime.changed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::wait_until;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn join_waits_for_body_and_worker_is_reaped() {
        let runtime = WorkerRuntime::start().expect("runtime");
        let done = Arc::new(AtomicBool::new(false));
        let done_worker = done.clone();
        let worker = runtime.spawn("sleepy", move || {
            thread::sleep(Duration::from_millis(20));
            done_worker.store(true, Ordering::SeqCst);
        });
        assert_eq!(worker.name(), "sleepy");
        worker.join();
        assert!(done.load(Ordering::SeqCst));
        assert!(wait_until(|| runtime.worker_count() == 0));
    }

    #[test]
    fn phase_moves_to_finished_on_its_own() {
        let runtime = WorkerRuntime::start().expect("runtime");
        let worker = runtime.spawn("quick", || {});
        assert!(wait_until(|| worker.phase() == WorkerPhase::Finished));
        // Not reaped until joined.
        assert_eq!(runtime.worker_count(), 1);
        worker.join();
        assert!(wait_until(|| runtime.worker_count() == 0));
    }

    #[test]
    fn dropped_worker_is_reaped_once_finished() {
        let runtime = WorkerRuntime::start().expect("runtime");
        let (tx, rx) = mpsc::channel::<()>();
        let worker = runtime.spawn("detached", move || {
            let _ = rx.recv();
        });
        drop(worker);
        assert_eq!(runtime.worker_count(), 1);
        tx.send(()).expect("send");
        assert!(wait_until(|| runtime.worker_count() == 0));
    }

    #[test]
    fn panicking_body_still_finishes() {
        let runtime = WorkerRuntime::start().expect("runtime");
        let worker = runtime.spawn("boom", || panic!("worker failure"));
        worker.join();
        assert!(wait_until(|| runtime.worker_count() == 0));
    }

    #[test]
    fn shutdown_joins_detached_workers() {
        let runtime = WorkerRuntime::start().expect("runtime");
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let ran = ran.clone();
            drop(runtime.spawn("bg", move || {
                thread::sleep(Duration::from_millis(10));
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
        runtime.shutdown();
        assert_eq!(ran.load(Ordering::SeqCst), 4);
        assert_eq!(runtime.worker_count(), 0);
    }

    #[test]
    fn spawn_after_shutdown_still_runs() {
        let runtime = WorkerRuntime::start().expect("runtime");
        runtime.shutdown();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_worker = ran.clone();
        runtime
            .spawn("late", move || ran_worker.store(true, Ordering::SeqCst))
            .join();
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(runtime.worker_count(), 0);
    }
}
