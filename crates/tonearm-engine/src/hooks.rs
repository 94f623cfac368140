//! Event hooks: components subscribe to engine events and are called off the publishing thread.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tonearm_types::{Event, EventKind};

use crate::component::ComponentId;
use crate::queue_thread::{BatchProcessor, QueueThread};
use crate::sync::{lock, panic_message};
use crate::worker::WorkerRuntime;

pub type Hook = Arc<dyn Fn(&Event) + Send + Sync>;

/// Identifies one installation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HookId(u64);

struct InstalledHook {
    id: HookId,
    owner: ComponentId,
    kind: EventKind,
    hook: Hook,
}

#[derive(Default)]
struct HookTable {
    installed: Mutex<Vec<InstalledHook>>,
    // Held for the whole delivery of one event.
    dispatch: Mutex<()>,
    next_id: AtomicU64,
}

impl HookTable {
    fn is_installed(&self, id: HookId) -> bool {
        lock(&self.installed).iter().any(|h| h.id == id)
    }

    fn deliver(&self, event: &Event) {
        let _in_flight = lock(&self.dispatch);
        let targets: Vec<(HookId, Hook)> = lock(&self.installed)
            .iter()
            .filter(|h| h.kind == event.kind())
            .map(|h| (h.id, h.hook.clone()))
            .collect();

        for (id, hook) in targets {
            // A hook may uninstall its owner's hooks (or others) mid-delivery.
            if !self.is_installed(id) {
                continue;
            }
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| hook(event))) {
                tracing::error!(
                    hook = id.0,
                    event = ?event.kind(),
                    "hook panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
    }
}

struct HookDelivery {
    table: Arc<HookTable>,
}

impl BatchProcessor<Event> for HookDelivery {
    fn process(&mut self, batch: Vec<Event>) {
        for event in batch {
            self.table.deliver(&event);
        }
    }
}

/// Registry of `(owner, event kind, callback)` triples with asynchronous delivery.
///
/// Events are delivered in publish order; hooks for one event run in install order, each at
/// most once. A panicking hook is logged and does not affect the others.
pub struct HookDispatcher {
    table: Arc<HookTable>,
    queue: QueueThread<Event>,
}

impl HookDispatcher {
    pub fn start(runtime: &WorkerRuntime) -> Self {
        let table = Arc::new(HookTable::default());
        let queue = QueueThread::start(
            runtime,
            "tonearm-hooks",
            HookDelivery {
                table: table.clone(),
            },
        );
        Self { table, queue }
    }

    pub fn install<F>(&self, owner: ComponentId, kind: EventKind, hook: F) -> HookId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = HookId(self.table.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.table.installed).push(InstalledHook {
            id,
            owner,
            kind,
            hook: Arc::new(hook),
        });
        tracing::trace!(%owner, ?kind, hook = id.0, "hook installed");
        id
    }

    /// Remove every hook installed by `owner`.
    ///
    /// Waits for an in-flight delivery to complete, so no hook of `owner` runs after this
    /// returns. From a hook (the dispatcher thread) the removal is immediate.
    pub fn uninstall_all(&self, owner: ComponentId) -> usize {
        let _in_flight = if self.queue.is_consumer_thread() {
            None
        } else {
            Some(lock(&self.table.dispatch))
        };
        let mut installed = lock(&self.table.installed);
        let before = installed.len();
        installed.retain(|h| h.owner != owner);
        let removed = before - installed.len();
        if removed > 0 {
            tracing::debug!(%owner, removed, "hooks uninstalled");
        }
        removed
    }

    pub fn installed_count(&self) -> usize {
        lock(&self.table.installed).len()
    }

    /// Queue `event` for delivery and return immediately.
    pub fn publish(&self, event: Event) {
        tracing::trace!(?event, "event published");
        self.queue.enqueue(event);
    }

    /// Block until every event published so far has been delivered.
    pub fn flush(&self) {
        drop(self.queue.wait_empty());
    }

    /// Deliver what is queued and stop the dispatcher thread.
    pub fn shutdown(&self) {
        self.queue.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonearm_types::PlaybackState;

    fn song(to: usize) -> Event {
        Event::SongChange { from: None, to }
    }

    #[test]
    fn hooks_run_in_install_order_for_matching_kind() {
        let runtime = WorkerRuntime::start().expect("runtime");
        let hooks = HookDispatcher::start(&runtime);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let owner = ComponentId::next();

        for tag in ["first", "second"] {
            let seen = seen.clone();
            hooks.install(owner, EventKind::SongChange, move |ev| {
                lock(&seen).push(format!("{tag}:{ev:?}"));
            });
        }
        let seen_playback = seen.clone();
        hooks.install(owner, EventKind::PlaybackChange, move |_| {
            lock(&seen_playback).push("playback".to_string());
        });

        hooks.publish(song(1));
        hooks.flush();

        let seen = lock(&seen).clone();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].starts_with("first:"));
        assert!(seen[1].starts_with("second:"));
    }

    #[test]
    fn uninstall_all_only_removes_owner() {
        let runtime = WorkerRuntime::start().expect("runtime");
        let hooks = HookDispatcher::start(&runtime);
        let a = ComponentId::next();
        let b = ComponentId::next();
        let count = Arc::new(AtomicU64::new(0));
        for owner in [a, a, b] {
            let count = count.clone();
            hooks.install(owner, EventKind::SongChange, move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(hooks.uninstall_all(a), 2);
        assert_eq!(hooks.installed_count(), 1);

        hooks.publish(song(0));
        hooks.flush();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_hook_does_not_block_others() {
        let runtime = WorkerRuntime::start().expect("runtime");
        let hooks = HookDispatcher::start(&runtime);
        let owner = ComponentId::next();
        let hit = Arc::new(AtomicU64::new(0));
        hooks.install(owner, EventKind::PlaybackChange, |_| panic!("bad hook"));
        let hit_hook = hit.clone();
        hooks.install(owner, EventKind::PlaybackChange, move |_| {
            hit_hook.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..3 {
            hooks.publish(Event::PlaybackChange {
                from: PlaybackState::Stopped,
                to: PlaybackState::Playing,
            });
        }
        hooks.flush();
        assert_eq!(hit.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn hook_can_uninstall_its_owner_mid_delivery() {
        let runtime = WorkerRuntime::start().expect("runtime");
        let hooks = Arc::new(HookDispatcher::start(&runtime));
        let owner = ComponentId::next();
        let hit = Arc::new(AtomicU64::new(0));

        let weak = Arc::downgrade(&hooks);
        hooks.install(owner, EventKind::SongChange, move |_| {
            if let Some(hooks) = weak.upgrade() {
                hooks.uninstall_all(owner);
            }
        });
        let hit_hook = hit.clone();
        hooks.install(owner, EventKind::SongChange, move |_| {
            hit_hook.fetch_add(1, Ordering::SeqCst);
        });

        hooks.publish(song(2));
        hooks.flush();
        assert_eq!(hit.load(Ordering::SeqCst), 0);
        assert_eq!(hooks.installed_count(), 0);
    }
}
