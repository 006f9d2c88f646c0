//! Cooperative pause / resume / stop signalling for long-running loops.
//!
//! A loop that wants to be interruptible registers its thread and calls
//! [`should_continue`] at safe points. Other threads signal it by [`ThreadId`].
//! Nothing here can interrupt a loop that never asks.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::LazyLock;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

/// Signal state of a registered thread.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunState {
    /// Keep iterating.
    Running,
    /// Block at the next safe point until resumed or stopped.
    Paused,
    /// Stop at the next safe point.
    Stopped,
}

struct Registration {
    state: RunState,
    depth: usize,
}

struct Registry {
    threads: Mutex<HashMap<ThreadId, Registration>>,
    changed: Condvar,
}

static REGISTRY: LazyLock<Registry> = LazyLock::new(|| Registry {
    threads: Mutex::new(HashMap::new()),
    changed: Condvar::new(),
});

/// Unregisters the owning thread when dropped.
#[must_use = "dropping the guard unregisters the thread immediately"]
#[derive(Debug)]
pub struct RunLoopGuard {
    thread: ThreadId,
    // Unregistration must happen on the registering thread.
    _not_send: PhantomData<*const ()>,
}

impl RunLoopGuard {
    /// The thread this guard registered.
    pub fn thread_id(&self) -> ThreadId {
        self.thread
    }
}

impl Drop for RunLoopGuard {
    fn drop(&mut self) {
        let mut threads = REGISTRY.threads.lock();
        let Some(reg) = threads.get_mut(&self.thread) else {
            return;
        };
        reg.depth = reg.depth.saturating_sub(1);
        if reg.depth == 0 {
            threads.remove(&self.thread);
            REGISTRY.changed.notify_all();
            tracing::debug!(thread = ?self.thread, "run loop: thread unregistered");
        }
    }
}

/// Register the calling thread.
///
/// A thread that is not registered yet starts in [`RunState::Running`]. Guards nest:
/// an inner registration keeps the current state, and the thread stays registered
/// until its outermost guard is dropped.
pub fn register_thread() -> RunLoopGuard {
    let thread = thread::current().id();
    let mut threads = REGISTRY.threads.lock();
    let reg = threads.entry(thread).or_insert(Registration {
        state: RunState::Running,
        depth: 0,
    });
    reg.depth += 1;
    tracing::debug!(?thread, depth = reg.depth, "run loop: thread registered");
    RunLoopGuard {
        thread,
        _not_send: PhantomData,
    }
}

/// Unregister the calling thread whatever its nesting depth. A no-op if it was not
/// registered.
pub fn unregister_thread() {
    let thread = thread::current().id();
    if REGISTRY.threads.lock().remove(&thread).is_some() {
        REGISTRY.changed.notify_all();
        tracing::debug!(?thread, "run loop: thread unregistered");
    }
}

/// Whether the calling thread should keep iterating.
///
/// Unregistered threads always continue. A paused thread is suspended here until
/// it is resumed (`true`) or stopped (`false`).
pub fn should_continue() -> bool {
    let me = thread::current().id();
    let mut threads = REGISTRY.threads.lock();
    loop {
        match threads.get(&me).map(|reg| reg.state) {
            None | Some(RunState::Running) => return true,
            Some(RunState::Stopped) => return false,
            Some(RunState::Paused) => REGISTRY.changed.wait(&mut threads),
        }
    }
}

fn signal(thread: ThreadId, apply: impl FnOnce(RunState) -> RunState) -> bool {
    let mut threads = REGISTRY.threads.lock();
    let Some(state) = threads.get_mut(&thread).map(|reg| &mut reg.state) else {
        return false;
    };
    let next = apply(*state);
    if next != *state {
        tracing::debug!(?thread, from = ?*state, to = ?next, "run loop: state change");
        *state = next;
        REGISTRY.changed.notify_all();
    }
    true
}

/// Ask `thread` to pause at its next safe point. Returns `false` if not registered.
///
/// A stopped thread stays stopped.
pub fn request_pause(thread: ThreadId) -> bool {
    signal(thread, |s| match s {
        RunState::Running => RunState::Paused,
        other => other,
    })
}

/// Let a paused `thread` continue. Returns `false` if not registered.
pub fn request_resume(thread: ThreadId) -> bool {
    signal(thread, |s| match s {
        RunState::Paused => RunState::Running,
        other => other,
    })
}

/// Ask `thread` to stop at its next safe point. Returns `false` if not registered.
pub fn request_stop(thread: ThreadId) -> bool {
    signal(thread, |_| RunState::Stopped)
}

/// Current signal state of `thread`, if registered.
pub fn state_of(thread: ThreadId) -> Option<RunState> {
    REGISTRY.threads.lock().get(&thread).map(|reg| reg.state)
}

/// Number of currently registered threads.
pub fn registered_threads() -> usize {
    REGISTRY.threads.lock().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn unregistered_threads_always_continue() {
        unregister_thread();
        assert!(should_continue());
        assert!(!request_stop(thread::current().id()));
    }

    #[test]
    fn stop_is_sticky_until_the_outermost_guard_drops() {
        let outer = register_thread();
        let me = outer.thread_id();
        assert_eq!(state_of(me), Some(RunState::Running));
        assert!(should_continue());

        assert!(request_stop(me));
        assert!(!should_continue());
        assert!(request_pause(me));
        assert_eq!(state_of(me), Some(RunState::Stopped));

        let inner = register_thread();
        assert!(!should_continue());
        drop(inner);
        assert_eq!(state_of(me), Some(RunState::Stopped));

        drop(outer);
        assert_eq!(state_of(me), None);

        let fresh = register_thread();
        assert!(should_continue());
        drop(fresh);
    }

    #[test]
    fn nested_guard_keeps_the_outer_registration() {
        let outer = register_thread();
        let me = outer.thread_id();
        drop(register_thread());
        assert_eq!(state_of(me), Some(RunState::Running));
        assert!(request_stop(me));
        assert!(!should_continue());

        unregister_thread();
        assert_eq!(state_of(me), None);
        drop(outer);
        assert!(should_continue());
    }

    #[test]
    fn paused_loop_blocks_until_resumed() {
        let (id_tx, id_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let worker = thread::spawn(move || {
            let _guard = register_thread();
            id_tx.send(thread::current().id()).unwrap();
            let mut iterations = 0_u32;
            while should_continue() {
                iterations += 1;
                if iterations == 1 {
                    done_tx.send(()).unwrap();
                }
                thread::sleep(Duration::from_millis(1));
            }
            iterations
        });

        let id = id_rx.recv().unwrap();
        done_rx.recv().unwrap();
        assert!(request_pause(id));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(state_of(id), Some(RunState::Paused));
        assert!(request_resume(id));
        thread::sleep(Duration::from_millis(5));
        assert!(request_stop(id));

        let iterations = worker.join().unwrap();
        assert!(iterations >= 1);
        assert_eq!(state_of(id), None);
    }

    #[test]
    fn stop_releases_a_paused_thread() {
        let (id_tx, id_rx) = mpsc::channel();
        let (paused_tx, paused_rx) = mpsc::channel::<()>();
        let worker = thread::spawn(move || {
            let _guard = register_thread();
            id_tx.send(thread::current().id()).unwrap();
            paused_rx.recv().unwrap();
            should_continue()
        });

        let id = id_rx.recv().unwrap();
        assert!(request_pause(id));
        paused_tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(request_stop(id));
        assert!(!worker.join().unwrap());
    }
}
