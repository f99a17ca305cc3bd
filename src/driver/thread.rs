//! Managed-thread lifecycle.
//!
//! Both driver threads follow the same three-state protocol: they are
//! spawned parked in `Initializing`, run their loop body only while
//! `Running`, and exit once they observe `Terminating`. The transition out
//! of `Initializing` is made by the driver (`start`/teardown), never by the
//! thread itself.

use std::sync::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ThreadState {
    Initializing,
    Running,
    Terminating,
}

pub(crate) struct ThreadCtl {
    state: Mutex<ThreadState>,
    cond: Condvar,
}

impl ThreadCtl {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ThreadState::Initializing),
            cond: Condvar::new(),
        }
    }

    pub fn state(&self) -> ThreadState {
        *self.state.lock().expect("thread state mutex poisoned")
    }

    pub fn is_running(&self) -> bool {
        self.state() == ThreadState::Running
    }

    pub fn set(&self, state: ThreadState) {
        *self.state.lock().expect("thread state mutex poisoned") = state;
        self.cond.notify_all();
    }

    /// Park until the driver moves the thread out of `Initializing`;
    /// returns the state it moved to.
    pub fn wait_leave_initializing(&self) -> ThreadState {
        let mut state = self.state.lock().expect("thread state mutex poisoned");
        while *state == ThreadState::Initializing {
            state = self
                .cond
                .wait(state)
                .expect("thread state mutex poisoned");
        }
        *state
    }
}

/// Auto-reset event in the style of a binary semaphore: `signal` makes
/// exactly one future (or one pending) `wait` return.
pub(crate) struct Event {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn signal(&self) {
        *self.signaled.lock().expect("event mutex poisoned") = true;
        self.cond.notify_one();
    }

    /// Block until signalled, consuming the signal.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock().expect("event mutex poisoned");
        while !*signaled {
            signaled = self.cond.wait(signaled).expect("event mutex poisoned");
        }
        *signaled = false;
    }
}
