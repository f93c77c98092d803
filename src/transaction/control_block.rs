// Copyright 2025-2026 txcell Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};

#[cfg(test)]
use crate::test::{terminates, terminates_async};

/// Callback registered on a `TVar` to resume a blocked transaction.
///
/// Callbacks only flip a flag and poke a condvar; they never run user code.
pub(crate) type WakeCallback = Arc<dyn Fn() + Send + Sync>;

struct WaiterState {
    /// An observed var has changed since the last `wait`.
    signaled: bool,

    /// The transaction finished or was aborted. Notifications arriving
    /// afterwards are dropped.
    done: bool,
}

/// The blocking monitor of one top-level transaction.
///
/// A transaction that hit `retry` registers a callback on every var it read
/// and then waits here. Writers that commit one of those vars fire the
/// callback, which calls `notify`.
///
/// Be careful when using this, because you can easily create deadlocks.
pub(crate) struct TxWaiter {
    state: Mutex<WaiterState>,

    /// Condition variable used for pausing and waking the thread.
    wait_cvar: Condvar,
}

impl TxWaiter {
    pub fn new() -> TxWaiter {
        TxWaiter {
            state: Mutex::new(WaiterState {
                signaled: false,
                done: false,
            }),
            wait_cvar: Condvar::new(),
        }
    }

    /// Inform the waiter that a var it observed has changed.
    ///
    /// Called from wake-up callbacks, outside of any transaction. A no-op
    /// once the transaction is done.
    pub fn notify(&self) {
        let mut state = self.state.lock();
        if state.done {
            return;
        }
        state.signaled = true;
        self.wait_cvar.notify_one();
    }

    /// Block until a var has changed, then consume the notification.
    ///
    /// May return immediately when a notification arrived between wake-up
    /// registration and this call.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        while !state.signaled && !state.done {
            self.wait_cvar.wait(&mut state);
        }
        state.signaled = false;
    }

    /// Mark the transaction as finished or cancelled.
    ///
    /// Registrations that are still sitting on vars become inert; whichever
    /// writer drains them later fires callbacks that do nothing.
    pub fn complete(&self) {
        let mut state = self.state.lock();
        state.done = true;
        self.wait_cvar.notify_one();
    }
}

type WakeJob = Box<dyn FnOnce() + Send>;

/// Process-wide worker that runs drained wake-up callbacks.
///
/// Committing threads must not run callbacks inline; they hand them over
/// here so the commit path stays short and no callback ever executes while
/// a lock is held.
struct WakeExecutor {
    sender: Mutex<Sender<WakeJob>>,
}

impl WakeExecutor {
    fn start() -> WakeExecutor {
        let (sender, receiver) = mpsc::channel::<WakeJob>();
        thread::Builder::new()
            .name("txcell-wakeup".into())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    job();
                }
            })
            .expect("txcell: cannot spawn wake-up thread");
        WakeExecutor {
            sender: Mutex::new(sender),
        }
    }

    fn submit(&self, job: WakeJob) {
        // The receiver lives for the rest of the process, so a send only
        // fails if the worker itself died.
        let _ = self.sender.lock().send(job);
    }
}

static WAKE_EXECUTOR: Lazy<WakeExecutor> = Lazy::new(WakeExecutor::start);

/// Submit a drained wake-up callback for asynchronous execution.
pub(crate) fn submit_wakeup(callback: WakeCallback) {
    WAKE_EXECUTOR.submit(Box::new(move || (*callback)()));
}

// TESTS

/// A fresh waiter blocks on `wait`.
#[test]
fn test_wait_blocks() {
    let waiter = TxWaiter::new();
    assert!(!terminates(100, move || waiter.wait()));
}

/// A waiter immediately returns when it was notified before waiting.
///
/// This happens when a var changes while the transaction is still
/// registering on other vars.
#[test]
fn test_wait_after_notify() {
    let waiter = TxWaiter::new();
    waiter.notify();
    assert!(terminates(50, move || waiter.wait()));
}

/// Multiple notifications coalesce into one wake-up.
#[test]
fn test_wait_after_multiple_notifies() {
    let waiter = TxWaiter::new();
    waiter.notify();
    waiter.notify();
    waiter.notify();
    assert!(terminates(50, move || waiter.wait()));
}

/// `wait` consumes the notification, so a second `wait` blocks again.
#[test]
fn test_wait_consumes_notification() {
    let waiter = TxWaiter::new();
    waiter.notify();
    assert!(!terminates(100, move || {
        waiter.wait();
        waiter.wait();
    }));
}

/// Notifications after completion are dropped.
#[test]
fn test_notify_after_complete_is_inert() {
    let waiter = TxWaiter::new();
    waiter.complete();
    waiter.notify();
    assert!(!waiter.state.lock().signaled);
}

/// Perform a wake-up from another thread.
#[test]
fn test_wait_threaded_wakeup() {
    let waiter = Arc::new(TxWaiter::new());
    let remote = waiter.clone();
    let terminated = terminates_async(500, move || waiter.wait(), move || remote.notify());

    assert!(terminated);
}

/// The executor runs submitted callbacks on its own thread.
#[test]
fn test_executor_runs_callback() {
    let waiter = Arc::new(TxWaiter::new());
    let target = waiter.clone();
    let callback: WakeCallback = Arc::new(move || target.notify());

    submit_wakeup(callback);

    assert!(terminates_async(500, move || waiter.wait(), || {}));
}
