// Copyright 2025-2026 txcell Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

pub(crate) mod control_block;
pub(crate) mod entry;

use std::cell::Cell;
use std::collections::btree_map::Entry as MapEntry;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use self::control_block::{TxWaiter, WakeCallback};
use self::entry::{ArcAny, Entry};
use super::result::{AnyExit, StmExit};
use super::stm::{downcast_box, run, Prog, Stm};
use super::tvar::VarControlBlock;

/// Stable identity of one top-level transaction.
///
/// Assigned once per `atomically` call from a process-wide monotonic
/// counter; conflict re-runs and retry suspensions keep the id, which is
/// what keys the wake-up registrations on vars.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxId(u64);

static NEXT_TX_ID: AtomicU64 = AtomicU64::new(0);

impl TxId {
    pub(crate) fn next() -> TxId {
        TxId(NEXT_TX_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric form of the id.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Process-wide commit lock.
///
/// Held only for the validate-and-publish critical section of writers and
/// for the validation instant of read-only transactions. No user code and
/// no wake-up callback ever runs while it is held, which bounds the
/// critical section to the size of the journal.
static COMMIT_LOCK: Mutex<()> = Mutex::new(());

/// Classification of a finished attempt's journal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum JournalState {
    /// Some var changed under the attempt; the outcome is meaningless.
    Invalid,
    /// All entries valid, at least one write to publish.
    ReadWrite,
    /// All entries valid, nothing to publish.
    ReadOnly,
}

/// The journal tracks all vars an attempt has read or written.
///
/// Each attempt owns its journal exclusively; journals are never shared
/// between threads. Keys are the vars' control blocks, compared by address,
/// so the same var always maps to the same entry no matter through which
/// `TVar` handle it was touched.
pub(crate) struct Journal {
    entries: BTreeMap<Arc<VarControlBlock>, Entry>,
}

fn entry_valid(var: &Arc<VarControlBlock>, entry: &Entry) -> bool {
    Arc::ptr_eq(&entry.expected, &*var.value.read())
}

impl Journal {
    fn new() -> Journal {
        Journal {
            entries: BTreeMap::new(),
        }
    }

    /// Read a var through the journal.
    ///
    /// The first touch records the var's current container as the version
    /// this attempt expects; later touches never downgrade that
    /// expectation. The returned value reflects local writes.
    pub fn read_var(&mut self, var: &Arc<VarControlBlock>) -> ArcAny {
        match self.entries.entry(var.clone()) {
            MapEntry::Occupied(mut occupied) => occupied.get_mut().read(),
            MapEntry::Vacant(vacant) => {
                let current = var.value.read().clone();
                vacant.insert(Entry::first_touch(current)).read()
            }
        }
    }

    /// Write a var through the journal.
    ///
    /// The write stays local to this attempt until commit publishes it.
    pub fn write_var(&mut self, var: &Arc<VarControlBlock>, value: ArcAny) {
        match self.entries.entry(var.clone()) {
            MapEntry::Occupied(mut occupied) => occupied.get_mut().write(value),
            MapEntry::Vacant(vacant) => {
                let current = var.value.read().clone();
                vacant.insert(Entry::first_touch(current)).write(value);
            }
        }
    }

    /// Record a var created by the running attempt.
    pub fn insert_new(&mut self, var: Arc<VarControlBlock>) {
        let current = var.value.read().clone();
        self.entries.insert(var, Entry::created(current));
    }

    /// Deep copy of the journal state, taken before an `or_else` branch.
    ///
    /// Entries clone their container pointers and flags, so restoring the
    /// snapshot puts the journal into the exact semantic state it had when
    /// the snapshot was taken.
    pub fn snapshot(&self) -> Journal {
        Journal {
            entries: self.entries.clone(),
        }
    }

    /// All entries still see the containers they observed.
    pub fn is_valid(&self) -> bool {
        self.entries
            .iter()
            .all(|(var, entry)| entry_valid(var, entry))
    }

    /// Classify the journal in a single pass.
    fn analyze(&self) -> JournalState {
        let mut state = JournalState::ReadOnly;
        for (var, entry) in &self.entries {
            if !entry_valid(var, entry) {
                return JournalState::Invalid;
            }
            if entry.is_changed {
                state = JournalState::ReadWrite;
            }
        }
        state
    }

    /// Install every changed entry's container on its var.
    ///
    /// The caller holds the commit lock. Each installed container was
    /// freshly allocated by the write that produced it, so the var's
    /// version changes even when the value is equal to the old one.
    fn publish(&self) {
        for (var, entry) in &self.entries {
            if entry.is_changed {
                *var.value.write() = entry.new_value.clone();
            }
        }
    }

    /// Register a wake-up callback on every var this attempt observed.
    ///
    /// Vars created by the attempt itself are skipped: nothing can change
    /// them before they are published. Vars that already carry this
    /// transaction's registration keep it.
    fn register_wakeups(&self, tx: TxId, callback: &WakeCallback) -> bool {
        let mut registered = false;
        for (var, entry) in &self.entries {
            if entry.is_new {
                continue;
            }
            registered |= var.add_todo(tx, callback);
        }
        registered
    }

    /// Drain the pending wake-ups of every participating var.
    ///
    /// Runs after every completed transaction, including failed and
    /// read-only ones, so registrations this transaction left behind on
    /// earlier suspensions get cleared as soon as it touches the same vars
    /// again.
    fn complete_todos(&self) {
        for var in self.entries.keys() {
            var.wake_all();
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

thread_local!(static TRANSACTION_RUNNING: Cell<bool> = Cell::new(false));

/// `TransactionGuard` checks against nested STM calls.
///
/// Use the guard, so that it correctly marks the transaction as finished.
struct TransactionGuard;

impl TransactionGuard {
    fn new() -> TransactionGuard {
        TRANSACTION_RUNNING.with(|running| {
            assert!(!running.get(), "txcell: nested call to `atomically`");
            running.set(true);
        });
        TransactionGuard
    }
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        TRANSACTION_RUNNING.with(|running| {
            running.set(false);
        });
    }
}

/// Event handed to the control function of `atomically_with_control`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StmControl {
    /// A var the attempt depends on changed; the transaction is about to
    /// run again.
    Failure,

    /// `retry` was called; the transaction is about to block until one of
    /// the vars it read changes.
    Retry,
}

/// Answer of the control function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionControl {
    /// Keep going: re-run, or block and wait.
    Retry,

    /// Give up the transaction.
    Abort,
}

/// What one round of committing produced.
enum Progress {
    /// The transaction finished with this outcome.
    Done(AnyExit),

    /// The attempt hit `retry`; the journal is carried over so wake-ups can
    /// be registered on everything it read.
    Suspend(Journal),

    /// The control function gave up.
    Aborted,
}

/// Execute the program until it completes, blocks, or is aborted.
///
/// Runs the program against a fresh journal, classifies the journal in one
/// pass, and then either re-runs (invalid), publishes under the commit lock
/// (valid with writes), validates under the lock (valid read-only), or
/// hands the journal back for suspension (`retry`). Validation conflicts
/// are never surfaced as errors.
fn try_commit(
    prog: &Prog,
    tx: TxId,
    control: &mut dyn FnMut(StmControl) -> TransactionControl,
) -> Progress {
    loop {
        let mut journal = Journal::new();
        let exit = run(prog, &mut journal, tx);

        let state = journal.analyze();
        if state == JournalState::Invalid {
            trace!(tx = tx.0, "attempt saw inconsistent vars, rerunning");
            if control(StmControl::Failure) == TransactionControl::Abort {
                return Progress::Aborted;
            }
            continue;
        }

        match exit {
            StmExit::Succeed(value) => match state {
                JournalState::ReadWrite => {
                    let lock = COMMIT_LOCK.lock();
                    if journal.is_valid() {
                        journal.publish();
                        drop(lock);
                        journal.complete_todos();
                        return Progress::Done(StmExit::Succeed(value));
                    }
                    drop(lock);
                    trace!(tx = tx.0, "validation failed under commit lock, rerunning");
                    if control(StmControl::Failure) == TransactionControl::Abort {
                        return Progress::Aborted;
                    }
                }
                JournalState::ReadOnly => {
                    let valid = {
                        let _lock = COMMIT_LOCK.lock();
                        journal.is_valid()
                    };
                    if valid {
                        journal.complete_todos();
                        return Progress::Done(StmExit::Succeed(value));
                    }
                    trace!(tx = tx.0, "snapshot validation failed, rerunning");
                    if control(StmControl::Failure) == TransactionControl::Abort {
                        return Progress::Aborted;
                    }
                }
                JournalState::Invalid => unreachable!("invalid journals rerun before dispatch"),
            },
            StmExit::Fail(error) => {
                journal.complete_todos();
                return Progress::Done(StmExit::Fail(error));
            }
            StmExit::Retry => return Progress::Suspend(journal),
        }
    }
}

/// Type-erased transaction driver.
///
/// Loops over `try_commit`. A suspended transaction registers its wake-up
/// callback on everything it read and then blocks on its waiter, unless a
/// writer already invalidated the journal in the meantime, in which case it
/// re-attempts immediately.
fn atomically_erased(
    prog: &Prog,
    control: &mut dyn FnMut(StmControl) -> TransactionControl,
) -> Option<AnyExit> {
    let _guard = TransactionGuard::new();
    let tx = TxId::next();
    let waiter = Arc::new(TxWaiter::new());
    let callback: WakeCallback = {
        let waiter = waiter.clone();
        Arc::new(move || waiter.notify())
    };

    let result = loop {
        match try_commit(prog, tx, control) {
            Progress::Done(exit) => break Some(exit),
            Progress::Aborted => break None,
            Progress::Suspend(journal) => {
                let registered = journal.register_wakeups(tx, &callback);
                if journal.is_valid() {
                    trace!(tx = tx.0, registered, "transaction blocked on retry");
                    if control(StmControl::Retry) == TransactionControl::Abort {
                        break None;
                    }
                    waiter.wait();
                } else {
                    // A writer committed between the attempt and the
                    // registration. Sleeping now could miss its wake-up, so
                    // attempt again right away; the registrations stay valid
                    // for the next suspension.
                    trace!(tx = tx.0, "observed var changed before sleeping, rerunning");
                }
            }
        }
    };
    // From here on the transaction cannot be woken or cancelled; leftover
    // registrations on vars fire into a no-op.
    waiter.complete();
    result
}

/// Run a transaction that cannot fail, blocking the thread when it retries.
///
/// The transaction may run many times until it commits, so it must be free
/// of side effects apart from its `TVar` accesses. Nested calls to
/// `atomically` are detected at runtime and panic.
///
/// ```
/// # use txcell::*;
/// let var = TVar::new(0);
///
/// let x = atomically(&var.write(42).zip_right(var.read()));
///
/// assert_eq!(x, 42);
/// ```
pub fn atomically<A>(stm: &Stm<A, Infallible>) -> A
where
    A: std::any::Any + Send + Sync + Clone,
{
    match atomically_or_err(stm) {
        Ok(value) => value,
        Err(never) => match never {},
    }
}

/// Run a transaction with a typed error channel.
///
/// A `Fail` outcome rolls the transaction back and surfaces the error;
/// `Succeed` commits. Retries block the thread like `atomically`.
///
/// ```
/// # use txcell::*;
/// let stm: Stm<i32, String> = Stm::fail("no".to_string()).or_else(Stm::succeed(42));
/// assert_eq!(atomically_or_err(&stm), Ok(42));
/// ```
pub fn atomically_or_err<A, E>(stm: &Stm<A, E>) -> Result<A, E>
where
    A: std::any::Any + Send + Sync + Clone,
    E: std::any::Any + Send + Sync + Clone,
{
    match atomically_with_control(|_| TransactionControl::Retry, stm) {
        Some(result) => result,
        None => unreachable!("the control function never aborts"),
    }
}

/// Run a transaction under a control function that can abort it.
///
/// The control function sees every conflict re-run (`StmControl::Failure`)
/// and every imminent blocking wait (`StmControl::Retry`) and can stop the
/// transaction by answering `TransactionControl::Abort`, in which case
/// `None` is returned and nothing is published. It can react to counters,
/// timeouts or external signals, and is the hook for falling back to a
/// different strategy under heavy contention.
///
/// Note that the transaction may still wait indefinitely once blocked; the
/// control function is never consulted while asleep, so a timeout has to be
/// signalled through a `TVar` by another thread.
pub fn atomically_with_control<A, E, C>(mut control: C, stm: &Stm<A, E>) -> Option<Result<A, E>>
where
    A: std::any::Any + Send + Sync + Clone,
    E: std::any::Any + Send + Sync + Clone,
    C: FnMut(StmControl) -> TransactionControl,
{
    let exit = atomically_erased(stm.prog(), &mut control)?;
    Some(match exit {
        StmExit::Succeed(value) => Ok(downcast_box::<A>(value)),
        StmExit::Fail(error) => Err(downcast_box::<E>(error)),
        StmExit::Retry => unreachable!("retry escaped the commit driver"),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tvar::{downcast_arc, TVar};

    /// The journal serves reads from entries.
    #[test]
    fn journal_read() {
        let mut journal = Journal::new();
        let var = TVar::new(vec![1, 2, 3, 4]);

        let value: Vec<i32> = downcast_arc(journal.read_var(var.control_block()));
        assert_eq!(value, [1, 2, 3, 4]);
        assert_eq!(journal.len(), 1);
    }

    /// A local write is visible to later reads in the same journal but not
    /// to the var.
    #[test]
    fn journal_write_read() {
        let mut journal = Journal::new();
        let var = TVar::new(vec![1, 2]);

        journal.write_var(var.control_block(), Arc::new(vec![1, 2, 3, 4]));

        let value: Vec<i32> = downcast_arc(journal.read_var(var.control_block()));
        assert_eq!(value, [1, 2, 3, 4]);
        assert_eq!(var.read_atomic(), [1, 2]);
    }

    /// Restoring a snapshot forgets entries added after it was taken.
    #[test]
    fn journal_snapshot_restore() {
        let mut journal = Journal::new();
        let a = TVar::new(1);
        let b = TVar::new(2);

        journal.read_var(a.control_block());
        let snapshot = journal.snapshot();

        journal.write_var(b.control_block(), Arc::new(3));
        assert_eq!(journal.len(), 2);

        journal = snapshot;
        assert_eq!(journal.len(), 1);
    }

    #[test]
    fn atomically_simple() {
        let x = atomically(&Stm::succeed(42));
        assert_eq!(x, 42);
    }

    #[test]
    fn atomically_read() {
        let var = TVar::new(42);

        let x = atomically(&var.read());

        assert_eq!(x, 42);
    }

    #[test]
    fn atomically_write() {
        let var = TVar::new(42);

        atomically(&var.write(0));

        assert_eq!(var.read_atomic(), 0);
    }

    #[test]
    fn atomically_copy() {
        let read = TVar::new(42);
        let write = TVar::new(0);

        let source = read.clone();
        let target = write.clone();
        atomically(&source.read().and_then(move |value| target.write(value)));

        assert_eq!(write.read_atomic(), 42);
    }

    /// Run a transaction with a control function that always aborts.
    /// The transaction still runs a single time and commits in this test.
    #[test]
    fn with_control_abort_on_single_run() {
        let var = TVar::new(42);

        let x = atomically_with_control(|_| TransactionControl::Abort, &var.read::<Infallible>());

        assert_eq!(x, Some(Ok(42)));
    }

    /// Run a transaction with a control function that always aborts.
    /// The transaction would retry infinitely often; the control function
    /// cuts the loop.
    #[test]
    fn with_control_abort_on_retry() {
        let stm: Stm<i32> = Stm::retry();
        let x = atomically_with_control(|_| TransactionControl::Abort, &stm);

        assert_eq!(x, None);
    }

    /// The control function observes the imminent block as `Retry`.
    #[test]
    fn with_control_sees_retry_event() {
        let mut seen = Vec::new();
        let stm: Stm<i32> = Stm::retry();
        let x = atomically_with_control(
            |event| {
                seen.push(event);
                TransactionControl::Abort
            },
            &stm,
        );

        assert_eq!(x, None);
        assert_eq!(seen, vec![StmControl::Retry]);
    }

    /// Test if nested transactions are correctly detected.
    #[test]
    #[should_panic]
    fn nested_atomically_fails() {
        let stm: Stm<i32> = Stm::from_fn(|| {
            let inner: Stm<i32> = Stm::succeed(42);
            Ok(atomically(&inner))
        });
        atomically(&stm);
    }

    /// A failed transaction registers nothing and publishes nothing.
    #[test]
    fn fail_publishes_nothing() {
        let var = TVar::new(0);

        let stm: Stm<(), &str> = var.write(1).zip_right(Stm::fail("boom"));
        let result = atomically_or_err(&stm);

        assert_eq!(result, Err("boom"));
        assert_eq!(var.read_atomic(), 0);
    }

    /// An aborted suspension leaves only inert registrations behind.
    #[test]
    fn aborted_retry_leaves_inert_todos() {
        let var = TVar::new(0);

        let source = var.clone();
        let stm: Stm<i32> = source.read().and_then(|_| Stm::retry());
        let x = atomically_with_control(|_| TransactionControl::Abort, &stm);
        assert_eq!(x, None);

        // The registration is still on the var until the next commit drains
        // it; committing a write must not get stuck on it.
        atomically(&var.write(1));
        assert_eq!(var.read_atomic(), 1);
    }
}
