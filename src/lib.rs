// Copyright 2025-2026 txcell Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! This library implements
//! [software transactional memory](https://en.wikipedia.org/wiki/Software_transactional_memory),
//! often abbreviated with STM, in the tradition of *Composable Memory
//! Transactions*.
//!
//! With locks, the sequential composition of two threadsafe actions is no
//! longer threadsafe, because other threads may interfere in between.
//! Adding a third lock to protect both invites deadlocks and races.
//!
//! STM is composable instead. A transaction is a first-class [`Stm`] value
//! built from reads and writes of [`TVar`]s and glued together with
//! combinators like [`Stm::and_then`] and [`Stm::or_else`]. Running it with
//! [`atomically`] records every access in a log; if all accessed vars are
//! still consistent at the end, the writes are committed as a single atomic
//! operation, otherwise the computation silently repeats. This may lead to
//! starvation, but avoids common sources of bugs.
//!
//! Panicking within a transaction does not poison the `TVar`s. STM ensures
//! consistency by never committing on panic.
//!
//! # Usage
//!
//! ```
//! use txcell::{atomically, TVar};
//!
//! let var = TVar::new(0);
//!
//! let x = atomically(&var.write(42).zip_right(var.read()));
//!
//! println!("var = {}", x);
//! // var = 42
//! ```
//!
//! Transactions with a typed error channel run with [`atomically_or_err`];
//! a [`Stm::fail`] rolls everything back and surfaces the error. A
//! transaction that cannot proceed yet calls [`retry`]; it blocks until one
//! of the vars it read has changed and runs again:
//!
//! ```
//! # use std::thread;
//! # use std::time::Duration;
//! # use txcell::*;
//! let var = TVar::new(0);
//! let observer = var.clone();
//!
//! let handle = thread::spawn(move || {
//!     atomically(&observer.read().and_then(|v| guard(v != 0).map_to(v)))
//! });
//!
//! thread::sleep(Duration::from_millis(10));
//! atomically(&var.write(42));
//!
//! assert_eq!(handle.join().unwrap(), 42);
//! ```
//!
//! # Transaction safety
//!
//! Software transactional memory is completely safe in the rust sense, so
//! undefined behavior will never occur. Still there are multiple rules that
//! you should obey when dealing with software transactional memory.
//!
//! * Don't run code with side effects, especially no IO-code, inside of a
//!   transaction. Transactions repeat in failure cases; using IO would
//!   repeat this IO-code. Return a closure if you have to.
//! * Don't run `atomically` inside of another. `atomically` is designed to
//!   have side effects and will therefore break transaction safety. Nested
//!   calls are detected at runtime and handled with panicking. When you use
//!   STM in the inner of a function, express it in the public interface by
//!   returning an [`Stm`] value. Callers can safely compose it into larger
//!   transactions.
//! * Don't mix locks and transactions. Your code will easily deadlock or
//!   slow down unpredictably.
//! * Don't use inner mutability to change the content of a `TVar`.
//!
//! Panicking in a transaction is transaction-safe. The transaction aborts
//! and all changes are discarded. No poisoning or half written transactions
//! happen.
//!
//! # Speed
//!
//! Generally keep your atomic blocks as small as possible, because the more
//! time you spend, the more likely it is to collide with other threads. For
//! STM, reading `TVar`s is quite slow, because it needs to look them up in
//! the log every time. Every used `TVar` increases the chance of
//! collisions. Therefore you should keep the amount of accessed variables
//! as low as needed.

mod result;
mod stm;
mod transaction;
mod tvar;


pub use result::StmExit;
pub use stm::Stm;
pub use transaction::{
    atomically, atomically_or_err, atomically_with_control, StmControl, TransactionControl, TxId,
};
pub use tvar::TVar;

use std::any::Any;

/// Call `retry` to abort an operation and run the whole transaction again.
///
/// Semantically `retry` allows spin-lock-like behavior, but the library
/// blocks until one of the used `TVar`s has changed, to keep CPU-usage low.
///
/// [`Stm::or_else`] allows to define alternatives. If the first function
/// wants to retry, then the second one has a chance to run.
///
/// # Examples
///
/// ```no_run
/// # use txcell::*;
/// let infinite_retry: i32 = atomically(&retry());
/// ```
pub fn retry<A, E>() -> Stm<A, E>
where
    A: Any + Send + Sync + Clone,
    E: Any + Send + Sync + Clone,
{
    Stm::retry()
}

/// Retry until `cond` is true.
///
/// # Example
///
/// ```
/// # use txcell::*;
/// let var = TVar::new(42);
///
/// let x = atomically(&var.read().and_then(|v| guard(v == 42).map_to(v)));
/// // v is now always 42.
/// assert_eq!(x, 42);
/// ```
pub fn guard<E>(cond: bool) -> Stm<(), E>
where
    E: Any + Send + Sync + Clone,
{
    if cond {
        Stm::succeed(())
    } else {
        Stm::retry()
    }
}

/// Unwrap `Option` or call retry if it is `None`.
///
/// `optionally` is the inverse of `unwrap_or_retry`.
///
/// # Example
///
/// ```
/// # use txcell::*;
/// let x = TVar::new(Some(42));
///
/// let inner = atomically(&x.read().and_then(unwrap_or_retry));
/// assert_eq!(inner, 42); // inner is always 42.
/// ```
pub fn unwrap_or_retry<A, E>(option: Option<A>) -> Stm<A, E>
where
    A: Any + Send + Sync + Clone,
    E: Any + Send + Sync + Clone,
{
    match option {
        Some(value) => Stm::succeed(value),
        None => Stm::retry(),
    }
}

/// Optionally run a transaction. If `stm` fails with a `retry()`, it does
/// not block the whole transaction, but returns `None`.
///
/// Note that `optionally` does not recover from errors; those still abort
/// the transaction.
///
/// `unwrap_or_retry` is the inverse of `optionally`.
///
/// # Example
///
/// ```
/// # use txcell::*;
/// let x: Option<i32> = atomically(&optionally(retry()));
/// assert_eq!(x, None);
/// ```
pub fn optionally<A, E>(stm: Stm<A, E>) -> Stm<Option<A>, E>
where
    A: Any + Send + Sync + Clone,
    E: Any + Send + Sync + Clone,
{
    stm.map(Some).or_else(Stm::succeed(None))
}

/// Combine two transactions. When the first blocks with `retry` or fails,
/// its tentative effects are rolled back and the second one runs.
///
/// Equivalent to [`Stm::or_else`], which additionally allows the
/// alternative to change the error type.
pub fn or<A, E>(first: Stm<A, E>, second: Stm<A, E>) -> Stm<A, E>
where
    A: Any + Send + Sync + Clone,
    E: Any + Send + Sync + Clone,
{
    first.or_else(second)
}

#[cfg(test)]
mod test_lib {
    use super::*;

    #[test]
    fn infinite_retry() {
        let terminated = test::terminates(300, || {
            let _infinite_retry: i32 = atomically(&retry());
        });
        assert!(!terminated);
    }

    #[test]
    fn stm_sequence() {
        let var = TVar::new(0);

        let target = var.clone();
        let x = atomically(&target.write(42).zip_right(var.read()));

        assert_eq!(42, x);
    }

    /// Run multiple threads.
    ///
    /// Thread 1: Read a var, block until it is not 0 and then return that
    /// value.
    ///
    /// Thread 2: Wait a bit. Then write a value.
    ///
    /// Check if Thread 1 is woken up correctly and then check for
    /// correctness.
    #[test]
    fn threaded() {
        use std::thread;
        use std::time::Duration;

        let var = TVar::new(0);
        // Clone for the other thread.
        let observer = var.clone();

        let x = test::run_async(
            800,
            move || {
                atomically(&observer.read().and_then(|x| guard(x != 0).map_to(x)))
            },
            || {
                thread::sleep(Duration::from_millis(100));

                atomically(&var.write(42));
            },
        )
        .unwrap();

        assert_eq!(42, x);
    }

    /// Test if a STM calculation is rerun when a var changes while executing.
    #[test]
    fn read_write_interfere() {
        use std::thread;
        use std::time::Duration;

        // Create var.
        let var = TVar::new(0);
        let slow = var.clone(); // Clone for the other thread.

        // Spawn a thread.
        let handle = thread::spawn(move || {
            let reader = slow.clone();
            let writer = slow.clone();
            atomically(&reader.read().and_then(move |x| {
                // Ensure that the var changes in between read and write.
                thread::sleep(Duration::from_millis(500));

                // Write back the modified data; this should only commit when
                // the value has not changed concurrently.
                writer.write(x + 10)
            }));
        });

        // Ensure that the thread has started and already read the var.
        thread::sleep(Duration::from_millis(100));

        // Now change it.
        atomically(&var.write(32));

        // Finish and compare.
        let _ = handle.join();
        assert_eq!(42, var.read_atomic());
    }

    #[test]
    fn or_simple() {
        let var = TVar::new(42);

        let x = atomically(&or(retry(), var.read()));

        assert_eq!(x, 42);
    }

    /// A variable should not be written when another branch was taken.
    #[test]
    fn or_nocommit() {
        let var = TVar::new(42);

        let writer = var.clone();
        let x = atomically(&or(
            writer.write(23).and_then(|_| Stm::retry()),
            var.read(),
        ));

        assert_eq!(x, 42);
        assert_eq!(var.read_atomic(), 42);
    }

    #[test]
    fn or_nested_first() {
        let var = TVar::new(42);

        let nested: Stm<i32> = or(retry(), retry());
        let x = atomically(&or(nested, var.read()));

        assert_eq!(x, 42);
    }

    #[test]
    fn or_nested_second() {
        let var = TVar::new(42);

        let x = atomically(&or(retry(), or(var.read(), retry())));

        assert_eq!(x, 42);
    }

    #[test]
    fn unwrap_some() {
        let x = Some(42);
        let y = atomically(&unwrap_or_retry(x));
        assert_eq!(y, 42);
    }

    #[test]
    fn unwrap_none_blocks() {
        let x: Option<i32> = None;
        let terminated = test::terminates(300, move || {
            atomically(&unwrap_or_retry(x));
        });
        assert!(!terminated);
    }

    #[test]
    fn guard_true() {
        let x = atomically(&guard(true).map_to(42));
        assert_eq!(x, 42);
    }

    #[test]
    fn guard_false_blocks() {
        let terminated = test::terminates(300, || {
            atomically(&guard(false));
        });
        assert!(!terminated);
    }

    #[test]
    fn optionally_succeed() {
        let x = atomically(&optionally(Stm::succeed(42)));
        assert_eq!(x, Some(42));
    }

    #[test]
    fn optionally_fail() {
        let x: Option<i32> = atomically(&optionally(retry()));
        assert_eq!(x, None);
    }
}
