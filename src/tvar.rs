// Copyright 2025-2026 txcell Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::any::Any;
use std::cmp;
use std::collections::hash_map::Entry::{Occupied, Vacant};
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::mem;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::result::StmExit;
use super::stm::Stm;
use super::transaction::control_block::{submit_wakeup, WakeCallback};
use super::transaction::TxId;

/// `VarControlBlock` contains all the useful data for a `TVar` while being
/// the same type for all of them.
///
/// The control block is accessed from other threads directly, whereas `TVar`
/// is just a typesafe wrapper around it.
pub struct VarControlBlock {
    /// Pending wake-up callbacks, keyed by the transaction that registered
    /// them.
    ///
    /// A blocked transaction registers itself here on every var it read.
    /// Whoever commits this var takes the whole map and hands the callbacks
    /// to the wake-up executor, so each registration fires at most once.
    todos: Mutex<HashMap<TxId, WakeCallback>>,

    /// The current value of the var.
    ///
    /// The value is shared through an `Arc`, and the `Arc`'s identity is the
    /// var's version: commit installs a freshly allocated container, so two
    /// distinct commits are distinguishable even when the values compare
    /// equal. Only commit writes here, while holding the global commit lock;
    /// the `RwLock` gives readers the release/acquire pairing they need.
    pub value: RwLock<Arc<dyn Any + Send + Sync>>,
}

impl VarControlBlock {
    /// Create a new `VarControlBlock`.
    pub fn new<T>(val: T) -> Arc<VarControlBlock>
    where
        T: Any + Send + Sync,
    {
        Arc::new(VarControlBlock {
            todos: Mutex::new(HashMap::new()),
            value: RwLock::new(Arc::new(val)),
        })
    }

    /// Register a wake-up callback on behalf of transaction `tx`.
    ///
    /// Keeps an existing registration of the same transaction, so repeated
    /// registration attempts across suspensions are harmless. Returns true
    /// if the callback was inserted.
    pub(crate) fn add_todo(&self, tx: TxId, callback: &WakeCallback) -> bool {
        let mut todos = self.todos.lock();
        match todos.entry(tx) {
            Occupied(_) => false,
            Vacant(entry) => {
                entry.insert(callback.clone());
                true
            }
        }
    }

    /// Atomically take every pending callback and hand it to the wake-up
    /// executor.
    ///
    /// Called after each committed transaction for every participating var.
    /// The swap to an empty map makes delivery one-shot per registration.
    pub(crate) fn wake_all(&self) {
        let todos = {
            let mut guard = self.todos.lock();
            mem::take(&mut *guard)
        };

        for (_, callback) in todos {
            submit_wakeup(callback);
        }
    }

    #[cfg(test)]
    pub(crate) fn todo_count(&self) -> usize {
        self.todos.lock().len()
    }

    fn get_address(&self) -> usize {
        self as *const VarControlBlock as usize
    }
}

// Implement some operators so that VarControlBlocks can be sorted and used
// as journal keys. Identity is the block's address, which is stable for its
// whole lifetime.

impl PartialEq for VarControlBlock {
    fn eq(&self, other: &Self) -> bool {
        self.get_address() == other.get_address()
    }
}

impl Eq for VarControlBlock {}

impl Ord for VarControlBlock {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.get_address().cmp(&other.get_address())
    }
}

impl PartialOrd for VarControlBlock {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Clone a value out of an untyped container.
pub(crate) fn downcast_arc<T: Any + Clone>(value: Arc<dyn Any + Send + Sync>) -> T {
    match value.downcast_ref::<T>() {
        Some(value) => value.clone(),
        None => unreachable!("TVar holds a value of unexpected type"),
    }
}

/// A variable that can be read and written inside transactions.
///
/// All accesses from within a transaction return `Stm` values; nothing
/// happens until the transaction is run with `atomically`.
#[derive(Clone)]
pub struct TVar<T> {
    /// The control block is the inner of the variable.
    ///
    /// The rest of `TVar` is just the typesafe interface.
    control_block: Arc<VarControlBlock>,

    /// This marker is needed so that the variable can be used in a typesafe
    /// manner.
    _marker: PhantomData<T>,
}

impl<T> TVar<T>
where
    T: Any + Send + Sync + Clone,
{
    /// Create a new `TVar` outside of a transaction.
    pub fn new(val: T) -> TVar<T> {
        TVar {
            control_block: VarControlBlock::new(val),
            _marker: PhantomData,
        }
    }

    /// Create a new `TVar` inside a transaction.
    ///
    /// The var is allocated fresh on every attempt, and the journal records
    /// it as created there, so no other thread can observe it before the
    /// transaction commits.
    pub fn make<E>(val: T) -> Stm<TVar<T>, E> {
        Stm::from_effect(move |journal, _| {
            let var = TVar::new(val.clone());
            journal.insert_new(var.control_block.clone());
            StmExit::Succeed(Box::new(var))
        })
    }

    /// `read_atomic` reads a value atomically, without starting a
    /// transaction.
    ///
    /// It is semantically equivalent to
    ///
    /// ```
    /// # use txcell::*;
    /// let var = TVar::new(0);
    /// atomically(&var.read());
    /// ```
    ///
    /// but more efficient.
    ///
    /// `read_atomic` returns a clone of the value.
    pub fn read_atomic(&self) -> T {
        downcast_arc(self.read_ref_atomic())
    }

    /// Read a value atomically but return the shared container.
    ///
    /// This is mostly used internally, but can be useful in some cases,
    /// because `read_atomic` clones the inner value, which may be expensive.
    pub fn read_ref_atomic(&self) -> Arc<dyn Any + Send + Sync> {
        self.control_block.value.read().clone()
    }

    /// Read the var.
    ///
    /// The first read inside a transaction records the var's current
    /// version; commit only goes through if that version is still current.
    ///
    /// ```
    /// # use txcell::*;
    /// let var = TVar::new(42);
    /// let x = atomically(&var.read());
    /// assert_eq!(x, 42);
    /// ```
    pub fn read<E>(&self) -> Stm<T, E> {
        let ctrl = self.control_block.clone();
        Stm::from_effect(move |journal, _| {
            let value = journal.read_var(&ctrl);
            StmExit::Succeed(Box::new(downcast_arc::<T>(value)))
        })
    }

    /// Write a value to the var.
    ///
    /// The write is only visible to the running transaction until commit
    /// publishes it atomically with all other writes.
    ///
    /// ```
    /// # use txcell::*;
    /// let var = TVar::new(0);
    /// atomically(&var.write(42));
    /// assert_eq!(var.read_atomic(), 42);
    /// ```
    pub fn write<E>(&self, value: T) -> Stm<(), E> {
        let ctrl = self.control_block.clone();
        Stm::from_effect(move |journal, _| {
            journal.write_var(&ctrl, Arc::new(value.clone()));
            StmExit::Succeed(Box::new(()))
        })
    }

    /// Apply a function to the content of the var.
    ///
    /// ```
    /// # use txcell::*;
    /// let var = TVar::new(21);
    /// atomically(&var.update(|x| x * 2));
    /// assert_eq!(var.read_atomic(), 42);
    /// ```
    pub fn update<F, E>(&self, f: F) -> Stm<(), E>
    where
        F: Fn(T) -> T + Send + Sync + 'static,
    {
        let ctrl = self.control_block.clone();
        Stm::from_effect(move |journal, _| {
            let old = downcast_arc::<T>(journal.read_var(&ctrl));
            journal.write_var(&ctrl, Arc::new(f(old)));
            StmExit::Succeed(Box::new(()))
        })
    }

    /// Update the var and return a derived value in one step.
    ///
    /// `f` maps the current content to a pair of the transaction-level
    /// result and the new content.
    ///
    /// ```
    /// # use txcell::*;
    /// let var = TVar::new(10);
    /// let old = atomically(&var.modify(|x| (x, x + 1)));
    /// assert_eq!(old, 10);
    /// assert_eq!(var.read_atomic(), 11);
    /// ```
    pub fn modify<F, B, E>(&self, f: F) -> Stm<B, E>
    where
        F: Fn(T) -> (B, T) + Send + Sync + 'static,
        B: Any + Send + Sync + Clone,
    {
        let ctrl = self.control_block.clone();
        Stm::from_effect(move |journal, _| {
            let old = downcast_arc::<T>(journal.read_var(&ctrl));
            let (result, new) = f(old);
            journal.write_var(&ctrl, Arc::new(new));
            StmExit::Succeed(Box::new(result))
        })
    }

    /// Replace the value of the var, returning the old one.
    pub fn replace<E>(&self, value: T) -> Stm<T, E> {
        let ctrl = self.control_block.clone();
        Stm::from_effect(move |journal, _| {
            let old = downcast_arc::<T>(journal.read_var(&ctrl));
            journal.write_var(&ctrl, Arc::new(value.clone()));
            StmExit::Succeed(Box::new(old))
        })
    }

    /// Check if two `TVar`s refer to the same position.
    pub fn ref_eq(this: &TVar<T>, other: &TVar<T>) -> bool {
        Arc::ptr_eq(&this.control_block, &other.control_block)
    }

    /// Access the control block of the var.
    ///
    /// Internal use only!
    pub(crate) fn control_block(&self) -> &Arc<VarControlBlock> {
        &self.control_block
    }
}

/// Debug output a var.
///
/// Note that this does not print the state atomically with anything else.
/// If another thread commits at the same time, a set of vars may print an
/// inconsistent combination of states.
impl<T> Debug for TVar<T>
where
    T: Any + Send + Sync + Clone + Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        let value = self.read_atomic();
        f.debug_struct("TVar").field("value", &value).finish()
    }
}

// Most tests are in lib.rs and the transaction module.

/// Test if creating and reading a `TVar` works.
#[test]
fn test_read_atomic() {
    let var = TVar::new(42);

    assert_eq!(42, var.read_atomic());
}

/// Registrations are idempotent per transaction and drained wholesale.
#[test]
fn test_todo_register_and_drain() {
    let block = VarControlBlock::new(0);
    let tx = TxId::next();
    let callback: WakeCallback = Arc::new(|| {});

    assert!(block.add_todo(tx, &callback));
    assert!(!block.add_todo(tx, &callback));
    assert_eq!(block.todo_count(), 1);

    block.wake_all();
    assert_eq!(block.todo_count(), 0);

    // A drained registration can be renewed.
    assert!(block.add_todo(tx, &callback));
}
