// Copyright 2025-2026 txcell Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::any::Any;
use std::convert::Infallible;
use std::marker::PhantomData;
use std::mem;
use std::sync::Arc;

use once_cell::sync::Lazy;

use super::result::{AnyBox, AnyExit, StmExit};
use super::transaction::{atomically_or_err, Journal, TxId};

/// Leaf computation: touches the journal and produces an outcome directly.
type EffectFn = dyn Fn(&mut Journal, TxId) -> AnyExit + Send + Sync;

/// Erased continuation. Takes the erased success (or failure) value of the
/// previous step and either hands back the next program or finishes with an
/// outcome immediately.
type Cont = Arc<dyn Fn(AnyBox) -> ContStep + Send + Sync>;

pub(crate) enum ContStep {
    Continue(Prog),
    Done(AnyExit),
}

/// The erased program behind an `Stm` value.
///
/// Combinators only ever build this tree; nothing runs until a driver
/// interprets it against a journal.
#[derive(Clone)]
pub(crate) enum Prog {
    /// Leaf producing an outcome directly.
    Effect(Arc<EffectFn>),

    /// Run the child; feed its success value to the continuation. Failure
    /// and retry pass through.
    AndThen(Arc<Prog>, Cont),

    /// Run the child; dispatch success to the first and failure to the
    /// second continuation. Retry passes through.
    Fold(Arc<Prog>, Cont, Cont),

    /// Run the left program. If it fails or retries, restore the journal to
    /// its state from before the left program and run the right one.
    OrElse(Arc<Prog>, Arc<Prog>),

    /// Build the program lazily, once per attempt.
    Defer(Arc<dyn Fn() -> Prog + Send + Sync>),
}

/// Inert leaf used to detach children during the iterative drop.
static INERT: Lazy<Arc<Prog>> = Lazy::new(|| Arc::new(Prog::Effect(Arc::new(|_, _| StmExit::Retry))));

impl Prog {
    fn detach_children(&mut self, out: &mut Vec<Arc<Prog>>) {
        match self {
            Prog::Effect(_) | Prog::Defer(_) => {}
            Prog::AndThen(child, _) | Prog::Fold(child, _, _) => {
                out.push(mem::replace(child, INERT.clone()));
            }
            Prog::OrElse(left, right) => {
                out.push(mem::replace(left, INERT.clone()));
                out.push(mem::replace(right, INERT.clone()));
            }
        }
    }
}

/// Long combinator chains nest programs linearly, so the derived drop would
/// recurse to the chain depth and blow the stack exactly for the programs
/// the interpreter is built to handle. Tear down uniquely owned children
/// with an explicit stack instead.
impl Drop for Prog {
    fn drop(&mut self) {
        let mut pending = Vec::new();
        self.detach_children(&mut pending);
        while let Some(child) = pending.pop() {
            if let Some(mut prog) = Arc::into_inner(child) {
                prog.detach_children(&mut pending);
            }
        }
    }
}

/// Stack frame of the interpreter.
enum Frame {
    AndThen(Cont),
    Fold(Cont, Cont),
    OrElse(Arc<Prog>, Journal),
}

/// Interpret a program against `journal`.
///
/// Control flow lives on an explicit frame stack, so arbitrarily deep
/// `and_then` chains use constant host stack; only the `Vec` grows with the
/// logical depth. `OrElse` frames carry the journal snapshot taken before
/// their left branch started.
pub(crate) fn run(prog: &Prog, journal: &mut Journal, tx: TxId) -> AnyExit {
    let mut current = prog.clone();
    let mut stack: Vec<Frame> = Vec::new();

    'next: loop {
        // Descend to a leaf.
        let mut exit = loop {
            match &current {
                Prog::Effect(effect) => {
                    let effect = effect.clone();
                    break (*effect)(journal, tx);
                }
                Prog::AndThen(child, cont) => {
                    let child = child.clone();
                    let cont = cont.clone();
                    stack.push(Frame::AndThen(cont));
                    current = (*child).clone();
                }
                Prog::Fold(child, on_ok, on_err) => {
                    let child = child.clone();
                    let on_ok = on_ok.clone();
                    let on_err = on_err.clone();
                    stack.push(Frame::Fold(on_ok, on_err));
                    current = (*child).clone();
                }
                Prog::OrElse(left, right) => {
                    let left = left.clone();
                    let right = right.clone();
                    stack.push(Frame::OrElse(right, journal.snapshot()));
                    current = (*left).clone();
                }
                Prog::Defer(thunk) => {
                    let thunk = thunk.clone();
                    current = (*thunk)();
                }
            }
        };

        // Unwind until a continuation resumes execution or the stack is
        // empty.
        loop {
            let frame = match stack.pop() {
                Some(frame) => frame,
                None => return exit,
            };

            let step = match frame {
                Frame::AndThen(cont) => match exit {
                    StmExit::Succeed(value) => (*cont)(value),
                    other => {
                        exit = other;
                        continue;
                    }
                },
                Frame::Fold(on_ok, on_err) => match exit {
                    StmExit::Succeed(value) => (*on_ok)(value),
                    StmExit::Fail(error) => (*on_err)(error),
                    StmExit::Retry => {
                        exit = StmExit::Retry;
                        continue;
                    }
                },
                Frame::OrElse(right, saved) => match exit {
                    StmExit::Succeed(value) => {
                        exit = StmExit::Succeed(value);
                        continue;
                    }
                    StmExit::Fail(_) | StmExit::Retry => {
                        *journal = saved;
                        ContStep::Continue((*right).clone())
                    }
                },
            };

            match step {
                ContStep::Continue(prog) => {
                    current = prog;
                    continue 'next;
                }
                ContStep::Done(done) => exit = done,
            }
        }
    }
}

/// Re-type an erased value at a combinator seam.
pub(crate) fn downcast_box<T: Any>(value: AnyBox) -> T {
    match value.downcast::<T>() {
        Ok(boxed) => *boxed,
        Err(_) => unreachable!("transaction value has unexpected type"),
    }
}

/// A composable memory transaction.
///
/// An `Stm<A, E>` describes a computation over transactional variables that
/// produces an `A`, fails with an `E`, or blocks until an observed var
/// changes. It is a value: building one has no effect, cloning one is cheap,
/// and the same value can be run any number of times. Effects happen only
/// when a driver like [`atomically`](crate::atomically) interprets it, and
/// then all of its reads and writes take place as one atomic, isolated step.
///
/// Transactions compose: `and_then` sequences them, `or_else` tries an
/// alternative when the first one fails or retries, `zip` pairs results.
/// The composed transaction is itself atomic, which is the point of STM:
/// thread-safe pieces stay thread-safe under composition.
///
/// ```
/// use txcell::{atomically, Stm, TVar};
///
/// let balance = TVar::new(100);
///
/// let debit = balance.update(|b| b - 30);
/// let audit = balance.read();
///
/// let remaining = atomically(&debit.zip_right(audit));
/// assert_eq!(remaining, 70);
/// ```
#[must_use = "an `Stm` describes a transaction and does nothing until it is run"]
pub struct Stm<A, E = Infallible> {
    prog: Prog,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Stm<A, E> {
    fn clone(&self) -> Self {
        Stm {
            prog: self.prog.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, E> Stm<A, E> {
    pub(crate) fn from_prog(prog: Prog) -> Stm<A, E> {
        Stm {
            prog,
            _marker: PhantomData,
        }
    }

    pub(crate) fn from_effect<F>(effect: F) -> Stm<A, E>
    where
        F: Fn(&mut Journal, TxId) -> AnyExit + Send + Sync + 'static,
    {
        Stm::from_prog(Prog::Effect(Arc::new(effect)))
    }

    pub(crate) fn prog(&self) -> &Prog {
        &self.prog
    }

    pub(crate) fn into_prog(self) -> Prog {
        self.prog
    }
}

impl<A, E> Stm<A, E>
where
    A: Any + Send + Sync + Clone,
    E: Any + Send + Sync + Clone,
{
    /// Transaction that succeeds with `value`.
    pub fn succeed(value: A) -> Stm<A, E> {
        Stm::from_effect(move |_, _| StmExit::Succeed(Box::new(value.clone())))
    }

    /// Transaction that fails with `error`.
    ///
    /// Failure aborts the transaction without publishing anything and
    /// surfaces the error to the caller, unless it is handled inside the
    /// transaction with `fold`, `or_else` or friends.
    pub fn fail(error: E) -> Stm<A, E> {
        Stm::from_effect(move |_, _| StmExit::Fail(Box::new(error.clone())))
    }

    /// Abort the attempt and block the transaction until one of the vars it
    /// read has changed.
    pub fn retry() -> Stm<A, E> {
        Stm::from_effect(|_, _| StmExit::Retry)
    }

    /// Lift a pre-computed outcome.
    pub fn done(exit: StmExit<A, E>) -> Stm<A, E> {
        Stm::from_effect(move |_, _| match &exit {
            StmExit::Succeed(value) => StmExit::Succeed(Box::new(value.clone())),
            StmExit::Fail(error) => StmExit::Fail(Box::new(error.clone())),
            StmExit::Retry => StmExit::Retry,
        })
    }

    /// Lift a `Result` into the transaction.
    pub fn from_result(result: Result<A, E>) -> Stm<A, E> {
        Stm::from_effect(move |_, _| match &result {
            Ok(value) => StmExit::Succeed(Box::new(value.clone())),
            Err(error) => StmExit::Fail(Box::new(error.clone())),
        })
    }

    /// Evaluate a fallible thunk inside every attempt.
    ///
    /// The thunk must be transaction-safe: it may be evaluated several times
    /// and its effects are not rolled back.
    pub fn from_fn<F>(f: F) -> Stm<A, E>
    where
        F: Fn() -> Result<A, E> + Send + Sync + 'static,
    {
        Stm::from_effect(move |_, _| match f() {
            Ok(value) => StmExit::Succeed(Box::new(value)),
            Err(error) => StmExit::Fail(Box::new(error)),
        })
    }

    /// Defer building the transaction until it runs.
    pub fn suspend<F>(f: F) -> Stm<A, E>
    where
        F: Fn() -> Stm<A, E> + Send + Sync + 'static,
    {
        Stm::from_prog(Prog::Defer(Arc::new(move || f().into_prog())))
    }

    /// Abort the transaction with a defect.
    ///
    /// Defects are panics: they cannot be handled by `fold` or `or_else`,
    /// they abort the transaction without publishing anything, and they
    /// propagate out of `atomically`.
    pub fn die<P>(payload: P) -> Stm<A, E>
    where
        P: Any + Send + Sync + Clone,
    {
        Stm::from_effect(move |_, _| std::panic::panic_any(payload.clone()))
    }

    /// Abort the transaction with a defect carrying a message.
    pub fn die_message(message: impl Into<String>) -> Stm<A, E> {
        let message = message.into();
        Stm::from_effect(move |_, _| panic!("{}", message))
    }

    /// Map the result of the transaction.
    pub fn map<B, F>(self, f: F) -> Stm<B, E>
    where
        B: Any + Send + Sync + Clone,
        F: Fn(A) -> B + Send + Sync + 'static,
    {
        Stm::from_prog(Prog::AndThen(
            Arc::new(self.into_prog()),
            Arc::new(move |value| {
                ContStep::Done(StmExit::Succeed(Box::new(f(downcast_box::<A>(value)))))
            }),
        ))
    }

    /// Sequence a second transaction computed from the result of the first.
    pub fn and_then<B, F>(self, f: F) -> Stm<B, E>
    where
        B: Any + Send + Sync + Clone,
        F: Fn(A) -> Stm<B, E> + Send + Sync + 'static,
    {
        Stm::from_prog(Prog::AndThen(
            Arc::new(self.into_prog()),
            Arc::new(move |value| ContStep::Continue(f(downcast_box::<A>(value)).into_prog())),
        ))
    }

    /// Map the error of the transaction.
    pub fn map_err<E2, F>(self, f: F) -> Stm<A, E2>
    where
        E2: Any + Send + Sync + Clone,
        F: Fn(E) -> E2 + Send + Sync + 'static,
    {
        Stm::from_prog(Prog::Fold(
            Arc::new(self.into_prog()),
            Arc::new(|value| ContStep::Done(StmExit::Succeed(value))),
            Arc::new(move |error| {
                ContStep::Done(StmExit::Fail(Box::new(f(downcast_box::<E>(error)))))
            }),
        ))
    }

    /// Replace any error with `error`.
    pub fn err_to<E2>(self, error: E2) -> Stm<A, E2>
    where
        E2: Any + Send + Sync + Clone,
    {
        self.map_err(move |_| error.clone())
    }

    /// Replace the result with `value`.
    pub fn map_to<B>(self, value: B) -> Stm<B, E>
    where
        B: Any + Send + Sync + Clone,
    {
        self.map(move |_| value.clone())
    }

    /// Discard the result.
    pub fn unit(self) -> Stm<(), E> {
        self.map(|_| ())
    }

    /// Discard result and error alike.
    pub fn ignore<E2>(self) -> Stm<(), E2>
    where
        E2: Any + Send + Sync + Clone,
    {
        self.fold(|_| (), |_| ())
    }

    /// Handle both outcomes with plain functions; the resulting transaction
    /// cannot fail.
    pub fn fold<B, E2, Fe, Fa>(self, on_err: Fe, on_ok: Fa) -> Stm<B, E2>
    where
        B: Any + Send + Sync + Clone,
        E2: Any + Send + Sync + Clone,
        Fe: Fn(E) -> B + Send + Sync + 'static,
        Fa: Fn(A) -> B + Send + Sync + 'static,
    {
        Stm::from_prog(Prog::Fold(
            Arc::new(self.into_prog()),
            Arc::new(move |value| {
                ContStep::Done(StmExit::Succeed(Box::new(on_ok(downcast_box::<A>(value)))))
            }),
            Arc::new(move |error| {
                ContStep::Done(StmExit::Succeed(Box::new(on_err(downcast_box::<E>(error)))))
            }),
        ))
    }

    /// Handle both outcomes with follow-up transactions.
    pub fn fold_stm<B, E2, Fe, Fa>(self, on_err: Fe, on_ok: Fa) -> Stm<B, E2>
    where
        B: Any + Send + Sync + Clone,
        E2: Any + Send + Sync + Clone,
        Fe: Fn(E) -> Stm<B, E2> + Send + Sync + 'static,
        Fa: Fn(A) -> Stm<B, E2> + Send + Sync + 'static,
    {
        Stm::from_prog(Prog::Fold(
            Arc::new(self.into_prog()),
            Arc::new(move |value| ContStep::Continue(on_ok(downcast_box::<A>(value)).into_prog())),
            Arc::new(move |error| ContStep::Continue(on_err(downcast_box::<E>(error)).into_prog())),
        ))
    }

    /// Surface the outcome as a `Result`; the transaction itself no longer
    /// fails.
    pub fn either<E2>(self) -> Stm<Result<A, E>, E2>
    where
        E2: Any + Send + Sync + Clone,
    {
        self.fold(Err, Ok)
    }

    /// Turn failure into `None`.
    pub fn option<E2>(self) -> Stm<Option<A>, E2>
    where
        E2: Any + Send + Sync + Clone,
    {
        self.fold(|_| None, Some)
    }

    /// Run both transactions in order and combine their results.
    pub fn zip_with<B, C, F>(self, that: Stm<B, E>, f: F) -> Stm<C, E>
    where
        B: Any + Send + Sync + Clone,
        C: Any + Send + Sync + Clone,
        F: Fn(A, B) -> C + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.and_then(move |a| {
            let f = f.clone();
            that.clone().map(move |b| (*f)(a.clone(), b))
        })
    }

    /// Run both transactions in order and pair their results.
    pub fn zip<B>(self, that: Stm<B, E>) -> Stm<(A, B), E>
    where
        B: Any + Send + Sync + Clone,
    {
        self.zip_with(that, |a, b| (a, b))
    }

    /// Run both transactions in order and keep the first result.
    pub fn zip_left<B>(self, that: Stm<B, E>) -> Stm<A, E>
    where
        B: Any + Send + Sync + Clone,
    {
        self.zip_with(that, |a, _| a)
    }

    /// Run both transactions in order and keep the second result.
    pub fn zip_right<B>(self, that: Stm<B, E>) -> Stm<B, E>
    where
        B: Any + Send + Sync + Clone,
    {
        self.zip_with(that, |_, b| b)
    }

    /// Retry (not fail) when the predicate rejects the result.
    pub fn filter<P>(self, predicate: P) -> Stm<A, E>
    where
        P: Fn(&A) -> bool + Send + Sync + 'static,
    {
        Stm::from_prog(Prog::AndThen(
            Arc::new(self.into_prog()),
            Arc::new(move |value| {
                let value = downcast_box::<A>(value);
                if predicate(&value) {
                    ContStep::Done(StmExit::Succeed(Box::new(value)))
                } else {
                    ContStep::Done(StmExit::Retry)
                }
            }),
        ))
    }

    /// Map the result through a partial function; retry when it is not
    /// defined.
    pub fn collect<B, F>(self, f: F) -> Stm<B, E>
    where
        B: Any + Send + Sync + Clone,
        F: Fn(A) -> Option<B> + Send + Sync + 'static,
    {
        Stm::from_prog(Prog::AndThen(
            Arc::new(self.into_prog()),
            Arc::new(move |value| match f(downcast_box::<A>(value)) {
                Some(result) => ContStep::Done(StmExit::Succeed(Box::new(result))),
                None => ContStep::Done(StmExit::Retry),
            }),
        ))
    }

    /// Continue with a partial follow-up transaction; retry when it is not
    /// defined.
    pub fn collect_stm<B, F>(self, f: F) -> Stm<B, E>
    where
        B: Any + Send + Sync + Clone,
        F: Fn(A) -> Option<Stm<B, E>> + Send + Sync + 'static,
    {
        Stm::from_prog(Prog::AndThen(
            Arc::new(self.into_prog()),
            Arc::new(move |value| match f(downcast_box::<A>(value)) {
                Some(stm) => ContStep::Continue(stm.into_prog()),
                None => ContStep::Done(StmExit::Retry),
            }),
        ))
    }

    /// Try an alternative when this transaction fails or retries.
    ///
    /// Before this transaction starts, the journal state is snapshotted.
    /// If it fails or retries, every entry it touched is rolled back to the
    /// snapshot and `that` runs instead, so an abandoned branch can never be
    /// observed to have touched a var.
    pub fn or_else<E2>(self, that: Stm<A, E2>) -> Stm<A, E2>
    where
        E2: Any + Send + Sync + Clone,
    {
        Stm::from_prog(Prog::OrElse(
            Arc::new(self.into_prog()),
            Arc::new(that.into_prog()),
        ))
    }

    /// Like `or_else`, but keeps track of which branch produced the result:
    /// `Ok` for this transaction, `Err` for the alternative.
    pub fn or_else_either<B, E2>(self, that: Stm<B, E2>) -> Stm<Result<A, B>, E2>
    where
        B: Any + Send + Sync + Clone,
        E2: Any + Send + Sync + Clone,
    {
        self.map(Ok).or_else(that.map(Err))
    }

    /// Fall back to a plain value when this transaction fails or retries.
    pub fn fallback<E2>(self, value: A) -> Stm<A, E2>
    where
        E2: Any + Send + Sync + Clone,
    {
        self.or_else(Stm::succeed(value))
    }

    /// Run `finalizer` after this transaction, on both its success and its
    /// failure path.
    ///
    /// The finalizer's writes live in the same journal: if the whole
    /// transaction is aborted or fails at the caller, they are rolled back
    /// with everything else.
    pub fn ensuring<B>(self, finalizer: Stm<B, E>) -> Stm<A, E>
    where
        B: Any + Send + Sync + Clone,
    {
        let on_ok = {
            let finalizer = finalizer.clone();
            move |value: AnyBox| {
                let value = downcast_box::<A>(value);
                ContStep::Continue(Prog::AndThen(
                    Arc::new(finalizer.clone().into_prog()),
                    Arc::new(move |_| ContStep::Done(StmExit::Succeed(Box::new(value.clone())))),
                ))
            }
        };
        let on_err = move |error: AnyBox| {
            let error = downcast_box::<E>(error);
            ContStep::Continue(Prog::AndThen(
                Arc::new(finalizer.clone().into_prog()),
                Arc::new(move |_| ContStep::Done(StmExit::Fail(Box::new(error.clone())))),
            ))
        };
        Stm::from_prog(Prog::Fold(
            Arc::new(self.into_prog()),
            Arc::new(on_ok),
            Arc::new(on_err),
        ))
    }

    /// Run every transaction in order and collect the results.
    pub fn collect_all<I>(items: I) -> Stm<Vec<A>, E>
    where
        I: IntoIterator<Item = Stm<A, E>>,
    {
        let mut acc: Stm<Vec<A>, E> = Stm::succeed(Vec::new());
        for item in items {
            acc = acc.zip_with(item, |mut values, value| {
                values.push(value);
                values
            });
        }
        acc
    }

    /// Apply `f` to every item and run the produced transactions in order,
    /// collecting the results.
    pub fn for_each<I, T, F>(items: I, mut f: F) -> Stm<Vec<A>, E>
    where
        I: IntoIterator<Item = T>,
        F: FnMut(T) -> Stm<A, E>,
    {
        Stm::collect_all(items.into_iter().map(|item| f(item)).collect::<Vec<_>>())
    }

    /// Apply `f` to every item and run the produced transactions in order,
    /// discarding the results.
    pub fn for_each_discard<I, T, F>(items: I, mut f: F) -> Stm<(), E>
    where
        I: IntoIterator<Item = T>,
        F: FnMut(T) -> Stm<A, E>,
    {
        let mut acc: Stm<(), E> = Stm::succeed(());
        for item in items {
            acc = acc.zip_right(f(item)).unit();
        }
        acc
    }

    /// Run this transaction atomically on the calling thread.
    ///
    /// Equivalent to [`atomically_or_err`](crate::atomically_or_err).
    pub fn commit(&self) -> Result<A, E> {
        atomically_or_err(self)
    }
}

impl<E> Stm<TxId, E>
where
    E: Any + Send + Sync + Clone,
{
    /// Identity of the running top-level transaction.
    ///
    /// The id is assigned when `atomically` starts and stays stable across
    /// conflict re-runs and retry suspensions of the same call.
    pub fn tx_id() -> Stm<TxId, E> {
        Stm::from_effect(|_, tx| StmExit::Succeed(Box::new(tx)))
    }
}

impl<A, E> Stm<Stm<A, E>, E>
where
    A: Any + Send + Sync + Clone,
    E: Any + Send + Sync + Clone,
{
    /// Flatten a nested transaction.
    pub fn flatten(self) -> Stm<A, E> {
        self.and_then(|stm| stm)
    }
}
