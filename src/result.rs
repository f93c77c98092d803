use std::any::Any;

/// Outcome of a single execution attempt of a transaction.
///
/// An attempt either produces a value, fails with the typed error of the
/// transaction, or asks to be suspended until one of the read vars changes.
/// Validation conflicts are not represented here; the commit driver handles
/// them by silently re-running the attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StmExit<A, E> {
    /// The attempt produced a value. Whether it commits depends on
    /// validation.
    Succeed(A),

    /// The attempt failed with the transaction's error type. Nothing is
    /// published; the error surfaces to the caller.
    Fail(E),

    /// `retry` was called. The transaction blocks until at least one of the
    /// vars it read has changed, then runs again.
    Retry,
}

impl<A, E> StmExit<A, E> {
    /// True for the `Retry` outcome.
    pub fn is_retry(&self) -> bool {
        matches!(self, StmExit::Retry)
    }
}

/// Values and errors travel through the interpreter type-erased; the typed
/// combinators re-establish their types by downcast at each seam.
pub(crate) type AnyBox = Box<dyn Any + Send>;

/// Erased outcome used by the interpreter and the commit driver.
pub(crate) type AnyExit = StmExit<AnyBox, AnyBox>;
