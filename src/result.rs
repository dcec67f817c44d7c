// Copyright 2025-2026 stm-tl2 Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use thiserror::Error;

/// Failure states of the transactional machinery itself.
///
/// `Conflict` is pure control flow: the retry loop catches it at the
/// outermost frame and reruns the transaction, while an inner frame
/// re-raises it so the outermost loop can handle it. Never swallow a
/// `Conflict` in user code; always propagate it with `?`.
///
/// The other variants are real errors and reach the caller of
/// [`atomically`](crate::atomically) unchanged.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StmError {
    /// A read or a commit observed a version newer than the
    /// transaction's clock snapshot.
    #[error("transaction conflicted with a concurrent writer")]
    Conflict,

    /// A transactional operation was invoked with no transaction running
    /// on the current thread.
    #[error("no transaction is running on this thread")]
    OutsideTransaction,

    /// A write was attempted while the innermost frame is read-only, or a
    /// read-write transaction was begun inside a read-only one.
    #[error("operation not permitted in a read-only transaction")]
    ReadOnly,

    /// A pre-write validator vetoed the value; nothing was buffered.
    #[error("pre-write validation vetoed the value")]
    Validation,
}

/// Result of a single transactional step.
pub type StmResult<T> = Result<T, StmError>;

/// Error of a transaction that may additionally abort with a user error.
///
/// The `Stm` layer carries the machinery's own failures and keeps the
/// retry loop working through `?`; `Abort` cancels the transaction and
/// surfaces the user error unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError<E> {
    /// A failure of the transactional machinery, see [`StmError`].
    #[error(transparent)]
    Stm(#[from] StmError),

    /// The closure aborted the transaction with its own error.
    #[error("transaction aborted: {0}")]
    Abort(E),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn conflict_converts_into_transaction_error() {
        let e: TransactionError<String> = StmError::Conflict.into();
        assert_eq!(TransactionError::Stm(StmError::Conflict), e);
    }

    #[test]
    fn abort_carries_the_user_error() {
        let e: TransactionError<&str> = TransactionError::Abort("boom");
        assert_eq!("transaction aborted: boom", e.to_string());
    }
}
