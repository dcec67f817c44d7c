// Copyright 2025-2026 stm-tl2 Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! This library implements
//! [software transactional memory](https://en.wikipedia.org/wiki/Software_transactional_memory),
//! often abbreviated with STM.
//!
//! Shared state lives in [`TVar`]s. A unit of work is a closure passed to
//! [`atomically`]: the closure runs against a snapshot of all vars, its
//! writes are buffered, and at the end everything is committed as one
//! atomic step. When a concurrent writer invalidated the snapshot in the
//! meantime, the closure transparently runs again; no partial effects
//! ever become visible.
//!
//! The engine is a variant of Transactional Locking II: a global version
//! clock stamps every commit, every var carries a versioned lock word,
//! and commits lock their write set in a fixed global order, revalidate
//! their read set and publish. Readers never take locks; a read-only
//! transaction started with [`atomically_read_only`] validates each
//! access in constant time and keeps no bookkeeping at all.
//!
//! Transactions compose: calling [`atomically`] inside a running
//! transaction opens a nested frame. Committing the frame makes its
//! effects visible to the enclosing transaction; a failure rolls back
//! just that frame.
//!
//! # Usage
//!
//! ```
//! use stm_tl2::{atomically, TVar};
//!
//! let var = TVar::new(0);
//!
//! let x = atomically(|| {
//!     var.write(42)?; // Pass failure to the retry loop.
//!     var.read() // Return the value saved in var.
//! })
//! .unwrap();
//!
//! println!("var = {}", x);
//! // var = 42
//! ```
//!
//! # Transaction safety
//!
//! Software transactional memory is completely safe in the rust sense, so
//! undefined behavior will never occur. Still there are multiple rules
//! that you should obey when dealing with it:
//!
//! * Don't run code with side effects, especially no IO-code.
//!   Transactions repeat in failure cases. Using IO would repeat this
//!   IO-code. Return a closure if you have to.
//! * Don't handle the error cases of [`StmResult`] yourself. Always use
//!   `?` and pass them on to the retry loop. In particular a swallowed
//!   [`StmError::Conflict`] leaves the transaction in an unspecified
//!   state.
//! * Don't mix locks and transactions. Your code will easily deadlock or
//!   slow down unpredictably.
//! * Don't use inner mutability to change the content of a [`TVar`].
//!
//! Panicking in a transaction is transaction-safe. The transaction aborts
//! and all changes are discarded. No poisoning or half written
//! transactions happen.
//!
//! # Speed
//!
//! Generally keep your atomic blocks as small as possible, because the
//! more time you spend, the more likely it is to collide with other
//! threads. Every accessed var increases the chance of collisions and
//! the cost of the commit time revalidation, so keep the amount of
//! accessed variables as low as needed. Prefer [`atomically_read_only`]
//! for transactions that only look at state; they validate in constant
//! time per access and commit for free.

mod clock;
mod result;
mod transaction;
mod tvar;
mod vlock;


pub use result::{StmError, StmResult, TransactionError};
pub use transaction::{
    atomically, atomically_or_err, atomically_read_only, atomically_read_only_or_err,
    transaction_running,
};
pub use tvar::TVar;
