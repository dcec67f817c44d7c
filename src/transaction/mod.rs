// Copyright 2025-2026 stm-tl2 Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Transactions and the per thread dispatcher.
//!
//! Every thread owns at most one transaction object, kept in a thread
//! local slot. Reads and writes on [`TVar`](crate::TVar)s route through
//! the slot to the object, which tracks them in a stack of frames, one
//! per live nested begin. The outermost commit runs the versioned-lock
//! write-back protocol; inner commits merge into their parent frame.

pub mod frame;

use std::cell::RefCell;
use std::convert::Infallible;
use std::sync::Arc;

use log::{debug, trace};

use crate::clock;
use crate::result::{StmError, StmResult, TransactionError};
use crate::tvar::{ArcAny, VarControlBlock};
use crate::vlock;

use self::frame::Frame;

thread_local! {
    /// The per thread transaction slot.
    ///
    /// Holds at most one transaction object. The object stays in the
    /// slot across successive top level transactions on the thread and
    /// is reused once it is no longer running. It never moves to another
    /// thread.
    static CURRENT: RefCell<Option<TxSlot>> = const { RefCell::new(None) };
}

/// The two transaction flavors a thread can run.
enum TxSlot {
    ReadWrite(Transaction),
    ReadOnly(ReadTransaction),
}

/// Flavor requested by a top level entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxKind {
    ReadWrite,
    ReadOnly,
}

/// A read-write transaction: a clock snapshot plus a stack of frames.
///
/// The transaction is confined to the thread that began it and has no
/// internal synchronisation; all coordination with other threads happens
/// through the global clock and the vars' versioned locks.
pub struct Transaction {
    /// Clock snapshot taken at the outermost begin.
    ///
    /// Any var whose version is newer than this was committed after the
    /// transaction started and must not be observed.
    read_version: u64,

    /// One frame per live nested begin. Running iff non-empty.
    frames: Vec<Frame>,
}

impl Transaction {
    fn new() -> Transaction {
        Transaction {
            read_version: 0,
            frames: Vec::new(),
        }
    }

    fn is_running(&self) -> bool {
        !self.frames.is_empty()
    }

    /// Push a frame. The outermost begin snapshots the clock; nested
    /// begins inherit the snapshot.
    fn begin(&mut self, read_only: bool) -> StmResult<()> {
        match self.frames.last() {
            Some(top) if top.is_read_only() && !read_only => return Err(StmError::ReadOnly),
            Some(_) => {}
            None => {
                self.read_version = clock::snapshot();
                trace!("transaction begins at snapshot {}", self.read_version);
            }
        }
        self.frames.push(Frame::new(read_only));
        Ok(())
    }

    /// Read a var: own buffered writes first, then a consistent read
    /// against the snapshot.
    fn read(&mut self, ctrl: &Arc<VarControlBlock>) -> StmResult<ArcAny> {
        if self.frames.is_empty() {
            return Err(StmError::OutsideTransaction);
        }

        // A write buffered by this or any enclosing frame is visible.
        for frame in self.frames.iter().rev() {
            if let Some(value) = frame.buffered(ctrl) {
                return Ok(value);
            }
        }

        let value = ctrl.read_consistent(self.read_version)?;
        if let Some(top) = self.frames.last_mut() {
            top.record_read(ctrl.clone());
        }
        Ok(value)
    }

    /// Check that a write may be buffered right now.
    fn writable(&self) -> StmResult<()> {
        match self.frames.last() {
            None => Err(StmError::OutsideTransaction),
            Some(top) if top.is_read_only() => Err(StmError::ReadOnly),
            Some(_) => Ok(()),
        }
    }

    /// Buffer a write in the top frame.
    ///
    /// The write touches no global state until the outermost commit.
    fn buffer_write(&mut self, ctrl: &Arc<VarControlBlock>, value: ArcAny) -> StmResult<()> {
        self.writable()?;
        if let Some(top) = self.frames.last_mut() {
            top.record_write(ctrl.clone(), value);
        }
        Ok(())
    }

    /// Commit the top frame.
    ///
    /// An inner frame merges into its parent. The outermost read-write
    /// frame runs the write-back protocol and returns the vars whose
    /// subscribers must be notified; on a conflict the frame stays on
    /// the stack for the caller to roll back.
    fn commit(&mut self) -> StmResult<Vec<Arc<VarControlBlock>>> {
        let frame = match self.frames.pop() {
            Some(frame) => frame,
            None => return Err(StmError::OutsideTransaction),
        };

        if let Some(parent) = self.frames.last_mut() {
            frame.merge_into(parent);
            return Ok(Vec::new());
        }

        // Outermost frame. Read-only frames observe a single snapshot
        // throughout, so there is nothing to revalidate or publish.
        if frame.is_read_only() {
            return Ok(Vec::new());
        }

        match self.write_back(&frame) {
            Ok(()) => Ok(frame.writes().keys().cloned().collect()),
            Err(conflict) => {
                self.frames.push(frame);
                Err(conflict)
            }
        }
    }

    /// The write-back protocol of the outermost frame.
    ///
    /// Locks the write set in ascending id order, ticks the clock,
    /// revalidates the read set against the snapshot and publishes.
    /// On a conflict every acquired lock is restored to its previous
    /// word and nothing becomes visible.
    fn write_back(&self, frame: &Frame) -> StmResult<()> {
        let writes = frame.writes();

        // First phase: acquire all write locks. The spin has no timeout;
        // the global id order rules out deadlock among committers.
        let mut acquired: Vec<(&Arc<VarControlBlock>, u64)> = Vec::with_capacity(writes.len());
        for ctrl in writes.keys() {
            let previous = ctrl.vlock().lock_spin();
            acquired.push((ctrl, previous));
        }

        // One tick per successful read-write commit; the post-increment
        // value becomes the version of everything published below.
        let write_version = clock::tick();

        // Second phase: the snapshot must still cover every var read.
        for ctrl in frame.reads() {
            let word = ctrl.vlock().load();
            let version = if writes.contains_key(ctrl) {
                // The lock is ours; the version bits still tell whether
                // someone committed between our read and our lock.
                vlock::version_of(word)
            } else {
                if vlock::is_locked(word) {
                    // Another transaction is mid-commit on this var.
                    Transaction::release(&acquired);
                    return Err(StmError::Conflict);
                }
                word
            };
            if version > self.read_version {
                Transaction::release(&acquired);
                trace!(
                    "commit conflict: var {} moved to version {} past snapshot {}",
                    ctrl.id(),
                    version,
                    self.read_version
                );
                return Err(StmError::Conflict);
            }
        }

        // Third phase: publish. The value store happens before the
        // release store that unlocks the var at the new version.
        for (ctrl, value) in writes {
            ctrl.publish(value.clone());
            ctrl.vlock().unlock_to(write_version);
        }
        debug!(
            "committed {} vars at version {}",
            writes.len(),
            write_version
        );
        Ok(())
    }

    /// Restore the previous words of all acquired locks after an abort.
    fn release(acquired: &[(&Arc<VarControlBlock>, u64)]) {
        for (ctrl, previous) in acquired {
            ctrl.vlock().unlock_to(*previous);
        }
    }

    /// Pop the top frame; its reads and writes vanish.
    fn rollback(&mut self) -> StmResult<()> {
        match self.frames.pop() {
            Some(_) => Ok(()),
            None => Err(StmError::OutsideTransaction),
        }
    }
}

/// A read-only transaction: a clock snapshot plus a nesting depth.
///
/// Reads validate in O(1) against the snapshot, there is no read set,
/// and commit and rollback are indistinguishable. Writes always fail.
pub struct ReadTransaction {
    /// Clock snapshot taken at the outermost begin.
    read_version: u64,

    /// Count of live nested begins. Running iff positive.
    depth: usize,
}

impl ReadTransaction {
    fn new() -> ReadTransaction {
        ReadTransaction {
            read_version: 0,
            depth: 0,
        }
    }

    fn is_running(&self) -> bool {
        self.depth > 0
    }

    /// The outermost begin snapshots the clock; nested begins inherit
    /// the host's snapshot.
    fn begin(&mut self) {
        if self.depth == 0 {
            self.read_version = clock::snapshot();
            trace!("read-only transaction begins at snapshot {}", self.read_version);
        }
        self.depth += 1;
    }

    fn read(&self, ctrl: &Arc<VarControlBlock>) -> StmResult<ArcAny> {
        if self.depth == 0 {
            return Err(StmError::OutsideTransaction);
        }
        ctrl.read_consistent(self.read_version)
    }

    /// Commit and rollback both land here: there is no state to publish
    /// or undo, only the depth to unwind.
    fn end(&mut self) -> StmResult<()> {
        if self.depth == 0 {
            return Err(StmError::OutsideTransaction);
        }
        self.depth -= 1;
        Ok(())
    }
}

/// True iff a transaction is running on the current thread.
///
/// ```
/// use stm_tl2::{atomically, transaction_running};
///
/// assert!(!transaction_running());
/// atomically(|| {
///     assert!(transaction_running());
///     Ok(())
/// }).unwrap();
/// ```
pub fn transaction_running() -> bool {
    CURRENT.with(|slot| match &*slot.borrow() {
        Some(TxSlot::ReadWrite(tx)) => tx.is_running(),
        Some(TxSlot::ReadOnly(tx)) => tx.is_running(),
        None => false,
    })
}

/// Route a read to the current thread's transaction.
pub(crate) fn read_current(ctrl: &Arc<VarControlBlock>) -> StmResult<ArcAny> {
    CURRENT.with(|slot| match &mut *slot.borrow_mut() {
        Some(TxSlot::ReadWrite(tx)) => tx.read(ctrl),
        Some(TxSlot::ReadOnly(tx)) => tx.read(ctrl),
        None => Err(StmError::OutsideTransaction),
    })
}

/// Route a write to the current thread's transaction.
///
/// The var's validators run between the frame check and the buffering,
/// with the slot released, so that they can read vars transactionally.
pub(crate) fn write_current(ctrl: &Arc<VarControlBlock>, value: ArcAny) -> StmResult<()> {
    // Reject writes in read-only frames before consulting validators.
    CURRENT.with(|slot| match &*slot.borrow() {
        Some(TxSlot::ReadWrite(tx)) => tx.writable(),
        Some(TxSlot::ReadOnly(tx)) if tx.is_running() => Err(StmError::ReadOnly),
        _ => Err(StmError::OutsideTransaction),
    })?;

    if !ctrl.validate(&value) {
        return Err(StmError::Validation);
    }

    CURRENT.with(|slot| match &mut *slot.borrow_mut() {
        Some(TxSlot::ReadWrite(tx)) => tx.buffer_write(ctrl, value),
        _ => Err(StmError::OutsideTransaction),
    })
}

/// Begin a frame for a top level entry point, installing or reusing the
/// slot object.
fn begin_for(kind: TxKind) -> StmResult<()> {
    CURRENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        match slot.as_mut() {
            Some(TxSlot::ReadWrite(tx)) => return tx.begin(kind == TxKind::ReadOnly),
            Some(TxSlot::ReadOnly(tx)) => match kind {
                TxKind::ReadOnly => {
                    tx.begin();
                    return Ok(());
                }
                // A running read-only object cannot host a read-write
                // transaction.
                TxKind::ReadWrite if tx.is_running() => return Err(StmError::ReadOnly),
                // A retained, finished read-only object is replaced below.
                TxKind::ReadWrite => {}
            },
            None => {}
        }

        match kind {
            TxKind::ReadWrite => {
                let mut tx = Transaction::new();
                tx.begin(false)?;
                *slot = Some(TxSlot::ReadWrite(tx));
            }
            TxKind::ReadOnly => {
                let mut tx = ReadTransaction::new();
                tx.begin();
                *slot = Some(TxSlot::ReadOnly(tx));
            }
        }
        Ok(())
    })
}

/// Commit the current top frame. Returns the vars to notify when the
/// commit was the outermost one of a read-write transaction.
fn commit_current() -> StmResult<Vec<Arc<VarControlBlock>>> {
    CURRENT.with(|slot| match &mut *slot.borrow_mut() {
        Some(TxSlot::ReadWrite(tx)) => tx.commit(),
        Some(TxSlot::ReadOnly(tx)) => tx.end().map(|()| Vec::new()),
        None => Err(StmError::OutsideTransaction),
    })
}

/// Roll the current top frame back.
fn rollback_current() -> StmResult<()> {
    CURRENT.with(|slot| match &mut *slot.borrow_mut() {
        Some(TxSlot::ReadWrite(tx)) => tx.rollback(),
        Some(TxSlot::ReadOnly(tx)) => tx.end(),
        None => Err(StmError::OutsideTransaction),
    })
}

/// Raise the change notifications of one committed write set.
///
/// Runs with the slot released and no frame alive, so listeners may
/// start transactions of their own.
fn notify(written: &[Arc<VarControlBlock>]) {
    for ctrl in written {
        ctrl.notify_changed();
    }
}

/// Roll the frame begun by this nesting level back when the closure
/// unwinds, so that a panic never leaves tentative state behind.
struct RollbackGuard {
    armed: bool,
}

impl RollbackGuard {
    fn new() -> RollbackGuard {
        RollbackGuard { armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for RollbackGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = rollback_current();
        }
    }
}

/// Roll the conflicted frame back and decide between retrying and
/// re-raising: an inner conflict propagates upward until the outermost
/// loop can restart the whole transaction.
fn retry_or_reraise() -> StmResult<()> {
    rollback_current()?;
    if transaction_running() {
        return Err(StmError::Conflict);
    }
    trace!("conflict, retrying the transaction");
    Ok(())
}

/// The shared begin / run / commit / retry loop of all entry points.
fn run_loop<T, E, F>(kind: TxKind, f: F) -> Result<T, TransactionError<E>>
where
    F: Fn() -> Result<T, TransactionError<E>>,
{
    loop {
        begin_for(kind)?;
        let guard = RollbackGuard::new();
        let outcome = f();
        guard.disarm();

        match outcome {
            Ok(value) => match commit_current() {
                Ok(written) => {
                    notify(&written);
                    return Ok(value);
                }
                Err(StmError::Conflict) => retry_or_reraise()?,
                Err(other) => {
                    let _ = rollback_current();
                    return Err(other.into());
                }
            },
            Err(TransactionError::Stm(StmError::Conflict)) => retry_or_reraise()?,
            Err(other) => {
                let _ = rollback_current();
                return Err(other);
            }
        }
    }
}

/// Collapse the never-aborting error layer back to a plain [`StmError`].
fn demote<T>(result: Result<T, TransactionError<Infallible>>) -> StmResult<T> {
    result.map_err(|e| match e {
        TransactionError::Stm(e) => e,
        TransactionError::Abort(never) => match never {},
    })
}

/// Run a closure in a read-write transaction with automatic retry.
///
/// The closure runs against a snapshot of all vars. When a concurrent
/// writer invalidates the snapshot, the closure reruns against a fresh
/// one; the effects of failed attempts are never published. Inside an
/// already running transaction `atomically` nests: the inner frame's
/// effects become visible to the enclosing transaction when the inner
/// one commits and vanish when it rolls back.
///
/// The closure should have no side effects other than through
/// [`TVar`](crate::TVar)s, because it may run several times. Propagate
/// every error with `?` and never discard a
/// [`Conflict`](StmError::Conflict); the behavior after swallowing one
/// is unspecified.
///
/// ```
/// use stm_tl2::{atomically, TVar};
///
/// let var = TVar::new(0);
///
/// let x = atomically(|| {
///     var.write(42)?; // Pass failures on to the retry loop.
///     var.read() // Return the value buffered for the var.
/// })
/// .unwrap();
///
/// assert_eq!(x, 42);
/// ```
pub fn atomically<T, F>(f: F) -> StmResult<T>
where
    F: Fn() -> StmResult<T>,
{
    demote(run_loop(TxKind::ReadWrite, || {
        f().map_err(TransactionError::from)
    }))
}

/// Run a closure in a read-write transaction that may abort with a user
/// error.
///
/// `Abort` rolls the transaction back and surfaces the user error
/// unchanged; only conflicts are retried.
///
/// ```
/// use stm_tl2::{atomically_or_err, TransactionError, TVar};
///
/// let var = TVar::new(3);
///
/// let result: Result<(), TransactionError<String>> = atomically_or_err(|| {
///     if var.read()? % 2 != 0 {
///         return Err(TransactionError::Abort("odd value".to_string()));
///     }
///     var.write(0).map_err(TransactionError::from)
/// });
///
/// assert!(result.is_err());
/// assert_eq!(var.read_atomic(), 3);
/// ```
pub fn atomically_or_err<T, E, F>(f: F) -> Result<T, TransactionError<E>>
where
    F: Fn() -> Result<T, TransactionError<E>>,
{
    run_loop(TxKind::ReadWrite, f)
}

/// Run a closure in a read-only transaction with automatic retry.
///
/// Read-only transactions validate every read in constant time against
/// their snapshot and keep no read set, which makes them cheaper than
/// read-write transactions that happen not to write. Writes inside fail
/// with [`StmError::ReadOnly`]. Inside a running read-write transaction
/// this nests a read-only frame that still sees the enclosing frames'
/// buffered writes.
///
/// ```
/// use stm_tl2::{atomically_read_only, TVar};
///
/// let var = TVar::new(42);
///
/// let x = atomically_read_only(|| var.read()).unwrap();
/// assert_eq!(x, 42);
/// ```
pub fn atomically_read_only<T, F>(f: F) -> StmResult<T>
where
    F: Fn() -> StmResult<T>,
{
    demote(run_loop(TxKind::ReadOnly, || {
        f().map_err(TransactionError::from)
    }))
}

/// Run a closure in a read-only transaction that may abort with a user
/// error.
pub fn atomically_read_only_or_err<T, E, F>(f: F) -> Result<T, TransactionError<E>>
where
    F: Fn() -> Result<T, TransactionError<E>>,
{
    run_loop(TxKind::ReadOnly, f)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::TVar;
    use std::cell::Cell;

    #[test]
    fn reads_and_writes_need_a_transaction() {
        let var = TVar::new(0);
        assert_eq!(Err(StmError::OutsideTransaction), var.read());
        assert_eq!(Err(StmError::OutsideTransaction), var.write(1));
    }

    #[test]
    fn commit_and_rollback_need_a_transaction() {
        assert_eq!(Err(StmError::OutsideTransaction), rollback_current());
        assert!(commit_current().is_err());
    }

    #[test]
    fn inner_commit_merges_and_inner_rollback_discards() {
        let var = TVar::new(0);
        let mut tx = Transaction::new();
        tx.begin(false).unwrap();

        tx.begin(false).unwrap();
        tx.buffer_write(var.control_block(), Arc::new(42i32)).unwrap();
        tx.commit().unwrap();
        assert!(tx.is_running());
        let merged = tx.read(var.control_block()).unwrap();
        assert_eq!(42, *merged.downcast_ref::<i32>().unwrap());

        tx.begin(false).unwrap();
        tx.buffer_write(var.control_block(), Arc::new(7i32)).unwrap();
        tx.rollback().unwrap();
        let kept = tx.read(var.control_block()).unwrap();
        assert_eq!(42, *kept.downcast_ref::<i32>().unwrap());

        tx.rollback().unwrap();
        assert!(!tx.is_running());
    }

    #[test]
    fn read_write_begin_is_rejected_on_a_read_only_frame() {
        let mut tx = Transaction::new();
        tx.begin(true).unwrap();
        assert_eq!(Err(StmError::ReadOnly), tx.begin(false));
        // Deeper read-only frames are fine.
        assert_eq!(Ok(()), tx.begin(true));
    }

    #[test]
    fn writes_require_a_writable_frame() {
        let var = TVar::new(0);
        let mut tx = Transaction::new();
        assert_eq!(
            Err(StmError::OutsideTransaction),
            tx.buffer_write(var.control_block(), Arc::new(1i32))
        );

        tx.begin(false).unwrap();
        tx.begin(true).unwrap();
        assert_eq!(
            Err(StmError::ReadOnly),
            tx.buffer_write(var.control_block(), Arc::new(1i32))
        );
    }

    #[test]
    fn read_transactions_nest_and_inherit_the_snapshot() {
        let var = TVar::new(5);
        let mut tx = ReadTransaction::new();
        tx.begin();
        let outer_version = tx.read_version;

        // A tick in between must not move the nested frame's snapshot.
        clock::tick();
        tx.begin();
        assert_eq!(outer_version, tx.read_version);

        let value = tx.read(var.control_block()).unwrap();
        assert_eq!(5, *value.downcast_ref::<i32>().unwrap());

        tx.end().unwrap();
        assert!(tx.is_running());
        tx.end().unwrap();
        assert!(!tx.is_running());
        assert_eq!(Err(StmError::OutsideTransaction), tx.end());
    }

    #[test]
    fn conflicting_reads_retry_with_a_fresh_snapshot() {
        let var = TVar::new(0);
        let attempts = Cell::new(0);

        let x = atomically(|| {
            attempts.set(attempts.get() + 1);
            if attempts.get() == 1 {
                // Forge a commit landing after this transaction's
                // snapshot but before its first read.
                let version = clock::tick();
                var.control_block().vlock().lock_spin();
                var.control_block().publish(Arc::new(9i32));
                var.control_block().vlock().unlock_to(version);
            }
            var.read()
        })
        .unwrap();

        assert_eq!(9, x);
        assert_eq!(2, attempts.get());
    }

    #[test]
    fn the_slot_object_is_reused_across_transactions() {
        let var = TVar::new(1);
        atomically(|| var.write(2)).unwrap();
        assert!(!transaction_running());

        assert_eq!(Ok(2), atomically(|| var.read()));
        // A read-only entry after a read-write one goes through the
        // retained object's read-only begin.
        assert_eq!(Ok(2), atomically_read_only(|| var.read()));
        // The retained object still hosts read-write transactions.
        assert_eq!(Ok(()), atomically(|| var.write(3)));
        assert_eq!(3, var.read_atomic());
    }

    #[test]
    fn read_write_entry_replaces_a_finished_read_only_object() {
        let var = TVar::new(0);
        // The first entry on this thread installs a read-only object.
        assert_eq!(Ok(0), atomically_read_only(|| var.read()));
        // A later read-write entry swaps it for a read-write one.
        assert_eq!(Ok(()), atomically(|| var.write(1)));
        assert_eq!(1, var.read_atomic());
    }

    #[test]
    fn read_write_entry_is_rejected_inside_read_only() {
        let var = TVar::new(0);
        let result = atomically_read_only(|| atomically(|| var.write(1)));
        assert_eq!(Err(StmError::ReadOnly), result);
        assert_eq!(0, var.read_atomic());
    }
}
