// Copyright 2025-2026 stm-tl2 Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::any::Any;
use std::cmp;
use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::{Mutex, RwLock};

use crate::result::{StmError, StmResult};
use crate::transaction;
use crate::vlock::{self, VersionedLock};

/// Type erased payload shared between a var and the transaction logs.
pub type ArcAny = Arc<dyn Any + Send + Sync>;

/// A listener notified after an outermost commit wrote the var.
type Subscriber = Arc<dyn Fn() + Send + Sync>;

/// A listener asked to admit a value before a write is buffered.
type Validator = Arc<dyn Fn(&ArcAny) -> bool + Send + Sync>;

/// Source of process unique var identities.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// `VarControlBlock` contains all the useful data for a `TVar` while being
/// the same type.
///
/// The control block is accessed from other threads directly whereas
/// `TVar` is just a typesafe wrapper around it.
pub struct VarControlBlock {
    /// Process unique identity, fixed for the block's lifetime.
    ///
    /// Commit time locking acquires vlocks in ascending id order, which
    /// keeps concurrent committers deadlock free.
    id: u64,

    /// The versioned lock word guarding `value`.
    ///
    /// The version field carries the clock value of the commit that last
    /// published this var and never decreases.
    vlock: VersionedLock,

    /// The inner value of the var.
    ///
    /// Only replaced while the vlock's locked flag is held by the writer.
    /// The `RwLock` makes the pointer swap itself sound; consistency
    /// against concurrent commits comes from the vlock protocol, not from
    /// holding this lock across a transaction.
    value: RwLock<ArcAny>,

    /// Listeners notified once per outermost commit that wrote this var.
    subscribers: Mutex<Vec<Subscriber>>,

    /// Listeners that admit or veto a value before it is buffered.
    validators: Mutex<Vec<Validator>>,
}

impl VarControlBlock {
    /// Create a new `VarControlBlock`.
    pub fn new<T>(val: T) -> Arc<VarControlBlock>
    where
        T: Any + Send + Sync,
    {
        let ctrl = VarControlBlock {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            vlock: VersionedLock::new(),
            value: RwLock::new(Arc::new(val)),
            subscribers: Mutex::new(Vec::new()),
            validators: Mutex::new(Vec::new()),
        };
        Arc::new(ctrl)
    }

    /// The var's stable identity.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The versioned lock word, for the commit protocol.
    pub fn vlock(&self) -> &VersionedLock {
        &self.vlock
    }

    /// Read a value that was committed no later than `read_version`.
    ///
    /// The consistent-read protocol: sample the lock word, read the
    /// value, sample the word again. A locked or changed word means a
    /// committer was active in between, so the read spins. A version
    /// newer than `read_version` belongs to a commit after our snapshot
    /// and is a conflict.
    pub fn read_consistent(&self, read_version: u64) -> StmResult<ArcAny> {
        loop {
            let pre = self.vlock.load();
            if vlock::is_locked(pre) {
                std::hint::spin_loop();
                continue;
            }
            let value = self.value.read().clone();
            let post = self.vlock.load();
            if pre != post {
                std::hint::spin_loop();
                continue;
            }
            if vlock::version_of(pre) > read_version {
                trace!(
                    "var {}: version {} is newer than snapshot {}",
                    self.id,
                    vlock::version_of(pre),
                    read_version
                );
                return Err(StmError::Conflict);
            }
            return Ok(value);
        }
    }

    /// The committed payload, bypassing any transaction.
    pub fn read_committed(&self) -> ArcAny {
        self.value.read().clone()
    }

    /// Store a new payload.
    ///
    /// The caller must hold the vlock's locked flag.
    pub fn publish(&self, value: ArcAny) {
        *self.value.write() = value;
    }

    /// Ask every validator to admit a candidate value.
    pub fn validate(&self, value: &ArcAny) -> bool {
        // Clone the list out so that validators may touch this var again.
        let validators: Vec<Validator> = self.validators.lock().clone();
        validators.iter().all(|validator| validator(value))
    }

    /// Notify all subscribers that a commit changed this var.
    ///
    /// Runs after the outermost frame is gone, outside any transactional
    /// state. A panicking listener is swallowed so it cannot poison the
    /// remaining listeners or the committed state.
    pub fn notify_changed(&self) {
        let subscribers: Vec<Subscriber> = self.subscribers.lock().clone();
        for subscriber in subscribers {
            if panic::catch_unwind(AssertUnwindSafe(|| subscriber())).is_err() {
                debug!("var {}: change listener panicked, ignored", self.id);
            }
        }
    }

    fn add_subscriber(&self, subscriber: Subscriber) {
        self.subscribers.lock().push(subscriber);
    }

    fn add_validator(&self, validator: Validator) {
        self.validators.lock().push(validator);
    }
}

// Control blocks order by their stable id so that write sets iterate,
// and therefore lock, in one global order.

impl PartialEq for VarControlBlock {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for VarControlBlock {}

impl Ord for VarControlBlock {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl PartialOrd for VarControlBlock {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A variable that can be read and written inside transactions.
///
/// `TVar` is `Clone`; clones share the same storage location. Reads and
/// writes require a running transaction on the current thread and fail
/// with [`StmError::OutsideTransaction`] otherwise.
#[derive(Clone)]
pub struct TVar<T> {
    /// The control block is the inner of the variable.
    ///
    /// The rest of `TVar` is just the typesafe interface.
    control_block: Arc<VarControlBlock>,

    /// This marker is needed so that the variable can be used in a
    /// typesafe manner.
    _marker: PhantomData<T>,
}

impl<T> TVar<T>
where
    T: Any + Sync + Send + Clone,
{
    /// Create a new `TVar`. Works inside and outside of transactions.
    pub fn new(val: T) -> TVar<T> {
        TVar {
            control_block: VarControlBlock::new(val),
            _marker: PhantomData,
        }
    }

    /// The var's process unique identity.
    ///
    /// Ids are assigned monotonically at construction and never change.
    pub fn id(&self) -> u64 {
        self.control_block.id()
    }

    /// Read the var inside the current transaction.
    ///
    /// Returns the last value this transaction buffered for the var, or
    /// else a value consistent with the transaction's clock snapshot.
    pub fn read(&self) -> StmResult<T> {
        let value = transaction::read_current(&self.control_block)?;
        Ok(TVar::downcast(value))
    }

    /// Write the var inside the current transaction.
    ///
    /// The write is buffered and only published when the outermost frame
    /// commits. Validators registered with [`TVar::on_validate`] run
    /// first; a veto fails with [`StmError::Validation`] and buffers
    /// nothing.
    pub fn write(&self, value: T) -> StmResult<()> {
        transaction::write_current(&self.control_block, Arc::new(value))
    }

    /// Modify the content of the var with the function `f`.
    ///
    /// ```
    /// # use stm_tl2::{atomically, TVar};
    /// let var = TVar::new(21);
    /// atomically(|| var.modify(|x| x * 2)).unwrap();
    ///
    /// assert_eq!(var.read_atomic(), 42);
    /// ```
    pub fn modify<F>(&self, f: F) -> StmResult<()>
    where
        F: FnOnce(T) -> T,
    {
        let old = self.read()?;
        self.write(f(old))
    }

    /// Replace the value of the var, returning the old one.
    ///
    /// ```
    /// # use stm_tl2::{atomically, TVar};
    /// let var = TVar::new(0);
    /// let old = atomically(|| var.replace(42)).unwrap();
    ///
    /// assert_eq!(old, 0);
    /// assert_eq!(var.read_atomic(), 42);
    /// ```
    pub fn replace(&self, value: T) -> StmResult<T> {
        let old = self.read()?;
        self.write(value)?;
        Ok(old)
    }

    /// Read the committed value without a transaction.
    ///
    /// It is semantically equivalent to reading the var in its own small
    /// transaction, but cheaper. Returns a clone of the value.
    pub fn read_atomic(&self) -> T {
        TVar::downcast(self.read_ref_atomic())
    }

    /// Read the committed value without a transaction, as a shared
    /// reference.
    ///
    /// Mostly used internally, but useful when cloning the inner value
    /// would be expensive.
    pub fn read_ref_atomic(&self) -> ArcAny {
        self.control_block.read_committed()
    }

    /// Register a listener that runs after every outermost commit whose
    /// write set contains this var.
    ///
    /// The listener runs outside any transactional state, once per such
    /// commit. Panics in the listener are swallowed. Listeners are never
    /// removed; a listener that captures its own var keeps the storage
    /// location alive, so capture a clone of something smaller or a
    /// [`std::sync::Weak`] where that matters.
    pub fn on_change<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.control_block.add_subscriber(Arc::new(f));
    }

    /// Register a validator consulted before a write to this var is
    /// buffered.
    ///
    /// Validators run synchronously inside the writing transaction. When
    /// any of them returns `false` the write fails with
    /// [`StmError::Validation`] and nothing is buffered.
    ///
    /// ```
    /// # use stm_tl2::{atomically, StmError, TVar};
    /// let var = TVar::new(0);
    /// var.on_validate(|value| *value >= 0);
    ///
    /// assert_eq!(Err(StmError::Validation), atomically(|| var.write(-1)));
    /// assert_eq!(var.read_atomic(), 0);
    /// ```
    pub fn on_validate<F>(&self, f: F)
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.control_block.add_validator(Arc::new(move |value: &ArcAny| {
            match value.downcast_ref::<T>() {
                Some(value) => f(value),
                None => unreachable!("TVar<T> buffered a value of a different type"),
            }
        }));
    }

    /// Check if two `TVar`s refer to the same storage location.
    pub fn ref_eq(this: &TVar<T>, other: &TVar<T>) -> bool {
        Arc::ptr_eq(&this.control_block, &other.control_block)
    }

    /// Access the control block of the var.
    pub(crate) fn control_block(&self) -> &Arc<VarControlBlock> {
        &self.control_block
    }

    /// Perform a downcast on a type erased payload.
    fn downcast(value: ArcAny) -> T {
        match value.downcast_ref::<T>() {
            Some(value) => value.clone(),
            None => unreachable!("TVar<T> holds a value of a different type"),
        }
    }
}

impl<T> Default for TVar<T>
where
    T: Any + Sync + Send + Clone + Default,
{
    fn default() -> TVar<T> {
        TVar::new(T::default())
    }
}

/// Debug output of the committed value.
///
/// The snapshot is not transactional: when another thread commits at the
/// same time, consecutive `fmt` calls may print different states.
impl<T> Debug for TVar<T>
where
    T: Any + Sync + Send + Clone + Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        let value = self.read_atomic();
        f.debug_struct("TVar").field("value", &value).finish()
    }
}
