// Copyright 2025-2026 stm-tl2 Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The versioned lock word guarding each transactional variable.
//!
//! A single 64 bit word encodes both the lock state and the commit
//! version of one var: bit 63 is the locked flag, bits 0..=62 hold the
//! version. A committer sets the flag with a CAS, publishes its value,
//! and clears the flag by storing the new version in a single release
//! store. The version of any given word increases monotonically over
//! time.

use std::sync::atomic::{AtomicU64, Ordering};

/// Bit 63 marks the word as locked by a committing transaction.
pub const LOCK_BIT: u64 = 1 << 63;

/// True if the word carries the locked flag.
#[inline]
pub fn is_locked(word: u64) -> bool {
    word & LOCK_BIT != 0
}

/// The word with the locked flag set.
#[inline]
pub fn with_lock(word: u64) -> u64 {
    word | LOCK_BIT
}

/// The version bits of the word, regardless of the lock flag.
#[inline]
pub fn version_of(word: u64) -> u64 {
    word & !LOCK_BIT
}

/// A versioned spin lock over a single atomic word.
pub struct VersionedLock(AtomicU64);

impl VersionedLock {
    /// A fresh lock: unlocked, version 0.
    pub fn new() -> VersionedLock {
        VersionedLock(AtomicU64::new(0))
    }

    /// Load the raw word.
    #[inline]
    pub fn load(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Try once to set the locked flag.
    ///
    /// Returns the previous, unlocked word on success so that the caller
    /// can restore it when a commit aborts.
    pub fn try_lock(&self) -> Option<u64> {
        let word = self.0.load(Ordering::Relaxed);
        if is_locked(word) {
            return None;
        }
        self.0
            .compare_exchange(word, with_lock(word), Ordering::Acquire, Ordering::Relaxed)
            .ok()
    }

    /// Spin until the locked flag could be set and return the previous
    /// word.
    ///
    /// There is no timeout. Callers acquire locks in ascending var id
    /// order, which keeps concurrent committers deadlock free.
    pub fn lock_spin(&self) -> u64 {
        loop {
            if let Some(previous) = self.try_lock() {
                return previous;
            }
            std::hint::spin_loop();
        }
    }

    /// Store an unlocked word, releasing the lock.
    ///
    /// `word` must not carry the locked flag. The release ordering makes
    /// every value store before it visible to readers that observe the
    /// new word.
    #[inline]
    pub fn unlock_to(&self, word: u64) {
        debug_assert!(!is_locked(word));
        self.0.store(word, Ordering::Release);
    }
}

impl Default for VersionedLock {
    fn default() -> VersionedLock {
        VersionedLock::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn word_helpers() {
        assert!(!is_locked(0));
        assert!(is_locked(with_lock(0)));
        assert_eq!(0, version_of(with_lock(0)));
        assert_eq!(17, version_of(with_lock(17)));
        assert_eq!(17, version_of(17));
    }

    #[test]
    fn lock_cycle_preserves_the_version() {
        let lock = VersionedLock::new();
        let previous = lock.try_lock().expect("fresh lock must be free");
        assert_eq!(0, previous);
        assert!(is_locked(lock.load()));

        // A second attempt fails while the flag is held.
        assert!(lock.try_lock().is_none());

        lock.unlock_to(42);
        assert_eq!(42, lock.load());
        assert!(!is_locked(lock.load()));
    }

    #[test]
    fn lock_spin_returns_the_previous_word() {
        let lock = VersionedLock::new();
        lock.unlock_to(7);
        assert_eq!(7, lock.lock_spin());
        lock.unlock_to(8);
        assert_eq!(8, lock.load());
    }
}
