// Copyright 2025-2026 stm-tl2 Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The global version clock.
//!
//! One process wide counter sourced by every committing writer.
//! Transactions snapshot it at their outermost begin to know which
//! commits they are allowed to observe; every successful read-write
//! commit ticks it exactly once and stamps the post-increment value on
//! every var it publishes.

use std::sync::atomic::{AtomicU64, Ordering};

static GLOBAL_CLOCK: AtomicU64 = AtomicU64::new(0);

/// The current clock value.
pub fn snapshot() -> u64 {
    GLOBAL_CLOCK.load(Ordering::Acquire)
}

/// Advance the clock by one and return the post-increment value.
///
/// This is the clock's only writer. Wraparound after 2^63 ticks is not
/// handled.
pub fn tick() -> u64 {
    GLOBAL_CLOCK.fetch_add(1, Ordering::AcqRel) + 1
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tick_returns_the_post_increment_value() {
        let before = snapshot();
        let ticked = tick();
        assert!(ticked > before);
        assert!(snapshot() >= ticked);
    }

    #[test]
    fn the_clock_never_decreases() {
        let mut last = snapshot();
        for _ in 0..100 {
            let next = tick();
            assert!(next > last);
            last = next;
        }
    }
}
