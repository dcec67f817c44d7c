// Copyright 2025-2026 stm-tl2 Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::tvar::{ArcAny, VarControlBlock};

/// One live nested begin of a read-write transaction.
///
/// A frame tracks what its nesting level observed and tentatively wrote.
/// Committing an inner frame merges it into its parent; rolling a frame
/// back drops it, and its reads and writes vanish with it.
pub struct Frame {
    /// Read-only frames reject writes and never publish anything.
    read_only: bool,

    /// Vars observed by this frame. Membership only; duplicates collapse.
    reads: BTreeSet<Arc<VarControlBlock>>,

    /// Tentative writes, keyed and iterated in ascending var id order.
    ///
    /// The fixed iteration order makes commit time lock acquisition
    /// globally ordered and therefore deadlock free. Empty for read-only
    /// frames.
    writes: BTreeMap<Arc<VarControlBlock>, ArcAny>,
}

impl Frame {
    pub fn new(read_only: bool) -> Frame {
        Frame {
            read_only,
            reads: BTreeSet::new(),
            writes: BTreeMap::new(),
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Record that this frame observed `ctrl` through the read protocol.
    pub fn record_read(&mut self, ctrl: Arc<VarControlBlock>) {
        self.reads.insert(ctrl);
    }

    /// Buffer a write. Last writer wins per var.
    pub fn record_write(&mut self, ctrl: Arc<VarControlBlock>, value: ArcAny) {
        debug_assert!(!self.read_only);
        self.writes.insert(ctrl, value);
    }

    /// The value this frame buffered for `ctrl`, if any.
    pub fn buffered(&self, ctrl: &Arc<VarControlBlock>) -> Option<ArcAny> {
        self.writes.get(ctrl).cloned()
    }

    pub fn reads(&self) -> &BTreeSet<Arc<VarControlBlock>> {
        &self.reads
    }

    pub fn writes(&self) -> &BTreeMap<Arc<VarControlBlock>, ArcAny> {
        &self.writes
    }

    /// Merge this frame into its parent on an inner commit.
    ///
    /// Reads union into the parent's reads; writes overlay the parent's
    /// writes, last writer wins per var.
    pub fn merge_into(self, parent: &mut Frame) {
        debug_assert!(self.writes.is_empty() || !parent.read_only);
        parent.reads.extend(self.reads);
        for (ctrl, value) in self.writes {
            parent.writes.insert(ctrl, value);
        }
    }
}
