use std::ptr::NonNull;

use log::debug;

use crate::{
    blacklist::PageHashTable,
    block::{BlockAllocator, ObjectKind},
    error::fatal_violation,
};

const INITIAL_CHANGING: usize = 16;

/// Tracks stubborn objects between `change` and `end_change`.
///
/// While an object sits on the changing list the collector must treat its
/// whole page as dirty; the page bitmap uses the same bucket encoding as the
/// black lists. Each `change` call claims its own slot — re-entrant calls on
/// the same object are cumulative, not idempotent, and need a matching
/// number of `end_change` calls.
#[derive(Debug)]
pub struct StubbornTracker {
    changing: Vec<Option<NonNull<u8>>>,
    cursor: usize,
    changed_pages: PageHashTable,
    prev_changed_pages: PageHashTable,
}

// SAFETY: tracked pointers are never dereferenced here; access is
// serialized by the allocation lock
unsafe impl Send for StubbornTracker {}

impl Default for StubbornTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StubbornTracker {
    pub fn new() -> Self {
        Self {
            changing: vec![None; INITIAL_CHANGING],
            cursor: 0,
            changed_pages: PageHashTable::new(),
            prev_changed_pages: PageHashTable::new(),
        }
    }

    /// Opens a mutation window on a stubborn object.
    pub fn change(&mut self, obj: NonNull<u8>, blocks: &BlockAllocator) {
        let addr = obj.as_ptr() as usize;
        let Some(id) = blocks.find_header(addr) else {
            fatal_violation(format!("change: {:#x} is not a heap object", addr));
        };
        let hdr = blocks.hdr(id);
        if hdr.is_free() || hdr.kind != ObjectKind::Stubborn {
            fatal_violation(format!(
                "change: {:#x} is {:?}, not a stubborn object",
                addr, hdr.kind
            ));
        }

        self.changed_pages.set(addr);
        if self.changing[self.cursor].is_some() {
            self.advance_cursor(blocks);
        }
        self.changing[self.cursor] = Some(obj);
    }

    /// Moves the cursor to a free slot, compacting or growing the list when
    /// every slot is taken.
    fn advance_cursor(&mut self, blocks: &BlockAllocator) {
        let len = self.changing.len();
        for step in 1..len {
            let idx = (self.cursor + step) % len;
            if self.changing[idx].is_none() {
                self.cursor = idx;
                return;
            }
        }

        // full: drop entries whose object has been freed in the meantime
        for slot in &mut self.changing {
            if let Some(p) = *slot {
                let gone = blocks
                    .find_header(p.as_ptr() as usize)
                    .is_none_or(|id| blocks.hdr(id).is_free());
                if gone {
                    *slot = None;
                }
            }
        }
        if let Some(idx) = self.changing.iter().position(|s| s.is_none()) {
            self.cursor = idx;
            return;
        }

        debug!("changing list full at {} entries, growing", len);
        self.cursor = len;
        self.changing.resize(len * 2, None);
    }

    /// Closes a mutation window. The cursor check handles the common
    /// nested/sequential case without scanning.
    pub fn end_change(&mut self, obj: NonNull<u8>) {
        if self.changing[self.cursor] == Some(obj) {
            self.changing[self.cursor] = None;
            return;
        }
        let len = self.changing.len();
        for step in 1..=len {
            let idx = (self.cursor + len - step) % len;
            if self.changing[idx] == Some(obj) {
                self.changing[idx] = None;
                return;
            }
        }
        fatal_violation(format!(
            "end_change: {:#x} has no open change window",
            obj.as_ptr() as usize
        ));
    }

    /// Is any change window open for `obj`?
    pub fn is_changing(&self, obj: NonNull<u8>) -> bool {
        self.changing.contains(&Some(obj))
    }

    /// Snapshots the dirty-page set for the mark phase and starts a fresh
    /// one. Call once per collection cycle.
    pub fn read_changed(&mut self) {
        std::mem::swap(&mut self.prev_changed_pages, &mut self.changed_pages);
        self.changed_pages.clear();
    }

    /// Was `addr`'s page dirtied during the previous cycle?
    pub fn page_was_changed(&self, addr: usize) -> bool {
        self.prev_changed_pages.contains(addr)
    }

    /// Drops entries whose object the mark phase found dead.
    pub fn clean_changing_list(&mut self, mut is_live: impl FnMut(NonNull<u8>) -> bool) {
        for slot in &mut self.changing {
            if let Some(p) = *slot
                && !is_live(p)
            {
                *slot = None;
            }
        }
    }

    pub fn open_windows(&self) -> usize {
        self.changing.iter().filter(|s| s.is_some()).count()
    }
}
