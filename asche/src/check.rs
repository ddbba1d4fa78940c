use std::sync::Arc;

use log::error;

use crate::block::{BlockAllocator, WORD_BYTES};

/// Called with the failed check's name and the offending address.
pub type CheckFailureHook = Arc<dyn Fn(&str, usize) + Send + Sync>;

/// Debug-mode validity oracles for pointer arithmetic.
///
/// Best effort by design: hard cases may pass erroneously, answers can be
/// stale under races, and nothing in the allocator branches on them. The
/// failure hook decides between logging and aborting; the checked pointer is
/// returned either way so call sites can stay expression-shaped.
pub struct PointerChecker {
    on_failure: CheckFailureHook,
}

impl Default for PointerChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl PointerChecker {
    /// Default policy: log and abort.
    pub fn new() -> Self {
        Self::with_hook(Arc::new(|check, addr| {
            error!("{} failed for {:#x}", check, addr);
            panic!("{} failed for {:#x}", check, addr);
        }))
    }

    pub fn with_hook(on_failure: CheckFailureHook) -> Self {
        Self { on_failure }
    }

    fn object_extent(blocks: &BlockAllocator, p: usize) -> Option<(usize, usize)> {
        let id = blocks.find_header(p)?;
        let hdr = blocks.hdr(id);
        if hdr.is_free() {
            return None;
        }
        hdr.object_base(p).map(|base| (base, hdr.size_bytes()))
    }

    /// Passes when `p` and `q` are both outside any tracked object or both
    /// inside the same one.
    pub fn same_object(&self, blocks: &BlockAllocator, p: usize, q: usize) -> usize {
        let a = Self::object_extent(blocks, p);
        let b = Self::object_extent(blocks, q);
        let ok = match (a, b) {
            (None, None) => true,
            (Some((base_a, _)), Some((base_b, _))) => base_a == base_b,
            _ => false,
        };
        if !ok {
            (self.on_failure)("same_object", p);
        }
        p
    }

    /// Passes when `p` is a plausible displacement within a tracked object,
    /// or lies outside the heap entirely.
    pub fn valid_displacement(&self, blocks: &BlockAllocator, p: usize) -> usize {
        if !blocks.is_heap_addr(p) {
            return p;
        }
        if Self::object_extent(blocks, p).is_none() {
            (self.on_failure)("valid_displacement", p);
        }
        p
    }

    /// Passes when `p` is a location the mark phase would scan: outside the
    /// heap (stack or static root), or a word-aligned slot of a
    /// pointer-bearing heap object.
    pub fn is_visible(&self, blocks: &BlockAllocator, p: usize) -> usize {
        if !blocks.is_heap_addr(p) {
            return p;
        }
        let visible = p.is_multiple_of(WORD_BYTES)
            && blocks
                .find_header(p)
                .map(|id| blocks.hdr(id))
                .is_some_and(|hdr| {
                    !hdr.is_free()
                        && hdr.kind.holds_pointers()
                        && hdr.object_index(p).is_some()
                });
        if !visible {
            (self.on_failure)("is_visible", p);
        }
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockHeader, HBLKSIZE, HeaderFlags, ObjectKind};
    use std::ptr::NonNull;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    const REGION: usize = 0x4000_0000;

    fn counting_checker() -> (PointerChecker, Arc<AtomicUsize>) {
        let failures = Arc::new(AtomicUsize::new(0));
        let counter = failures.clone();
        let checker = PointerChecker::with_hook(Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        (checker, failures)
    }

    fn heap_with_objects() -> BlockAllocator {
        let mut blk = BlockAllocator::new(usize::MAX);
        blk.add_region(NonNull::new(REGION as *mut u8).unwrap(), 8 * HBLKSIZE)
            .unwrap();
        let base = blk.take_blocks(1, None).unwrap().unwrap();
        let hdr = BlockHeader::new_small(base, 8, ObjectKind::Normal, HeaderFlags::empty());
        blk.index.install_header(base, hdr, &mut blk.headers).unwrap();
        blk
    }

    #[test]
    fn same_object_accepts_intra_object_and_foreign_pairs() {
        let blk = heap_with_objects();
        let (checker, failures) = counting_checker();
        let obj = REGION; // first object of the carved block, 64 bytes

        assert_eq!(checker.same_object(&blk, obj, obj + 32), obj);
        assert_eq!(checker.same_object(&blk, 0x10, 0x20), 0x10);
        assert_eq!(failures.load(Ordering::SeqCst), 0);

        // second object of the block is a different object
        checker.same_object(&blk, obj, obj + 64);
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        // one inside, one outside
        checker.same_object(&blk, obj, 0x10);
        assert_eq!(failures.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn valid_displacement_flags_unmapped_heap_interior() {
        let blk = heap_with_objects();
        let (checker, failures) = counting_checker();

        checker.valid_displacement(&blk, REGION + 40);
        checker.valid_displacement(&blk, 0x1234);
        assert_eq!(failures.load(Ordering::SeqCst), 0);

        // inside heap bounds but in a free block
        checker.valid_displacement(&blk, REGION + 3 * HBLKSIZE);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn is_visible_requires_scannable_location() {
        let mut blk = heap_with_objects();
        let (checker, failures) = counting_checker();

        checker.is_visible(&blk, REGION + 8);
        checker.is_visible(&blk, 0x1234); // outside the heap: assumed root
        assert_eq!(failures.load(Ordering::SeqCst), 0);

        // misaligned slot
        checker.is_visible(&blk, REGION + 3);
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        // pointer-free objects are never scanned
        let base = blk.take_blocks(1, None).unwrap().unwrap();
        let hdr =
            BlockHeader::new_small(base, 8, ObjectKind::PointerFree, HeaderFlags::empty());
        blk.index.install_header(base, hdr, &mut blk.headers).unwrap();
        checker.is_visible(&blk, base + 8);
        assert_eq!(failures.load(Ordering::SeqCst), 2);
    }

    #[test]
    #[should_panic(expected = "same_object failed")]
    fn default_hook_aborts() {
        let blk = heap_with_objects();
        let checker = PointerChecker::new();
        checker.same_object(&blk, REGION, 0x10);
    }
}
