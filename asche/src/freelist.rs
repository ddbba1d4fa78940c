use std::ptr::{self, NonNull};

use crate::{
    blacklist::BlackList,
    block::{BlockAllocator, HBLKSIZE, MAX_OBJ_BYTES, ObjectKind, WORD_BYTES},
    error::{AllocResult, fatal_violation},
};

/// Slack added to every request so a one-past-the-end conservative pointer
/// still lands inside the object's size class.
pub const EXTRA_BYTES: usize = WORD_BYTES;

/// Requests at or below this go through the direct byte-to-class table.
pub const MAX_FAST_BYTES: usize = 255;

/// Word classes 1..=MAX_OBJ_BYTES/WORD_BYTES; index 0 is unused.
pub const N_CLASSES: usize = MAX_OBJ_BYTES / WORD_BYTES + 1;

/// Rounded word count for a request of `bytes`.
#[inline]
pub fn size_class(bytes: usize) -> usize {
    ((bytes + EXTRA_BYTES).div_ceil(WORD_BYTES)).max(1)
}

/// Does a request of `bytes` fit a shared block, or does it need whole
/// blocks of its own?
#[inline]
pub fn is_small(bytes: usize) -> bool {
    size_class(bytes) * WORD_BYTES <= MAX_OBJ_BYTES
}

/// In-band view of a free object: the first word links to the next free
/// cell of the same class. Never escapes this module.
#[repr(C)]
pub(crate) struct FreeCell {
    pub(crate) next: Option<NonNull<FreeCell>>,
}

/// Segregated free lists, one head per `(kind, word class)`.
#[derive(Debug)]
pub struct FreeLists {
    heads: Box<[[Option<NonNull<FreeCell>>; N_CLASSES]; ObjectKind::COUNT]>,
    size_map: Box<[u16]>,
    words_allocated: [usize; ObjectKind::COUNT],
    words_freed: [usize; ObjectKind::COUNT],
}

// SAFETY: list links point into heap blocks owned by the same Heap; access
// is serialized by the allocation lock
unsafe impl Send for FreeLists {}

impl Default for FreeLists {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeLists {
    pub fn new() -> Self {
        let size_map = (0..=MAX_FAST_BYTES)
            .map(|b| size_class(b) as u16)
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            heads: Box::new([[None; N_CLASSES]; ObjectKind::COUNT]),
            size_map,
            words_allocated: [0; ObjectKind::COUNT],
            words_freed: [0; ObjectKind::COUNT],
        }
    }

    #[inline]
    pub fn class_of(&self, bytes: usize) -> usize {
        if bytes <= MAX_FAST_BYTES {
            self.size_map[bytes] as usize
        } else {
            size_class(bytes)
        }
    }

    fn pop(&mut self, kind: ObjectKind, class: usize) -> Option<NonNull<FreeCell>> {
        let head = self.heads[kind.index()][class].take()?;
        // SAFETY: cells on a free list are valid FreeCell views
        self.heads[kind.index()][class] = unsafe { head.as_ref().next };
        Some(head)
    }

    fn push(&mut self, kind: ObjectKind, class: usize, ptr: NonNull<u8>) {
        let cell = ptr.cast::<FreeCell>();
        let next = self.heads[kind.index()][class];
        // SAFETY: the object is free and at least one word big
        unsafe { cell.as_ptr().write(FreeCell { next }) };
        self.heads[kind.index()][class] = Some(cell);
    }

    /// Links every cell of a freshly carved block onto the class list, in
    /// address order.
    fn carve_block(&mut self, base: usize, class: usize, kind: ObjectKind) {
        let sz_bytes = class * WORD_BYTES;
        let count = HBLKSIZE / sz_bytes;
        for i in (0..count).rev() {
            // SAFETY: base..base+HBLKSIZE is an exclusively owned fresh block
            let cell = unsafe { NonNull::new_unchecked((base + i * sz_bytes) as *mut u8) };
            self.push(kind, class, cell);
        }
    }

    /// Fast-path small allocation. `Ok(None)` means the block pool is empty
    /// and the caller should run its collection-or-growth policy and retry.
    pub fn allocate(
        &mut self,
        bytes: usize,
        kind: ObjectKind,
        blocks: &mut BlockAllocator,
        bl: Option<&BlackList>,
    ) -> AllocResult<Option<NonNull<u8>>> {
        let class = self.class_of(bytes);
        debug_assert!(class < N_CLASSES);

        if self.heads[kind.index()][class].is_none() {
            let Some(base) = blocks.alloc_small_block(class, kind, bl)? else {
                return Ok(None);
            };
            self.carve_block(base, class, kind);
        }

        let cell = self.pop(kind, class).expect("carved block yields cells");
        // the link word must not survive into the object
        // SAFETY: cell is at least one word
        unsafe { cell.as_ptr().cast::<usize>().write(0) };
        self.words_allocated[kind.index()] += class;
        Ok(Some(cell.cast()))
    }

    /// Detaches a chain of up to `want` cells for a thread-local list.
    pub fn take_chain(
        &mut self,
        kind: ObjectKind,
        class: usize,
        want: u32,
        blocks: &mut BlockAllocator,
        bl: Option<&BlackList>,
    ) -> AllocResult<Option<(NonNull<FreeCell>, u32)>> {
        if self.heads[kind.index()][class].is_none() {
            let Some(base) = blocks.alloc_small_block(class, kind, bl)? else {
                return Ok(None);
            };
            self.carve_block(base, class, kind);
        }

        let head = self.heads[kind.index()][class].expect("refilled above");
        let mut tail = head;
        let mut got = 1;
        // SAFETY: chain cells are valid FreeCell views
        unsafe {
            while got < want {
                match tail.as_ref().next {
                    Some(next) => {
                        tail = next;
                        got += 1;
                    }
                    None => break,
                }
            }
            self.heads[kind.index()][class] = tail.as_ref().next;
            tail.as_mut().next = None;
        }
        self.words_allocated[kind.index()] += got as usize * class;
        Ok(Some((head, got)))
    }

    /// Returns an object to its class list. Unknown or interior pointers
    /// are protocol violations and abort.
    pub fn deallocate(&mut self, ptr: NonNull<u8>, blocks: &mut BlockAllocator) {
        let addr = ptr.as_ptr() as usize;
        let Some(id) = blocks.find_header(addr) else {
            fatal_violation(format!("deallocate: {:#x} is not a heap object", addr));
        };
        let hdr = blocks.hdr(id);
        if hdr.is_free() {
            fatal_violation(format!(
                "deallocate: {:#x} lies in free block {:#x}",
                addr, hdr.block
            ));
        }

        if hdr.is_large() {
            if addr != hdr.block {
                fatal_violation(format!(
                    "deallocate: {:#x} is interior to large object at {:#x}",
                    addr, hdr.block
                ));
            }
            let (kind, words) = (hdr.kind, hdr.sz_words);
            blocks
                .release(addr)
                .unwrap_or_else(|err| fatal_violation(format!("release {:#x}: {}", addr, err)));
            self.words_freed[kind.index()] += words;
            return;
        }

        let (kind, class, block, sz_bytes) = (hdr.kind, hdr.sz_words, hdr.block, hdr.size_bytes());
        if !(addr - block).is_multiple_of(sz_bytes) {
            fatal_violation(format!(
                "deallocate: {:#x} is not an object base (block {:#x}, size {})",
                addr, block, sz_bytes
            ));
        }
        // wipe pointer-bearing bodies so dead links cannot retain garbage
        if kind.holds_pointers() {
            // SAFETY: the object spans sz_bytes from its base
            unsafe { ptr::write_bytes(ptr.as_ptr(), 0, sz_bytes) };
        }
        self.push(kind, class, ptr);
        self.words_freed[kind.index()] += class;
    }

    /// Large objects are carved by the block allocator directly; their
    /// words still flow through the conservation counters here.
    pub(crate) fn note_large_alloc(&mut self, kind: ObjectKind, words: usize) {
        self.words_allocated[kind.index()] += words;
    }

    pub(crate) fn note_large_resize(&mut self, kind: ObjectKind, old_words: usize, new_words: usize) {
        self.words_allocated[kind.index()] += new_words.saturating_sub(old_words);
        self.words_freed[kind.index()] += old_words.saturating_sub(new_words);
    }

    pub fn words_allocated(&self, kind: ObjectKind) -> usize {
        self.words_allocated[kind.index()]
    }

    pub fn words_freed(&self, kind: ObjectKind) -> usize {
        self.words_freed[kind.index()]
    }

    /// Live words according to the conservation counters.
    pub fn words_live(&self, kind: ObjectKind) -> usize {
        self.words_allocated[kind.index()] - self.words_freed[kind.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::{MmapMemory, OsMemory};
    use std::collections::HashSet;

    fn real_heap(blocks: usize) -> BlockAllocator {
        let mut os = MmapMemory::new();
        let region = os.acquire(blocks * HBLKSIZE).expect("mmap");
        let mut blk = BlockAllocator::new(usize::MAX);
        blk.add_region(region, blocks * HBLKSIZE).unwrap();
        blk
    }

    #[test]
    fn size_classes_round_up_with_slack() {
        let lists = FreeLists::new();
        assert_eq!(lists.class_of(1), 2);
        assert_eq!(lists.class_of(8), 2);
        assert_eq!(lists.class_of(24), 4, "24 bytes + slack word = 4 words");
        assert_eq!(lists.class_of(MAX_FAST_BYTES), size_class(MAX_FAST_BYTES));
        // table and formula must agree at the cutoff
        assert_eq!(lists.class_of(MAX_FAST_BYTES + 1), size_class(MAX_FAST_BYTES + 1));
        assert!(is_small(100));
        assert!(!is_small(MAX_OBJ_BYTES));
    }

    #[test]
    fn allocate_hands_out_distinct_cells_from_one_block() {
        let mut blocks = real_heap(4);
        let mut lists = FreeLists::new();

        let class = lists.class_of(24);
        let per_block = HBLKSIZE / (class * WORD_BYTES);
        let mut seen = HashSet::new();
        for _ in 0..per_block {
            let p = lists
                .allocate(24, ObjectKind::Normal, &mut blocks, None)
                .unwrap()
                .expect("space available");
            assert!(
                (p.as_ptr() as usize).is_multiple_of(WORD_BYTES),
                "objects must be word aligned"
            );
            assert!(seen.insert(p.as_ptr() as usize), "duplicate cell handed out");
        }
        // one block fully carved, a second one starts now
        assert_eq!(blocks.free_bytes(), 3 * HBLKSIZE);
        let extra = lists
            .allocate(24, ObjectKind::Normal, &mut blocks, None)
            .unwrap()
            .expect("refill");
        assert!(!seen.contains(&(extra.as_ptr() as usize)));
        assert_eq!(blocks.free_bytes(), 2 * HBLKSIZE);
    }

    #[test]
    fn conservation_counters_balance_over_alloc_free_cycles() {
        let mut blocks = real_heap(4);
        let mut lists = FreeLists::new();
        let class = lists.class_of(40);

        let mut live = Vec::new();
        for _ in 0..100 {
            let p = lists
                .allocate(40, ObjectKind::Normal, &mut blocks, None)
                .unwrap()
                .unwrap();
            live.push(p);
        }
        assert_eq!(lists.words_live(ObjectKind::Normal), 100 * class);

        for p in live.drain(50..) {
            lists.deallocate(p, &mut blocks);
        }
        assert_eq!(lists.words_live(ObjectKind::Normal), 50 * class);

        // freed cells never alias live ones
        let live_set: HashSet<usize> =
            live.iter().map(|p| p.as_ptr() as usize).collect();
        for _ in 0..50 {
            let p = lists
                .allocate(40, ObjectKind::Normal, &mut blocks, None)
                .unwrap()
                .unwrap();
            assert!(!live_set.contains(&(p.as_ptr() as usize)));
        }
    }

    #[test]
    fn freed_pointer_bearing_objects_are_zeroed_on_reuse() {
        let mut blocks = real_heap(2);
        let mut lists = FreeLists::new();

        let p = lists
            .allocate(32, ObjectKind::Normal, &mut blocks, None)
            .unwrap()
            .unwrap();
        // SAFETY: 32 bytes were allocated
        unsafe { p.as_ptr().cast::<[u64; 4]>().write([!0; 4]) };
        lists.deallocate(p, &mut blocks);

        let q = lists
            .allocate(32, ObjectKind::Normal, &mut blocks, None)
            .unwrap()
            .unwrap();
        assert_eq!(q, p, "LIFO reuse expected");
        // SAFETY: the class spans at least 32 bytes
        let body = unsafe { q.as_ptr().cast::<[u64; 4]>().read() };
        assert_eq!(body, [0; 4], "reused object must come back clean");
    }

    #[test]
    fn take_chain_detaches_the_requested_count() {
        let mut blocks = real_heap(2);
        let mut lists = FreeLists::new();
        let class = lists.class_of(16);

        let (head, got) = lists
            .take_chain(ObjectKind::Normal, class, 8, &mut blocks, None)
            .unwrap()
            .expect("chain");
        assert_eq!(got, 8);

        // chain is detached and terminated
        let mut count = 0;
        let mut cur = Some(head);
        while let Some(c) = cur {
            count += 1;
            // SAFETY: chain cells are valid
            cur = unsafe { c.as_ref().next };
        }
        assert_eq!(count, 8);
        assert_eq!(lists.words_allocated(ObjectKind::Normal), 8 * class);
    }

    #[test]
    #[should_panic(expected = "not a heap object")]
    fn deallocating_foreign_pointer_aborts() {
        let mut blocks = real_heap(1);
        let mut lists = FreeLists::new();
        let bogus = NonNull::new(0x10usize as *mut u8).unwrap();
        lists.deallocate(bogus, &mut blocks);
    }
}
