use std::ptr::NonNull;

use bitflags::bitflags;
use log::warn;

use crate::{
    arena::{HdrId, HeaderArena},
    blacklist::BlackList,
    error::{AllocError, AllocResult},
    index::AddressIndex,
};

pub const LOG_HBLKSIZE: usize = 12;
/// Heap block size. Every object lives in one or more HBLKSIZE-aligned
/// blocks; the address index maps block keys, not byte addresses.
pub const HBLKSIZE: usize = 1 << LOG_HBLKSIZE;

pub const WORD_BYTES: usize = 8;

/// Largest object carved out of a shared block; anything bigger gets whole
/// blocks of its own.
pub const MAX_OBJ_BYTES: usize = HBLKSIZE / 2;

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ObjectKind {
    PointerFree = 0,
    Normal = 1,
    Uncollectable = 2,
    Stubborn = 3,
}

impl ObjectKind {
    pub const COUNT: usize = 4;

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Kinds the mark phase scans for interior references.
    #[inline]
    pub fn holds_pointers(self) -> bool {
        !matches!(self, ObjectKind::PointerFree)
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct HeaderFlags: u8 {
        /// Block is the base of a free span in the block pool.
        const FREE = 1 << 0;
        /// Block is the base of a multi-block object.
        const LARGE = 1 << 1;
        /// Interior pointers past the first block are never dereferenced;
        /// forwarding counts are not installed for this object.
        const IGNORE_OFF_PAGE = 1 << 2;
    }
}

/// Out-of-line metadata for one heap block (or one free span / large-object
/// span, stored at the span base).
#[derive(Debug)]
pub struct BlockHeader {
    pub block: usize,
    /// Object size in words. For FREE headers this is the span size.
    pub sz_words: usize,
    /// Blocks covered by this header.
    pub span_blocks: usize,
    pub kind: ObjectKind,
    pub flags: HeaderFlags,
    mark_bits: Box<[u64]>,
}

impl BlockHeader {
    pub fn new_small(
        block: usize,
        sz_words: usize,
        kind: ObjectKind,
        flags: HeaderFlags,
    ) -> Self {
        debug_assert!(sz_words * WORD_BYTES <= MAX_OBJ_BYTES);
        let objs = HBLKSIZE / (sz_words * WORD_BYTES);
        Self {
            block,
            sz_words,
            span_blocks: 1,
            kind,
            flags,
            mark_bits: vec![0u64; objs.div_ceil(64)].into_boxed_slice(),
        }
    }

    pub fn new_large(
        block: usize,
        sz_words: usize,
        kind: ObjectKind,
        flags: HeaderFlags,
    ) -> Self {
        let bytes = sz_words * WORD_BYTES;
        Self {
            block,
            sz_words,
            span_blocks: bytes.div_ceil(HBLKSIZE),
            kind,
            flags: flags | HeaderFlags::LARGE,
            mark_bits: vec![0u64; 1].into_boxed_slice(),
        }
    }

    pub fn new_free(block: usize, bytes: usize) -> Self {
        debug_assert!(bytes.is_multiple_of(HBLKSIZE));
        Self {
            block,
            sz_words: bytes / WORD_BYTES,
            span_blocks: bytes / HBLKSIZE,
            kind: ObjectKind::PointerFree,
            flags: HeaderFlags::FREE,
            mark_bits: Box::default(),
        }
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.flags.contains(HeaderFlags::FREE)
    }

    #[inline]
    pub fn is_large(&self) -> bool {
        self.flags.contains(HeaderFlags::LARGE)
    }

    #[inline]
    pub fn size_bytes(&self) -> usize {
        self.sz_words * WORD_BYTES
    }

    #[inline]
    pub fn objects_per_block(&self) -> usize {
        if self.is_large() {
            1
        } else {
            HBLKSIZE / self.size_bytes()
        }
    }

    /// Index of the object containing `addr`, or None when `addr` lies past
    /// the last full object in the block.
    pub fn object_index(&self, addr: usize) -> Option<usize> {
        let offset = addr - self.block;
        if self.is_large() {
            return (offset < self.size_bytes()).then_some(0);
        }
        let idx = offset / self.size_bytes();
        (idx < self.objects_per_block()).then_some(idx)
    }

    /// Base address of the object containing `addr`.
    pub fn object_base(&self, addr: usize) -> Option<usize> {
        self.object_index(addr).map(|idx| {
            if self.is_large() {
                self.block
            } else {
                self.block + idx * self.size_bytes()
            }
        })
    }

    #[inline]
    pub fn is_marked(&self, index: usize) -> bool {
        (self.mark_bits[index / 64] & (1 << (index % 64))) != 0
    }

    #[inline]
    pub fn set_mark(&mut self, index: usize) {
        self.mark_bits[index / 64] |= 1 << (index % 64);
    }

    #[inline]
    pub fn clear_mark(&mut self, index: usize) {
        self.mark_bits[index / 64] &= !(1 << (index % 64));
    }

    pub fn clear_all_marks(&mut self) {
        self.mark_bits.fill(0);
    }
}

#[derive(Debug, Clone, Copy)]
struct Span {
    base: usize,
    blocks: usize,
}

impl Span {
    #[inline]
    fn end(&self) -> usize {
        self.base + self.blocks * HBLKSIZE
    }
}

/// Carves, tracks and recycles whole heap blocks; all header and index
/// bookkeeping funnels through here.
#[derive(Debug)]
pub struct BlockAllocator {
    pub index: AddressIndex,
    pub headers: HeaderArena,
    /// Address-ordered free spans. Each span has a FREE header at its base.
    free_spans: Vec<Span>,
    heap_size: usize,
    least_addr: usize,
    greatest_addr: usize,
    large_allocated: usize,
    large_peak: usize,
    wasted_words: usize,
}

impl BlockAllocator {
    pub fn new(max_index_nodes: usize) -> Self {
        Self {
            index: AddressIndex::new(max_index_nodes),
            headers: HeaderArena::new(),
            free_spans: Vec::new(),
            heap_size: 0,
            least_addr: usize::MAX,
            greatest_addr: 0,
            large_allocated: 0,
            large_peak: 0,
            wasted_words: 0,
        }
    }

    /// Adds a fresh OS region to the block pool.
    pub fn add_region(&mut self, base: NonNull<u8>, bytes: usize) -> AllocResult<()> {
        let base = base.as_ptr() as usize;
        debug_assert!(base.is_multiple_of(HBLKSIZE));
        let blocks = bytes / HBLKSIZE;
        if blocks == 0 {
            return Ok(());
        }
        self.insert_free_span(base, blocks)?;
        self.heap_size += blocks * HBLKSIZE;
        self.least_addr = self.least_addr.min(base);
        self.greatest_addr = self.greatest_addr.max(base + blocks * HBLKSIZE);
        Ok(())
    }

    #[inline]
    pub fn is_heap_addr(&self, addr: usize) -> bool {
        addr >= self.least_addr && addr < self.greatest_addr
    }

    pub fn find_header(&self, addr: usize) -> Option<HdrId> {
        self.index.find_header(addr)
    }

    #[inline]
    pub fn hdr(&self, id: HdrId) -> &BlockHeader {
        self.headers.get(id)
    }

    #[inline]
    pub fn hdr_mut(&mut self, id: HdrId) -> &mut BlockHeader {
        self.headers.get_mut(id)
    }

    /// Pulls `n` contiguous blocks from the pool, honoring the blacklist.
    /// Single-block requests fall back to blacklisted memory rather than
    /// fail; multi-block requests do not.
    pub fn take_blocks(&mut self, n: usize, bl: Option<&BlackList>) -> AllocResult<Option<usize>> {
        for i in 0..self.free_spans.len() {
            let span = self.free_spans[i];
            if span.blocks < n {
                continue;
            }
            let candidate = match bl {
                Some(bl) => Self::find_in_span(span, n, bl),
                None => Some(span.base),
            };
            if let Some(base) = candidate {
                return Ok(Some(self.carve(i, base, n)?));
            }
        }

        if n == 1 && bl.is_some() {
            // every candidate was blacklisted; a small block has to come
            // from somewhere
            for i in 0..self.free_spans.len() {
                let span = self.free_spans[i];
                if span.blocks >= 1 {
                    warn!("allocating blacklisted block at {:#x}", span.base);
                    return Ok(Some(self.carve(i, span.base, 1)?));
                }
            }
        }
        Ok(None)
    }

    fn find_in_span(span: Span, n: usize, bl: &BlackList) -> Option<usize> {
        let bytes = n * HBLKSIZE;
        let mut candidate = span.base;
        while candidate + bytes <= span.end() {
            match bl.is_black_listed(candidate, bytes) {
                None => return Some(candidate),
                Some(next) => {
                    // big requests step a full spacing interval to get clear
                    // of noisy neighborhoods instead of crawling
                    let skip = if bytes >= bl.spacing() {
                        candidate + bl.spacing()
                    } else {
                        0
                    };
                    candidate = next.max(skip).next_multiple_of(HBLKSIZE);
                }
            }
        }
        None
    }

    /// Removes `[base, base + n blocks)` from the span at `span_idx`,
    /// reinstalling FREE headers on the remainders.
    fn carve(&mut self, span_idx: usize, base: usize, n: usize) -> AllocResult<usize> {
        let span = self.free_spans.remove(span_idx);
        debug_assert!(base >= span.base && base + n * HBLKSIZE <= span.end());
        self.remove_free_header(span.base);

        let pre = (base - span.base) / HBLKSIZE;
        let post = span.blocks - pre - n;
        if pre > 0 {
            self.insert_free_span(span.base, pre)?;
        }
        if post > 0 {
            self.insert_free_span(base + n * HBLKSIZE, post)?;
        }
        Ok(base)
    }

    fn remove_free_header(&mut self, base: usize) {
        let id = self
            .index
            .find_header(base)
            .expect("free span must carry a header");
        debug_assert!(self.headers.get(id).is_free());
        self.index.remove_header(base, &mut self.headers);
    }

    /// Inserts a span, coalescing with address-adjacent neighbors.
    fn insert_free_span(&mut self, base: usize, blocks: usize) -> AllocResult<()> {
        let mut base = base;
        let mut blocks = blocks;
        let pos = self
            .free_spans
            .partition_point(|s| s.base < base);

        // neighbor above
        if pos < self.free_spans.len() && base + blocks * HBLKSIZE == self.free_spans[pos].base {
            let next = self.free_spans.remove(pos);
            self.remove_free_header(next.base);
            blocks += next.blocks;
        }
        // neighbor below
        if pos > 0 && self.free_spans[pos - 1].end() == base {
            let prev = self.free_spans.remove(pos - 1);
            self.remove_free_header(prev.base);
            base = prev.base;
            blocks += prev.blocks;
        }

        if self
            .index
            .install_header(
                base,
                BlockHeader::new_free(base, blocks * HBLKSIZE),
                &mut self.headers,
            )
            .is_none()
        {
            return Err(AllocError::IndexExhausted);
        }
        let pos = self.free_spans.partition_point(|s| s.base < base);
        self.free_spans.insert(pos, Span { base, blocks });
        Ok(())
    }

    /// Allocates a multi-block object. The caller runs the
    /// collection-or-growth policy around this on `HeapExhausted`.
    pub fn alloc_large(
        &mut self,
        words: usize,
        kind: ObjectKind,
        flags: HeaderFlags,
        bl: Option<&BlackList>,
    ) -> AllocResult<NonNull<u8>> {
        let bytes = words * WORD_BYTES;
        let n = bytes.div_ceil(HBLKSIZE);
        let base = self
            .take_blocks(n, bl)?
            .ok_or(AllocError::HeapExhausted { requested: bytes })?;

        let hdr = BlockHeader::new_large(base, words, kind, flags);
        if self
            .index
            .install_header(base, hdr, &mut self.headers)
            .is_none()
        {
            self.insert_free_span(base, n)?;
            return Err(AllocError::IndexExhausted);
        }
        if !flags.contains(HeaderFlags::IGNORE_OFF_PAGE)
            && !self.index.install_counts(base, bytes)
        {
            self.index.remove_counts(base, bytes);
            self.index.remove_header(base, &mut self.headers);
            self.insert_free_span(base, n)?;
            return Err(AllocError::IndexExhausted);
        }

        self.large_allocated += n * HBLKSIZE;
        self.large_peak = self.large_peak.max(self.large_allocated);
        self.wasted_words += (n * HBLKSIZE - bytes) / WORD_BYTES;

        // SAFETY: block pool addresses originate from OsMemory regions
        Ok(unsafe { NonNull::new_unchecked(base as *mut u8) })
    }

    /// Takes one block and stamps it with a small-object header for the
    /// free-list allocator to carve.
    pub fn alloc_small_block(
        &mut self,
        sz_words: usize,
        kind: ObjectKind,
        bl: Option<&BlackList>,
    ) -> AllocResult<Option<usize>> {
        let Some(base) = self.take_blocks(1, bl)? else {
            return Ok(None);
        };
        let hdr = BlockHeader::new_small(base, sz_words, kind, HeaderFlags::empty());
        if self
            .index
            .install_header(base, hdr, &mut self.headers)
            .is_none()
        {
            self.insert_free_span(base, 1)?;
            return Err(AllocError::IndexExhausted);
        }
        Ok(Some(base))
    }

    /// Returns an allocated block (or large-object span) to the pool.
    pub fn release(&mut self, block: usize) -> AllocResult<()> {
        let id = self
            .index
            .find_header(block)
            .expect("releasing a block with no header");
        let hdr = self.headers.get(id);
        debug_assert!(!hdr.is_free());
        let span = hdr.span_blocks;
        let bytes = hdr.size_bytes();
        let large = hdr.is_large();
        let off_page = hdr.flags.contains(HeaderFlags::IGNORE_OFF_PAGE);

        if large && !off_page {
            self.index.remove_counts(block, bytes);
        }
        self.index.remove_header(block, &mut self.headers);
        if large {
            self.large_allocated -= span * HBLKSIZE;
        }
        self.insert_free_span(block, span)
    }

    pub fn heap_size(&self) -> usize {
        self.heap_size
    }

    pub fn free_bytes(&self) -> usize {
        self.free_spans.iter().map(|s| s.blocks * HBLKSIZE).sum()
    }

    pub fn large_allocated_bytes(&self) -> usize {
        self.large_allocated
    }

    pub fn max_large_allocated_bytes(&self) -> usize {
        self.large_peak
    }

    pub fn wasted_words(&self) -> usize {
        self.wasted_words
    }
}
