use std::{
    ptr::{self, NonNull},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use log::{debug, info};
use parking_lot::Mutex;

use crate::{
    blacklist::BlackList,
    block::{BlockAllocator, HBLKSIZE, HeaderFlags, MAX_OBJ_BYTES, ObjectKind, WORD_BYTES},
    check::{CheckFailureHook, PointerChecker},
    error::{AllocError, AllocResult, fatal_violation},
    freelist::{FreeCell, FreeLists, N_CLASSES, is_small, size_class},
    stubborn::StubbornTracker,
    stw::{StopTheWorld, SuspensionBackend},
    system::{MmapMemory, OsMemory},
};

/// All-optional construction knobs, resolved against [`HeapSettings`].
#[derive(Debug, Default)]
pub struct HeapCreateInfo {
    pub initial_size: usize,
    pub increment: Option<usize>,
    pub all_interior_pointers: Option<bool>,
    pub local_threshold: Option<u32>,
    pub max_index_nodes: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct HeapSettings {
    pub initial_size: usize,
    /// Growth step when the block pool runs dry.
    pub increment: usize,
    pub all_interior_pointers: bool,
    /// Allocations per size class a thread serves from the global lists
    /// before it builds a private chain.
    pub local_threshold: u32,
    pub max_index_nodes: usize,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            initial_size: 256 * HBLKSIZE,
            increment: 64 * HBLKSIZE,
            all_interior_pointers: false,
            local_threshold: 8,
            max_index_nodes: usize::MAX,
        }
    }
}

impl HeapSettings {
    fn resolve(info: HeapCreateInfo) -> Self {
        let mut settings = Self::default();
        if info.initial_size > 0 {
            settings.initial_size = info.initial_size;
        }
        info.increment.inspect(|&val| settings.increment = val);
        info.all_interior_pointers
            .inspect(|&val| settings.all_interior_pointers = val);
        info.local_threshold
            .inspect(|&val| settings.local_threshold = val);
        info.max_index_nodes
            .inspect(|&val| settings.max_index_nodes = val);
        settings
    }
}

/// External mark/sweep policy invoked when the block pool runs dry. The
/// callee owns tracing; it works the heap through the mark-phase hooks on
/// [`HeapCore`] and reports whether anything was reclaimed.
pub trait Collector: Send {
    fn collect(&mut self, heap: &mut HeapCore) -> bool;
}

pub type OomHandler = Box<dyn Fn(usize) + Send + Sync>;

/// Everything behind the allocation lock.
pub struct HeapCore {
    pub blocks: BlockAllocator,
    pub lists: FreeLists,
    pub blacklist: BlackList,
    pub stubborn: StubbornTracker,
    os: Box<dyn OsMemory>,
    collector: Option<Box<dyn Collector>>,
    settings: HeapSettings,
    collections: usize,
}

impl HeapCore {
    fn grow(&mut self, min_bytes: usize) -> AllocResult<()> {
        let bytes = min_bytes
            .max(self.settings.increment)
            .next_multiple_of(HBLKSIZE);
        let Some(region) = self.os.acquire(bytes) else {
            return Err(AllocError::HeapExhausted {
                requested: min_bytes,
            });
        };
        self.blocks.add_region(region, bytes)?;
        info!(
            "heap grown by {} bytes to {}",
            bytes,
            self.blocks.heap_size()
        );
        Ok(())
    }

    fn collect_now(&mut self) -> bool {
        let Some(mut collector) = self.collector.take() else {
            return false;
        };
        self.collections += 1;
        debug!("running collection {}", self.collections);
        let reclaimed = collector.collect(self);
        self.collector = Some(collector);
        reclaimed
    }

    pub(crate) fn allocate(
        &mut self,
        bytes: usize,
        kind: ObjectKind,
        flags: HeaderFlags,
    ) -> AllocResult<NonNull<u8>> {
        if is_small(bytes) {
            self.alloc_small(bytes, kind)
        } else {
            self.alloc_large(bytes, kind, flags)
        }
    }

    fn alloc_small(&mut self, bytes: usize, kind: ObjectKind) -> AllocResult<NonNull<u8>> {
        if let Some(p) =
            self.lists
                .allocate(bytes, kind, &mut self.blocks, Some(&self.blacklist))?
        {
            return Ok(p);
        }
        if self.collect_now()
            && let Some(p) =
                self.lists
                    .allocate(bytes, kind, &mut self.blocks, Some(&self.blacklist))?
        {
            return Ok(p);
        }
        self.grow(HBLKSIZE)?;
        self.lists
            .allocate(bytes, kind, &mut self.blocks, Some(&self.blacklist))?
            .ok_or(AllocError::HeapExhausted { requested: bytes })
    }

    fn alloc_large(
        &mut self,
        bytes: usize,
        kind: ObjectKind,
        flags: HeaderFlags,
    ) -> AllocResult<NonNull<u8>> {
        let words = bytes.div_ceil(WORD_BYTES);
        let result = 'alloc: {
            match self
                .blocks
                .alloc_large(words, kind, flags, Some(&self.blacklist))
            {
                Ok(p) => break 'alloc Ok(p),
                Err(AllocError::HeapExhausted { .. }) => {}
                Err(err) => break 'alloc Err(err),
            }
            if self.collect_now()
                && let Ok(p) = self
                    .blocks
                    .alloc_large(words, kind, flags, Some(&self.blacklist))
            {
                break 'alloc Ok(p);
            }
            if let Err(err) = self.grow(bytes) {
                break 'alloc Err(err);
            }
            self.blocks
                .alloc_large(words, kind, flags, Some(&self.blacklist))
        };
        if result.is_ok() {
            self.lists.note_large_alloc(kind, words);
        }
        result
    }

    pub(crate) fn deallocate(&mut self, ptr: NonNull<u8>) {
        self.lists.deallocate(ptr, &mut self.blocks);
    }

    pub(crate) fn reallocate(
        &mut self,
        ptr: NonNull<u8>,
        new_bytes: usize,
    ) -> AllocResult<NonNull<u8>> {
        let addr = ptr.as_ptr() as usize;
        let Some(id) = self.blocks.find_header(addr) else {
            fatal_violation(format!("reallocate: {:#x} is not a heap object", addr));
        };
        let hdr = self.blocks.hdr(id);
        if hdr.is_free() || hdr.object_base(addr) != Some(addr) {
            fatal_violation(format!("reallocate: {:#x} is not an object base", addr));
        }
        let (kind, old_bytes, large, flags) =
            (hdr.kind, hdr.size_bytes(), hdr.is_large(), hdr.flags);

        if !large && is_small(new_bytes) {
            // same class: the slack already covers the new size
            if self.lists.class_of(new_bytes) * WORD_BYTES == old_bytes {
                return Ok(ptr);
            }
        } else if large {
            let new_words = new_bytes.div_ceil(WORD_BYTES);
            let hdr = self.blocks.hdr_mut(id);
            // shrink or grow within the same span needs no move
            if new_words * WORD_BYTES > MAX_OBJ_BYTES
                && new_words.div_ceil(HBLKSIZE / WORD_BYTES) == hdr.span_blocks
            {
                hdr.sz_words = new_words;
                self.lists
                    .note_large_resize(kind, old_bytes / WORD_BYTES, new_words);
                return Ok(ptr);
            }
        }

        let fresh = self.allocate(new_bytes, kind, flags & HeaderFlags::IGNORE_OFF_PAGE)?;
        let copy = old_bytes.min(new_bytes);
        // SAFETY: both objects are live, distinct and at least `copy` long
        unsafe { ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), copy) };
        self.deallocate(ptr);
        Ok(fresh)
    }

    pub(crate) fn take_chain(
        &mut self,
        kind: ObjectKind,
        class: usize,
        want: u32,
    ) -> AllocResult<(NonNull<FreeCell>, u32)> {
        if let Some(chain) =
            self.lists
                .take_chain(kind, class, want, &mut self.blocks, Some(&self.blacklist))?
        {
            return Ok(chain);
        }
        if self.collect_now()
            && let Some(chain) =
                self.lists
                    .take_chain(kind, class, want, &mut self.blocks, Some(&self.blacklist))?
        {
            return Ok(chain);
        }
        self.grow(HBLKSIZE)?;
        self.lists
            .take_chain(kind, class, want, &mut self.blocks, Some(&self.blacklist))?
            .ok_or(AllocError::HeapExhausted {
                requested: class * WORD_BYTES,
            })
    }

    // --- mark-phase hooks -------------------------------------------------

    pub fn apply_to_all_blocks(&self, mut visit: impl FnMut(usize)) {
        self.blocks
            .index
            .apply_to_all_blocks(&self.blocks.headers, |block, _| visit(block));
    }

    pub fn is_black_listed(&self, block: usize, len: usize) -> Option<usize> {
        self.blacklist.is_black_listed(block, len)
    }

    pub fn add_to_black_list_normal(&mut self, addr: usize) {
        let HeapCore {
            blacklist, blocks, ..
        } = self;
        blacklist.add_to_black_list_normal(addr, blocks);
    }

    pub fn add_to_black_list_stack(&mut self, addr: usize) {
        let HeapCore {
            blacklist, blocks, ..
        } = self;
        blacklist.add_to_black_list_stack(addr, blocks);
    }

    pub fn promote_black_lists(&mut self) {
        let heap_size = self.blocks.heap_size();
        self.blacklist.promote_black_lists(heap_size);
    }

    pub fn unpromote_black_lists(&mut self) {
        self.blacklist.unpromote_black_lists();
    }

    pub fn read_changed(&mut self) {
        self.stubborn.read_changed();
    }

    pub fn page_was_changed(&self, addr: usize) -> bool {
        self.stubborn.page_was_changed(addr)
    }

    pub fn collections(&self) -> usize {
        self.collections
    }
}

/// Shared heap state; one instance per independent heap.
pub struct HeapShared {
    pub core: Mutex<HeapCore>,
    pub settings: HeapSettings,
    pub gc_active: AtomicBool,
    pub epoch: AtomicUsize,
    oom_handler: Mutex<OomHandler>,
    check_failure: Mutex<Option<CheckFailureHook>>,
}

/// The heap context object. All tables hang off one `Heap`; independent
/// heaps coexist for testing.
pub struct Heap {
    inner: Arc<HeapShared>,
}

impl Heap {
    pub fn new(info: HeapCreateInfo) -> Self {
        Self::with_memory(info, Box::new(MmapMemory::new())).expect("acquire initial heap region")
    }

    pub fn with_memory(info: HeapCreateInfo, os: Box<dyn OsMemory>) -> AllocResult<Self> {
        let settings = HeapSettings::resolve(info);
        let mut core = HeapCore {
            blocks: BlockAllocator::new(settings.max_index_nodes),
            lists: FreeLists::new(),
            blacklist: BlackList::new(settings.all_interior_pointers),
            stubborn: StubbornTracker::new(),
            os,
            collector: None,
            settings: settings.clone(),
            collections: 0,
        };
        if settings.initial_size > 0 {
            core.grow(settings.initial_size)?;
        }
        Ok(Self {
            inner: Arc::new(HeapShared {
                core: Mutex::new(core),
                settings,
                gc_active: AtomicBool::new(false),
                epoch: AtomicUsize::new(0),
                oom_handler: Mutex::new(Box::new(|bytes| {
                    log::error!("out of memory allocating {} bytes", bytes);
                })),
                check_failure: Mutex::new(None),
            }),
        })
    }

    /// Replaces the out-of-memory policy. The default logs; a handler that
    /// does not escape leaves the allocation reported as failed.
    pub fn set_oom_handler(&self, handler: OomHandler) {
        *self.inner.oom_handler.lock() = handler;
    }

    /// Replaces the pointer-checker failure policy (default: log + abort).
    pub fn set_check_failure_hook(&self, hook: CheckFailureHook) {
        *self.inner.check_failure.lock() = Some(hook);
    }

    pub fn set_collector(&self, collector: Box<dyn Collector>) {
        self.inner.core.lock().collector = Some(collector);
    }

    // --- allocator entry points -------------------------------------------

    pub fn allocate(&self, bytes: usize, kind: ObjectKind) -> AllocResult<NonNull<u8>> {
        let result = self
            .inner
            .core
            .lock()
            .allocate(bytes, kind, HeaderFlags::empty());
        if result.is_err() {
            // outside the lock so the handler may call back into the heap
            (self.inner.oom_handler.lock())(bytes);
        }
        result
    }

    /// Like [`Self::allocate`], but interior pointers past the first block
    /// are not expected and no forwarding counts are installed.
    pub fn allocate_ignore_off_page(
        &self,
        bytes: usize,
        kind: ObjectKind,
    ) -> AllocResult<NonNull<u8>> {
        let result = self
            .inner
            .core
            .lock()
            .allocate(bytes, kind, HeaderFlags::IGNORE_OFF_PAGE);
        if result.is_err() {
            (self.inner.oom_handler.lock())(bytes);
        }
        result
    }

    pub fn deallocate(&self, ptr: NonNull<u8>) {
        self.inner.core.lock().deallocate(ptr);
    }

    pub fn reallocate(&self, ptr: NonNull<u8>, new_bytes: usize) -> AllocResult<NonNull<u8>> {
        let result = self.inner.core.lock().reallocate(ptr, new_bytes);
        if result.is_err() {
            (self.inner.oom_handler.lock())(new_bytes);
        }
        result
    }

    // --- stubborn objects -------------------------------------------------

    pub fn change(&self, obj: NonNull<u8>) {
        let mut core = self.inner.core.lock();
        let HeapCore {
            stubborn, blocks, ..
        } = &mut *core;
        stubborn.change(obj, blocks);
    }

    pub fn end_change(&self, obj: NonNull<u8>) {
        self.inner.core.lock().stubborn.end_change(obj);
    }

    pub fn read_changed(&self) {
        self.inner.core.lock().read_changed();
    }

    pub fn page_was_changed(&self, addr: usize) -> bool {
        self.inner.core.lock().page_was_changed(addr)
    }

    // --- object queries ---------------------------------------------------

    pub fn object_base(&self, ptr: NonNull<u8>) -> Option<NonNull<u8>> {
        let core = self.inner.core.lock();
        let addr = ptr.as_ptr() as usize;
        let id = core.blocks.find_header(addr)?;
        let hdr = core.blocks.hdr(id);
        if hdr.is_free() {
            return None;
        }
        hdr.object_base(addr)
            .and_then(|base| NonNull::new(base as *mut u8))
    }

    pub fn object_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        let core = self.inner.core.lock();
        let id = core.blocks.find_header(ptr.as_ptr() as usize)?;
        let hdr = core.blocks.hdr(id);
        (!hdr.is_free()).then(|| hdr.size_bytes())
    }

    pub fn object_kind(&self, ptr: NonNull<u8>) -> Option<ObjectKind> {
        let core = self.inner.core.lock();
        let id = core.blocks.find_header(ptr.as_ptr() as usize)?;
        let hdr = core.blocks.hdr(id);
        (!hdr.is_free()).then_some(hdr.kind)
    }

    /// Interior resolution diagnostics: (object base, forwarding hops).
    pub fn resolve_interior(&self, ptr: NonNull<u8>) -> Option<(usize, u16)> {
        let core = self.inner.core.lock();
        let addr = ptr.as_ptr() as usize;
        let (id, hops) = core.blocks.index.resolve(addr)?;
        let hdr = core.blocks.hdr(id);
        (!hdr.is_free()).then_some((hdr.block, hops))
    }

    // --- pointer checker --------------------------------------------------

    fn checker(&self) -> PointerChecker {
        match self.inner.check_failure.lock().as_ref() {
            Some(hook) => PointerChecker::with_hook(hook.clone()),
            None => PointerChecker::new(),
        }
    }

    pub fn check_same_object(&self, p: usize, q: usize) -> usize {
        let checker = self.checker();
        let core = self.inner.core.lock();
        checker.same_object(&core.blocks, p, q)
    }

    pub fn check_valid_displacement(&self, p: usize) -> usize {
        let checker = self.checker();
        let core = self.inner.core.lock();
        checker.valid_displacement(&core.blocks, p)
    }

    pub fn check_is_visible(&self, p: usize) -> usize {
        let checker = self.checker();
        let core = self.inner.core.lock();
        checker.is_visible(&core.blocks, p)
    }

    // --- collection driving -----------------------------------------------

    /// Runs `f` against the stopped world, holding the allocation lock
    /// throughout. Free-list construction takes the same lock, so no thread
    /// is mid-allocation once the stop converges.
    pub fn with_world_stopped<B: SuspensionBackend, R>(
        &self,
        stw: &mut StopTheWorld<B>,
        f: impl FnOnce(&mut HeapCore, &mut StopTheWorld<B>) -> R,
    ) -> R {
        let mut core = self.inner.core.lock();
        self.inner.gc_active.store(true, Ordering::Release);
        stw.stop_world();
        let result = f(&mut core, stw);
        stw.start_world();
        self.inner.epoch.fetch_add(1, Ordering::AcqRel);
        self.inner.gc_active.store(false, Ordering::Release);
        result
    }

    /// Runs `f` with the allocation lock held, for mark-phase bookkeeping
    /// that happens outside a full stop.
    pub fn with_core<R>(&self, f: impl FnOnce(&mut HeapCore) -> R) -> R {
        f(&mut self.inner.core.lock())
    }

    // --- statistics -------------------------------------------------------

    pub fn heap_size(&self) -> usize {
        self.inner.core.lock().blocks.heap_size()
    }

    pub fn free_bytes(&self) -> usize {
        self.inner.core.lock().blocks.free_bytes()
    }

    pub fn large_allocated_bytes(&self) -> usize {
        self.inner.core.lock().blocks.large_allocated_bytes()
    }

    pub fn max_large_allocated_bytes(&self) -> usize {
        self.inner.core.lock().blocks.max_large_allocated_bytes()
    }

    pub fn total_stack_blacklisted_bytes(&self) -> usize {
        self.inner.core.lock().blacklist.total_stack_black_listed_bytes()
    }

    pub fn collections(&self) -> usize {
        self.inner.core.lock().collections()
    }

    pub fn create_proxy(&self) -> HeapProxy {
        HeapProxy {
            heap: self.inner.clone(),
            epoch: self.inner.epoch.load(Ordering::Acquire),
            local: Box::new([[LocalEntry::Warmup(0); N_CLASSES]; LOCAL_KINDS]),
        }
    }
}

const LOCAL_KINDS: usize = 2;
const CHAIN_TARGET: u32 = 32;

#[derive(Debug, Clone, Copy)]
enum LocalEntry {
    /// Allocations served globally so far; past the threshold the thread
    /// builds a private chain.
    Warmup(u32),
    /// Head of a non-empty private free chain.
    Chain(NonNull<FreeCell>),
}

/// Thread-local allocation front end. Small pointer-free and normal objects
/// come from private per-class chains; everything else funnels through the
/// global lists under the allocation lock.
pub struct HeapProxy {
    heap: Arc<HeapShared>,
    epoch: usize,
    local: Box<[[LocalEntry; N_CLASSES]; LOCAL_KINDS]>,
}

// SAFETY: private chains are only touched by the owning thread
unsafe impl Send for HeapProxy {}

impl HeapProxy {
    /// Discards private chains after a collection; the next sweep recovers
    /// the abandoned cells.
    fn maybe_sync_epoch(&mut self) {
        let heap_epoch = self.heap.epoch.load(Ordering::Acquire);
        if self.epoch == heap_epoch {
            return;
        }
        while self.heap.gc_active.load(Ordering::Acquire) {
            std::hint::spin_loop();
        }
        for per_kind in self.local.iter_mut() {
            per_kind.fill(LocalEntry::Warmup(0));
        }
        self.epoch = self.heap.epoch.load(Ordering::Acquire);
    }

    pub fn allocate(&mut self, bytes: usize, kind: ObjectKind) -> AllocResult<NonNull<u8>> {
        self.maybe_sync_epoch();

        let local_idx = match kind {
            ObjectKind::PointerFree => 0,
            ObjectKind::Normal => 1,
            _ => return self.allocate_global(bytes, kind),
        };
        if !is_small(bytes) {
            return self.allocate_global(bytes, kind);
        }

        let class = size_class(bytes);
        let threshold = self.heap.settings.local_threshold;
        match self.local[local_idx][class] {
            LocalEntry::Warmup(n) if n < threshold => {
                self.local[local_idx][class] = LocalEntry::Warmup(n + 1);
                self.allocate_global(bytes, kind)
            }
            LocalEntry::Warmup(_) => {
                let chain = self.heap.core.lock().take_chain(kind, class, CHAIN_TARGET);
                match chain {
                    Ok((head, _got)) => {
                        self.local[local_idx][class] = LocalEntry::Chain(head);
                        Ok(self.pop_local(local_idx, class))
                    }
                    Err(err) => {
                        (self.heap.oom_handler.lock())(bytes);
                        Err(err)
                    }
                }
            }
            LocalEntry::Chain(_) => Ok(self.pop_local(local_idx, class)),
        }
    }

    fn pop_local(&mut self, local_idx: usize, class: usize) -> NonNull<u8> {
        let LocalEntry::Chain(head) = self.local[local_idx][class] else {
            unreachable!("pop_local on empty entry");
        };
        // SAFETY: chain cells are valid free objects owned by this thread
        let next = unsafe { head.as_ref().next };
        self.local[local_idx][class] = match next {
            Some(next) => LocalEntry::Chain(next),
            // skip the warmup phase next time, this class is hot
            None => LocalEntry::Warmup(self.heap.settings.local_threshold),
        };
        // SAFETY: the cell is at least one word
        unsafe { head.as_ptr().cast::<usize>().write(0) };
        head.cast()
    }

    fn allocate_global(&self, bytes: usize, kind: ObjectKind) -> AllocResult<NonNull<u8>> {
        let result = self
            .heap
            .core
            .lock()
            .allocate(bytes, kind, HeaderFlags::empty());
        if result.is_err() {
            (self.heap.oom_handler.lock())(bytes);
        }
        result
    }

    pub fn deallocate(&self, ptr: NonNull<u8>) {
        self.heap.core.lock().deallocate(ptr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MAX_JUMP;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    fn small_heap() -> Heap {
        Heap::new(HeapCreateInfo {
            initial_size: 64 * HBLKSIZE,
            ..Default::default()
        })
    }

    #[test]
    fn thousand_small_objects_are_distinct_and_resolvable() {
        let heap = small_heap();
        let mut ptrs = Vec::new();
        let mut seen = HashSet::new();

        for _ in 0..1000 {
            let p = heap.allocate(24, ObjectKind::Normal).expect("alloc");
            assert!(
                (p.as_ptr() as usize).is_multiple_of(WORD_BYTES),
                "objects must be word aligned"
            );
            assert!(seen.insert(p.as_ptr() as usize), "pointers must be distinct");
            ptrs.push(p);
        }

        for p in &ptrs {
            let size = heap.object_size(*p).expect("allocated object resolves");
            assert!(size >= 24, "size class must cover the request");
            assert_eq!(heap.object_base(*p), Some(*p));
        }
    }

    #[test]
    fn ten_megabyte_object_resolves_from_every_sampled_offset() {
        let heap = small_heap();
        let size = 10 * 1024 * 1024;
        let p = heap.allocate(size, ObjectKind::Normal).expect("large alloc");
        let base = p.as_ptr() as usize;

        let mut offsets: Vec<usize> = (0..HBLKSIZE).collect();
        offsets.extend((HBLKSIZE..size).step_by(511));
        offsets.push(size - 1);

        for off in offsets {
            let interior = NonNull::new((base + off) as *mut u8).unwrap();
            let (found, hops) = heap
                .resolve_interior(interior)
                .unwrap_or_else(|| panic!("offset {} must resolve", off));
            assert_eq!(found, base);
            assert!(
                hops <= MAX_JUMP,
                "offset {} took {} hops (limit {})",
                off,
                hops,
                MAX_JUMP
            );
        }

        assert_eq!(heap.object_size(p), Some(size.next_multiple_of(WORD_BYTES)));
        assert!(heap.large_allocated_bytes() >= size);
    }

    #[test]
    fn exhaustion_invokes_the_oom_handler_and_reports_failure() {
        struct NoMemory;
        impl OsMemory for NoMemory {
            fn acquire(&mut self, _bytes: usize) -> Option<NonNull<u8>> {
                None
            }
        }

        let heap = Heap::with_memory(
            HeapCreateInfo {
                // resolve() treats 0 as "use default", so ask for one block
                // and let the provider refuse it
                initial_size: HBLKSIZE,
                ..Default::default()
            },
            Box::new(NoMemory),
        );
        assert!(heap.is_err(), "initial acquisition must fail");

        struct GrowOnce {
            inner: MmapMemory,
            grants: usize,
        }
        impl OsMemory for GrowOnce {
            fn acquire(&mut self, bytes: usize) -> Option<NonNull<u8>> {
                if self.grants == 0 {
                    return None;
                }
                self.grants -= 1;
                self.inner.acquire(bytes)
            }
        }

        let heap = Heap::with_memory(
            HeapCreateInfo {
                initial_size: 2 * HBLKSIZE,
                increment: Some(HBLKSIZE),
                ..Default::default()
            },
            Box::new(GrowOnce {
                inner: MmapMemory::new(),
                grants: 1,
            }),
        )
        .expect("initial grant");

        let oom_calls = Arc::new(AtomicUsize::new(0));
        let counter = oom_calls.clone();
        heap.set_oom_handler(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        // 2 blocks of capacity, then the well is dry
        let err = heap
            .allocate(4 * HBLKSIZE, ObjectKind::Normal)
            .expect_err("grow must fail");
        assert!(matches!(err, AllocError::HeapExhausted { .. }));
        assert_eq!(oom_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reallocate_moves_content_and_frees_the_old_object() {
        let heap = small_heap();
        let p = heap.allocate(24, ObjectKind::Normal).unwrap();
        // SAFETY: 24 bytes allocated
        unsafe { p.as_ptr().cast::<[u8; 24]>().write([0xAB; 24]) };

        // same class: no move
        let q = heap.reallocate(p, 20).unwrap();
        assert_eq!(q, p);

        let r = heap.reallocate(p, 300).unwrap();
        assert_ne!(r, p);
        // SAFETY: at least 24 bytes live at the new object
        let copied = unsafe { r.as_ptr().cast::<[u8; 24]>().read() };
        assert_eq!(copied, [0xAB; 24]);

        // the old cell is back on the free list
        let back = heap.allocate(24, ObjectKind::Normal).unwrap();
        assert_eq!(back, p, "LIFO reuse of the reallocated-away cell");
    }

    #[test]
    fn stubborn_cycle_through_the_public_api() {
        let heap = small_heap();
        let obj = heap.allocate(48, ObjectKind::Stubborn).unwrap();
        let addr = obj.as_ptr() as usize;

        heap.change(obj);
        heap.end_change(obj);
        heap.read_changed();
        assert!(heap.page_was_changed(addr));
        heap.read_changed();
        assert!(!heap.page_was_changed(addr));
    }

    #[test]
    fn collector_hook_runs_before_the_heap_grows() {
        struct CountingCollector(Arc<AtomicUsize>);
        impl Collector for CountingCollector {
            fn collect(&mut self, heap: &mut HeapCore) -> bool {
                self.0.fetch_add(1, Ordering::SeqCst);
                // a real collector would sweep; reclaim nothing
                heap.read_changed();
                false
            }
        }

        let heap = Heap::new(HeapCreateInfo {
            initial_size: 2 * HBLKSIZE,
            increment: Some(HBLKSIZE),
            ..Default::default()
        });
        let runs = Arc::new(AtomicUsize::new(0));
        heap.set_collector(Box::new(CountingCollector(runs.clone())));

        // exhaust the two initial blocks, forcing collect-then-grow
        for _ in 0..3 {
            heap.allocate(2000, ObjectKind::Normal).unwrap();
        }
        for _ in 0..8 {
            heap.allocate(1000, ObjectKind::Normal).unwrap();
        }
        assert!(
            runs.load(Ordering::SeqCst) >= 1,
            "pool exhaustion must consult the collector before growing"
        );
        assert_eq!(heap.collections(), runs.load(Ordering::SeqCst));
    }

    #[test]
    fn proxies_hand_out_distinct_objects_across_threads() {
        let heap = Arc::new(small_heap());
        let threads = 4usize;
        let iters = 500usize;

        let seen: Arc<parking_lot::Mutex<HashSet<usize>>> =
            Arc::new(parking_lot::Mutex::new(HashSet::new()));

        let mut handles = Vec::new();
        for t in 0..threads {
            let seen = seen.clone();
            let mut proxy = heap.create_proxy();
            handles.push(std::thread::spawn(move || {
                for i in 0..iters {
                    let size = 16 + ((t + i) % 4) * 8;
                    let kind = if i % 2 == 0 {
                        ObjectKind::Normal
                    } else {
                        ObjectKind::PointerFree
                    };
                    let ptr = proxy.allocate(size, kind).expect("proxy alloc");
                    let addr = ptr.as_ptr() as usize;
                    assert!(
                        seen.lock().insert(addr),
                        "duplicate pointer across threads at {:#x}",
                        addr
                    );
                }
            }));
        }
        for h in handles {
            h.join().expect("thread panicked");
        }
        assert_eq!(seen.lock().len(), threads * iters);
    }

    #[test]
    fn uncollectable_objects_allocate_and_free_like_normal_ones() {
        let heap = small_heap();
        let p = heap.allocate(100, ObjectKind::Uncollectable).unwrap();
        assert_eq!(heap.object_kind(p), Some(ObjectKind::Uncollectable));
        heap.deallocate(p);
        let q = heap.allocate(100, ObjectKind::Uncollectable).unwrap();
        assert_eq!(q, p, "the freed cell goes back on its kind's list");
    }
}
