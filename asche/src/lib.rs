mod arena;
mod blacklist;
mod block;
mod check;
mod error;
mod freelist;
mod heap;
mod index;
mod stubborn;
mod stw;
mod system;

pub use arena::{HdrId, HeaderArena};
pub use blacklist::{BlackList, LOG_PHT_ENTRIES, PHT_ENTRIES, PageHashTable};
pub use block::{
    BlockAllocator, BlockHeader, HBLKSIZE, HeaderFlags, LOG_HBLKSIZE, MAX_OBJ_BYTES, ObjectKind,
    WORD_BYTES,
};
pub use check::{CheckFailureHook, PointerChecker};
pub use error::{AllocError, AllocResult};
pub use freelist::{EXTRA_BYTES, FreeLists, MAX_FAST_BYTES, N_CLASSES, is_small, size_class};
pub use heap::{
    Collector, Heap, HeapCore, HeapCreateInfo, HeapProxy, HeapSettings, HeapShared, OomHandler,
};
pub use index::{AddressIndex, BOTTOM_SZ, BotId, IndexSlot, MAX_JUMP, TOP_SZ};
pub use stubborn::StubbornTracker;
pub use stw::{
    CooperativeBackend, MutatorHandle, MutatorRegistry, StackVisitor, StopTheWorld, SuspendError,
    SuspendOutcome, SuspensionBackend,
};
pub use system::{MmapMemory, OsMemory, map_memory, unmap_memory};
