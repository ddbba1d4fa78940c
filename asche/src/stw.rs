use std::{
    collections::{HashMap, HashSet},
    fmt,
    hash::Hash,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::error::fatal_violation;

const MAX_SUSPEND_ATTEMPTS: u32 = 5;
const SUSPEND_ACK_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendOutcome {
    Suspended,
    /// The platform reported a nonzero suspend count; leave it alone.
    AlreadySuspended,
    /// The thread died between enumeration and suspension.
    Exited,
}

#[derive(Error, Debug)]
pub enum SuspendError {
    #[error("thread did not acknowledge suspension in time")]
    Unresponsive,
}

/// Consumer of stack ranges and root words during a stopped world.
pub trait StackVisitor {
    fn visit_range(&mut self, low: usize, high: usize);
    /// A single saved register word; it may hold the only reference to an
    /// otherwise-unreachable object.
    fn visit_word(&mut self, word: usize);
}

/// Platform capability for stopping threads. The fixpoint protocol in
/// [`StopTheWorld`] is written once against this interface.
pub trait SuspensionBackend {
    type Id: Copy + Eq + Hash + fmt::Debug;

    fn self_id(&self) -> Self::Id;
    fn enumerate(&mut self) -> Vec<Self::Id>;
    /// Current suspend count, for platforms where suspension is refcounted.
    fn suspend_count(&self, id: Self::Id) -> u32;
    fn suspend(&mut self, id: Self::Id) -> Result<SuspendOutcome, SuspendError>;
    fn resume(&mut self, id: Self::Id);
    /// `[low, high)` scan bounds: the live snapshot for the calling thread,
    /// the suspended snapshot for others.
    fn stack_bounds(&self, id: Self::Id) -> Option<(usize, usize)>;
    /// Callee-saved register words of a suspended thread. None is tolerated;
    /// the stack range is still scanned.
    fn registers(&self, id: Self::Id) -> Option<Vec<usize>>;
}

/// The stop-the-world protocol. The caller must hold the allocation lock:
/// per-thread free-list construction takes that lock too, so holding it
/// already keeps new construction from starting while threads go down.
pub struct StopTheWorld<B: SuspensionBackend> {
    backend: B,
    handler_thread: Option<B::Id>,
    suspended: Vec<(B::Id, bool)>,
    stopped: bool,
}

impl<B: SuspensionBackend> StopTheWorld<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            handler_thread: None,
            suspended: Vec::new(),
            stopped: false,
        }
    }

    /// A thread the collector must never suspend (e.g. a signal handler
    /// thread).
    pub fn set_handler_thread(&mut self, id: Option<B::Id>) {
        self.handler_thread = id;
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn world_stopped(&self) -> bool {
        self.stopped
    }

    pub fn suspended_threads(&self) -> usize {
        self.suspended.len()
    }

    /// Suspends every other thread, iterating until two consecutive
    /// enumerations agree. A thread spawned after one enumeration cannot
    /// finish spawning unseen: its creator is either suspended or will show
    /// up in the next round, so the loop only converges once nothing new
    /// can appear.
    pub fn stop_world(&mut self) {
        debug_assert!(!self.stopped, "stop_world while already stopped");
        let me = self.backend.self_id();

        let mut prev: HashSet<B::Id, ahash::RandomState> = HashSet::default();
        loop {
            let mut current = self.backend.enumerate();
            current.retain(|&id| id != me && Some(id) != self.handler_thread);

            for &id in &current {
                if self.suspended.iter().any(|&(s, _)| s == id) {
                    continue;
                }
                if self.backend.suspend_count(id) > 0 {
                    self.suspended.push((id, true));
                    continue;
                }
                self.suspend_one(id);
            }

            let set: HashSet<B::Id, ahash::RandomState> = current.into_iter().collect();
            if set == prev {
                break;
            }
            prev = set;
        }

        self.stopped = true;
        debug!("world stopped, {} threads suspended", self.suspended.len());
    }

    fn suspend_one(&mut self, id: B::Id) {
        let mut attempts = 0;
        loop {
            match self.backend.suspend(id) {
                Ok(SuspendOutcome::Suspended) => {
                    self.suspended.push((id, false));
                    return;
                }
                Ok(SuspendOutcome::AlreadySuspended) | Ok(SuspendOutcome::Exited) => {
                    // nothing to resume later in either case
                    self.suspended.push((id, true));
                    return;
                }
                Err(err) => {
                    attempts += 1;
                    warn!("suspend of {:?} failed (attempt {}): {}", id, attempts, err);
                    if attempts >= MAX_SUSPEND_ATTEMPTS {
                        // a partially stopped world cannot be scanned safely
                        fatal_violation(format!(
                            "unable to suspend thread {:?} after {} attempts",
                            id, attempts
                        ));
                    }
                }
            }
        }
    }

    /// Resumes everything [`Self::stop_world`] suspended, leaving threads
    /// that were already suspended beforehand untouched.
    pub fn start_world(&mut self) {
        debug_assert!(self.stopped, "start_world without stop_world");
        for (id, was_suspended) in self.suspended.drain(..) {
            if !was_suspended {
                self.backend.resume(id);
            }
        }
        self.stopped = false;
        debug!("world restarted");
    }

    /// Feeds every thread's stack range and saved registers to the mark
    /// phase's scanner. Must run between stop and start.
    pub fn push_all_stacks(&self, visitor: &mut dyn StackVisitor) {
        debug_assert!(self.stopped, "push_all_stacks on a running world");

        let me = self.backend.self_id();
        let mut ids: Vec<B::Id> = self.suspended.iter().map(|&(id, _)| id).collect();
        ids.push(me);

        for id in ids {
            let Some((low, high)) = self.backend.stack_bounds(id) else {
                warn!("no stack bounds for {:?}, skipping", id);
                continue;
            };
            visitor.visit_range(low, high);
            match self.backend.registers(id) {
                Some(regs) => {
                    for word in regs {
                        visitor.visit_word(word);
                    }
                }
                // tolerated: the stack range was still scanned
                None => warn!("no register state for {:?}", id),
            }
        }
    }
}

/// Per-mutator suspension state shared with its [`MutatorHandle`].
#[derive(Debug)]
struct MutatorState {
    suspend_requested: AtomicBool,
    suspend_count: AtomicU32,
    exited: AtomicBool,
    /// Inside a safe region: the thread may only run on to block on the
    /// allocation lock, so it counts as stopped.
    safe_region: AtomicBool,
    stack_high: AtomicUsize,
    parked: Mutex<bool>,
    cv: Condvar,
    /// (stack pointer, callee-saved words) published at the safepoint.
    saved: Mutex<Option<(usize, Vec<usize>)>>,
}

impl MutatorState {
    fn new() -> Self {
        Self {
            suspend_requested: AtomicBool::new(false),
            suspend_count: AtomicU32::new(0),
            exited: AtomicBool::new(false),
            safe_region: AtomicBool::new(false),
            stack_high: AtomicUsize::new(0),
            parked: Mutex::new(false),
            cv: Condvar::new(),
            saved: Mutex::new(None),
        }
    }
}

type ThreadMap = HashMap<ThreadId, Arc<MutatorState>, ahash::RandomState>;

/// Shared registry of mutator threads for the cooperative backend.
#[derive(Debug, Default, Clone)]
pub struct MutatorRegistry {
    threads: Arc<Mutex<ThreadMap>>,
}

impl MutatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.lock().is_empty()
    }

    fn get(&self, id: ThreadId) -> Option<Arc<MutatorState>> {
        self.threads.lock().get(&id).cloned()
    }
}

/// Registration of the current thread as a mutator. Threads poll
/// [`Self::safepoint`] at allocation boundaries; a requested suspension
/// parks the thread there and publishes its stack snapshot.
#[derive(Debug)]
pub struct MutatorHandle {
    registry: MutatorRegistry,
    state: Arc<MutatorState>,
    id: ThreadId,
}

impl MutatorHandle {
    /// Registers the calling thread. Call this near the top of the thread's
    /// entry function so the recorded frame bounds the scannable stack.
    pub fn register(registry: &MutatorRegistry) -> Self {
        let state = Arc::new(MutatorState::new());
        let frame = 0usize;
        state
            .stack_high
            .store(&frame as *const usize as usize, Ordering::Release);

        let id = thread::current().id();
        registry.threads.lock().insert(id, state.clone());
        MutatorHandle {
            registry: registry.clone(),
            state,
            id,
        }
    }

    /// Cheap check for a pending suspension request; parks until resumed
    /// when one is posted.
    #[inline]
    pub fn safepoint(&self) {
        if self.state.suspend_requested.load(Ordering::Acquire) {
            self.park();
        }
    }

    /// Runs `f` with this thread marked safe to suspend. Use around calls
    /// that may block on the allocation lock: such a thread cannot reach a
    /// safepoint while the collector holds that lock, so the suspender
    /// accepts the published snapshot instead. The frames above the
    /// published stack pointer stay stable for the whole region.
    pub fn safe_region<R>(&self, f: impl FnOnce() -> R) -> R {
        let frame = 0usize;
        let sp = &frame as *const usize as usize;
        *self.state.saved.lock() = Some((sp, Vec::new()));
        self.state.safe_region.store(true, Ordering::Release);

        let result = f();

        self.state.safe_region.store(false, Ordering::Release);
        // a suspension posted while we were blocked parks us here, after
        // every internal lock has been released
        if self.state.suspend_requested.load(Ordering::Acquire) {
            self.park();
        }
        result
    }

    #[cold]
    fn park(&self) {
        let frame = 0usize;
        let sp = &frame as *const usize as usize;
        // parking spills the callee-saved registers into the frames below
        // sp, so the published register set is empty
        *self.state.saved.lock() = Some((sp, Vec::new()));

        let mut parked = self.state.parked.lock();
        *parked = true;
        self.state.cv.notify_all();
        while self.state.suspend_requested.load(Ordering::Acquire) {
            self.state.cv.wait(&mut parked);
        }
        *parked = false;
    }
}

impl Drop for MutatorHandle {
    fn drop(&mut self) {
        self.state.exited.store(true, Ordering::Release);
        self.registry.threads.lock().remove(&self.id);
    }
}

/// Cooperative in-process suspension backend: mutators stop themselves at
/// safepoints. OS-preemptive backends implement the same trait per
/// platform.
#[derive(Debug)]
pub struct CooperativeBackend {
    registry: MutatorRegistry,
}

impl CooperativeBackend {
    pub fn new(registry: MutatorRegistry) -> Self {
        Self { registry }
    }
}

impl SuspensionBackend for CooperativeBackend {
    type Id = ThreadId;

    fn self_id(&self) -> ThreadId {
        thread::current().id()
    }

    fn enumerate(&mut self) -> Vec<ThreadId> {
        let mut threads = self.registry.threads.lock();
        threads.retain(|_, state| !state.exited.load(Ordering::Acquire));
        threads.keys().copied().collect()
    }

    fn suspend_count(&self, id: ThreadId) -> u32 {
        self.registry
            .get(id)
            .map_or(0, |s| s.suspend_count.load(Ordering::Acquire))
    }

    fn suspend(&mut self, id: ThreadId) -> Result<SuspendOutcome, SuspendError> {
        let Some(state) = self.registry.get(id) else {
            return Ok(SuspendOutcome::Exited);
        };
        if state.exited.load(Ordering::Acquire) {
            return Ok(SuspendOutcome::Exited);
        }
        if state.suspend_count.fetch_add(1, Ordering::AcqRel) > 0 {
            return Ok(SuspendOutcome::AlreadySuspended);
        }

        state.suspend_requested.store(true, Ordering::Release);
        let deadline = Instant::now() + SUSPEND_ACK_TIMEOUT;
        let mut parked = state.parked.lock();
        while !*parked && !state.safe_region.load(Ordering::Acquire) {
            if state.exited.load(Ordering::Acquire) {
                return Ok(SuspendOutcome::Exited);
            }
            if Instant::now() >= deadline {
                drop(parked);
                state.suspend_requested.store(false, Ordering::Release);
                state.suspend_count.fetch_sub(1, Ordering::AcqRel);
                return Err(SuspendError::Unresponsive);
            }
            // short slices: safe-region entry flips an atomic without
            // signalling the condvar
            state.cv.wait_for(&mut parked, Duration::from_millis(5));
        }
        Ok(SuspendOutcome::Suspended)
    }

    fn resume(&mut self, id: ThreadId) {
        if let Some(state) = self.registry.get(id) {
            state.suspend_requested.store(false, Ordering::Release);
            state.suspend_count.fetch_sub(1, Ordering::AcqRel);
            let _parked = state.parked.lock();
            state.cv.notify_all();
        }
    }

    fn stack_bounds(&self, id: ThreadId) -> Option<(usize, usize)> {
        let state = self.registry.get(id)?;
        let high = state.stack_high.load(Ordering::Acquire);
        if id == thread::current().id() {
            let frame = 0usize;
            let low = &frame as *const usize as usize;
            return Some((low.min(high), low.max(high)));
        }
        let sp = state.saved.lock().as_ref().map(|(sp, _)| *sp)?;
        Some((sp.min(high), sp.max(high)))
    }

    fn registers(&self, id: ThreadId) -> Option<Vec<usize>> {
        let state = self.registry.get(id)?;
        if id == thread::current().id() {
            return Some(Vec::new());
        }
        state.saved.lock().as_ref().map(|(_, regs)| regs.clone())
    }
}
