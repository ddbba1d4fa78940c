//! Multi-threaded stress driver for the asche heap.
//!
//! Hammers the allocator from several mutator threads, optionally stopping
//! the world mid-run, then prints the statistics surface:
//!
//!   cargo run --bin stress -- --threads 8 --objects 50000 --stop-world

use std::{
    ptr::NonNull,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use clap::Parser;

use asche::{
    CooperativeBackend, HBLKSIZE, Heap, HeapCreateInfo, MutatorHandle, MutatorRegistry,
    ObjectKind, StackVisitor, StopTheWorld,
};

#[derive(Parser, Debug)]
#[command(about = "Allocation stress driver for the asche heap")]
struct Args {
    /// Mutator threads to run.
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Objects allocated per thread.
    #[arg(long, default_value_t = 20_000)]
    objects: usize,

    /// Largest small-object request in bytes.
    #[arg(long, default_value_t = 256)]
    max_size: usize,

    /// Initial heap size in megabytes.
    #[arg(long, default_value_t = 8)]
    heap_mb: usize,

    /// Stubborn change/end-change cycles per thread.
    #[arg(long, default_value_t = 1_000)]
    stubborn: usize,

    /// Stop the world once mid-run and walk all stacks.
    #[arg(long, default_value_t = false)]
    stop_world: bool,
}

struct CountingVisitor {
    ranges: usize,
    bytes: usize,
}

impl StackVisitor for CountingVisitor {
    fn visit_range(&mut self, low: usize, high: usize) {
        self.ranges += 1;
        self.bytes += high - low;
    }

    fn visit_word(&mut self, _word: usize) {}
}

fn mutate(heap: &Heap, registry: &MutatorRegistry, args: &Args, seed: usize) {
    let handle = MutatorHandle::register(registry);
    let mut proxy = heap.create_proxy();
    let mut live: Vec<NonNull<u8>> = Vec::with_capacity(args.objects / 2);

    for i in 0..args.objects {
        handle.safepoint();

        let size = 8 + (seed + i * 7) % args.max_size;
        let kind = if i % 3 == 0 {
            ObjectKind::PointerFree
        } else {
            ObjectKind::Normal
        };
        let ptr = handle
            .safe_region(|| proxy.allocate(size, kind))
            .expect("stress allocation");
        // touch the object so the page is really ours
        // SAFETY: at least `size` bytes were allocated
        unsafe { ptr.as_ptr().write(i as u8) };

        if i % 2 == 0 {
            live.push(ptr);
        } else {
            handle.safe_region(|| proxy.deallocate(ptr));
        }
        if live.len() >= args.objects / 2 {
            for p in live.drain(..) {
                handle.safe_region(|| proxy.deallocate(p));
            }
        }
    }

    for _ in 0..args.stubborn {
        handle.safepoint();
        let obj = handle
            .safe_region(|| heap.allocate(64, ObjectKind::Stubborn))
            .expect("stubborn allocation");
        handle.safe_region(|| heap.change(obj));
        // SAFETY: 64 bytes were allocated
        unsafe { obj.as_ptr().cast::<u64>().write(0xDEAD_BEEF) };
        handle.safe_region(|| heap.end_change(obj));
        handle.safe_region(|| heap.deallocate(obj));
    }

    for p in live {
        handle.safe_region(|| proxy.deallocate(p));
    }
}

fn main() {
    env_logger::init();
    let args = Arc::new(Args::parse());

    let heap = Arc::new(Heap::new(HeapCreateInfo {
        initial_size: args.heap_mb * 1024 * 1024,
        ..Default::default()
    }));
    let registry = MutatorRegistry::new();

    eprintln!(
        "stress: {} threads x {} objects, heap {} MiB",
        args.threads, args.objects, args.heap_mb
    );

    let started = Instant::now();
    let mut workers = Vec::new();
    for t in 0..args.threads {
        let heap = heap.clone();
        let registry = registry.clone();
        let args = args.clone();
        workers.push(thread::spawn(move || {
            mutate(&heap, &registry, &args, t * 7919);
        }));
    }

    if args.stop_world {
        thread::sleep(Duration::from_millis(20));
        let mut stw = StopTheWorld::new(CooperativeBackend::new(registry.clone()));
        heap.with_world_stopped(&mut stw, |_core, stw| {
            let mut visitor = CountingVisitor { ranges: 0, bytes: 0 };
            stw.push_all_stacks(&mut visitor);
            eprintln!(
                "stop-the-world: {} threads down, {} stack ranges, {} bytes scannable",
                stw.suspended_threads(),
                visitor.ranges,
                visitor.bytes
            );
        });
    }

    for w in workers {
        w.join().expect("mutator panicked");
    }

    eprintln!("done in {:?}", started.elapsed());
    eprintln!("  heap size:            {} blocks", heap.heap_size() / HBLKSIZE);
    eprintln!("  free:                 {} blocks", heap.free_bytes() / HBLKSIZE);
    eprintln!("  large allocated:      {} bytes", heap.large_allocated_bytes());
    eprintln!(
        "  large high-water:     {} bytes",
        heap.max_large_allocated_bytes()
    );
    eprintln!(
        "  stack blacklisted:    {} bytes",
        heap.total_stack_blacklisted_bytes()
    );
    eprintln!("  collections:          {}", heap.collections());
}
