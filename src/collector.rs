use std::mem::size_of;
use std::ptr::NonNull;

use crate::error::GcError;
use crate::record::{AllocationRecord, Finalizer, Flags};
use crate::stack::{self, RegisterFile, StackBase};
use crate::statistics::{formatted_size, GcStatistics};
use crate::table::AllocationTable;
use crate::Config;

/// The collector facade: one value per mutator, owning the allocation
/// table and the stack-base sentinel.
///
/// All managed memory flows through the allocation entry points; freeing
/// a managed region directly through the system allocator corrupts the
/// table. Collections run inline on the calling thread and are not
/// re-entrant: a finaliser must never call back into the collector it
/// runs under.
pub struct Collector {
    table: AllocationTable,
    stack_base: StackBase,
    paused: bool,
    mark_stack: Vec<*mut AllocationRecord>,
    total_collections: usize,
    total_bytes_freed: usize,
}

fn raw_alloc(count: usize, size: usize) -> *mut u8 {
    unsafe {
        if count == 0 {
            libc::malloc(size) as *mut u8
        } else {
            libc::calloc(count, size) as *mut u8
        }
    }
}

// Transient exhaustion as reported by the system allocator.
fn out_of_memory() -> bool {
    std::io::Error::last_os_error().raw_os_error() == Some(libc::ENOMEM)
}

impl Collector {
    /// Starts a collector. `stack_base` must be anchored below every
    /// frame that will later call into the collector; see
    /// [`stack_base!`](crate::stack_base) and
    /// [`StackBase::current_thread`].
    pub fn new(stack_base: StackBase, config: Config) -> Self {
        let config = config.sanitized();
        Self {
            table: AllocationTable::new(
                config.initial_capacity,
                config.min_capacity,
                config.downsize_load_factor,
                config.upsize_load_factor,
                config.sweep_factor,
            ),
            stack_base,
            paused: false,
            mark_stack: Vec::new(),
            total_collections: 0,
            total_bytes_freed: 0,
        }
    }

    /// Allocates `size` uninitialised bytes.
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, GcError> {
        self.alloc_opt(0, size, Flags::NONE, None)
    }

    /// Allocates `count * size` zeroed bytes.
    pub fn calloc(&mut self, count: usize, size: usize) -> Result<NonNull<u8>, GcError> {
        self.alloc_opt(count, size, Flags::NONE, None)
    }

    /// General allocation entry point. `count == 0` requests `size`
    /// uninitialised bytes; any other count requests `count * size`
    /// zeroed bytes. The finaliser, if any, runs exactly once when the
    /// region is reclaimed.
    ///
    /// On transient exhaustion the collector runs once and the request is
    /// retried exactly once, for the region and for its metadata alike.
    pub fn alloc_opt(
        &mut self,
        count: usize,
        size: usize,
        flags: Flags,
        dtor: Option<Finalizer>,
    ) -> Result<NonNull<u8>, GcError> {
        let bytes = if count == 0 {
            size
        } else {
            count.checked_mul(size).ok_or(GcError::OutOfMemory)?
        };

        let mut region = raw_alloc(count, size);
        if region.is_null() && out_of_memory() {
            self.run();
            region = raw_alloc(count, size);
        }
        let region = NonNull::new(region).ok_or(GcError::OutOfMemory)?;

        let mut record = self.table.put(region.as_ptr(), bytes, dtor);
        if record.is_null() {
            self.run();
            record = self.table.put(region.as_ptr(), bytes, dtor);
        }
        if record.is_null() {
            unsafe { libc::free(region.as_ptr() as *mut libc::c_void) };
            return Err(GcError::OutOfMemory);
        }
        unsafe {
            if flags.root {
                (*record).set_root(true);
            }
            if flags.leaf {
                (*record).set_leaf();
            }
        }

        if !self.paused && self.table.len() > self.table.sweep_limit() {
            self.run();
        }
        Ok(region)
    }

    /// Resizes the region at `ptr` through the system reallocator. A null
    /// `ptr` behaves as a fresh allocation without finaliser. When the
    /// region moves, its record follows and keeps the registered
    /// finaliser; tags start over, so a moved root must be re-rooted.
    pub fn realloc(&mut self, ptr: *mut u8, size: usize) -> Result<NonNull<u8>, GcError> {
        if ptr.is_null() {
            return self.alloc_opt(0, size, Flags::NONE, None);
        }
        let old = self.table.get(ptr);
        if old.is_null() {
            return Err(GcError::UnknownPointer);
        }

        let moved = unsafe { libc::realloc(ptr as *mut libc::c_void, size) } as *mut u8;
        let moved = NonNull::new(moved).ok_or(GcError::OutOfMemory)?;

        if moved.as_ptr() == ptr {
            unsafe { (*old).size = size };
            return Ok(moved);
        }

        let dtor = unsafe { (*old).dtor };
        self.table.remove(ptr);
        let mut record = self.table.put(moved.as_ptr(), size, dtor);
        if record.is_null() {
            self.run();
            record = self.table.put(moved.as_ptr(), size, dtor);
        }
        if record.is_null() {
            unsafe { libc::free(moved.as_ptr() as *mut libc::c_void) };
            return Err(GcError::OutOfMemory);
        }
        Ok(moved)
    }

    /// Finalises and releases the region at `ptr`, forgetting its record.
    /// Unknown pointers, null included, are reported and left alone.
    pub fn free(&mut self, ptr: *mut u8) {
        let record = self.table.get(ptr);
        if record.is_null() {
            log::warn!("free of unmanaged pointer {:p}", ptr);
            return;
        }
        unsafe {
            if let Some(dtor) = (*record).dtor {
                dtor(ptr, (*record).size);
            }
            libc::free(ptr as *mut libc::c_void);
        }
        self.table.remove(ptr);
    }

    /// Pins the region at `ptr` across collections. No effect on unknown
    /// pointers.
    pub fn make_root(&mut self, ptr: *mut u8) {
        let record = self.table.get(ptr);
        if !record.is_null() {
            unsafe { (*record).set_root(true) };
        }
    }

    /// Clears the root pin. No effect on unknown pointers.
    pub fn unroot(&mut self, ptr: *mut u8) {
        let record = self.table.get(ptr);
        if !record.is_null() {
            unsafe { (*record).set_root(false) };
        }
    }

    /// Suspends the automatic trigger in the allocation entry points.
    /// Explicit [`run`](Self::run) calls are unaffected.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// The recorded size of the region at `ptr`, if it is managed here.
    pub fn allocation_size(&self, ptr: *mut u8) -> Option<usize> {
        let record = self.table.get(ptr);
        if record.is_null() {
            None
        } else {
            Some(unsafe { (*record).size })
        }
    }

    pub fn statistics(&self) -> GcStatistics {
        let mut managed_bytes = 0;
        self.table.for_each(|record| {
            managed_bytes += unsafe { (*record).size };
        });
        GcStatistics {
            live_records: self.table.len(),
            capacity: self.table.capacity(),
            sweep_limit: self.table.sweep_limit(),
            managed_bytes,
            total_collections: self.total_collections,
            total_bytes_freed: self.total_bytes_freed,
        }
    }

    /// Runs a full mark-and-sweep cycle and returns the reclaimed byte
    /// count. Ignores the paused flag.
    #[inline(never)]
    pub fn run(&mut self) -> usize {
        self.mark();
        let freed = self.sweep();
        self.total_collections += 1;
        self.total_bytes_freed += freed;
        log::debug!(
            "gc({}) pause reclaimed {} ({} records live)",
            self.total_collections,
            formatted_size(freed),
            self.table.len()
        );
        freed
    }

    fn mark(&mut self) {
        self.mark_roots();

        // Spill the register file into this frame, then enter the scanner
        // through a pointer the compiler cannot see through. Both this
        // frame and the scanner's sit inside the scanned range.
        let mut registers = RegisterFile::default();
        stack::save_context(&mut registers);
        let scan: fn(&mut Collector) = Collector::mark_stack_words;
        (std::hint::black_box(scan))(self);
        std::hint::black_box(&registers);
    }

    fn mark_roots(&mut self) {
        let worklist = &mut self.mark_stack;
        self.table.for_each(|record| unsafe {
            if (*record).is_root() && !(*record).is_marked() {
                (*record).set_marked(true);
                worklist.push(record);
            }
        });
        self.trace_worklist();
    }

    #[inline(never)]
    fn mark_stack_words(&mut self) {
        let top = stack::approximate_stack_pointer();
        for word in stack::word_range(top, self.stack_base.get()) {
            self.mark_candidate(word);
        }
        self.trace_worklist();
    }

    #[inline]
    fn mark_candidate(&mut self, word: usize) {
        let record = self.table.get(word as *mut u8);
        if record.is_null() {
            return;
        }
        unsafe {
            if (*record).is_marked() {
                return;
            }
            (*record).set_marked(true);
        }
        self.mark_stack.push(record);
    }

    // Trace marked regions iteratively; the worklist bounds the depth, not
    // the host stack. Regions are read at byte stride because embedded
    // pointers need not be aligned.
    fn trace_worklist(&mut self) {
        while let Some(record) = self.mark_stack.pop() {
            let (ptr, size, leaf) = unsafe { ((*record).ptr, (*record).size, (*record).is_leaf()) };
            if leaf {
                continue;
            }
            let mut offset = 0;
            while offset + size_of::<usize>() <= size {
                let word = unsafe { (ptr.add(offset) as *const usize).read_unaligned() };
                self.mark_candidate(word);
                offset += 1;
            }
        }
    }

    fn sweep(&mut self) -> usize {
        let reclaim = |record: *mut AllocationRecord| unsafe {
            let ptr = (*record).ptr;
            if let Some(dtor) = (*record).dtor {
                dtor(ptr, (*record).size);
            }
            libc::free(ptr as *mut libc::c_void);
        };
        unsafe { self.table.sweep(reclaim) }
    }

    /// Final collection followed by table teardown. Equivalent to
    /// dropping the collector: unreachable regions are reclaimed, while
    /// surviving regions (roots included) are left allocated and become
    /// the caller's to release.
    pub fn shutdown(self) {}
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.run();
    }
}
