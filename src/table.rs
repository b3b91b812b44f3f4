use std::mem::size_of;
use std::ptr::{addr_of_mut, null_mut};

use crate::prime::next_prime;
use crate::record::{AllocationRecord, Finalizer};

/// Separately chained hash table keyed by the integer value of the
/// managed address. Owns every [`AllocationRecord`]; the managed regions
/// themselves belong to the collector until reclaimed.
///
/// Alongside the usual load-factor resizing the table carries a sweep
/// limit: an absolute record count that, once exceeded, tells the
/// collector to run at the next allocation. The limit is recomputed on
/// every resize, in both directions, and after every sweep.
pub(crate) struct AllocationTable {
    buckets: *mut *mut AllocationRecord,
    capacity: usize,
    min_capacity: usize,
    size: usize,
    downsize_factor: f64,
    upsize_factor: f64,
    sweep_factor: f64,
    sweep_limit: usize,
}

fn alloc_buckets(capacity: usize) -> *mut *mut AllocationRecord {
    let buckets = unsafe { libc::calloc(capacity, size_of::<*mut AllocationRecord>()) };
    assert!(!buckets.is_null(), "bucket array allocation failed");
    buckets as *mut *mut AllocationRecord
}

impl AllocationTable {
    pub(crate) fn new(
        initial_capacity: usize,
        min_capacity: usize,
        downsize_factor: f64,
        upsize_factor: f64,
        sweep_factor: f64,
    ) -> Self {
        let capacity = next_prime(initial_capacity.max(min_capacity));
        let mut table = Self {
            buckets: alloc_buckets(capacity),
            capacity,
            min_capacity,
            size: 0,
            downsize_factor,
            upsize_factor,
            sweep_factor,
            sweep_limit: 0,
        };
        table.update_sweep_limit();
        table
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub(crate) fn sweep_limit(&self) -> usize {
        self.sweep_limit
    }

    #[inline]
    fn bucket_of(&self, ptr: *mut u8) -> usize {
        (ptr as usize >> 3) % self.capacity
    }

    #[inline]
    fn load_factor(&self) -> f64 {
        self.size as f64 / self.capacity as f64
    }

    /// Records `ptr`, or updates the record already keyed by it. An
    /// update keeps the chain position of the old record and takes over
    /// its successor; the old record is discarded. Returns null when the
    /// metadata node cannot be allocated.
    pub(crate) fn put(
        &mut self,
        ptr: *mut u8,
        size: usize,
        dtor: Option<Finalizer>,
    ) -> *mut AllocationRecord {
        let fresh = AllocationRecord::create(ptr, size, dtor);
        if fresh.is_null() {
            return null_mut();
        }
        unsafe {
            let slot = self.buckets.add(self.bucket_of(ptr));
            let mut link = slot;
            loop {
                let node = *link;
                if node.is_null() {
                    break;
                }
                if (*node).ptr == ptr {
                    (*fresh).next = (*node).next;
                    *link = fresh;
                    AllocationRecord::destroy(node);
                    return fresh;
                }
                link = addr_of_mut!((*node).next);
            }
            (*fresh).next = *slot;
            *slot = fresh;
        }
        self.size += 1;
        if self.load_factor() > self.upsize_factor {
            self.resize(next_prime(self.capacity * 2));
        }
        fresh
    }

    pub(crate) fn get(&self, ptr: *mut u8) -> *mut AllocationRecord {
        unsafe {
            let mut node = *self.buckets.add(self.bucket_of(ptr));
            while !node.is_null() {
                if (*node).ptr == ptr {
                    return node;
                }
                node = (*node).next;
            }
        }
        null_mut()
    }

    /// Unlinks and destroys the record for `ptr`. Unknown keys are
    /// ignored. The link cursor advances past every non-matching node, so
    /// removing an interior record relinks its predecessor correctly.
    pub(crate) fn remove(&mut self, ptr: *mut u8) {
        unsafe {
            let mut link = self.buckets.add(self.bucket_of(ptr));
            loop {
                let node = *link;
                if node.is_null() {
                    return;
                }
                if (*node).ptr == ptr {
                    *link = (*node).next;
                    AllocationRecord::destroy(node);
                    break;
                }
                link = addr_of_mut!((*node).next);
            }
        }
        self.size -= 1;
        self.maybe_downsize();
    }

    fn maybe_downsize(&mut self) {
        if self.load_factor() < self.downsize_factor {
            let target = next_prime(self.capacity / 2);
            if target > self.min_capacity {
                self.resize(target);
            }
        }
    }

    fn resize(&mut self, new_capacity: usize) {
        if new_capacity <= self.min_capacity {
            return;
        }
        let old_buckets = self.buckets;
        let old_capacity = self.capacity;
        self.buckets = alloc_buckets(new_capacity);
        self.capacity = new_capacity;
        unsafe {
            for index in 0..old_capacity {
                let mut node = *old_buckets.add(index);
                while !node.is_null() {
                    let next = (*node).next;
                    let slot = self.buckets.add(self.bucket_of((*node).ptr));
                    (*node).next = *slot;
                    *slot = node;
                    node = next;
                }
            }
            libc::free(old_buckets as *mut libc::c_void);
        }
        log::trace!(
            "table resized {} -> {} buckets ({} records)",
            old_capacity,
            new_capacity,
            self.size
        );
        self.update_sweep_limit();
    }

    fn update_sweep_limit(&mut self) {
        let headroom = self.capacity.saturating_sub(self.size);
        self.sweep_limit = self.size + (self.sweep_factor * headroom as f64) as usize;
    }

    /// Walks every chain: survivors get MARK cleared, unmarked records
    /// are handed to `reclaim` (which must release the managed region)
    /// and destroyed. Returns the reclaimed byte total.
    ///
    /// # Safety
    ///
    /// `reclaim` runs while the chain is being relinked; it must not call
    /// back into the table.
    pub(crate) unsafe fn sweep(&mut self, mut reclaim: impl FnMut(*mut AllocationRecord)) -> usize {
        let mut freed = 0;
        for index in 0..self.capacity {
            let mut link = self.buckets.add(index);
            loop {
                let node = *link;
                if node.is_null() {
                    break;
                }
                if (*node).is_marked() {
                    (*node).set_marked(false);
                    link = addr_of_mut!((*node).next);
                } else {
                    *link = (*node).next;
                    freed += (*node).size;
                    reclaim(node);
                    AllocationRecord::destroy(node);
                    self.size -= 1;
                }
            }
        }
        self.maybe_downsize();
        self.update_sweep_limit();
        freed
    }

    /// Visits every record in bucket order. The callback may tag records
    /// but must not unlink them.
    pub(crate) fn for_each(&self, mut callback: impl FnMut(*mut AllocationRecord)) {
        unsafe {
            for index in 0..self.capacity {
                let mut node = *self.buckets.add(index);
                while !node.is_null() {
                    let next = (*node).next;
                    callback(node);
                    node = next;
                }
            }
        }
    }
}

impl Drop for AllocationTable {
    fn drop(&mut self) {
        unsafe {
            for index in 0..self.capacity {
                let mut node = *self.buckets.add(index);
                while !node.is_null() {
                    let next = (*node).next;
                    AllocationRecord::destroy(node);
                    node = next;
                }
            }
            libc::free(self.buckets as *mut libc::c_void);
        }
    }
}
