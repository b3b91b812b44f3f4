//! Process-wide default collector.
//!
//! The collector is an explicit value so several instances can coexist;
//! this module offers one default instance per thread as a convenience
//! wrapper, anchored at the thread's stack origin. Since the mutator
//! model is single-threaded, "per thread" and "process-wide" coincide for
//! the usual one-mutator host.

use std::cell::RefCell;
use std::ptr::NonNull;

use crate::error::GcError;
use crate::record::{Finalizer, Flags};
use crate::stack::StackBase;
use crate::statistics::GcStatistics;
use crate::{Collector, Config};

thread_local! {
    static COLLECTOR: RefCell<Option<Collector>> = RefCell::new(None);
}

/// Initialises this thread's default collector.
///
/// # Panics
///
/// Panics if the default collector is already initialised.
pub fn init(config: Config) {
    COLLECTOR.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_some() {
            panic!("default collector is already initialized");
        }
        *slot = Some(Collector::new(StackBase::current_thread(), config));
    });
}

fn with<R>(callback: impl FnOnce(&mut Collector) -> R) -> R {
    COLLECTOR.with(|slot| {
        let mut slot = slot.borrow_mut();
        let gc = slot.as_mut().expect("default collector is not initialized");
        callback(gc)
    })
}

pub fn alloc(size: usize) -> Result<NonNull<u8>, GcError> {
    with(|gc| gc.alloc(size))
}

pub fn calloc(count: usize, size: usize) -> Result<NonNull<u8>, GcError> {
    with(|gc| gc.calloc(count, size))
}

pub fn alloc_opt(
    count: usize,
    size: usize,
    flags: Flags,
    dtor: Option<Finalizer>,
) -> Result<NonNull<u8>, GcError> {
    with(|gc| gc.alloc_opt(count, size, flags, dtor))
}

pub fn realloc(ptr: *mut u8, size: usize) -> Result<NonNull<u8>, GcError> {
    with(|gc| gc.realloc(ptr, size))
}

pub fn free(ptr: *mut u8) {
    with(|gc| gc.free(ptr))
}

pub fn make_root(ptr: *mut u8) {
    with(|gc| gc.make_root(ptr))
}

pub fn unroot(ptr: *mut u8) {
    with(|gc| gc.unroot(ptr))
}

pub fn pause() {
    with(|gc| gc.pause())
}

pub fn resume() {
    with(|gc| gc.resume())
}

pub fn run() -> usize {
    with(|gc| gc.run())
}

pub fn statistics() -> GcStatistics {
    with(|gc| gc.statistics())
}

/// Shuts the default collector down; see [`Collector::shutdown`]. The
/// slot can be initialised again afterwards.
pub fn shutdown() {
    COLLECTOR.with(|slot| {
        slot.borrow_mut().take();
    });
}
