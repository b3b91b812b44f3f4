//! Conservative stack machinery.
//!
//! Everything that reads memory not known to hold typed pointers lives
//! here. The scan yields candidate *values*: word-sized integers that may
//! or may not equal a managed address. Candidates are never dereferenced;
//! the allocation table decides whether one matches a live region.

use std::mem::size_of;
use std::ptr::null_mut;

/// Sentinel for one endpoint of the conservative scan, captured from the
/// mutator's initial frame at collector start.
///
/// Every later call into the collector must come from a frame deeper than
/// the sentinel in the host's stack-growth direction; words between the
/// sentinel and the top of stack at scan time are the scanned range.
#[derive(Clone, Copy, Debug)]
pub struct StackBase(*const u8);

impl StackBase {
    /// Wraps an address inside the caller's frame. Prefer [`stack_base!`],
    /// which materialises the anchor local for you.
    ///
    /// [`stack_base!`]: crate::stack_base
    pub fn from_frame(addr: *const u8) -> Self {
        Self(addr)
    }

    /// The current thread's stack origin as reported by the platform, in
    /// place of a caller-frame anchor. Useful when no single frame
    /// encloses every future collection, e.g. for the process-wide
    /// default collector.
    pub fn current_thread() -> Self {
        Self(thread_stack_origin())
    }

    pub(crate) fn get(self) -> *const u8 {
        self.0
    }
}

/// Captures a [`StackBase`] anchored in the calling frame.
#[macro_export]
macro_rules! stack_base {
    () => {{
        let anchor = 0usize;
        $crate::stack::StackBase::from_frame(&anchor as *const usize as *const u8)
    }};
}

#[inline(always)]
pub(crate) fn approximate_stack_pointer() -> *const u8 {
    let mut result = null_mut();
    result = &mut result as *mut *mut u8 as *mut u8;
    result
}

/// Callee-saved register contents spilled by [`save_context`]. Must live
/// in a frame covered by the subsequent scan.
#[repr(C)]
#[derive(Default)]
pub(crate) struct RegisterFile([usize; 12]);

/// Spills the callee-saved register file into `out`.
///
/// The collector requires that no live managed pointer remains solely in
/// a register at the moment the stack is read. There is no portable
/// expression of that guarantee, so it is provided per architecture; on
/// targets without a spill sequence the `inline(never)` call boundary is
/// the fallback, which forces the caller's pointer-bearing registers to
/// be treated as clobbered across the call.
#[inline(never)]
pub(crate) fn save_context(out: &mut RegisterFile) {
    let slots = out.0.as_mut_ptr();
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::asm!(
            "mov [{slots}], rbx",
            "mov [{slots} + 8], rbp",
            "mov [{slots} + 16], r12",
            "mov [{slots} + 24], r13",
            "mov [{slots} + 32], r14",
            "mov [{slots} + 40], r15",
            slots = in(reg) slots,
            options(nostack)
        );
    }
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!(
            "stp x19, x20, [{slots}]",
            "stp x21, x22, [{slots}, #16]",
            "stp x23, x24, [{slots}, #32]",
            "stp x25, x26, [{slots}, #48]",
            "stp x27, x28, [{slots}, #64]",
            "stp x29, x30, [{slots}, #80]",
            slots = in(reg) slots,
            options(nostack)
        );
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        let _ = slots;
    }
}

/// Iterator over aligned word-sized candidate values between two stack
/// addresses. Endpoints may be passed in either growth direction; they
/// are ordered so the walk always runs from the lower address to the
/// higher one.
pub(crate) struct StackWords {
    cursor: usize,
    end: usize,
}

pub(crate) fn word_range(a: *const u8, b: *const u8) -> StackWords {
    let (mut lo, mut hi) = (a as usize, b as usize);
    if lo > hi {
        std::mem::swap(&mut lo, &mut hi);
    }
    // align the cursor up so every read covers a full in-range word
    let word = size_of::<usize>();
    StackWords {
        cursor: (lo + word - 1) & !(word - 1),
        end: hi,
    }
}

impl Iterator for StackWords {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let word = size_of::<usize>();
        if self.cursor + word > self.end {
            return None;
        }
        let value = unsafe { (self.cursor as *const usize).read_volatile() };
        self.cursor += word;
        Some(value)
    }
}

#[cfg(target_os = "linux")]
fn thread_stack_origin() -> *const u8 {
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return approximate_stack_pointer();
        }
        let mut base: *mut libc::c_void = null_mut();
        let mut size: libc::size_t = 0;
        libc::pthread_attr_getstack(&attr, &mut base, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        // the attribute reports the low end; the origin is the high end
        (base as usize + size) as *const u8
    }
}

#[cfg(target_os = "macos")]
fn thread_stack_origin() -> *const u8 {
    unsafe { libc::pthread_get_stackaddr_np(libc::pthread_self()) as *const u8 }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn thread_stack_origin() -> *const u8 {
    // Best effort: anchor at the current frame. Collections must then be
    // entered from frames deeper than the one that called current_thread.
    approximate_stack_pointer()
}
