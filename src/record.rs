use modular_bitfield::prelude::*;
use std::mem::size_of;
use std::ptr::null_mut;

/// Finaliser invoked on a managed region immediately before reclamation,
/// exactly once, with the region address and its recorded size.
///
/// Finalisers run inside the sweep (or an explicit free) and therefore
/// must not allocate through, or otherwise re-enter, the collector they
/// are registered with.
pub type Finalizer = unsafe fn(*mut u8, usize);

/// Allocation-time behaviour flags.
///
/// `ROOT` pins the region across collections from the moment it is
/// recorded. `LEAF` promises the region holds no managed pointers, so the
/// mark phase never reads its interior.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Flags {
    pub root: bool,
    pub leaf: bool,
}

impl Flags {
    pub const NONE: Flags = Flags { root: false, leaf: false };
    pub const ROOT: Flags = Flags { root: true, leaf: false };
    pub const LEAF: Flags = Flags { root: false, leaf: true };
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags {
            root: self.root || rhs.root,
            leaf: self.leaf || rhs.leaf,
        }
    }
}

// Tag byte carried by every record.
//
// +------+------------------------------------------------------+
// | bit  |                                                      |
// +------+------------------------------------------------------+
// | root | sticky; set at registration or by make_root          |
// | mark | set during mark, cleared during sweep                |
// | leaf | region interior is opaque to the scanner             |
// +------+------------------------------------------------------+
#[bitfield(bits = 8)]
#[derive(Clone, Copy)]
struct Tag {
    root: bool,
    mark: bool,
    leaf: bool,
    #[skip]
    __: B5,
}

/// Per-allocation metadata node. The table owns every record; the mutator
/// only ever holds the opaque region address.
#[repr(C)]
pub(crate) struct AllocationRecord {
    pub(crate) ptr: *mut u8,
    pub(crate) size: usize,
    tag: Tag,
    pub(crate) dtor: Option<Finalizer>,
    pub(crate) next: *mut AllocationRecord,
}

impl AllocationRecord {
    /// Allocates a fresh node for `ptr`. Returns null when the metadata
    /// allocation itself fails; the caller decides whether to collect and
    /// retry.
    pub(crate) fn create(ptr: *mut u8, size: usize, dtor: Option<Finalizer>) -> *mut Self {
        unsafe {
            let node = libc::malloc(size_of::<Self>()) as *mut Self;
            if node.is_null() {
                return null_mut();
            }
            node.write(Self {
                ptr,
                size,
                tag: Tag::new(),
                dtor,
                next: null_mut(),
            });
            node
        }
    }

    /// Releases the node only; the managed region is freed by the table's
    /// caller.
    pub(crate) unsafe fn destroy(node: *mut Self) {
        libc::free(node as *mut libc::c_void);
    }

    #[inline(always)]
    pub(crate) fn is_marked(&self) -> bool {
        self.tag.mark()
    }

    #[inline(always)]
    pub(crate) fn set_marked(&mut self, marked: bool) {
        self.tag.set_mark(marked);
    }

    #[inline(always)]
    pub(crate) fn is_root(&self) -> bool {
        self.tag.root()
    }

    #[inline(always)]
    pub(crate) fn set_root(&mut self, root: bool) {
        self.tag.set_root(root);
    }

    #[inline(always)]
    pub(crate) fn is_leaf(&self) -> bool {
        self.tag.leaf()
    }

    #[inline(always)]
    pub(crate) fn set_leaf(&mut self) {
        self.tag.set_leaf(true);
    }
}
