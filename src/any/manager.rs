//! Construct / destroy / copy semantics for raw memory regions.
//!
//! Managers compose by delegation over byte offsets, so an array of records of
//! any-values is just an [`ArrayAnyManager`] over a [`RecordAnyManager`] over
//! [`SingleAnyManager`]s.

use std::mem::{ManuallyDrop, size_of};
use std::sync::Arc;

use crate::any::AnyValue;
use crate::vector::VectorDataPtr;

pub trait AnyManager: Send + Sync + std::fmt::Debug {
    /// Bytes covered by one managed value.
    fn size(&self) -> usize;

    /// Default-constructs a value at `addr`.
    ///
    /// # Safety
    /// `addr` must point to `size()` writable bytes that hold no live value.
    unsafe fn init(&self, addr: *mut u8);

    /// Runs the destructor of the value at `addr`, leaving an empty value behind.
    ///
    /// # Safety
    /// `addr` must hold a live value constructed for this manager.
    unsafe fn destroy(&self, addr: *mut u8);

    /// Copy-constructs at `dst` from the value at `src`. The previous content
    /// of `dst` is overwritten without being destroyed.
    ///
    /// # Safety
    /// `src` must hold a live value; `dst` must be writable for `size()` bytes.
    unsafe fn copy(&self, src: *const u8, dst: *mut u8);
}

pub type ManagerRef = Arc<dyn AnyManager>;

// ── Leaves ───────────────────────────────────────────────────────────

/// One [`AnyValue`] slot.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleAnyManager;

impl AnyManager for SingleAnyManager {
    fn size(&self) -> usize {
        size_of::<AnyValue>()
    }

    unsafe fn init(&self, addr: *mut u8) {
        // SAFETY: caller provides a writable slot.
        unsafe { addr.cast::<AnyValue>().write_unaligned(AnyValue::new()) };
    }

    unsafe fn destroy(&self, addr: *mut u8) {
        // SAFETY: caller guarantees a live value; it is replaced by an empty one.
        unsafe {
            drop(addr.cast::<AnyValue>().read_unaligned());
            addr.cast::<AnyValue>().write_unaligned(AnyValue::new());
        }
    }

    unsafe fn copy(&self, src: *const u8, dst: *mut u8) {
        // SAFETY: the source handle is borrowed, never dropped here.
        unsafe {
            let source = ManuallyDrop::new(src.cast::<AnyValue>().read_unaligned());
            dst.cast::<AnyValue>().write_unaligned((*source).clone());
        }
    }
}

/// One [`VectorDataPtr`] slot, for vectors of vectors.
#[derive(Debug, Default, Clone, Copy)]
pub struct VectorSlotManager;

impl AnyManager for VectorSlotManager {
    fn size(&self) -> usize {
        size_of::<VectorDataPtr>()
    }

    unsafe fn init(&self, addr: *mut u8) {
        // SAFETY: caller provides a writable slot.
        unsafe { addr.cast::<VectorDataPtr>().write_unaligned(VectorDataPtr::empty()) };
    }

    unsafe fn destroy(&self, addr: *mut u8) {
        // SAFETY: caller guarantees a live handle; it is replaced by an empty one.
        unsafe {
            drop(addr.cast::<VectorDataPtr>().read_unaligned());
            addr.cast::<VectorDataPtr>().write_unaligned(VectorDataPtr::empty());
        }
    }

    unsafe fn copy(&self, src: *const u8, dst: *mut u8) {
        // SAFETY: the source handle is borrowed, never dropped here.
        unsafe {
            let source = ManuallyDrop::new(src.cast::<VectorDataPtr>().read_unaligned());
            dst.cast::<VectorDataPtr>().write_unaligned((*source).clone());
        }
    }
}

// ── Composites ───────────────────────────────────────────────────────

/// `count` elements of `element`, `stride` bytes apart.
#[derive(Debug, Clone)]
pub struct ArrayAnyManager {
    element: ManagerRef,
    count: usize,
    stride: usize,
}

impl ArrayAnyManager {
    pub fn new(element: ManagerRef, count: usize, stride: usize) -> Self {
        debug_assert!(stride >= element.size());
        ArrayAnyManager { element, count, stride }
    }
}

impl AnyManager for ArrayAnyManager {
    fn size(&self) -> usize {
        self.count * self.stride
    }

    unsafe fn init(&self, addr: *mut u8) {
        for i in 0..self.count {
            // SAFETY: every element lies inside the region the caller vouched for.
            unsafe { self.element.init(addr.add(i * self.stride)) };
        }
    }

    unsafe fn destroy(&self, addr: *mut u8) {
        for i in 0..self.count {
            // SAFETY: as in init.
            unsafe { self.element.destroy(addr.add(i * self.stride)) };
        }
    }

    unsafe fn copy(&self, src: *const u8, dst: *mut u8) {
        for i in 0..self.count {
            let offset = i * self.stride;
            // SAFETY: as in init, for both regions.
            unsafe { self.element.copy(src.add(offset), dst.add(offset)) };
        }
    }
}

/// A record whose non-trivial fields sit at fixed byte offsets.
#[derive(Debug, Clone)]
pub struct RecordAnyManager {
    size: usize,
    components: Vec<(ManagerRef, usize)>,
}

impl RecordAnyManager {
    pub fn new(size: usize, components: Vec<(ManagerRef, usize)>) -> Self {
        debug_assert!(components.iter().all(|(m, off)| off + m.size() <= size));
        RecordAnyManager { size, components }
    }
}

impl AnyManager for RecordAnyManager {
    fn size(&self) -> usize {
        self.size
    }

    unsafe fn init(&self, addr: *mut u8) {
        for (manager, offset) in &self.components {
            // SAFETY: components lie inside the record.
            unsafe { manager.init(addr.add(*offset)) };
        }
    }

    unsafe fn destroy(&self, addr: *mut u8) {
        for (manager, offset) in &self.components {
            // SAFETY: components lie inside the record.
            unsafe { manager.destroy(addr.add(*offset)) };
        }
    }

    unsafe fn copy(&self, src: *const u8, dst: *mut u8) {
        for (manager, offset) in &self.components {
            // SAFETY: components lie inside both records.
            unsafe { manager.copy(src.add(*offset), dst.add(*offset)) };
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
