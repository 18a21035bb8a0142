//! Reference-counted, copy-on-write vectors of fixed-size elements.
//!
//! A vector lives in a single allocation: a header (count, element size,
//! reference count, optional manager) immediately followed by the element
//! buffer. [`VectorDataPtr`] is one thin pointer to that header, so a handle
//! fits into an 8-byte memory slot; the null handle is the empty vector.

use std::alloc::{Layout, alloc, alloc_zeroed, dealloc};
use std::mem::{ManuallyDrop, size_of};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering, fence};

use crate::any::manager::ManagerRef;
use crate::vm::VmError;

pub mod ops;
pub mod scalar;

pub use scalar::ScalarType;

const BUFFER_ALIGN: usize = 16;

#[repr(C)]
struct VectorHeader {
    refs: AtomicUsize,
    element_size: usize,
    count: usize,
    manager: Option<ManagerRef>,
}

/// Offset of the first element, rounded so elements start 16-byte aligned.
const HEADER_SIZE: usize = size_of::<VectorHeader>().div_ceil(BUFFER_ALIGN) * BUFFER_ALIGN;

#[cfg(test)]
thread_local! {
    static LIVE_BUFFERS: std::cell::Cell<isize> = const { std::cell::Cell::new(0) };
}

#[cfg(test)]
pub(crate) fn live_buffers() -> isize {
    LIVE_BUFFERS.with(|c| c.get())
}

fn layout_for(element_size: usize, count: usize) -> Result<Layout, VmError> {
    let size = element_size
        .checked_mul(count)
        .and_then(|bytes| bytes.checked_add(HEADER_SIZE))
        .ok_or(VmError::OutOfMemory { size: usize::MAX })?;
    Layout::from_size_align(size, BUFFER_ALIGN).map_err(|_| VmError::OutOfMemory { size })
}

/// Owning handle to a shared vector buffer.
#[repr(transparent)]
pub struct VectorDataPtr {
    ptr: Option<NonNull<VectorHeader>>,
}

// Counts are atomic and managers are Send + Sync.
unsafe impl Send for VectorDataPtr {}
unsafe impl Sync for VectorDataPtr {}

impl VectorDataPtr {
    pub const fn empty() -> Self {
        VectorDataPtr { ptr: None }
    }

    /// Allocates `count` elements of `element_size` bytes.
    ///
    /// With a manager every element is zeroed and then default-constructed, so
    /// the buffer is fully lifecycle-managed from the start. Without one the
    /// bytes are zeroed only when `zero_fill` is set; otherwise the caller must
    /// write every element before reading it.
    pub fn new(
        element_size: usize,
        count: usize,
        manager: Option<ManagerRef>,
        zero_fill: bool,
    ) -> Result<Self, VmError> {
        if count == 0 || element_size == 0 {
            return Ok(VectorDataPtr::empty());
        }
        let layout = layout_for(element_size, count)?;
        let zeroed = zero_fill || manager.is_some();
        // SAFETY: the layout is never zero-sized (HEADER_SIZE > 0).
        let raw = unsafe { if zeroed { alloc_zeroed(layout) } else { alloc(layout) } };
        let header = NonNull::new(raw.cast::<VectorHeader>())
            .ok_or(VmError::OutOfMemory { size: layout.size() })?;
        // SAFETY: fresh allocation, large and aligned enough for the header.
        unsafe {
            header.as_ptr().write(VectorHeader {
                refs: AtomicUsize::new(1),
                element_size,
                count,
                manager,
            });
        }
        #[cfg(test)]
        LIVE_BUFFERS.with(|c| c.set(c.get() + 1));

        let v = VectorDataPtr { ptr: Some(header) };
        if let Some(m) = v.manager() {
            for i in 0..count {
                // SAFETY: i < count, slot is zeroed and unconstructed.
                unsafe { m.init(v.element_ptr(i)) };
            }
        }
        Ok(v)
    }

    /// Builds a plain-data vector from a slice.
    pub fn from_slice<T: Copy>(values: &[T]) -> Result<Self, VmError> {
        let mut v = VectorDataPtr::new(size_of::<T>(), values.len(), None, false)?;
        for (i, value) in values.iter().enumerate() {
            // SAFETY: i < len and the element size is size_of::<T>().
            unsafe { v.set(i, *value) };
        }
        Ok(v)
    }

    fn header(&self) -> Option<&VectorHeader> {
        // SAFETY: a held pointer keeps the allocation alive.
        self.ptr.map(|p| unsafe { &*p.as_ptr() })
    }

    pub fn len(&self) -> usize {
        self.header().map_or(0, |h| h.count)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element size in bytes; 0 for the empty vector.
    pub fn element_size(&self) -> usize {
        self.header().map_or(0, |h| h.element_size)
    }

    pub fn manager(&self) -> Option<&ManagerRef> {
        self.header().and_then(|h| h.manager.as_ref())
    }

    pub fn ref_count(&self) -> usize {
        self.header().map_or(0, |h| h.refs.load(Ordering::Acquire))
    }

    /// Address of element `index`. Not bounds checked beyond a debug assertion.
    pub fn element_ptr(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.len(), "element {index} out of {}", self.len());
        match self.ptr {
            // SAFETY: the element lies inside the allocation for index < count.
            Some(p) => unsafe {
                p.as_ptr().cast::<u8>().add(HEADER_SIZE + index * (*p.as_ptr()).element_size)
            },
            None => std::ptr::null_mut(),
        }
    }

    /// Whole element buffer as bytes.
    pub fn bytes(&self) -> &[u8] {
        match self.ptr {
            // SAFETY: the buffer is count * element_size initialized bytes.
            Some(_) => unsafe {
                std::slice::from_raw_parts(self.element_ptr(0), self.len() * self.element_size())
            },
            None => &[],
        }
    }

    /// Reads element `index` as plain data.
    ///
    /// # Safety
    /// `index < len()` and `T` must match the element layout.
    pub unsafe fn get<T: Copy>(&self, index: usize) -> T {
        debug_assert!(size_of::<T>() <= self.element_size());
        unsafe { self.element_ptr(index).cast::<T>().read_unaligned() }
    }

    /// Writes element `index` as plain data. The handle must be unshared.
    ///
    /// # Safety
    /// `index < len()` and `T` must match the element layout.
    pub unsafe fn set<T: Copy>(&mut self, index: usize, value: T) {
        debug_assert!(size_of::<T>() <= self.element_size());
        debug_assert!(self.ref_count() <= 1, "write through a shared vector");
        unsafe { self.element_ptr(index).cast::<T>().write_unaligned(value) };
    }

    /// Replaces element `index` with a copy of the element at `src`: the old
    /// element is destroyed, the bytes are copied, then the manager copies the
    /// non-trivial parts on top of the raw image.
    ///
    /// # Safety
    /// `index < len()`; `src` must hold a live element of this vector's layout.
    pub unsafe fn set_element(&mut self, index: usize, src: *const u8) {
        let dst = self.element_ptr(index);
        if std::ptr::eq(dst, src) {
            return;
        }
        let size = self.element_size();
        unsafe {
            if let Some(m) = self.manager() {
                m.destroy(dst);
            }
            std::ptr::copy_nonoverlapping(src, dst, size);
            if let Some(m) = self.manager() {
                m.copy(src, dst);
            }
        }
    }

    /// Makes the buffer private to this handle. A shared buffer is cloned,
    /// element by element through the manager when there is one, else as a
    /// flat byte copy.
    pub fn copy_on_write(&mut self) -> Result<(), VmError> {
        if self.ref_count() <= 1 {
            return Ok(());
        }
        let private = self.duplicate()?;
        *self = private;
        Ok(())
    }

    fn duplicate(&self) -> Result<Self, VmError> {
        let count = self.len();
        let size = self.element_size();
        let manager = self.manager().cloned();
        let copy = VectorDataPtr::new(size, count, None, false)?;
        if count == 0 {
            return Ok(copy);
        }
        // SAFETY: both buffers hold count * size bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(self.element_ptr(0), copy.element_ptr(0), count * size);
        }
        if let Some(m) = &manager {
            for i in 0..count {
                // SAFETY: i < count; the copy's raw image is overwritten by a proper copy.
                unsafe { m.copy(self.element_ptr(i), copy.element_ptr(i)) };
            }
        }
        // the manager is attached only once every element is a live managed value
        if let Some(p) = copy.ptr {
            // SAFETY: the copy is uniquely owned here.
            unsafe { (*p.as_ptr()).manager = manager };
        }
        Ok(copy)
    }

    /// New vector of `new_count` elements keeping the first `min(old, new)`.
    /// `element_size` and `manager` are used only when `self` is empty.
    pub fn resize(
        &self,
        new_count: usize,
        element_size: usize,
        manager: Option<ManagerRef>,
    ) -> Result<Self, VmError> {
        let (size, manager) = match self.ptr {
            Some(_) => (self.element_size(), self.manager().cloned()),
            None => (element_size, manager),
        };
        let mut out = VectorDataPtr::new(size, new_count, manager, true)?;
        for i in 0..self.len().min(new_count) {
            // SAFETY: i is in bounds of both vectors with the same layout.
            unsafe { out.set_element(i, self.element_ptr(i)) };
        }
        Ok(out)
    }

    pub fn reversed(&self) -> Result<Self, VmError> {
        let count = self.len();
        let mut out =
            VectorDataPtr::new(self.element_size(), count, self.manager().cloned(), false)?;
        for i in 0..count {
            // SAFETY: both indices are < count.
            unsafe { out.set_element(i, self.element_ptr(count - 1 - i)) };
        }
        Ok(out)
    }

    /// Views the buffer as a typed slice.
    ///
    /// # Safety
    /// `T` must be plain data whose size equals the element size.
    pub unsafe fn as_slice<T: Copy>(&self) -> &[T] {
        match self.ptr {
            // SAFETY: the buffer is 16-byte aligned and holds len() elements of T.
            Some(_) => unsafe {
                std::slice::from_raw_parts(self.element_ptr(0).cast::<T>(), self.len())
            },
            None => &[],
        }
    }

    /// Copies the elements out as plain data.
    pub fn to_vec<T: Copy>(&self) -> Vec<T> {
        debug_assert!(self.is_empty() || size_of::<T>() == self.element_size());
        // SAFETY: every index is < len and T matches the element size.
        (0..self.len()).map(|i| unsafe { self.get::<T>(i) }).collect()
    }

    /// Releases ownership into a raw slot word (0 for the empty vector).
    pub fn into_raw(self) -> u64 {
        let this = ManuallyDrop::new(self);
        this.as_raw()
    }

    pub fn as_raw(&self) -> u64 {
        self.ptr.map_or(0, |p| p.as_ptr() as usize as u64)
    }

    /// # Safety
    /// `raw` must be 0 or an owned reference produced by [`VectorDataPtr::into_raw`].
    pub unsafe fn from_raw(raw: u64) -> Self {
        VectorDataPtr { ptr: NonNull::new(raw as usize as *mut VectorHeader) }
    }

    /// New owning reference to a handle stored elsewhere.
    ///
    /// # Safety
    /// `raw` must be 0 or a live reference held by someone else.
    pub unsafe fn clone_from_raw(raw: u64) -> Self {
        let borrowed = ManuallyDrop::new(unsafe { Self::from_raw(raw) });
        (*borrowed).clone()
    }
}

impl Default for VectorDataPtr {
    fn default() -> Self {
        VectorDataPtr::empty()
    }
}

impl Clone for VectorDataPtr {
    fn clone(&self) -> Self {
        if let Some(h) = self.header() {
            h.refs.fetch_add(1, Ordering::Relaxed);
        }
        VectorDataPtr { ptr: self.ptr }
    }
}

impl Drop for VectorDataPtr {
    fn drop(&mut self) {
        let Some(p) = self.ptr else { return };
        // SAFETY: a held pointer keeps the allocation alive until the decrement.
        let header = unsafe { &*p.as_ptr() };
        if header.refs.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        fence(Ordering::Acquire);
        let (size, count) = (header.element_size, header.count);
        if let Some(m) = &header.manager {
            for i in 0..count {
                // SAFETY: every element is a live managed value.
                unsafe { m.destroy(self.element_ptr(i)) };
            }
        }
        // SAFETY: last reference; drop the header fields (the manager) then free.
        unsafe {
            std::ptr::drop_in_place(p.as_ptr());
            if let Ok(layout) = layout_for(size, count) {
                dealloc(p.as_ptr().cast::<u8>(), layout);
            }
        }
        #[cfg(test)]
        LIVE_BUFFERS.with(|c| c.set(c.get() - 1));
    }
}

impl std::fmt::Debug for VectorDataPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorDataPtr")
            .field("len", &self.len())
            .field("element_size", &self.element_size())
            .field("refs", &self.ref_count())
            .field("managed", &self.manager().is_some())
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────────
