//! Type-erased, reference-counted, copy-on-write value box.
//!
//! An [`AnyValue`] is a single thin pointer, so it fits into one 8-byte memory
//! slot of a frame, a record or a vector buffer. The pointee is a heap box
//! holding the reference count, a static vtable and the payload. No runtime
//! type tag is checked in release builds: the bytecode producer guarantees that
//! every typed access names the type that was stored.

use std::any::TypeId;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering, fence};

pub mod manager;

struct AnyVTable {
    clone: unsafe fn(NonNull<AnyHeader>) -> NonNull<AnyHeader>,
    drop: unsafe fn(NonNull<AnyHeader>),
    type_id: fn() -> TypeId,
}

#[repr(C)]
struct AnyHeader {
    refs: AtomicUsize,
    vtable: &'static AnyVTable,
}

#[repr(C)]
struct AnyBox<T> {
    header: AnyHeader,
    value: T,
}

impl<T: Clone + Send + Sync + 'static> AnyBox<T> {
    const VTABLE: AnyVTable = AnyVTable {
        clone: Self::clone_box,
        drop: Self::drop_box,
        type_id: TypeId::of::<T>,
    };

    fn allocate(value: T) -> NonNull<AnyHeader> {
        let boxed = Box::new(AnyBox {
            header: AnyHeader { refs: AtomicUsize::new(1), vtable: &Self::VTABLE },
            value,
        });
        // SAFETY: Box::into_raw never returns null, and the header is the first
        // field of a repr(C) struct so the cast keeps the same address.
        unsafe { NonNull::new_unchecked(Box::into_raw(boxed).cast::<AnyHeader>()) }
    }

    unsafe fn clone_box(header: NonNull<AnyHeader>) -> NonNull<AnyHeader> {
        // SAFETY: the vtable of a header is only ever installed by allocate::<T>.
        let this = unsafe { header.cast::<AnyBox<T>>().as_ref() };
        Self::allocate(this.value.clone())
    }

    unsafe fn drop_box(header: NonNull<AnyHeader>) {
        // SAFETY: same provenance as clone_box; the count has reached zero.
        drop(unsafe { Box::from_raw(header.cast::<AnyBox<T>>().as_ptr()) });
    }
}

/// Owning handle to zero or one shared boxed value.
#[repr(transparent)]
pub struct AnyValue {
    ptr: Option<NonNull<AnyHeader>>,
}

// The payload is required to be Send + Sync and the count is atomic.
unsafe impl Send for AnyValue {}
unsafe impl Sync for AnyValue {}

impl AnyValue {
    /// An empty value; holds nothing and owns no allocation.
    pub const fn new() -> Self {
        AnyValue { ptr: None }
    }

    pub fn from_value<T: Clone + Send + Sync + 'static>(value: T) -> Self {
        AnyValue { ptr: Some(AnyBox::allocate(value)) }
    }

    pub fn has_value(&self) -> bool {
        self.ptr.is_some()
    }

    /// Number of handles sharing the box, 0 when empty.
    pub fn ref_count(&self) -> usize {
        match self.ptr {
            // SAFETY: a held pointer keeps the box alive.
            Some(p) => unsafe { p.as_ref() }.refs.load(Ordering::Acquire),
            None => 0,
        }
    }

    /// Makes the box private to this handle, cloning the payload if it is shared.
    pub fn copy_on_write(&mut self) {
        let Some(p) = self.ptr else { return };
        // SAFETY: a held pointer keeps the box alive.
        let header = unsafe { p.as_ref() };
        if header.refs.load(Ordering::Acquire) > 1 {
            // SAFETY: the vtable matches the payload the box was built with.
            let private = unsafe { (header.vtable.clone)(p) };
            let shared = std::mem::replace(&mut self.ptr, Some(private));
            drop(AnyValue { ptr: shared });
        }
    }

    /// Borrows the payload as `T`.
    ///
    /// # Safety
    /// The value must be non-empty and must have been created from a `T`.
    pub unsafe fn get<T: 'static>(&self) -> &T {
        debug_assert!(self.has_value(), "get on an empty AnyValue");
        // SAFETY: caller guarantees a non-empty value.
        let p = unsafe { self.ptr.unwrap_unchecked() };
        debug_assert!((unsafe { p.as_ref() }.vtable.type_id)() == TypeId::of::<T>());
        // SAFETY: caller guarantees the payload type; AnyBox<T> is repr(C).
        unsafe { &p.cast::<AnyBox<T>>().as_ref().value }
    }

    /// Mutably borrows the payload as `T`, unsharing it first.
    ///
    /// # Safety
    /// Same contract as [`AnyValue::get`].
    pub unsafe fn get_mut<T: 'static>(&mut self) -> &mut T {
        self.copy_on_write();
        debug_assert!(self.has_value(), "get_mut on an empty AnyValue");
        // SAFETY: caller guarantees a non-empty value.
        let p = unsafe { self.ptr.unwrap_unchecked() };
        debug_assert!((unsafe { p.as_ref() }.vtable.type_id)() == TypeId::of::<T>());
        // SAFETY: the box is uniquely owned after copy_on_write.
        unsafe { &mut p.cast::<AnyBox<T>>().as_mut().value }
    }

    /// Moves the content out, leaving this handle empty.
    pub fn take(&mut self) -> AnyValue {
        AnyValue { ptr: self.ptr.take() }
    }

    /// Assignment: builds the new reference first, then swaps it in.
    pub fn assign(&mut self, other: &AnyValue) {
        let mut tmp = other.clone();
        std::mem::swap(self, &mut tmp);
    }

    /// Releases ownership into a raw slot word (0 when empty).
    pub fn into_raw(self) -> u64 {
        let this = ManuallyDrop::new(self);
        this.as_raw()
    }

    pub fn as_raw(&self) -> u64 {
        self.ptr.map_or(0, |p| p.as_ptr() as usize as u64)
    }

    /// Takes ownership of a raw slot word produced by [`AnyValue::into_raw`].
    ///
    /// # Safety
    /// `raw` must be 0 or an owned reference obtained from `into_raw`.
    pub unsafe fn from_raw(raw: u64) -> Self {
        AnyValue { ptr: NonNull::new(raw as usize as *mut AnyHeader) }
    }

    /// Creates a new owning reference from a raw slot word without consuming it.
    ///
    /// # Safety
    /// `raw` must be 0 or a live reference held by someone else.
    pub unsafe fn clone_from_raw(raw: u64) -> Self {
        // SAFETY: forwarded from the caller; the borrowed handle is never dropped.
        let borrowed = ManuallyDrop::new(unsafe { Self::from_raw(raw) });
        (*borrowed).clone()
    }

    /// Reads the payload as a string slice, `""` when empty.
    ///
    /// # Safety
    /// A non-empty value must hold a `String`.
    pub unsafe fn as_str(&self) -> &str {
        if self.has_value() {
            // SAFETY: forwarded from the caller.
            unsafe { self.get::<String>() }.as_str()
        } else {
            ""
        }
    }
}

impl Default for AnyValue {
    fn default() -> Self {
        AnyValue::new()
    }
}

impl Clone for AnyValue {
    fn clone(&self) -> Self {
        if let Some(p) = self.ptr {
            // SAFETY: a held pointer keeps the box alive.
            unsafe { p.as_ref() }.refs.fetch_add(1, Ordering::Relaxed);
        }
        AnyValue { ptr: self.ptr }
    }
}

impl Drop for AnyValue {
    fn drop(&mut self) {
        let Some(p) = self.ptr else { return };
        // SAFETY: a held pointer keeps the box alive until the decrement below.
        let header = unsafe { p.as_ref() };
        if header.refs.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            let drop_box = header.vtable.drop;
            // SAFETY: this was the last reference.
            unsafe { drop_box(p) };
        }
    }
}

impl std::fmt::Debug for AnyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.ptr {
            Some(p) => write!(f, "AnyValue({:p}, refs={})", p.as_ptr(), self.ref_count()),
            None => write!(f, "AnyValue(empty)"),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
