//! The two execution stacks of an interpreter.
//!
//! [`NativeStack`] is a fixed byte arena for activation frames; addresses
//! handed out by it stay valid for the lifetime of the stack because the
//! arena never moves. [`CalcStack`] is the untyped 8-byte operand stack; it
//! grows on demand.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::NonNull;

use crate::vm::VmError;

pub const SLOT: usize = 8;

fn align_up(n: usize, to: usize) -> usize {
    n.div_ceil(to) * to
}

// ── Native stack ─────────────────────────────────────────────────────

pub struct NativeStack {
    base: NonNull<u8>,
    capacity: usize,
    sp: usize,
}

// The arena is owned exclusively by one interpreter.
unsafe impl Send for NativeStack {}

impl NativeStack {
    pub fn new(capacity: usize) -> Result<Self, VmError> {
        let capacity = align_up(capacity.max(SLOT), SLOT);
        let layout = Layout::from_size_align(capacity, 16)
            .map_err(|_| VmError::OutOfMemory { size: capacity })?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(raw).ok_or(VmError::OutOfMemory { size: capacity })?;
        Ok(NativeStack { base, capacity, sp: 0 })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current stack pointer as an absolute address.
    pub fn sp(&self) -> usize {
        self.base.as_ptr() as usize + self.sp
    }

    /// Resets the stack pointer to an absolute address inside the arena.
    pub fn set_sp(&mut self, addr: usize) {
        let base = self.base.as_ptr() as usize;
        debug_assert!(addr >= base && addr <= base + self.capacity);
        self.sp = addr.saturating_sub(base).min(self.capacity);
    }

    pub fn used(&self) -> usize {
        self.sp
    }

    pub fn reset(&mut self) {
        self.sp = 0;
    }

    /// Reserves `n` bytes (rounded up to the slot size) and returns their start.
    pub fn allocate(&mut self, n: usize, zero_fill: bool) -> Result<*mut u8, VmError> {
        let n = align_up(n, SLOT);
        let available = self.capacity - self.sp;
        if n > available {
            return Err(VmError::StackOverflow { requested: n, available });
        }
        // SAFETY: sp + n <= capacity.
        let span = unsafe { self.base.as_ptr().add(self.sp) };
        if zero_fill {
            // SAFETY: span..span+n lies inside the arena.
            unsafe { std::ptr::write_bytes(span, 0, n) };
        }
        self.sp += n;
        Ok(span)
    }

    pub fn release(&mut self, n: usize) {
        let n = align_up(n, SLOT);
        debug_assert!(n <= self.sp, "release of {n} bytes past the stack base");
        self.sp = self.sp.saturating_sub(n);
    }

    /// Pads the stack pointer up to a multiple of `n` bytes.
    pub fn align(&mut self, n: usize) -> Result<(), VmError> {
        if n <= 1 {
            return Ok(());
        }
        let target = align_up(self.sp(), n) - self.base.as_ptr() as usize;
        let pad = target - self.sp;
        if pad > self.capacity - self.sp {
            return Err(VmError::StackOverflow { requested: pad, available: self.capacity - self.sp });
        }
        self.sp = target;
        Ok(())
    }

    pub fn push<T: Copy>(&mut self, value: T) -> Result<(), VmError> {
        let p = self.allocate(size_of::<T>(), false)?;
        // SAFETY: allocate returned at least size_of::<T>() bytes.
        unsafe { p.cast::<T>().write_unaligned(value) };
        Ok(())
    }

    pub fn pop<T: Copy>(&mut self) -> T {
        self.release(size_of::<T>());
        // SAFETY: the slot was written by a matching push and is still in the arena.
        unsafe { self.base.as_ptr().add(self.sp).cast::<T>().read_unaligned() }
    }
}

impl Drop for NativeStack {
    fn drop(&mut self) {
        if let Ok(layout) = Layout::from_size_align(self.capacity, 16) {
            // SAFETY: allocated in new with this layout.
            unsafe { dealloc(self.base.as_ptr(), layout) };
        }
    }
}

impl std::fmt::Debug for NativeStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeStack").field("used", &self.sp).field("capacity", &self.capacity).finish()
    }
}

// ── Calculator stack ─────────────────────────────────────────────────

/// Untyped operand stack of 8-byte slots. The producer and consumer of a slot
/// agree on its type; nothing is tagged at runtime.
#[derive(Debug, Clone)]
pub struct CalcStack {
    slots: Vec<u64>,
    sp: usize,
}

impl CalcStack {
    pub fn new(capacity: usize) -> Self {
        CalcStack { slots: vec![0; capacity.max(4)], sp: 0 }
    }

    pub fn depth(&self) -> usize {
        self.sp
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Discards slots above `depth` without interpreting them.
    pub fn truncate(&mut self, depth: usize) {
        self.sp = self.sp.min(depth);
    }

    #[inline]
    pub fn push(&mut self, raw: u64) {
        if self.sp == self.slots.len() {
            let grown = self.slots.len() * 2;
            log::trace!("calculator stack grows to {grown} slots");
            self.slots.resize(grown, 0);
        }
        self.slots[self.sp] = raw;
        self.sp += 1;
    }

    #[inline]
    pub fn pop(&mut self) -> u64 {
        debug_assert!(self.sp > 0, "calculator stack underflow");
        self.sp = self.sp.saturating_sub(1);
        self.slots[self.sp]
    }

    /// Slot `n` below the top (0 is the top).
    #[inline]
    pub fn peek(&self, n: usize) -> u64 {
        debug_assert!(n < self.sp, "peek below the calculator stack");
        self.slots[self.sp.saturating_sub(n + 1)]
    }

    #[inline]
    pub fn set(&mut self, n: usize, raw: u64) {
        debug_assert!(n < self.sp);
        let i = self.sp.saturating_sub(n + 1);
        self.slots[i] = raw;
    }

    pub fn push_int(&mut self, v: i64) {
        self.push(v as u64);
    }

    pub fn pop_int(&mut self) -> i64 {
        self.pop() as i64
    }

    pub fn peek_int(&self, n: usize) -> i64 {
        self.peek(n) as i64
    }

    pub fn push_float(&mut self, v: f64) {
        self.push(v.to_bits());
    }

    pub fn pop_float(&mut self) -> f64 {
        f64::from_bits(self.pop())
    }

    pub fn peek_float(&self, n: usize) -> f64 {
        f64::from_bits(self.peek(n))
    }

    pub fn push_ptr(&mut self, p: usize) {
        self.push(p as u64);
    }

    pub fn pop_ptr(&mut self) -> usize {
        self.pop() as usize
    }

    pub fn peek_ptr(&self, n: usize) -> usize {
        self.peek(n) as usize
    }

    /// Replaces the top two integers `a b` with `f(a, b)`.
    #[inline]
    pub fn binary_int(&mut self, f: impl FnOnce(i64, i64) -> i64) {
        let b = self.pop_int();
        let a = self.peek_int(0);
        self.set(0, f(a, b) as u64);
    }

    /// Checked variant of [`CalcStack::binary_int`]; `None` raises `Overflow`.
    #[inline]
    pub fn checked_int(&mut self, f: impl FnOnce(i64, i64) -> Option<i64>) -> Result<(), VmError> {
        let b = self.pop_int();
        let a = self.peek_int(0);
        let r = f(a, b).ok_or(VmError::Overflow)?;
        self.set(0, r as u64);
        Ok(())
    }

    /// Fallible variant for operators with their own error (division).
    #[inline]
    pub fn try_int(
        &mut self,
        f: impl FnOnce(i64, i64) -> Result<i64, VmError>,
    ) -> Result<(), VmError> {
        let b = self.pop_int();
        let a = self.peek_int(0);
        let r = f(a, b)?;
        self.set(0, r as u64);
        Ok(())
    }

    #[inline]
    pub fn binary_float(&mut self, f: impl FnOnce(f64, f64) -> f64) {
        let b = self.pop_float();
        let a = self.peek_float(0);
        self.set(0, f(a, b).to_bits());
    }
}

// ── Tests ────────────────────────────────────────────────────────────
