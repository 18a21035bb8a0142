//! Services the interpreter obtains from the surrounding runtime library.

use crate::any::AnyValue;
use crate::any::manager::ManagerRef;
use crate::vm::VmError;

/// Runtime-library collaborator consulted by the interpreter: lifecycle
/// managers and string constants by id, heap memory and file handlers.
pub trait RuntimeData: Send + Sync {
    fn any_manager(&self, id: usize) -> Option<ManagerRef>;

    /// A new reference to string constant `id`.
    fn string_constant(&self, id: usize) -> Option<AnyValue>;

    fn allocate_memory(&self, size: usize, zero_fill: bool) -> Result<*mut u8, VmError>;

    /// # Safety
    /// `ptr` must come from [`RuntimeData::allocate_memory`] of the same runtime.
    unsafe fn release_memory(&self, ptr: *mut u8);

    fn file_handler(&self, id: i64) -> Result<*mut u8, VmError>;

    fn text_file_base_handler(&self) -> Result<*mut u8, VmError>;

    fn binary_file_handler(&self, record_size: usize) -> Result<*mut u8, VmError>;

    fn close_file_handler(&self, handler: *mut u8) -> Result<(), VmError>;
}

/// In-process registries for managers and strings, heap memory from the C
/// allocator, and no file handlers.
#[derive(Debug, Default)]
pub struct StaticRuntimeData {
    managers: Vec<ManagerRef>,
    strings: Vec<AnyValue>,
}

impl StaticRuntimeData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_manager(&mut self, manager: ManagerRef) -> usize {
        self.managers.push(manager);
        self.managers.len() - 1
    }

    pub fn add_string(&mut self, text: &str) -> usize {
        self.strings.push(AnyValue::from_value(text.to_string()));
        self.strings.len() - 1
    }
}

fn no_files() -> VmError {
    VmError::InvalidArgument("no file handlers are registered".into())
}

impl RuntimeData for StaticRuntimeData {
    fn any_manager(&self, id: usize) -> Option<ManagerRef> {
        self.managers.get(id).cloned()
    }

    fn string_constant(&self, id: usize) -> Option<AnyValue> {
        self.strings.get(id).cloned()
    }

    fn allocate_memory(&self, size: usize, zero_fill: bool) -> Result<*mut u8, VmError> {
        // SAFETY: plain C allocation; a zero size still yields a unique pointer.
        let p = unsafe {
            if zero_fill { libc::calloc(1, size.max(1)) } else { libc::malloc(size.max(1)) }
        };
        if p.is_null() {
            return Err(VmError::OutOfMemory { size });
        }
        Ok(p.cast())
    }

    unsafe fn release_memory(&self, ptr: *mut u8) {
        // SAFETY: forwarded from the caller; free(NULL) is a no-op.
        unsafe { libc::free(ptr.cast()) };
    }

    fn file_handler(&self, _id: i64) -> Result<*mut u8, VmError> {
        Err(no_files())
    }

    fn text_file_base_handler(&self) -> Result<*mut u8, VmError> {
        Err(no_files())
    }

    fn binary_file_handler(&self, _record_size: usize) -> Result<*mut u8, VmError> {
        Err(no_files())
    }

    fn close_file_handler(&self, _handler: *mut u8) -> Result<(), VmError> {
        Err(no_files())
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::any::manager::SingleAnyManager;
    use std::sync::Arc;

    #[test]
    fn registries_hand_out_ids() {
        let mut data = StaticRuntimeData::new();
        assert_eq!(data.add_string("hello"), 0);
        assert_eq!(data.add_manager(Arc::new(SingleAnyManager)), 0);
        let s = data.string_constant(0).unwrap();
        assert_eq!(unsafe { s.as_str() }, "hello");
        assert_eq!(s.ref_count(), 2);
        assert!(data.string_constant(1).is_none());
        assert_eq!(data.any_manager(0).map(|m| m.size()), Some(8));
    }

    #[test]
    fn zeroed_memory() {
        let data = StaticRuntimeData::new();
        let p = data.allocate_memory(64, true).unwrap();
        assert!(unsafe { std::slice::from_raw_parts(p, 64) }.iter().all(|b| *b == 0));
        unsafe { data.release_memory(p) };
    }

    #[test]
    fn file_handlers_unavailable() {
        let data = StaticRuntimeData::new();
        assert!(matches!(data.text_file_base_handler(), Err(VmError::InvalidArgument(_))));
        assert!(data.close_file_handler(std::ptr::null_mut()).is_err());
    }
}
