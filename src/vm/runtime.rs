//! The shared runtime: program, global data, per-thread interpreters and the
//! trampoline cache.
//!
//! The program and its tables are immutable once the runtime is built. The
//! two tables that do change while programs run, the thread-to-interpreter
//! map and the trampoline cache, sit behind `parking_lot` mutexes because
//! native code may call back from any thread.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::config::RuntimeConfig;
use crate::program::callback::Trampoline;
use crate::program::{FfiType, Program};
use crate::vm::data::RuntimeData;
use crate::vm::{ExecResult, Interpreter, Trap, VmError};

pub struct Runtime {
    program: Program,
    data: Box<dyn RuntimeData>,
    config: RuntimeConfig,
    globals: NonNull<u8>,
    globals_size: usize,
    /// Display published by the main interpreter; new interpreters start
    /// from it.
    display: Mutex<Vec<usize>>,
    main_thread: Mutex<Option<ThreadId>>,
    threads: Mutex<HashMap<ThreadId, ThreadSlot>>,
    trampolines: Mutex<HashMap<usize, Trampoline>>,
}

/// A thread's interpreter, owned through a raw pointer so that no reference
/// to it is formed while the thread is already executing it.
struct ThreadSlot {
    owned: NonNull<Interpreter>,
    /// Set while the interpreter is inside a foreign call. The pointer is
    /// derived from the `&mut` that `CallExternal` holds, so callbacks on
    /// this thread reborrow from it rather than from `owned`.
    entered: Option<NonNull<Interpreter>>,
}

impl ThreadSlot {
    fn new(interp: Interpreter) -> Self {
        ThreadSlot { owned: NonNull::from(Box::leak(Box::new(interp))), entered: None }
    }

    fn active(&self) -> NonNull<Interpreter> {
        self.entered.unwrap_or(self.owned)
    }
}

impl Drop for ThreadSlot {
    fn drop(&mut self) {
        // SAFETY: `owned` came from Box::leak in new and is freed only here.
        drop(unsafe { Box::from_raw(self.owned.as_ptr()) });
    }
}

// Global data is plain memory the program addresses directly; everything
// else is either immutable or behind a mutex. Each interpreter is only ever
// used by the thread it is keyed under.
unsafe impl Send for Runtime {}
unsafe impl Sync for Runtime {}

const GLOBALS_ALIGN: usize = 16;

impl Runtime {
    pub fn new(
        program: Program,
        data: impl RuntimeData + 'static,
        config: RuntimeConfig,
    ) -> Result<Arc<Self>, VmError> {
        let globals_size = config.global_data_size.max(program.globals_size()).max(8);
        let layout = Layout::from_size_align(globals_size, GLOBALS_ALIGN)
            .map_err(|_| VmError::OutOfMemory { size: globals_size })?;
        // SAFETY: non-zero size.
        let globals = NonNull::new(unsafe { alloc_zeroed(layout) })
            .ok_or(VmError::OutOfMemory { size: globals_size })?;
        log::debug!(
            "runtime: {} instructions, {} externals, {} exports, {globals_size} bytes of globals",
            program.code().len(),
            program.externals().len(),
            program.exports().len()
        );
        Ok(Arc::new(Runtime {
            program,
            data: Box::new(data),
            config,
            globals,
            globals_size,
            display: Mutex::new(vec![globals.as_ptr() as usize]),
            main_thread: Mutex::new(None),
            threads: Mutex::new(HashMap::new()),
            trampolines: Mutex::new(HashMap::new()),
        }))
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn data(&self) -> &dyn RuntimeData {
        self.data.as_ref()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn globals_base(&self) -> usize {
        self.globals.as_ptr() as usize
    }

    pub fn globals_size(&self) -> usize {
        self.globals_size
    }

    pub fn main_thread(&self) -> Option<ThreadId> {
        *self.main_thread.lock()
    }

    // ── Interpreters ──

    /// The calling thread's interpreter, created on first use from the
    /// published display.
    fn current(&self) -> Result<NonNull<Interpreter>, VmError> {
        let id = thread::current().id();
        let mut threads = self.threads.lock();
        if let Some(slot) = threads.get(&id) {
            return Ok(slot.active());
        }
        let display = self.display.lock().clone();
        let slot = ThreadSlot::new(Interpreter::new(&self.config, display)?);
        log::debug!("interpreter created for {id:?} ({} live)", threads.len() + 1);
        Ok(threads.entry(id).or_insert(slot).active())
    }

    /// Records the display new interpreters start from. Only the main
    /// thread publishes; frames on other threads die with their stacks.
    pub(crate) fn publish_display(&self, display: &[usize]) {
        if self.main_thread() != Some(thread::current().id()) {
            return;
        }
        let mut published = self.display.lock();
        published.clear();
        published.extend_from_slice(display);
    }

    /// The display a newly created interpreter would start from.
    pub fn published_display(&self) -> Vec<usize> {
        self.display.lock().clone()
    }

    /// Marks the calling thread's interpreter as inside a foreign call and
    /// returns the previous mark, to be handed back to `leave_foreign`.
    pub(crate) fn enter_foreign(
        &self,
        interp: NonNull<Interpreter>,
    ) -> Option<NonNull<Interpreter>> {
        let mut threads = self.threads.lock();
        let slot = threads.get_mut(&thread::current().id())?;
        std::mem::replace(&mut slot.entered, Some(interp))
    }

    pub(crate) fn leave_foreign(&self, previous: Option<NonNull<Interpreter>>) {
        if let Some(slot) = self.threads.lock().get_mut(&thread::current().id()) {
            slot.entered = previous;
        }
    }

    pub fn interpreter_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// Drops the calling thread's interpreter. Returns whether there was one.
    /// An interpreter inside a foreign call is kept.
    pub fn release_thread(&self) -> bool {
        let mut threads = self.threads.lock();
        let id = thread::current().id();
        let busy = threads.get(&id).is_some_and(|slot| slot.entered.is_some());
        !busy && threads.remove(&id).is_some()
    }

    /// Read-only look at the calling thread's interpreter.
    pub fn inspect<R>(&self, f: impl FnOnce(&Interpreter) -> R) -> Option<R> {
        let threads = self.threads.lock();
        threads.get(&thread::current().id()).map(|slot| {
            // SAFETY: the interpreter belongs to this thread, which is not
            // executing it while inside this call.
            f(unsafe { slot.active().as_ref() })
        })
    }

    /// Runs the program from its entry point on the calling thread, which
    /// becomes the main thread.
    pub fn run(&self) -> ExecResult {
        let entry = self.program.entry();
        let interp = self.current().map_err(|error| Trap { pc: entry, error })?;
        *self.main_thread.lock() = Some(thread::current().id());
        // SAFETY: an interpreter is only dereferenced on the thread it belongs
        // to, and `current` hands out the innermost live pointer.
        let interp = unsafe { &mut *interp.as_ptr() };
        interp.reset(self.globals_base());
        self.publish_display(interp.display());
        interp.start(entry).map_err(|error| Trap { pc: entry, error })?;
        log::debug!("run from {entry}");
        interp.execute(self)
    }

    /// Continues after a `Break` on the calling thread.
    pub fn resume(&self) -> ExecResult {
        let interp = self.current().map_err(|error| Trap { pc: 0, error })?;
        // SAFETY: as in run.
        let interp = unsafe { &mut *interp.as_ptr() };
        if !interp.resume_from_break() {
            return Err(Trap {
                pc: interp.pc(),
                error: VmError::InvalidArgument("no breakpoint to resume from".into()),
            });
        }
        log::debug!("resume at {}", interp.pc());
        interp.execute(self)
    }

    /// Entry from a native trampoline, on whatever thread native code used.
    pub(crate) fn invoke_callback(&self, address: usize, args: &[u64], result: FfiType) -> u64 {
        match self.current() {
            // SAFETY: as in run. On a thread inside CallExternal, `current`
            // returns the pointer that call derived from its own `&mut` and
            // does not touch until the foreign call returns, so this borrow
            // nests inside it. run_callback restores everything the outer
            // instruction relies on.
            Ok(interp) => {
                unsafe { &mut *interp.as_ptr() }.run_callback(self, address, args, result)
            }
            Err(error) => {
                log::error!("no interpreter for callback at {address}: {error}");
                0
            }
        }
    }

    // ── Callbacks ──

    /// Native function pointer for the routine exported at `address`. The
    /// trampoline is built on first request and cached.
    pub fn callback(&self, address: usize) -> Result<*const c_void, VmError> {
        let mut cache = self.trampolines.lock();
        if let Some(trampoline) = cache.get(&address) {
            return Ok(trampoline.code_ptr());
        }
        let export = self
            .program
            .export_by_address(address)
            .ok_or_else(|| VmError::Ffi(format!("no routine exported at {address}")))?;
        let trampoline = Trampoline::new(self, export)?;
        let code = trampoline.code_ptr();
        cache.insert(address, trampoline);
        Ok(code)
    }

    pub fn callback_by_name(&self, name: &str) -> Result<*const c_void, VmError> {
        let export = self
            .program
            .export_by_name(name)
            .ok_or_else(|| VmError::Ffi(format!("no routine exported as {name}")))?;
        self.callback(export.address)
    }

    // ── Global data ──

    fn global_ptr(&self, offset: usize, size: usize) -> Result<*mut u8, VmError> {
        if offset.checked_add(size).is_none_or(|end| end > self.globals_size) {
            return Err(VmError::RangeCheck(format!(
                "global {offset}+{size} outside {} bytes",
                self.globals_size
            )));
        }
        // SAFETY: bounds checked above.
        Ok(unsafe { self.globals.as_ptr().add(offset) })
    }

    pub fn read_global<T: Copy>(&self, offset: usize) -> Result<T, VmError> {
        let p = self.global_ptr(offset, size_of::<T>())?;
        // SAFETY: in bounds; T is plain data.
        Ok(unsafe { p.cast::<T>().read_unaligned() })
    }

    pub fn write_global<T: Copy>(&self, offset: usize, value: T) -> Result<(), VmError> {
        let p = self.global_ptr(offset, size_of::<T>())?;
        // SAFETY: in bounds; T is plain data.
        unsafe { p.cast::<T>().write_unaligned(value) };
        Ok(())
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.trampolines.get_mut().clear();
        self.threads.get_mut().clear();
        if let Ok(layout) = Layout::from_size_align(self.globals_size, GLOBALS_ALIGN) {
            // SAFETY: allocated in new with this layout.
            unsafe { dealloc(self.globals.as_ptr(), layout) };
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("instructions", &self.program.code().len())
            .field("globals_size", &self.globals_size)
            .field("interpreters", &self.interpreter_count())
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{ExportedRoutine, OpCode};
    use crate::vm::StaticRuntimeData;
    use crate::vm::ErrorKind;

    fn empty_runtime(program: Program) -> Arc<Runtime> {
        Runtime::new(program, StaticRuntimeData::new(), RuntimeConfig::default()).unwrap()
    }

    #[test]
    fn globals_bounds() {
        let rt = empty_runtime(Program::new());
        rt.write_global(8, 99_i64).unwrap();
        assert_eq!(rt.read_global::<i64>(8).unwrap(), 99);
        let end = rt.globals_size();
        assert!(rt.read_global::<u64>(end - 4).is_err());
        assert!(rt.write_global(usize::MAX, 0_u8).is_err());
    }

    #[test]
    fn globals_cover_program_hint() {
        let mut p = Program::new();
        p.set_globals_size(1 << 20);
        let rt = empty_runtime(p);
        assert!(rt.globals_size() >= 1 << 20);
    }

    #[test]
    fn resume_without_break() {
        let rt = empty_runtime(Program::new());
        assert_eq!(rt.resume().unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn interpreter_per_thread_and_release() {
        let mut p = Program::new();
        p.emit_op(OpCode::Stop, 0, 0);
        let rt = empty_runtime(p);
        rt.run().unwrap();
        assert_eq!(rt.interpreter_count(), 1);
        assert_eq!(rt.main_thread(), Some(thread::current().id()));
        let other = Arc::clone(&rt);
        std::thread::spawn(move || other.run().unwrap()).join().unwrap();
        assert_eq!(rt.interpreter_count(), 2);
        assert!(rt.release_thread());
        assert_eq!(rt.interpreter_count(), 1);
    }

    #[test]
    fn trampolines_are_cached() {
        let mut p = Program::new();
        let at = p.emit_op(OpCode::Return, 0, 0);
        p.add_export(ExportedRoutine::new(at, Some("noop"), vec![], FfiType::Void));
        let rt = empty_runtime(p);
        let first = rt.callback(at).unwrap();
        assert_eq!(rt.callback_by_name("noop").unwrap(), first);
        assert!(matches!(rt.callback(at + 1), Err(VmError::Ffi(_))));
        assert!(matches!(rt.callback_by_name("other"), Err(VmError::Ffi(_))));
    }

    #[test]
    fn foreign_call_mark_pins_the_interpreter() {
        let mut p = Program::new();
        p.emit_op(OpCode::Stop, 0, 0);
        let rt = empty_runtime(p);
        rt.run().unwrap();
        let owned = rt.current().unwrap();
        assert_eq!(rt.enter_foreign(owned), None);
        assert_eq!(rt.current().unwrap(), owned);
        assert!(!rt.release_thread());
        rt.leave_foreign(None);
        assert!(rt.release_thread());
        assert_eq!(rt.interpreter_count(), 0);
    }

    #[test]
    fn only_the_main_thread_publishes_its_display() {
        let mut p = Program::new();
        p.emit_op(OpCode::Stop, 0, 0);
        let rt = empty_runtime(p);
        rt.run().unwrap();
        let published = rt.published_display();
        assert_eq!(published, [rt.globals_base()]);
        let other = Arc::clone(&rt);
        std::thread::spawn(move || other.publish_display(&[1, 2, 3])).join().unwrap();
        assert_eq!(rt.published_display(), published);
        rt.publish_display(&[rt.globals_base(), 64]);
        assert_eq!(rt.published_display(), [rt.globals_base(), 64]);
    }
}
