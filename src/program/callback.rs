//! Native trampolines that re-enter the interpreter at an exported address.

use std::ffi::c_void;

use libffi::low;
use libffi::middle::Closure;

use crate::program::ffi::{ExportedRoutine, FfiType, build_cif, validate_signature};
use crate::vm::VmError;
use crate::vm::runtime::Runtime;

/// What a trampoline needs when native code calls it.
pub(crate) struct TrampolineData {
    runtime: *const Runtime,
    address: usize,
    params: Vec<FfiType>,
    result: FfiType,
}

/// A native function pointer bound to one exported bytecode routine.
pub struct Trampoline {
    // dropped before the data it points at
    closure: Closure<'static>,
    _data: Box<TrampolineData>,
}

// Closures are immutable after creation and their data is only read.
unsafe impl Send for Trampoline {}

impl Trampoline {
    pub(crate) fn new(runtime: &Runtime, export: &ExportedRoutine) -> Result<Self, VmError> {
        let what = export.name.as_deref().unwrap_or("callback");
        validate_signature(&export.params, export.result, what)?;
        if export.params.iter().chain([&export.result]).any(|t| matches!(t, FfiType::BitSet(_))) {
            return Err(VmError::Ffi(format!("{what}: bit sets cannot cross a callback")));
        }
        let data = Box::new(TrampolineData {
            runtime: runtime as *const Runtime,
            address: export.address,
            params: export.params.clone(),
            result: export.result,
        });
        // SAFETY: the box is owned by the trampoline and outlives the closure,
        // which is declared first and therefore dropped first.
        let userdata: &'static TrampolineData = unsafe { &*(data.as_ref() as *const TrampolineData) };
        let cif = build_cif(&export.params, export.result);
        let closure = Closure::new(cif, trampoline_entry, userdata);
        log::debug!("trampoline for {what} at address {}", export.address);
        Ok(Trampoline { closure, _data: data })
    }

    /// Native entry point of the trampoline.
    pub fn code_ptr(&self) -> *const c_void {
        *self.closure.code_ptr() as *const c_void
    }
}

impl std::fmt::Debug for Trampoline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Trampoline({:p} -> {})", self.code_ptr(), self._data.address)
    }
}

/// Reads one native argument into a calculator slot: integers sign-extend,
/// floats widen to double.
unsafe fn read_native_arg(ty: FfiType, p: *const c_void) -> u64 {
    // SAFETY: libffi passes a pointer to a value of the declared type.
    unsafe {
        match ty {
            FfiType::Int8 => p.cast::<i8>().read() as i64 as u64,
            FfiType::Int16 => p.cast::<i16>().read() as i64 as u64,
            FfiType::Int32 => p.cast::<i32>().read() as i64 as u64,
            FfiType::Int64 => p.cast::<i64>().read() as u64,
            FfiType::Pointer | FfiType::Callback => p.cast::<usize>().read() as u64,
            FfiType::Float => f64::from(p.cast::<f32>().read()).to_bits(),
            FfiType::Double => p.cast::<f64>().read().to_bits(),
            FfiType::BitSet(_) | FfiType::Void => 0,
        }
    }
}

/// Writes a calculator slot as the native return value. Narrow integer
/// results fill the whole return register, sign-extended.
fn write_native_result(ty: FfiType, out: &mut u64, raw: u64) {
    match ty {
        FfiType::Int8 => *out = raw as i8 as i64 as u64,
        FfiType::Int16 => *out = raw as i16 as i64 as u64,
        FfiType::Int32 => *out = raw as i32 as i64 as u64,
        FfiType::Int64 | FfiType::Pointer | FfiType::Callback => *out = raw,
        FfiType::Float => {
            let v = f64::from_bits(raw) as f32;
            // SAFETY: the return buffer is at least one register wide.
            unsafe { (out as *mut u64).cast::<f32>().write(v) };
        }
        FfiType::Double => *out = raw,
        FfiType::BitSet(_) | FfiType::Void => {}
    }
}

unsafe extern "C" fn trampoline_entry(
    _cif: &low::ffi_cif,
    result: &mut u64,
    args: *const *const c_void,
    data: &TrampolineData,
) {
    let mut raw = Vec::with_capacity(data.params.len());
    for (i, ty) in data.params.iter().enumerate() {
        // SAFETY: libffi passes one pointer per declared parameter.
        raw.push(unsafe { read_native_arg(*ty, *args.add(i)) });
    }
    // SAFETY: trampolines are owned by the runtime and die with it.
    let runtime = unsafe { &*data.runtime };
    let value = runtime.invoke_callback(data.address, &raw, data.result);
    write_native_result(data.result, result, value);
}

// ── Tests ────────────────────────────────────────────────────────────
