//! Marshaling for `CallExternal`.
//!
//! The caller pushes one slot per declared parameter (bit sets take `words`
//! slots) in declared order, so the first parameter sits lowest in the block
//! at `sp - param_bytes`.

use std::ffi::c_void;
use std::ptr::NonNull;

use libffi::raw;

use crate::program::FfiType;
use crate::vm::runtime::Runtime;
use crate::vm::{Interpreter, VmError};

/// Copies one parameter slot into `cell` at its native width and returns the
/// pointer libffi should read the argument from.
///
/// # Safety
/// `slot` must point to `ty.slot_size()` readable bytes.
unsafe fn marshal_arg(
    rt: &Runtime,
    ty: FfiType,
    slot: *mut u8,
    cell: &mut u64,
) -> Result<*mut c_void, VmError> {
    let cell_ptr = (cell as *mut u64).cast::<u8>();
    // SAFETY: the slot holds a value the program pushed for this parameter;
    // the cell is 8 bytes, enough for every scalar width.
    unsafe {
        let raw = slot.cast::<u64>().read_unaligned();
        match ty {
            FfiType::Int8 => cell_ptr.cast::<i8>().write(raw as i8),
            FfiType::Int16 => cell_ptr.cast::<i16>().write(raw as i16),
            FfiType::Int32 => cell_ptr.cast::<i32>().write(raw as i32),
            FfiType::Int64 | FfiType::Pointer | FfiType::Double => *cell = raw,
            FfiType::Float => cell_ptr.cast::<f32>().write(f64::from_bits(raw) as f32),
            FfiType::Callback => {
                let code = rt.callback(raw as usize)?;
                *cell = code as usize as u64;
            }
            // struct arguments are read in place
            FfiType::BitSet(_) => return Ok(slot.cast()),
            FfiType::Void => return Err(VmError::Ffi("void parameter".into())),
        }
    }
    Ok(cell_ptr.cast())
}

pub(crate) fn call(
    interp: &mut Interpreter,
    rt: &Runtime,
    index: usize,
    param_bytes: usize,
) -> Result<(), VmError> {
    let routine = rt
        .program()
        .external(index)
        .ok_or_else(|| VmError::Ffi(format!("no external routine {index}")))?;
    let symbol = routine.load()?;
    let needed = routine.param_bytes();
    if param_bytes < needed || param_bytes > interp.native.used() {
        return Err(VmError::Ffi(format!(
            "{}: parameter block of {param_bytes} bytes, signature needs {needed}",
            routine.symbol
        )));
    }

    let block = (interp.native.sp() - param_bytes) as *mut u8;
    let mut cells = vec![0u64; routine.params.len()];
    let mut args = Vec::with_capacity(routine.params.len());
    let mut offset = 0;
    for (ty, cell) in routine.params.iter().zip(cells.iter_mut()) {
        // SAFETY: offset + slot size stays inside the block checked above.
        args.push(unsafe { marshal_arg(rt, *ty, block.add(offset), cell)? });
        offset += ty.slot_size();
    }

    let words = match routine.result {
        FfiType::BitSet(words) => words,
        _ => 1,
    };
    let mut result = vec![0u64; words];
    rt.publish_display(interp.display());
    log::trace!("call {} with {} args", routine.symbol, args.len());

    // Callbacks on this thread reach the interpreter through `this` until
    // leave_foreign; `interp` is not used in between.
    let this = NonNull::from(&mut *interp);
    let previous = rt.enter_foreign(this);
    // SAFETY: the cif was prepared for exactly these parameter types, every
    // argument pointer is live until the call returns, and the result buffer
    // is at least one register wide. Callbacks re-entering this interpreter
    // borrow it through `this` and restore its registers and stacks before
    // returning here.
    unsafe {
        raw::ffi_call(
            symbol.cif.as_raw_ptr(),
            Some(*symbol.code.as_fun()),
            result.as_mut_ptr().cast(),
            args.as_mut_ptr(),
        );
    }
    rt.leave_foreign(previous);
    interp.native.release(param_bytes);
    if let Some(error) = interp.take_pending() {
        return Err(error);
    }

    // narrow integers come back widened to a full register, so a plain
    // truncating cast is correct on either byte order
    let word = result[0];
    match routine.result {
        FfiType::Int8 => interp.calc.push_int(word as i8 as i64),
        FfiType::Int16 => interp.calc.push_int(word as i16 as i64),
        FfiType::Int32 => interp.calc.push_int(word as i32 as i64),
        FfiType::Int64 | FfiType::Pointer => interp.calc.push(word),
        FfiType::Float => {
            // SAFETY: a float result occupies the start of the buffer.
            let v = unsafe { result.as_ptr().cast::<f32>().read() };
            interp.calc.push_float(f64::from(v));
        }
        FfiType::Double => interp.calc.push(word),
        FfiType::BitSet(words) => {
            let dst = interp.calc.pop_ptr() as *mut u64;
            if dst.is_null() {
                return Err(VmError::InvalidArgument("bit set result without destination".into()));
            }
            // SAFETY: the program supplied a destination of `words` words.
            unsafe { std::ptr::copy_nonoverlapping(result.as_ptr(), dst, words) };
        }
        FfiType::Void | FfiType::Callback => {}
    }
    Ok(())
}
