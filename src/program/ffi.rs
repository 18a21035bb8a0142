//! Descriptors for foreign routines and lazy symbol resolution.

use std::ffi::c_void;
use std::sync::OnceLock;

use libffi::middle::{Cif, CodePtr, Type};
use libloading::Library;
use serde::{Deserialize, Serialize};

use crate::vm::VmError;

/// Most parameters a foreign routine or exported callback may declare.
pub const MAX_PARAMS: usize = 8;

/// Native parameter and result representations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FfiType {
    Int8,
    Int16,
    Int32,
    Int64,
    Pointer,
    Float,
    Double,
    /// A struct of `n` 64-bit words, passed and returned by value.
    BitSet(usize),
    /// A pointer parameter whose slot holds a bytecode address; it is replaced
    /// by the trampoline for that address before the call.
    Callback,
    Void,
}

impl FfiType {
    /// Bytes the value occupies in a parameter block on the native stack.
    pub fn slot_size(self) -> usize {
        match self {
            FfiType::BitSet(words) => words * 8,
            FfiType::Void => 0,
            _ => 8,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(self, FfiType::Int8 | FfiType::Int16 | FfiType::Int32 | FfiType::Int64)
    }

    pub(crate) fn to_ffi(self) -> Type {
        match self {
            FfiType::Int8 => Type::i8(),
            FfiType::Int16 => Type::i16(),
            FfiType::Int32 => Type::i32(),
            FfiType::Int64 => Type::i64(),
            FfiType::Pointer | FfiType::Callback => Type::pointer(),
            FfiType::Float => Type::f32(),
            FfiType::Double => Type::f64(),
            FfiType::BitSet(words) => Type::structure(vec![Type::u64(); words]),
            FfiType::Void => Type::void(),
        }
    }
}

/// Checks a signature before a call interface is prepared for it.
pub(crate) fn validate_signature(
    params: &[FfiType],
    result: FfiType,
    what: &str,
) -> Result<(), VmError> {
    if params.len() > MAX_PARAMS {
        return Err(VmError::Ffi(format!(
            "{what}: {} parameters, at most {MAX_PARAMS} supported",
            params.len()
        )));
    }
    if params.contains(&FfiType::Void) {
        return Err(VmError::Ffi(format!("{what}: void parameter")));
    }
    if params.contains(&FfiType::BitSet(0)) || result == FfiType::BitSet(0) {
        return Err(VmError::Ffi(format!("{what}: empty bit set")));
    }
    if result == FfiType::Callback {
        return Err(VmError::Ffi(format!("{what}: callback result")));
    }
    Ok(())
}

pub(crate) fn build_cif(params: &[FfiType], result: FfiType) -> Cif {
    Cif::new(params.iter().map(|p| p.to_ffi()), result.to_ffi())
}

// ── Imports ──────────────────────────────────────────────────────────

/// A resolved symbol plus the call interface prepared for its signature.
pub struct ResolvedSymbol {
    _library: Library,
    pub(crate) code: CodePtr,
    pub(crate) cif: Cif,
}

// The library handle keeps `code` valid; the cif is never mutated after
// preparation, so sharing it between threads only reads it.
unsafe impl Send for ResolvedSymbol {}
unsafe impl Sync for ResolvedSymbol {}

impl std::fmt::Debug for ResolvedSymbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ResolvedSymbol({:p})", self.code.as_ptr())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExternalRoutine {
    /// Dynamic library to open; empty for the current process.
    pub library: String,
    pub symbol: String,
    pub params: Vec<FfiType>,
    pub result: FfiType,
    #[serde(skip)]
    resolved: OnceLock<ResolvedSymbol>,
}

impl ExternalRoutine {
    pub fn new(library: &str, symbol: &str, params: Vec<FfiType>, result: FfiType) -> Self {
        ExternalRoutine {
            library: library.to_string(),
            symbol: symbol.to_string(),
            params,
            result,
            resolved: OnceLock::new(),
        }
    }

    /// Total size of the parameter block a caller pushes for this routine.
    pub fn param_bytes(&self) -> usize {
        self.params.iter().map(|p| p.slot_size()).sum()
    }

    pub fn is_loaded(&self) -> bool {
        self.resolved.get().is_some()
    }

    /// Opens the library, resolves the symbol and prepares the call
    /// interface. Only the first successful resolution is kept.
    pub fn load(&self) -> Result<&ResolvedSymbol, VmError> {
        if let Some(done) = self.resolved.get() {
            return Ok(done);
        }
        validate_signature(&self.params, self.result, &self.symbol)?;
        let library = open_library(&self.library)?;
        // SAFETY: the symbol is only used as an opaque code address.
        let address = unsafe {
            library
                .get::<*const c_void>(self.symbol.as_bytes())
                .map(|sym| *sym)
                .map_err(|e| VmError::Ffi(format!("symbol {}: {e}", self.symbol)))?
        };
        if address.is_null() {
            return Err(VmError::Ffi(format!("symbol {} resolved to null", self.symbol)));
        }
        log::debug!(
            "resolved {} in {} at {address:p}",
            self.symbol,
            if self.library.is_empty() { "<process>" } else { &self.library }
        );
        let resolved = ResolvedSymbol {
            _library: library,
            code: CodePtr::from_ptr(address),
            cif: build_cif(&self.params, self.result),
        };
        // a concurrent loader may have won; its result is equivalent
        let _ = self.resolved.set(resolved);
        self.resolved.get().ok_or_else(|| VmError::Ffi(format!("symbol {} not cached", self.symbol)))
    }
}

fn open_library(name: &str) -> Result<Library, VmError> {
    if name.is_empty() {
        return this_process();
    }
    // SAFETY: loading runs the library's initializers; libraries named by a
    // program are trusted like the program itself.
    unsafe { Library::new(name) }.map_err(|e| VmError::Ffi(format!("library {name}: {e}")))
}

#[cfg(unix)]
fn this_process() -> Result<Library, VmError> {
    Ok(libloading::os::unix::Library::this().into())
}

#[cfg(windows)]
fn this_process() -> Result<Library, VmError> {
    libloading::os::windows::Library::this()
        .map(Into::into)
        .map_err(|e| VmError::Ffi(format!("current process: {e}")))
}

// ── Exports ──────────────────────────────────────────────────────────

/// A bytecode routine callable from native code through a trampoline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedRoutine {
    pub address: usize,
    pub name: Option<String>,
    pub params: Vec<FfiType>,
    pub result: FfiType,
}

impl ExportedRoutine {
    pub fn new(address: usize, name: Option<&str>, params: Vec<FfiType>, result: FfiType) -> Self {
        ExportedRoutine { address, name: name.map(str::to_string), params, result }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
