//! The loaded program: instruction stream, FFI imports and exported entry points.
//!
//! A [`Program`] is built once (emit, patch, fix up) and is read-only while
//! it runs. Address 0 holds an `Illegal` guard instruction because a return to
//! PC 0 means the outermost routine has finished.

use serde::{Deserialize, Serialize};

use crate::vm::VmError;

pub mod callback;
pub mod ffi;

pub use ffi::{ExportedRoutine, ExternalRoutine, FfiType};

// ── Opcodes ──────────────────────────────────────────────────────────

/// One instruction kind. Parameters are `Int2(a, b)` unless noted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum OpCode {
    // constants and addressing
    PushInt,
    /// `Float(f)`
    PushFloat,
    PushGlobalAddress,
    PushLocalAddress,
    PushOuterAddress,
    PushString,

    // calculator stack
    Dup,
    Drop,
    Swap,

    // loads: pop address, add `a`
    LoadI8,
    LoadU8,
    LoadI16,
    LoadU16,
    LoadI32,
    LoadU32,
    LoadI64,
    LoadF32,
    LoadF64,
    LoadPtr,
    LoadVector,
    LoadAny,

    // stores: pop value, pop address, add `a`
    StoreI8,
    StoreI16,
    StoreI32,
    StoreI64,
    StoreF32,
    StoreF64,
    StorePtr,
    StoreVector,
    StoreAny,

    // bulk memory and frames
    CopyBytes,
    CopyManaged,
    PushParam,
    PushBytes,
    PushManaged,
    Alloc,
    Release,
    AlignStack,
    InitRegion,
    DestroyRegion,

    // control flow
    Call,
    CallIndirect,
    Enter,
    Leave,
    Return,
    Jump,
    JumpIfFalse,
    JumpIfTrue,
    CaseEqual,
    CaseRange,

    // integers
    AddInt,
    SubInt,
    MulInt,
    DivInt,
    ModInt,
    NegInt,
    AndInt,
    OrInt,
    XorInt,
    NotInt,
    Shl,
    Shr,
    CompareInt,
    CheckRange,

    // floats
    AddFloat,
    SubFloat,
    MulFloat,
    DivFloat,
    NegFloat,
    CompareFloat,
    IntToFloat,
    FloatToInt,

    // strings
    StringLength,
    StringCharAt,
    StringConcat,
    StringEqual,
    DropAny,

    // vector construction
    VecFromScalar,
    VecFromLvalue,
    VecZeroed,
    VecNew,
    VecConvert,
    VecCombine,
    VecResize,

    // vector indexing
    VecGather,
    VecFilter,
    VecElement,

    // vector operators
    VecArith,
    VecCompare,
    VecLength,
    VecReverse,
    VecInvert,
    VecRangeCheck,
    DropVector,

    // runtime data
    AllocMemory,
    ReleaseMemory,
    FileHandler,
    CloseFile,

    // foreign calls
    CallExternal,
    PushCallback,

    // misc
    Nop,
    Stop,
    Halt,
    Break,
    Illegal,
}

// ── Instructions ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Param {
    Int2(i64, i64),
    Float(f64),
}

impl Param {
    /// First integer parameter (0 for a float parameter).
    pub fn a(self) -> i64 {
        match self {
            Param::Int2(a, _) => a,
            Param::Float(_) => 0,
        }
    }

    pub fn b(self) -> i64 {
        match self {
            Param::Int2(_, b) => b,
            Param::Float(_) => 0,
        }
    }

    pub fn float(self) -> f64 {
        match self {
            Param::Float(f) => f,
            Param::Int2(a, _) => a as f64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub op: OpCode,
    pub param: Param,
}

impl Instruction {
    pub fn new(op: OpCode, a: i64, b: i64) -> Self {
        Instruction { op, param: Param::Int2(a, b) }
    }

    pub fn op(op: OpCode) -> Self {
        Instruction::new(op, 0, 0)
    }

    pub fn with_float(op: OpCode, f: f64) -> Self {
        Instruction { op, param: Param::Float(f) }
    }
}

// ── Program ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct Program {
    code: Vec<Instruction>,
    #[serde(default)]
    externals: Vec<ExternalRoutine>,
    #[serde(default)]
    exports: Vec<ExportedRoutine>,
    #[serde(default = "default_entry")]
    entry: usize,
    #[serde(default)]
    globals_size: usize,
}

/// First address after the `Illegal` guard.
fn default_entry() -> usize {
    1
}

impl Default for Program {
    fn default() -> Self {
        Program::new()
    }
}

impl Program {
    pub fn new() -> Self {
        Program {
            code: vec![Instruction::op(OpCode::Illegal)],
            externals: Vec::new(),
            exports: Vec::new(),
            entry: default_entry(),
            globals_size: 0,
        }
    }

    /// Appends an instruction and returns its address.
    pub fn emit(&mut self, inst: Instruction) -> usize {
        self.code.push(inst);
        self.code.len() - 1
    }

    pub fn emit_op(&mut self, op: OpCode, a: i64, b: i64) -> usize {
        self.emit(Instruction::new(op, a, b))
    }

    pub fn patch(&mut self, address: usize, inst: Instruction) -> Result<(), VmError> {
        let slot = self.code.get_mut(address).ok_or_else(|| bad_address(address))?;
        *slot = inst;
        Ok(())
    }

    /// Rewrites the target (`a`) of an already emitted jump or call.
    pub fn fixup_address(&mut self, address: usize, target: usize) -> Result<(), VmError> {
        let slot = self.code.get_mut(address).ok_or_else(|| bad_address(address))?;
        match slot.param {
            Param::Int2(_, b) => {
                slot.param = Param::Int2(target as i64, b);
                Ok(())
            }
            Param::Float(_) => Err(VmError::InvalidArgument(format!(
                "instruction {address} ({:?}) has no address parameter",
                slot.op
            ))),
        }
    }

    /// Address the next emitted instruction will get.
    pub fn current_position(&self) -> usize {
        self.code.len()
    }

    pub fn code(&self) -> &[Instruction] {
        &self.code
    }

    pub fn instruction(&self, address: usize) -> Option<&Instruction> {
        self.code.get(address)
    }

    pub fn entry(&self) -> usize {
        self.entry
    }

    pub fn set_entry(&mut self, address: usize) {
        self.entry = address;
    }

    pub fn globals_size(&self) -> usize {
        self.globals_size
    }

    pub fn set_globals_size(&mut self, size: usize) {
        self.globals_size = size;
    }

    // ── FFI tables ──

    pub fn add_external(&mut self, routine: ExternalRoutine) -> usize {
        self.externals.push(routine);
        self.externals.len() - 1
    }

    pub fn external(&self, index: usize) -> Option<&ExternalRoutine> {
        self.externals.get(index)
    }

    pub fn externals(&self) -> &[ExternalRoutine] {
        &self.externals
    }

    pub fn add_export(&mut self, routine: ExportedRoutine) -> usize {
        self.exports.push(routine);
        self.exports.len() - 1
    }

    pub fn exports(&self) -> &[ExportedRoutine] {
        &self.exports
    }

    pub fn export_by_address(&self, address: usize) -> Option<&ExportedRoutine> {
        self.exports.iter().find(|e| e.address == address)
    }

    pub fn export_by_name(&self, name: &str) -> Option<&ExportedRoutine> {
        self.exports.iter().find(|e| e.name.as_deref() == Some(name))
    }

    // ── Images ──

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

fn bad_address(address: usize) -> VmError {
    VmError::InvalidArgument(format!("no instruction at address {address}"))
}

// ── Tests ────────────────────────────────────────────────────────────
