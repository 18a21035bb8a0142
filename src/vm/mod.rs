//! The p-code interpreter.
//!
//! One [`Interpreter`] per OS thread executes the shared, immutable
//! [`Program`](crate::program::Program) held by a [`Runtime`]. It owns a
//! native stack for activation frames, a calculator stack for operands and a
//! display mapping nesting levels to frame bases. Faults raised by any
//! instruction unwind to [`Interpreter::execute`] and come back to the
//! embedder as a [`Trap`].

use std::mem::ManuallyDrop;

use crate::any::AnyValue;
use crate::any::manager::ManagerRef;
use crate::config::RuntimeConfig;
use crate::program::{FfiType, Instruction, OpCode};
use crate::stack::{CalcStack, NativeStack};
use crate::vector::ops::{self, ArithOp, CombineOperand, CompareOp};
use crate::vector::{ScalarType, VectorDataPtr};

pub mod data;
pub(crate) mod external;
pub mod runtime;

pub use data::{RuntimeData, StaticRuntimeData};
pub use runtime::Runtime;

// ── Errors and outcomes ──────────────────────────────────────────────

/// Fieldless discriminant of a [`VmError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    RangeCheck,
    Overflow,
    StackOverflow,
    InvalidArgument,
    Ffi,
    InvalidOpcode,
    OutOfMemory,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VmError {
    #[error("range check failed: {0}")]
    RangeCheck(String),
    #[error("integer overflow")]
    Overflow,
    #[error("stack overflow: {requested} bytes requested, {available} available")]
    StackOverflow { requested: usize, available: usize },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("ffi error: {0}")]
    Ffi(String),
    #[error("invalid opcode: {op:?}")]
    InvalidOpcode { op: OpCode },
    #[error("out of memory allocating {size} bytes")]
    OutOfMemory { size: usize },
}

impl VmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VmError::RangeCheck(_) => ErrorKind::RangeCheck,
            VmError::Overflow => ErrorKind::Overflow,
            VmError::StackOverflow { .. } => ErrorKind::StackOverflow,
            VmError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            VmError::Ffi(_) => ErrorKind::Ffi,
            VmError::InvalidOpcode { .. } => ErrorKind::InvalidOpcode,
            VmError::OutOfMemory { .. } => ErrorKind::OutOfMemory,
        }
    }
}

type VmResult<T> = Result<T, VmError>;

/// A fault together with the address of the instruction that raised it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{error} (pc {pc})")]
pub struct Trap {
    pub pc: usize,
    #[source]
    pub error: VmError,
}

impl Trap {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

/// How a run ended when it did not fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The outermost routine returned to PC 0.
    Done,
    Stopped,
    Halted { code: i64 },
    /// Suspended by `Break`; `pc` is where `resume` continues.
    Breakpoint { pc: usize, frame: usize },
}

pub type ExecResult = Result<Outcome, Trap>;

// ── Interpreter ──────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Interpreter {
    pc: usize,
    fp: usize,
    native: NativeStack,
    calc: CalcStack,
    display: Vec<usize>,
    /// Fault raised inside a native callback, re-raised after the foreign call.
    pending: Option<VmError>,
    suspended: bool,
}

impl Interpreter {
    pub(crate) fn new(config: &RuntimeConfig, display: Vec<usize>) -> VmResult<Self> {
        let native = NativeStack::new(config.native_stack_size)?;
        let fp = native.sp();
        Ok(Interpreter {
            pc: 0,
            fp,
            native,
            calc: CalcStack::new(config.calc_stack_slots),
            display,
            pending: None,
            suspended: false,
        })
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    /// Current frame base address.
    pub fn frame(&self) -> usize {
        self.fp
    }

    pub fn display(&self) -> &[usize] {
        &self.display
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn calc_depth(&self) -> usize {
        self.calc.depth()
    }

    pub fn peek_int(&self, n: usize) -> i64 {
        self.calc.peek_int(n)
    }

    pub fn peek_float(&self, n: usize) -> f64 {
        self.calc.peek_float(n)
    }

    /// Raw calculator slot `n` below the top.
    pub fn peek_raw(&self, n: usize) -> u64 {
        self.calc.peek(n)
    }

    pub fn native_used(&self) -> usize {
        self.native.used()
    }

    /// Clears both stacks and rebinds level 0 to the global data.
    pub(crate) fn reset(&mut self, globals: usize) {
        self.native.reset();
        self.calc.truncate(0);
        self.display.clear();
        self.display.push(globals);
        self.fp = self.native.sp();
        self.pending = None;
        self.suspended = false;
    }

    /// Prepares a top-level run: the return PC 0 marks the outermost frame.
    pub(crate) fn start(&mut self, entry: usize) -> VmResult<()> {
        self.native.push(0_u64)?;
        self.pc = entry;
        Ok(())
    }

    pub(crate) fn resume_from_break(&mut self) -> bool {
        std::mem::replace(&mut self.suspended, false)
    }

    /// Runs until the program finishes, stops, halts, breaks or faults.
    pub(crate) fn execute(&mut self, rt: &Runtime) -> ExecResult {
        let code = rt.program().code();
        let trace = log::log_enabled!(log::Level::Trace);
        loop {
            let pc = self.pc;
            let Some(inst) = code.get(pc).copied() else {
                return Err(self.trap(pc, VmError::InvalidOpcode { op: OpCode::Illegal }));
            };
            if trace {
                log::trace!("{pc:>6} {:?} {:?} calc={}", inst.op, inst.param, self.calc.depth());
            }
            self.pc = pc + 1;
            match self.step(rt, inst) {
                Ok(None) => {}
                Ok(Some(outcome)) => return Ok(outcome),
                Err(error) => return Err(self.trap(pc, error)),
            }
        }
    }

    fn trap(&self, pc: usize, error: VmError) -> Trap {
        log::debug!("trap at {pc}: {error}");
        Trap { pc, error }
    }

    /// Parks a callback fault until the enclosing foreign call returns.
    pub(crate) fn park(&mut self, error: VmError) {
        if self.pending.is_none() {
            log::warn!("fault in native callback: {error}");
            self.pending = Some(error);
        }
    }

    pub(crate) fn take_pending(&mut self) -> Option<VmError> {
        self.pending.take()
    }

    /// Executes the exported routine at `address` for a native caller.
    ///
    /// Arguments go onto the calculator stack in declared order, a return PC
    /// of 0 ends the nested run, and the result is taken from the calculator
    /// stack. Any fault, or an outcome other than `Done`, is parked and 0 is
    /// returned to native code.
    pub(crate) fn run_callback(
        &mut self,
        rt: &Runtime,
        address: usize,
        args: &[u64],
        result: FfiType,
    ) -> u64 {
        if self.pending.is_some() {
            return 0;
        }
        let (pc, fp, sp, depth) = (self.pc, self.fp, self.native.sp(), self.calc.depth());
        let suspended = self.suspended;
        for arg in args {
            self.calc.push(*arg);
        }
        let outcome = match self.native.push(0_u64) {
            Ok(()) => {
                self.pc = address;
                self.execute(rt)
            }
            Err(error) => Err(Trap { pc: address, error }),
        };
        let value = match outcome {
            Ok(Outcome::Done) if result == FfiType::Void => 0,
            Ok(Outcome::Done) => self.calc.pop(),
            Ok(other) => {
                self.park(VmError::InvalidArgument(format!(
                    "callback at {address} ended with {other:?}"
                )));
                0
            }
            Err(trap) => {
                self.park(trap.error);
                0
            }
        };
        self.calc.truncate(depth);
        self.native.set_sp(sp);
        self.pc = pc;
        self.fp = fp;
        self.suspended = suspended;
        value
    }

    // ── Operand helpers ──

    /// Pops a base address and applies `offset`.
    fn address(&mut self, offset: i64) -> VmResult<*mut u8> {
        let base = self.calc.pop_ptr();
        if base == 0 {
            return Err(VmError::InvalidArgument("dereference of a nil address".into()));
        }
        Ok(base.wrapping_add_signed(offset as isize) as *mut u8)
    }

    fn pop_address(&mut self) -> VmResult<*mut u8> {
        self.address(0)
    }

    fn pop_count(&mut self) -> VmResult<usize> {
        let n = self.calc.pop_int();
        usize::try_from(n).map_err(|_| VmError::RangeCheck(format!("negative count {n}")))
    }

    fn pop_vector(&mut self) -> VectorDataPtr {
        // SAFETY: vector slots on the calculator stack are owned handles.
        unsafe { VectorDataPtr::from_raw(self.calc.pop()) }
    }

    fn push_vector(&mut self, v: VectorDataPtr) {
        self.calc.push(v.into_raw());
    }

    fn pop_any(&mut self) -> AnyValue {
        // SAFETY: any-value slots on the calculator stack are owned handles.
        unsafe { AnyValue::from_raw(self.calc.pop()) }
    }

    fn push_any(&mut self, v: AnyValue) {
        self.calc.push(v.into_raw());
    }

    fn push_bool(&mut self, b: bool) {
        self.calc.push_int(i64::from(b));
    }

    fn jump(&mut self, target: i64) {
        self.pc = target as usize;
    }

    fn call(&mut self, target: usize) -> VmResult<()> {
        self.native.push(self.pc as u64)?;
        self.pc = target;
        Ok(())
    }

    fn display_slot(&mut self, level: usize) -> &mut usize {
        if self.display.len() <= level {
            self.display.resize(level + 1, 0);
        }
        &mut self.display[level]
    }

    fn display_base(&self, level: i64) -> VmResult<usize> {
        usize::try_from(level)
            .ok()
            .and_then(|l| self.display.get(l).copied())
            .filter(|base| *base != 0)
            .ok_or_else(|| VmError::InvalidArgument(format!("no active frame at level {level}")))
    }

    // ── Dispatch ──

    fn step(&mut self, rt: &Runtime, inst: Instruction) -> VmResult<Option<Outcome>> {
        let (a, b) = (inst.param.a(), inst.param.b());

        macro_rules! load {
            ($t:ty, $widen:expr) => {{
                let p = self.address(a)?;
                // SAFETY: the program computed a valid address for this width.
                let v: $t = unsafe { p.cast::<$t>().read_unaligned() };
                self.calc.push(($widen)(v));
            }};
        }
        macro_rules! store {
            ($t:ty, $narrow:expr) => {{
                let raw = self.calc.pop();
                let p = self.address(a)?;
                // SAFETY: as for load!.
                unsafe { p.cast::<$t>().write_unaligned(($narrow)(raw)) };
            }};
        }
        macro_rules! manager {
            ($id:expr) => {
                manager_by_id(rt, $id)?.ok_or_else(|| {
                    VmError::InvalidArgument(format!("instruction needs a manager, got id {}", $id))
                })?
            };
        }

        match inst.op {
            // ── constants and addressing
            OpCode::PushInt => self.calc.push_int(a),
            OpCode::PushFloat => self.calc.push_float(inst.param.float()),
            OpCode::PushGlobalAddress => {
                let base = self.display_base(0)?;
                self.calc.push_ptr(base.wrapping_add_signed(a as isize));
            }
            OpCode::PushLocalAddress => self.calc.push_ptr(self.fp.wrapping_add_signed(a as isize)),
            OpCode::PushOuterAddress => {
                let base = self.display_base(a)?;
                self.calc.push_ptr(base.wrapping_add_signed(b as isize));
            }
            OpCode::PushString => {
                let s = usize::try_from(a)
                    .ok()
                    .and_then(|id| rt.data().string_constant(id))
                    .ok_or_else(|| VmError::InvalidArgument(format!("no string constant {a}")))?;
                self.push_any(s);
            }

            // ── calculator stack
            OpCode::Dup => self.calc.push(self.calc.peek(0)),
            OpCode::Drop => {
                self.calc.pop();
            }
            OpCode::Swap => {
                let top = self.calc.peek(0);
                self.calc.set(0, self.calc.peek(1));
                self.calc.set(1, top);
            }

            // ── loads
            OpCode::LoadI8 => load!(i8, |v: i8| v as i64 as u64),
            OpCode::LoadU8 => load!(u8, |v: u8| u64::from(v)),
            OpCode::LoadI16 => load!(i16, |v: i16| v as i64 as u64),
            OpCode::LoadU16 => load!(u16, |v: u16| u64::from(v)),
            OpCode::LoadI32 => load!(i32, |v: i32| v as i64 as u64),
            OpCode::LoadU32 => load!(u32, |v: u32| u64::from(v)),
            OpCode::LoadI64 => load!(u64, |v: u64| v),
            OpCode::LoadF32 => load!(f32, |v: f32| f64::from(v).to_bits()),
            OpCode::LoadF64 => load!(u64, |v: u64| v),
            OpCode::LoadPtr => load!(usize, |v: usize| v as u64),
            OpCode::LoadVector => {
                let p = self.address(a)?;
                // SAFETY: the slot holds a live handle; the copy takes its own reference.
                let v = unsafe { VectorDataPtr::clone_from_raw(p.cast::<u64>().read_unaligned()) };
                self.push_vector(v);
            }
            OpCode::LoadAny => {
                let p = self.address(a)?;
                // SAFETY: as for LoadVector.
                let v = unsafe { AnyValue::clone_from_raw(p.cast::<u64>().read_unaligned()) };
                self.push_any(v);
            }

            // ── stores
            OpCode::StoreI8 => store!(i8, |r: u64| r as i8),
            OpCode::StoreI16 => store!(i16, |r: u64| r as i16),
            OpCode::StoreI32 => store!(i32, |r: u64| r as i32),
            OpCode::StoreI64 => store!(u64, |r: u64| r),
            OpCode::StoreF32 => store!(f32, |r: u64| f64::from_bits(r) as f32),
            OpCode::StoreF64 => store!(u64, |r: u64| r),
            OpCode::StorePtr => store!(usize, |r: u64| r as usize),
            OpCode::StoreVector => {
                let new = self.calc.pop();
                let p = self.address(a)?.cast::<u64>();
                // SAFETY: the slot holds a live handle which the store replaces.
                unsafe {
                    let old = p.read_unaligned();
                    p.write_unaligned(new);
                    drop(VectorDataPtr::from_raw(old));
                }
            }
            OpCode::StoreAny => {
                let new = self.calc.pop();
                let p = self.address(a)?.cast::<u64>();
                // SAFETY: as for StoreVector.
                unsafe {
                    let old = p.read_unaligned();
                    p.write_unaligned(new);
                    drop(AnyValue::from_raw(old));
                }
            }

            // ── bulk memory and frames
            OpCode::CopyBytes => {
                let src = self.pop_address()?;
                let dst = self.pop_address()?;
                // SAFETY: both regions span `a` bytes; they may overlap.
                unsafe { std::ptr::copy(src, dst, a as usize) };
            }
            OpCode::CopyManaged => {
                let m: ManagerRef = manager!(a);
                let src = self.pop_address()?;
                let dst = self.pop_address()?;
                // SAFETY: both regions hold live values described by `m`.
                unsafe { assign_managed(&m, src, dst) };
            }
            OpCode::PushParam => {
                let v = self.calc.pop();
                self.native.push(v)?;
            }
            OpCode::PushBytes => {
                let src = self.pop_address()?;
                let dst = self.native.allocate(a as usize, true)?;
                // SAFETY: dst is a fresh span of at least `a` bytes.
                unsafe { std::ptr::copy_nonoverlapping(src, dst, a as usize) };
            }
            OpCode::PushManaged => {
                let m: ManagerRef = manager!(a);
                let src = self.pop_address()?;
                let size = (b as usize).max(m.size());
                let dst = self.native.allocate(size, true)?;
                // SAFETY: raw image first, then the managed parts copy-constructed on top.
                unsafe {
                    std::ptr::copy_nonoverlapping(src, dst, size);
                    m.copy(src, dst);
                }
            }
            OpCode::Alloc => {
                self.native.allocate(a as usize, true)?;
            }
            OpCode::Release => self.native.release(a as usize),
            OpCode::AlignStack => self.native.align(a as usize)?,
            OpCode::InitRegion => {
                let m: ManagerRef = manager!(a);
                let p = self.pop_address()?;
                // SAFETY: the program names a region of m.size() bytes.
                unsafe { m.init(p) };
            }
            OpCode::DestroyRegion => {
                let m: ManagerRef = manager!(a);
                let p = self.pop_address()?;
                // SAFETY: the region holds live values described by `m`.
                unsafe { m.destroy(p) };
            }

            // ── control flow
            OpCode::Call => self.call(a as usize)?,
            OpCode::CallIndirect => {
                let target = self.calc.pop_ptr();
                self.call(target)?;
            }
            OpCode::Enter => {
                let level = a as usize;
                let saved = *self.display_slot(level);
                self.native.push(self.fp as u64)?;
                self.native.push(saved as u64)?;
                self.fp = self.native.sp();
                *self.display_slot(level) = self.fp;
                self.native.allocate(b as usize, true)?;
            }
            OpCode::Leave => {
                self.native.set_sp(self.fp);
                let saved = self.native.pop::<u64>() as usize;
                *self.display_slot(a as usize) = saved;
                self.fp = self.native.pop::<u64>() as usize;
            }
            OpCode::Return => {
                let ret = self.native.pop::<u64>() as usize;
                self.native.release(a as usize);
                if ret == 0 {
                    return Ok(Some(Outcome::Done));
                }
                self.pc = ret;
            }
            OpCode::Jump => self.jump(a),
            OpCode::JumpIfFalse => {
                if self.calc.pop_int() == 0 {
                    self.jump(a);
                }
            }
            OpCode::JumpIfTrue => {
                if self.calc.pop_int() != 0 {
                    self.jump(a);
                }
            }
            OpCode::CaseEqual => {
                if self.calc.peek_int(0) == a {
                    self.calc.pop();
                    self.jump(b);
                }
            }
            OpCode::CaseRange => {
                if (a..=b).contains(&self.calc.peek_int(0)) {
                    self.calc.pop();
                } else {
                    self.pc += 1;
                }
            }

            // ── integers
            OpCode::AddInt => self.calc.checked_int(i64::checked_add)?,
            OpCode::SubInt => self.calc.checked_int(i64::checked_sub)?,
            OpCode::MulInt => self.calc.checked_int(i64::checked_mul)?,
            OpCode::DivInt => self.calc.try_int(ops::checked_div)?,
            OpCode::ModInt => self.calc.try_int(ops::checked_rem)?,
            OpCode::NegInt => {
                let v = self.calc.pop_int();
                self.calc.push_int(v.checked_neg().ok_or(VmError::Overflow)?);
            }
            OpCode::AndInt => self.calc.binary_int(|x, y| x & y),
            OpCode::OrInt => self.calc.binary_int(|x, y| x | y),
            OpCode::XorInt => self.calc.binary_int(|x, y| x ^ y),
            OpCode::NotInt => {
                let v = self.calc.pop_int();
                self.calc.push_int(!v);
            }
            OpCode::Shl => self.calc.binary_int(|x, y| x.wrapping_shl(y as u32)),
            OpCode::Shr => self.calc.binary_int(|x, y| x.wrapping_shr(y as u32)),
            OpCode::CompareInt => {
                let cmp = CompareOp::from_code(a)?;
                let y = self.calc.pop_int();
                let x = self.calc.pop_int();
                self.push_bool(cmp.test(x, y));
            }
            OpCode::CheckRange => {
                let v = self.calc.peek_int(0);
                if !(a..=b).contains(&v) {
                    return Err(VmError::RangeCheck(format!("{v} outside {a}..={b}")));
                }
            }

            // ── floats
            OpCode::AddFloat => self.calc.binary_float(|x, y| x + y),
            OpCode::SubFloat => self.calc.binary_float(|x, y| x - y),
            OpCode::MulFloat => self.calc.binary_float(|x, y| x * y),
            OpCode::DivFloat => self.calc.binary_float(|x, y| x / y),
            OpCode::NegFloat => {
                let v = self.calc.pop_float();
                self.calc.push_float(-v);
            }
            OpCode::CompareFloat => {
                let cmp = CompareOp::from_code(a)?;
                let y = self.calc.pop_float();
                let x = self.calc.pop_float();
                self.push_bool(cmp.test(x, y));
            }
            OpCode::IntToFloat => {
                let v = self.calc.pop_int();
                self.calc.push_float(v as f64);
            }
            OpCode::FloatToInt => {
                let v = self.calc.pop_float();
                self.calc.push_int(v as i64);
            }

            // ── strings
            OpCode::StringLength => {
                let s = self.pop_any();
                // SAFETY: string slots hold String payloads.
                let len = unsafe { s.as_str() }.len();
                self.calc.push_int(len as i64);
            }
            OpCode::StringCharAt => {
                let index = self.calc.pop_int();
                let s = self.pop_any();
                if !s.has_value() {
                    return Err(VmError::InvalidArgument("index into an unset string".into()));
                }
                // SAFETY: as above.
                let bytes = unsafe { s.as_str() }.as_bytes();
                let byte = usize::try_from(index)
                    .ok()
                    .and_then(|i| i.checked_sub(1))
                    .and_then(|i| bytes.get(i))
                    .ok_or_else(|| {
                        VmError::RangeCheck(format!("index {index} outside 1..={}", bytes.len()))
                    })?;
                self.calc.push_int(i64::from(*byte));
            }
            OpCode::StringConcat => {
                let rhs = self.pop_any();
                let mut lhs = self.pop_any();
                if !lhs.has_value() {
                    self.push_any(rhs);
                } else {
                    if rhs.has_value() {
                        // SAFETY: both hold strings; get_mut unshares lhs first.
                        unsafe { lhs.get_mut::<String>().push_str(rhs.as_str()) };
                    }
                    self.push_any(lhs);
                }
            }
            OpCode::StringEqual => {
                let rhs = self.pop_any();
                let lhs = self.pop_any();
                // SAFETY: as above.
                let equal = unsafe { lhs.as_str() == rhs.as_str() };
                self.push_bool(equal);
            }
            OpCode::DropAny => drop(self.pop_any()),

            // ── vector construction
            OpCode::VecFromScalar => {
                let ty = ScalarType::from_code(a)?;
                let v = if ty.is_float() {
                    ops::from_float(ty, self.calc.pop_float())?
                } else {
                    ops::from_int(ty, self.calc.pop_int())?
                };
                self.push_vector(v);
            }
            OpCode::VecFromLvalue => {
                let m = manager_by_id(rt, b)?;
                let src = self.pop_address()?;
                // SAFETY: the lvalue holds one live element of `a` bytes.
                let v = unsafe { ops::from_lvalue(src, a as usize, m)? };
                self.push_vector(v);
            }
            OpCode::VecZeroed => {
                let v = VectorDataPtr::new(a as usize, b as usize, None, true)?;
                self.push_vector(v);
            }
            OpCode::VecNew => {
                let count = self.pop_count()?;
                let v = VectorDataPtr::new(a as usize, count, manager_by_id(rt, b)?, true)?;
                self.push_vector(v);
            }
            OpCode::VecConvert => {
                let (from, to) = (ScalarType::from_code(a)?, ScalarType::from_code(b)?);
                let v = self.pop_vector();
                self.push_vector(ops::convert(&v, from, to)?);
            }
            OpCode::VecCombine => {
                let mut operands = Vec::with_capacity(a as usize);
                for _ in 0..a {
                    let operand = match self.calc.pop_int() {
                        0 => CombineOperand::Int(self.calc.pop_int()),
                        1 => CombineOperand::Double(self.calc.pop_float()),
                        2 => CombineOperand::Single(self.calc.pop_float() as f32),
                        3 => CombineOperand::String(self.pop_any()),
                        4 => CombineOperand::Vector(self.pop_vector()),
                        5 => CombineOperand::Lvalue(self.pop_address()?),
                        tag => {
                            return Err(VmError::InvalidArgument(format!(
                                "unknown combine operand tag {tag}"
                            )));
                        }
                    };
                    operands.push(operand);
                }
                operands.reverse();
                let v = ops::combine(&operands, b as usize)?;
                self.push_vector(v);
            }
            OpCode::VecResize => {
                let count = self.pop_count()?;
                let v = self.pop_vector();
                let resized = v.resize(count, a as usize, manager_by_id(rt, b)?)?;
                self.push_vector(resized);
            }

            // ── vector indexing
            OpCode::VecGather => {
                let ty = ScalarType::from_code(a)?;
                let indices = self.pop_vector();
                let source = self.pop_vector();
                self.push_vector(ops::gather(&source, &indices, ty)?);
            }
            OpCode::VecFilter => {
                let mask = self.pop_vector();
                let source = self.pop_vector();
                self.push_vector(ops::filter(&source, &mask)?);
            }
            OpCode::VecElement => {
                let index = self.calc.pop_int();
                let slot = self.pop_address()?.cast::<u64>();
                // SAFETY: the slot holds a live handle; it is unshared and written back.
                let mut v = unsafe { VectorDataPtr::from_raw(slot.read_unaligned()) };
                let unshared = v.copy_on_write();
                let element = usize::try_from(index)
                    .ok()
                    .filter(|i| *i < v.len())
                    .map(|i| v.element_ptr(i));
                let (len, size) = (v.len(), v.element_size());
                // SAFETY: ownership goes back to the slot it came from.
                unsafe { slot.write_unaligned(v.into_raw()) };
                unshared?;
                debug_assert!(a <= 0 || len == 0 || a as usize == size, "element size mismatch");
                let p = element.ok_or_else(|| {
                    VmError::RangeCheck(format!("element {index} outside 0..{len}"))
                })?;
                self.calc.push_ptr(p as usize);
            }

            // ── vector operators
            OpCode::VecArith => {
                let op = ArithOp::from_code(a)?;
                let (lt, rt_ty) = ops::unpack_codes(b)?;
                let rhs = self.pop_vector();
                let lhs = self.pop_vector();
                self.push_vector(ops::arith(op, &lhs, lt, &rhs, rt_ty)?);
            }
            OpCode::VecCompare => {
                let cmp = CompareOp::from_code(a)?;
                let (lt, rt_ty) = ops::unpack_codes(b)?;
                let rhs = self.pop_vector();
                let lhs = self.pop_vector();
                self.push_vector(ops::compare(cmp, &lhs, lt, &rhs, rt_ty)?);
            }
            OpCode::VecLength => {
                let v = self.pop_vector();
                self.calc.push_int(v.len() as i64);
            }
            OpCode::VecReverse => {
                let v = self.pop_vector();
                self.push_vector(v.reversed()?);
            }
            OpCode::VecInvert => {
                let ty = ScalarType::from_code(b)?;
                let mut v = self.pop_vector();
                ops::invert(&mut v, a, ty)?;
                self.push_vector(v);
            }
            OpCode::VecRangeCheck => {
                let ty = ScalarType::from_code(self.calc.pop_int())?;
                // SAFETY: the handle stays owned by its calculator slot.
                let v = ManuallyDrop::new(unsafe { VectorDataPtr::from_raw(self.calc.peek(0)) });
                ops::range_check(&v, ty, a, b)?;
            }
            OpCode::DropVector => drop(self.pop_vector()),

            // ── runtime data
            OpCode::AllocMemory => {
                let size = self.pop_count()?;
                let p = rt.data().allocate_memory(size, a != 0)?;
                self.calc.push_ptr(p as usize);
            }
            OpCode::ReleaseMemory => {
                let p = self.calc.pop_ptr() as *mut u8;
                // SAFETY: the program releases what AllocMemory handed out.
                unsafe { rt.data().release_memory(p) };
            }
            OpCode::FileHandler => {
                let handler = match a {
                    0 => {
                        let id = self.calc.pop_int();
                        rt.data().file_handler(id)?
                    }
                    1 => rt.data().text_file_base_handler()?,
                    2 => {
                        let record = self.pop_count()?;
                        rt.data().binary_file_handler(record)?
                    }
                    kind => {
                        return Err(VmError::InvalidArgument(format!("unknown file handler kind {kind}")));
                    }
                };
                self.calc.push_ptr(handler as usize);
            }
            OpCode::CloseFile => {
                let handler = self.calc.pop_ptr() as *mut u8;
                rt.data().close_file_handler(handler)?;
            }

            // ── foreign calls
            OpCode::CallExternal => external::call(self, rt, a as usize, b as usize)?,
            OpCode::PushCallback => {
                let p = rt.callback(a as usize)?;
                self.calc.push_ptr(p as usize);
            }

            // ── misc
            OpCode::Nop => {}
            OpCode::Stop => return Ok(Some(Outcome::Stopped)),
            OpCode::Halt => {
                let code = self.calc.pop_int();
                return Ok(Some(Outcome::Halted { code }));
            }
            OpCode::Break => {
                self.suspended = true;
                log::debug!("breakpoint, resuming at {}", self.pc);
                return Ok(Some(Outcome::Breakpoint { pc: self.pc, frame: self.fp }));
            }
            OpCode::Illegal => return Err(VmError::InvalidOpcode { op: inst.op }),
        }
        Ok(None)
    }
}

/// `None` for a negative id; unknown ids are an error.
fn manager_by_id(rt: &Runtime, id: i64) -> VmResult<Option<ManagerRef>> {
    if id < 0 {
        return Ok(None);
    }
    rt.data()
        .any_manager(id as usize)
        .map(Some)
        .ok_or_else(|| VmError::InvalidArgument(format!("no manager {id}")))
}

/// Replaces the managed value at `dst` with a copy of the one at `src`.
///
/// # Safety
/// Both regions must hold live values described by `m`.
unsafe fn assign_managed(m: &ManagerRef, src: *const u8, dst: *mut u8) {
    if std::ptr::eq(src, dst) {
        return;
    }
    // SAFETY: forwarded from the caller.
    unsafe {
        m.destroy(dst);
        std::ptr::copy_nonoverlapping(src, dst, m.size());
        m.copy(src, dst);
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::Program;
    use std::sync::Arc;

    fn runtime(build: impl FnOnce(&mut Program)) -> Arc<Runtime> {
        let mut p = Program::new();
        build(&mut p);
        Runtime::new(p, StaticRuntimeData::new(), RuntimeConfig::default()).unwrap()
    }

    fn top_int(rt: &Runtime) -> i64 {
        rt.inspect(|i| i.peek_int(0)).unwrap()
    }

    #[test]
    fn error_kinds() {
        assert_eq!(VmError::Overflow.kind(), ErrorKind::Overflow);
        let t = Trap { pc: 3, error: VmError::RangeCheck("x".into()) };
        assert_eq!(t.kind(), ErrorKind::RangeCheck);
        assert_eq!(t.to_string(), "range check failed: x (pc 3)");
    }

    #[test]
    fn halt_returns_code() {
        let rt = runtime(|p| {
            p.emit_op(OpCode::PushInt, 6, 0);
            p.emit_op(OpCode::PushInt, 7, 0);
            p.emit_op(OpCode::MulInt, 0, 0);
            p.emit_op(OpCode::Halt, 0, 0);
        });
        assert_eq!(rt.run(), Ok(Outcome::Halted { code: 42 }));
    }

    #[test]
    fn illegal_and_runaway_pc() {
        let rt = runtime(|p| {
            p.emit_op(OpCode::Illegal, 0, 0);
        });
        let trap = rt.run().unwrap_err();
        assert_eq!(trap.pc, 1);
        assert_eq!(trap.kind(), ErrorKind::InvalidOpcode);

        let rt = runtime(|p| {
            p.emit_op(OpCode::Nop, 0, 0);
        });
        assert_eq!(rt.run().unwrap_err().pc, 2);
    }

    #[test]
    fn division_faults() {
        let rt = runtime(|p| {
            p.emit_op(OpCode::PushInt, 1, 0);
            p.emit_op(OpCode::PushInt, 0, 0);
            p.emit_op(OpCode::DivInt, 0, 0);
        });
        assert_eq!(rt.run().unwrap_err().kind(), ErrorKind::InvalidArgument);

        let rt = runtime(|p| {
            p.emit_op(OpCode::PushInt, i64::MIN, 0);
            p.emit_op(OpCode::NegInt, 0, 0);
        });
        assert_eq!(rt.run().unwrap_err().kind(), ErrorKind::Overflow);
    }

    #[test]
    fn case_range_takes_following_jump() {
        let rt = runtime(|p| {
            p.emit_op(OpCode::PushInt, 15, 0);
            p.emit_op(OpCode::CaseEqual, 3, 100);
            p.emit_op(OpCode::CaseRange, 10, 20);
            let jump = p.emit_op(OpCode::Jump, 0, 0);
            p.emit_op(OpCode::PushInt, -1, 0);
            p.emit_op(OpCode::Stop, 0, 0);
            let target = p.emit_op(OpCode::PushInt, 1, 0);
            p.emit_op(OpCode::Stop, 0, 0);
            p.fixup_address(jump, target).unwrap();
        });
        assert_eq!(rt.run(), Ok(Outcome::Stopped));
        assert_eq!(top_int(&rt), 1);
        assert_eq!(rt.inspect(|i| i.calc_depth()), Some(1));
    }

    #[test]
    fn check_range_keeps_value() {
        let rt = runtime(|p| {
            p.emit_op(OpCode::PushInt, 5, 0);
            p.emit_op(OpCode::CheckRange, 0, 9);
            p.emit_op(OpCode::CheckRange, 6, 9);
        });
        let trap = rt.run().unwrap_err();
        assert_eq!((trap.pc, trap.kind()), (3, ErrorKind::RangeCheck));
    }

    #[test]
    fn string_concat_unshares_constant() {
        let mut data = StaticRuntimeData::new();
        let hello = data.add_string("hello ");
        let world = data.add_string("world");
        let mut p = Program::new();
        p.set_globals_size(8);
        p.emit_op(OpCode::PushGlobalAddress, 0, 0);
        p.emit_op(OpCode::PushString, hello as i64, 0);
        p.emit_op(OpCode::PushString, world as i64, 0);
        p.emit_op(OpCode::StringConcat, 0, 0);
        p.emit_op(OpCode::StoreAny, 0, 0);
        p.emit_op(OpCode::PushGlobalAddress, 0, 0);
        p.emit_op(OpCode::LoadAny, 0, 0);
        p.emit_op(OpCode::StringLength, 0, 0);
        p.emit_op(OpCode::Stop, 0, 0);
        let rt = Runtime::new(p, data, RuntimeConfig::default()).unwrap();
        assert_eq!(rt.run(), Ok(Outcome::Stopped));
        assert_eq!(top_int(&rt), 11);
        let constant = rt.data().string_constant(hello).unwrap();
        assert_eq!(unsafe { constant.as_str() }, "hello ");
        let raw = rt.read_global::<u64>(0).unwrap();
        let joined = unsafe { AnyValue::clone_from_raw(raw) };
        assert_eq!(unsafe { joined.as_str() }, "hello world");
        assert_eq!(joined.ref_count(), 2);
    }

    #[test]
    fn char_at_unset_string() {
        let rt = runtime(|p| {
            p.emit_op(OpCode::PushInt, 0, 0);
            p.emit_op(OpCode::PushInt, 1, 0);
            p.emit_op(OpCode::StringCharAt, 0, 0);
        });
        assert_eq!(rt.run().unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn float_compare_and_convert() {
        let rt = runtime(|p| {
            p.emit(Instruction::with_float(OpCode::PushFloat, 2.5));
            p.emit_op(OpCode::PushInt, 2, 0);
            p.emit_op(OpCode::IntToFloat, 0, 0);
            p.emit_op(OpCode::CompareFloat, 4, 0); // 2.5 > 2.0
            p.emit(Instruction::with_float(OpCode::PushFloat, -7.9));
            p.emit_op(OpCode::FloatToInt, 0, 0);
            p.emit_op(OpCode::Stop, 0, 0);
        });
        assert_eq!(rt.run(), Ok(Outcome::Stopped));
        assert_eq!(rt.inspect(|i| (i.peek_int(1), i.peek_int(0))), Some((1, -7)));
    }

    #[test]
    fn unknown_manager_id() {
        let rt = runtime(|p| {
            p.emit_op(OpCode::PushInt, 1, 0);
            p.emit_op(OpCode::VecNew, 8, 3);
        });
        assert_eq!(rt.run().unwrap_err().kind(), ErrorKind::InvalidArgument);
    }
}
