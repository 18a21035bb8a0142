//! Vector construction, indexing and elementwise kernels.
//!
//! Every kernel is driven by the two operand [`ScalarType`]s: element reads go
//! through the per-type reader tables, so a 9×9 code pair costs two table
//! lookups instead of a generated function per combination.

use std::sync::Arc;

use crate::any::AnyValue;
use crate::any::manager::{ManagerRef, SingleAnyManager};
use crate::vector::scalar::write_int_sized;
use crate::vector::{ScalarType, VectorDataPtr};
use crate::vm::VmError;

type VResult<T> = Result<T, VmError>;

// ── Operators ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Min,
    Max,
    And,
    Or,
    Xor,
}

impl ArithOp {
    const ALL: [ArithOp; 10] = [
        ArithOp::Add,
        ArithOp::Sub,
        ArithOp::Mul,
        ArithOp::Div,
        ArithOp::Mod,
        ArithOp::Min,
        ArithOp::Max,
        ArithOp::And,
        ArithOp::Or,
        ArithOp::Xor,
    ];

    pub fn from_code(code: i64) -> VResult<Self> {
        usize::try_from(code)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
            .ok_or_else(|| VmError::InvalidArgument(format!("unknown arithmetic operator {code}")))
    }

    fn apply_int(self, a: i64, b: i64) -> VResult<i64> {
        match self {
            ArithOp::Add => a.checked_add(b).ok_or(VmError::Overflow),
            ArithOp::Sub => a.checked_sub(b).ok_or(VmError::Overflow),
            ArithOp::Mul => a.checked_mul(b).ok_or(VmError::Overflow),
            ArithOp::Div => checked_div(a, b),
            ArithOp::Mod => checked_rem(a, b),
            ArithOp::Min => Ok(a.min(b)),
            ArithOp::Max => Ok(a.max(b)),
            ArithOp::And => Ok(a & b),
            ArithOp::Or => Ok(a | b),
            ArithOp::Xor => Ok(a ^ b),
        }
    }

    fn apply_float(self, a: f64, b: f64) -> f64 {
        match self {
            ArithOp::Add => a + b,
            ArithOp::Sub => a - b,
            ArithOp::Mul => a * b,
            ArithOp::Div => a / b,
            ArithOp::Mod => a % b,
            ArithOp::Min => a.min(b),
            ArithOp::Max => a.max(b),
            // rejected before the loop
            ArithOp::And | ArithOp::Or | ArithOp::Xor => f64::NAN,
        }
    }

    fn is_bitwise(self) -> bool {
        matches!(self, ArithOp::And | ArithOp::Or | ArithOp::Xor)
    }
}

/// Integer division shared by the scalar and vector paths.
pub(crate) fn checked_div(a: i64, b: i64) -> VResult<i64> {
    if b == 0 {
        return Err(VmError::InvalidArgument("division by zero".into()));
    }
    a.checked_div(b).ok_or(VmError::Overflow)
}

pub(crate) fn checked_rem(a: i64, b: i64) -> VResult<i64> {
    if b == 0 {
        return Err(VmError::InvalidArgument("division by zero".into()));
    }
    a.checked_rem(b).ok_or(VmError::Overflow)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    const ALL: [CompareOp; 6] =
        [CompareOp::Eq, CompareOp::Ne, CompareOp::Lt, CompareOp::Le, CompareOp::Gt, CompareOp::Ge];

    pub fn from_code(code: i64) -> VResult<Self> {
        usize::try_from(code)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
            .ok_or_else(|| VmError::InvalidArgument(format!("unknown comparison {code}")))
    }

    pub fn test<T: PartialOrd>(self, a: T, b: T) -> bool {
        match self {
            CompareOp::Eq => a == b,
            CompareOp::Ne => a != b,
            CompareOp::Lt => a < b,
            CompareOp::Le => a <= b,
            CompareOp::Gt => a > b,
            CompareOp::Ge => a >= b,
        }
    }
}

/// Splits a packed `lhs | rhs << 8` operand-code parameter.
pub fn unpack_codes(codes: i64) -> VResult<(ScalarType, ScalarType)> {
    Ok((ScalarType::from_code(codes & 0xff)?, ScalarType::from_code((codes >> 8) & 0xff)?))
}

// ── Construction ─────────────────────────────────────────────────────

pub fn from_int(ty: ScalarType, v: i64) -> VResult<VectorDataPtr> {
    let out = VectorDataPtr::new(ty.size(), 1, None, false)?;
    // SAFETY: one element of ty.size() bytes.
    unsafe { ty.write_i64(out.element_ptr(0), v) };
    Ok(out)
}

pub fn from_float(ty: ScalarType, v: f64) -> VResult<VectorDataPtr> {
    let out = VectorDataPtr::new(ty.size(), 1, None, false)?;
    // SAFETY: one element of ty.size() bytes.
    unsafe { ty.write_f64(out.element_ptr(0), v) };
    Ok(out)
}

/// One-element vector copied from an lvalue of `size` bytes.
///
/// # Safety
/// `src` must hold a live element of that layout.
pub unsafe fn from_lvalue(
    src: *const u8,
    size: usize,
    manager: Option<ManagerRef>,
) -> VResult<VectorDataPtr> {
    let mut out = VectorDataPtr::new(size, 1, manager, true)?;
    // SAFETY: forwarded from the caller.
    unsafe { out.set_element(0, src) };
    Ok(out)
}

/// Converts every element from `from` to `to` with `as`-cast semantics.
pub fn convert(src: &VectorDataPtr, from: ScalarType, to: ScalarType) -> VResult<VectorDataPtr> {
    let n = src.len();
    let out = VectorDataPtr::new(to.size(), n, None, false)?;
    let float = from.is_float() || to.is_float();
    for i in 0..n {
        // SAFETY: i < n in both buffers, sizes come from the type codes.
        unsafe {
            if float {
                to.write_f64(out.element_ptr(i), from.read_f64(src.element_ptr(i)));
            } else {
                to.write_i64(out.element_ptr(i), from.read_i64(src.element_ptr(i)));
            }
        }
    }
    Ok(out)
}

/// A tagged operand of [`combine`].
#[derive(Debug)]
pub enum CombineOperand {
    Int(i64),
    Double(f64),
    Single(f32),
    String(AnyValue),
    Vector(VectorDataPtr),
    Lvalue(*const u8),
}

impl CombineOperand {
    fn contribution(&self) -> usize {
        match self {
            CombineOperand::Vector(v) => v.len(),
            _ => 1,
        }
    }
}

/// Concatenates operands in order. Element size and manager come from the
/// first non-empty vector operand; failing that from `size_hint`, with an
/// any-value manager when a string operand is present.
pub fn combine(operands: &[CombineOperand], size_hint: usize) -> VResult<VectorDataPtr> {
    let (size, manager) = operands
        .iter()
        .find_map(|op| match op {
            CombineOperand::Vector(v) if !v.is_empty() => {
                Some((v.element_size(), v.manager().cloned()))
            }
            _ => None,
        })
        .unwrap_or_else(|| {
            let strings = operands.iter().any(|op| matches!(op, CombineOperand::String(_)));
            let manager: Option<ManagerRef> =
                if strings { Some(Arc::new(SingleAnyManager)) } else { None };
            (size_hint, manager)
        });
    let total = operands.iter().map(CombineOperand::contribution).sum();
    let mut out = VectorDataPtr::new(size, total, manager, true)?;

    let mut at = 0;
    for op in operands {
        // SAFETY: `at` stays below `total`, which counts every contribution.
        unsafe {
            match op {
                CombineOperand::Int(v) => write_int_sized(out.element_ptr(at), size, *v),
                CombineOperand::Double(v) => write_float_sized(out.element_ptr(at), size, *v),
                CombineOperand::Single(v) => {
                    write_float_sized(out.element_ptr(at), size, f64::from(*v))
                }
                CombineOperand::String(s) => {
                    out.set_element(at, (s as *const AnyValue).cast());
                }
                CombineOperand::Lvalue(p) => out.set_element(at, *p),
                CombineOperand::Vector(v) => {
                    debug_assert!(v.is_empty() || v.element_size() == size);
                    for i in 0..v.len() {
                        out.set_element(at + i, v.element_ptr(i));
                    }
                }
            }
        }
        at += op.contribution();
    }
    Ok(out)
}

unsafe fn write_float_sized(p: *mut u8, size: usize, v: f64) {
    // SAFETY: callers pass an element of `size` bytes.
    unsafe {
        if size == 4 {
            p.cast::<f32>().write_unaligned(v as f32);
        } else {
            p.cast::<f64>().write_unaligned(v);
        }
    }
}

// ── Indexing ─────────────────────────────────────────────────────────

/// `result[i] = source[indices[i] - 1]`.
pub fn gather(
    source: &VectorDataPtr,
    indices: &VectorDataPtr,
    index_type: ScalarType,
) -> VResult<VectorDataPtr> {
    if index_type.is_float() {
        return Err(VmError::InvalidArgument(format!("{index_type:?} is not an index type")));
    }
    let n = indices.len();
    let mut out = VectorDataPtr::new(source.element_size(), n, source.manager().cloned(), false)?;
    let read = index_type.int_reader();
    for i in 0..n {
        // SAFETY: i < n and the reader matches the index element width.
        let index = unsafe { read(indices.element_ptr(i)) };
        let Some(k) = usize::try_from(index).ok().filter(|k| (1..=source.len()).contains(k))
        else {
            return Err(VmError::RangeCheck(format!(
                "index {index} outside 1..={}",
                source.len()
            )));
        };
        // SAFETY: k - 1 < source.len().
        unsafe { out.set_element(i, source.element_ptr(k - 1)) };
    }
    Ok(out)
}

const LOW_SEVEN: u64 = 0x7f7f_7f7f_7f7f_7f7f;
const HIGH_BITS: u64 = 0x8080_8080_8080_8080;

/// Number of nonzero bytes in a boolean mask, eight at a time.
fn count_set(mask: &[u8]) -> usize {
    let mut chunks = mask.chunks_exact(8);
    let mut total = 0;
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        let x = u64::from_ne_bytes(word);
        // high bit of each byte set iff the byte is nonzero
        total += ((((x & LOW_SEVEN) + LOW_SEVEN) | x) & HIGH_BITS).count_ones() as usize;
    }
    total + chunks.remainder().iter().filter(|b| **b != 0).count()
}

/// Keeps `source[i]` where `mask[i]` is set.
pub fn filter(source: &VectorDataPtr, mask: &VectorDataPtr) -> VResult<VectorDataPtr> {
    if mask.len() > source.len() {
        return Err(VmError::RangeCheck(format!(
            "mask of {} elements over a vector of {}",
            mask.len(),
            source.len()
        )));
    }
    let bits = mask.bytes();
    let kept = count_set(bits);
    let mut out =
        VectorDataPtr::new(source.element_size(), kept, source.manager().cloned(), false)?;
    let mut at = 0;
    for (i, flag) in bits.iter().enumerate() {
        if *flag != 0 {
            // SAFETY: i < mask.len() <= source.len() and at < kept.
            unsafe { out.set_element(at, source.element_ptr(i)) };
            at += 1;
        }
    }
    Ok(out)
}

// ── Elementwise ──────────────────────────────────────────────────────

/// `lhs op rhs` with index-modulo broadcasting. All-integer operands compute
/// in `i64` and yield an `I64` vector; otherwise both sides are promoted and
/// the result is `F64`.
pub fn arith(
    op: ArithOp,
    lhs: &VectorDataPtr,
    lt: ScalarType,
    rhs: &VectorDataPtr,
    rt: ScalarType,
) -> VResult<VectorDataPtr> {
    if lhs.is_empty() || rhs.is_empty() {
        return Ok(VectorDataPtr::empty());
    }
    let (l1, l2) = (lhs.len(), rhs.len());
    let n = l1.max(l2);
    if lt.is_float() || rt.is_float() {
        if op.is_bitwise() {
            return Err(VmError::InvalidArgument(format!("{op:?} on floating operands")));
        }
        let (ra, rb) = (lt.float_reader(), rt.float_reader());
        let mut out = VectorDataPtr::new(8, n, None, false)?;
        for i in 0..n {
            // SAFETY: indices wrap inside each operand; readers match the codes.
            let v = unsafe { op.apply_float(ra(lhs.element_ptr(i % l1)), rb(rhs.element_ptr(i % l2))) };
            // SAFETY: i < n, f64 elements.
            unsafe { out.set(i, v) };
        }
        Ok(out)
    } else {
        let (ra, rb) = (lt.int_reader(), rt.int_reader());
        let mut out = VectorDataPtr::new(8, n, None, false)?;
        for i in 0..n {
            // SAFETY: as above.
            let v = unsafe { op.apply_int(ra(lhs.element_ptr(i % l1)), rb(rhs.element_ptr(i % l2))) }?;
            // SAFETY: i < n, i64 elements.
            unsafe { out.set(i, v) };
        }
        Ok(out)
    }
}

/// Elementwise comparison into a `U8` boolean vector.
pub fn compare(
    cmp: CompareOp,
    lhs: &VectorDataPtr,
    lt: ScalarType,
    rhs: &VectorDataPtr,
    rt: ScalarType,
) -> VResult<VectorDataPtr> {
    if lhs.is_empty() || rhs.is_empty() {
        return Ok(VectorDataPtr::empty());
    }
    let (l1, l2) = (lhs.len(), rhs.len());
    let n = l1.max(l2);
    let mut out = VectorDataPtr::new(1, n, None, false)?;
    let float = lt.is_float() || rt.is_float();
    for i in 0..n {
        let (a, b) = (lhs.element_ptr(i % l1), rhs.element_ptr(i % l2));
        // SAFETY: indices wrap inside each operand; readers match the codes.
        let hit = unsafe {
            if float {
                cmp.test(lt.read_f64(a), rt.read_f64(b))
            } else {
                cmp.test(lt.read_i64(a), rt.read_i64(b))
            }
        };
        // SAFETY: i < n, u8 elements.
        unsafe { out.set(i, u8::from(hit)) };
    }
    Ok(out)
}

pub const INVERT_BITWISE: i64 = 0;
pub const INVERT_LOGICAL: i64 = 1;

/// In-place bitwise (`!x`) or logical (`x == 0`) inversion.
pub fn invert(v: &mut VectorDataPtr, mode: i64, ty: ScalarType) -> VResult<()> {
    if ty.is_float() {
        return Err(VmError::InvalidArgument(format!("cannot invert {ty:?} elements")));
    }
    if mode != INVERT_BITWISE && mode != INVERT_LOGICAL {
        return Err(VmError::InvalidArgument(format!("unknown invert mode {mode}")));
    }
    v.copy_on_write()?;
    for i in 0..v.len() {
        let p = v.element_ptr(i);
        // SAFETY: i < len, element width matches ty.
        unsafe {
            let x = ty.read_i64(p);
            let y = if mode == INVERT_BITWISE { !x } else { i64::from(x == 0) };
            ty.write_i64(p, y);
        }
    }
    Ok(())
}

/// Fails with `RangeCheck` on the first element outside `[lo, hi]`.
pub fn range_check(v: &VectorDataPtr, ty: ScalarType, lo: i64, hi: i64) -> VResult<()> {
    for i in 0..v.len() {
        let p = v.element_ptr(i);
        // SAFETY: i < len, element width matches ty.
        let inside = unsafe {
            if ty.is_float() {
                let x = ty.read_f64(p);
                x >= lo as f64 && x <= hi as f64
            } else {
                (lo..=hi).contains(&ty.read_i64(p))
            }
        };
        if !inside {
            return Err(VmError::RangeCheck(format!("element {i} outside {lo}..={hi}")));
        }
    }
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────────
