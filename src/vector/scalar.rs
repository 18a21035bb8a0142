use serde::{Deserialize, Serialize};

use crate::vm::VmError;

/// The nine element representations vectorized operations are parameterized by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ScalarType {
    I8 = 0,
    U8 = 1,
    I16 = 2,
    U16 = 3,
    I32 = 4,
    U32 = 5,
    I64 = 6,
    F32 = 7,
    F64 = 8,
}

pub(crate) type IntReader = unsafe fn(*const u8) -> i64;
pub(crate) type FloatReader = unsafe fn(*const u8) -> f64;

const ALL: [ScalarType; 9] = [
    ScalarType::I8,
    ScalarType::U8,
    ScalarType::I16,
    ScalarType::U16,
    ScalarType::I32,
    ScalarType::U32,
    ScalarType::I64,
    ScalarType::F32,
    ScalarType::F64,
];

macro_rules! readers {
    ($($name:ident: $t:ty => $out:ty),* $(,)?) => {
        $(
            unsafe fn $name(p: *const u8) -> $out {
                // SAFETY: callers pass a pointer to an element of the matching width.
                unsafe { p.cast::<$t>().read_unaligned() as $out }
            }
        )*
    };
}

readers! {
    read_i8_i: i8 => i64, read_u8_i: u8 => i64, read_i16_i: i16 => i64,
    read_u16_i: u16 => i64, read_i32_i: i32 => i64, read_u32_i: u32 => i64,
    read_i64_i: i64 => i64, read_f32_i: f32 => i64, read_f64_i: f64 => i64,
    read_i8_f: i8 => f64, read_u8_f: u8 => f64, read_i16_f: i16 => f64,
    read_u16_f: u16 => f64, read_i32_f: i32 => f64, read_u32_f: u32 => f64,
    read_i64_f: i64 => f64, read_f32_f: f32 => f64, read_f64_f: f64 => f64,
}

const INT_READERS: [IntReader; 9] = [
    read_i8_i, read_u8_i, read_i16_i, read_u16_i, read_i32_i, read_u32_i, read_i64_i, read_f32_i,
    read_f64_i,
];

const FLOAT_READERS: [FloatReader; 9] = [
    read_i8_f, read_u8_f, read_i16_f, read_u16_f, read_i32_f, read_u32_f, read_i64_f, read_f32_f,
    read_f64_f,
];

impl ScalarType {
    pub fn from_code(code: i64) -> Result<Self, VmError> {
        usize::try_from(code)
            .ok()
            .and_then(|i| ALL.get(i).copied())
            .ok_or_else(|| VmError::InvalidArgument(format!("unknown scalar type code {code}")))
    }

    pub fn code(self) -> i64 {
        self as u8 as i64
    }

    pub fn size(self) -> usize {
        match self {
            ScalarType::I8 | ScalarType::U8 => 1,
            ScalarType::I16 | ScalarType::U16 => 2,
            ScalarType::I32 | ScalarType::U32 | ScalarType::F32 => 4,
            ScalarType::I64 | ScalarType::F64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, ScalarType::F32 | ScalarType::F64)
    }

    pub(crate) fn int_reader(self) -> IntReader {
        INT_READERS[self as usize]
    }

    pub(crate) fn float_reader(self) -> FloatReader {
        FLOAT_READERS[self as usize]
    }

    /// # Safety
    /// `p` must point to `self.size()` readable bytes.
    pub unsafe fn read_i64(self, p: *const u8) -> i64 {
        unsafe { (self.int_reader())(p) }
    }

    /// # Safety
    /// `p` must point to `self.size()` readable bytes.
    pub unsafe fn read_f64(self, p: *const u8) -> f64 {
        unsafe { (self.float_reader())(p) }
    }

    /// Stores `v` with C conversion semantics: narrower integers truncate,
    /// floating destinations convert.
    ///
    /// # Safety
    /// `p` must point to `self.size()` writable bytes.
    pub unsafe fn write_i64(self, p: *mut u8, v: i64) {
        unsafe {
            match self {
                ScalarType::I8 => p.cast::<i8>().write_unaligned(v as i8),
                ScalarType::U8 => p.cast::<u8>().write_unaligned(v as u8),
                ScalarType::I16 => p.cast::<i16>().write_unaligned(v as i16),
                ScalarType::U16 => p.cast::<u16>().write_unaligned(v as u16),
                ScalarType::I32 => p.cast::<i32>().write_unaligned(v as i32),
                ScalarType::U32 => p.cast::<u32>().write_unaligned(v as u32),
                ScalarType::I64 => p.cast::<i64>().write_unaligned(v),
                ScalarType::F32 => p.cast::<f32>().write_unaligned(v as f32),
                ScalarType::F64 => p.cast::<f64>().write_unaligned(v as f64),
            }
        }
    }

    /// Float counterpart of [`ScalarType::write_i64`]; integer destinations
    /// truncate toward zero first.
    ///
    /// # Safety
    /// `p` must point to `self.size()` writable bytes.
    pub unsafe fn write_f64(self, p: *mut u8, v: f64) {
        unsafe {
            match self {
                ScalarType::F32 => p.cast::<f32>().write_unaligned(v as f32),
                ScalarType::F64 => p.cast::<f64>().write_unaligned(v),
                _ => self.write_i64(p, v as i64),
            }
        }
    }
}

/// Writes an integer into an element of `size` bytes.
///
/// # Safety
/// `p` must point to `size` writable bytes.
pub(crate) unsafe fn write_int_sized(p: *mut u8, size: usize, v: i64) {
    unsafe {
        match size {
            1 => p.cast::<i8>().write_unaligned(v as i8),
            2 => p.cast::<i16>().write_unaligned(v as i16),
            4 => p.cast::<i32>().write_unaligned(v as i32),
            _ => p.cast::<i64>().write_unaligned(v),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
