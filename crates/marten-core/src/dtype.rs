use std::fmt;

// DType: logical element type of a tensor
//
// Every backend stores elements as f32. The dtype is a tag carried next to
// the storage so operators that care about integer semantics (Shape, Cast,
// Gather indices) and the precision-16 loader can behave correctly:
//
//   F32  the default
//   F16  values are rounded through IEEE half on creation
//   I32  integer data, values are whole numbers
//   I64  shapes, indices and axes
//   U8   boolean masks and bytes
//
// Integer values above 2^24 lose precision in f32 storage. Models use I64
// for shapes and indices, which stay far below that.

/// Enum of all supported element data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DType {
    F16,
    #[default]
    F32,
    I32,
    I64,
    U8,
}

impl DType {
    /// Size of one element in the serialized form, in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::U8 => 1,
            DType::F16 => 2,
            DType::F32 | DType::I32 => 4,
            DType::I64 => 8,
        }
    }

    /// Whether this is a floating-point type.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::F32)
    }

    /// Whether this is an integer type.
    pub fn is_int(&self) -> bool {
        !self.is_float()
    }

    /// Bring a value into this dtype's domain.
    ///
    /// Floats round through half precision for `F16`; integer types truncate
    /// toward zero. `U8` also saturates into `0..=255`.
    pub fn quantize(&self, v: f32) -> f32 {
        match self {
            DType::F32 => v,
            DType::F16 => half::f16::from_f32(v).to_f32(),
            DType::I32 | DType::I64 => v.trunc(),
            DType::U8 => v.trunc().clamp(0.0, 255.0),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F16 => "f16",
            DType::F32 => "f32",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::U8 => "u8",
        };
        write!(f, "{s}")
    }
}
