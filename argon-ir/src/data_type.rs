use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Scalar element type of a value or a tensor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    U8,
    S8,
    U16,
    S16,
    F16,
    Bf16,
    U32,
    S32,
    F32,
    S64,
    /// Untyped byte pointer. Used for buffer variables (register
    /// buffers and global memory arguments).
    BytePtr,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size(self) -> u32 {
        match self {
            DataType::Bool | DataType::U8 | DataType::S8 => 1,
            DataType::U16 | DataType::S16 | DataType::F16 | DataType::Bf16 => 2,
            DataType::U32 | DataType::S32 | DataType::F32 => 4,
            DataType::S64 | DataType::BytePtr => 8,
        }
    }

    pub fn is_int(self) -> bool {
        matches!(
            self,
            DataType::U8
                | DataType::S8
                | DataType::U16
                | DataType::S16
                | DataType::U32
                | DataType::S32
                | DataType::S64
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, DataType::F16 | DataType::Bf16 | DataType::F32)
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            DataType::S8
                | DataType::S16
                | DataType::S32
                | DataType::S64
                | DataType::F16
                | DataType::Bf16
                | DataType::F32
        )
    }

    pub fn is_ptr(self) -> bool {
        self == DataType::BytePtr
    }

    /// Smallest representable value of an integer type.
    pub fn int_min(self) -> Option<i64> {
        match self {
            DataType::U8 | DataType::U16 | DataType::U32 => Some(0),
            DataType::S8 => Some(i8::MIN as i64),
            DataType::S16 => Some(i16::MIN as i64),
            DataType::S32 => Some(i32::MIN as i64),
            DataType::S64 => Some(i64::MIN),
            _ => None,
        }
    }

    /// Largest representable value of an integer type.
    pub fn int_max(self) -> Option<i64> {
        match self {
            DataType::U8 => Some(u8::MAX as i64),
            DataType::S8 => Some(i8::MAX as i64),
            DataType::U16 => Some(u16::MAX as i64),
            DataType::S16 => Some(i16::MAX as i64),
            DataType::U32 => Some(u32::MAX as i64),
            DataType::S32 => Some(i32::MAX as i64),
            DataType::S64 => Some(i64::MAX),
            _ => None,
        }
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DataType::Bool => "bool",
            DataType::U8 => "u8",
            DataType::S8 => "s8",
            DataType::U16 => "u16",
            DataType::S16 => "s16",
            DataType::F16 => "f16",
            DataType::Bf16 => "bf16",
            DataType::U32 => "u32",
            DataType::S32 => "s32",
            DataType::F32 => "f32",
            DataType::S64 => "s64",
            DataType::BytePtr => "byte*",
        };
        f.write_str(name)
    }
}

/// Possibly-vector type: `elems` lanes of `data_type`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Type {
    pub data_type: DataType,
    pub elems: u32,
}

impl Type {
    pub const fn new(data_type: DataType, elems: u32) -> Self {
        Self { data_type, elems }
    }

    pub const fn scalar(data_type: DataType) -> Self {
        Self::new(data_type, 1)
    }

    pub const fn s32() -> Self {
        Self::scalar(DataType::S32)
    }

    pub const fn f32() -> Self {
        Self::scalar(DataType::F32)
    }

    pub const fn bool() -> Self {
        Self::scalar(DataType::Bool)
    }

    pub const fn byte_ptr() -> Self {
        Self::scalar(DataType::BytePtr)
    }

    pub fn with_elems(self, elems: u32) -> Self {
        Self::new(self.data_type, elems)
    }

    pub fn to_scalar(self) -> Self {
        Self::scalar(self.data_type)
    }

    pub fn is_scalar(self) -> bool {
        self.elems == 1
    }

    /// Total size in bytes.
    pub fn size(self) -> u32 {
        self.data_type.size() * self.elems
    }
}

impl From<DataType> for Type {
    fn from(value: DataType) -> Self {
        Type::scalar(value)
    }
}

impl Display for Type {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.elems == 1 {
            write!(f, "{}", self.data_type)
        } else {
            write!(f, "{}x{}", self.data_type, self.elems)
        }
    }
}
