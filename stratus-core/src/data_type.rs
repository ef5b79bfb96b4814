//! Defines the primitive element types an array can hold.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt::{self, Debug};
use std::mem::size_of;

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug)]
pub enum DataType {
    // Signed integers
    I8,
    I16,
    I32,
    I64,

    // Unsigned integers
    U8,
    U16,
    U32,
    U64,

    // Floats
    F32,
    F64,
}

/// Alias for [`DataType::I8`].
pub const DTYPE_I8: DataType = DataType::I8;
/// Alias for [`DataType::I16`].
pub const DTYPE_I16: DataType = DataType::I16;
/// Alias for [`DataType::I32`].
pub const DTYPE_I32: DataType = DataType::I32;
/// Alias for [`DataType::I64`].
pub const DTYPE_I64: DataType = DataType::I64;
/// Alias for [`DataType::U8`].
pub const DTYPE_U8: DataType = DataType::U8;
/// Alias for [`DataType::U16`].
pub const DTYPE_U16: DataType = DataType::U16;
/// Alias for [`DataType::U32`].
pub const DTYPE_U32: DataType = DataType::U32;
/// Alias for [`DataType::U64`].
pub const DTYPE_U64: DataType = DataType::U64;
/// Alias for [`DataType::F32`].
pub const DTYPE_F32: DataType = DataType::F32;
/// Alias for [`DataType::F64`].
pub const DTYPE_F64: DataType = DataType::F64;

impl DataType {
    pub fn of<T: HasDataType>() -> Self {
        T::data_type()
    }

    pub fn name(&self) -> &'static str {
        use DataType::*;
        match self {
            I8 => "int8",
            I16 => "int16",
            I32 => "int32",
            I64 => "int64",
            U8 => "uint8",
            U16 => "uint16",
            U32 => "uint32",
            U64 => "uint64",
            F32 => "float32",
            F64 => "float64",
        }
    }

    /// Parse a data type from its name (for example `"float32"`).
    pub fn from_name(name: &str) -> Option<Self> {
        use DataType::*;
        [I8, I16, I32, I64, U8, U16, U32, U64, F32, F64]
            .iter()
            .copied()
            .find(|d| d.name() == name)
    }

    /// Size of this data type in bytes.
    pub fn size_in_bytes(&self) -> usize {
        use DataType::*;
        match self {
            I8 | U8 => 1,
            I16 | U16 => 2,
            I32 | U32 | F32 => 4,
            I64 | U64 | F64 => 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DataType::F32 | DataType::F64)
    }

    pub fn is_signed(&self) -> bool {
        use DataType::*;
        matches!(self, I8 | I16 | I32 | I64 | F32 | F64)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Rust types that correspond to a [`DataType`].
///
/// Elements are stored in little-endian byte order inside a [`Block`](crate::Block). The
/// arithmetic methods wrap on overflow for integers and follow IEEE semantics for floats.
pub trait HasDataType: Send + Sync + Copy + Default + Debug + PartialOrd + Any {
    fn data_type() -> DataType;

    fn from_le_slice(bytes: &[u8]) -> Self;
    fn write_le_slice(self, out: &mut [u8]);

    /// Lossy conversion from `f64`, saturating at the bounds of the type.
    fn from_f64(value: f64) -> Self;
    fn to_f64(self) -> f64;

    fn zero() -> Self;
    fn one() -> Self;
    fn lowest() -> Self;
    fn highest() -> Self;

    fn add_elem(self, other: Self) -> Self;
    fn sub_elem(self, other: Self) -> Self;
    fn mul_elem(self, other: Self) -> Self;
    fn neg_elem(self) -> Self;
    fn abs_elem(self) -> Self;
    fn max_elem(self, other: Self) -> Self;
    fn min_elem(self, other: Self) -> Self;
}

macro_rules! impl_common {
    ($typ:ty, $name:expr) => {
        fn data_type() -> DataType {
            $name
        }

        fn from_le_slice(bytes: &[u8]) -> Self {
            let mut buffer = [0u8; size_of::<$typ>()];
            buffer.copy_from_slice(&bytes[..size_of::<$typ>()]);
            <$typ>::from_le_bytes(buffer)
        }

        fn write_le_slice(self, out: &mut [u8]) {
            out[..size_of::<$typ>()].copy_from_slice(&self.to_le_bytes());
        }

        fn from_f64(value: f64) -> Self {
            value as $typ
        }

        fn to_f64(self) -> f64 {
            self as f64
        }
    };
}

macro_rules! impl_data_type {
    ($(signed $typ:ty as $name:expr),* ; $(unsigned $utyp:ty as $uname:expr),* ; $(float $ftyp:ty as $fname:expr),*) => {
        $(
            impl HasDataType for $typ {
                impl_common!($typ, $name);

                fn zero() -> Self { 0 }
                fn one() -> Self { 1 }
                fn lowest() -> Self { <$typ>::MIN }
                fn highest() -> Self { <$typ>::MAX }

                fn add_elem(self, other: Self) -> Self { self.wrapping_add(other) }
                fn sub_elem(self, other: Self) -> Self { self.wrapping_sub(other) }
                fn mul_elem(self, other: Self) -> Self { self.wrapping_mul(other) }
                fn neg_elem(self) -> Self { self.wrapping_neg() }
                fn abs_elem(self) -> Self { self.wrapping_abs() }
                fn max_elem(self, other: Self) -> Self { Ord::max(self, other) }
                fn min_elem(self, other: Self) -> Self { Ord::min(self, other) }
            }
        )*
        $(
            impl HasDataType for $utyp {
                impl_common!($utyp, $uname);

                fn zero() -> Self { 0 }
                fn one() -> Self { 1 }
                fn lowest() -> Self { <$utyp>::MIN }
                fn highest() -> Self { <$utyp>::MAX }

                fn add_elem(self, other: Self) -> Self { self.wrapping_add(other) }
                fn sub_elem(self, other: Self) -> Self { self.wrapping_sub(other) }
                fn mul_elem(self, other: Self) -> Self { self.wrapping_mul(other) }
                fn neg_elem(self) -> Self { self.wrapping_neg() }
                fn abs_elem(self) -> Self { self }
                fn max_elem(self, other: Self) -> Self { Ord::max(self, other) }
                fn min_elem(self, other: Self) -> Self { Ord::min(self, other) }
            }
        )*
        $(
            impl HasDataType for $ftyp {
                impl_common!($ftyp, $fname);

                fn zero() -> Self { 0.0 }
                fn one() -> Self { 1.0 }
                fn lowest() -> Self { <$ftyp>::NEG_INFINITY }
                fn highest() -> Self { <$ftyp>::INFINITY }

                fn add_elem(self, other: Self) -> Self { self + other }
                fn sub_elem(self, other: Self) -> Self { self - other }
                fn mul_elem(self, other: Self) -> Self { self * other }
                fn neg_elem(self) -> Self { -self }
                fn abs_elem(self) -> Self { self.abs() }
                fn max_elem(self, other: Self) -> Self { self.max(other) }
                fn min_elem(self, other: Self) -> Self { self.min(other) }
            }
        )*
    };
}

impl_data_type!(
    signed i8 as DTYPE_I8,
    signed i16 as DTYPE_I16,
    signed i32 as DTYPE_I32,
    signed i64 as DTYPE_I64;
    unsigned u8 as DTYPE_U8,
    unsigned u16 as DTYPE_U16,
    unsigned u32 as DTYPE_U32,
    unsigned u64 as DTYPE_U64;
    float f32 as DTYPE_F32,
    float f64 as DTYPE_F64
);

/// Evaluates `$body` with `$T` bound to the Rust type that corresponds to `$dtype`.
#[macro_export]
macro_rules! with_data_type {
    ($dtype:expr, $T:ident => $body:expr) => {{
        match $dtype {
            $crate::DataType::I8 => {
                type $T = i8;
                $body
            }
            $crate::DataType::I16 => {
                type $T = i16;
                $body
            }
            $crate::DataType::I32 => {
                type $T = i32;
                $body
            }
            $crate::DataType::I64 => {
                type $T = i64;
                $body
            }
            $crate::DataType::U8 => {
                type $T = u8;
                $body
            }
            $crate::DataType::U16 => {
                type $T = u16;
                $body
            }
            $crate::DataType::U32 => {
                type $T = u32;
                $body
            }
            $crate::DataType::U64 => {
                type $T = u64;
                $body
            }
            $crate::DataType::F32 => {
                type $T = f32;
                $body
            }
            $crate::DataType::F64 => {
                type $T = f64;
                $body
            }
        }
    }};
}
