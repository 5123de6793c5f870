//! Element data types

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ShmError, ShmResult};

/// Type code, numbered with the DLPack `DLDataTypeCode` values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataTypeCode {
    /// Signed integer
    Int = 0,
    /// Unsigned integer
    UInt = 1,
    /// IEEE floating point
    Float = 2,
    /// Opaque handle
    OpaqueHandle = 3,
    /// Brain floating point
    Bfloat = 4,
    /// Complex number (pair of floats)
    Complex = 5,
    /// Boolean
    Bool = 6,
}

impl DataTypeCode {
    /// Parse a DLPack type code
    pub fn from_code(code: u8) -> ShmResult<Self> {
        Ok(match code {
            0 => DataTypeCode::Int,
            1 => DataTypeCode::UInt,
            2 => DataTypeCode::Float,
            3 => DataTypeCode::OpaqueHandle,
            4 => DataTypeCode::Bfloat,
            5 => DataTypeCode::Complex,
            6 => DataTypeCode::Bool,
            other => {
                return Err(ShmError::InvalidDescriptor(format!(
                    "unknown dtype code {other}"
                )))
            }
        })
    }
}

/// Element data type: code, bit width and vector lanes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataType {
    /// Type code
    pub code: DataTypeCode,
    /// Bits per lane
    pub bits: u8,
    /// Vector lanes (1 for scalars)
    pub lanes: u16,
}

impl DataType {
    /// `bool`
    pub const BOOL: DataType = DataType::scalar(DataTypeCode::Bool, 8);
    /// `int8`
    pub const INT8: DataType = DataType::scalar(DataTypeCode::Int, 8);
    /// `int16`
    pub const INT16: DataType = DataType::scalar(DataTypeCode::Int, 16);
    /// `int32`
    pub const INT32: DataType = DataType::scalar(DataTypeCode::Int, 32);
    /// `int64`
    pub const INT64: DataType = DataType::scalar(DataTypeCode::Int, 64);
    /// `uint8`
    pub const UINT8: DataType = DataType::scalar(DataTypeCode::UInt, 8);
    /// `uint16`
    pub const UINT16: DataType = DataType::scalar(DataTypeCode::UInt, 16);
    /// `uint32`
    pub const UINT32: DataType = DataType::scalar(DataTypeCode::UInt, 32);
    /// `uint64`
    pub const UINT64: DataType = DataType::scalar(DataTypeCode::UInt, 64);
    /// `float16`
    pub const FLOAT16: DataType = DataType::scalar(DataTypeCode::Float, 16);
    /// `bfloat16`
    pub const BFLOAT16: DataType = DataType::scalar(DataTypeCode::Bfloat, 16);
    /// `float32`
    pub const FLOAT32: DataType = DataType::scalar(DataTypeCode::Float, 32);
    /// `float64`
    pub const FLOAT64: DataType = DataType::scalar(DataTypeCode::Float, 64);

    /// Single-lane data type
    pub const fn scalar(code: DataTypeCode, bits: u8) -> Self {
        Self {
            code,
            bits,
            lanes: 1,
        }
    }

    /// Validate a descriptor-supplied data type
    pub fn new(code: DataTypeCode, bits: u8, lanes: u16) -> ShmResult<Self> {
        if bits == 0 || lanes == 0 {
            return Err(ShmError::InvalidDescriptor(format!(
                "dtype with {bits} bits and {lanes} lanes"
            )));
        }
        Ok(Self { code, bits, lanes })
    }

    /// Bytes occupied by one element
    pub fn size_bytes(&self) -> usize {
        (usize::from(self.bits) * usize::from(self.lanes)).div_ceil(8)
    }

    /// Parse names such as `float32`, `int64`, `uint8`, `bool`
    pub fn parse(name: &str) -> ShmResult<Self> {
        Ok(match name.to_ascii_lowercase().as_str() {
            "bool" => Self::BOOL,
            "int8" | "i8" => Self::INT8,
            "int16" | "i16" => Self::INT16,
            "int32" | "i32" => Self::INT32,
            "int64" | "i64" => Self::INT64,
            "uint8" | "u8" => Self::UINT8,
            "uint16" | "u16" => Self::UINT16,
            "uint32" | "u32" => Self::UINT32,
            "uint64" | "u64" => Self::UINT64,
            "float16" | "f16" => Self::FLOAT16,
            "bfloat16" | "bf16" => Self::BFLOAT16,
            "float32" | "f32" => Self::FLOAT32,
            "float64" | "f64" => Self::FLOAT64,
            other => {
                return Err(ShmError::InvalidDescriptor(format!("unknown dtype {other:?}")))
            }
        })
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.code {
            DataTypeCode::Int => "int",
            DataTypeCode::UInt => "uint",
            DataTypeCode::Float => "float",
            DataTypeCode::OpaqueHandle => "handle",
            DataTypeCode::Bfloat => "bfloat",
            DataTypeCode::Complex => "complex",
            DataTypeCode::Bool => return write_lanes(f, "bool", self.lanes),
        };
        write_lanes(f, &format!("{prefix}{}", self.bits), self.lanes)
    }
}

fn write_lanes(f: &mut fmt::Formatter<'_>, base: &str, lanes: u16) -> fmt::Result {
    if lanes == 1 {
        f.write_str(base)
    } else {
        write!(f, "{base}x{lanes}")
    }
}

/// Rust scalar types with a fixed [`DataType`], usable for typed tensor access
pub trait Element: bytemuck::Pod {
    /// Matching data type
    const DTYPE: DataType;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:expr),* $(,)?) => {
        $(
            impl Element for $ty {
                const DTYPE: DataType = $dtype;
            }
        )*
    };
}

impl_element! {
    i8 => DataType::INT8,
    i16 => DataType::INT16,
    i32 => DataType::INT32,
    i64 => DataType::INT64,
    u8 => DataType::UINT8,
    u16 => DataType::UINT16,
    u32 => DataType::UINT32,
    u64 => DataType::UINT64,
    f32 => DataType::FLOAT32,
    f64 => DataType::FLOAT64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_bytes() {
        assert_eq!(DataType::BOOL.size_bytes(), 1);
        assert_eq!(DataType::FLOAT16.size_bytes(), 2);
        assert_eq!(DataType::INT64.size_bytes(), 8);
        let vec4 = DataType::new(DataTypeCode::Float, 32, 4).unwrap();
        assert_eq!(vec4.size_bytes(), 16);
    }

    #[test]
    fn test_invalid_dtype() {
        assert!(DataType::new(DataTypeCode::Float, 0, 1).is_err());
        assert!(DataType::new(DataTypeCode::Float, 32, 0).is_err());
        assert!(DataTypeCode::from_code(42).is_err());
    }

    #[test]
    fn test_parse_and_display() {
        for name in ["bool", "int8", "int64", "uint32", "float32", "bfloat16"] {
            assert_eq!(DataType::parse(name).unwrap().to_string(), name);
        }
        assert_eq!(DataType::parse("f64").unwrap(), DataType::FLOAT64);
        assert!(DataType::parse("float128").is_err());
    }

    #[test]
    fn test_element_dtypes() {
        assert_eq!(<f32 as Element>::DTYPE, DataType::FLOAT32);
        assert_eq!(<i64 as Element>::DTYPE, DataType::INT64);
        assert_eq!(<u8 as Element>::DTYPE, DataType::UINT8);
    }
}
