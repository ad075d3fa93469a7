//! Typed value conversion contract
//!
//! Devices delegate turning raw register bytes into typed values to a
//! [`ValueConverter`]. The converter also reports whether the value differs
//! from the previously known one so pollers can publish on change only.

use serde::{Deserialize, Serialize};

use crate::error::{LinkError, LinkResult};

/// Data type of a polled point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Bool,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    String,
}

impl DataType {
    /// Width in bytes of one element, `None` for variable-length types
    pub fn byte_len(self) -> Option<usize> {
        match self {
            DataType::Bool => Some(1),
            DataType::Int16 | DataType::UInt16 => Some(2),
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => Some(4),
            DataType::Int64 | DataType::UInt64 | DataType::Float64 => Some(8),
            DataType::String => None,
        }
    }
}

/// Typed value produced by a converter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
}

/// Conversion outcome
#[derive(Debug, Clone, PartialEq)]
pub struct Converted {
    pub value: Value,
    /// True when there was no previous value or it differs from `value`
    pub changed: bool,
}

/// Converts raw bytes into typed values
pub trait ValueConverter: Send + Sync {
    fn convert(
        &self,
        raw: &[u8],
        address: &str,
        data_type: DataType,
        array_len: usize,
        previous: Option<&Value>,
    ) -> LinkResult<Converted>;
}

/// Big-endian converter addressing by byte offset
///
/// Addresses are `"<byte>"` or, for booleans, `"<byte>.<bit>"`. An empty
/// address means offset zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct BigEndianConverter;

impl BigEndianConverter {
    fn parse_address(address: &str) -> LinkResult<(usize, Option<u8>)> {
        let address = address.trim();
        if address.is_empty() {
            return Ok((0, None));
        }
        let invalid = || LinkError::Protocol(format!("Invalid address: {}", address));
        match address.split_once('.') {
            Some((byte, bit)) => {
                let byte = byte.parse::<usize>().map_err(|_| invalid())?;
                let bit = bit.parse::<u8>().map_err(|_| invalid())?;
                if bit > 7 {
                    return Err(invalid());
                }
                Ok((byte, Some(bit)))
            }
            None => Ok((address.parse::<usize>().map_err(|_| invalid())?, None)),
        }
    }

    fn element(data_type: DataType, bytes: &[u8], bit: Option<u8>) -> Value {
        fn arr<const N: usize>(bytes: &[u8]) -> [u8; N] {
            let mut out = [0u8; N];
            out.copy_from_slice(&bytes[..N]);
            out
        }
        match data_type {
            DataType::Bool => match bit {
                Some(bit) => Value::Bool(bytes[0] & (1 << bit) != 0),
                None => Value::Bool(bytes[0] != 0),
            },
            DataType::Int16 => Value::Int(i16::from_be_bytes(arr(bytes)) as i64),
            DataType::UInt16 => Value::UInt(u16::from_be_bytes(arr(bytes)) as u64),
            DataType::Int32 => Value::Int(i32::from_be_bytes(arr(bytes)) as i64),
            DataType::UInt32 => Value::UInt(u32::from_be_bytes(arr(bytes)) as u64),
            DataType::Int64 => Value::Int(i64::from_be_bytes(arr(bytes))),
            DataType::UInt64 => Value::UInt(u64::from_be_bytes(arr(bytes))),
            DataType::Float32 => Value::Float(f32::from_be_bytes(arr(bytes)) as f64),
            DataType::Float64 => Value::Float(f64::from_be_bytes(arr(bytes))),
            DataType::String => {
                Value::String(String::from_utf8_lossy(bytes).trim_end_matches('\0').to_string())
            }
        }
    }
}

impl ValueConverter for BigEndianConverter {
    fn convert(
        &self,
        raw: &[u8],
        address: &str,
        data_type: DataType,
        array_len: usize,
        previous: Option<&Value>,
    ) -> LinkResult<Converted> {
        let (offset, bit) = Self::parse_address(address)?;
        let data = raw.get(offset..).ok_or_else(|| {
            LinkError::Protocol(format!(
                "Address {} out of range for {} bytes",
                address,
                raw.len()
            ))
        })?;

        let value = match data_type.byte_len() {
            None => {
                let len = if array_len == 0 {
                    data.len()
                } else {
                    array_len.min(data.len())
                };
                Self::element(data_type, &data[..len], None)
            }
            Some(width) => {
                let count = array_len.max(1);
                let needed = width.checked_mul(count).ok_or_else(|| {
                    LinkError::Protocol(format!("Array length {} too large for {:?}", count, data_type))
                })?;
                if data.len() < needed {
                    return Err(LinkError::Protocol(format!(
                        "Need {} bytes for {:?}[{}], got {}",
                        needed,
                        data_type,
                        count,
                        data.len()
                    )));
                }
                if count == 1 {
                    Self::element(data_type, data, bit)
                } else {
                    Value::Array(
                        data.chunks_exact(width)
                            .take(count)
                            .map(|chunk| Self::element(data_type, chunk, None))
                            .collect(),
                    )
                }
            }
        };

        let changed = previous.map_or(true, |prev| *prev != value);
        Ok(Converted { value, changed })
    }
}
