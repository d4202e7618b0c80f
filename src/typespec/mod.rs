//! Type specifications for guest ABI values.
//!
//! A [`TypeSpec`] describes how one guest value type is sized, aligned,
//! decoded, and encoded against a raw linear-memory buffer. Base specs
//! wrap fixed-width little-endian encodings; composites (struct, array,
//! slice) delegate per element to child specs. The variants form a closed
//! set: the guest compiler's ABI is not user-extensible and neither is
//! this codec.

use crate::errors::BridgeError;

mod composite;

pub use composite::{ArraySpec, Field, SliceHeader, SliceSpec, StructSpec};

/// Width in bytes of one guest ABI word. The guest targets a 64-bit word
/// layout even on wasm32: pointers, lengths, and capacities all occupy
/// eight bytes.
pub const WORD_SIZE: u32 = 8;

/// Align `addr` up to the next multiple of `align`.
#[must_use]
pub fn align_address(addr: u32, align: u32) -> u32 {
    if align <= 1 {
        return addr;
    }
    let remainder = addr % align;
    if remainder == 0 {
        addr
    } else {
        addr + (align - remainder)
    }
}

/// Decoded form of a guest value.
#[derive(Debug, Clone, PartialEq)]
pub enum SpecValue {
    Uint(u64),
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    /// Raw 8-byte reference encoding; resolution against the reference
    /// table happens one layer up.
    RefBits(u64),
    Seq(Vec<SpecValue>),
    Struct(Vec<(String, SpecValue)>),
}

impl SpecValue {
    pub fn as_uint(&self) -> Result<u64, BridgeError> {
        match self {
            SpecValue::Uint(v) => Ok(*v),
            other => Err(BridgeError {
                message: format!("expected unsigned integer value, found {other:?}"),
            }),
        }
    }

    pub fn as_int(&self) -> Result<i64, BridgeError> {
        match self {
            SpecValue::Int(v) => Ok(*v),
            other => Err(BridgeError {
                message: format!("expected signed integer value, found {other:?}"),
            }),
        }
    }

    pub fn as_float(&self) -> Result<f64, BridgeError> {
        match self {
            SpecValue::Float(v) => Ok(*v),
            other => Err(BridgeError {
                message: format!("expected float value, found {other:?}"),
            }),
        }
    }

    pub fn as_bool(&self) -> Result<bool, BridgeError> {
        match self {
            SpecValue::Bool(v) => Ok(*v),
            other => Err(BridgeError {
                message: format!("expected boolean value, found {other:?}"),
            }),
        }
    }

    pub fn as_str(&self) -> Result<&str, BridgeError> {
        match self {
            SpecValue::Str(v) => Ok(v),
            other => Err(BridgeError {
                message: format!("expected string value, found {other:?}"),
            }),
        }
    }

    pub fn as_seq(&self) -> Result<&[SpecValue], BridgeError> {
        match self {
            SpecValue::Seq(items) => Ok(items),
            other => Err(BridgeError {
                message: format!("expected sequence value, found {other:?}"),
            }),
        }
    }

    pub fn as_ref_bits(&self) -> Result<u64, BridgeError> {
        match self {
            SpecValue::RefBits(bits) => Ok(*bits),
            other => Err(BridgeError {
                message: format!("expected reference value, found {other:?}"),
            }),
        }
    }
}

/// Result of an aligned read: the decoded value, the address it was
/// decoded at, and the first offset past the value and its padding.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadValue {
    pub value: SpecValue,
    pub address: u32,
    pub end_offset: u32,
}

/// Result of an aligned write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placed {
    pub address: u32,
    pub end_offset: u32,
}

/// Descriptor for one guest value type.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeSpec {
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Bool,
    Uintptr,
    String,
    Ref,
    Struct(StructSpec),
    Array(ArraySpec),
    Slice(SliceSpec),
}

impl TypeSpec {
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            TypeSpec::Uint8 => "uint8".into(),
            TypeSpec::Uint16 => "uint16".into(),
            TypeSpec::Uint32 => "uint32".into(),
            TypeSpec::Uint64 => "uint64".into(),
            TypeSpec::Int8 => "int8".into(),
            TypeSpec::Int16 => "int16".into(),
            TypeSpec::Int32 => "int32".into(),
            TypeSpec::Int64 => "int64".into(),
            TypeSpec::Float32 => "float32".into(),
            TypeSpec::Float64 => "float64".into(),
            TypeSpec::Bool => "bool".into(),
            TypeSpec::Uintptr => "uintptr".into(),
            TypeSpec::String => "string".into(),
            TypeSpec::Ref => "ref".into(),
            TypeSpec::Struct(spec) => spec.name.clone(),
            TypeSpec::Array(spec) => format!("[{}]{}", spec.len, spec.item.name()),
            TypeSpec::Slice(spec) => format!("[]{}", spec.item.name()),
        }
    }

    #[must_use]
    pub fn size(&self) -> u32 {
        match self {
            TypeSpec::Uint8 | TypeSpec::Int8 | TypeSpec::Bool => 1,
            TypeSpec::Uint16 | TypeSpec::Int16 => 2,
            TypeSpec::Uint32 | TypeSpec::Int32 | TypeSpec::Float32 => 4,
            TypeSpec::Uint64
            | TypeSpec::Int64
            | TypeSpec::Float64
            | TypeSpec::Uintptr
            | TypeSpec::Ref => WORD_SIZE,
            TypeSpec::String => WORD_SIZE * 2,
            TypeSpec::Slice(_) => WORD_SIZE * 3,
            TypeSpec::Struct(spec) => spec.size(),
            TypeSpec::Array(spec) => spec.size(),
        }
    }

    /// Container alignment follows the first (or only) member, per the
    /// guest ABI. Taking the max over fields instead would mis-align
    /// structs whose first field is narrower than a later one.
    #[must_use]
    pub fn alignment(&self) -> u32 {
        match self {
            TypeSpec::Uint8 | TypeSpec::Int8 | TypeSpec::Bool => 1,
            TypeSpec::Uint16 | TypeSpec::Int16 => 2,
            TypeSpec::Uint32 | TypeSpec::Int32 | TypeSpec::Float32 => 4,
            TypeSpec::Uint64
            | TypeSpec::Int64
            | TypeSpec::Float64
            | TypeSpec::Uintptr
            | TypeSpec::Ref
            | TypeSpec::String
            | TypeSpec::Slice(_) => WORD_SIZE,
            TypeSpec::Struct(spec) => spec.alignment(),
            TypeSpec::Array(spec) => spec.item.alignment(),
        }
    }

    #[must_use]
    pub fn padding_after(&self) -> u32 {
        0
    }

    /// Bytes one element occupies inside a homogeneous sequence.
    #[must_use]
    pub fn stride(&self) -> u32 {
        self.size() + self.padding_after()
    }

    /// Decode the value at `addr`, which the caller has already aligned.
    pub fn decode(&self, mem: &[u8], addr: u32) -> Result<SpecValue, BridgeError> {
        match self {
            TypeSpec::Uint8 => Ok(SpecValue::Uint(u64::from(read_byte(mem, addr, self)?))),
            TypeSpec::Uint16 => {
                let bytes = fixed_bytes(mem, addr, 2, self)?;
                Ok(SpecValue::Uint(u64::from(u16::from_le_bytes([
                    bytes[0], bytes[1],
                ]))))
            }
            TypeSpec::Uint32 => {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(fixed_bytes(mem, addr, 4, self)?);
                Ok(SpecValue::Uint(u64::from(u32::from_le_bytes(buf))))
            }
            TypeSpec::Uint64 | TypeSpec::Uintptr => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(fixed_bytes(mem, addr, 8, self)?);
                Ok(SpecValue::Uint(u64::from_le_bytes(buf)))
            }
            TypeSpec::Int8 => Ok(SpecValue::Int(i64::from(
                read_byte(mem, addr, self)? as i8,
            ))),
            TypeSpec::Int16 => {
                let bytes = fixed_bytes(mem, addr, 2, self)?;
                Ok(SpecValue::Int(i64::from(i16::from_le_bytes([
                    bytes[0], bytes[1],
                ]))))
            }
            TypeSpec::Int32 => {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(fixed_bytes(mem, addr, 4, self)?);
                Ok(SpecValue::Int(i64::from(i32::from_le_bytes(buf))))
            }
            TypeSpec::Int64 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(fixed_bytes(mem, addr, 8, self)?);
                Ok(SpecValue::Int(i64::from_le_bytes(buf)))
            }
            TypeSpec::Float32 => {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(fixed_bytes(mem, addr, 4, self)?);
                Ok(SpecValue::Float(f64::from(f32::from_le_bytes(buf))))
            }
            TypeSpec::Float64 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(fixed_bytes(mem, addr, 8, self)?);
                Ok(SpecValue::Float(f64::from_le_bytes(buf)))
            }
            TypeSpec::Bool => Ok(SpecValue::Bool(read_byte(mem, addr, self)? != 0)),
            TypeSpec::Ref => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(fixed_bytes(mem, addr, 8, self)?);
                Ok(SpecValue::RefBits(u64::from_le_bytes(buf)))
            }
            TypeSpec::String => decode_string(mem, addr),
            TypeSpec::Struct(spec) => spec.decode(mem, addr),
            TypeSpec::Array(spec) => spec.decode(mem, addr),
            TypeSpec::Slice(spec) => spec.decode(mem, addr),
        }
    }

    /// Encode `value` at `addr`, which the caller has already aligned.
    pub fn encode(&self, mem: &mut [u8], addr: u32, value: &SpecValue) -> Result<(), BridgeError> {
        match self {
            TypeSpec::Uint8 => {
                let v = bounded_uint(value.as_uint()?, u64::from(u8::MAX), self)?;
                write_fixed(mem, addr, &[v as u8], self)
            }
            TypeSpec::Uint16 => {
                let v = bounded_uint(value.as_uint()?, u64::from(u16::MAX), self)?;
                write_fixed(mem, addr, &(v as u16).to_le_bytes(), self)
            }
            TypeSpec::Uint32 => {
                let v = bounded_uint(value.as_uint()?, u64::from(u32::MAX), self)?;
                write_fixed(mem, addr, &(v as u32).to_le_bytes(), self)
            }
            TypeSpec::Uint64 | TypeSpec::Uintptr => {
                write_fixed(mem, addr, &value.as_uint()?.to_le_bytes(), self)
            }
            TypeSpec::Int8 => {
                let v = bounded_int(value.as_int()?, i64::from(i8::MIN), i64::from(i8::MAX), self)?;
                write_fixed(mem, addr, &(v as i8).to_le_bytes(), self)
            }
            TypeSpec::Int16 => {
                let v =
                    bounded_int(value.as_int()?, i64::from(i16::MIN), i64::from(i16::MAX), self)?;
                write_fixed(mem, addr, &(v as i16).to_le_bytes(), self)
            }
            TypeSpec::Int32 => {
                let v =
                    bounded_int(value.as_int()?, i64::from(i32::MIN), i64::from(i32::MAX), self)?;
                write_fixed(mem, addr, &(v as i32).to_le_bytes(), self)
            }
            TypeSpec::Int64 => write_fixed(mem, addr, &value.as_int()?.to_le_bytes(), self),
            TypeSpec::Float32 => {
                write_fixed(mem, addr, &(value.as_float()? as f32).to_le_bytes(), self)
            }
            TypeSpec::Float64 => write_fixed(mem, addr, &value.as_float()?.to_le_bytes(), self),
            TypeSpec::Bool => write_fixed(mem, addr, &[u8::from(value.as_bool()?)], self),
            TypeSpec::Ref => write_fixed(mem, addr, &value.as_ref_bits()?.to_le_bytes(), self),
            TypeSpec::String => Err(BridgeError {
                message: "string values cross the boundary through the reference table, \
                          not by encoding into guest memory"
                    .into(),
            }),
            TypeSpec::Struct(spec) => spec.encode(mem, addr, value),
            TypeSpec::Array(spec) => spec.encode(mem, addr, value),
            TypeSpec::Slice(spec) => spec.encode(mem, addr, value),
        }
    }

    /// Align, decode, and report the end offset past value and padding.
    pub fn read(&self, mem: &[u8], addr: u32) -> Result<ReadValue, BridgeError> {
        let address = align_address(addr, self.alignment());
        let value = self.decode(mem, address)?;
        Ok(ReadValue {
            value,
            address,
            end_offset: address + self.size() + self.padding_after(),
        })
    }

    /// Align, encode, and report the end offset past value and padding.
    pub fn write(&self, mem: &mut [u8], addr: u32, value: &SpecValue) -> Result<Placed, BridgeError> {
        let address = align_address(addr, self.alignment());
        self.encode(mem, address, value)?;
        Ok(Placed {
            address,
            end_offset: address + self.size() + self.padding_after(),
        })
    }
}

fn decode_string(mem: &[u8], addr: u32) -> Result<SpecValue, BridgeError> {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(fixed_bytes(mem, addr, 8, &TypeSpec::String)?);
    let data_ptr = u64::from_le_bytes(buf);
    buf.copy_from_slice(fixed_bytes(mem, addr + WORD_SIZE, 8, &TypeSpec::String)?);
    let len = i64::from_le_bytes(buf);
    if len < 0 {
        return Err(BridgeError {
            message: format!("string header at 0x{addr:08X} carries negative length {len}"),
        });
    }
    if len == 0 {
        return Ok(SpecValue::Str(String::new()));
    }
    if data_ptr == 0 {
        return Err(BridgeError {
            message: format!(
                "string header at 0x{addr:08X} has null data pointer with length {len}"
            ),
        });
    }
    let data_addr = narrow_ptr(data_ptr, "string data pointer")?;
    let len = u32::try_from(len).map_err(|_| BridgeError {
        message: format!("string length {len} exceeds the wasm32 addressable range"),
    })?;
    let bytes = range_bytes(mem, data_addr, len, "string data")?;
    let text = std::str::from_utf8(bytes).map_err(|err| BridgeError {
        message: format!("string data at 0x{data_addr:08X} is not valid UTF-8: {err}"),
    })?;
    Ok(SpecValue::Str(text.to_string()))
}

pub(crate) fn narrow_ptr(value: u64, what: &str) -> Result<u32, BridgeError> {
    u32::try_from(value).map_err(|_| BridgeError {
        message: format!("{what} 0x{value:016X} exceeds the wasm32 addressable range"),
    })
}

pub(crate) fn fixed_bytes<'m>(
    mem: &'m [u8],
    addr: u32,
    width: u32,
    spec: &TypeSpec,
) -> Result<&'m [u8], BridgeError> {
    let start = addr as usize;
    let end = start + width as usize;
    if end > mem.len() {
        return Err(BridgeError {
            message: format!(
                "{} read of {width} byte(s) at 0x{addr:08X} exceeds linear memory bounds",
                spec.name()
            ),
        });
    }
    Ok(&mem[start..end])
}

pub(crate) fn range_bytes<'m>(
    mem: &'m [u8],
    addr: u32,
    len: u32,
    what: &str,
) -> Result<&'m [u8], BridgeError> {
    let start = addr as usize;
    let end = start + len as usize;
    if end > mem.len() {
        return Err(BridgeError {
            message: format!(
                "{what} of {len} byte(s) at 0x{addr:08X} exceeds linear memory bounds"
            ),
        });
    }
    Ok(&mem[start..end])
}

fn read_byte(mem: &[u8], addr: u32, spec: &TypeSpec) -> Result<u8, BridgeError> {
    Ok(fixed_bytes(mem, addr, 1, spec)?[0])
}

fn write_fixed(
    mem: &mut [u8],
    addr: u32,
    bytes: &[u8],
    spec: &TypeSpec,
) -> Result<(), BridgeError> {
    let start = addr as usize;
    let end = start + bytes.len();
    if end > mem.len() {
        return Err(BridgeError {
            message: format!(
                "{} write of {} byte(s) at 0x{addr:08X} exceeds linear memory bounds",
                spec.name(),
                bytes.len()
            ),
        });
    }
    mem[start..end].copy_from_slice(bytes);
    Ok(())
}

fn bounded_uint(value: u64, max: u64, spec: &TypeSpec) -> Result<u64, BridgeError> {
    if value > max {
        return Err(BridgeError {
            message: format!("value {value} out of range for {}", spec.name()),
        });
    }
    Ok(value)
}

fn bounded_int(value: i64, min: i64, max: i64, spec: &TypeSpec) -> Result<i64, BridgeError> {
    if value < min || value > max {
        return Err(BridgeError {
            message: format!("value {value} out of range for {}", spec.name()),
        });
    }
    Ok(value)
}
