//! Composite type specs: structs, fixed arrays, and guest slices.

use crate::errors::BridgeError;

use super::{
    align_address, fixed_bytes, narrow_ptr, SpecValue, TypeSpec, WORD_SIZE,
};

/// One named struct field.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub spec: TypeSpec,
}

impl Field {
    #[must_use]
    pub fn new(name: impl Into<String>, spec: TypeSpec) -> Self {
        Field {
            name: name.into(),
            spec,
        }
    }
}

/// Ordered-field record. Alignment follows the first field, per the
/// guest ABI; each later field's alignment gap is absorbed into the
/// preceding field's effective padding.
#[derive(Debug, Clone, PartialEq)]
pub struct StructSpec {
    pub name: String,
    pub fields: Vec<Field>,
}

impl StructSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, fields: Vec<Field>) -> Self {
        StructSpec {
            name: name.into(),
            fields,
        }
    }

    #[must_use]
    pub fn alignment(&self) -> u32 {
        self.fields
            .first()
            .map(|field| field.spec.alignment())
            .unwrap_or(1)
    }

    #[must_use]
    pub fn size(&self) -> u32 {
        let mut offset = 0;
        for field in &self.fields {
            offset = align_address(offset, field.spec.alignment());
            offset += field.spec.stride();
        }
        offset
    }

    pub(super) fn decode(&self, mem: &[u8], addr: u32) -> Result<SpecValue, BridgeError> {
        let mut cursor = addr;
        let mut values = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let out = field.spec.read(mem, cursor)?;
            cursor = out.end_offset;
            values.push((field.name.clone(), out.value));
        }
        Ok(SpecValue::Struct(values))
    }

    pub(super) fn encode(
        &self,
        mem: &mut [u8],
        addr: u32,
        value: &SpecValue,
    ) -> Result<(), BridgeError> {
        let SpecValue::Struct(values) = value else {
            return Err(BridgeError {
                message: format!("expected struct value for {}, found {value:?}", self.name),
            });
        };
        if values.len() != self.fields.len() {
            return Err(BridgeError {
                message: format!(
                    "struct {} has {} field(s) but the value carries {}",
                    self.name,
                    self.fields.len(),
                    values.len()
                ),
            });
        }
        let mut cursor = addr;
        for (field, (_, field_value)) in self.fields.iter().zip(values) {
            let placed = field.spec.write(mem, cursor, field_value)?;
            cursor = placed.end_offset;
        }
        Ok(())
    }
}

/// Fixed-length homogeneous sequence laid out inline.
#[derive(Debug, Clone, PartialEq)]
pub struct ArraySpec {
    pub item: Box<TypeSpec>,
    pub len: u32,
}

impl ArraySpec {
    #[must_use]
    pub fn new(item: TypeSpec, len: u32) -> Self {
        ArraySpec {
            item: Box::new(item),
            len,
        }
    }

    #[must_use]
    pub fn size(&self) -> u32 {
        self.len * self.item.stride()
    }

    pub(super) fn decode(&self, mem: &[u8], addr: u32) -> Result<SpecValue, BridgeError> {
        let mut cursor = addr;
        let mut items = Vec::with_capacity(self.len as usize);
        for _ in 0..self.len {
            let out = self.item.read(mem, cursor)?;
            cursor = out.end_offset;
            items.push(out.value);
        }
        Ok(SpecValue::Seq(items))
    }

    pub(super) fn encode(
        &self,
        mem: &mut [u8],
        addr: u32,
        value: &SpecValue,
    ) -> Result<(), BridgeError> {
        let items = value.as_seq()?;
        if items.len() != self.len as usize {
            return Err(BridgeError {
                message: format!(
                    "array of length {} cannot encode {} item(s)",
                    self.len,
                    items.len()
                ),
            });
        }
        let mut cursor = addr;
        for item in items {
            let placed = self.item.write(mem, cursor, item)?;
            cursor = placed.end_offset;
        }
        Ok(())
    }
}

/// Decoded guest slice header: `{data_ptr, len, cap}`, one word each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceHeader {
    pub data_ptr: u64,
    pub len: u32,
    pub cap: u32,
}

/// Variable-length sequence behind a three-word header.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceSpec {
    pub item: Box<TypeSpec>,
}

impl SliceSpec {
    #[must_use]
    pub fn new(item: TypeSpec) -> Self {
        SliceSpec {
            item: Box::new(item),
        }
    }

    /// Decode and validate the header words. A null data pointer with a
    /// non-zero length signals a corrupted header and faults rather than
    /// dereferencing unmapped memory.
    pub fn header(&self, mem: &[u8], addr: u32) -> Result<SliceHeader, BridgeError> {
        let spec = TypeSpec::Slice(self.clone());
        let mut buf = [0u8; 8];
        buf.copy_from_slice(fixed_bytes(mem, addr, 8, &spec)?);
        let data_ptr = u64::from_le_bytes(buf);
        buf.copy_from_slice(fixed_bytes(mem, addr + WORD_SIZE, 8, &spec)?);
        let len = i64::from_le_bytes(buf);
        buf.copy_from_slice(fixed_bytes(mem, addr + WORD_SIZE * 2, 8, &spec)?);
        let cap = i64::from_le_bytes(buf);
        if len < 0 || cap < 0 {
            return Err(BridgeError {
                message: format!(
                    "slice header at 0x{addr:08X} carries negative length or capacity \
                     (len={len} cap={cap})"
                ),
            });
        }
        if data_ptr == 0 && len > 0 {
            return Err(BridgeError {
                message: format!(
                    "slice header at 0x{addr:08X} has null data pointer with length {len}"
                ),
            });
        }
        let len = u32::try_from(len).map_err(|_| BridgeError {
            message: format!("slice length {len} exceeds the wasm32 addressable range"),
        })?;
        let cap = u32::try_from(cap).unwrap_or(u32::MAX);
        Ok(SliceHeader { data_ptr, len, cap })
    }

    pub(super) fn decode(&self, mem: &[u8], addr: u32) -> Result<SpecValue, BridgeError> {
        let header = self.header(mem, addr)?;
        if header.len == 0 {
            return Ok(SpecValue::Seq(Vec::new()));
        }
        let mut cursor = narrow_ptr(header.data_ptr, "slice data pointer")?;
        let mut items = Vec::with_capacity(header.len as usize);
        for _ in 0..header.len {
            let out = self.item.read(mem, cursor)?;
            cursor = out.end_offset;
            items.push(out.value);
        }
        Ok(SpecValue::Seq(items))
    }

    /// Encode element-wise through an existing header. The guest owns
    /// allocation: the header's data pointer and length must already
    /// describe the destination.
    pub(super) fn encode(
        &self,
        mem: &mut [u8],
        addr: u32,
        value: &SpecValue,
    ) -> Result<(), BridgeError> {
        let items = value.as_seq()?;
        let header = self.header(mem, addr)?;
        if items.len() != header.len as usize {
            return Err(BridgeError {
                message: format!(
                    "slice header at 0x{addr:08X} describes {} item(s) but the value \
                     carries {}",
                    header.len,
                    items.len()
                ),
            });
        }
        if header.len == 0 {
            return Ok(());
        }
        let mut cursor = narrow_ptr(header.data_ptr, "slice data pointer")?;
        for item in items {
            let placed = self.item.write(mem, cursor, item)?;
            cursor = placed.end_offset;
        }
        Ok(())
    }
}
