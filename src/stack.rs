//! Sequential, alignment-aware cursors over one guest call frame.
//!
//! Arguments and results live on the guest stack in declared order, each
//! aligned to its own natural alignment, behind a fixed 8-byte header.
//! A reader converts into a writer exactly once; ownership of the cursor
//! enforces that no reads happen after the conversion.
//!
//! Reentrant host→guest calls may grow or relocate the guest stack.
//! `rebase` installs a freshly fetched stack pointer while preserving the
//! offset already consumed; skipping it leaves every later access on a
//! silently stale address.

use crate::errors::BridgeError;
use crate::memory::MemoryView;
use crate::refs::ReferenceTable;
use crate::typespec::{SliceSpec, SpecValue, TypeSpec, WORD_SIZE};
use crate::value::HostValue;

/// Bytes reserved at the base of every call frame, unused by the callee.
pub const FRAME_HEADER_SIZE: u32 = 8;

/// Consuming cursor over the argument area of one import call frame.
#[derive(Debug)]
pub struct StackReader {
    view: MemoryView,
    base: u32,
    consumed: u32,
    header_skipped: bool,
}

impl StackReader {
    #[must_use]
    pub fn new(view: MemoryView, stack_pointer: u32) -> Self {
        StackReader {
            view,
            base: stack_pointer,
            consumed: 0,
            header_skipped: false,
        }
    }

    #[must_use]
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Offset consumed so far, relative to the frame base.
    #[must_use]
    pub fn consumed(&self) -> u32 {
        self.consumed
    }

    /// Skip the fixed frame header. Called exactly once per frame;
    /// a second call is a programming-error fault.
    pub fn skip_header(&mut self) -> Result<(), BridgeError> {
        if self.header_skipped {
            return Err(BridgeError {
                message: "frame header already skipped for this call".into(),
            });
        }
        self.header_skipped = true;
        self.consumed = FRAME_HEADER_SIZE;
        Ok(())
    }

    fn require_header(&self, action: &str) -> Result<(), BridgeError> {
        if !self.header_skipped {
            return Err(BridgeError {
                message: format!("{action} before the frame header was skipped"),
            });
        }
        Ok(())
    }

    /// Re-derive the working address from a freshly fetched stack
    /// pointer, preserving the consumed offset.
    pub fn rebase(&mut self, fresh_stack_pointer: u32) {
        self.base = fresh_stack_pointer;
    }

    /// Consume the next argument: align, decode, advance.
    pub fn next(&mut self, spec: &TypeSpec) -> Result<SpecValue, BridgeError> {
        self.require_header("argument read")?;
        let out = self.view.read(spec, self.base + self.consumed)?;
        self.consumed = out.end_offset - self.base;
        Ok(out.value)
    }

    /// Consume one encoded reference and resolve it.
    pub fn next_ref(&mut self, refs: &ReferenceTable) -> Result<HostValue, BridgeError> {
        let bits = self.next(&TypeSpec::Ref)?.as_ref_bits()?;
        refs.decode(bits)
    }

    /// Consume a slice argument, decoding every element.
    pub fn next_slice(&mut self, item: TypeSpec) -> Result<Vec<SpecValue>, BridgeError> {
        let value = self.next(&TypeSpec::Slice(SliceSpec::new(item)))?;
        Ok(match value {
            SpecValue::Seq(items) => items,
            other => {
                return Err(BridgeError {
                    message: format!("slice argument decoded to {other:?}"),
                })
            }
        })
    }

    /// Consume a slice of encoded references, resolving each element.
    pub fn next_ref_slice(
        &mut self,
        refs: &ReferenceTable,
    ) -> Result<Vec<HostValue>, BridgeError> {
        let items = self.next_slice(TypeSpec::Ref)?;
        let mut values = Vec::with_capacity(items.len());
        for item in items {
            values.push(refs.decode(item.as_ref_bits()?)?);
        }
        Ok(values)
    }

    /// Consume a byte-slice argument's header without copying its data.
    pub fn next_byte_slice(&mut self) -> Result<(u32, u32), BridgeError> {
        self.require_header("argument read")?;
        let spec = SliceSpec::new(TypeSpec::Uint8);
        let addr = crate::typespec::align_address(self.base + self.consumed, WORD_SIZE);
        let header = {
            let buffer = self.view.buffer();
            let mem = buffer.borrow();
            spec.header(&mem, addr)?
        };
        self.consumed = addr + WORD_SIZE * 3 - self.base;
        let data_ptr = crate::typespec::narrow_ptr(header.data_ptr, "slice data pointer")?;
        Ok((data_ptr, header.len))
    }

    /// Consume a string argument, copying it out of guest memory.
    pub fn next_string(&mut self) -> Result<String, BridgeError> {
        let value = self.next(&TypeSpec::String)?;
        Ok(value.as_str()?.to_string())
    }

    /// Convert into the result writer. Consuming `self` makes a second
    /// conversion, or a read after conversion, unrepresentable.
    pub fn into_writer(self) -> Result<StackWriter, BridgeError> {
        self.require_header("writer conversion")?;
        Ok(StackWriter {
            view: self.view,
            base: self.base,
            consumed: self.consumed,
        })
    }
}

/// Producing cursor over the result area of one import call frame.
#[derive(Debug)]
pub struct StackWriter {
    view: MemoryView,
    base: u32,
    consumed: u32,
}

impl StackWriter {
    #[must_use]
    pub fn base(&self) -> u32 {
        self.base
    }

    #[must_use]
    pub fn consumed(&self) -> u32 {
        self.consumed
    }

    /// See [`StackReader::rebase`].
    pub fn rebase(&mut self, fresh_stack_pointer: u32) {
        self.base = fresh_stack_pointer;
    }

    /// Produce the next result: align, encode, advance.
    pub fn write(&mut self, spec: &TypeSpec, value: &SpecValue) -> Result<u32, BridgeError> {
        let placed = self.view.write(spec, self.base + self.consumed, value)?;
        self.consumed = placed.end_offset - self.base;
        Ok(placed.address)
    }

    /// Encode `value` through the reference table and write the handle.
    pub fn write_ref(
        &mut self,
        refs: &mut ReferenceTable,
        value: &HostValue,
    ) -> Result<u32, BridgeError> {
        let reference = refs.encode(value);
        let bits = u64::from_le_bytes(reference.encoded_bytes()?);
        self.write(&TypeSpec::Ref, &SpecValue::RefBits(bits))
    }

    pub fn write_bool(&mut self, value: bool) -> Result<u32, BridgeError> {
        self.write(&TypeSpec::Bool, &SpecValue::Bool(value))
    }

    pub fn write_int(&mut self, spec: &TypeSpec, value: i64) -> Result<u32, BridgeError> {
        self.write(spec, &SpecValue::Int(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::HostObject;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn view(len: usize) -> MemoryView {
        MemoryView::new(Rc::new(RefCell::new(vec![0u8; len])))
    }

    fn refs() -> ReferenceTable {
        ReferenceTable::new(
            HostValue::Object(HostObject::new("global")),
            HostValue::Object(HostObject::new("bridge")),
        )
    }

    #[test]
    fn arguments_follow_header_in_declared_order() {
        let view = view(256);
        let sp = 64;
        view.write_u64(sp + 8, 5).expect("arg 0");
        view.write_u64(sp + 16, 7).expect("arg 1");

        let mut reader = StackReader::new(view, sp);
        reader.skip_header().expect("header");
        assert_eq!(reader.next(&TypeSpec::Int64).unwrap(), SpecValue::Int(5));
        assert_eq!(reader.next(&TypeSpec::Int64).unwrap(), SpecValue::Int(7));
        assert_eq!(reader.consumed(), 24);
    }

    #[test]
    fn mixed_width_arguments_realign() {
        let view = view(256);
        let sp = 32;
        view.write_u8(sp + 8, 0xAB).expect("narrow arg");
        view.write_u64(sp + 16, 42).expect("wide arg");

        let mut reader = StackReader::new(view, sp);
        reader.skip_header().expect("header");
        assert_eq!(reader.next(&TypeSpec::Uint8).unwrap(), SpecValue::Uint(0xAB));
        // Next argument re-aligns from offset 9 to 16.
        assert_eq!(reader.next(&TypeSpec::Uint64).unwrap(), SpecValue::Uint(42));
    }

    #[test]
    fn header_skip_is_one_shot() {
        let mut reader = StackReader::new(view(64), 0);
        reader.skip_header().expect("first skip");
        let err = reader.skip_header().expect_err("second skip");
        assert!(
            err.message.contains("already skipped"),
            "unexpected error message: {}",
            err.message
        );
    }

    #[test]
    fn reads_require_header_skip() {
        let mut reader = StackReader::new(view(64), 0);
        let err = reader.next(&TypeSpec::Int64).expect_err("no header skip");
        assert!(
            err.message.contains("before the frame header"),
            "unexpected error message: {}",
            err.message
        );
    }

    #[test]
    fn writer_continues_past_last_argument() {
        let view = view(256);
        let sp = 0;
        view.write_u64(8, 9).expect("arg");
        let mut reader = StackReader::new(view.clone(), sp);
        reader.skip_header().expect("header");
        reader.next(&TypeSpec::Int64).expect("arg");

        let mut writer = reader.into_writer().expect("writer");
        writer.write_int(&TypeSpec::Int64, -4).expect("result");
        assert_eq!(view.read_u64(16).expect("read"), (-4i64) as u64);
    }

    #[test]
    fn rebase_preserves_consumed_offset() {
        let view = view(512);
        let old_sp = 64;
        let new_sp = 256;
        view.write_u64(old_sp + 8, 1).expect("arg");

        let mut reader = StackReader::new(view.clone(), old_sp);
        reader.skip_header().expect("header");
        reader.next(&TypeSpec::Int64).expect("arg");
        let consumed = reader.consumed();

        // The guest stack moved during a reentrant call.
        reader.rebase(new_sp);
        let mut writer = reader.into_writer().expect("writer");
        writer.write_int(&TypeSpec::Int64, 77).expect("result");

        // The write landed relative to the fresh stack pointer.
        assert_eq!(view.read_u64(new_sp + consumed).expect("read"), 77);
        assert_eq!(view.read_u64(old_sp + consumed).expect("stale"), 0);
    }

    #[test]
    fn ref_arguments_resolve_through_table() {
        let view = view(256);
        let mut refs = refs();
        let object = HostValue::Object(HostObject::new("arg"));
        let reference = refs.encode(&object);
        view.set(8, &reference.encoded_bytes().expect("bytes"))
            .expect("store ref");

        let mut reader = StackReader::new(view, 0);
        reader.skip_header().expect("header");
        assert_eq!(reader.next_ref(&refs).expect("resolve"), object);
    }

    #[test]
    fn byte_slice_header_is_not_copied() {
        let view = view(256);
        view.write_u64(8, 128).expect("data ptr");
        view.write_u64(16, 3).expect("len");
        view.write_u64(24, 8).expect("cap");

        let mut reader = StackReader::new(view, 0);
        reader.skip_header().expect("header");
        let (ptr, len) = reader.next_byte_slice().expect("header");
        assert_eq!((ptr, len), (128, 3));
        assert_eq!(reader.consumed(), 32);
    }
}
