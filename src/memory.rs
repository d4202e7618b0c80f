//! Re-bindable view over the guest's linear memory.
//!
//! Linear memory growth replaces the underlying buffer wholesale, so the
//! view never caches a borrow: every accessor re-fetches the current
//! buffer handle, and `reset` swaps the handle for all clones of the
//! view at once.

use std::cell::RefCell;
use std::rc::Rc;

use crate::errors::BridgeError;
use crate::refs::ReferenceTable;
use crate::typespec::{Placed, ReadValue, SliceSpec, SpecValue, TypeSpec, WORD_SIZE};
use crate::value::HostValue;

/// Shared handle to one linear-memory buffer instance.
pub type Buffer = Rc<RefCell<Vec<u8>>>;

/// Convenience read/write/copy operations over the guest's memory.
#[derive(Clone)]
pub struct MemoryView {
    slot: Rc<RefCell<Buffer>>,
}

impl MemoryView {
    #[must_use]
    pub fn new(buffer: Buffer) -> Self {
        MemoryView {
            slot: Rc::new(RefCell::new(buffer)),
        }
    }

    /// Re-bind this view (and every clone of it) to a replacement buffer.
    pub fn reset(&self, buffer: Buffer) {
        *self.slot.borrow_mut() = buffer;
    }

    /// Current buffer handle. Callers must not cache the result across a
    /// potential reallocation.
    #[must_use]
    pub fn buffer(&self) -> Buffer {
        self.slot.borrow().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer().borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read_u8(&self, addr: u32) -> Result<u8, BridgeError> {
        let buffer = self.buffer();
        let mem = buffer.borrow();
        let index = addr as usize;
        if index >= mem.len() {
            return Err(BridgeError {
                message: format!(
                    "memory read of 1 byte at 0x{addr:08X} exceeds linear memory bounds"
                ),
            });
        }
        Ok(mem[index])
    }

    pub fn write_u8(&self, addr: u32, value: u8) -> Result<(), BridgeError> {
        let buffer = self.buffer();
        let mut mem = buffer.borrow_mut();
        let index = addr as usize;
        if index >= mem.len() {
            return Err(BridgeError {
                message: format!(
                    "memory write of 1 byte at 0x{addr:08X} exceeds linear memory bounds"
                ),
            });
        }
        mem[index] = value;
        Ok(())
    }

    pub fn read_u32(&self, addr: u32) -> Result<u32, BridgeError> {
        let bytes = self.get(addr, 4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("length checked")))
    }

    pub fn write_u32(&self, addr: u32, value: u32) -> Result<(), BridgeError> {
        self.set(addr, &value.to_le_bytes())
    }

    pub fn read_u64(&self, addr: u32) -> Result<u64, BridgeError> {
        let bytes = self.get(addr, 8)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("length checked")))
    }

    pub fn write_u64(&self, addr: u32, value: u64) -> Result<(), BridgeError> {
        self.set(addr, &value.to_le_bytes())
    }

    pub fn read_f64(&self, addr: u32) -> Result<f64, BridgeError> {
        Ok(f64::from_bits(self.read_u64(addr)?))
    }

    pub fn write_f64(&self, addr: u32, value: f64) -> Result<(), BridgeError> {
        self.write_u64(addr, value.to_bits())
    }

    /// Bulk copy out of guest memory.
    pub fn get(&self, addr: u32, len: u32) -> Result<Vec<u8>, BridgeError> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let buffer = self.buffer();
        let mem = buffer.borrow();
        let start = addr as usize;
        let end = start + len as usize;
        if end > mem.len() {
            return Err(BridgeError {
                message: format!(
                    "memory read of {len} byte(s) at 0x{addr:08X} exceeds linear memory bounds"
                ),
            });
        }
        Ok(mem[start..end].to_vec())
    }

    /// Bulk copy into guest memory.
    pub fn set(&self, addr: u32, data: &[u8]) -> Result<(), BridgeError> {
        if data.is_empty() {
            return Ok(());
        }
        let buffer = self.buffer();
        let mut mem = buffer.borrow_mut();
        let start = addr as usize;
        let end = start + data.len();
        if end > mem.len() {
            return Err(BridgeError {
                message: format!(
                    "memory write of {} byte(s) at 0x{addr:08X} exceeds linear memory bounds",
                    data.len()
                ),
            });
        }
        mem[start..end].copy_from_slice(data);
        Ok(())
    }

    /// Aligned typed read through a [`TypeSpec`].
    pub fn read(&self, spec: &TypeSpec, addr: u32) -> Result<ReadValue, BridgeError> {
        let buffer = self.buffer();
        let mem = buffer.borrow();
        spec.read(&mem, addr)
    }

    /// Aligned typed write through a [`TypeSpec`].
    pub fn write(
        &self,
        spec: &TypeSpec,
        addr: u32,
        value: &SpecValue,
    ) -> Result<Placed, BridgeError> {
        let buffer = self.buffer();
        let mut mem = buffer.borrow_mut();
        spec.write(&mut mem, addr, value)
    }

    /// Read one encoded reference and resolve it against the table.
    pub fn read_ref(&self, refs: &ReferenceTable, addr: u32) -> Result<HostValue, BridgeError> {
        refs.decode(self.read_u64(addr)?)
    }

    /// Read a slice of encoded references and resolve each element.
    pub fn read_ref_slice(
        &self,
        refs: &ReferenceTable,
        addr: u32,
    ) -> Result<Vec<HostValue>, BridgeError> {
        let spec = SliceSpec::new(TypeSpec::Ref);
        let header = {
            let buffer = self.buffer();
            let mem = buffer.borrow();
            spec.header(&mem, addr)?
        };
        let mut values = Vec::with_capacity(header.len as usize);
        for position in 0..header.len {
            let element = crate::typespec::narrow_ptr(
                header.data_ptr + u64::from(position) * u64::from(WORD_SIZE),
                "reference slice element",
            )?;
            values.push(self.read_ref(refs, element)?);
        }
        Ok(values)
    }
}

impl std::fmt::Debug for MemoryView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryView").field("len", &self.len()).finish()
    }
}
