//! Host-side binary bridge for garbage-collected WebAssembly guests.
//!
//! The guest language compiles to wasm with its own calling convention:
//! arguments and results travel through a stack frame in linear memory,
//! composite values follow the guest compiler's layout rules, and host
//! values are handed to the guest as NaN-boxed 8-byte references. This
//! crate reimplements that foreign-function ABI entirely in host code so
//! an embedder can register named import handlers and invoke
//! guest-exported callbacks without help from either side's type system.

pub mod bridge;
pub mod env;
pub mod errors;
pub mod inspect;
pub mod logging;
pub mod memory;
pub mod refs;
pub mod stack;
pub mod typespec;
pub mod value;

pub use bridge::{Bridge, BridgeOptions, GuestRuntime, ImportHandler, PendingEvent};
pub use env::HostEnv;
pub use errors::{BridgeError, Errno};
pub use inspect::hex_dump;
pub use memory::{Buffer, MemoryView};
pub use refs::{Ref, RefKind, ReferenceTable};
pub use stack::{StackReader, StackWriter, FRAME_HEADER_SIZE};
pub use typespec::{
    align_address, ArraySpec, Field, Placed, ReadValue, SliceSpec, SpecValue, StructSpec,
    TypeSpec, WORD_SIZE,
};
pub use value::{HostException, HostFunction, HostObject, HostValue};
