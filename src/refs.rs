//! Reference table and NaN-boxing codec.
//!
//! Host values cross the boundary as 8 bytes of IEEE-754 double payload
//! space: non-zero finite numbers travel as themselves, everything else
//! as a NaN whose low word carries a table id. The table owns the only
//! mapping between ids and host values; losing an entry while the guest
//! still holds its id is a lifetime bug, so lookups of unknown ids fault
//! instead of degrading.

use std::collections::HashMap;
use std::rc::Rc;

use crate::errors::BridgeError;
use crate::value::HostValue;

/// High word prefix marking a boxed (non-literal) reference.
pub const NAN_HEAD: u32 = 0x7FF8_0000;

/// Reserved sentinel ids. These are pinned at table construction and are
/// never released or recycled through the free pool.
pub const ID_NAN: u32 = 0;
pub const ID_ZERO: u32 = 1;
pub const ID_NULL: u32 = 2;
pub const ID_TRUE: u32 = 3;
pub const ID_FALSE: u32 = 4;
pub const ID_GLOBAL: u32 = 5;
pub const ID_BRIDGE: u32 = 6;

const RESERVED_IDS: u32 = 7;

/// How a [`Ref`] represents its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    /// Placeholder carrying no value; encoding it is a fault.
    Invalid,
    /// Literal non-zero finite double (or the undefined zero word).
    Inline,
    /// Boxed table id.
    Table,
}

/// An 8-byte encoded handle standing in for a host value.
///
/// A `Ref` built for writing always carries its encoded bytes; a `Ref`
/// built by reading never does.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ref {
    kind: RefKind,
    id: u32,
    number: f64,
    data: Option<[u8; 8]>,
}

impl Ref {
    #[must_use]
    pub fn invalid() -> Self {
        Ref {
            kind: RefKind::Invalid,
            id: 0,
            number: 0.0,
            data: None,
        }
    }

    /// Classify raw bits read out of guest memory. Never carries encode
    /// data.
    #[must_use]
    pub fn reading(bits: u64) -> Self {
        let number = f64::from_bits(bits);
        if number == 0.0 || !number.is_nan() {
            Ref {
                kind: RefKind::Inline,
                id: 0,
                number,
                data: None,
            }
        } else {
            Ref {
                kind: RefKind::Table,
                id: bits as u32,
                number: f64::NAN,
                data: None,
            }
        }
    }

    fn writing_inline(number: f64) -> Self {
        let bits = number.to_bits();
        Ref {
            kind: RefKind::Inline,
            id: 0,
            number,
            data: Some(bits.to_le_bytes()),
        }
    }

    fn writing_boxed(id: u32, type_flag: u32) -> Self {
        let bits = u64::from(id) | (u64::from(NAN_HEAD | type_flag) << 32);
        Ref {
            kind: RefKind::Table,
            id,
            number: f64::NAN,
            data: Some(bits.to_le_bytes()),
        }
    }

    #[must_use]
    pub fn kind(&self) -> RefKind {
        self.kind
    }

    /// Table id, when this reference is boxed.
    #[must_use]
    pub fn table_id(&self) -> Option<u32> {
        match self.kind {
            RefKind::Table => Some(self.id),
            _ => None,
        }
    }

    #[must_use]
    pub fn inline_number(&self) -> Option<f64> {
        match self.kind {
            RefKind::Inline => Some(self.number),
            _ => None,
        }
    }

    /// Wire bytes for a reference constructed for writing.
    pub fn encoded_bytes(&self) -> Result<[u8; 8], BridgeError> {
        match (self.kind, self.data) {
            (RefKind::Invalid, _) => Err(BridgeError {
                message: "invalid reference cannot be written to guest memory".into(),
            }),
            (_, Some(data)) => Ok(data),
            (_, None) => Err(BridgeError {
                message: "reference was built for reading and carries no encode data".into(),
            }),
        }
    }
}

/// Identity key for the reverse (value → id) mapping. Primitives key by
/// value, strings by content, everything else by `Rc` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RefKey {
    NanNumber,
    ZeroNumber,
    Null,
    Bool(bool),
    Str(Rc<str>),
    Addr(usize),
}

fn ref_key(value: &HostValue) -> Option<RefKey> {
    match value {
        HostValue::Undefined => None,
        HostValue::Null => Some(RefKey::Null),
        HostValue::Bool(v) => Some(RefKey::Bool(*v)),
        HostValue::Number(v) => {
            if v.is_nan() {
                Some(RefKey::NanNumber)
            } else if *v == 0.0 {
                Some(RefKey::ZeroNumber)
            } else {
                None
            }
        }
        HostValue::String(text) => Some(RefKey::Str(text.clone())),
        HostValue::Bytes(data) => Some(RefKey::Addr(Rc::as_ptr(data) as usize)),
        HostValue::Array(items) => Some(RefKey::Addr(Rc::as_ptr(items) as usize)),
        HostValue::Object(object) => Some(RefKey::Addr(Rc::as_ptr(object) as *const u8 as usize)),
        HostValue::Function(function) => {
            Some(RefKey::Addr(Rc::as_ptr(function) as *const u8 as usize))
        }
    }
}

#[derive(Debug)]
struct Entry {
    value: HostValue,
    count: u32,
    pinned: bool,
}

/// Array-backed id → value mapping with a reverse identity map and per-id
/// reference counts. Ids whose count returns to zero go back to the free
/// pool for reuse.
pub struct ReferenceTable {
    entries: Vec<Option<Entry>>,
    ids: HashMap<RefKey, u32>,
    free: Vec<u32>,
}

impl ReferenceTable {
    /// Build a table seeded with the seven pinned sentinels.
    #[must_use]
    pub fn new(global: HostValue, bridge: HostValue) -> Self {
        let mut table = ReferenceTable {
            entries: Vec::with_capacity(RESERVED_IDS as usize),
            ids: HashMap::new(),
            free: Vec::new(),
        };
        let sentinels = [
            HostValue::Number(f64::NAN),
            HostValue::Number(0.0),
            HostValue::Null,
            HostValue::Bool(true),
            HostValue::Bool(false),
            global,
            bridge,
        ];
        for value in sentinels {
            let id = table.entries.len() as u32;
            if let Some(key) = ref_key(&value) {
                table.ids.insert(key, id);
            }
            table.entries.push(Some(Entry {
                value,
                count: 1,
                pinned: true,
            }));
        }
        table
    }

    /// Encode `value` for writing into guest memory. Referenceable values
    /// are retained: repeated encoding of the same identity returns the
    /// same id with a bumped reference count.
    pub fn encode(&mut self, value: &HostValue) -> Ref {
        match value {
            HostValue::Number(n) if *n != 0.0 && !n.is_nan() => Ref::writing_inline(*n),
            HostValue::Undefined => Ref::writing_inline(0.0),
            other => {
                let id = self.retain(other);
                Ref::writing_boxed(id, other.type_flag())
            }
        }
    }

    /// Decode 8 raw bytes read out of guest memory.
    pub fn decode(&self, bits: u64) -> Result<HostValue, BridgeError> {
        let number = f64::from_bits(bits);
        if number == 0.0 {
            return Ok(HostValue::Undefined);
        }
        if !number.is_nan() {
            return Ok(HostValue::Number(number));
        }
        self.get(bits as u32).cloned()
    }

    /// Look up a table id. Unknown ids indicate a host/guest lifetime
    /// bug and fault.
    pub fn get(&self, id: u32) -> Result<&HostValue, BridgeError> {
        self.entries
            .get(id as usize)
            .and_then(|slot| slot.as_ref())
            .map(|entry| &entry.value)
            .ok_or_else(|| BridgeError {
                message: format!("reference id {id} has no table entry"),
            })
    }

    /// Allocate or reuse an id for `value` and bump its reference count.
    pub fn retain(&mut self, value: &HostValue) -> u32 {
        let key = ref_key(value);
        if let Some(id) = key.as_ref().and_then(|key| self.ids.get(key)).copied() {
            let entry = self.entries[id as usize]
                .as_mut()
                .unwrap_or_else(|| unreachable!("reverse map points at a live entry"));
            if !entry.pinned {
                entry.count += 1;
            }
            return id;
        }
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                self.entries.push(None);
                (self.entries.len() - 1) as u32
            }
        };
        if let Some(key) = key {
            self.ids.insert(key, id);
        }
        self.entries[id as usize] = Some(Entry {
            value: value.clone(),
            count: 1,
            pinned: false,
        });
        id
    }

    /// Drop one reference held by the guest. Pinned sentinels ignore
    /// release; the last release frees the id for reuse.
    pub fn release(&mut self, id: u32) -> Result<(), BridgeError> {
        let slot = self
            .entries
            .get_mut(id as usize)
            .ok_or_else(|| BridgeError {
                message: format!("reference id {id} has no table entry"),
            })?;
        let entry = slot.as_mut().ok_or_else(|| BridgeError {
            message: format!("reference id {id} released after its entry was freed"),
        })?;
        if entry.pinned {
            return Ok(());
        }
        entry.count -= 1;
        if entry.count == 0 {
            if let Some(key) = ref_key(&entry.value) {
                self.ids.remove(&key);
            }
            *slot = None;
            self.free.push(id);
        }
        Ok(())
    }

    /// Current reference count for an id, for diagnostics and tests.
    #[must_use]
    pub fn count(&self, id: u32) -> Option<u32> {
        self.entries
            .get(id as usize)
            .and_then(|slot| slot.as_ref())
            .map(|entry| entry.count)
    }

    /// Number of live (non-free) entries, including sentinels.
    #[must_use]
    pub fn live_entries(&self) -> usize {
        self.entries.iter().filter(|slot| slot.is_some()).count()
    }
}

impl std::fmt::Debug for ReferenceTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceTable")
            .field("live_entries", &self.live_entries())
            .field("free_ids", &self.free.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::HostObject;

    fn table() -> ReferenceTable {
        ReferenceTable::new(
            HostValue::Object(HostObject::new("global")),
            HostValue::Object(HostObject::new("bridge")),
        )
    }

    fn bits(reference: &Ref) -> u64 {
        u64::from_le_bytes(reference.encoded_bytes().expect("encode data"))
    }

    #[test]
    fn literal_numbers_round_trip_inline() {
        let mut refs = table();
        let reference = refs.encode(&HostValue::Number(12.5));
        assert_eq!(reference.kind(), RefKind::Inline);
        assert_eq!(refs.decode(bits(&reference)).unwrap(), HostValue::Number(12.5));
        // No table entry was allocated.
        assert_eq!(refs.live_entries(), 7);
    }

    #[test]
    fn undefined_is_the_zero_word() {
        let mut refs = table();
        let reference = refs.encode(&HostValue::Undefined);
        assert_eq!(bits(&reference), 0);
        assert_eq!(refs.decode(0).unwrap(), HostValue::Undefined);
    }

    #[test]
    fn sentinels_round_trip_without_new_ids() {
        let mut refs = table();
        for value in [
            HostValue::Null,
            HostValue::Bool(true),
            HostValue::Bool(false),
            HostValue::Number(0.0),
        ] {
            let reference = refs.encode(&value);
            assert_eq!(refs.decode(bits(&reference)).unwrap(), value);
        }
        let nan = refs.encode(&HostValue::Number(f64::NAN));
        assert_eq!(nan.table_id(), Some(ID_NAN));
        let decoded = refs.decode(bits(&nan)).unwrap();
        let HostValue::Number(n) = decoded else {
            panic!("expected number, found {decoded:?}");
        };
        assert!(n.is_nan());
        assert_eq!(refs.live_entries(), 7);
    }

    #[test]
    fn sentinel_ids_are_fixed() {
        let mut refs = table();
        assert_eq!(refs.encode(&HostValue::Number(0.0)).table_id(), Some(ID_ZERO));
        assert_eq!(refs.encode(&HostValue::Null).table_id(), Some(ID_NULL));
        assert_eq!(refs.encode(&HostValue::Bool(true)).table_id(), Some(ID_TRUE));
        assert_eq!(refs.encode(&HostValue::Bool(false)).table_id(), Some(ID_FALSE));
    }

    #[test]
    fn boxed_encoding_carries_type_flag() {
        let mut refs = table();
        let object = HostValue::Object(HostObject::new("thing"));
        let reference = refs.encode(&object);
        let high = (bits(&reference) >> 32) as u32;
        assert_eq!(high, NAN_HEAD | 1);
        let text = refs.encode(&HostValue::string("hi"));
        assert_eq!((bits(&text) >> 32) as u32, NAN_HEAD | 2);
    }

    #[test]
    fn same_identity_shares_id_and_bumps_count() {
        let mut refs = table();
        let object = HostValue::Object(HostObject::new("thing"));
        let first = refs.encode(&object);
        let second = refs.encode(&object);
        let id = first.table_id().expect("boxed");
        assert_eq!(second.table_id(), Some(id));
        assert_eq!(refs.count(id), Some(2));

        let decoded = refs.decode(bits(&first)).unwrap();
        assert_eq!(decoded, object);
    }

    #[test]
    fn release_frees_and_id_is_reused_for_new_value() {
        let mut refs = table();
        let first = HostValue::Object(HostObject::new("first"));
        let id = refs.encode(&first).table_id().expect("boxed");
        refs.release(id).expect("release");
        assert!(refs.get(id).is_err());

        let second = HostValue::Object(HostObject::new("second"));
        let reused = refs.encode(&second).table_id().expect("boxed");
        assert_eq!(reused, id);
        assert_eq!(refs.get(id).unwrap(), &second);
    }

    #[test]
    fn release_respects_count() {
        let mut refs = table();
        let object = HostValue::Object(HostObject::new("thing"));
        let id = refs.encode(&object).table_id().expect("boxed");
        refs.encode(&object);
        refs.release(id).expect("first release");
        assert_eq!(refs.count(id), Some(1));
        refs.release(id).expect("second release");
        assert!(refs.get(id).is_err());
    }

    #[test]
    fn pinned_sentinels_ignore_release() {
        let mut refs = table();
        for _ in 0..3 {
            refs.release(ID_TRUE).expect("pinned release");
        }
        assert_eq!(refs.get(ID_TRUE).unwrap(), &HostValue::Bool(true));
    }

    #[test]
    fn unknown_id_is_a_fault() {
        let refs = table();
        let boxed = u64::from(99u32) | (u64::from(NAN_HEAD) << 32);
        let err = refs.decode(boxed).expect_err("unknown id");
        assert!(
            err.message.contains("no table entry"),
            "unexpected error message: {}",
            err.message
        );
    }

    #[test]
    fn reading_refs_never_carry_encode_data() {
        let reference = Ref::reading(0x7FF8_0000_0000_0005);
        assert_eq!(reference.table_id(), Some(5));
        assert!(reference.encoded_bytes().is_err());
        assert!(Ref::invalid().encoded_bytes().is_err());
    }

    #[test]
    fn equal_strings_share_one_id() {
        let mut refs = table();
        let a = refs.encode(&HostValue::string("shared"));
        let b = refs.encode(&HostValue::string("shared"));
        assert_eq!(a.table_id(), b.table_id());
        let id = a.table_id().expect("boxed");
        assert_eq!(refs.count(id), Some(2));
    }
}
