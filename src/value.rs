//! Dynamic host values visible to the guest through the reference table.
//!
//! The guest ABI only ever sees 8-byte encoded references; every richer
//! shape (objects with named slots, callable functions, byte buffers)
//! lives on the host side behind an `Rc` so that repeated encoding of the
//! same value observes the same identity.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// Type flag stored in the high word of a boxed reference.
pub const TYPE_FLAG_NONE: u32 = 0;
pub const TYPE_FLAG_OBJECT: u32 = 1;
pub const TYPE_FLAG_STRING: u32 = 2;
pub const TYPE_FLAG_SYMBOL: u32 = 3;
pub const TYPE_FLAG_FUNCTION: u32 = 4;

/// A host value the guest can hold a reference to.
#[derive(Clone)]
pub enum HostValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    Bytes(Rc<RefCell<Vec<u8>>>),
    Array(Rc<RefCell<Vec<HostValue>>>),
    Object(Rc<HostObject>),
    Function(Rc<HostFunction>),
}

/// Exception raised by host code while servicing a guest invocation.
///
/// Carries the exception as a plain host value so the dispatcher can
/// encode it across the ABI instead of unwinding into the guest's frame.
#[derive(Debug, Clone)]
pub struct HostException {
    pub value: HostValue,
}

impl HostException {
    /// Build an exception carrying an error object with a `message` slot.
    #[must_use]
    pub fn message(text: impl Into<String>) -> Self {
        let object = HostObject::new("Error");
        object.set("message", HostValue::string(text.into()));
        HostException {
            value: HostValue::Object(object),
        }
    }
}

/// Host-side object with named, mutable slots.
pub struct HostObject {
    pub name: String,
    slots: RefCell<HashMap<String, HostValue>>,
}

impl HostObject {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Rc<Self> {
        Rc::new(HostObject {
            name: name.into(),
            slots: RefCell::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<HostValue> {
        self.slots.borrow().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: HostValue) {
        self.slots.borrow_mut().insert(key.into(), value);
    }

    #[must_use]
    pub fn slot_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots.borrow().keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostObject")
            .field("name", &self.name)
            .field("slots", &self.slot_names())
            .finish()
    }
}

type CallFn = dyn Fn(&HostValue, &[HostValue]) -> Result<HostValue, HostException>;
type ConstructFn = dyn Fn(&[HostValue]) -> Result<HostValue, HostException>;

/// Host function callable from the guest through the invocation hooks.
pub struct HostFunction {
    pub name: String,
    call: Box<CallFn>,
    construct: Option<Box<ConstructFn>>,
}

impl HostFunction {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        call: impl Fn(&HostValue, &[HostValue]) -> Result<HostValue, HostException> + 'static,
    ) -> Rc<Self> {
        Rc::new(HostFunction {
            name: name.into(),
            call: Box::new(call),
            construct: None,
        })
    }

    #[must_use]
    pub fn constructor(
        name: impl Into<String>,
        call: impl Fn(&HostValue, &[HostValue]) -> Result<HostValue, HostException> + 'static,
        construct: impl Fn(&[HostValue]) -> Result<HostValue, HostException> + 'static,
    ) -> Rc<Self> {
        Rc::new(HostFunction {
            name: name.into(),
            call: Box::new(call),
            construct: Some(Box::new(construct)),
        })
    }

    pub fn invoke(
        &self,
        this: &HostValue,
        args: &[HostValue],
    ) -> Result<HostValue, HostException> {
        (self.call)(this, args)
    }

    pub fn construct(&self, args: &[HostValue]) -> Result<HostValue, HostException> {
        match &self.construct {
            Some(construct) => construct(args),
            None => Err(HostException::message(format!(
                "{} is not a constructor",
                self.name
            ))),
        }
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("name", &self.name)
            .field("constructible", &self.construct.is_some())
            .finish()
    }
}

impl HostValue {
    #[must_use]
    pub fn string(text: impl Into<String>) -> Self {
        HostValue::String(Rc::from(text.into().into_boxed_str()))
    }

    #[must_use]
    pub fn bytes(data: Vec<u8>) -> Self {
        HostValue::Bytes(Rc::new(RefCell::new(data)))
    }

    #[must_use]
    pub fn array(items: Vec<HostValue>) -> Self {
        HostValue::Array(Rc::new(RefCell::new(items)))
    }

    #[must_use]
    pub fn is_undefined(&self) -> bool {
        matches!(self, HostValue::Undefined)
    }

    /// Type flag recorded in the high word of this value's boxed encoding.
    #[must_use]
    pub fn type_flag(&self) -> u32 {
        match self {
            HostValue::String(_) => TYPE_FLAG_STRING,
            HostValue::Function(_) => TYPE_FLAG_FUNCTION,
            HostValue::Bytes(_) | HostValue::Array(_) | HostValue::Object(_) => TYPE_FLAG_OBJECT,
            _ => TYPE_FLAG_NONE,
        }
    }

    /// Render the value as text for the prepared-string copy protocol.
    #[must_use]
    pub fn to_text(&self) -> String {
        match self {
            HostValue::Undefined => "undefined".into(),
            HostValue::Null => "null".into(),
            HostValue::Bool(v) => v.to_string(),
            HostValue::Number(v) => {
                if v.fract() == 0.0 && v.is_finite() {
                    format!("{v:.0}")
                } else {
                    v.to_string()
                }
            }
            HostValue::String(text) => text.to_string(),
            HostValue::Bytes(data) => format!("[bytes {}]", data.borrow().len()),
            HostValue::Array(items) => format!("[array {}]", items.borrow().len()),
            HostValue::Object(object) => format!("[object {}]", object.name),
            HostValue::Function(function) => format!("[function {}]", function.name),
        }
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Undefined => f.write_str("Undefined"),
            HostValue::Null => f.write_str("Null"),
            HostValue::Bool(v) => write!(f, "Bool({v})"),
            HostValue::Number(v) => write!(f, "Number({v})"),
            HostValue::String(text) => write!(f, "String({text:?})"),
            HostValue::Bytes(data) => write!(f, "Bytes(len={})", data.borrow().len()),
            HostValue::Array(items) => write!(f, "Array(len={})", items.borrow().len()),
            HostValue::Object(object) => write!(f, "Object({})", object.name),
            HostValue::Function(function) => write!(f, "Function({})", function.name),
        }
    }
}

/// Equality follows the guest-visible contract: primitives compare by
/// value, everything `Rc`-backed compares by identity.
impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (HostValue::Undefined, HostValue::Undefined) => true,
            (HostValue::Null, HostValue::Null) => true,
            (HostValue::Bool(a), HostValue::Bool(b)) => a == b,
            (HostValue::Number(a), HostValue::Number(b)) => a == b,
            (HostValue::String(a), HostValue::String(b)) => a == b,
            (HostValue::Bytes(a), HostValue::Bytes(b)) => Rc::ptr_eq(a, b),
            (HostValue::Array(a), HostValue::Array(b)) => Rc::ptr_eq(a, b),
            (HostValue::Object(a), HostValue::Object(b)) => Rc::ptr_eq(a, b),
            (HostValue::Function(a), HostValue::Function(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Property read. Total: unsupported targets and missing slots yield
/// `Undefined` so the guest observes absent rather than faulted.
#[must_use]
pub fn property(target: &HostValue, name: &str) -> HostValue {
    match target {
        HostValue::Object(object) => object.get(name).unwrap_or(HostValue::Undefined),
        HostValue::String(text) if name == "length" => HostValue::Number(text.len() as f64),
        HostValue::Array(items) if name == "length" => {
            HostValue::Number(items.borrow().len() as f64)
        }
        HostValue::Bytes(data) if name == "length" => {
            HostValue::Number(data.borrow().len() as f64)
        }
        _ => HostValue::Undefined,
    }
}

/// Property write. Only objects carry mutable slots.
pub fn set_property(
    target: &HostValue,
    name: &str,
    value: HostValue,
) -> Result<(), HostException> {
    match target {
        HostValue::Object(object) => {
            object.set(name, value);
            Ok(())
        }
        other => Err(HostException::message(format!(
            "cannot set property {name:?} on {}",
            other.to_text()
        ))),
    }
}

/// Indexed read on arrays and byte buffers.
#[must_use]
pub fn index(target: &HostValue, position: usize) -> HostValue {
    match target {
        HostValue::Array(items) => items
            .borrow()
            .get(position)
            .cloned()
            .unwrap_or(HostValue::Undefined),
        HostValue::Bytes(data) => data
            .borrow()
            .get(position)
            .map(|byte| HostValue::Number(f64::from(*byte)))
            .unwrap_or(HostValue::Undefined),
        _ => HostValue::Undefined,
    }
}

/// Indexed write on arrays and byte buffers.
pub fn set_index(
    target: &HostValue,
    position: usize,
    value: HostValue,
) -> Result<(), HostException> {
    match target {
        HostValue::Array(items) => {
            let mut items = items.borrow_mut();
            if position >= items.len() {
                return Err(HostException::message(format!(
                    "index {position} out of range for array of length {}",
                    items.len()
                )));
            }
            items[position] = value;
            Ok(())
        }
        HostValue::Bytes(data) => {
            let mut data = data.borrow_mut();
            let HostValue::Number(byte) = value else {
                return Err(HostException::message("byte buffers store numbers only"));
            };
            if position >= data.len() {
                return Err(HostException::message(format!(
                    "index {position} out of range for byte buffer of length {}",
                    data.len()
                )));
            }
            data[position] = byte as u8;
            Ok(())
        }
        other => Err(HostException::message(format!(
            "cannot index into {}",
            other.to_text()
        ))),
    }
}

/// Element or byte count for container-like values.
#[must_use]
pub fn length(target: &HostValue) -> usize {
    match target {
        HostValue::String(text) => text.len(),
        HostValue::Bytes(data) => data.borrow().len(),
        HostValue::Array(items) => items.borrow().len(),
        _ => 0,
    }
}

/// Resolve `name` on `target` and invoke it with `target` as receiver.
pub fn call_method(
    target: &HostValue,
    name: &str,
    args: &[HostValue],
) -> Result<HostValue, HostException> {
    match property(target, name) {
        HostValue::Function(function) => function.invoke(target, args),
        HostValue::Undefined => Err(HostException::message(format!(
            "{} has no method {name:?}",
            target.to_text()
        ))),
        other => Err(HostException::message(format!(
            "property {name:?} of {} is {} and cannot be called",
            target.to_text(),
            other.to_text()
        ))),
    }
}

/// Invoke `target` as a free function.
pub fn call_function(
    target: &HostValue,
    this: &HostValue,
    args: &[HostValue],
) -> Result<HostValue, HostException> {
    match target {
        HostValue::Function(function) => function.invoke(this, args),
        other => Err(HostException::message(format!(
            "{} is not a function",
            other.to_text()
        ))),
    }
}

/// Invoke `target` as a constructor.
pub fn construct(target: &HostValue, args: &[HostValue]) -> Result<HostValue, HostException> {
    match target {
        HostValue::Function(function) => function.construct(args),
        other => Err(HostException::message(format!(
            "{} is not a constructor",
            other.to_text()
        ))),
    }
}
