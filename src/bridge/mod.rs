//! Import binder and call dispatcher.
//!
//! The bridge owns the reference table and the memory view, routes
//! guest→host import calls to registered handlers, and carries host→guest
//! callbacks through the pending-event record. Everything runs on one
//! logical thread: the guest executes synchronously inside a single host
//! call stack frame per import invocation, so interior mutability with
//! `Rc`/`RefCell` replaces locking by construction.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::rc::Rc;

use crate::errors::BridgeError;
use crate::env::HostEnv;
use crate::inspect::hex_dump;
use crate::memory::{Buffer, MemoryView};
use crate::refs::ReferenceTable;
use crate::stack::StackReader;
use crate::value::{HostException, HostFunction, HostObject, HostValue};

mod builtin;

/// Hooks into the guest instance and its cooperative scheduler.
///
/// Methods take `&self`: the bridge must never hold a mutable borrow of
/// the guest across a reentrant resume, because the guest traps back into
/// `Bridge::dispatch` while `resume` is still on the stack.
pub trait GuestRuntime {
    /// Current linear-memory buffer. Growth replaces the buffer
    /// wholesale; callers re-fetch rather than cache.
    fn memory(&self) -> Buffer;

    /// Fresh stack-pointer value. Fetched again after every reentrant
    /// host→guest call.
    fn stack_pointer(&self) -> Result<u32, BridgeError>;

    /// Run the guest scheduler until it yields again.
    fn resume(&self, bridge: &Bridge) -> Result<(), BridgeError>;
}

/// Handler for one registered import symbol.
pub type ImportHandler = Rc<dyn Fn(&Bridge, StackReader) -> Result<(), BridgeError>>;

/// Record deposited for the guest when the host invokes an exported
/// callback. The guest drains one record per resume cycle and may write
/// a result back before control returns to the host caller.
#[derive(Debug)]
pub struct PendingEvent {
    pub id: u32,
    pub this: HostValue,
    pub args: Vec<HostValue>,
    pub result: Option<HostValue>,
    consumed: bool,
}

/// Dispatch-time configuration.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Log every import call at debug level.
    pub trace_calls: bool,
    /// Bytes of the offending frame region dumped when a call faults.
    pub fault_dump_bytes: u32,
    /// Hex-dump row width for fault diagnostics.
    pub fault_dump_width: usize,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        BridgeOptions {
            trace_calls: env::var_os("GUESTLINK_TRACE_CALLS").is_some(),
            fault_dump_bytes: 64,
            fault_dump_width: 16,
        }
    }
}

/// The binary bridge between one host and one guest instance.
pub struct Bridge {
    memory: MemoryView,
    refs: RefCell<ReferenceTable>,
    imports: RefCell<HashMap<String, ImportHandler>>,
    guest: Rc<dyn GuestRuntime>,
    env: HostEnv,
    options: BridgeOptions,
    pending: RefCell<Option<PendingEvent>>,
    timers: RefCell<BTreeMap<u32, i64>>,
    next_timer: Cell<u32>,
    exit_code: Cell<Option<i32>>,
    exit_listeners: RefCell<Vec<Box<dyn Fn(i32)>>>,
    faulted: Cell<bool>,
    global: HostValue,
    bridge_object: HostValue,
}

impl Bridge {
    /// Build a bridge over `guest`, seeding the reference table with the
    /// environment's global object and the bridge's own identity, and
    /// registering the built-in runtime import namespaces.
    #[must_use]
    pub fn new(env: HostEnv, guest: Rc<dyn GuestRuntime>, options: BridgeOptions) -> Self {
        let global = env.global_object();
        let bridge_object = HostValue::Object(HostObject::new("bridge"));
        let bridge = Bridge {
            memory: MemoryView::new(guest.memory()),
            refs: RefCell::new(ReferenceTable::new(global.clone(), bridge_object.clone())),
            imports: RefCell::new(HashMap::new()),
            guest,
            env,
            options,
            pending: RefCell::new(None),
            timers: RefCell::new(BTreeMap::new()),
            next_timer: Cell::new(1),
            exit_code: Cell::new(None),
            exit_listeners: RefCell::new(Vec::new()),
            faulted: Cell::new(false),
            global,
            bridge_object,
        };
        bridge.install_runtime_imports();
        bridge
    }

    #[must_use]
    pub fn memory(&self) -> &MemoryView {
        &self.memory
    }

    #[must_use]
    pub fn refs(&self) -> &RefCell<ReferenceTable> {
        &self.refs
    }

    #[must_use]
    pub fn env(&self) -> &HostEnv {
        &self.env
    }

    #[must_use]
    pub fn global(&self) -> &HostValue {
        &self.global
    }

    #[must_use]
    pub fn bridge_object(&self) -> &HostValue {
        &self.bridge_object
    }

    pub(crate) fn pending(&self) -> &RefCell<Option<PendingEvent>> {
        &self.pending
    }

    pub(crate) fn guest_memory(&self) -> Buffer {
        self.guest.memory()
    }

    /// Fresh stack pointer from the guest, for rebasing frame cursors
    /// after reentrant calls.
    pub fn guest_stack_pointer(&self) -> Result<u32, BridgeError> {
        self.guest.stack_pointer()
    }

    /// Register a handler under a fully-qualified symbol name, e.g.
    /// `"hostref.valueCall"` or `"main.sum2"`.
    pub fn register<F>(&self, name: &str, handler: F)
    where
        F: Fn(&Bridge, StackReader) -> Result<(), BridgeError> + 'static,
    {
        let previous = self
            .imports
            .borrow_mut()
            .insert(name.to_string(), Rc::new(handler));
        if previous.is_some() {
            tracing::debug!(target: "guestlink.bridge", import = name, "replaced import handler");
        }
    }

    /// The import surface for the guest loader: package path → sorted
    /// symbol names.
    #[must_use]
    pub fn import_object(&self) -> BTreeMap<String, Vec<String>> {
        let mut namespaces: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for name in self.imports.borrow().keys() {
            let (package, symbol) = name
                .rsplit_once('.')
                .unwrap_or(("", name.as_str()));
            namespaces
                .entry(package.to_string())
                .or_default()
                .push(symbol.to_string());
        }
        for symbols in namespaces.values_mut() {
            symbols.sort();
        }
        namespaces
    }

    /// Route one guest→host import call.
    ///
    /// The raw stack pointer arrives as the guest's i32 and is
    /// normalized to unsigned before any address arithmetic. A handler
    /// error is a protocol fault: the bridge records it, dumps the
    /// offending frame region, and refuses further dispatches until the
    /// guest instance is restarted.
    pub fn dispatch(&self, name: &str, raw_stack_pointer: i32) -> Result<(), BridgeError> {
        if self.faulted.get() {
            return Err(BridgeError {
                message: format!(
                    "bridge already faulted; dropping import call to {name}"
                ),
            });
        }
        let stack_pointer = raw_stack_pointer as u32;
        let handler = self.imports.borrow().get(name).cloned();
        let Some(handler) = handler else {
            self.faulted.set(true);
            return Err(BridgeError {
                message: format!("no import handler registered for {name}"),
            });
        };
        if self.options.trace_calls {
            tracing::debug!(
                target: "guestlink.dispatch",
                import = name,
                stack_pointer,
                "import call"
            );
        }
        let reader = StackReader::new(self.memory.clone(), stack_pointer);
        match handler(self, reader) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.faulted.set(true);
                self.log_fault(name, stack_pointer, &err);
                Err(err)
            }
        }
    }

    fn log_fault(&self, name: &str, stack_pointer: u32, err: &BridgeError) {
        let buffer = self.memory.buffer();
        let mem = buffer.borrow();
        let len = mem.len() as u32;
        let start = stack_pointer.min(len);
        let count = self.options.fault_dump_bytes.min(len - start);
        let frame = hex_dump(&mem, start, count, self.options.fault_dump_width)
            .unwrap_or_else(|_| String::from("<frame region unavailable>"));
        tracing::error!(
            target: "guestlink.dispatch",
            import = name,
            stack_pointer,
            error = %err.message,
            frame = %frame,
            "import call faulted"
        );
    }

    /// Whether a protocol fault has terminated this bridge.
    #[must_use]
    pub fn is_faulted(&self) -> bool {
        self.faulted.get()
    }

    /// Invoke a guest-exported callback by numeric event id.
    ///
    /// Deposits the pending-event record and resumes the guest scheduler
    /// synchronously; the guest drains the record and may write a result
    /// back into it before this returns.
    pub fn invoke_callback(
        &self,
        id: u32,
        this: HostValue,
        args: Vec<HostValue>,
    ) -> Result<HostValue, BridgeError> {
        if self.pending.borrow().is_some() {
            return Err(BridgeError {
                message: format!(
                    "callback {id} invoked while another pending event is outstanding"
                ),
            });
        }
        *self.pending.borrow_mut() = Some(PendingEvent {
            id,
            this,
            args,
            result: None,
            consumed: false,
        });
        let outcome = self.guest.resume(self);
        let record = self.pending.borrow_mut().take();
        outcome?;
        Ok(record
            .and_then(|event| event.result)
            .unwrap_or(HostValue::Undefined))
    }

    /// Wrap a guest callback id as a host function value, so guest
    /// closures can circulate through the reference table like any other
    /// callable.
    #[must_use]
    pub fn guest_callback(self: &Rc<Self>, id: u32) -> HostValue {
        let bridge = Rc::downgrade(self);
        HostValue::Function(HostFunction::new(format!("guest-callback-{id}"), move |this, args| {
            let Some(bridge) = bridge.upgrade() else {
                return Err(HostException::message("bridge was dropped"));
            };
            bridge
                .invoke_callback(id, this.clone(), args.to_vec())
                .map_err(|err| HostException::message(err.message))
        }))
    }

    /// Resume the guest scheduler without depositing an event, e.g. to
    /// deliver a due timeout.
    pub fn resume_guest(&self) -> Result<(), BridgeError> {
        self.guest.resume(self)
    }

    pub(crate) fn schedule_timeout(&self, millis: i64) -> u32 {
        let id = self.next_timer.get();
        self.next_timer.set(id + 1);
        let deadline = self.env.now_nanos() + millis.max(0) * 1_000_000;
        self.timers.borrow_mut().insert(id, deadline);
        id
    }

    pub(crate) fn clear_timeout(&self, id: u32) {
        self.timers.borrow_mut().remove(&id);
    }

    /// Scheduled timeout ids whose deadline has passed. The embedder
    /// clears each one and resumes the guest to deliver it.
    #[must_use]
    pub fn due_timeouts(&self) -> Vec<u32> {
        let now = self.env.now_nanos();
        self.timers
            .borrow()
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect()
    }

    #[must_use]
    pub fn has_scheduled_timeouts(&self) -> bool {
        !self.timers.borrow().is_empty()
    }

    /// Subscribe to the guest's program-exit notification.
    pub fn on_exit(&self, listener: impl Fn(i32) + 'static) {
        self.exit_listeners.borrow_mut().push(Box::new(listener));
    }

    pub(crate) fn request_exit(&self, code: i32) {
        self.exit_code.set(Some(code));
        for listener in self.exit_listeners.borrow().iter() {
            listener(code);
        }
    }

    /// Exit code reported by the guest, once `runtime.exit` has fired.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.get()
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("imports", &self.imports.borrow().len())
            .field("refs", &self.refs.borrow())
            .field("faulted", &self.faulted.get())
            .field("exit_code", &self.exit_code.get())
            .finish()
    }
}

#[cfg(test)]
mod tests;
