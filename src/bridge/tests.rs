use super::*;
use crate::typespec::TypeSpec;
use crate::value::HostObject;

use std::cell::Cell;

/// Scripted guest: fixed stack pointer, swappable memory buffer, and an
/// optional resume hook standing in for the guest scheduler.
struct FakeGuest {
    buffer: RefCell<Buffer>,
    stack_pointer: Cell<u32>,
    on_resume: RefCell<Option<Rc<dyn Fn(&Bridge) -> Result<(), BridgeError>>>>,
}

impl FakeGuest {
    fn new(memory_len: usize) -> Rc<Self> {
        Rc::new(FakeGuest {
            buffer: RefCell::new(Rc::new(RefCell::new(vec![0u8; memory_len]))),
            stack_pointer: Cell::new(0),
            on_resume: RefCell::new(None),
        })
    }

    fn set_stack_pointer(&self, stack_pointer: u32) {
        self.stack_pointer.set(stack_pointer);
    }

    fn replace_memory(&self, memory_len: usize) {
        *self.buffer.borrow_mut() = Rc::new(RefCell::new(vec![0u8; memory_len]));
    }

    fn set_resume(&self, hook: impl Fn(&Bridge) -> Result<(), BridgeError> + 'static) {
        *self.on_resume.borrow_mut() = Some(Rc::new(hook));
    }
}

impl GuestRuntime for FakeGuest {
    fn memory(&self) -> Buffer {
        self.buffer.borrow().clone()
    }

    fn stack_pointer(&self) -> Result<u32, BridgeError> {
        Ok(self.stack_pointer.get())
    }

    fn resume(&self, bridge: &Bridge) -> Result<(), BridgeError> {
        let hook = self.on_resume.borrow().clone();
        match hook {
            Some(hook) => hook(bridge),
            None => Ok(()),
        }
    }
}

fn bridge_with_guest(memory_len: usize) -> (Bridge, Rc<FakeGuest>) {
    let guest = FakeGuest::new(memory_len);
    let bridge = Bridge::new(HostEnv::empty(), guest.clone(), BridgeOptions::default());
    (bridge, guest)
}

fn store_ref(bridge: &Bridge, addr: u32, value: &HostValue) {
    let reference = bridge.refs().borrow_mut().encode(value);
    bridge
        .memory()
        .set(addr, &reference.encoded_bytes().expect("encode data"))
        .expect("store ref");
}

fn store_string(bridge: &Bridge, header_addr: u32, data_addr: u32, text: &str) {
    let view = bridge.memory();
    view.set(data_addr, text.as_bytes()).expect("string data");
    view.write_u64(header_addr, u64::from(data_addr)).expect("data ptr");
    view.write_u64(header_addr + 8, text.len() as u64).expect("len");
}

fn store_slice_header(bridge: &Bridge, header_addr: u32, data_addr: u32, len: u64) {
    let view = bridge.memory();
    view.write_u64(header_addr, u64::from(data_addr)).expect("data ptr");
    view.write_u64(header_addr + 8, len).expect("len");
    view.write_u64(header_addr + 16, len).expect("cap");
}

#[test]
fn value_call_invokes_method_and_reports_success() {
    let (bridge, guest) = bridge_with_guest(1024);
    let sp = 64;
    guest.set_stack_pointer(sp);

    let object = HostObject::new("calc");
    object.set(
        "double",
        HostValue::Function(HostFunction::new("double", |_, args| {
            let HostValue::Number(n) = args[0] else {
                return Err(HostException::message("expected a number"));
            };
            Ok(HostValue::Number(n * 2.0))
        })),
    );
    let target = HostValue::Object(object);

    // Frame: header, target ref, method name string, argument ref slice.
    store_ref(&bridge, sp + 8, &target);
    store_string(&bridge, sp + 16, 512, "double");
    store_slice_header(&bridge, sp + 32, 640, 1);
    bridge
        .memory()
        .write_u64(640, 21.0f64.to_bits())
        .expect("inline arg");

    bridge
        .dispatch("hostref.valueCall", sp as i32)
        .expect("dispatch");

    let result_bits = bridge.memory().read_u64(sp + 56).expect("result ref");
    let result = bridge.refs().borrow().decode(result_bits).expect("decode");
    assert_eq!(result, HostValue::Number(42.0));
    assert_eq!(bridge.memory().read_u8(sp + 64).expect("success"), 1);
}

#[test]
fn value_call_encodes_host_exception_as_failure() {
    let (bridge, guest) = bridge_with_guest(1024);
    let sp = 64;
    guest.set_stack_pointer(sp);

    let target = HostValue::Object(HostObject::new("empty"));
    store_ref(&bridge, sp + 8, &target);
    store_string(&bridge, sp + 16, 512, "missing");
    store_slice_header(&bridge, sp + 32, 640, 0);

    bridge
        .dispatch("hostref.valueCall", sp as i32)
        .expect("dispatch");

    assert_eq!(bridge.memory().read_u8(sp + 64).expect("success"), 0);
    let error_bits = bridge.memory().read_u64(sp + 56).expect("error ref");
    let error = bridge.refs().borrow().decode(error_bits).expect("decode");
    let message = crate::value::property(&error, "message");
    let HostValue::String(text) = message else {
        panic!("expected message slot, found {message:?}");
    };
    assert!(text.contains("missing"), "unexpected message: {text}");
    // The call itself succeeded at the protocol level.
    assert!(!bridge.is_faulted());
}

#[test]
fn exit_import_records_code_and_notifies_listeners() {
    let (bridge, _guest) = bridge_with_guest(256);
    let seen = Rc::new(Cell::new(None));
    let listener_seen = seen.clone();
    bridge.on_exit(move |code| listener_seen.set(Some(code)));

    bridge
        .memory()
        .write(&TypeSpec::Int32, 8, &crate::typespec::SpecValue::Int(3))
        .expect("exit code");
    bridge.dispatch("runtime.exit", 0).expect("dispatch");

    assert_eq!(bridge.exit_code(), Some(3));
    assert_eq!(seen.get(), Some(3));
}

#[test]
fn memory_growth_rebinds_the_view() {
    let (bridge, guest) = bridge_with_guest(256);
    assert_eq!(bridge.memory().len(), 256);

    guest.replace_memory(4096);
    bridge
        .dispatch("runtime.notifyMemoryGrowth", 0)
        .expect("dispatch");
    assert_eq!(bridge.memory().len(), 4096);
}

#[test]
fn unknown_import_faults_and_latches() {
    let (bridge, _guest) = bridge_with_guest(256);
    let err = bridge.dispatch("pkg.unknown", 0).expect_err("unknown import");
    assert!(
        err.message.contains("no import handler"),
        "unexpected error message: {}",
        err.message
    );
    assert!(bridge.is_faulted());

    let err = bridge.dispatch("runtime.nanotime", 0).expect_err("faulted");
    assert!(
        err.message.contains("already faulted"),
        "unexpected error message: {}",
        err.message
    );
}

#[test]
fn fd_write_routes_through_env_sink() {
    let guest = FakeGuest::new(512);
    let sink: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let captured = sink.clone();
    let mut env = HostEnv::empty();
    env.write = Some(Rc::new(move |fd, data| {
        if fd != 1 {
            return Err(crate::errors::Errno::BadFileDescriptor);
        }
        captured.borrow_mut().extend_from_slice(data);
        Ok(data.len())
    }));
    let bridge = Bridge::new(env, guest, BridgeOptions::default());

    bridge.memory().set(256, b"hi").expect("payload");
    let view = bridge.memory();
    view.write_u64(8, 1).expect("fd");
    view.write_u64(16, 256).expect("ptr");
    view.write_u32(24, 2).expect("len");
    bridge.dispatch("runtime.fdWrite", 0).expect("dispatch");

    assert_eq!(sink.borrow().as_slice(), b"hi");
    // Results: written count, then errno 0.
    assert_eq!(view.read_u64(32).expect("written"), 2);
    assert_eq!(view.read_u32(40).expect("errno"), 0);

    // A bad descriptor surfaces the stable errno instead of faulting.
    view.write_u64(8, 7).expect("fd");
    bridge.dispatch("runtime.fdWrite", 0).expect("dispatch");
    assert_eq!(view.read_u64(32).expect("written"), 0);
    assert_eq!(
        view.read_u32(40).expect("errno"),
        crate::errors::Errno::BadFileDescriptor.code() as u32
    );
}

#[test]
fn string_val_and_finalize_ref_manage_lifetimes() {
    let (bridge, _guest) = bridge_with_guest(512);
    store_string(&bridge, 8, 256, "hello");

    bridge.dispatch("hostref.stringVal", 0).expect("first");
    let bits = bridge.memory().read_u64(24).expect("ref");
    let id = crate::refs::Ref::reading(bits).table_id().expect("boxed");
    assert_eq!(bridge.refs().borrow().count(id), Some(1));

    bridge.dispatch("hostref.stringVal", 0).expect("second");
    assert_eq!(bridge.refs().borrow().count(id), Some(2));

    // finalizeRef frame: the reference bits as the only argument.
    bridge.memory().write_u64(136, bits).expect("finalize arg");
    bridge.dispatch("hostref.finalizeRef", 128).expect("release");
    assert_eq!(bridge.refs().borrow().count(id), Some(1));
    bridge.dispatch("hostref.finalizeRef", 128).expect("release");
    assert!(bridge.refs().borrow().get(id).is_err());
}

#[test]
fn timeout_events_schedule_and_clear() {
    let (bridge, _guest) = bridge_with_guest(256);
    let view = bridge.memory();
    view.write_u64(8, 0).expect("millis");
    bridge
        .dispatch("runtime.scheduleTimeoutEvent", 0)
        .expect("schedule");
    let id = view.read_u32(16).expect("timer id");
    assert!(bridge.has_scheduled_timeouts());
    // The empty env clock reads zero, so a zero-delay timer is due.
    assert_eq!(bridge.due_timeouts(), vec![id]);

    view.write_u32(136, id).expect("clear arg");
    bridge
        .dispatch("runtime.clearTimeoutEvent", 128)
        .expect("clear");
    assert!(!bridge.has_scheduled_timeouts());
}

#[test]
fn callbacks_travel_through_the_pending_event() {
    let (bridge, guest) = bridge_with_guest(2048);
    guest.set_resume(|bridge| {
        // The guest drains the record...
        bridge.dispatch("hostref.loadPendingEvent", 512)?;
        let view = bridge.memory();
        assert_eq!(view.read_u64(520).expect("event id"), 7);
        assert_eq!(view.read_u8(544).expect("has event"), 1);
        let this_bits = view.read_u64(528).expect("this ref");
        assert_eq!(
            bridge.refs().borrow().decode(this_bits).expect("this"),
            HostValue::Undefined
        );
        // ...and writes a result back into it.
        view.write_u64(648, 99.0f64.to_bits()).expect("result arg");
        bridge.dispatch("hostref.finishPendingEvent", 640)
    });

    let result = bridge
        .invoke_callback(7, HostValue::Undefined, vec![HostValue::Number(1.0)])
        .expect("callback");
    assert_eq!(result, HostValue::Number(99.0));
    // The record was consumed with the cycle.
    assert!(bridge.pending().borrow().is_none());
}

#[test]
fn second_load_in_one_cycle_sees_no_event() {
    let (bridge, guest) = bridge_with_guest(2048);
    guest.set_resume(|bridge| {
        bridge.dispatch("hostref.loadPendingEvent", 512)?;
        assert_eq!(bridge.memory().read_u8(544).expect("has event"), 1);
        bridge.dispatch("hostref.loadPendingEvent", 1024)?;
        assert_eq!(bridge.memory().read_u8(1056).expect("drained"), 0);
        Ok(())
    });
    bridge
        .invoke_callback(3, HostValue::Undefined, Vec::new())
        .expect("callback");
}

#[test]
fn import_object_groups_symbols_by_package() {
    let (bridge, _guest) = bridge_with_guest(64);
    bridge.register("main.sum2", |_, _| Ok(()));
    let imports = bridge.import_object();
    assert_eq!(imports["main"], vec!["sum2".to_string()]);
    assert!(imports["runtime"].contains(&"exit".to_string()));
    assert!(imports["hostref"].contains(&"valueCall".to_string()));
}

#[test]
fn guest_callback_value_is_invocable() {
    let (bridge, guest) = bridge_with_guest(2048);
    let bridge = Rc::new(bridge);
    guest.set_resume(|bridge| {
        bridge.dispatch("hostref.loadPendingEvent", 512)?;
        bridge.memory().write_u64(648, 5.0f64.to_bits()).expect("result");
        bridge.dispatch("hostref.finishPendingEvent", 640)
    });

    let callback = bridge.guest_callback(11);
    let result = crate::value::call_function(&callback, &HostValue::Undefined, &[])
        .expect("guest callback");
    assert_eq!(result, HostValue::Number(5.0));
}
