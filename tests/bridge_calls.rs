//! End-to-end import dispatch against a scripted guest.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use guestlink::{
    Bridge, BridgeError, BridgeOptions, Buffer, GuestRuntime, HostEnv, SpecValue, TypeSpec,
};

struct ScriptedGuest {
    buffer: RefCell<Buffer>,
    stack_pointer: Cell<u32>,
}

impl ScriptedGuest {
    fn new(memory_len: usize) -> Rc<Self> {
        Rc::new(ScriptedGuest {
            buffer: RefCell::new(Rc::new(RefCell::new(vec![0u8; memory_len]))),
            stack_pointer: Cell::new(0),
        })
    }
}

impl GuestRuntime for ScriptedGuest {
    fn memory(&self) -> Buffer {
        self.buffer.borrow().clone()
    }

    fn stack_pointer(&self) -> Result<u32, BridgeError> {
        Ok(self.stack_pointer.get())
    }

    fn resume(&self, _bridge: &Bridge) -> Result<(), BridgeError> {
        Ok(())
    }
}

#[test]
fn sum2_reads_arguments_and_writes_results_in_order() {
    let guest = ScriptedGuest::new(1024);
    let bridge = Bridge::new(HostEnv::empty(), guest.clone(), BridgeOptions::default());

    bridge.register("pkg.sum2", |_, mut frame| {
        frame.skip_header()?;
        let a = frame.next(&TypeSpec::Int64)?.as_int()?;
        let b = frame.next(&TypeSpec::Int64)?.as_int()?;
        let mut writer = frame.into_writer()?;
        writer.write(&TypeSpec::Int64, &SpecValue::Int(b + 1))?;
        writer.write(&TypeSpec::Int64, &SpecValue::Int(a + b))?;
        Ok(())
    });

    let sp = 128;
    guest.stack_pointer.set(sp);
    let view = bridge.memory();
    view.write_u64(sp + 8, 5).expect("first argument");
    view.write_u64(sp + 16, 7).expect("second argument");

    bridge.dispatch("pkg.sum2", sp as i32).expect("dispatch");

    // Results follow the last argument, each at its own alignment.
    assert_eq!(view.read_u64(sp + 24).expect("first result"), 8);
    assert_eq!(view.read_u64(sp + 32).expect("second result"), 12);
}

#[test]
fn writes_follow_a_relocated_stack_pointer() {
    let guest = ScriptedGuest::new(4096);
    let bridge = Bridge::new(HostEnv::empty(), guest.clone(), BridgeOptions::default());

    let old_sp: u32 = 256;
    let new_sp: u32 = 2048;
    let relocating_guest = guest.clone();
    bridge.register("pkg.reply", move |bridge, mut frame| {
        frame.skip_header()?;
        let request = frame.next(&TypeSpec::Int64)?.as_int()?;
        // A reentrant host→guest call grows the stack and moves the
        // frame; the guest reports the fresh pointer afterwards.
        relocating_guest.stack_pointer.set(new_sp);
        frame.rebase(bridge.guest_stack_pointer()?);
        let mut writer = frame.into_writer()?;
        writer.write(&TypeSpec::Int64, &SpecValue::Int(request * 10))?;
        Ok(())
    });

    guest.stack_pointer.set(old_sp);
    let view = bridge.memory();
    view.write_u64(old_sp + 8, 4).expect("argument");

    bridge.dispatch("pkg.reply", old_sp as i32).expect("dispatch");

    // consumed = header + one i64 argument = 16 bytes.
    assert_eq!(view.read_u64(new_sp + 16).expect("relocated result"), 40);
    assert_eq!(view.read_u64(old_sp + 16).expect("stale slot"), 0);
}

#[test]
fn loader_import_surface_covers_runtime_namespaces() {
    let guest = ScriptedGuest::new(64);
    let bridge = Bridge::new(HostEnv::empty(), guest, BridgeOptions::default());
    bridge.register("pkg.sum2", |_, _| Ok(()));

    let imports = bridge.import_object();
    let runtime = &imports["runtime"];
    for symbol in [
        "exit",
        "fdWrite",
        "nanotime",
        "walltime",
        "randomBytes",
        "notifyMemoryGrowth",
        "scheduleTimeoutEvent",
        "clearTimeoutEvent",
    ] {
        assert!(runtime.contains(&symbol.to_string()), "missing {symbol}");
    }
    let hostref = &imports["hostref"];
    for symbol in ["valueCall", "valueInvoke", "valueNew", "finalizeRef", "stringVal"] {
        assert!(hostref.contains(&symbol.to_string()), "missing {symbol}");
    }
    assert_eq!(imports["pkg"], vec!["sum2".to_string()]);
}
