//! Built-in import namespaces required by the guest runtime.
//!
//! `runtime.*` carries the guest scheduler's own needs (exit, fd writes,
//! clocks, random bytes, timeout events, memory-growth notification).
//! `hostref.*` carries the value/reference primitives the guest uses to
//! observe and invoke host values. Handlers consume arguments in the
//! guest function's declared parameter order; there is no name-based
//! binding.

use crate::errors::BridgeError;
use crate::stack::StackReader;
use crate::typespec::TypeSpec;
use crate::value::{self, HostException, HostValue};

use super::Bridge;

impl Bridge {
    pub(crate) fn install_runtime_imports(&self) {
        self.register("runtime.notifyMemoryGrowth", notify_memory_growth);
        self.register("runtime.exit", exit);
        self.register("runtime.fdWrite", fd_write);
        self.register("runtime.nanotime", nanotime);
        self.register("runtime.walltime", walltime);
        self.register("runtime.randomBytes", random_bytes);
        self.register("runtime.scheduleTimeoutEvent", schedule_timeout_event);
        self.register("runtime.clearTimeoutEvent", clear_timeout_event);
        self.register("hostref.finalizeRef", finalize_ref);
        self.register("hostref.stringVal", string_val);
        self.register("hostref.valueGet", value_get);
        self.register("hostref.valueSet", value_set);
        self.register("hostref.valueIndex", value_index);
        self.register("hostref.valueSetIndex", value_set_index);
        self.register("hostref.valueCall", value_call);
        self.register("hostref.valueInvoke", value_invoke);
        self.register("hostref.valueNew", value_new);
        self.register("hostref.valueLength", value_length);
        self.register("hostref.prepareString", prepare_string);
        self.register("hostref.loadString", load_string);
        self.register("hostref.copyBytesToGuest", copy_bytes_to_guest);
        self.register("hostref.copyBytesToHost", copy_bytes_to_host);
        self.register("hostref.loadPendingEvent", load_pending_event);
        self.register("hostref.finishPendingEvent", finish_pending_event);
    }
}

fn exception_text(exception: &HostException) -> String {
    match value::property(&exception.value, "message") {
        HostValue::String(text) => text.to_string(),
        _ => exception.value.to_text(),
    }
}

fn notify_memory_growth(bridge: &Bridge, mut frame: StackReader) -> Result<(), BridgeError> {
    frame.skip_header()?;
    bridge.memory().reset(bridge.guest_memory());
    tracing::debug!(
        target: "guestlink.memory",
        len = bridge.memory().len(),
        "rebound memory view after guest growth"
    );
    Ok(())
}

fn exit(bridge: &Bridge, mut frame: StackReader) -> Result<(), BridgeError> {
    frame.skip_header()?;
    let code = frame.next(&TypeSpec::Int32)?.as_int()? as i32;
    bridge.request_exit(code);
    Ok(())
}

fn fd_write(bridge: &Bridge, mut frame: StackReader) -> Result<(), BridgeError> {
    frame.skip_header()?;
    let fd = frame.next(&TypeSpec::Int64)?.as_int()?;
    let ptr = crate::typespec::narrow_ptr(
        frame.next(&TypeSpec::Uintptr)?.as_uint()?,
        "write data pointer",
    )?;
    let len = frame.next(&TypeSpec::Int32)?.as_int()?;
    let len = u32::try_from(len).map_err(|_| BridgeError {
        message: format!("fdWrite received negative length {len}"),
    })?;
    let data = bridge.memory().get(ptr, len)?;
    let mut writer = frame.into_writer()?;
    match bridge.env().write_fd(fd, &data) {
        Ok(written) => {
            writer.write_int(&TypeSpec::Int64, written as i64)?;
            writer.write_int(&TypeSpec::Int32, 0)?;
        }
        Err(errno) => {
            writer.write_int(&TypeSpec::Int64, 0)?;
            writer.write_int(&TypeSpec::Int32, i64::from(errno.code()))?;
        }
    }
    Ok(())
}

fn nanotime(bridge: &Bridge, mut frame: StackReader) -> Result<(), BridgeError> {
    frame.skip_header()?;
    let mut writer = frame.into_writer()?;
    writer.write_int(&TypeSpec::Int64, bridge.env().now_nanos())?;
    Ok(())
}

fn walltime(bridge: &Bridge, mut frame: StackReader) -> Result<(), BridgeError> {
    frame.skip_header()?;
    let (seconds, nanos) = bridge.env().now_wall();
    let mut writer = frame.into_writer()?;
    writer.write_int(&TypeSpec::Int64, seconds)?;
    writer.write_int(&TypeSpec::Int32, i64::from(nanos))?;
    Ok(())
}

fn random_bytes(bridge: &Bridge, mut frame: StackReader) -> Result<(), BridgeError> {
    frame.skip_header()?;
    let (ptr, len) = frame.next_byte_slice()?;
    if len == 0 {
        return Ok(());
    }
    let mut data = vec![0u8; len as usize];
    bridge.env().fill_random(&mut data);
    bridge.memory().set(ptr, &data)
}

fn schedule_timeout_event(bridge: &Bridge, mut frame: StackReader) -> Result<(), BridgeError> {
    frame.skip_header()?;
    let millis = frame.next(&TypeSpec::Int64)?.as_int()?;
    let id = bridge.schedule_timeout(millis);
    let mut writer = frame.into_writer()?;
    writer.write_int(&TypeSpec::Int32, i64::from(id))?;
    Ok(())
}

fn clear_timeout_event(bridge: &Bridge, mut frame: StackReader) -> Result<(), BridgeError> {
    frame.skip_header()?;
    let id = frame.next(&TypeSpec::Int32)?.as_int()?;
    let id = u32::try_from(id).map_err(|_| BridgeError {
        message: format!("clearTimeoutEvent received negative timer id {id}"),
    })?;
    bridge.clear_timeout(id);
    Ok(())
}

fn finalize_ref(bridge: &Bridge, mut frame: StackReader) -> Result<(), BridgeError> {
    frame.skip_header()?;
    let bits = frame.next(&TypeSpec::Ref)?.as_ref_bits()?;
    if let Some(id) = crate::refs::Ref::reading(bits).table_id() {
        bridge.refs().borrow_mut().release(id)?;
    }
    Ok(())
}

fn string_val(bridge: &Bridge, mut frame: StackReader) -> Result<(), BridgeError> {
    frame.skip_header()?;
    let text = frame.next_string()?;
    let mut writer = frame.into_writer()?;
    writer.write_ref(&mut bridge.refs().borrow_mut(), &HostValue::string(text))?;
    Ok(())
}

fn value_get(bridge: &Bridge, mut frame: StackReader) -> Result<(), BridgeError> {
    frame.skip_header()?;
    let target = {
        let refs = bridge.refs().borrow();
        frame.next_ref(&refs)?
    };
    let name = frame.next_string()?;
    let result = value::property(&target, &name);
    frame.rebase(bridge.guest_stack_pointer()?);
    let mut writer = frame.into_writer()?;
    writer.write_ref(&mut bridge.refs().borrow_mut(), &result)?;
    Ok(())
}

fn value_set(bridge: &Bridge, mut frame: StackReader) -> Result<(), BridgeError> {
    frame.skip_header()?;
    let (target, name, new_value) = {
        let refs = bridge.refs().borrow();
        let target = frame.next_ref(&refs)?;
        let name = frame.next_string()?;
        let new_value = frame.next_ref(&refs)?;
        (target, name, new_value)
    };
    value::set_property(&target, &name, new_value).map_err(|exception| BridgeError {
        message: format!("valueSet failed: {}", exception_text(&exception)),
    })
}

fn value_index(bridge: &Bridge, mut frame: StackReader) -> Result<(), BridgeError> {
    frame.skip_header()?;
    let target = {
        let refs = bridge.refs().borrow();
        frame.next_ref(&refs)?
    };
    let position = frame.next(&TypeSpec::Int64)?.as_int()?;
    let position = usize::try_from(position).map_err(|_| BridgeError {
        message: format!("valueIndex received negative index {position}"),
    })?;
    let result = value::index(&target, position);
    frame.rebase(bridge.guest_stack_pointer()?);
    let mut writer = frame.into_writer()?;
    writer.write_ref(&mut bridge.refs().borrow_mut(), &result)?;
    Ok(())
}

fn value_set_index(bridge: &Bridge, mut frame: StackReader) -> Result<(), BridgeError> {
    frame.skip_header()?;
    let (target, position, new_value) = {
        let refs = bridge.refs().borrow();
        let target = frame.next_ref(&refs)?;
        let position = frame.next(&TypeSpec::Int64)?.as_int()?;
        let new_value = frame.next_ref(&refs)?;
        (target, position, new_value)
    };
    let position = usize::try_from(position).map_err(|_| BridgeError {
        message: format!("valueSetIndex received negative index {position}"),
    })?;
    value::set_index(&target, position, new_value).map_err(|exception| BridgeError {
        message: format!("valueSetIndex failed: {}", exception_text(&exception)),
    })
}

/// Generic method invocation: receiver, method name, reference slice of
/// arguments. Host exceptions are caught here and encoded as a result
/// reference plus a `false` success flag; they never unwind across the
/// ABI into the guest's frame.
fn value_call(bridge: &Bridge, mut frame: StackReader) -> Result<(), BridgeError> {
    frame.skip_header()?;
    let (target, method, args) = {
        let refs = bridge.refs().borrow();
        let target = frame.next_ref(&refs)?;
        let method = frame.next_string()?;
        let args = frame.next_ref_slice(&refs)?;
        (target, method, args)
    };
    let outcome = value::call_method(&target, &method, &args);
    // The invocation may have re-entered the guest and relocated its
    // stack; every later access goes through the fresh pointer.
    frame.rebase(bridge.guest_stack_pointer()?);
    write_invocation_result(bridge, frame, outcome)
}

fn value_invoke(bridge: &Bridge, mut frame: StackReader) -> Result<(), BridgeError> {
    frame.skip_header()?;
    let (target, args) = {
        let refs = bridge.refs().borrow();
        let target = frame.next_ref(&refs)?;
        let args = frame.next_ref_slice(&refs)?;
        (target, args)
    };
    let outcome = value::call_function(&target, &HostValue::Undefined, &args);
    frame.rebase(bridge.guest_stack_pointer()?);
    write_invocation_result(bridge, frame, outcome)
}

fn value_new(bridge: &Bridge, mut frame: StackReader) -> Result<(), BridgeError> {
    frame.skip_header()?;
    let (target, args) = {
        let refs = bridge.refs().borrow();
        let target = frame.next_ref(&refs)?;
        let args = frame.next_ref_slice(&refs)?;
        (target, args)
    };
    let outcome = value::construct(&target, &args);
    frame.rebase(bridge.guest_stack_pointer()?);
    write_invocation_result(bridge, frame, outcome)
}

fn write_invocation_result(
    bridge: &Bridge,
    frame: StackReader,
    outcome: Result<HostValue, HostException>,
) -> Result<(), BridgeError> {
    let mut writer = frame.into_writer()?;
    match outcome {
        Ok(result) => {
            writer.write_ref(&mut bridge.refs().borrow_mut(), &result)?;
            writer.write_bool(true)?;
        }
        Err(exception) => {
            writer.write_ref(&mut bridge.refs().borrow_mut(), &exception.value)?;
            writer.write_bool(false)?;
        }
    }
    Ok(())
}

fn value_length(bridge: &Bridge, mut frame: StackReader) -> Result<(), BridgeError> {
    frame.skip_header()?;
    let target = {
        let refs = bridge.refs().borrow();
        frame.next_ref(&refs)?
    };
    let mut writer = frame.into_writer()?;
    writer.write_int(&TypeSpec::Int64, value::length(&target) as i64)?;
    Ok(())
}

fn prepare_string(bridge: &Bridge, mut frame: StackReader) -> Result<(), BridgeError> {
    frame.skip_header()?;
    let target = {
        let refs = bridge.refs().borrow();
        frame.next_ref(&refs)?
    };
    let text = target.to_text();
    let byte_len = text.len() as i64;
    let mut writer = frame.into_writer()?;
    writer.write_ref(&mut bridge.refs().borrow_mut(), &HostValue::string(text))?;
    writer.write_int(&TypeSpec::Int64, byte_len)?;
    Ok(())
}

fn load_string(bridge: &Bridge, mut frame: StackReader) -> Result<(), BridgeError> {
    frame.skip_header()?;
    let target = {
        let refs = bridge.refs().borrow();
        frame.next_ref(&refs)?
    };
    let (ptr, len) = frame.next_byte_slice()?;
    let HostValue::String(text) = target else {
        return Err(BridgeError {
            message: format!("loadString expects a string reference, found {target:?}"),
        });
    };
    let bytes = text.as_bytes();
    if bytes.len() > len as usize {
        return Err(BridgeError {
            message: format!(
                "destination slice of {len} byte(s) cannot hold string of {} byte(s)",
                bytes.len()
            ),
        });
    }
    bridge.memory().set(ptr, bytes)
}

fn copy_bytes_to_guest(bridge: &Bridge, mut frame: StackReader) -> Result<(), BridgeError> {
    frame.skip_header()?;
    let (ptr, len) = frame.next_byte_slice()?;
    let source = {
        let refs = bridge.refs().borrow();
        frame.next_ref(&refs)?
    };
    let mut writer = frame.into_writer()?;
    let HostValue::Bytes(data) = source else {
        writer.write_int(&TypeSpec::Int64, 0)?;
        writer.write_bool(false)?;
        return Ok(());
    };
    let data = data.borrow();
    let copied = data.len().min(len as usize);
    bridge.memory().set(ptr, &data[..copied])?;
    writer.write_int(&TypeSpec::Int64, copied as i64)?;
    writer.write_bool(true)?;
    Ok(())
}

fn copy_bytes_to_host(bridge: &Bridge, mut frame: StackReader) -> Result<(), BridgeError> {
    frame.skip_header()?;
    let destination = {
        let refs = bridge.refs().borrow();
        frame.next_ref(&refs)?
    };
    let (ptr, len) = frame.next_byte_slice()?;
    let mut writer = frame.into_writer()?;
    let HostValue::Bytes(data) = destination else {
        writer.write_int(&TypeSpec::Int64, 0)?;
        writer.write_bool(false)?;
        return Ok(());
    };
    let copied = {
        let mut data = data.borrow_mut();
        let copied = data.len().min(len as usize);
        let bytes = bridge.memory().get(ptr, copied as u32)?;
        data[..copied].copy_from_slice(&bytes);
        copied
    };
    writer.write_int(&TypeSpec::Int64, copied as i64)?;
    writer.write_bool(true)?;
    Ok(())
}

fn load_pending_event(bridge: &Bridge, mut frame: StackReader) -> Result<(), BridgeError> {
    frame.skip_header()?;
    let (has_event, id, this, args) = {
        let mut pending = bridge.pending().borrow_mut();
        match pending.as_mut() {
            Some(event) if !event.consumed => {
                event.consumed = true;
                (
                    true,
                    event.id,
                    event.this.clone(),
                    HostValue::array(event.args.clone()),
                )
            }
            _ => (false, 0, HostValue::Undefined, HostValue::Undefined),
        }
    };
    let mut writer = frame.into_writer()?;
    writer.write_int(&TypeSpec::Int64, i64::from(id))?;
    {
        let mut refs = bridge.refs().borrow_mut();
        writer.write_ref(&mut refs, &this)?;
        writer.write_ref(&mut refs, &args)?;
    }
    writer.write_bool(has_event)?;
    Ok(())
}

fn finish_pending_event(bridge: &Bridge, mut frame: StackReader) -> Result<(), BridgeError> {
    frame.skip_header()?;
    let result = {
        let refs = bridge.refs().borrow();
        frame.next_ref(&refs)?
    };
    let mut pending = bridge.pending().borrow_mut();
    let Some(event) = pending.as_mut() else {
        return Err(BridgeError {
            message: "finishPendingEvent called with no pending event outstanding".into(),
        });
    };
    event.result = Some(result);
    Ok(())
}
