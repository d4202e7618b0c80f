//! Host environment capabilities handed to the bridge constructor.
//!
//! The guest only ever sees the capabilities listed here; there is no
//! ambient global state to monkey-patch. When a hook is absent the
//! corresponding operation reports `Errno::Unsupported` (or a fixed
//! fallback for clocks), which keeps headless and test configurations
//! deterministic.

use std::cell::Cell;
use std::io::Write as _;
use std::rc::Rc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::errors::Errno;
use crate::value::{HostException, HostFunction, HostObject, HostValue};

type WriteFn = dyn Fn(i64, &[u8]) -> Result<usize, Errno>;
type ClockFn = dyn Fn() -> i64;
type WallClockFn = dyn Fn() -> (i64, i32);
type RandomFn = dyn Fn(&mut [u8]);

/// Capability set for one guest instance.
#[derive(Clone)]
pub struct HostEnv {
    pub write: Option<Rc<WriteFn>>,
    pub monotonic_nanos: Option<Rc<ClockFn>>,
    pub wall_clock: Option<Rc<WallClockFn>>,
    pub random_bytes: Option<Rc<RandomFn>>,
    pub process_id: i64,
    pub argv: Vec<String>,
}

impl HostEnv {
    /// No capabilities at all. Clocks read zero, writes report
    /// `Unsupported`, random bytes stay zeroed.
    #[must_use]
    pub fn empty() -> Self {
        HostEnv {
            write: None,
            monotonic_nanos: None,
            wall_clock: None,
            random_bytes: None,
            process_id: 0,
            argv: Vec::new(),
        }
    }

    /// Capabilities backed by the host process: real clocks, stdout and
    /// stderr file descriptors, and a time-seeded generator for random
    /// bytes.
    #[must_use]
    pub fn host_defaults() -> Self {
        let start = Instant::now();
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or(0x9E37_79B9_7F4A_7C15);
        let state = Cell::new(seed | 1);
        HostEnv {
            write: Some(Rc::new(|fd, data| match fd {
                1 => std::io::stdout()
                    .write(data)
                    .map_err(|_| Errno::Io),
                2 => std::io::stderr()
                    .write(data)
                    .map_err(|_| Errno::Io),
                _ => Err(Errno::BadFileDescriptor),
            })),
            monotonic_nanos: Some(Rc::new(move || start.elapsed().as_nanos() as i64)),
            wall_clock: Some(Rc::new(|| {
                match SystemTime::now().duration_since(UNIX_EPOCH) {
                    Ok(elapsed) => (elapsed.as_secs() as i64, elapsed.subsec_nanos() as i32),
                    Err(_) => (0, 0),
                }
            })),
            random_bytes: Some(Rc::new(move |buffer| {
                for byte in buffer.iter_mut() {
                    // xorshift64*; quality is sufficient for scheduler
                    // seeds, not for key material.
                    let mut x = state.get();
                    x ^= x >> 12;
                    x ^= x << 25;
                    x ^= x >> 27;
                    state.set(x);
                    *byte = (x.wrapping_mul(0x2545_F491_4F6C_DD1D) >> 56) as u8;
                }
            })),
            process_id: std::process::id() as i64,
            argv: std::env::args().collect(),
        }
    }

    pub fn write_fd(&self, fd: i64, data: &[u8]) -> Result<usize, Errno> {
        match &self.write {
            Some(write) => write(fd, data),
            None => Err(Errno::Unsupported),
        }
    }

    #[must_use]
    pub fn now_nanos(&self) -> i64 {
        self.monotonic_nanos
            .as_ref()
            .map(|clock| clock())
            .unwrap_or(0)
    }

    #[must_use]
    pub fn now_wall(&self) -> (i64, i32) {
        self.wall_clock.as_ref().map(|clock| clock()).unwrap_or((0, 0))
    }

    pub fn fill_random(&self, buffer: &mut [u8]) {
        if let Some(random) = &self.random_bytes {
            random(buffer);
        }
    }

    /// Build the guest-visible global object: `fs` and `process` stubs
    /// plus a `console` that writes through the fd sink. Everything the
    /// guest can reach from the global is assembled here, once, from the
    /// explicit capability set.
    #[must_use]
    pub fn global_object(&self) -> HostValue {
        let global = HostObject::new("global");

        let fs = HostObject::new("fs");
        let write_hook = self.write.clone();
        fs.set(
            "write",
            HostValue::Function(HostFunction::new("write", move |_, args| {
                let fd = match args.first() {
                    Some(HostValue::Number(fd)) => *fd as i64,
                    _ => return Err(HostException::message("fs.write expects (fd, bytes)")),
                };
                let Some(HostValue::Bytes(data)) = args.get(1) else {
                    return Err(HostException::message("fs.write expects (fd, bytes)"));
                };
                let sink = write_hook
                    .as_ref()
                    .ok_or_else(|| HostException::message(Errno::Unsupported.to_string()))?;
                let written = sink(fd, &data.borrow())
                    .map_err(|errno| HostException::message(errno.to_string()))?;
                Ok(HostValue::Number(written as f64))
            })),
        );
        global.set("fs", HostValue::Object(fs));

        let process = HostObject::new("process");
        process.set("pid", HostValue::Number(self.process_id as f64));
        process.set(
            "argv",
            HostValue::array(self.argv.iter().map(HostValue::string).collect()),
        );
        global.set("process", HostValue::Object(process));

        let console = HostObject::new("console");
        let log_hook = self.write.clone();
        console.set(
            "log",
            HostValue::Function(HostFunction::new("log", move |_, args| {
                let mut line = args
                    .iter()
                    .map(HostValue::to_text)
                    .collect::<Vec<_>>()
                    .join(" ");
                line.push('\n');
                if let Some(sink) = &log_hook {
                    // Console output is best-effort; a missing fd must
                    // not raise into the guest.
                    let _ = sink(2, line.as_bytes());
                }
                Ok(HostValue::Undefined)
            })),
        );
        global.set("console", HostValue::Object(console));

        HostValue::Object(global)
    }
}

impl std::fmt::Debug for HostEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostEnv")
            .field("write", &self.write.is_some())
            .field("monotonic_nanos", &self.monotonic_nanos.is_some())
            .field("wall_clock", &self.wall_clock.is_some())
            .field("random_bytes", &self.random_bytes.is_some())
            .field("process_id", &self.process_id)
            .field("argv", &self.argv)
            .finish()
    }
}
