use std::fmt;

/// Error emitted when the bridge detects a protocol fault.
///
/// A fault is a programming or lifetime error on one side of the ABI
/// boundary (corrupted header, unknown reference id, misuse of a frame
/// cursor). Faults abort the current call; the guest instance must be
/// restarted before the bridge is used again.
#[derive(Debug)]
pub struct BridgeError {
    pub message: String,
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for BridgeError {}

/// Stable error codes for guest-visible, syscall-style operations.
///
/// Unlike a `BridgeError`, an `Errno` is a normal result the guest (or a
/// host caller) is expected to handle. The numeric values are part of the
/// wire contract and must not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Errno {
    Success = 0,
    NotFound = 2,
    Io = 5,
    BadFileDescriptor = 9,
    InvalidArgument = 22,
    Unsupported = 38,
}

impl Errno {
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }

    #[must_use]
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            2 => Some(Self::NotFound),
            5 => Some(Self::Io),
            9 => Some(Self::BadFileDescriptor),
            22 => Some(Self::InvalidArgument),
            38 => Some(Self::Unsupported),
            _ => None,
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Errno::Success => "success",
            Errno::NotFound => "not found",
            Errno::Io => "input/output error",
            Errno::BadFileDescriptor => "bad file descriptor",
            Errno::InvalidArgument => "invalid argument",
            Errno::Unsupported => "operation not supported",
        };
        f.write_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats_message() {
        let err = BridgeError {
            message: "example".into(),
        };
        assert_eq!(format!("{err}"), "example");
    }

    #[test]
    fn errno_codes_round_trip() {
        for errno in [
            Errno::Success,
            Errno::NotFound,
            Errno::Io,
            Errno::BadFileDescriptor,
            Errno::InvalidArgument,
            Errno::Unsupported,
        ] {
            assert_eq!(Errno::from_code(errno.code()), Some(errno));
        }
        assert_eq!(Errno::from_code(-1), None);
    }
}
