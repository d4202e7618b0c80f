//! Hex/ASCII rendering of guest memory ranges for diagnostics.

use crate::errors::BridgeError;

/// Render `len` bytes starting at `addr` as hex and printable-ASCII
/// columns, `width` bytes per row. Non-printable bytes show as `.` in
/// the gutter. Pure formatting; an out-of-range request is a fault.
pub fn hex_dump(mem: &[u8], addr: u32, len: u32, width: usize) -> Result<String, BridgeError> {
    if width == 0 {
        return Err(BridgeError {
            message: "hex dump width must be at least one byte per row".into(),
        });
    }
    let start = addr as usize;
    let end = start + len as usize;
    if end > mem.len() {
        return Err(BridgeError {
            message: format!(
                "hex dump of {len} byte(s) at 0x{addr:08X} exceeds linear memory bounds"
            ),
        });
    }

    let mut out = String::new();
    for (row, chunk) in mem[start..end].chunks(width).enumerate() {
        let row_addr = start + row * width;
        out.push_str(&format!("0x{row_addr:08x}  "));
        for column in 0..width {
            match chunk.get(column) {
                Some(byte) => out.push_str(&format!("{byte:02x} ")),
                None => out.push_str("   "),
            }
        }
        out.push(' ');
        out.push('|');
        for byte in chunk {
            out.push(printable(*byte));
        }
        out.push('|');
        out.push('\n');
    }
    Ok(out)
}

fn printable(byte: u8) -> char {
    if (0x21..=0x7e).contains(&byte) {
        byte as char
    } else {
        '.'
    }
}
