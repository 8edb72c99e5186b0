//! Module for some utility functions, including debug
//!
use std::io::Cursor;

/// Turn a wireshark-style hex dump into raw bytes. Lines look like
/// `0000   76 86 81 a0 00 01 ...`; the leading offset column is skipped.
/// Used by the packet fixtures in tests.
pub fn get_sample_slice(dump: &str) -> Vec<u8> {
    let mut out = Vec::new();

    for line in dump.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        // first column is the offset, not data
        for (i, tok) in line.split_whitespace().enumerate() {
            if i == 0 && tok.len() > 2 {
                continue;
            }
            if let Ok(b) = u8::from_str_radix(tok, 16) {
                out.push(b);
            }
        }
    }

    out
}

// Debug utility: dump a datagram as 16-byte rows of hex with an ascii
// gutter, the same shape the test fixtures use
pub fn pretty_cursor(buffer: &Cursor<&[u8]>) {
    let data = *buffer.get_ref();
    eprintln!("position={} length={}", buffer.position(), data.len());

    for (row, chunk) in data.chunks(16).enumerate() {
        let mut hex = String::new();
        let mut ascii = String::new();
        for b in chunk {
            hex.push_str(&format!("{:02x} ", b));
            ascii.push(if b.is_ascii_graphic() {
                char::from(*b)
            } else {
                '.'
            });
        }
        eprintln!("{:04x}   {:<48}{}", row * 16, hex, ascii);
    }
}
