//! A dedicated error for everything that can go wrong in the engine: I/O,
//! malformed packets, registration misuse, etc.
use std::fmt;
use std::io;
use std::str;

#[derive(Debug)]
pub enum MdnsError {
    Io(io::Error),
    Utf8(str::Utf8Error),

    // wire codec failures; the offending packet is dropped, nothing else
    ShortBuffer,
    BadLabel,
    BadPointer,
    UnknownType(u16),
    PacketMalformed(String),

    // registration / repository misuse
    NameConflict(String),
    DuplicateId(i32),
    UnknownId(i32),
    QuotaExceeded,
}

impl MdnsError {
    // Helper to build a malformed-packet error from a string
    pub fn malformed(s: &str) -> Self {
        MdnsError::PacketMalformed(String::from(s))
    }
}

/// A specific custom `Result` for all functions
pub type MdnsResult<T> = Result<T, MdnsError>;

impl fmt::Display for MdnsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MdnsError::Io(e) => write!(f, "i/o error: {}", e),
            MdnsError::Utf8(e) => write!(f, "label is not valid utf-8: {}", e),
            MdnsError::ShortBuffer => write!(f, "packet shorter than the structure it should hold"),
            MdnsError::BadLabel => write!(f, "label exceeds 63 bytes or name exceeds 255 bytes"),
            MdnsError::BadPointer => write!(f, "compression pointer loop or out-of-range offset"),
            MdnsError::UnknownType(t) => write!(f, "unknown record type {}", t),
            MdnsError::PacketMalformed(s) => write!(f, "malformed packet: {}", s),
            MdnsError::NameConflict(n) => write!(f, "service name already registered: {}", n),
            MdnsError::DuplicateId(id) => write!(f, "service id already registered: {}", id),
            MdnsError::UnknownId(id) => write!(f, "no service registered with id {}", id),
            MdnsError::QuotaExceeded => write!(f, "registration or listener quota exceeded"),
        }
    }
}

impl std::error::Error for MdnsError {}

// All conversions from lower-level errors
impl From<io::Error> for MdnsError {
    fn from(err: io::Error) -> Self {
        MdnsError::Io(err)
    }
}

impl From<str::Utf8Error> for MdnsError {
    fn from(err: str::Utf8Error) -> Self {
        MdnsError::Utf8(err)
    }
}

impl From<std::string::FromUtf8Error> for MdnsError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        MdnsError::Utf8(err.utf8_error())
    }
}
