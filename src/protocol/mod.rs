//! RESP3 subset: streaming parser and reply generator.
//!
//! Only the wire elements the supported commands require are spoken.
//! Input: array headers, bulk strings, signed integers. Output: map and
//! array headers, bulk strings (with `$-1` nil), simple strings,
//! integers, and `-ERR` errors.

pub mod command;
pub mod stream;

pub use command::Command;
pub use stream::RespStream;

/// RESP type markers.
pub mod markers {
    /// `*` array header.
    pub const ARRAY: u8 = b'*';
    /// `$` bulk string header.
    pub const BULK: u8 = b'$';
    /// `:` integer.
    pub const INTEGER: u8 = b':';
    /// `+` simple string.
    pub const SIMPLE: u8 = b'+';
    /// `-` error.
    pub const ERROR: u8 = b'-';
    /// `%` map header.
    pub const MAP: u8 = b'%';
}

/// Line terminator for every wire element.
pub const CRLF: &[u8] = b"\r\n";
