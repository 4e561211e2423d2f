//! Wire framing for the relay.
//!
//! A frame is an arbitrary byte sequence terminated by a single NUL byte.
//! Frames follow each other with no other separator:
//!
//! ```text
//! handshake (endpoint -> broker):  <display name> \0
//! chat line (endpoint -> broker):  <body> \0
//! relayed   (broker -> endpoint):  <author> \n <body> \0
//! ```
//!
//! Application text containing a NUL byte cannot be framed; it splits into
//! two frames on the wire.

use crate::error::{ChatError, Result};
use crate::message::Message;
use crate::runtime::ByteStream;

/// Frame terminator.
pub const TERMINATOR: u8 = b'\0';

/// Separates the author from the body in relayed frames.
pub const AUTHOR_SEPARATOR: u8 = b'\n';

/// Author the broker stamps on lines it authors itself.
pub const SERVER_AUTHOR: &str = "server";

/// Rewrite every newline to a terminator in place.
pub fn lines_to_frames(bytes: &mut [u8]) {
    for b in bytes.iter_mut().filter(|b| **b == AUTHOR_SEPARATOR) {
        *b = TERMINATOR;
    }
}

/// Append `<author>\n<body>\0` to `out`.
pub fn encode_relayed(out: &mut ByteStream, author: &[u8], body: &[u8]) -> Result<()> {
    out.push(author)?;
    out.push(&[AUTHOR_SEPARATOR])?;
    out.push(body)?;
    out.push(&[TERMINATOR])
}

/// Append a handshake frame carrying `name`.
pub fn encode_handshake(out: &mut ByteStream, name: &str) -> Result<()> {
    validate_name(name)?;
    out.push(name.as_bytes())?;
    out.push(&[TERMINATOR])
}

/// Display names must fit in one frame and carry no author separator.
pub fn validate_name(name: &str) -> Result<()> {
    if name.bytes().any(|b| b == TERMINATOR || b == AUTHOR_SEPARATOR) {
        return Err(ChatError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Split a relayed frame (terminator already stripped) on its first newline.
pub fn decode_relayed(frame: &[u8]) -> Result<Message> {
    let split = frame
        .iter()
        .position(|&b| b == AUTHOR_SEPARATOR)
        .ok_or(ChatError::MalformedFrame)?;
    let author = String::from_utf8_lossy(&frame[..split]);
    let body = String::from_utf8_lossy(&frame[split + 1..]);
    Ok(Message::new(author, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relayed_round_trip() {
        let mut out = ByteStream::new();
        encode_relayed(&mut out, b"alice", b"hello").unwrap();
        assert_eq!(out.as_bytes(), b"alice\nhello\0");

        let frame = out.next_frame().unwrap();
        let message = decode_relayed(&frame).unwrap();
        assert_eq!(message.author(), "alice");
        assert_eq!(message.body(), "hello");
    }

    #[test]
    fn test_decode_splits_on_first_newline() {
        let message = decode_relayed(b"bob\nline one\nline two").unwrap();
        assert_eq!(message.author(), "bob");
        assert_eq!(message.body(), "line one\nline two");
    }

    #[test]
    fn test_decode_empty_parts() {
        let message = decode_relayed(b"\n").unwrap();
        assert_eq!(message.author(), "");
        assert_eq!(message.body(), "");
    }

    #[test]
    fn test_decode_without_separator_is_malformed() {
        assert!(matches!(
            decode_relayed(b"no separator"),
            Err(ChatError::MalformedFrame)
        ));
    }

    #[test]
    fn test_lines_to_frames() {
        let mut text = b"hello\nworld\n".to_vec();
        lines_to_frames(&mut text);
        assert_eq!(text, b"hello\0world\0");

        lines_to_frames(&mut text);
        assert_eq!(text, b"hello\0world\0");
    }

    #[test]
    fn test_handshake() {
        let mut out = ByteStream::new();
        encode_handshake(&mut out, "alice").unwrap();
        assert_eq!(out.as_bytes(), b"alice\0");

        assert!(matches!(
            encode_handshake(&mut out, "al\nice"),
            Err(ChatError::InvalidName(_))
        ));
        assert!(validate_name("a\0b").is_err());
    }
}
