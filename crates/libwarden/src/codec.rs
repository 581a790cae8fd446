//! Wire codec for control messages.
//!
//! A message is a sequence of byte-string fields. On the wire each field is
//! terminated by a NUL byte, so every valid datagram ends in NUL. The first
//! field of an error reply is empty; the second carries a short mnemonic and
//! the third a user-readable description. All other replies start with a
//! non-empty field naming the reply kind.

use std::fmt;

/// Maximum length of a control message, including field terminators.
pub const MSG_MAXLEN: usize = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Badmsg,
    Nomsg,
    Noparams,
    Noprog,
    Noaction,
    Badcmd,
    Eperm,
    Busy,
    Notrunning,
    Nocmd,
}

impl ErrorCode {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Badmsg => "BADMSG",
            Self::Nomsg => "NOMSG",
            Self::Noparams => "NOPARAMS",
            Self::Noprog => "NOPROG",
            Self::Noaction => "NOACTION",
            Self::Badcmd => "BADCMD",
            Self::Eperm => "EPERM",
            Self::Busy => "BUSY",
            Self::Notrunning => "NOTRUNNING",
            Self::Nocmd => "NOCMD",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Badmsg => "Bad message",
            Self::Nomsg => "Empty message",
            Self::Noparams => "Missing parameters",
            Self::Noprog => "No such program",
            Self::Noaction => "No such action",
            Self::Badcmd => "Unknown command",
            Self::Eperm => "Permission denied",
            Self::Busy => "Program already running",
            Self::Notrunning => "Program not running",
            Self::Nocmd => "Action has no command",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum CodecError {
    /// Encoding a message with no fields is a caller error.
    Empty,
    /// The encoded form would exceed [`MSG_MAXLEN`].
    TooLarge(usize),
    /// A received buffer whose final byte is not NUL.
    Malformed,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "refusing to encode empty message"),
            Self::TooLarge(size) => {
                write!(f, "message too large ({size} > {MSG_MAXLEN} bytes)")
            }
            Self::Malformed => write!(f, "message not NUL-terminated"),
        }
    }
}

impl std::error::Error for CodecError {}

/// An ordered sequence of byte-string fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub fields: Vec<Vec<u8>>,
}

impl Message {
    pub fn new(fields: Vec<Vec<u8>>) -> Self {
        Self { fields }
    }

    pub fn from_strs(fields: &[&str]) -> Self {
        Self {
            fields: fields.iter().map(|f| f.as_bytes().to_vec()).collect(),
        }
    }

    /// An error reply: `["", <mnemonic>, <description>]`.
    pub fn error(code: ErrorCode) -> Self {
        Self::from_strs(&["", code.mnemonic(), code.description()])
    }

    /// A success reply carrying a return code: `["OK", <code>]`.
    pub fn ok(code: i32) -> Self {
        Self::from_strs(&["OK", &code.to_string()])
    }

    /// The reserved empty first field marks error replies.
    pub fn is_error(&self) -> bool {
        self.fields.first().is_some_and(|f| f.is_empty())
    }

    pub fn field_str(&self, idx: usize) -> Option<&str> {
        self.fields.get(idx).and_then(|f| std::str::from_utf8(f).ok())
    }

    /// Serialize into the NUL-terminated wire form.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        if self.fields.is_empty() {
            return Err(CodecError::Empty);
        }
        let size: usize = self.fields.iter().map(|f| f.len() + 1).sum();
        if size > MSG_MAXLEN {
            return Err(CodecError::TooLarge(size));
        }
        let mut buf = Vec::with_capacity(size);
        for field in &self.fields {
            buf.extend_from_slice(field);
            buf.push(0);
        }
        Ok(buf)
    }

    /// Parse a received datagram. A zero-length datagram decodes to a
    /// message with no fields; anything else must end in NUL.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.is_empty() {
            return Ok(Self::default());
        }
        if *buf.last().unwrap() != 0 {
            return Err(CodecError::Malformed);
        }
        let fields = buf[..buf.len() - 1]
            .split(|b| *b == 0)
            .map(|f| f.to_vec())
            .collect();
        Ok(Self { fields })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_terminates_every_field() {
        let msg = Message::from_strs(&["PING", "token-42"]);
        assert_eq!(msg.encode().unwrap(), b"PING\0token-42\0");
    }

    #[test]
    fn encode_refuses_empty_message() {
        assert_eq!(Message::default().encode(), Err(CodecError::Empty));
    }

    #[test]
    fn encode_enforces_size_limit() {
        let msg = Message::new(vec![vec![b'x'; MSG_MAXLEN]]);
        assert!(matches!(msg.encode(), Err(CodecError::TooLarge(_))));
    }

    #[test]
    fn decode_rejects_missing_terminator() {
        assert_eq!(Message::decode(b"PING"), Err(CodecError::Malformed));
    }

    #[test]
    fn decode_empty_datagram_yields_no_fields() {
        assert_eq!(Message::decode(b"").unwrap().fields.len(), 0);
    }

    #[test]
    fn decode_preserves_empty_fields() {
        let msg = Message::decode(b"\0EPERM\0Permission denied\0").unwrap();
        assert_eq!(msg.fields.len(), 3);
        assert!(msg.is_error());
        assert_eq!(msg.field_str(1), Some("EPERM"));
    }

    #[test]
    fn roundtrip_keeps_field_boundaries() {
        let msg = Message::from_strs(&["RUN", "hello", "start", ""]);
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn ok_reply_is_not_an_error() {
        let msg = Message::ok(-15);
        assert!(!msg.is_error());
        assert_eq!(msg.field_str(1), Some("-15"));
    }
}
