//! The log frame codec. Commands are encoded as RESP inline arrays so the
//! log can be read by any RESP-aware tool, and the encoder is byte-exact:
//! the same command sequence always produces the same bytes.
//!
//! Exactly three frames exist:
//!
//! - `*3 set <key> <value>`
//! - `*5 set <key> <value> ex <seconds>`
//! - `*2 del <key>`
//!
//! The parser accepts precisely this grammar and rejects everything else,
//! distinguishing a structurally wrong frame (bad marker, verb, arity)
//! from a frame the input merely cut short, so the reader can treat the
//! latter as a torn tail left by an interrupted append.

use std::io::Read;
use std::sync::Arc;
use std::time::Instant;

use crate::error::Error;
use crate::item::Item;

/// A single durable operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Command {
    Set {
        key: String,
        value: String,
        /// Remaining TTL in whole seconds at encode time. Zero means the
        /// item is already expired; replay deletes the key.
        ex: Option<u64>,
    },
    Del {
        key: String,
    },
}

impl Command {
    pub fn set(key: &str, value: &str) -> Self {
        Command::Set {
            key: key.to_string(),
            value: value.to_string(),
            ex: None,
        }
    }

    pub fn del(key: &str) -> Self {
        Command::Del {
            key: key.to_string(),
        }
    }

    /// The command that recreates `item`, with any TTL rounded to the
    /// nearest whole second of time remaining at `now`.
    pub fn from_item(item: &Arc<Item>, now: Instant) -> Self {
        let ex = item.expires_at.map(|at| {
            let remaining = at.saturating_duration_since(now);
            (remaining.as_millis() as u64 + 500) / 1000
        });
        Command::Set {
            key: item.key.clone(),
            value: item.value.clone(),
            ex,
        }
    }

    /// Appends the RESP encoding of this command to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Command::Set { key, value, ex: None } => {
                write_array(buf, &["set", key.as_str(), value.as_str()]);
            }
            Command::Set {
                key,
                value,
                ex: Some(seconds),
            } => {
                let seconds = seconds.to_string();
                write_array(
                    buf,
                    &["set", key.as_str(), value.as_str(), "ex", seconds.as_str()],
                );
            }
            Command::Del { key } => {
                write_array(buf, &["del", key.as_str()]);
            }
        }
    }
}

fn write_array(buf: &mut Vec<u8>, parts: &[&str]) {
    buf.extend_from_slice(format!("*{}\r\n", parts.len()).as_bytes());
    for part in parts {
        buf.extend_from_slice(format!("${}\r\n", part.len()).as_bytes());
        buf.extend_from_slice(part.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
}

/// Why a frame could not be read.
#[derive(Debug)]
pub(crate) enum FrameError {
    /// The input ended partway through a frame. Everything before the
    /// frame is intact; the reader may cut the tail off and recover.
    Truncated,
    /// The frame bytes are malformed or unreadable. The log as a whole is
    /// not trustworthy.
    Failed(Error),
}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        FrameError::Failed(Error::Io(err.to_string()))
    }
}

fn invalid(msg: String) -> FrameError {
    FrameError::Failed(Error::Invalid(msg))
}

/// Reads the next frame from `reader`. Returns `None` on a clean
/// end-of-file at a frame boundary and `FrameError::Truncated` when the
/// end of input lands inside a frame.
pub(crate) fn read_command(reader: &mut impl Read) -> Result<Option<Command>, FrameError> {
    let Some(first) = read_byte(reader)? else {
        return Ok(None);
    };
    if first != b'*' {
        return Err(invalid(format!(
            "expected frame marker, got {:?}",
            first as char
        )));
    }
    let count = read_length(reader)?;
    if count == 0 {
        return Err(invalid("empty command frame".to_string()));
    }
    let mut parts = Vec::with_capacity(count);
    for _ in 0..count {
        parts.push(read_bulk_string(reader)?);
    }
    interpret(parts).map(Some)
}

fn interpret(parts: Vec<String>) -> Result<Command, FrameError> {
    let verb = parts[0].to_ascii_lowercase();
    match (verb.as_str(), parts.len()) {
        ("set", 3) => Ok(Command::Set {
            key: parts[1].clone(),
            value: parts[2].clone(),
            ex: None,
        }),
        ("set", 5) => {
            if !parts[3].eq_ignore_ascii_case("ex") {
                return Err(invalid(format!("unknown set option {:?}", parts[3])));
            }
            let seconds: i64 = parts[4]
                .parse()
                .map_err(|_| invalid(format!("bad expiry seconds {:?}", parts[4])))?;
            Ok(Command::Set {
                key: parts[1].clone(),
                value: parts[2].clone(),
                ex: Some(seconds.max(0) as u64),
            })
        }
        ("del", 2) => Ok(Command::Del {
            key: parts[1].clone(),
        }),
        (_, _) => Err(invalid(format!(
            "unknown command {:?} with {} parts",
            parts[0],
            parts.len()
        ))),
    }
}

fn read_byte(reader: &mut impl Read) -> Result<Option<u8>, FrameError> {
    let mut byte = [0u8; 1];
    match reader.read_exact(&mut byte) {
        Ok(()) => Ok(Some(byte[0])),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn require_byte(reader: &mut impl Read) -> Result<u8, FrameError> {
    read_byte(reader)?.ok_or(FrameError::Truncated)
}

/// Reads ASCII digits terminated by `\r\n`.
fn read_length(reader: &mut impl Read) -> Result<usize, FrameError> {
    let mut digits = Vec::new();
    loop {
        let byte = require_byte(reader)?;
        if byte == b'\r' {
            break;
        }
        if !byte.is_ascii_digit() {
            return Err(invalid(format!("expected digit, got {:?}", byte as char)));
        }
        digits.push(byte);
    }
    if require_byte(reader)? != b'\n' {
        return Err(invalid("missing newline after length".to_string()));
    }
    if digits.is_empty() {
        return Err(invalid("missing length".to_string()));
    }
    std::str::from_utf8(&digits)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| invalid("length out of range".to_string()))
}

fn read_bulk_string(reader: &mut impl Read) -> Result<String, FrameError> {
    if require_byte(reader)? != b'$' {
        return Err(invalid("expected bulk string marker".to_string()));
    }
    let len = read_length(reader)?;
    let mut payload = vec![0u8; len];
    match reader.read_exact(&mut payload) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::Truncated);
        }
        Err(e) => return Err(e.into()),
    }
    if require_byte(reader)? != b'\r' || require_byte(reader)? != b'\n' {
        return Err(invalid("missing terminator after bulk string".to_string()));
    }
    String::from_utf8(payload).map_err(|_| invalid("bulk string is not utf-8".to_string()))
}
