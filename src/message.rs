//! Opcode interpretation for bus payloads.
//!
//! The relay forwards every payload untouched; this module only exists so the
//! log can say something useful about what went past. Decoding is total: any
//! byte slice, including an empty or truncated one, maps to a [`Message`].
//!
//! ```text
//! [u8 opcode] [opcode-specific body]
//! ```
//!
//! Opcodes:
//! - `0x01`: New window — `[u8; 4 IPv4 octets][u16 LE port]`

use std::fmt;
use std::net::Ipv4Addr;

/// Opcode constants.
pub mod opcode {
    /// A window was shared and can be reached at the given address.
    pub const NEW_WINDOW: u8 = 0x01;
}

/// Minimum payload length of a well-formed new-window message.
pub const NEW_WINDOW_LEN: usize = 7;

/// A decoded bus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A window is available at `addr:port`.
    NewWindow {
        /// Address of the sharing host.
        addr: Ipv4Addr,
        /// Port of the sharing host.
        port: u16,
    },
    /// Known opcode, but the payload is too short for it.
    Malformed {
        /// Opcode byte.
        opcode: u8,
        /// Payload length actually received.
        len: usize,
    },
    /// Opcode with no interpretation at this layer.
    Unknown {
        /// Opcode byte.
        opcode: u8,
        /// Bytes following the opcode.
        body: Vec<u8>,
    },
    /// Zero-length payload.
    Empty,
}

impl Message {
    /// Decode a payload. Never fails.
    pub fn decode(payload: &[u8]) -> Self {
        let Some(&opcode) = payload.first() else {
            return Self::Empty;
        };

        match opcode {
            opcode::NEW_WINDOW => {
                if payload.len() < NEW_WINDOW_LEN {
                    return Self::Malformed {
                        opcode,
                        len: payload.len(),
                    };
                }
                let addr = Ipv4Addr::new(payload[1], payload[2], payload[3], payload[4]);
                let port = u16::from_le_bytes([payload[5], payload[6]]);
                Self::NewWindow { addr, port }
            }
            _ => Self::Unknown {
                opcode,
                body: payload[1..].to_vec(),
            },
        }
    }

    /// Encode this message as a payload (without the length header).
    ///
    /// `Malformed` and `Empty` encode to what they describe: the bare opcode
    /// and nothing, respectively.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::NewWindow { addr, port } => {
                let mut payload = Vec::with_capacity(NEW_WINDOW_LEN);
                payload.push(opcode::NEW_WINDOW);
                payload.extend_from_slice(&addr.octets());
                payload.extend_from_slice(&port.to_le_bytes());
                payload
            }
            Self::Unknown { opcode, body } => {
                let mut payload = Vec::with_capacity(1 + body.len());
                payload.push(*opcode);
                payload.extend_from_slice(body);
                payload
            }
            Self::Malformed { opcode, .. } => vec![*opcode],
            Self::Empty => Vec::new(),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NewWindow { addr, port } => write!(f, "new window on {addr}:{port}"),
            Self::Malformed { opcode, len } => {
                write!(f, "malformed message type {opcode}: {len} bytes")
            }
            Self::Unknown { opcode, .. } => write!(f, "unknown message type: {opcode}"),
            Self::Empty => f.write_str("empty message"),
        }
    }
}

/// Human-readable description of a payload, for logging.
pub fn describe(payload: &[u8]) -> String {
    Message::decode(payload).to_string()
}
