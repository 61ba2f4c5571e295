//! TFTP wire codec (RFC 1350, RFC 2347)
//!
//! All 16-bit fields are big-endian. Strings are NUL-terminated; their
//! length is bounded only by the datagram.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const DEFAULT_BLOCK_SIZE: usize = 512; // RFC 1350 standard block size
pub const MAX_BLOCK_SIZE: usize = 65464; // RFC 2348 maximum block size
pub const MAX_PACKET_SIZE: usize = MAX_BLOCK_SIZE + 4; // Max block size + 4 byte header

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Rrq = 1,   // Read request (RFC 1350)
    Wrq = 2,   // Write request (RFC 1350)
    Data = 3,  // Data packet (RFC 1350)
    Ack = 4,   // Acknowledgment (RFC 1350)
    Error = 5, // Error packet (RFC 1350)
    Oack = 6,  // Option acknowledgment (RFC 2347)
}

impl TryFrom<u16> for Opcode {
    type Error = DecodeError;

    fn try_from(value: u16) -> std::result::Result<Self, <Self as TryFrom<u16>>::Error> {
        match value {
            1 => Ok(Opcode::Rrq),
            2 => Ok(Opcode::Wrq),
            3 => Ok(Opcode::Data),
            4 => Ok(Opcode::Ack),
            5 => Ok(Opcode::Error),
            6 => Ok(Opcode::Oack),
            _ => Err(DecodeError::UnknownOpcode(value)),
        }
    }
}

// RFC 1350 - TFTP Error Codes (only the first three are emitted by the server)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum ErrorCode {
    NotDefined = 0,      // Not defined, see error message
    FileNotFound = 1,    // File not found
    AccessViolation = 2, // Access violation
}

/// One decoded TFTP datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Read request. `options` keeps the client's order and name case.
    Rrq {
        filename: String,
        mode: String,
        options: Vec<(String, String)>,
    },
    Data {
        block: u16,
        payload: Bytes,
    },
    Ack {
        block: u16,
    },
    Error {
        code: i16,
        message: String,
    },
    Oack {
        options: Vec<(String, String)>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("packet too short ({0} bytes)")]
    TooShort(usize),

    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),

    #[error("unsupported request {0:?}")]
    Unsupported(Opcode),

    #[error("no NUL terminator found in {0}")]
    Unterminated(&'static str),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("option {0:?} has no value")]
    DanglingOption(String),
}

impl Packet {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Packet::Error {
            code: code as i16,
            message: message.into(),
        }
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Packet::Rrq { .. } => Opcode::Rrq,
            Packet::Data { .. } => Opcode::Data,
            Packet::Ack { .. } => Opcode::Ack,
            Packet::Error { .. } => Opcode::Error,
            Packet::Oack { .. } => Opcode::Oack,
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < 2 {
            return Err(DecodeError::TooShort(data.len()));
        }

        let mut bytes = BytesMut::from(data);
        let opcode = Opcode::try_from(bytes.get_u16())?;

        match opcode {
            Opcode::Rrq => {
                let filename = parse_string(&mut bytes, "filename")?;
                let mode = parse_string(&mut bytes, "mode")?;
                let options = parse_options(&mut bytes)?;
                Ok(Packet::Rrq {
                    filename,
                    mode,
                    options,
                })
            }
            Opcode::Wrq => Err(DecodeError::Unsupported(Opcode::Wrq)),
            Opcode::Data => {
                if bytes.remaining() < 2 {
                    return Err(DecodeError::TooShort(data.len()));
                }
                let block = bytes.get_u16();
                Ok(Packet::Data {
                    block,
                    payload: bytes.freeze(),
                })
            }
            Opcode::Ack => {
                if bytes.remaining() < 2 {
                    return Err(DecodeError::TooShort(data.len()));
                }
                Ok(Packet::Ack {
                    block: bytes.get_u16(),
                })
            }
            Opcode::Error => {
                if bytes.remaining() < 2 {
                    return Err(DecodeError::TooShort(data.len()));
                }
                let code = bytes.get_i16();
                // Some clients omit the trailing NUL
                let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                let message = String::from_utf8_lossy(&bytes[..end]).into_owned();
                Ok(Packet::Error { code, message })
            }
            Opcode::Oack => Ok(Packet::Oack {
                options: parse_options(&mut bytes)?,
            }),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut packet = BytesMut::new();
        packet.put_u16(self.opcode() as u16);

        match self {
            Packet::Rrq {
                filename,
                mode,
                options,
            } => {
                put_string(&mut packet, filename);
                put_string(&mut packet, mode);
                put_options(&mut packet, options);
            }
            Packet::Data { block, payload } => {
                packet.reserve(2 + payload.len());
                packet.put_u16(*block);
                packet.put_slice(payload);
            }
            Packet::Ack { block } => packet.put_u16(*block),
            Packet::Error { code, message } => {
                packet.put_i16(*code);
                put_string(&mut packet, message);
            }
            Packet::Oack { options } => put_options(&mut packet, options),
        }

        packet.freeze()
    }
}

fn parse_string(bytes: &mut BytesMut, field: &'static str) -> Result<String, DecodeError> {
    let null_pos = bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or(DecodeError::Unterminated(field))?;

    let string_bytes = bytes.split_to(null_pos);
    bytes.advance(1); // Skip the null terminator

    String::from_utf8(string_bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8(field))
}

fn parse_options(bytes: &mut BytesMut) -> Result<Vec<(String, String)>, DecodeError> {
    let mut options = Vec::new();
    while bytes.has_remaining() {
        let name = parse_string(bytes, "option name")?;
        if !bytes.has_remaining() {
            return Err(DecodeError::DanglingOption(name));
        }
        let value = parse_string(bytes, "option value")?;
        options.push((name, value));
    }
    Ok(options)
}

fn put_string(packet: &mut BytesMut, value: &str) {
    packet.put_slice(value.as_bytes());
    packet.put_u8(0);
}

fn put_options(packet: &mut BytesMut, options: &[(String, String)]) {
    for (name, value) in options {
        put_string(packet, name);
        put_string(packet, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rrq_bytes(parts: &[&str]) -> Vec<u8> {
        let mut data = vec![0, 1];
        for part in parts {
            data.extend_from_slice(part.as_bytes());
            data.push(0);
        }
        data
    }

    #[test]
    fn decodes_rrq_without_options() {
        let packet = Packet::decode(&rrq_bytes(&["pxelinux.0", "octet"])).unwrap();
        assert_eq!(
            packet,
            Packet::Rrq {
                filename: "pxelinux.0".to_string(),
                mode: "octet".to_string(),
                options: vec![],
            }
        );
    }

    #[test]
    fn decodes_rrq_options_in_client_order_and_case() {
        let data = rrq_bytes(&["boot/grub.cfg", "octet", "TSize", "0", "blksize", "1428", "x-foo", "1"]);
        let Packet::Rrq { options, .. } = Packet::decode(&data).unwrap() else {
            panic!("expected RRQ");
        };
        assert_eq!(
            options,
            vec![
                ("TSize".to_string(), "0".to_string()),
                ("blksize".to_string(), "1428".to_string()),
                ("x-foo".to_string(), "1".to_string()),
            ]
        );
    }

    #[test]
    fn rejects_option_without_value() {
        let mut data = rrq_bytes(&["f", "octet", "blksize"]);
        assert!(matches!(
            Packet::decode(&data),
            Err(DecodeError::DanglingOption(name)) if name == "blksize"
        ));

        data.extend_from_slice(b"1024");
        assert_eq!(
            Packet::decode(&data),
            Err(DecodeError::Unterminated("option value"))
        );
    }

    #[test]
    fn rejects_unterminated_filename() {
        assert_eq!(
            Packet::decode(&[0, 1, b'a', b'b']),
            Err(DecodeError::Unterminated("filename"))
        );
    }

    #[test]
    fn accepts_long_filenames() {
        let long = format!("images/{}/vmlinuz", "d".repeat(480));
        match Packet::decode(&rrq_bytes(&[&long, "octet", "tsize", "0"])) {
            Ok(Packet::Rrq {
                filename, options, ..
            }) => {
                assert_eq!(filename, long);
                assert_eq!(options, vec![("tsize".to_string(), "0".to_string())]);
            }
            other => panic!("expected RRQ, got {:?}", other),
        }
    }

    #[test]
    fn classifies_opcodes() {
        assert_eq!(Packet::decode(&[0]), Err(DecodeError::TooShort(1)));
        assert_eq!(Packet::decode(&[0, 0]), Err(DecodeError::UnknownOpcode(0)));
        assert_eq!(Packet::decode(&[0, 7, 0, 1]), Err(DecodeError::UnknownOpcode(7)));
        assert_eq!(
            Packet::decode(&rrq_bytes(&["f", "octet"])[..]).map(|p| p.opcode()),
            Ok(Opcode::Rrq)
        );
        let mut wrq = rrq_bytes(&["f", "octet"]);
        wrq[1] = 2;
        assert_eq!(
            Packet::decode(&wrq),
            Err(DecodeError::Unsupported(Opcode::Wrq))
        );
    }

    #[test]
    fn decodes_ack() {
        assert_eq!(
            Packet::decode(&[0, 4, 0xff, 0xfe]),
            Ok(Packet::Ack { block: 65534 })
        );
        assert_eq!(Packet::decode(&[0, 4, 1]), Err(DecodeError::TooShort(3)));
    }

    #[test]
    fn decodes_client_error_with_and_without_terminator() {
        assert_eq!(
            Packet::decode(b"\x00\x05\x00\x08abort\x00"),
            Ok(Packet::Error {
                code: 8,
                message: "abort".to_string()
            })
        );
        assert_eq!(
            Packet::decode(b"\x00\x05\xff\xffbye"),
            Ok(Packet::Error {
                code: -1,
                message: "bye".to_string()
            })
        );
    }

    #[test]
    fn encodes_data_block() {
        let packet = Packet::Data {
            block: 0x0102,
            payload: Bytes::from_static(b"abc"),
        };
        assert_eq!(&packet.encode()[..], b"\x00\x03\x01\x02abc");
    }

    #[test]
    fn encodes_error_with_terminator() {
        let packet = Packet::error(ErrorCode::FileNotFound, "No such file");
        assert_eq!(&packet.encode()[..], b"\x00\x05\x00\x01No such file\x00");
    }

    #[test]
    fn encodes_oack_in_given_order() {
        let packet = Packet::Oack {
            options: vec![
                ("TSIZE".to_string(), "2048".to_string()),
                ("blksize".to_string(), "1024".to_string()),
            ],
        };
        assert_eq!(
            &packet.encode()[..],
            b"\x00\x06TSIZE\x002048\x00blksize\x001024\x00"
        );
    }

    #[test]
    fn encodes_empty_oack() {
        let packet = Packet::Oack { options: vec![] };
        assert_eq!(&packet.encode()[..], b"\x00\x06");
    }
}
