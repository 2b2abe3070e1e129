//! P2P message framing
//!
//! Every message is a 24-byte header followed by its payload:
//! magic (4) ‖ command (12, NUL padded) ‖ payload length (u32 LE) ‖ checksum (4),
//! where the checksum is the first four bytes of sha256d(payload).

use crate::constants::*;
use crate::encode::{CodecError, Reader, Writer};
use crate::hashes::checksum;
use std::io::{Read, Write};

/// Decoded message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: [u8; 4],
    pub command: [u8; COMMAND_SIZE],
    pub length: u32,
    pub checksum: [u8; 4],
}

impl MessageHeader {
    pub fn parse(bytes: &[u8; MESSAGE_HEADER_SIZE]) -> Result<Self, CodecError> {
        let mut r = Reader::new(bytes);
        Ok(MessageHeader {
            magic: r.read_array()?,
            command: r.read_array()?,
            length: r.read_u32()?,
            checksum: r.read_array()?,
        })
    }

    pub fn to_bytes(&self) -> [u8; MESSAGE_HEADER_SIZE] {
        let mut out = [0u8; MESSAGE_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.magic);
        out[4..16].copy_from_slice(&self.command);
        out[16..20].copy_from_slice(&self.length.to_le_bytes());
        out[20..24].copy_from_slice(&self.checksum);
        out
    }

    /// Command name with the NUL padding stripped
    pub fn command_name(&self) -> Result<String, CodecError> {
        parse_command(&self.command)
    }
}

/// Command field: printable ASCII followed only by NUL padding
pub fn parse_command(field: &[u8; COMMAND_SIZE]) -> Result<String, CodecError> {
    let end = field.iter().position(|b| *b == 0).unwrap_or(COMMAND_SIZE);
    if end == 0 || field[end..].iter().any(|b| *b != 0) {
        return Err(CodecError::InvalidCommand);
    }
    let name = &field[..end];
    if !name.iter().all(|b| b.is_ascii_graphic()) {
        return Err(CodecError::InvalidCommand);
    }
    Ok(String::from_utf8_lossy(name).into_owned())
}

pub fn encode_command(name: &str) -> Result<[u8; COMMAND_SIZE], CodecError> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > COMMAND_SIZE || !bytes.iter().all(|b| b.is_ascii_graphic()) {
        return Err(CodecError::InvalidCommand);
    }
    let mut field = [0u8; COMMAND_SIZE];
    field[..bytes.len()].copy_from_slice(bytes);
    Ok(field)
}

/// A framed message whose payload has not been interpreted yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub command: String,
    pub payload: Vec<u8>,
}

impl RawMessage {
    pub fn new(command: impl Into<String>, payload: Vec<u8>) -> Self {
        RawMessage { command: command.into(), payload }
    }

    /// Full frame bytes for the network identified by `magic`
    pub fn to_frame(&self, magic: [u8; 4]) -> Result<Vec<u8>, CodecError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(CodecError::PayloadTooLarge(self.payload.len()));
        }
        let header = MessageHeader {
            magic,
            command: encode_command(&self.command)?,
            length: self.payload.len() as u32,
            checksum: checksum(&self.payload),
        };
        let mut w = Writer::with_capacity(MESSAGE_HEADER_SIZE + self.payload.len());
        w.write_bytes(&header.to_bytes());
        w.write_bytes(&self.payload);
        Ok(w.into_inner())
    }
}

/// ReadMessage: read one frame from `reader`
///
/// 1. Read the 24-byte header and check the magic
/// 2. Validate the command field and the payload length limit
/// 3. Read the payload and check its checksum
pub fn read_message<R: Read>(reader: &mut R, magic: [u8; 4]) -> Result<RawMessage, CodecError> {
    // 1. Header
    let mut head = [0u8; MESSAGE_HEADER_SIZE];
    reader.read_exact(&mut head)?;
    let header = MessageHeader::parse(&head)?;
    if header.magic != magic {
        return Err(CodecError::BadMagic { expected: magic, actual: header.magic });
    }

    // 2. Command and length
    let command = header.command_name()?;
    let length = header.length as usize;
    if length > MAX_PAYLOAD_SIZE {
        return Err(CodecError::PayloadTooLarge(length));
    }

    // 3. Payload
    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload)?;
    if checksum(&payload) != header.checksum {
        return Err(CodecError::ChecksumMismatch { command });
    }
    Ok(RawMessage { command, payload })
}

/// Frame and write one message, flushing the writer
pub fn write_message<W: Write>(writer: &mut W, magic: [u8; 4], message: &RawMessage) -> Result<(), CodecError> {
    let frame = message.to_frame(magic)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}
