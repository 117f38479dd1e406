use log::debug;
use thiserror::Error;

const FEND: u8 = 0xC0;
const FESC: u8 = 0xDB;
const TFEND: u8 = 0xDC;
const TFESC: u8 = 0xDD;

// A type byte of 0xFF is a whole-byte RETURN marker, not port 15 + command 15.
const RETURN_TYPE: u8 = 0xFF;

/// Command carried in the low nibble of the KISS type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KissCommand {
    DataFrame,
    TxDelay,
    Persistence,
    SlotTime,
    TxTail,
    FullDuplex,
    SetHardware,
    Return,
}

impl KissCommand {
    pub fn from_proto(value: u8) -> Result<Self, KissError> {
        Ok(match value {
            0 => KissCommand::DataFrame,
            1 => KissCommand::TxDelay,
            2 => KissCommand::Persistence,
            3 => KissCommand::SlotTime,
            4 => KissCommand::TxTail,
            5 => KissCommand::FullDuplex,
            6 => KissCommand::SetHardware,
            0xFF => KissCommand::Return,
            _ => return Err(KissError::UnsupportedCommand(value)),
        })
    }

    pub fn proto_value(&self) -> u8 {
        match self {
            KissCommand::DataFrame => 0,
            KissCommand::TxDelay => 1,
            KissCommand::Persistence => 2,
            KissCommand::SlotTime => 3,
            KissCommand::TxTail => 4,
            KissCommand::FullDuplex => 5,
            KissCommand::SetHardware => 6,
            KissCommand::Return => 0xFF,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KissError {
    #[error("KISS port must be between 0 and 15 inclusive: {0}")]
    InvalidPort(u8),
    #[error("unsupported KISS command code: {0:#04x}")]
    UnsupportedCommand(u8),
}

/// A single KISS frame: opaque data tagged with a command and a TNC port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KissFrame {
    pub data: Vec<u8>,
    pub command: KissCommand,
    pub port: u8,
}

impl KissFrame {
    pub fn new(data: Vec<u8>, command: KissCommand, port: u8) -> Result<Self, KissError> {
        if port > 15 {
            return Err(KissError::InvalidPort(port));
        }
        Ok(Self {
            data,
            command,
            port,
        })
    }

    /// Serialise as `FEND | type | data | FEND` with FEND/FESC stuffing applied
    /// to the type byte and the data.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + 4);
        out.push(FEND);
        push_escaped(&mut out, self.command.proto_value() | (self.port << 4));
        for &byte in &self.data {
            push_escaped(&mut out, byte);
        }
        out.push(FEND);
        out
    }

    /// Decode every frame in `bytes`, splitting on unescaped FENDs and skipping
    /// empty runs between them.
    pub fn decode(bytes: &[u8]) -> Result<Vec<KissFrame>, KissError> {
        let mut frames = Vec::new();
        for segment in bytes.split(|b| *b == FEND) {
            if let Some(frame) = frame_from_segment(segment)? {
                frames.push(frame);
            }
        }
        Ok(frames)
    }
}

fn push_escaped(out: &mut Vec<u8>, byte: u8) {
    match byte {
        FEND => out.extend_from_slice(&[FESC, TFEND]),
        FESC => out.extend_from_slice(&[FESC, TFESC]),
        _ => out.push(byte),
    }
}

fn unescape(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len());
    let mut iter = src.iter();
    while let Some(&byte) = iter.next() {
        if byte == FESC {
            match iter.next() {
                Some(&TFEND) => out.push(FEND),
                Some(&TFESC) => out.push(FESC),
                // Not a real escape; keep the following byte as-is.
                Some(&other) => out.push(other),
                // Dangling FESC at the end of the segment.
                None => break,
            }
        } else {
            out.push(byte);
        }
    }
    out
}

/// Parse the raw (still escaped) bytes between two FENDs. Returns Ok(None) for
/// segments that unescape to nothing.
fn frame_from_segment(segment: &[u8]) -> Result<Option<KissFrame>, KissError> {
    if segment.is_empty() {
        return Ok(None);
    }
    let unescaped = unescape(segment);
    let Some((&type_byte, data)) = unescaped.split_first() else {
        return Ok(None);
    };
    if type_byte == RETURN_TYPE {
        // RETURN carries no data and no meaningful port.
        return Ok(Some(KissFrame {
            data: Vec::new(),
            command: KissCommand::Return,
            port: 0,
        }));
    }
    Ok(Some(KissFrame {
        data: data.to_vec(),
        command: KissCommand::from_proto(type_byte & 0x0F)?,
        port: type_byte >> 4,
    }))
}

/// Reassembles KISS frames from a transport that delivers arbitrary chunks.
///
/// Feed bytes in with `extend`, then drain complete frames with `next_frame`.
/// Malformed frames are logged and skipped rather than surfaced; the stream
/// keeps going.
#[derive(Default)]
pub struct KissBuffer {
    buffer: Vec<u8>,
}

impl KissBuffer {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn next_frame(&mut self) -> Option<KissFrame> {
        loop {
            let start = match self.buffer.iter().position(|b| *b == FEND) {
                Some(start) => start,
                None => {
                    // Nothing but noise; no frame can begin without a FEND.
                    self.buffer.clear();
                    return None;
                }
            };
            if start > 0 {
                self.buffer.drain(0..start);
            }
            let end = self.buffer[1..].iter().position(|b| *b == FEND)? + 1;
            let segment: Vec<u8> = self.buffer[1..end].to_vec();
            // Leave the trailing FEND in place as the next start marker.
            self.buffer.drain(0..end);
            match frame_from_segment(&segment) {
                Ok(Some(frame)) => return Some(frame),
                Ok(None) => continue,
                Err(e) => {
                    debug!("skipping malformed KISS frame ({}): {:02x?}", e, segment);
                    continue;
                }
            }
        }
    }
}
