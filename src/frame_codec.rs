//! Byte framing of the commands exchanged with the peripherals.
//!
//! Commands and responses share one layout:
//!
//! ```text
//! [START=0xAA][CODE:1][LEN:1][PAYLOAD:LEN][CHECKSUM:1]
//! ```
//!
//! CHECKSUM is the low byte of the sum of every preceding byte. On responses
//! the first payload byte carries the status of the command, the rest is the
//! response data; an empty response payload means success without data.
//!
//! The checksum is additive and cannot detect swapped bytes. It is kept as-is
//! because deployed firmware expects it.

use crate::error::{DecodeError, EncodeError};

pub const FRAME_START: u8 = 0xAA;

/// START + CODE + LEN + CHECKSUM
pub const FRAME_OVERHEAD: usize = 4;

pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandCode {
    GetVersion = 0x01,
    GetStatus = 0x02,
    StartDetect = 0x03,
    StopDetect = 0x04,
    SetSensitivity = 0x05,
    SetMode = 0x06,
    FactoryReset = 0x07,
    GetConfig = 0x08,
    SetConfig = 0x09,
    NegotiateSecurity = 0x10,
    ConfigureWifi = 0x11,
    SetServerAddress = 0x12,
    SetServerPort = 0x13,
}

impl CommandCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for CommandCode {
    type Error = DecodeError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        let command = match code {
            0x01 => CommandCode::GetVersion,
            0x02 => CommandCode::GetStatus,
            0x03 => CommandCode::StartDetect,
            0x04 => CommandCode::StopDetect,
            0x05 => CommandCode::SetSensitivity,
            0x06 => CommandCode::SetMode,
            0x07 => CommandCode::FactoryReset,
            0x08 => CommandCode::GetConfig,
            0x09 => CommandCode::SetConfig,
            0x10 => CommandCode::NegotiateSecurity,
            0x11 => CommandCode::ConfigureWifi,
            0x12 => CommandCode::SetServerAddress,
            0x13 => CommandCode::SetServerPort,
            other => return Err(DecodeError::UnknownCommand(other)),
        };

        Ok(command)
    }
}

/// Status byte reported by the device for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Success,
    InvalidParam,
    NotSupported,
    Busy,
    Error(u8),
}

impl ResponseStatus {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => ResponseStatus::Success,
            0x01 => ResponseStatus::InvalidParam,
            0x02 => ResponseStatus::NotSupported,
            0x03 => ResponseStatus::Busy,
            other => ResponseStatus::Error(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            ResponseStatus::Success => 0x00,
            ResponseStatus::InvalidParam => 0x01,
            ResponseStatus::NotSupported => 0x02,
            ResponseStatus::Busy => 0x03,
            ResponseStatus::Error(code) => code,
        }
    }

    pub fn is_success(self) -> bool {
        self == ResponseStatus::Success
    }
}

/// A command ready to be framed. The payload length is checked on
/// construction so an oversized frame never reaches the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    code: CommandCode,
    payload: Vec<u8>,
}

impl CommandFrame {
    pub fn new(
        code: CommandCode, payload: Vec<u8>,
    ) -> Result<Self, EncodeError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(EncodeError::PayloadTooLong(payload.len()));
        }

        Ok(Self { code, payload })
    }

    pub fn empty(code: CommandCode) -> Self {
        Self { code, payload: Vec::new() }
    }

    pub fn code(&self) -> CommandCode {
        self.code
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub code: CommandCode,
    pub status: ResponseStatus,
    pub payload: Vec<u8>,
}

pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte))
}

pub fn encode(frame: &CommandFrame) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(frame.payload.len() + FRAME_OVERHEAD);
    bytes.push(FRAME_START);
    bytes.push(frame.code.as_u8());
    //length checked in CommandFrame::new
    bytes.push(frame.payload.len() as u8);
    bytes.extend_from_slice(&frame.payload);
    bytes.push(checksum(&bytes));
    bytes
}

/// Validates and decodes a received frame. Never panics on arbitrary input.
pub fn decode(bytes: &[u8]) -> Result<ResponseFrame, DecodeError> {
    if bytes.len() < FRAME_OVERHEAD {
        return Err(DecodeError::Truncated(bytes.len()));
    }

    if bytes[0] != FRAME_START {
        return Err(DecodeError::BadStart(bytes[0]));
    }

    let declared = bytes[2] as usize;
    let actual = bytes.len() - FRAME_OVERHEAD;
    if declared != actual {
        return Err(DecodeError::LengthMismatch { declared, actual });
    }

    let (body, tail) = bytes.split_at(bytes.len() - 1);
    let computed = checksum(body);
    if computed != tail[0] {
        return Err(DecodeError::ChecksumMismatch {
            computed,
            received: tail[0],
        });
    }

    let code = CommandCode::try_from(bytes[1])?;

    let payload = &body[3..];
    let (status, data) = match payload.split_first() {
        Some((status, data)) => (ResponseStatus::from_code(*status), data),
        None => (ResponseStatus::Success, payload),
    };

    Ok(ResponseFrame { code, status, payload: data.to_vec() })
}
