use bytes::{Buf, BufMut, BytesMut};
use nom::number::complete::{be_u16, be_u8};
use nom::sequence::tuple;
use nom::IResult;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::LinkError;

const HEADER_LEN: usize = 7;
const PROTOCOL_ID: u16 = 0;
const EXCEPTION_BIT: u8 = 0x80;

/// Registers per read allowed by the protocol.
pub const MAX_READ_REGISTERS: u16 = 125;

#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum FunctionCode {
    ReadHoldingRegisters = 0x03,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetFailedToRespond = 0x0B,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadRequest {
    pub transaction: u16,
    pub unit_id: u8,
    pub address: u16,
    pub count: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Registers {
        transaction: u16,
        unit_id: u8,
        words: Vec<u16>,
    },
    Exception {
        transaction: u16,
        unit_id: u8,
        function: u8,
        code: u8,
    },
}

impl Response {
    pub fn transaction(&self) -> u16 {
        match self {
            Response::Registers { transaction, .. } | Response::Exception { transaction, .. } => {
                *transaction
            }
        }
    }

    pub fn unit_id(&self) -> u8 {
        match self {
            Response::Registers { unit_id, .. } | Response::Exception { unit_id, .. } => *unit_id,
        }
    }
}

/// transaction id, protocol id, length, unit id
fn mbap_header(input: &[u8]) -> IResult<&[u8], (u16, u16, u16, u8)> {
    tuple((be_u16, be_u16, be_u16, be_u8))(input)
}

/// Modbus/TCP framing: encodes read requests, decodes replies.
#[derive(Debug, Default)]
pub struct MbapCodec;

impl MbapCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Encoder<ReadRequest> for MbapCodec {
    type Error = LinkError;

    fn encode(&mut self, request: ReadRequest, dst: &mut BytesMut) -> Result<(), LinkError> {
        if request.count == 0 || request.count > MAX_READ_REGISTERS {
            return Err(LinkError::Protocol(format!(
                "cannot read {} registers in one request",
                request.count
            )));
        }

        dst.reserve(12);
        dst.put_u16(request.transaction);
        dst.put_u16(PROTOCOL_ID);
        dst.put_u16(6); // unit id + pdu
        dst.put_u8(request.unit_id);
        dst.put_u8(FunctionCode::ReadHoldingRegisters.into());
        dst.put_u16(request.address);
        dst.put_u16(request.count);
        Ok(())
    }
}

impl Decoder for MbapCodec {
    type Item = Response;
    type Error = LinkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Response>, LinkError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let (transaction, protocol, length, unit_id) = match mbap_header(&src[..HEADER_LEN]) {
            Ok((_, header)) => header,
            Err(e) => return Err(LinkError::Protocol(format!("bad MBAP header: {}", e))),
        };

        if protocol != PROTOCOL_ID {
            return Err(LinkError::Protocol(format!("unexpected protocol id {}", protocol)));
        }
        // length covers unit id + pdu; a pdu is at least 2 bytes and at most 253
        if !(3..=254).contains(&length) {
            return Err(LinkError::Protocol(format!("bad MBAP length {}", length)));
        }

        let frame_len = 6 + length as usize;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(frame_len);
        frame.advance(HEADER_LEN);
        let function = frame.get_u8();

        if function & EXCEPTION_BIT != 0 {
            return Ok(Some(Response::Exception {
                transaction,
                unit_id,
                function: function & !EXCEPTION_BIT,
                code: frame.get_u8(),
            }));
        }

        if FunctionCode::try_from(function).is_err() {
            return Err(LinkError::Protocol(format!("unexpected function 0x{:02x}", function)));
        }

        let byte_count = frame.get_u8() as usize;
        if byte_count != frame.len() || byte_count % 2 != 0 {
            return Err(LinkError::Protocol(format!(
                "byte count {} does not match payload of {} bytes",
                byte_count,
                frame.len()
            )));
        }

        let words = frame
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();

        Ok(Some(Response::Registers {
            transaction,
            unit_id,
            words,
        }))
    }
}

impl std::fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Human name for an exception code, for log lines.
pub fn exception_name(code: u8) -> String {
    ExceptionCode::try_from(code)
        .map(|c| c.to_string())
        .unwrap_or_else(|_| format!("0x{:02x}", code))
}
