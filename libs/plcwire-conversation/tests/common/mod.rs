//! Minimal Modbus TCP framing for integration tests
//!
//! MBAP header: transaction id (2) | protocol id (2) | length (2) | unit id (1),
//! followed by the PDU. `length` counts the unit id plus the PDU.

#![allow(dead_code)]

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use plcwire_conversation::Protocol;
use tokio_util::codec::{Decoder, Encoder};

pub const MBAP_HEADER_LEN: usize = 6;
pub const READ_HOLDING_REGISTERS: u8 = 0x03;
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Decoded Modbus TCP application data unit
#[derive(Debug, Clone, PartialEq)]
pub struct Adu {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub pdu: Vec<u8>,
}

impl Adu {
    pub fn read_holding(transaction_id: u16, unit_id: u8, start: u16, count: u16) -> Self {
        let mut pdu = vec![READ_HOLDING_REGISTERS];
        pdu.extend_from_slice(&start.to_be_bytes());
        pdu.extend_from_slice(&count.to_be_bytes());
        Self {
            transaction_id,
            unit_id,
            pdu,
        }
    }

    pub fn holding_response(transaction_id: u16, unit_id: u8, registers: &[u16]) -> Self {
        let mut pdu = vec![READ_HOLDING_REGISTERS, (registers.len() * 2) as u8];
        for value in registers {
            pdu.extend_from_slice(&value.to_be_bytes());
        }
        Self {
            transaction_id,
            unit_id,
            pdu,
        }
    }

    pub fn exception(transaction_id: u16, unit_id: u8, function: u8, code: u8) -> Self {
        Self {
            transaction_id,
            unit_id,
            pdu: vec![function | EXCEPTION_FLAG, code],
        }
    }

    pub fn function_code(&self) -> u8 {
        self.pdu.first().copied().unwrap_or_default()
    }

    /// (start, count) of a read request
    pub fn read_range(&self) -> Option<(u16, u16)> {
        if self.pdu.len() != 5 || self.function_code() != READ_HOLDING_REGISTERS {
            return None;
        }
        Some((
            u16::from_be_bytes([self.pdu[1], self.pdu[2]]),
            u16::from_be_bytes([self.pdu[3], self.pdu[4]]),
        ))
    }
}

/// Register values of a read holding registers response
#[derive(Debug, Clone, PartialEq)]
pub struct HoldingRegisters(pub Vec<u16>);

impl HoldingRegisters {
    pub fn parse(adu: &Adu) -> Result<Self, String> {
        let function = adu.function_code();
        if function & EXCEPTION_FLAG != 0 {
            return Err(format!(
                "exception 0x{:02X} for function 0x{:02X}",
                adu.pdu.get(1).copied().unwrap_or_default(),
                function & !EXCEPTION_FLAG
            ));
        }
        if function != READ_HOLDING_REGISTERS || adu.pdu.len() < 2 {
            return Err(format!("unexpected function 0x{:02X}", function));
        }
        let data = &adu.pdu[2..];
        if data.len() != adu.pdu[1] as usize || data.len() % 2 != 0 {
            return Err("byte count mismatch".to_string());
        }
        Ok(Self(
            data.chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect(),
        ))
    }
}

pub struct ModbusTcp;

impl Protocol for ModbusTcp {
    type Packet = Adu;
    type Key = u16;
    const NAME: &'static str = "modbus-tcp";

    fn correlation_key(packet: &Adu) -> Option<u16> {
        Some(packet.transaction_id)
    }
}

#[derive(Debug, Default)]
pub struct MbapCodec;

impl Decoder for MbapCodec {
    type Item = Adu;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Adu>> {
        if src.len() < MBAP_HEADER_LEN + 1 {
            return Ok(None);
        }
        let protocol_id = u16::from_be_bytes([src[2], src[3]]);
        if protocol_id != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid protocol id {:04X}", protocol_id),
            ));
        }
        let length = u16::from_be_bytes([src[4], src[5]]) as usize;
        if length < 2 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid MBAP length {}", length),
            ));
        }
        if src.len() < MBAP_HEADER_LEN + length {
            src.reserve(MBAP_HEADER_LEN + length - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(MBAP_HEADER_LEN + length);
        let transaction_id = frame.get_u16();
        frame.advance(4);
        let unit_id = frame.get_u8();
        Ok(Some(Adu {
            transaction_id,
            unit_id,
            pdu: frame.to_vec(),
        }))
    }
}

impl Encoder<Adu> for MbapCodec {
    type Error = io::Error;

    fn encode(&mut self, adu: Adu, dst: &mut BytesMut) -> io::Result<()> {
        dst.reserve(MBAP_HEADER_LEN + 1 + adu.pdu.len());
        dst.put_u16(adu.transaction_id);
        dst.put_u16(0);
        dst.put_u16((adu.pdu.len() + 1) as u16);
        dst.put_u8(adu.unit_id);
        dst.extend_from_slice(&adu.pdu);
        Ok(())
    }
}
