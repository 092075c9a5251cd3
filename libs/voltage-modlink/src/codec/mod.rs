//! Modbus wire codecs
//!
//! The three transports share one application layer (the PDU) and differ
//! only in how they wrap it:
//!
//! ```text
//! RTU    [unit][fc][payload][crc lo][crc hi]
//! ASCII  ':' hex([unit][fc][payload][lrc]) CR LF
//! TCP    [tx id:2][proto 0:2][len:2][unit][fc][payload]
//! ```
//!
//! A [`ModbusProtocol`] implementation supplies the framing half (wrap,
//! unwrap, completeness, response validation). The PDU encoders and
//! decoders in [`pdu`] are shared and reached through the provided
//! `serialize_*` / `deserialize_*` methods.

mod ascii;
pub mod pdu;
mod rtu;
mod tcp;

pub use ascii::AsciiProtocol;
pub use pdu::{DeviceIdentificationResponse, Request, Response};
pub use rtu::RtuProtocol;
pub use tcp::TcpProtocol;

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use crate::constants;
use crate::error::ModbusResult;
use crate::types::{
    Coil, DeviceIdentificationCategory, DeviceIdentificationRaw, DeviceIdentity, DiscreteInput,
    HoldingRegister, InputRegister,
};

/// Addressing fields a reply must echo
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AduHeader {
    pub unit_id: u8,
    /// MBAP transaction id (TCP only)
    pub transaction_id: Option<u16>,
}

impl AduHeader {
    pub fn new(unit_id: u8) -> Self {
        Self {
            unit_id,
            transaction_id: None,
        }
    }
}

/// Wire framing selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Rtu,
    Ascii,
    Tcp,
}

impl ProtocolKind {
    /// Create a shareable codec instance
    pub fn create(self) -> Arc<dyn ModbusProtocol> {
        match self {
            ProtocolKind::Rtu => Arc::new(RtuProtocol::new()),
            ProtocolKind::Ascii => Arc::new(AsciiProtocol::new()),
            ProtocolKind::Tcp => Arc::new(TcpProtocol::new()),
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolKind::Rtu => write!(f, "RTU"),
            ProtocolKind::Ascii => write!(f, "ASCII"),
            ProtocolKind::Tcp => write!(f, "TCP"),
        }
    }
}

impl std::str::FromStr for ProtocolKind {
    type Err = crate::error::ModbusError;

    fn from_str(s: &str) -> ModbusResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rtu" => Ok(ProtocolKind::Rtu),
            "ascii" => Ok(ProtocolKind::Ascii),
            "tcp" => Ok(ProtocolKind::Tcp),
            other => Err(crate::error::ModbusError::config(format!(
                "Unknown protocol: {other}"
            ))),
        }
    }
}

/// Transport-specific Modbus framing
///
/// Implementations are stateless apart from the TCP transaction counter and
/// are shared between a client and any number of callers.
pub trait ModbusProtocol: Send + Sync + fmt::Debug {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Largest ADU this transport carries
    fn max_adu_len(&self) -> usize;

    /// Largest PDU that fits into one ADU
    fn max_pdu_len(&self) -> usize;

    /// Wrap a request PDU for `unit_id`
    fn frame_request(&self, unit_id: u8, pdu: &[u8]) -> Vec<u8>;

    /// Wrap a reply PDU, echoing the request header
    fn frame_response(&self, header: AduHeader, pdu: &[u8]) -> Vec<u8>;

    /// Check transport-level integrity and split the ADU into header and PDU
    fn parse_frame<'a>(&self, adu: &'a [u8]) -> ModbusResult<(AduHeader, Cow<'a, [u8]>)>;

    /// True once `bytes` holds a complete reply; safe to call on any prefix
    fn check_response_complete(&self, bytes: &[u8]) -> bool;

    /// True once `bytes` holds a complete request (responder side)
    fn check_request_complete(&self, bytes: &[u8]) -> bool;

    /// Cross-check a reply against the request that produced it
    fn validate_response(&self, request: &[u8], response: &[u8]) -> ModbusResult<()>;

    // ===== Client side =====

    fn serialize_read_coils(
        &self,
        unit_id: u8,
        start_address: u16,
        count: u16,
    ) -> ModbusResult<Vec<u8>> {
        let pdu = pdu::read_request(constants::FC_READ_COILS, start_address, count)?;
        Ok(self.frame_request(unit_id, &pdu))
    }

    fn deserialize_read_coils(
        &self,
        response: &[u8],
        start_address: u16,
        count: u16,
    ) -> ModbusResult<Vec<Coil>> {
        let (_, pdu) = self.parse_frame(response)?;
        let bits = pdu::decode_bits_response(constants::FC_READ_COILS, &pdu, count)?;
        Ok(pdu::addressed(start_address, bits, Coil::new))
    }

    fn serialize_read_discrete_inputs(
        &self,
        unit_id: u8,
        start_address: u16,
        count: u16,
    ) -> ModbusResult<Vec<u8>> {
        let pdu = pdu::read_request(constants::FC_READ_DISCRETE_INPUTS, start_address, count)?;
        Ok(self.frame_request(unit_id, &pdu))
    }

    fn deserialize_read_discrete_inputs(
        &self,
        response: &[u8],
        start_address: u16,
        count: u16,
    ) -> ModbusResult<Vec<DiscreteInput>> {
        let (_, pdu) = self.parse_frame(response)?;
        let bits = pdu::decode_bits_response(constants::FC_READ_DISCRETE_INPUTS, &pdu, count)?;
        Ok(pdu::addressed(start_address, bits, DiscreteInput::new))
    }

    fn serialize_read_holding_registers(
        &self,
        unit_id: u8,
        start_address: u16,
        count: u16,
    ) -> ModbusResult<Vec<u8>> {
        let pdu = pdu::read_request(constants::FC_READ_HOLDING_REGISTERS, start_address, count)?;
        Ok(self.frame_request(unit_id, &pdu))
    }

    fn deserialize_read_holding_registers(
        &self,
        response: &[u8],
        start_address: u16,
        count: u16,
    ) -> ModbusResult<Vec<HoldingRegister>> {
        let (_, pdu) = self.parse_frame(response)?;
        let values =
            pdu::decode_registers_response(constants::FC_READ_HOLDING_REGISTERS, &pdu, count)?;
        Ok(pdu::addressed(start_address, values, HoldingRegister::new))
    }

    fn serialize_read_input_registers(
        &self,
        unit_id: u8,
        start_address: u16,
        count: u16,
    ) -> ModbusResult<Vec<u8>> {
        let pdu = pdu::read_request(constants::FC_READ_INPUT_REGISTERS, start_address, count)?;
        Ok(self.frame_request(unit_id, &pdu))
    }

    fn deserialize_read_input_registers(
        &self,
        response: &[u8],
        start_address: u16,
        count: u16,
    ) -> ModbusResult<Vec<InputRegister>> {
        let (_, pdu) = self.parse_frame(response)?;
        let values =
            pdu::decode_registers_response(constants::FC_READ_INPUT_REGISTERS, &pdu, count)?;
        Ok(pdu::addressed(start_address, values, InputRegister::new))
    }

    fn serialize_write_single_coil(&self, unit_id: u8, coil: &Coil) -> ModbusResult<Vec<u8>> {
        Ok(self.frame_request(unit_id, &pdu::write_single_coil_request(coil)))
    }

    fn deserialize_write_single_coil(&self, response: &[u8]) -> ModbusResult<Coil> {
        let (_, pdu) = self.parse_frame(response)?;
        pdu::decode_write_single_coil(&pdu)
    }

    fn serialize_write_single_holding_register(
        &self,
        unit_id: u8,
        register: &HoldingRegister,
    ) -> ModbusResult<Vec<u8>> {
        Ok(self.frame_request(unit_id, &pdu::write_single_register_request(register)))
    }

    fn deserialize_write_single_holding_register(
        &self,
        response: &[u8],
    ) -> ModbusResult<HoldingRegister> {
        let (_, pdu) = self.parse_frame(response)?;
        pdu::decode_write_single_register(&pdu)
    }

    fn serialize_write_multiple_coils(&self, unit_id: u8, coils: &[Coil]) -> ModbusResult<Vec<u8>> {
        let pdu = pdu::write_multiple_coils_request(coils)?;
        Ok(self.frame_request(unit_id, &pdu))
    }

    /// Returns the echoed `(start_address, count)`
    fn deserialize_write_multiple_coils(&self, response: &[u8]) -> ModbusResult<(u16, u16)> {
        let (_, pdu) = self.parse_frame(response)?;
        pdu::decode_write_multiple(constants::FC_WRITE_MULTIPLE_COILS, &pdu)
    }

    fn serialize_write_multiple_holding_registers(
        &self,
        unit_id: u8,
        registers: &[HoldingRegister],
    ) -> ModbusResult<Vec<u8>> {
        let pdu = pdu::write_multiple_registers_request(registers)?;
        Ok(self.frame_request(unit_id, &pdu))
    }

    /// Returns the echoed `(start_address, count)`
    fn deserialize_write_multiple_holding_registers(
        &self,
        response: &[u8],
    ) -> ModbusResult<(u16, u16)> {
        let (_, pdu) = self.parse_frame(response)?;
        pdu::decode_write_multiple(constants::FC_WRITE_MULTIPLE_REGISTERS, &pdu)
    }

    fn serialize_read_device_identification(
        &self,
        unit_id: u8,
        category: DeviceIdentificationCategory,
        object_id: u8,
    ) -> ModbusResult<Vec<u8>> {
        let pdu = pdu::device_identification_request(category, object_id);
        Ok(self.frame_request(unit_id, &pdu))
    }

    fn deserialize_read_device_identification(
        &self,
        response: &[u8],
    ) -> ModbusResult<DeviceIdentificationRaw> {
        let (_, pdu) = self.parse_frame(response)?;
        pdu::decode_device_identification(&pdu)
    }

    // ===== Responder side =====

    /// Decode an incoming request ADU
    fn deserialize_request(&self, adu: &[u8]) -> ModbusResult<(AduHeader, Request)> {
        let (header, pdu) = self.parse_frame(adu)?;
        let request = pdu::decode_request(&pdu)?;
        Ok((header, request))
    }

    /// Encode a reply for the request identified by `header`
    fn serialize_response(&self, header: AduHeader, response: &Response) -> Vec<u8> {
        self.frame_response(header, &pdu::encode_response(response))
    }

    /// One Read Device Identification reply fragment sized for this transport
    fn encode_device_identification(
        &self,
        identity: &DeviceIdentity,
        category: DeviceIdentificationCategory,
        first_object_id: u8,
    ) -> Response {
        pdu::encode_device_identification(identity, category, first_object_id, self.max_pdu_len())
    }
}
