//! Modbus TCP framing: MBAP header + PDU

use std::borrow::Cow;
use std::sync::atomic::{AtomicU16, Ordering};
use tracing::debug;

use super::{pdu, AduHeader, ModbusProtocol};
use crate::constants::{self, MBAP_HEADER_LEN};
use crate::error::{ModbusError, ModbusResult};

/// Bytes before the length field's coverage starts: tx id(2) + protocol id(2) + length(2)
const MBAP_PREFIX_LEN: usize = 6;

#[derive(Debug)]
pub struct TcpProtocol {
    transaction_id: AtomicU16,
    check_transaction_id: bool,
}

impl Default for TcpProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpProtocol {
    pub fn new() -> Self {
        Self {
            transaction_id: AtomicU16::new(1),
            check_transaction_id: true,
        }
    }

    /// Skip the transaction id echo check (gateways that rewrite it)
    pub fn without_transaction_check() -> Self {
        Self {
            check_transaction_id: false,
            ..Self::new()
        }
    }

    fn frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
        let length = (pdu.len() + 1) as u16;

        let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
        frame.extend_from_slice(&transaction_id.to_be_bytes());
        frame.extend_from_slice(&0u16.to_be_bytes());
        frame.extend_from_slice(&length.to_be_bytes());
        frame.push(unit_id);
        frame.extend_from_slice(pdu);

        debug!(
            "TCP frame: tx={:04X}, unit={}, FC={:02X}, {}B",
            transaction_id,
            unit_id,
            pdu.first().copied().unwrap_or(0),
            frame.len()
        );
        frame
    }

    fn following(bytes: &[u8]) -> usize {
        usize::from(u16::from_be_bytes([bytes[4], bytes[5]]))
    }
}

impl ModbusProtocol for TcpProtocol {
    fn name(&self) -> &'static str {
        "TCP"
    }

    fn max_adu_len(&self) -> usize {
        constants::TCP_MAX_ADU_LEN
    }

    fn max_pdu_len(&self) -> usize {
        constants::MAX_PDU_SIZE
    }

    fn frame_request(&self, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
        // Wraps at u16::MAX
        let transaction_id = self.transaction_id.fetch_add(1, Ordering::Relaxed);
        Self::frame(transaction_id, unit_id, pdu)
    }

    fn frame_response(&self, header: AduHeader, pdu: &[u8]) -> Vec<u8> {
        Self::frame(header.transaction_id.unwrap_or(0), header.unit_id, pdu)
    }

    fn parse_frame<'a>(&self, adu: &'a [u8]) -> ModbusResult<(AduHeader, Cow<'a, [u8]>)> {
        if adu.len() < MBAP_HEADER_LEN + 1 {
            return Err(ModbusError::framing(format!(
                "TCP frame too short: {} bytes",
                adu.len()
            )));
        }
        let protocol_id = u16::from_be_bytes([adu[2], adu[3]]);
        if protocol_id != 0 {
            return Err(ModbusError::framing(format!(
                "Protocol identifier does not match: expected 0, got {protocol_id}"
            )));
        }
        if Self::following(adu) != adu.len() - MBAP_PREFIX_LEN {
            return Err(ModbusError::framing(format!(
                "Number of following bytes does not match: declared {}, got {}",
                Self::following(adu),
                adu.len() - MBAP_PREFIX_LEN
            )));
        }
        let header = AduHeader {
            unit_id: adu[6],
            transaction_id: Some(u16::from_be_bytes([adu[0], adu[1]])),
        };
        Ok((header, Cow::Borrowed(&adu[MBAP_HEADER_LEN..])))
    }

    fn check_response_complete(&self, bytes: &[u8]) -> bool {
        bytes.len() >= MBAP_PREFIX_LEN && bytes.len() >= MBAP_PREFIX_LEN + Self::following(bytes)
    }

    fn check_request_complete(&self, bytes: &[u8]) -> bool {
        self.check_response_complete(bytes)
    }

    fn validate_response(&self, request: &[u8], response: &[u8]) -> ModbusResult<()> {
        if request.len() < MBAP_HEADER_LEN + 1 {
            return Err(ModbusError::invalid_argument("Request is not a TCP frame"));
        }
        if response.len() < MBAP_HEADER_LEN + 1 {
            return Err(ModbusError::framing(format!(
                "Response too short: {} bytes",
                response.len()
            )));
        }
        if self.check_transaction_id && response[0..2] != request[0..2] {
            return Err(ModbusError::framing(format!(
                "Transaction identifier does not match: expected {:02X?}, got {:02X?}",
                &request[0..2],
                &response[0..2]
            )));
        }
        if response[2..4] != [0, 0] {
            return Err(ModbusError::framing("Protocol identifier does not match"));
        }
        let following = Self::following(response);
        if following != response.len() - MBAP_PREFIX_LEN {
            return Err(ModbusError::framing(format!(
                "Number of following bytes does not match: declared {following}, got {}",
                response.len() - MBAP_PREFIX_LEN
            )));
        }
        if response[6] != request[6] {
            return Err(ModbusError::framing(format!(
                "Unit identifier does not match: expected {}, got {}",
                request[6], response[6]
            )));
        }

        let pdu = &response[MBAP_HEADER_LEN..];
        pdu::expect_function(request[MBAP_HEADER_LEN], pdu)?;
        pdu::check_response_shape(&request[MBAP_HEADER_LEN..], pdu)
    }
}
